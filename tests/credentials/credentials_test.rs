//! Coverage for credential loading and env layering.

use std::fs;
use std::path::PathBuf;

use numgate::config::GatewayConfig;
use numgate::credentials::{load_credentials, load_optional_credentials};

fn temp_env_path() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("numgate_test_{}", uuid::Uuid::new_v4()));
    let create = fs::create_dir_all(&dir);
    assert!(create.is_ok());
    dir.join(".env")
}

fn write_private(path: &PathBuf, contents: &str) {
    let write = fs::write(path, contents);
    assert!(write.is_ok());
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = fs::set_permissions(path, fs::Permissions::from_mode(0o600));
        assert!(perms.is_ok());
    }
}

#[test]
fn loads_env_credentials() {
    let env_path = temp_env_path();
    write_private(
        &env_path,
        "NUMGATE_TWILIO_ACCOUNT_SID=AC123\nNUMGATE_TWILIO_AUTH_TOKEN=abc123\n",
    );

    let credentials = match load_credentials(&env_path) {
        Ok(credentials) => credentials,
        Err(err) => panic!("credentials should load: {err}"),
    };

    assert_eq!(credentials.get("NUMGATE_TWILIO_ACCOUNT_SID"), Some("AC123"));
    assert_eq!(credentials.get("NUMGATE_TWILIO_AUTH_TOKEN"), Some("abc123"));
}

#[cfg(unix)]
#[test]
fn rejects_world_readable_env_file() {
    use std::os::unix::fs::PermissionsExt;

    let env_path = temp_env_path();
    write_private(&env_path, "NUMGATE_TWILIO_AUTH_TOKEN=abc123\n");
    let perms = fs::set_permissions(&env_path, fs::Permissions::from_mode(0o644));
    assert!(perms.is_ok());

    assert!(load_credentials(&env_path).is_err());
    assert!(load_optional_credentials(&env_path).is_err());
}

#[test]
fn missing_required_file_is_an_error() {
    let env_path = temp_env_path();
    assert!(load_credentials(&env_path).is_err());
}

#[test]
fn file_values_feed_config_overrides() {
    let env_path = temp_env_path();
    write_private(
        &env_path,
        "NUMGATE_TEST_ONLY_TWILIO_SID=AC999\nNUMGATE_TWILIO_ACCOUNT_SID=AC555\n\
         NUMGATE_TWILIO_AUTH_TOKEN=secret\n",
    );
    let credentials = match load_optional_credentials(&env_path) {
        Ok(credentials) => credentials,
        Err(err) => panic!("credentials should load: {err}"),
    };
    assert_eq!(
        credentials.resolve("NUMGATE_TEST_ONLY_TWILIO_SID").as_deref(),
        Some("AC999")
    );

    let mut config = GatewayConfig::default();
    config.apply_overrides(|key| credentials.get(key).map(str::to_owned));
    let twilio = config.provider.twilio.expect("twilio configured from file");
    assert_eq!(twilio.account_sid, "AC555");
    assert!(twilio.has_credentials());
}

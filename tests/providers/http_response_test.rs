//! Carrier error bodies as they come back through `check_http_response`.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use numgate::providers::{check_http_response, sanitize_http_error_body, ProviderError};

/// Twilio's REST error envelope.
fn twilio_error(code: u32, message: &str) -> String {
    serde_json::json!({
        "code": code,
        "message": message,
        "more_info": format!("https://www.twilio.com/docs/errors/{code}"),
        "status": 400,
    })
    .to_string()
}

/// Answer the next connection with `status` and a JSON `body`.
async fn carrier_replies(status: u16, body: String) -> reqwest::Response {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        if let Ok((mut socket, _)) = listener.accept().await {
            let mut request = [0_u8; 2048];
            let _ = socket.read(&mut request).await;
            let reply = format!(
                "HTTP/1.1 {status} Carrier\r\nContent-Type: application/json\r\n\
                 Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = socket.write_all(reply.as_bytes()).await;
        }
    });
    reqwest::get(format!("http://{addr}/Messages.json"))
        .await
        .expect("request completes")
}

async fn rejected(status: u16, body: String) -> (u16, String) {
    let response = carrier_replies(status, body).await;
    match check_http_response(response).await {
        Err(ProviderError::HttpStatus { status, body }) => (status, body),
        Ok(body) => panic!("non-success status accepted with body {body}"),
        Err(other) => panic!("expected http status error, got: {other}"),
    }
}

#[tokio::test]
async fn twilio_error_keeps_code_and_docs_link() {
    let (status, body) = rejected(400, twilio_error(21211, "Invalid 'To' Phone Number")).await;
    assert_eq!(status, 400);
    assert!(body.contains("21211"));
    assert!(body.contains("more_info"));
}

#[tokio::test]
async fn account_sid_in_error_is_redacted() {
    let sid = "AC0123456789abcdef0123456789abcdef";
    let (status, body) = rejected(
        404,
        twilio_error(20404, &format!("The requested resource /Accounts/{sid} was not found")),
    )
    .await;
    assert_eq!(status, 404);
    assert!(!body.contains(sid));
    assert!(body.contains("[REDACTED]"));
}

#[tokio::test]
async fn unauthorized_reply_hides_echoed_credentials() {
    let (status, body) = rejected(
        401,
        twilio_error(20003, "Authenticate: Basic QUMxMjM0NTY3ODk6c2VjcmV0dG9rZW4= rejected"),
    )
    .await;
    assert_eq!(status, 401);
    assert!(!body.contains("QUMxMjM0NTY3ODk6c2VjcmV0dG9rZW4="));
}

#[tokio::test]
async fn accepted_message_body_passes_through() {
    let response = carrier_replies(201, r#"{"sid":"SM1","status":"queued"}"#.to_owned()).await;
    let body = check_http_response(response).await.expect("2xx is success");
    assert_eq!(body, r#"{"sid":"SM1","status":"queued"}"#);
}

#[test]
fn multiline_html_outage_page_is_flattened_and_capped() {
    let page = format!(
        "<html>\n  <body>\n    <h1>503 Service Unavailable</h1>\n{}\n  </body>\n</html>",
        "<p>retry later</p>\n".repeat(40)
    );
    let cleaned = sanitize_http_error_body(&page);
    assert!(!cleaned.contains('\n'));
    assert!(cleaned.starts_with("<html> <body> <h1>503"));
    assert!(cleaned.ends_with("...[truncated]"));
}

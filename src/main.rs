#![allow(missing_docs)]

//! numgate: number pool and compliant messaging gateway.
//!
//! One binary: `start` runs the long-lived components with the pool sweeper,
//! the remaining subcommands are one-shot operator tools against the same
//! database and carrier configuration.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use sqlx::SqlitePool;
use tracing::{error, info, warn};

use numgate::audit::AuditLedger;
use numgate::config::GatewayConfig;
use numgate::credentials::load_optional_credentials;
use numgate::db::open_pool;
use numgate::inbound::processor::InboundComplianceProcessor;
use numgate::logging;
use numgate::messaging::dispatcher::MessageDispatcher;
use numgate::messaging::mailer::build_mailer;
use numgate::messaging::SendRequest;
use numgate::numbers::policy::policy;
use numgate::numbers::pool::NumberPoolManager;
use numgate::providers::gateway::ProviderGateway;
use numgate::providers::{Capability, SearchFilter};

#[derive(Parser)]
#[command(name = "numgate", version, about = "Number pool and compliant messaging gateway")]
struct Cli {
    /// Private env file layered under the process environment.
    #[arg(long, default_value = ".env", global = true)]
    env_file: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Open the database and apply the schema.
    Migrate,
    /// Run the gateway components and pool sweeper until Ctrl-C.
    Start,
    /// Run one pool hygiene pass.
    Sweep,
    /// Search upstream inventory.
    Search {
        #[arg(long)]
        area_code: Option<String>,
        #[arg(long, default_value = "US")]
        country: String,
        #[arg(long = "capability")]
        capabilities: Vec<String>,
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Send a message through the safe-send path.
    Send {
        #[arg(long)]
        to: String,
        #[arg(long)]
        text: String,
        #[arg(long)]
        client_ref: Option<String>,
        #[arg(long)]
        from: Option<String>,
        #[arg(long = "media-url")]
        media_urls: Vec<String>,
    },
    /// Release a user's number back to the pool.
    Release {
        #[arg(long)]
        user_id: i64,
        /// Cooling-off days; defaults to the plan's hold.
        #[arg(long)]
        hold_days: Option<u32>,
        /// Plan used to pick the default hold.
        #[arg(long)]
        plan: Option<String>,
    },
}

/// Long-lived components shared by `start` and the one-shot commands.
struct Components {
    db: SqlitePool,
    pool: NumberPoolManager,
    dispatcher: Arc<MessageDispatcher>,
    processor: Arc<InboundComplianceProcessor>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let credentials = load_optional_credentials(Path::new(&cli.env_file))?;
    let config = GatewayConfig::load_with(|key| credentials.resolve(key))
        .context("failed to load configuration")?;

    match cli.command {
        Command::Start => {
            let _guard = logging::init_production(&config.logging.logs_dir)?;
            run_start(&config).await
        }
        other => {
            logging::init_cli();
            run_one_shot(other, &config).await
        }
    }
}

async fn build(config: &GatewayConfig) -> Result<Components> {
    let db = open_pool(&config.database.path).await?;
    let gateway = Arc::new(ProviderGateway::from_config(&config.provider));
    if !gateway.is_configured() {
        warn!("no carrier configured, purchases and sends will fail");
    }
    let audit = AuditLedger::new(db.clone());
    let dispatcher = Arc::new(MessageDispatcher::new(
        db.clone(),
        Arc::clone(&gateway),
        audit.clone(),
        config.dispatch.clone(),
    ));
    let mailer = build_mailer(config.email.as_ref()).context("invalid [email] configuration")?;
    let processor = Arc::new(InboundComplianceProcessor::new(
        db.clone(),
        Arc::clone(&dispatcher),
        mailer,
        audit,
        config.inbound.clone(),
    ));
    let pool = NumberPoolManager::new(db.clone(), gateway, config.pool.clone());
    Ok(Components {
        db,
        pool,
        dispatcher,
        processor,
    })
}

async fn run_start(config: &GatewayConfig) -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "numgate starting");
    let components = build(config).await?;
    let schedule = cron::Schedule::from_str(&config.pool.sweep_cron)
        .with_context(|| format!("invalid pool.sweep_cron {:?}", config.pool.sweep_cron))?;
    let recycle_policy = policy(&config.pool.default_plan, &config.pool);
    info!(cron = %config.pool.sweep_cron, "pool sweeper scheduled");

    loop {
        let Some(next) = schedule.upcoming(Utc).next() else {
            warn!("sweep schedule has no future runs, sweeper stopped");
            break;
        };
        let wait = next
            .signed_duration_since(Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);

        tokio::select! {
            () = tokio::time::sleep(wait) => {
                let now = Utc::now();
                match components.pool.sweep(now).await {
                    Ok(report) => info!(
                        holds_returned = report.holds_returned,
                        reservations_lapsed = report.reservations_lapsed,
                        reservations_purged = report.reservations_purged,
                        "pool sweep"
                    ),
                    Err(e) => error!(error = %e, "pool sweep failed"),
                }
                if let Err(e) = components.pool.recycle_inactive(&recycle_policy, now).await {
                    error!(error = %e, "inactivity recycling failed");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal");
                break;
            }
        }
    }

    info!("waiting for in-flight forwarding");
    components.processor.drain_forwarding().await;
    components.db.close().await;
    info!("numgate stopped");
    Ok(())
}

async fn run_one_shot(command: Command, config: &GatewayConfig) -> Result<()> {
    let components = build(config).await?;
    match command {
        Command::Migrate => {
            println!("schema applied to {}", config.database.path.display());
        }
        Command::Sweep => {
            let report = components.pool.sweep(Utc::now()).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Search {
            area_code,
            country,
            capabilities,
            limit,
        } => {
            let capabilities = capabilities
                .iter()
                .map(|c| {
                    Capability::parse(c).ok_or_else(|| anyhow::anyhow!("unknown capability {c:?}"))
                })
                .collect::<Result<Vec<_>>>()?;
            let filter = SearchFilter {
                area_code,
                iso_country: country.to_ascii_uppercase(),
                capabilities: if capabilities.is_empty() {
                    SearchFilter::default().capabilities
                } else {
                    capabilities
                },
                limit,
                ..SearchFilter::default()
            };
            let results = components.pool.search(&filter).await?;
            println!("{}", serde_json::to_string_pretty(&results)?);
        }
        Command::Send {
            to,
            text,
            client_ref,
            from,
            media_urls,
        } => {
            let request = SendRequest {
                to,
                text,
                client_ref,
                from,
                media_urls,
            };
            let outcome = components.dispatcher.send(&request).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Command::Release {
            user_id,
            hold_days,
            plan,
        } => {
            let plan = plan.unwrap_or_else(|| config.pool.default_plan.clone());
            let hold_days = hold_days.unwrap_or(policy(&plan, &config.pool).hold_days);
            let outcome = components.pool.release(user_id, Some(hold_days)).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Command::Start => return run_start(config).await,
    }
    components.db.close().await;
    Ok(())
}

//! `courierd`: retry engine daemon.
//!
//! Usage:
//! - `courierd` runs the scan/sweep loops and the uplink subscriber until
//!   ctrl-c.
//! - `courierd once` runs one scan and one sweep, prints both reports as JSON
//!   and exits.
//! - `courierd history <message-id>` prints a delivery's ledger row and
//!   attempts as JSON.

use anyhow::{Context, bail};

use courier_core::MessageId;
use courier_infra::RetryConfig;
use courier_server::ServerConfig;
use courier_server::app::{Courier, Services};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    courier_observability::init();

    let server = ServerConfig::from_env().context("invalid server configuration")?;
    let retry = RetryConfig::from_env().context("invalid retry configuration")?;
    let args: Vec<String> = std::env::args().skip(1).collect();

    let services = Services::connect(&server, retry).await?;

    match args.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        [] => run(&server, services).await,
        ["once"] => {
            let (scan, sweep) = services.manager.process_pending().await;
            println!(
                "{}",
                serde_json::json!({ "scan": scan, "sweep": sweep })
            );
            Ok(())
        }
        ["history", id] => {
            let id = MessageId::parse(*id).context("invalid message id")?;
            match services.manager.attempt_history(&id).await? {
                Some(history) => println!("{}", serde_json::to_string_pretty(&history)?),
                None => bail!("no delivery with message id {id}"),
            }
            Ok(())
        }
        other => bail!("unknown arguments: {other:?} (expected no arguments, `once`, or `history <message-id>`)"),
    }
}

async fn run(server: &ServerConfig, services: Services) -> anyhow::Result<()> {
    let courier = Courier::start(server, services)?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown signal received");

    courier.shutdown().await;
    Ok(())
}

//! Rusty-Bridge: host shell for the webview-to-wallet JSON-RPC bridge.
//!
//! Reads one JSON host command per line on stdin and writes one JSON host
//! event per line on stdout. Logs go to stderr.

use std::time::Duration;

use eyre::WrapErr;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use rusty_bridge_adapters::BridgeConfig;

mod host;

use host::{Host, HostEvent};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = BridgeConfig::from_env();
    tracing::info!(
        chain_id = %config.chain_id,
        rpc = config.rpc_url.as_deref().unwrap_or("deterministic"),
        "Starting Rusty-Bridge"
    );

    let (events, mut outbox) = mpsc::unbounded_channel::<HostEvent>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(event) = outbox.recv().await {
            let mut line = match serde_json::to_string(&event) {
                Ok(line) => line,
                Err(error) => {
                    tracing::warn!(%error, "host event not serializable");
                    continue;
                }
            };
            line.push('\n');
            stdout.write_all(line.as_bytes()).await?;
            stdout.flush().await?;
        }
        Ok::<(), std::io::Error>(())
    });

    let host = Host::start(&config, events).wrap_err("failed to start bridge")?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stopped = false;
    while let Some(line) = lines.next_line().await.wrap_err("failed to read stdin")? {
        if !host.handle_line(&line) {
            stopped = true;
            break;
        }
    }
    if !stopped {
        host.shutdown().wrap_err("failed to shut down bridge")?;
    }
    drop(host);

    // Session tasks release their senders as they wind down.
    match tokio::time::timeout(Duration::from_secs(2), writer).await {
        Ok(joined) => joined
            .wrap_err("stdout writer panicked")?
            .wrap_err("failed to write stdout")?,
        Err(_) => tracing::warn!("stdout writer did not drain in time"),
    }
    Ok(())
}

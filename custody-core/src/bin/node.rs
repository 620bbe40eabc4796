//! Custody node binary
//!
//! Opens the ledger, logs every committed record, and sweeps for abusive
//! storage on an interval until interrupted.

use anyhow::Context;
use custody_core::sweeper::spawn_sweeper;
use custody_core::{Config, CustodyLedger};
use std::sync::Arc;
use tokio_stream::StreamExt;

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let json = std::env::var("CUSTODY_LOG_JSON")
        .map(|v| v == "1")
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn load_config() -> anyhow::Result<Config> {
    match std::env::var("CUSTODY_CONFIG") {
        Ok(path) => {
            let mut config = Config::from_file(&path)
                .with_context(|| format!("loading config from {}", path))?;
            config.apply_env()?;
            Ok(config)
        }
        Err(_) => Ok(Config::from_env()?),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = load_config()?;
    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        data_dir = ?config.data_dir,
        "Starting custody node"
    );

    let ledger = Arc::new(
        CustodyLedger::open(config.clone())
            .await
            .context("opening custody ledger")?,
    );
    let verified = ledger.verify_journal().context("verifying journal")?;
    tracing::info!(records = verified, "Journal verified");

    // Event log
    let mut records = ledger.subscribe();
    let logger = tokio::spawn(async move {
        while let Some(item) = records.next().await {
            match item {
                Ok(record) => match serde_json::to_string(&record.event) {
                    Ok(payload) => tracing::info!(
                        sequence = record.sequence,
                        event = record.event.name(),
                        hash = %hex::encode(record.hash),
                        %payload,
                        "Event committed"
                    ),
                    Err(e) => tracing::warn!(error = %e, "Failed to encode event"),
                },
                Err(e) => tracing::warn!(error = %e, "Event subscriber lagged"),
            }
        }
    });

    // Periodic sweep
    let sweeper = if config.scan.enabled {
        let operator = config
            .scan
            .operator
            .or(config.genesis_admin)
            .or_else(|| ledger.list_admins().first().copied());

        operator.map(|operator| {
            let period = std::time::Duration::from_secs(config.scan.interval_secs.max(1));
            spawn_sweeper(Arc::clone(&ledger), operator, period)
        })
    } else {
        None
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down custody node");

    if let Some(sweeper) = sweeper {
        sweeper.abort();
        let _ = sweeper.await;
    }

    // The logger ends once the actor drops its event sender
    match Arc::try_unwrap(ledger) {
        Ok(ledger) => ledger.shutdown().await?,
        Err(_) => {
            tracing::warn!("Ledger still shared at shutdown");
            logger.abort();
        }
    }
    let _ = logger.await;

    Ok(())
}

//! Periodic storage sweep
//!
//! Runs `ScanForAbusiveStorage` on a fixed interval. A failed sweep is logged
//! and tried again on the next tick; the loop only ends once the custody actor
//! has stopped accepting commands.

use crate::ledger::CustodyLedger;
use crate::types::Address;
use crate::violations::ScanReport;
use crate::{Error, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Call `sweep` every `period` until the actor is gone
pub async fn run_sweeper<F, Fut>(period: Duration, mut sweep: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<ScanReport>>,
{
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut failures = 0u64;

    loop {
        ticker.tick().await;
        match sweep().await {
            Ok(report) => {
                if failures > 0 {
                    tracing::info!(failures, "Storage sweep recovered");
                    failures = 0;
                }
                tracing::info!(
                    expired = report.expired.len(),
                    opened = report.opened.len(),
                    nearing = report.nearing.len(),
                    "Storage sweep"
                );
            }
            Err(Error::Concurrency(reason)) => {
                tracing::warn!(reason = %reason, "Custody actor gone, stopping storage sweep");
                break;
            }
            Err(e) => {
                failures += 1;
                tracing::error!(
                    error = %e,
                    consecutive_failures = failures,
                    "Storage sweep failed"
                );
            }
        }
    }
}

/// Sweep `ledger` as `operator` every `period`
pub fn spawn_sweeper(
    ledger: Arc<CustodyLedger>,
    operator: Address,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        run_sweeper(period, || {
            let ledger = Arc::clone(&ledger);
            async move { ledger.scan_for_abusive_storage(operator).await }
        })
        .await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::types::BatchId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const ADMIN: Address = Address::from_low_u64(1);
    const PRODUCER: Address = Address::from_low_u64(2);

    #[tokio::test]
    async fn test_sweeper_keeps_ticking_after_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let finished = tokio::time::timeout(
            Duration::from_secs(5),
            run_sweeper(Duration::from_millis(1), move || {
                let call = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    match call {
                        0 | 1 => Err(Error::Storage("disk unavailable".to_string())),
                        2 => Ok(ScanReport::default()),
                        3 => Err(Error::InvariantViolation("scan returned Produced".to_string())),
                        4 => Ok(ScanReport {
                            expired: vec![BatchId(1)],
                            ..ScanReport::default()
                        }),
                        _ => Err(Error::Concurrency("Actor mailbox closed".to_string())),
                    }
                }
            }),
        )
        .await;

        assert!(finished.is_ok(), "sweeper did not stop on a closed mailbox");
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_spawned_sweeper_scans_ledger() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = Config {
            data_dir: temp_dir.path().to_path_buf(),
            genesis_admin: Some(ADMIN),
            ..Config::default()
        };
        let ledger = Arc::new(CustodyLedger::open(config).await.unwrap());
        ledger.set_producer(ADMIN, PRODUCER).await.unwrap();
        ledger.produce(PRODUCER, 10).await.unwrap();

        let before = ledger.snapshot();
        let sweeper = spawn_sweeper(Arc::clone(&ledger), ADMIN, Duration::from_millis(5));

        // A sweep commits even when it finds nothing, publishing a new snapshot
        let swept = tokio::time::timeout(Duration::from_secs(5), async {
            while Arc::ptr_eq(&before, &ledger.snapshot()) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;

        sweeper.abort();
        let _ = sweeper.await;
        assert!(swept.is_ok());
        assert_eq!(ledger.snapshot().state, before.state);
    }
}

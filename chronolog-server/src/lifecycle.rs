//! Background maintenance: TTL sweep and periodic flush.
//!
//! ```text
//!   tick ──► for each open Store:  sweep_expired() ──► flush()
//!    │                                                  (only when persisting)
//!    └── interval = --storage-interval, or 60s sweep-only
//!
//!   shutdown ──► final flush (when persisting) ──► close every Store
//! ```
//!
//! Store work is synchronous and touches the filesystem, so each pass runs on
//! the blocking pool. A pass that has started always completes; the stop
//! signal is only observed between ticks.

use std::sync::Arc;
use std::time::Duration;

use chronolog_store::CollectionRouter;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Tick period when nothing is flushed.
pub const SWEEP_ONLY_INTERVAL: Duration = Duration::from_secs(60);

/// Totals from one maintenance pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub stores: usize,
    pub expired_users: usize,
    pub flushed_records: usize,
    pub failed_files: usize,
}

/// Sweep, then optionally flush, every open store once.
pub fn maintenance_pass(router: &CollectionRouter, persist: bool) -> PassReport {
    let mut report = PassReport::default();
    for store in router.stores() {
        if store.is_closed() {
            continue;
        }
        report.stores += 1;
        report.expired_users += store.sweep_expired();
        if persist {
            let flushed = store.flush();
            report.flushed_records += flushed.records;
            report.failed_files += flushed.files_failed;
        }
    }
    report
}

/// Final flush and close. Returns the number of records flushed.
pub fn shutdown(router: &CollectionRouter, persist: bool) -> usize {
    let mut flushed = 0;
    for store in router.stores() {
        if store.is_closed() {
            continue;
        }
        if persist {
            flushed += store.flush().records;
        }
        store.close();
    }
    log::info!(
        "Closed {} collections ({flushed} records flushed on shutdown)",
        router.collection_count()
    );
    flushed
}

/// Start the ticker. It exits once `stop` changes or its sender is dropped.
///
/// `storage_interval` of `None` means sweep-only. The first pass runs
/// immediately.
pub fn spawn(
    router: Arc<CollectionRouter>,
    storage_interval: Option<Duration>,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let persist = storage_interval.is_some() && router.is_persistent();
    let period = storage_interval.unwrap_or(SWEEP_ONLY_INTERVAL);
    if persist {
        log::info!("Flushing to disk every {}s", period.as_secs());
    } else {
        log::info!("Persistence disabled, sweeping expired users every {}s", period.as_secs());
    }

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let router = router.clone();
                    let pass = move || maintenance_pass(&router, persist);
                    match tokio::task::spawn_blocking(pass).await {
                        Ok(report) => log::debug!("Maintenance pass: {report:?}"),
                        Err(e) => log::error!("Maintenance pass failed: {e}"),
                    }
                }
                _ = stop.changed() => break,
            }
        }
        log::debug!("Lifecycle worker stopped");
    })
}

//! Expiry notification pipeline.
//!
//! Two periodic triggers drive the pipeline: a dispatch run (daily in
//! production) that notifies customers of bookings ending within the
//! lookahead window, and a retry run (hourly) that re-attempts failed
//! notices. An overlapping firing of a trigger is skipped, never queued.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Days, NaiveDate, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::depot::Depot;
use crate::model::NotificationStatus;
use crate::notify::Notifier;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How far ahead of a booking's end date notices go out.
    pub lookahead_days: u32,
    /// Page size for pipeline scans.
    pub batch_size: usize,
    /// Failed notices are retried this many times before abandonment.
    pub max_retries: u32,
    pub dispatch_interval: Duration,
    pub retry_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lookahead_days: 7,
            batch_size: 20,
            max_retries: 3,
            dispatch_interval: Duration::from_secs(24 * 60 * 60),
            retry_interval: Duration::from_secs(60 * 60),
        }
    }
}

/// Outcome of one pipeline run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub scanned: usize,
    pub sent: usize,
    pub failed: usize,
    pub abandoned: usize,
}

pub struct ExpiryScheduler {
    depot: Arc<Depot>,
    notifier: Arc<dyn Notifier>,
    config: SchedulerConfig,
    dispatch_slot: Arc<Semaphore>,
    retry_slot: Arc<Semaphore>,
}

impl ExpiryScheduler {
    pub fn new(depot: Arc<Depot>, notifier: Arc<dyn Notifier>, config: SchedulerConfig) -> Self {
        Self {
            depot,
            notifier,
            config,
            dispatch_slot: Arc::new(Semaphore::new(1)),
            retry_slot: Arc::new(Semaphore::new(1)),
        }
    }

    fn window_end(&self) -> NaiveDate {
        let today = Utc::now().date_naive();
        let lookahead = Days::new(u64::from(self.config.lookahead_days));
        // Date addition panics past chrono's last representable year; an
        // absurd configured lookahead falls back to the default window.
        today.checked_add_days(lookahead).unwrap_or_else(|| {
            warn!(
                lookahead_days = self.config.lookahead_days,
                "lookahead overflows the calendar, using the default window"
            );
            today + Days::new(u64::from(SchedulerConfig::default().lookahead_days))
        })
    }

    /// One dispatch run. Returns `None` if a dispatch run is already in
    /// flight; the firing is skipped, not queued.
    pub async fn run_dispatch(&self) -> Option<RunReport> {
        let Ok(_permit) = self.dispatch_slot.clone().try_acquire_owned() else {
            metrics::counter!(crate::observability::DISPATCH_RUNS_SKIPPED_TOTAL).increment(1);
            warn!("dispatch run already in flight, skipping");
            return None;
        };
        let report = self.dispatch_once().await;
        info!(
            scanned = report.scanned,
            sent = report.sent,
            failed = report.failed,
            "dispatch run complete"
        );
        Some(report)
    }

    /// One retry run. Returns `None` if a retry run is already in flight.
    pub async fn run_retry(&self) -> Option<RunReport> {
        let Ok(_permit) = self.retry_slot.clone().try_acquire_owned() else {
            metrics::counter!(crate::observability::RETRY_RUNS_SKIPPED_TOTAL).increment(1);
            warn!("retry run already in flight, skipping");
            return None;
        };
        let report = self.retry_once().await;
        info!(
            scanned = report.scanned,
            sent = report.sent,
            failed = report.failed,
            abandoned = report.abandoned,
            "retry run complete"
        );
        Some(report)
    }

    /// Drain the PENDING backlog page by page. Always page 0: items leave
    /// the filter as they are marked, so re-fetching the first page walks
    /// the whole backlog. A page that advances nothing stops the run rather
    /// than spin on items some concurrent writer keeps touching.
    async fn dispatch_once(&self) -> RunReport {
        let mut report = RunReport::default();
        let end_by = self.window_end();
        loop {
            let page = match self
                .depot
                .scan_expiring(Some(NotificationStatus::Pending), end_by, 0, self.config.batch_size)
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    warn!("dispatch scan failed: {e}");
                    break;
                }
            };
            if page.is_empty() {
                break;
            }

            let mut progressed = false;
            for notice in &page {
                report.scanned += 1;
                // Emit before marking: delivery is at-least-once, and a
                // duplicate notice beats a lost one.
                match self.notifier.send_expiry_notice(notice).await {
                    Ok(()) => {
                        match self
                            .depot
                            .mark_notification(
                                notice.booking_id,
                                notice.booking_version,
                                NotificationStatus::Processed,
                                false,
                            )
                            .await
                        {
                            Ok(_) => {
                                metrics::counter!(crate::observability::NOTICES_SENT_TOTAL)
                                    .increment(1);
                                report.sent += 1;
                                progressed = true;
                            }
                            Err(e) => {
                                warn!(
                                    booking_id = %notice.booking_id,
                                    "could not mark processed, leaving for next run: {e}"
                                );
                            }
                        }
                    }
                    Err(e) => {
                        warn!(booking_id = %notice.booking_id, "notice delivery failed: {e}");
                        match self
                            .depot
                            .mark_notification(
                                notice.booking_id,
                                notice.booking_version,
                                NotificationStatus::Failed,
                                false,
                            )
                            .await
                        {
                            Ok(_) => {
                                metrics::counter!(crate::observability::NOTICES_FAILED_TOTAL)
                                    .increment(1);
                                report.failed += 1;
                                progressed = true;
                            }
                            Err(e) => {
                                warn!(
                                    booking_id = %notice.booking_id,
                                    "could not mark failed, leaving for next run: {e}"
                                );
                            }
                        }
                    }
                }
            }

            if !progressed {
                warn!("dispatch page made no progress, stopping run");
                break;
            }
        }
        report
    }

    /// Re-attempt one page of FAILED notices. Single page per run; items
    /// still failed after this run wait for the next trigger.
    async fn retry_once(&self) -> RunReport {
        let mut report = RunReport::default();
        let end_by = self.window_end();
        let page = match self
            .depot
            .scan_expiring(Some(NotificationStatus::Failed), end_by, 0, self.config.batch_size)
            .await
        {
            Ok(page) => page,
            Err(e) => {
                warn!("retry scan failed: {e}");
                return report;
            }
        };

        for notice in &page {
            report.scanned += 1;
            match self.notifier.send_expiry_notice(notice).await {
                Ok(()) => {
                    match self
                        .depot
                        .mark_notification(
                            notice.booking_id,
                            notice.booking_version,
                            NotificationStatus::Processed,
                            false,
                        )
                        .await
                    {
                        Ok(_) => {
                            metrics::counter!(crate::observability::NOTICES_SENT_TOTAL)
                                .increment(1);
                            report.sent += 1;
                        }
                        Err(e) => {
                            warn!(
                                booking_id = %notice.booking_id,
                                "could not mark processed, leaving for next run: {e}"
                            );
                        }
                    }
                }
                Err(e) => {
                    warn!(booking_id = %notice.booking_id, "retry delivery failed: {e}");
                    let next = if notice.retry_count + 1 >= self.config.max_retries {
                        NotificationStatus::Abandoned
                    } else {
                        NotificationStatus::Failed
                    };
                    match self
                        .depot
                        .mark_notification(notice.booking_id, notice.booking_version, next, true)
                        .await
                    {
                        Ok(_) => {
                            if next == NotificationStatus::Abandoned {
                                metrics::counter!(crate::observability::NOTICES_ABANDONED_TOTAL)
                                    .increment(1);
                                report.abandoned += 1;
                            } else {
                                metrics::counter!(crate::observability::NOTICES_FAILED_TOTAL)
                                    .increment(1);
                                report.failed += 1;
                            }
                        }
                        Err(e) => {
                            warn!(
                                booking_id = %notice.booking_id,
                                "could not record retry failure, leaving for next run: {e}"
                            );
                        }
                    }
                }
            }
        }
        report
    }

    /// Spawn the dispatch and retry trigger loops. Each ticks on its own
    /// interval until the token is cancelled; the first tick fires
    /// immediately, so any backlog is drained on startup.
    pub fn spawn_triggers(self: Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let dispatch = {
            let scheduler = self.clone();
            let token = shutdown.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(scheduler.config.dispatch_interval);
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            scheduler.run_dispatch().await;
                        }
                        _ = token.cancelled() => {
                            info!("shutting down dispatch trigger");
                            break;
                        }
                    }
                }
            })
        };
        let retry = {
            let scheduler = self;
            let token = shutdown;
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(scheduler.config.retry_interval);
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            scheduler.run_retry().await;
                        }
                        _ = token.cancelled() => {
                            info!("shutting down retry trigger");
                            break;
                        }
                    }
                }
            })
        };
        vec![dispatch, retry]
    }
}

/// Background task that rewrites the WAL once enough commits accumulate.
pub async fn run_compactor(depot: Arc<Depot>, threshold: u64, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let commits = depot.wal_commits_since_compact().await;
                if commits > threshold {
                    match depot.compact_wal().await {
                        Ok(()) => {
                            metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL)
                                .increment(1);
                            info!("WAL compacted after {commits} commits");
                        }
                        Err(e) => tracing::error!("WAL compaction failed: {e}"),
                    }
                }
            }
            _ = shutdown.cancelled() => {
                info!("shutting down compactor");
                break;
            }
        }
    }
}

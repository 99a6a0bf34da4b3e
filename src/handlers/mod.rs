//! Event Handlers (C6, §4.6).
//!
//! Four update handlers plus chat-command parsing, wired into a `dptree`
//! schema the same way the teacher's single Telegram channel handler is
//! (`Update::filter_message().endpoint(...)`), generalized to branch on
//! update kind and to share a [`CoreContext`] instead of a raw `MessageBus`.

mod commands;

pub use commands::handle_chat_command;

use crate::context::CoreContext;
use crate::verification::Verdict;
use teloxide::dispatching::{Dispatcher, UpdateFilterExt};
use teloxide::prelude::*;
use teloxide::types::{ChatMemberUpdated, Message, Update, UpdateKind};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

/// Where a bot worker's updates come from: teloxide's long-poll dispatcher,
/// or a channel fed by the shared webhook listener (§6).
pub enum UpdateSource {
    Polling,
    Webhook(mpsc::Receiver<Update>),
}

/// Runs one bot's update intake until `shutdown` fires, dispatching through
/// whichever `source` the Bot Supervisor selected for this worker.
pub async fn run_dispatcher(ctx: CoreContext, source: UpdateSource, shutdown: watch::Receiver<bool>) {
    match source {
        UpdateSource::Polling => run_polling_dispatcher(ctx, shutdown).await,
        UpdateSource::Webhook(rx) => run_webhook_consumer(ctx, rx, shutdown).await,
    }
}

/// Builds and runs the per-bot `dptree` dispatcher over long polling.
/// `ctx.enforced_channel_ids` lets the `chat_member` handler recognize
/// updates about one of this bot's enforced channels versus an unrelated
/// chat.
async fn run_polling_dispatcher(ctx: CoreContext, mut shutdown: watch::Receiver<bool>) {
    let bot = ctx.facade.raw_bot();

    let handler = dptree::entry()
        .branch(Update::filter_message().endpoint({
            let ctx = ctx.clone();
            move |msg: Message| {
                let ctx = ctx.clone();
                async move { handle_message(ctx, msg).await }
            }
        }))
        .branch(Update::filter_chat_member().endpoint({
            let ctx = ctx.clone();
            move |update: ChatMemberUpdated| {
                let ctx = ctx.clone();
                async move { handle_chat_member_update(ctx, update).await }
            }
        }))
        .branch(Update::filter_callback_query().endpoint({
            let ctx = ctx.clone();
            move |query: teloxide::types::CallbackQuery| {
                let ctx = ctx.clone();
                async move { handle_callback_query(ctx, query).await }
            }
        }));

    let mut dispatcher = Dispatcher::builder(bot, handler).build();

    tokio::select! {
        _ = dispatcher.dispatch() => {
            info!(bot_instance_id = ctx.bot_instance_id, "update dispatcher exited");
        }
        _ = shutdown.changed() => {
            info!(bot_instance_id = ctx.bot_instance_id, "update dispatcher shutting down");
        }
    }
}

/// Consumes updates the shared webhook listener routed to this bot,
/// dispatching each one through the same per-kind handlers long polling
/// uses, since webhook mode bypasses `Dispatcher`/`dptree` entirely.
async fn run_webhook_consumer(ctx: CoreContext, mut rx: mpsc::Receiver<Update>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            maybe_update = rx.recv() => {
                match maybe_update {
                    Some(update) => dispatch_update(&ctx, update).await,
                    None => {
                        info!(bot_instance_id = ctx.bot_instance_id, "webhook update channel closed");
                        return;
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!(bot_instance_id = ctx.bot_instance_id, "webhook update consumer shutting down");
                    return;
                }
            }
        }
    }
}

async fn dispatch_update(ctx: &CoreContext, update: Update) {
    let result = match update.kind {
        UpdateKind::Message(msg) => handle_message(ctx.clone(), msg).await,
        UpdateKind::ChatMember(member_update) => handle_chat_member_update(ctx.clone(), member_update).await,
        UpdateKind::CallbackQuery(query) => handle_callback_query(ctx.clone(), query).await,
        _ => Ok(()),
    };
    if let Err(err) = result {
        warn!(bot_instance_id = ctx.bot_instance_id, error = ?err, "webhook update handler failed");
    }
}

/// Handles a text/media message: new-member join is delivered separately by
/// teloxide as `new_chat_members` on the `Message` itself, so both cases are
/// covered here (§4.6's "new chat member" and "text/media message" rows).
async fn handle_message(ctx: CoreContext, msg: Message) -> ResponseResult<()> {
    let group_id = msg.chat.id.0;

    if let Some(text) = msg.text() {
        if text.starts_with('/') {
            handle_chat_command(&ctx, &msg, text).await;
            return Ok(());
        }
    }

    if let Some(new_members) = msg.new_chat_members() {
        for member in new_members {
            verify_and_enforce(&ctx, group_id, member.id.0 as i64, None).await;
        }
        return Ok(());
    }

    if let Some(user) = msg.from() {
        verify_and_enforce(&ctx, group_id, user.id.0 as i64, Some(msg.id.0)).await;
    }

    Ok(())
}

async fn handle_chat_member_update(ctx: CoreContext, update: ChatMemberUpdated) -> ResponseResult<()> {
    let channel_id = update.chat.id.0;
    let is_enforced = ctx.enforced_channel_ids.read().await.contains(&channel_id);
    if !is_enforced {
        return Ok(());
    }

    let user_id = update.new_chat_member.user.id.0 as i64;
    ctx.cache.invalidate(ctx.bot_instance_id, channel_id, user_id).await;

    let left_or_kicked = matches!(
        update.new_chat_member.kind,
        teloxide::types::ChatMemberKind::Left | teloxide::types::ChatMemberKind::Banned(_)
    );
    if !left_or_kicked {
        return Ok(());
    }

    match ctx.db.groups_requiring_channel(ctx.bot_instance_id, channel_id).await {
        Ok(groups) => {
            for group in groups {
                verify_and_enforce(&ctx, group.group_id, user_id, None).await;
            }
        }
        Err(err) => warn!(channel_id, error = %err, "failed to look up groups for eager re-verification"),
    }

    Ok(())
}

async fn handle_callback_query(ctx: CoreContext, query: teloxide::types::CallbackQuery) -> ResponseResult<()> {
    let Some(data) = query.data.as_deref() else {
        return Ok(());
    };
    let Some(user_id_str) = data.strip_prefix("verify:") else {
        return Ok(());
    };
    let Ok(user_id) = user_id_str.parse::<i64>() else {
        return Ok(());
    };
    let Some(message) = query.message.as_ref() else {
        return Ok(());
    };
    let chat_id = message.chat().id.0;

    let verdict = ctx.verification.verify(ctx.bot_instance_id, chat_id, user_id).await;
    let answer_text = match &verdict {
        Ok(Verdict::Verified) => "Verified — welcome back!".to_string(),
        Ok(Verdict::Restricted { missing_channel_id }) => {
            format!("Still not a member of channel {missing_channel_id}.")
        }
        Ok(Verdict::Error) | Err(_) => "Couldn't verify right now, try again shortly.".to_string(),
    };

    if let Err(err) = ctx.facade.answer_callback_query(&query.id, &answer_text).await {
        warn!(error = %err, "failed to answer callback query");
    }

    if let Ok(verdict) = verdict {
        apply_verdict(&ctx, chat_id, user_id, verdict, None).await;
    }

    Ok(())
}

async fn verify_and_enforce(ctx: &CoreContext, group_id: i64, user_id: i64, message_id: Option<i32>) {
    match ctx.verification.verify(ctx.bot_instance_id, group_id, user_id).await {
        Ok(verdict) => apply_verdict(ctx, group_id, user_id, verdict, message_id).await,
        Err(err) => warn!(group_id, user_id, error = %err, "verification failed"),
    }
}

async fn apply_verdict(ctx: &CoreContext, group_id: i64, user_id: i64, verdict: Verdict, message_id: Option<i32>) {
    let (channel_title, invite_link) = match &verdict {
        Verdict::Restricted { missing_channel_id } => {
            match ctx.db.get_group_with_channels(ctx.bot_instance_id, group_id).await {
                Ok(Some((_, channels))) => channels
                    .into_iter()
                    .find(|c| c.channel_id == *missing_channel_id)
                    .map(|c| (c.title.unwrap_or_default(), c.invite_link))
                    .unwrap_or_default(),
                _ => Default::default(),
            }
        }
        _ => Default::default(),
    };

    if let Err(err) = ctx
        .enforcement
        .apply(group_id, user_id, verdict, message_id, &channel_title, invite_link.as_deref())
        .await
    {
        warn!(group_id, user_id, error = %err, "enforcement action failed");
    }
}


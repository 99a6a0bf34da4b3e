//! Bot Supervisor (C9, §4.9).
//!
//! Manages N bots in one process with strong isolation. Grounded on
//! `src/channels/manager.rs` (named-worker registry, `watch::channel`
//! shutdown, per-item error isolation) and `src/gateway/startup_guard.rs`
//! (restart-count-within-window policy), generalized from channel adapters
//! to bot instances and from a JSON-file mirror to `bot_status` rows.

use crate::cache::MembershipCache;
use crate::command_worker::CommandWorker;
use crate::config::{Config, UpdateMode};
use crate::context::CoreContext;
use crate::crypto::TokenCipher;
use crate::db::PersistenceGateway;
use crate::enforcement::EnforcementService;
use crate::error::Result;
use crate::handlers::{self, UpdateSource};
use crate::logger::VerificationLogger;
use crate::models::{BotInstance, WorkerStatus};
use crate::status_writer::StatusWriter;
use crate::telegram::TelegramFacade;
use crate::verification::VerificationService;
use crate::webhook::WebhookServer;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const RESTART_DELAY: Duration = Duration::from_secs(10);
const RESTART_WINDOW: Duration = Duration::from_secs(5 * 60);
const MAX_RESTARTS_PER_WINDOW: u32 = 3;
const RECONCILE_INTERVAL: Duration = Duration::from_secs(30);

struct RunningWorker {
    bot_username: String,
    token_ciphertext: Vec<u8>,
    shutdown_tx: watch::Sender<bool>,
    join_handle: JoinHandle<()>,
}

pub struct BotSupervisor {
    db: Arc<PersistenceGateway>,
    cipher: Arc<TokenCipher>,
    cache: Arc<dyn MembershipCache>,
    config: Config,
    workers: Arc<RwLock<HashMap<i64, RunningWorker>>>,
    webhook: Option<Arc<WebhookServer>>,
}

impl BotSupervisor {
    pub fn new(db: Arc<PersistenceGateway>, cipher: Arc<TokenCipher>, cache: Arc<dyn MembershipCache>, config: Config) -> Self {
        let webhook = match config.update_mode {
            UpdateMode::Webhook => Some(WebhookServer::new(config.webhook_secret.clone().unwrap_or_default())),
            UpdateMode::Polling => None,
        };
        Self {
            db,
            cipher,
            cache,
            config,
            workers: Arc::new(RwLock::new(HashMap::new())),
            webhook,
        }
    }

    /// Starts every active bot, then reconciles against the database every
    /// [`RECONCILE_INTERVAL`] until `shutdown` fires. When `update_mode` is
    /// webhook, also runs the shared HTTP listener alongside the reconcile
    /// loop for the lifetime of the process.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let webhook_task = self.webhook.clone().map(|server| {
            let listen_addr = self.config.webhook_listen_addr.clone().unwrap_or_default();
            let shutdown_rx = shutdown.clone();
            tokio::spawn(async move {
                if let Err(err) = server.run(listen_addr, shutdown_rx).await {
                    error!(error = %err, "webhook listener exited with an error");
                }
            })
        });

        self.reconcile().await;

        let mut ticker = tokio::time::interval(RECONCILE_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.reconcile().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        self.shutdown_all().await;
                        if let Some(task) = webhook_task {
                            let _ = task.await;
                        }
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn reconcile(&self) {
        let bots = match self.db.load_active_bots().await {
            Ok(bots) => bots,
            Err(err) => {
                error!(error = %err, "failed to load active bots, skipping this reconcile pass");
                return;
            }
        };

        let desired: HashMap<i64, BotInstance> = bots.into_iter().map(|b| (b.id, b)).collect();

        let stale: Vec<i64> = {
            let workers = self.workers.read().await;
            workers.keys().filter(|id| !desired.contains_key(id)).copied().collect()
        };
        for id in stale {
            self.stop_worker(id).await;
        }

        for (id, bot) in desired {
            let needs_restart = {
                let workers = self.workers.read().await;
                match workers.get(&id) {
                    Some(running) => running.token_ciphertext != bot.token_ciphertext,
                    None => false,
                }
            };
            if needs_restart {
                self.stop_worker(id).await;
            }

            let already_running = self.workers.read().await.contains_key(&id);
            if !already_running {
                self.start_worker(bot).await;
            }
        }
    }

    async fn start_worker(&self, bot: BotInstance) {
        let token = match self.cipher.decrypt(&bot.token_ciphertext) {
            Ok(token) => token,
            Err(err) => {
                error!(bot_instance_id = bot.id, error = %err, "failed to decrypt bot token, skipping");
                return;
            }
        };

        let (logger_handle, _logger_join) = VerificationLogger::spawn(self.db.clone());
        let facade = Arc::new(TelegramFacade::new(token, bot.bot_id, logger_handle.clone()));
        if let Err(err) = facade.get_me().await {
            warn!(bot_instance_id = bot.id, error = %err, "get_me failed at startup, retrying next reconcile");
            return;
        }

        let verification = Arc::new(VerificationService::new(
            facade.clone(),
            self.cache.clone(),
            self.db.clone(),
            Arc::new(logger_handle.clone()),
        ));
        let enforcement = Arc::new(EnforcementService::new(facade.clone(), self.config.send_verified_toast));

        let enforced_channel_ids = Arc::new(RwLock::new(
            self.db.enforced_channel_ids_for_bot(bot.id).await.unwrap_or_default(),
        ));

        let ctx = CoreContext::new(
            bot.id,
            facade.clone(),
            verification,
            enforcement,
            self.cache.clone(),
            self.db.clone(),
            logger_handle,
            enforced_channel_ids,
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let db = self.db.clone();
        let join_handle = tokio::spawn(run_worker_body(ctx, db, facade, bot.bot_id, self.webhook.clone(), shutdown_rx));

        info!(bot_instance_id = bot.id, bot_username = %bot.bot_username, "bot worker started");

        let mut workers = self.workers.write().await;
        workers.insert(
            bot.id,
            RunningWorker {
                bot_username: bot.bot_username,
                token_ciphertext: bot.token_ciphertext,
                shutdown_tx,
                join_handle,
            },
        );
    }

    async fn stop_worker(&self, bot_instance_id: i64) {
        let running = self.workers.write().await.remove(&bot_instance_id);
        if let Some(running) = running {
            let _ = running.shutdown_tx.send(true);
            if tokio::time::timeout(self.config.shutdown_grace, running.join_handle).await.is_err() {
                warn!(bot_instance_id, "bot worker did not stop within the shutdown grace period");
            }
            if let Err(err) = self.db.upsert_bot_status(bot_instance_id, WorkerStatus::Stopped, 0, None).await {
                warn!(bot_instance_id, error = %err, "failed to record stopped status");
            }
            info!(bot_instance_id, bot_username = %running.bot_username, "bot worker stopped");
        }
    }

    async fn shutdown_all(&self) {
        let ids: Vec<i64> = self.workers.read().await.keys().copied().collect();
        for id in ids {
            self.stop_worker(id).await;
        }
    }
}

/// Runs one bot's full worker body (dispatcher, command worker, status
/// writer) behind a panic boundary, and restarts it with the window policy
/// in §4.9 when it exits abnormally.
async fn run_worker_body(
    ctx: CoreContext,
    db: Arc<PersistenceGateway>,
    facade: Arc<TelegramFacade>,
    telegram_bot_id: i64,
    webhook: Option<Arc<WebhookServer>>,
    shutdown_rx: watch::Receiver<bool>,
) {
    let bot_instance_id = ctx.bot_instance_id;
    let mut restart_count = 0u32;
    let mut window_start = Instant::now();

    loop {
        let status_writer = Arc::new(StatusWriter::new(bot_instance_id, db.clone()));
        let command_worker = CommandWorker::new(
            bot_instance_id,
            db.clone(),
            facade.clone(),
            ctx.cache.clone(),
            ctx.verification.clone(),
            ctx.enforcement.clone(),
        );

        let update_source = match &webhook {
            Some(server) => UpdateSource::Webhook(server.register(telegram_bot_id).await),
            None => UpdateSource::Polling,
        };

        let result = AssertUnwindSafe(run_one_attempt(
            ctx.clone(),
            status_writer.clone(),
            command_worker,
            update_source,
            shutdown_rx.clone(),
        ))
        .catch_unwind()
        .await;

        if let Some(server) = &webhook {
            server.unregister(telegram_bot_id).await;
        }

        if *shutdown_rx.borrow() {
            return;
        }

        let error_text = match result {
            Ok(()) => "worker exited normally".to_string(),
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                format!("worker panicked: {message}")
            }
        };

        warn!(bot_instance_id, error = %error_text, "bot worker exited abnormally");
        status_writer.record_crash(&error_text).await;

        if window_start.elapsed() >= RESTART_WINDOW {
            restart_count = 0;
            window_start = Instant::now();
        }
        restart_count += 1;
        if restart_count > MAX_RESTARTS_PER_WINDOW {
            error!(bot_instance_id, restart_count, "exceeded restart budget, leaving bot down");
            let _ = db
                .upsert_bot_status(bot_instance_id, WorkerStatus::Crashed, 0, Some(error_text.as_str()))
                .await;
            return;
        }

        tokio::time::sleep(RESTART_DELAY).await;
    }
}

async fn run_one_attempt(
    ctx: CoreContext,
    status_writer: Arc<StatusWriter>,
    command_worker: CommandWorker,
    update_source: UpdateSource,
    shutdown_rx: watch::Receiver<bool>,
) {
    tokio::join!(
        status_writer.run(shutdown_rx.clone()),
        command_worker.run(shutdown_rx.clone()),
        handlers::run_dispatcher(ctx, update_source, shutdown_rx),
    );
}

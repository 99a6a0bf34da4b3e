//! Webhook update intake (C9, §6).
//!
//! Runs one shared HTTPS listener for the whole process when
//! `update_mode=webhook`: Telegram always posts to the configured
//! `webhook_public_url`, so bots are told apart by a `/webhook/{bot_id}`
//! path segment instead of each bot binding its own port. Every request is
//! authenticated by the `X-Telegram-Bot-Api-Secret-Token` header, compared
//! in constant time, before an update ever reaches a worker.

use crate::crypto::webhook_secret_matches;
use crate::error::{CoreError, Result};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use std::collections::HashMap;
use std::sync::Arc;
use teloxide::types::Update;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{info, warn};

const SECRET_HEADER: &str = "X-Telegram-Bot-Api-Secret-Token";
const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// Routes incoming webhook POSTs to the right bot worker's update channel.
pub struct WebhookServer {
    secret: String,
    routes: RwLock<HashMap<i64, mpsc::Sender<Update>>>,
}

impl WebhookServer {
    pub fn new(secret: String) -> Arc<Self> {
        Arc::new(Self {
            secret,
            routes: RwLock::new(HashMap::new()),
        })
    }

    /// Registers a bot worker to receive updates, returning the receiving
    /// end it should consume from until it unregisters or shuts down.
    pub async fn register(&self, bot_id: i64) -> mpsc::Receiver<Update> {
        let (tx, rx) = mpsc::channel(UPDATE_CHANNEL_CAPACITY);
        self.routes.write().await.insert(bot_id, tx);
        rx
    }

    pub async fn unregister(&self, bot_id: i64) {
        self.routes.write().await.remove(&bot_id);
    }

    /// Binds `listen_addr` and serves until `shutdown` fires.
    pub async fn run(self: Arc<Self>, listen_addr: String, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let app = Router::new()
            .route("/webhook/{bot_id}", post(receive_update))
            .with_state(self.clone());

        let listener = tokio::net::TcpListener::bind(&listen_addr)
            .await
            .map_err(|e| CoreError::Fatal(format!("failed to bind webhook listener on {listen_addr}: {e}")))?;

        info!(listen_addr, "webhook listener started");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await
            .map_err(|e| CoreError::Transient(format!("webhook listener stopped: {e}")))
    }
}

async fn receive_update(
    State(server): State<Arc<WebhookServer>>,
    Path(bot_id): Path<i64>,
    headers: HeaderMap,
    Json(update): Json<Update>,
) -> StatusCode {
    let received = headers
        .get(SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !webhook_secret_matches(received, &server.secret) {
        warn!(bot_id, "webhook request rejected, secret token mismatch");
        return StatusCode::UNAUTHORIZED;
    }

    let routes = server.routes.read().await;
    match routes.get(&bot_id) {
        Some(tx) => {
            if tx.try_send(update).is_err() {
                warn!(bot_id, "webhook update dropped, worker channel full or closed");
            }
            StatusCode::OK
        }
        None => {
            warn!(bot_id, "webhook request for unknown or stopped bot");
            StatusCode::NOT_FOUND
        }
    }
}

//! Nezuko core — the enforcement engine behind a multi-tenant Telegram bot
//! platform that gates group-chat participation on channel-subscription
//! membership. See `SPEC_FULL.md` for the full component breakdown (C1-C10).

pub mod cache;
pub mod command_worker;
pub mod config;
pub mod context;
pub mod crypto;
pub mod db;
pub mod enforcement;
pub mod error;
pub mod handlers;
pub mod logger;
pub mod models;
pub mod status_writer;
pub mod supervisor;
pub mod telegram;
pub mod verification;
pub mod webhook;

pub use config::Config;
pub use context::CoreContext;
pub use crypto::TokenCipher;
pub use db::PersistenceGateway;
pub use error::{CoreError, Result};
pub use supervisor::BotSupervisor;

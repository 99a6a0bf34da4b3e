//! `CoreContext` — explicit per-bot wiring of every collaborator (§9 design
//! notes: no global singletons, no DI framework; everything is constructed
//! once and passed down).

use crate::cache::MembershipCache;
use crate::db::PersistenceGateway;
use crate::enforcement::EnforcementService;
use crate::logger::LoggerHandle;
use crate::telegram::TelegramFacade;
use crate::verification::VerificationService;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Everything one bot worker's handlers, command worker, and status writer
/// need. Cloned cheaply (every field is an `Arc`).
#[derive(Clone)]
pub struct CoreContext {
    pub bot_instance_id: i64,
    pub facade: Arc<TelegramFacade>,
    pub verification: Arc<VerificationService>,
    pub enforcement: Arc<EnforcementService>,
    pub cache: Arc<dyn MembershipCache>,
    pub db: Arc<PersistenceGateway>,
    pub logger: LoggerHandle,
    /// Channel ids this bot currently enforces somewhere, kept in sync with
    /// `enforced_channels` (populated at startup, extended on `/protect`) so
    /// the `chat_member`-update handler knows which updates are ours (§4.6).
    pub enforced_channel_ids: Arc<RwLock<HashSet<i64>>>,
}

impl CoreContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bot_instance_id: i64,
        facade: Arc<TelegramFacade>,
        verification: Arc<VerificationService>,
        enforcement: Arc<EnforcementService>,
        cache: Arc<dyn MembershipCache>,
        db: Arc<PersistenceGateway>,
        logger: LoggerHandle,
        enforced_channel_ids: Arc<RwLock<HashSet<i64>>>,
    ) -> Self {
        Self {
            bot_instance_id,
            facade,
            verification,
            enforcement,
            cache,
            db,
            logger,
            enforced_channel_ids,
        }
    }
}

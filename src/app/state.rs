//! Application state shared across routes

use std::sync::Arc;

use crate::battle::BattleRegistry;
use crate::config::Config;
use crate::util::rate_limit::{create_limiter, Limiter, BATTLE_CREATE_RATE_LIMIT};
use crate::util::time::{ServerClock, SystemClock};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub battles: Arc<BattleRegistry>,
    /// Clock every battle stamps QTE windows with
    pub clock: Arc<dyn ServerClock>,
    /// Global limiter on battle creation
    pub create_limiter: Arc<Limiter>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: Config, clock: Arc<dyn ServerClock>) -> Self {
        Self {
            config: Arc::new(config),
            battles: Arc::new(BattleRegistry::new()),
            clock,
            create_limiter: create_limiter(BATTLE_CREATE_RATE_LIMIT),
        }
    }
}

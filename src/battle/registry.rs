//! Registry of all active battles

use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;
use uuid::Uuid;

use crate::qte::QteTuning;
use crate::util::time::ServerClock;

use super::field::{BattleSetup, FieldError};
use super::session::{BattleHandle, BattleSession};

pub struct BattleRegistry {
    battles: DashMap<Uuid, BattleHandle>,
}

impl BattleRegistry {
    pub fn new() -> Self {
        Self {
            battles: DashMap::new(),
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<BattleHandle> {
        self.battles.get(id).map(|b| b.value().clone())
    }

    pub fn insert(&self, handle: BattleHandle) {
        self.battles.insert(handle.id, handle);
    }

    pub fn remove(&self, id: &Uuid) -> Option<BattleHandle> {
        self.battles.remove(id).map(|(_, h)| h)
    }

    pub fn active_battles(&self) -> usize {
        self.battles.len()
    }

    pub fn total_participants(&self) -> usize {
        self.battles
            .iter()
            .map(|b| b.value().participant_count())
            .sum()
    }

    /// Start a battle task and register it; the entry is removed when the
    /// task exits
    pub fn spawn(
        self: &Arc<Self>,
        setup: BattleSetup,
        tuning: QteTuning,
        clock: Arc<dyn ServerClock>,
    ) -> Result<BattleHandle, FieldError> {
        let id = Uuid::new_v4();
        let (session, handle) = BattleSession::new(id, setup, tuning, clock)?;
        self.insert(handle.clone());

        let registry = Arc::clone(self);
        tokio::spawn(async move {
            session.run().await;
            registry.remove(&id);
            info!(battle_id = %id, active = registry.active_battles(), "Battle unregistered");
        });

        Ok(handle)
    }
}

impl Default for BattleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

//! QTE synchronization and resolution engine
//!
//! The engine is transport-agnostic and clock-agnostic: a battle session owns
//! one `QteRuntime` plus one orchestrator of each kind, and drives them from
//! its single event loop.

pub mod arena;
pub mod chain;
pub mod chain_builder;
pub mod deadline;
pub mod params;
pub mod simple;
pub mod tuning;
pub mod types;
pub mod zones;

#[cfg(test)]
pub mod testkit;

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::battle::field::Battlefield;
use crate::battle::unit::Unit;
use crate::util::time::ServerClock;
use crate::ws::protocol::ServerMsg;

pub use chain::ChainQteOrchestrator;
pub use chain_builder::{build_chain, ChainRequest};
pub use deadline::{Deadline, DeadlineKey, DeadlineScheduler, TimerHandle, TokioDeadlines};
pub use simple::{AttackRequest, SimpleQteOrchestrator};
pub use tuning::QteTuning;

/// Outbound event sink
pub trait Outbox: Send + Sync {
    /// Send to every client in the battle
    fn broadcast(&self, msg: ServerMsg);

    /// Send to one player
    fn unicast(&self, user_id: Uuid, msg: ServerMsg);
}

/// Collaborators shared by both orchestrators of one battle
pub struct QteRuntime {
    pub battle_id: Uuid,
    pub tuning: QteTuning,
    pub clock: Arc<dyn ServerClock>,
    pub outbox: Arc<dyn Outbox>,
    pub deadlines: Box<dyn DeadlineScheduler>,
}

impl QteRuntime {
    pub fn now(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Arm a deadline that fires `buffer` after the absolute server time
    /// `end_time`
    pub(crate) fn arm_deadline(&mut self, key: DeadlineKey, end_time: u64, buffer: u64) -> TimerHandle {
        let delay = end_time.saturating_sub(self.now()) + buffer;
        self.deadlines.schedule(key, Duration::from_millis(delay))
    }
}

/// Caller errors when starting a QTE. Responses never produce these; bad
/// responses are logged and dropped.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QteError {
    #[error("Unknown unit {0}")]
    UnknownUnit(Uuid),

    #[error("Unit {0} is defeated")]
    UnitDefeated(Uuid),

    #[error("A unit cannot target itself")]
    SelfTarget,

    #[error("Chain needs at least one target")]
    NoTargets,

    #[error("Chain has no steps")]
    EmptyChain,

    #[error("Base damage must be a finite, non-negative number")]
    InvalidDamage,

    #[error("Unit {unit_id} is not controlled by player {player_id}")]
    NotOwner { unit_id: Uuid, player_id: Uuid },
}

impl QteError {
    /// Short machine-readable code for client error messages
    pub fn code(&self) -> &'static str {
        match self {
            QteError::UnknownUnit(_) => "unknown_unit",
            QteError::UnitDefeated(_) => "unit_defeated",
            QteError::SelfTarget => "self_target",
            QteError::NoTargets => "no_targets",
            QteError::EmptyChain => "empty_chain",
            QteError::InvalidDamage => "invalid_damage",
            QteError::NotOwner { .. } => "not_owner",
        }
    }
}

pub(crate) fn check_base_damage(base_damage: f64) -> Result<(), QteError> {
    if base_damage.is_finite() && base_damage >= 0.0 {
        Ok(())
    } else {
        Err(QteError::InvalidDamage)
    }
}

/// Look up a unit that can still take part in a QTE
pub(crate) fn live_unit(field: &Battlefield, id: Uuid) -> Result<&Unit, QteError> {
    let unit = field.unit(&id).ok_or(QteError::UnknownUnit(id))?;
    if !unit.is_alive() {
        return Err(QteError::UnitDefeated(id));
    }
    Ok(unit)
}

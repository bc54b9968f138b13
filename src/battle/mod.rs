//! Battle state: the grid, its units and the per-battle session task

pub mod damage;
pub mod field;
pub mod registry;
pub mod session;
pub mod unit;

pub use registry::BattleRegistry;
pub use session::{BattleHandle, BattleInput, BattleSummary, Envelope, PlayerInput};

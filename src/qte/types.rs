//! QTE data model shared by the orchestrators and the wire protocol

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::battle::damage::DamageType;
use crate::battle::field::{Direction, GridPos};

use super::zones::ZoneBounds;

pub type QteId = Uuid;
pub type ChainId = Uuid;

/// Which side of the exchange a config asks the responder to play
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QteActionType {
    Attack,
    Defense,
}

/// Phase of a pending simple exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QtePhase {
    Attack,
    Defense,
}

/// Player input. `None` is what a timeout synthesizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QteInput {
    Up,
    Down,
    Left,
    Right,
    Block,
    Strike,
    None,
}

impl QteInput {
    pub fn direction(self) -> Option<Direction> {
        match self {
            QteInput::Up => Some(Direction::Up),
            QteInput::Down => Some(Direction::Down),
            QteInput::Left => Some(Direction::Left),
            QteInput::Right => Some(Direction::Right),
            _ => None,
        }
    }
}

impl From<Direction> for QteInput {
    fn from(dir: Direction) -> Self {
        match dir {
            Direction::Up => QteInput::Up,
            Direction::Down => QteInput::Down,
            Direction::Left => QteInput::Left,
            Direction::Right => QteInput::Right,
        }
    }
}

/// Discrete QTE outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QteGrade {
    Fail,
    Hit,
    Perfect,
}

impl QteGrade {
    pub fn is_success(self) -> bool {
        !matches!(self, QteGrade::Fail)
    }
}

/// Immutable description of one QTE instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QteConfig {
    pub qte_id: QteId,
    pub battle_id: Uuid,
    pub action_type: QteActionType,
    pub responder_id: Uuid,
    /// Player owning the responder; clients compare this to decide whether to
    /// show the interactive track or spectate
    pub responder_owner_id: Uuid,
    pub attacker_id: Option<Uuid>,
    pub target_id: Option<Uuid>,
    /// Window length in milliseconds
    pub duration: u64,
    pub shake_intensity: f64,
    pub hit_zone_size: f64,
    pub perfect_zone_size: f64,
    pub valid_inputs: Vec<QteInput>,
    pub invalid_inputs: Vec<QteInput>,
    /// Future server instant the client animates toward
    pub server_start_time: u64,
    pub server_end_time: u64,
}

impl QteConfig {
    pub fn zones(&self) -> ZoneBounds {
        ZoneBounds::from_sizes(self.hit_zone_size, self.perfect_zone_size)
    }

    /// Whether `input` may be graded at all. `None` is always gradeable (as a
    /// miss).
    pub fn accepts(&self, input: QteInput) -> bool {
        input == QteInput::None
            || (self.valid_inputs.contains(&input) && !self.invalid_inputs.contains(&input))
    }
}

/// Client reply to a simple QTE
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QteResponse {
    pub qte_id: QteId,
    pub battle_id: Uuid,
    /// Overwritten with the authenticated user by the transport
    #[serde(default)]
    pub player_id: Uuid,
    pub unit_id: Uuid,
    pub input: QteInput,
    /// Marker position on the 0-100 track
    pub hit_position: f64,
    /// Client estimate of server time at the moment of input
    pub server_timestamp: u64,
}

/// Resolution of one phase of a simple exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QteResult {
    pub qte_id: QteId,
    pub responder_id: Uuid,
    pub action_type: QteActionType,
    pub grade: QteGrade,
    pub input: QteInput,
    pub hit_position: f64,
    /// Attack-phase damage multiplier
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attack_modifier: Option<f64>,
    /// Defense-phase damage multiplier
    #[serde(skip_serializing_if = "Option::is_none")]
    pub defense_modifier: Option<f64>,
    pub dodged: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dodge_direction: Option<Direction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_position: Option<GridPos>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub damage_dealt: Option<i32>,
    pub target_killed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cascade_target_id: Option<Uuid>,
    pub feedback: String,
    pub timed_out: bool,
    /// Grade was forced to FAIL because the reported timestamp fell outside
    /// the accepted window
    pub timing_rejected: bool,
}

impl QteResult {
    pub(crate) fn new(config: &QteConfig, grade: QteGrade, input: QteInput, hit_position: f64) -> Self {
        Self::blank(
            config.qte_id,
            config.responder_id,
            config.action_type,
            grade,
            input,
            hit_position,
        )
    }

    pub(crate) fn blank(
        qte_id: QteId,
        responder_id: Uuid,
        action_type: QteActionType,
        grade: QteGrade,
        input: QteInput,
        hit_position: f64,
    ) -> Self {
        Self {
            qte_id,
            responder_id,
            action_type,
            grade,
            input,
            hit_position,
            attack_modifier: None,
            defense_modifier: None,
            dodged: false,
            dodge_direction: None,
            new_position: None,
            damage_dealt: None,
            target_killed: false,
            cascade_target_id: None,
            feedback: String::new(),
            timed_out: false,
            timing_rejected: false,
        }
    }
}

/// Straight-line path of a projectile continuing past a dodging unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectileTrajectory {
    pub from: GridPos,
    pub to: GridPos,
    pub direction: Direction,
}

/// Everything that happened in one attack, including cascades
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeOutcome {
    /// qteId of the opening attack phase
    pub exchange_id: QteId,
    pub attacker_id: Uuid,
    pub attack: Option<QteResult>,
    /// One entry per defending unit, in cascade order
    pub defenses: Vec<QteResult>,
    pub total_damage: i32,
}

// ============================================================================
// Chain QTE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChainType {
    ChainLightning,
    Omnislash,
    MeteorShower,
}

/// What a failed step does to the rest of the chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailMode {
    /// Halt; later steps never run
    Break,
    /// Reset the combo multiplier to 1.0 and keep going
    Combo,
    /// Keep going with the multiplier untouched
    Continue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainQteStep {
    pub step_index: usize,
    pub target_id: Uuid,
    /// Offset from the chain's `serverBaseTime`
    pub offset_ms: u64,
    pub duration: u64,
    pub hit_zone_size: f64,
    pub perfect_zone_size: f64,
    pub valid_inputs: Vec<QteInput>,
    /// Per-step weight on the chain's base damage
    pub combo_multiplier: f64,
}

impl ChainQteStep {
    pub fn zones(&self) -> ZoneBounds {
        ZoneBounds::from_sizes(self.hit_zone_size, self.perfect_zone_size)
    }

    pub fn accepts(&self, input: QteInput) -> bool {
        input == QteInput::None || self.valid_inputs.contains(&input)
    }
}

/// Pre-computed playlist of steps sharing one base time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainQteConfig {
    pub chain_id: ChainId,
    pub battle_id: Uuid,
    pub chain_type: ChainType,
    pub caster_id: Uuid,
    pub responder_owner_id: Uuid,
    pub server_base_time: u64,
    pub fail_mode: FailMode,
    pub base_damage: f64,
    pub damage_type: DamageType,
    pub steps: Vec<ChainQteStep>,
}

impl ChainQteConfig {
    pub fn step(&self, index: usize) -> Option<&ChainQteStep> {
        self.steps.iter().find(|s| s.step_index == index)
    }

    /// Distinct targets in first-hit order
    pub fn target_ids(&self) -> Vec<Uuid> {
        let mut ids = Vec::new();
        for step in &self.steps {
            if !ids.contains(&step.target_id) {
                ids.push(step.target_id);
            }
        }
        ids
    }

    /// Offset at which the last step's window closes
    pub fn end_offset_ms(&self) -> u64 {
        self.steps
            .iter()
            .map(|s| s.offset_ms + s.duration)
            .max()
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainStepResponse {
    pub chain_id: ChainId,
    #[serde(default)]
    pub player_id: Uuid,
    pub step_index: usize,
    pub input: QteInput,
    pub hit_position: f64,
    pub server_timestamp: u64,
}

/// One buffered step inside a batch reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStepInput {
    pub step_index: usize,
    pub input: QteInput,
    pub hit_position: f64,
    pub server_timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainBatchResponse {
    pub chain_id: ChainId,
    #[serde(default)]
    pub player_id: Uuid,
    pub step_results: Vec<BatchStepInput>,
}

impl ChainBatchResponse {
    pub fn into_step_responses(self) -> Vec<ChainStepResponse> {
        let chain_id = self.chain_id;
        let player_id = self.player_id;
        self.step_results
            .into_iter()
            .map(|s| ChainStepResponse {
                chain_id,
                player_id,
                step_index: s.step_index,
                input: s.input,
                hit_position: s.hit_position,
                server_timestamp: s.server_timestamp,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainStepResult {
    pub step_index: usize,
    pub target_id: Uuid,
    pub grade: QteGrade,
    pub input: QteInput,
    pub hit_position: f64,
    pub damage: i32,
    /// Combo multiplier in effect after this step
    pub combo: f64,
    pub target_killed: bool,
    pub timed_out: bool,
    pub timing_rejected: bool,
}

/// Aggregate of a finished chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainResult {
    pub chain_id: ChainId,
    pub chain_type: ChainType,
    pub caster_id: Uuid,
    pub step_results: Vec<ChainStepResult>,
    pub total_steps: usize,
    /// Non-FAIL steps, perfects included
    pub total_hits: usize,
    pub total_perfects: usize,
    pub total_fails: usize,
    /// Longest run of non-FAIL steps by step index
    pub max_combo: usize,
    pub total_damage: i32,
    pub chain_broken: bool,
    /// 1-based ordinal of the step that broke the chain
    pub broken_at_step: Option<usize>,
    pub timed_out: bool,
    pub feedback: String,
    pub feedback_color: String,
}

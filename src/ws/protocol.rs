//! WebSocket protocol message definitions
//! These are the wire types for client-server communication

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::battle::field::Obstacle;
use crate::battle::unit::Unit;
use crate::qte::chain_builder::ChainRequest;
use crate::qte::types::{
    ChainBatchResponse, ChainId, ChainQteConfig, ChainResult, ChainStepResponse, ChainStepResult,
    ChainType, ExchangeOutcome, ProjectileTrajectory, QteConfig, QteId, QteResponse, QteResult,
};

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMsg {
    /// Subscribe to a running battle
    JoinBattle { battle_id: Uuid },

    LeaveBattle,

    /// Start an attack exchange with one of your units
    Attack {
        attacker_id: Uuid,
        target_id: Uuid,
        base_damage: f64,
        #[serde(default)]
        is_magic: bool,
    },

    /// Cast a chain ability
    CastChain(ChainRequest),

    #[serde(rename = "qte:response")]
    QteResponse(QteResponse),

    #[serde(rename = "chain_qte:step_response")]
    ChainStepResponse(ChainStepResponse),

    #[serde(rename = "chain_qte:batch_response")]
    ChainBatchResponse(ChainBatchResponse),

    /// Ping for latency and clock-offset measurement
    Ping {
        /// Client timestamp
        t: u64,
    },
}

impl ClientMsg {
    /// Stamp the authenticated sender onto QTE replies, replacing whatever
    /// the client claimed
    pub fn with_player(self, user_id: Uuid) -> Self {
        match self {
            ClientMsg::QteResponse(mut r) => {
                r.player_id = user_id;
                ClientMsg::QteResponse(r)
            }
            ClientMsg::ChainStepResponse(mut r) => {
                r.player_id = user_id;
                ClientMsg::ChainStepResponse(r)
            }
            ClientMsg::ChainBatchResponse(mut r) => {
                r.player_id = user_id;
                ClientMsg::ChainBatchResponse(r)
            }
            other => other,
        }
    }
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMsg {
    /// Welcome message after connection
    Welcome { user_id: Uuid, server_time: u64 },

    /// Confirmation of battle join with the full board
    BattleJoined {
        battle_id: Uuid,
        server_time: u64,
        width: i32,
        height: i32,
        units: Vec<Unit>,
        obstacles: Vec<Obstacle>,
    },

    /// Unit state after an exchange or chain
    BattleState { units: Vec<Unit> },

    #[serde(rename = "qte:start")]
    QteStart { config: QteConfig },

    #[serde(rename = "qte:resolved")]
    QteResolved { result: QteResult },

    /// A dodged projectile continues into another unit
    #[serde(rename = "qte:cascade")]
    QteCascade {
        previous_qte_id: QteId,
        new_config: QteConfig,
        projectile_trajectory: ProjectileTrajectory,
    },

    #[serde(rename = "qte:expired")]
    QteExpired {
        qte_id: QteId,
        responder_id: Uuid,
        result: QteResult,
    },

    /// Every phase of one attack has resolved
    ExchangeComplete { outcome: ExchangeOutcome },

    /// Full playlist, responder only
    #[serde(rename = "chain_qte:start")]
    ChainQteStart { config: ChainQteConfig },

    /// Chain summary for observers
    #[serde(rename = "chain_qte:initiated")]
    ChainQteInitiated {
        chain_id: ChainId,
        caster_id: Uuid,
        target_ids: Vec<Uuid>,
        chain_type: ChainType,
        total_steps: usize,
    },

    #[serde(rename = "chain_qte:step_resolved")]
    ChainQteStepResolved {
        chain_id: ChainId,
        step_result: ChainStepResult,
    },

    #[serde(rename = "chain_qte:complete")]
    ChainQteComplete { result: ChainResult },

    #[serde(rename = "chain_qte:broken")]
    ChainQteBroken {
        chain_id: ChainId,
        /// 1-based ordinal of the failed step
        broken_at_step: usize,
        reason: String,
    },

    /// Error message
    Error { code: String, message: String },

    /// Pong response
    Pong {
        /// Echo back client timestamp
        t: u64,
        server_time: u64,
    },
}

impl ServerMsg {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        ServerMsg::Error {
            code: code.into(),
            message: message.into(),
        }
    }
}

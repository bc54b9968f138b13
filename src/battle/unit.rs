//! Battle units and their QTE-relevant attributes

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::field::GridPos;

/// Attributes the QTE parameter calculator reads, always in opposing pairs
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UnitAttributes {
    /// Shortens the opponent's reaction window
    pub speed: f64,
    /// Shakes the opponent's track when it beats their defense
    pub power: f64,
    pub defense: f64,
    /// Widens this unit's own hit zone
    pub focus: f64,
}

impl Default for UnitAttributes {
    fn default() -> Self {
        Self {
            speed: 5.0,
            power: 5.0,
            defense: 5.0,
            focus: 5.0,
        }
    }
}

/// Temporary conditions set by QTE outcomes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnitCondition {
    /// Granted by a perfect dodge
    PerfectDodge { remaining_turns: u32 },
}

/// A unit on the battle grid (authoritative)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Unit {
    pub id: Uuid,
    /// Player controlling this unit; responses are authorized against it
    pub owner_id: Uuid,
    pub name: String,
    pub position: GridPos,
    pub hp: i32,
    pub max_hp: i32,
    #[serde(default)]
    pub physical_protection: i32,
    #[serde(default)]
    pub magical_protection: i32,
    #[serde(default)]
    pub attributes: UnitAttributes,
    #[serde(default)]
    pub conditions: Vec<UnitCondition>,
}

impl Unit {
    pub fn new(id: Uuid, owner_id: Uuid, name: impl Into<String>, position: GridPos, hp: i32) -> Self {
        Self {
            id,
            owner_id,
            name: name.into(),
            position,
            hp,
            max_hp: hp,
            physical_protection: 0,
            magical_protection: 0,
            attributes: UnitAttributes::default(),
            conditions: Vec::new(),
        }
    }

    pub fn with_attributes(mut self, attributes: UnitAttributes) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn with_protection(mut self, physical: i32, magical: i32) -> Self {
        self.physical_protection = physical;
        self.magical_protection = magical;
        self
    }

    pub fn is_alive(&self) -> bool {
        self.hp > 0
    }

    pub fn set_position(&mut self, position: GridPos) {
        self.position = position;
    }

    /// Grant (or refresh) the perfect-dodge buff
    pub fn grant_perfect_dodge(&mut self, turns: u32) {
        self.conditions
            .retain(|c| !matches!(c, UnitCondition::PerfectDodge { .. }));
        self.conditions.push(UnitCondition::PerfectDodge {
            remaining_turns: turns,
        });
    }

    pub fn has_perfect_dodge(&self) -> bool {
        self.conditions
            .iter()
            .any(|c| matches!(c, UnitCondition::PerfectDodge { .. }))
    }
}

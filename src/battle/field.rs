//! Battle grid: positions, obstacles and the unit roster

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::damage::{apply_damage, DamageType};
use super::unit::Unit;

/// Cell coordinate. `y` grows downward, so `Direction::Down` is `+y`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GridPos {
    pub x: i32,
    pub y: i32,
}

impl GridPos {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Neighbouring cell one step in `dir`
    pub fn step(self, dir: Direction) -> Self {
        let (dx, dy) = dir.delta();
        Self::new(self.x + dx, self.y + dy)
    }

    pub fn manhattan(self, other: GridPos) -> u32 {
        self.x.abs_diff(other.x) + self.y.abs_diff(other.y)
    }

    /// True for the four orthogonal neighbours only
    pub fn is_adjacent(self, other: GridPos) -> bool {
        self.manhattan(other) == 1
    }
}

/// Orthogonal direction on the grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

impl Direction {
    pub const ALL: [Direction; 4] = [
        Direction::Up,
        Direction::Down,
        Direction::Left,
        Direction::Right,
    ];

    pub fn delta(self) -> (i32, i32) {
        match self {
            Direction::Up => (0, -1),
            Direction::Down => (0, 1),
            Direction::Left => (-1, 0),
            Direction::Right => (1, 0),
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Direction::Up => Direction::Down,
            Direction::Down => Direction::Up,
            Direction::Left => Direction::Right,
            Direction::Right => Direction::Left,
        }
    }
}

/// Static obstacle; destroyed obstacles no longer block movement
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Obstacle {
    pub position: GridPos,
    #[serde(default)]
    pub destroyed: bool,
}

/// Outcome of applying QTE-derived damage to a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DamageReport {
    /// HP actually lost
    pub hp_lost: i32,
    pub killed: bool,
}

/// Battle creation payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BattleSetup {
    pub width: i32,
    pub height: i32,
    pub units: Vec<Unit>,
    #[serde(default)]
    pub obstacles: Vec<Obstacle>,
    /// Seed for chain playlist randomisation
    #[serde(default)]
    pub seed: Option<u64>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FieldError {
    #[error("Grid must be at least 1x1")]
    InvalidDimensions,

    #[error("Cell ({0}, {1}) is outside the grid")]
    OutOfBounds(i32, i32),

    #[error("Cell ({0}, {1}) is already occupied")]
    Occupied(i32, i32),

    #[error("Duplicate unit id {0}")]
    DuplicateUnit(Uuid),
}

/// Authoritative grid state for one battle
#[derive(Debug, Clone)]
pub struct Battlefield {
    width: i32,
    height: i32,
    units: HashMap<Uuid, Unit>,
    obstacles: Vec<Obstacle>,
}

impl Battlefield {
    pub fn new(width: i32, height: i32) -> Result<Self, FieldError> {
        if width < 1 || height < 1 {
            return Err(FieldError::InvalidDimensions);
        }
        Ok(Self {
            width,
            height,
            units: HashMap::new(),
            obstacles: Vec::new(),
        })
    }

    /// Build a battlefield from a creation payload, validating placement
    pub fn from_setup(setup: BattleSetup) -> Result<Self, FieldError> {
        let mut field = Self::new(setup.width, setup.height)?;
        for obstacle in setup.obstacles {
            field.add_obstacle(obstacle)?;
        }
        for unit in setup.units {
            field.add_unit(unit)?;
        }
        Ok(field)
    }

    pub fn width(&self) -> i32 {
        self.width
    }

    pub fn height(&self) -> i32 {
        self.height
    }

    pub fn add_unit(&mut self, unit: Unit) -> Result<(), FieldError> {
        let pos = unit.position;
        if !self.in_bounds(pos) {
            return Err(FieldError::OutOfBounds(pos.x, pos.y));
        }
        if self.units.contains_key(&unit.id) {
            return Err(FieldError::DuplicateUnit(unit.id));
        }
        if unit.is_alive() && self.is_cell_blocked(pos) {
            return Err(FieldError::Occupied(pos.x, pos.y));
        }
        self.units.insert(unit.id, unit);
        Ok(())
    }

    pub fn add_obstacle(&mut self, obstacle: Obstacle) -> Result<(), FieldError> {
        let pos = obstacle.position;
        if !self.in_bounds(pos) {
            return Err(FieldError::OutOfBounds(pos.x, pos.y));
        }
        self.obstacles.push(obstacle);
        Ok(())
    }

    pub fn obstacles(&self) -> &[Obstacle] {
        &self.obstacles
    }

    pub fn in_bounds(&self, pos: GridPos) -> bool {
        pos.x >= 0 && pos.y >= 0 && pos.x < self.width && pos.y < self.height
    }

    pub fn unit(&self, id: &Uuid) -> Option<&Unit> {
        self.units.get(id)
    }

    pub fn live_unit_at(&self, pos: GridPos) -> Option<&Unit> {
        self.units
            .values()
            .find(|u| u.is_alive() && u.position == pos)
    }

    pub fn has_obstacle_at(&self, pos: GridPos) -> bool {
        self.obstacles
            .iter()
            .any(|o| !o.destroyed && o.position == pos)
    }

    /// A cell is blocked when it is off-grid, holds a live unit, or holds an
    /// undestroyed obstacle
    pub fn is_cell_blocked(&self, pos: GridPos) -> bool {
        !self.in_bounds(pos) || self.live_unit_at(pos).is_some() || self.has_obstacle_at(pos)
    }

    pub fn alive_count(&self) -> usize {
        self.units.values().filter(|u| u.is_alive()).count()
    }

    /// Apply damage through the protection/HP collaborator. Returns `None`
    /// for unknown units.
    pub fn apply_damage(
        &mut self,
        unit_id: &Uuid,
        amount: i32,
        damage_type: DamageType,
    ) -> Option<DamageReport> {
        let unit = self.units.get_mut(unit_id)?;
        let was_alive = unit.is_alive();
        let result = apply_damage(
            unit.physical_protection,
            unit.magical_protection,
            unit.hp,
            amount,
            damage_type,
        );

        let hp_lost = unit.hp - result.new_hp;
        unit.physical_protection = result.new_physical_protection;
        unit.magical_protection = result.new_magical_protection;
        unit.hp = result.new_hp;

        Some(DamageReport {
            hp_lost,
            killed: was_alive && result.is_dead(),
        })
    }

    /// Move a unit into `pos` if that cell is free. Returns whether it moved.
    pub fn move_unit(&mut self, unit_id: &Uuid, pos: GridPos) -> bool {
        if self.is_cell_blocked(pos) {
            return false;
        }
        match self.units.get_mut(unit_id) {
            Some(unit) => {
                unit.set_position(pos);
                true
            }
            None => false,
        }
    }

    pub fn grant_perfect_dodge(&mut self, unit_id: &Uuid, turns: u32) {
        if let Some(unit) = self.units.get_mut(unit_id) {
            unit.grant_perfect_dodge(turns);
        }
    }

    /// Clone of every unit, for state broadcasts
    pub fn snapshot(&self) -> Vec<Unit> {
        let mut units: Vec<Unit> = self.units.values().cloned().collect();
        units.sort_by_key(|u| u.id);
        units
    }
}

//! Parameter calculator: QTE geometry and timing from paired unit attributes
//!
//! Every formula takes two opposing attribute values and is floored at a safe
//! minimum. Nothing is capped from above except shake, so lopsided matchups
//! produce lopsided windows.

use uuid::Uuid;

use crate::battle::field::{Battlefield, Direction, GridPos};
use crate::battle::unit::UnitAttributes;

use super::tuning::QteTuning;
use super::types::QteInput;

/// Reaction window in ms. A faster attacker relative to the defender shortens
/// it.
pub fn duration(attacker_speed: f64, defender_speed: f64, tuning: &QteTuning) -> u64 {
    let delta = attacker_speed - defender_speed;
    let raw = tuning.duration_base_ms - delta * tuning.duration_speed_mod;
    raw.round().max(tuning.min_duration_ms as f64) as u64
}

/// Track shake, 0-100. Zero whenever the defender's defense matches or beats
/// the attacker's power.
pub fn shake_intensity(attacker_power: f64, defender_defense: f64, tuning: &QteTuning) -> f64 {
    let advantage = defender_defense - attacker_power;
    if advantage >= 0.0 {
        return 0.0;
    }
    (tuning.shake_base + (-advantage) * tuning.shake_mod).min(tuning.max_shake)
}

/// Attack-side hit zone (%): attacker focus enlarges it, defender focus
/// shrinks it
pub fn hit_zone_size(attacker_focus: f64, defender_focus: f64, tuning: &QteTuning) -> f64 {
    let raw = tuning.hit_zone_base + (attacker_focus - defender_focus) * tuning.hit_zone_focus_mod;
    raw.round().max(tuning.min_zone_size)
}

/// Defense-side hit zone (%), mirrored: defender focus enlarges it
pub fn defense_hit_zone_size(attacker_focus: f64, defender_focus: f64, tuning: &QteTuning) -> f64 {
    let raw = tuning.hit_zone_base + (defender_focus - attacker_focus) * tuning.hit_zone_focus_mod;
    raw.round().max(tuning.min_zone_size)
}

pub fn perfect_zone_size(hit_zone_size: f64, tuning: &QteTuning) -> f64 {
    (hit_zone_size * tuning.perfect_zone_ratio)
        .round()
        .max(tuning.min_zone_size)
}

/// Direction of travel from `from` to `to`. The axis with the larger delta
/// wins; ties go to X.
pub fn attack_direction(from: GridPos, to: GridPos) -> Direction {
    let dx = to.x - from.x;
    let dy = to.y - from.y;
    if dx.abs() >= dy.abs() {
        if dx >= 0 {
            Direction::Right
        } else {
            Direction::Left
        }
    } else if dy > 0 {
        Direction::Down
    } else {
        Direction::Up
    }
}

/// Orthogonal neighbours of `pos` a unit cannot step into
pub fn blocked_directions(field: &Battlefield, pos: GridPos) -> Vec<Direction> {
    Direction::ALL
        .into_iter()
        .filter(|dir| field.is_cell_blocked(pos.step(*dir)))
        .collect()
}

/// Valid and invalid defense inputs for a unit at `pos` hit by an attack
/// travelling in `travel`. Dodging back toward the attack's origin is never
/// allowed.
pub fn defense_inputs(
    field: &Battlefield,
    pos: GridPos,
    travel: Direction,
) -> (Vec<QteInput>, Vec<QteInput>) {
    let origin = travel.opposite();
    let blocked = blocked_directions(field, pos);

    let mut valid = vec![QteInput::Block];
    let mut invalid = Vec::new();
    for dir in Direction::ALL {
        if dir == origin || blocked.contains(&dir) {
            invalid.push(QteInput::from(dir));
        } else {
            valid.push(QteInput::from(dir));
        }
    }
    (valid, invalid)
}

/// Derived numbers for one QTE window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseGeometry {
    pub duration_ms: u64,
    pub shake_intensity: f64,
    pub hit_zone_size: f64,
    pub perfect_zone_size: f64,
}

/// Attack phase: the attacker responds, pressured by the target's speed and
/// power
pub fn attack_phase_geometry(
    attacker: &UnitAttributes,
    target: &UnitAttributes,
    tuning: &QteTuning,
) -> PhaseGeometry {
    let hit = hit_zone_size(attacker.focus, target.focus, tuning);
    PhaseGeometry {
        duration_ms: duration(target.speed, attacker.speed, tuning),
        shake_intensity: shake_intensity(target.power, attacker.defense, tuning),
        hit_zone_size: hit,
        perfect_zone_size: perfect_zone_size(hit, tuning),
    }
}

/// Defense phase: the target responds, pressured by the attacker
pub fn defense_phase_geometry(
    attacker: &UnitAttributes,
    target: &UnitAttributes,
    tuning: &QteTuning,
) -> PhaseGeometry {
    let hit = defense_hit_zone_size(attacker.focus, target.focus, tuning);
    PhaseGeometry {
        duration_ms: duration(attacker.speed, target.speed, tuning),
        shake_intensity: shake_intensity(attacker.power, target.defense, tuning),
        hit_zone_size: hit,
        perfect_zone_size: perfect_zone_size(hit, tuning),
    }
}

/// Walk a dodged projectile onward from `origin` and return the first live
/// unit it reaches that is not in `exclude`. Grid edges and obstacles stop it.
pub fn projectile_next_target(
    field: &Battlefield,
    origin: GridPos,
    travel: Direction,
    range: u32,
    exclude: &[Uuid],
) -> Option<(Uuid, GridPos)> {
    let mut pos = origin;
    for _ in 0..range {
        pos = pos.step(travel);
        if !field.in_bounds(pos) || field.has_obstacle_at(pos) {
            return None;
        }
        if let Some(unit) = field.live_unit_at(pos) {
            if !exclude.contains(&unit.id) {
                return Some((unit.id, pos));
            }
        }
    }
    None
}

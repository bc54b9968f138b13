//! Playlist generation for chain abilities

use rand::seq::SliceRandom;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::battle::damage::DamageType;
use crate::battle::field::{Battlefield, GridPos};
use crate::battle::unit::Unit;

use super::params::{attack_phase_geometry, perfect_zone_size};
use super::tuning::QteTuning;
use super::types::{ChainQteConfig, ChainQteStep, ChainType, FailMode, QteInput};
use super::{live_unit, QteError, QteRuntime};

/// Request to cast a chain ability
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainRequest {
    pub caster_id: Uuid,
    pub chain_type: ChainType,
    pub target_ids: Vec<Uuid>,
    pub base_damage: f64,
}

/// One planned strike before offsets are laid out
struct Strike<'a> {
    target: &'a Unit,
    duration: u64,
    hit_zone_size: f64,
    perfect_zone_size: f64,
    combo_multiplier: f64,
}

/// Build the playlist for `request`, timed to start `future_delay_ms` from now
pub fn build_chain(
    rt: &QteRuntime,
    field: &Battlefield,
    rng: &mut ChaCha8Rng,
    request: &ChainRequest,
) -> Result<ChainQteConfig, QteError> {
    let caster = live_unit(field, request.caster_id)?;

    let mut targets: Vec<&Unit> = Vec::with_capacity(request.target_ids.len());
    for id in &request.target_ids {
        if *id == caster.id {
            return Err(QteError::SelfTarget);
        }
        let unit = live_unit(field, *id)?;
        if !targets.iter().any(|t| t.id == unit.id) {
            targets.push(unit);
        }
    }
    if targets.is_empty() {
        return Err(QteError::NoTargets);
    }

    let tuning = &rt.tuning;
    let (fail_mode, damage_type, strikes) = match request.chain_type {
        ChainType::ChainLightning => (
            FailMode::Break,
            DamageType::Magical,
            lightning(caster, targets, tuning),
        ),
        ChainType::Omnislash => (
            FailMode::Combo,
            DamageType::Physical,
            omnislash(caster, targets, rng, tuning),
        ),
        ChainType::MeteorShower => (
            FailMode::Continue,
            DamageType::Magical,
            meteor_shower(caster, &targets, rng, tuning),
        ),
    };

    // Omnislash blinks between targets; everything else travels
    let gap_scale = match request.chain_type {
        ChainType::Omnislash => 0.5,
        _ => 1.0,
    };

    Ok(ChainQteConfig {
        chain_id: Uuid::new_v4(),
        battle_id: rt.battle_id,
        chain_type: request.chain_type,
        caster_id: caster.id,
        responder_owner_id: caster.owner_id,
        server_base_time: rt.now() + tuning.future_delay_ms,
        fail_mode,
        base_damage: request.base_damage,
        damage_type,
        steps: lay_out(&strikes, gap_scale, tuning),
    })
}

fn strike<'a>(caster: &Unit, target: &'a Unit, combo_multiplier: f64, tuning: &QteTuning) -> Strike<'a> {
    let geometry = attack_phase_geometry(&caster.attributes, &target.attributes, tuning);
    Strike {
        target,
        duration: geometry.duration_ms,
        hit_zone_size: geometry.hit_zone_size,
        perfect_zone_size: geometry.perfect_zone_size,
        combo_multiplier,
    }
}

/// Nearest-neighbour jumps from the caster, weakening with every jump
fn lightning<'a>(caster: &Unit, mut remaining: Vec<&'a Unit>, tuning: &QteTuning) -> Vec<Strike<'a>> {
    let mut strikes = Vec::with_capacity(remaining.len());
    let mut from = caster.position;

    while !remaining.is_empty() {
        let (next, _) = remaining
            .iter()
            .enumerate()
            .min_by_key(|(i, u)| (u.position.manhattan(from), *i))
            .map(|(i, u)| (i, u.position))
            .unwrap_or((0, from));
        let target = remaining.remove(next);
        from = target.position;

        let decay = tuning.lightning_decay.powi(strikes.len() as i32);
        strikes.push(strike(caster, target, decay, tuning));
    }
    strikes
}

/// Seeded round robin over shuffled targets at half-length windows, ending
/// on a heavy finisher
fn omnislash<'a>(
    caster: &Unit,
    mut order: Vec<&'a Unit>,
    rng: &mut ChaCha8Rng,
    tuning: &QteTuning,
) -> Vec<Strike<'a>> {
    order.shuffle(rng);
    let count = tuning.omnislash_strikes.max(1);

    (0..count)
        .map(|i| {
            let finisher = i + 1 == count;
            let multiplier = if finisher { tuning.omnislash_finisher } else { 1.0 };
            let mut s = strike(caster, order[i % order.len()], multiplier, tuning);
            s.duration = (s.duration / 2).max(tuning.min_duration_ms);
            s
        })
        .collect()
}

/// Random impacts with widened zones
fn meteor_shower<'a>(
    caster: &Unit,
    targets: &[&'a Unit],
    rng: &mut ChaCha8Rng,
    tuning: &QteTuning,
) -> Vec<Strike<'a>> {
    (0..tuning.meteor_count.max(1))
        .map(|_| {
            let target = targets[rng.gen_range(0..targets.len())];
            let mut s = strike(caster, target, 1.0, tuning);
            s.hit_zone_size = (s.hit_zone_size * tuning.meteor_zone_scale).round().min(100.0);
            s.perfect_zone_size = perfect_zone_size(s.hit_zone_size, tuning);
            s
        })
        .collect()
}

/// Assign offsets: each step opens after the previous window closes plus the
/// travel time between the two targets
fn lay_out(strikes: &[Strike<'_>], gap_scale: f64, tuning: &QteTuning) -> Vec<ChainQteStep> {
    let mut steps = Vec::with_capacity(strikes.len());
    let mut offset = 0u64;
    let mut previous: Option<(GridPos, u64)> = None;

    for (i, s) in strikes.iter().enumerate() {
        if let Some((pos, duration)) = previous {
            offset += duration + travel_gap(pos, s.target.position, gap_scale, tuning);
        }
        steps.push(ChainQteStep {
            step_index: i,
            target_id: s.target.id,
            offset_ms: offset,
            duration: s.duration,
            hit_zone_size: s.hit_zone_size,
            perfect_zone_size: s.perfect_zone_size,
            valid_inputs: vec![QteInput::Strike],
            combo_multiplier: s.combo_multiplier,
        });
        previous = Some((s.target.position, s.duration));
    }
    steps
}

fn travel_gap(from: GridPos, to: GridPos, scale: f64, tuning: &QteTuning) -> u64 {
    let travel = tuning.travel_ms_per_cell * u64::from(from.manhattan(to));
    let gap = travel.max(tuning.min_step_gap_ms) as f64 * scale;
    gap.round() as u64
}

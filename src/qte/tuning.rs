//! QTE tunables

use super::types::QteGrade;

/// Multiplier per grade
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradeTable {
    pub fail: f64,
    pub hit: f64,
    pub perfect: f64,
}

impl GradeTable {
    pub fn get(&self, grade: QteGrade) -> f64 {
        match grade {
            QteGrade::Fail => self.fail,
            QteGrade::Hit => self.hit,
            QteGrade::Perfect => self.perfect,
        }
    }
}

/// Every constant the calculator and orchestrators read. Defaults are the
/// shipped balance; `Config::from_env` overrides the protocol timings.
#[derive(Debug, Clone, PartialEq)]
pub struct QteTuning {
    /// Lead time between emitting a config and its window opening
    pub future_delay_ms: u64,
    /// Grace after a window closes before the server gives up on a reply
    pub timeout_buffer_ms: u64,
    /// Slack on reported timestamps
    pub tolerance_ms: u64,
    /// Apply the timestamp window check to attack/defense phases too
    pub enforce_simple_timing: bool,

    pub duration_base_ms: f64,
    pub duration_speed_mod: f64,
    pub min_duration_ms: u64,

    pub shake_base: f64,
    pub shake_mod: f64,
    pub max_shake: f64,

    pub hit_zone_base: f64,
    pub hit_zone_focus_mod: f64,
    pub perfect_zone_ratio: f64,
    pub min_zone_size: f64,

    /// Attack-phase damage multiplier
    pub attack_multipliers: GradeTable,
    pub block_hit_modifier: f64,
    pub block_perfect_modifier: f64,
    pub dodge_modifier: f64,
    pub perfect_dodge_buff_turns: u32,

    /// Cells a dodged projectile keeps travelling
    pub projectile_range: u32,
    pub max_cascade_depth: u32,

    pub combo_per_hit: f64,
    pub combo_perfect_bonus: f64,
    pub max_combo: f64,
    /// Chain step damage multiplier
    pub chain_multipliers: GradeTable,

    pub travel_ms_per_cell: u64,
    pub min_step_gap_ms: u64,
    pub lightning_decay: f64,
    pub omnislash_strikes: usize,
    pub omnislash_finisher: f64,
    pub meteor_count: usize,
    pub meteor_zone_scale: f64,
}

impl Default for QteTuning {
    fn default() -> Self {
        Self {
            future_delay_ms: 500,
            timeout_buffer_ms: 500,
            tolerance_ms: 150,
            enforce_simple_timing: true,

            duration_base_ms: 1000.0,
            duration_speed_mod: 15.0,
            min_duration_ms: 100,

            shake_base: 10.0,
            shake_mod: 5.0,
            max_shake: 100.0,

            hit_zone_base: 25.0,
            hit_zone_focus_mod: 1.5,
            perfect_zone_ratio: 0.30,
            min_zone_size: 1.0,

            attack_multipliers: GradeTable {
                fail: 0.5,
                hit: 1.0,
                perfect: 1.5,
            },
            block_hit_modifier: 0.5,
            block_perfect_modifier: 0.25,
            dodge_modifier: 0.0,
            perfect_dodge_buff_turns: 1,

            projectile_range: 6,
            max_cascade_depth: 3,

            combo_per_hit: 0.1,
            combo_perfect_bonus: 0.05,
            max_combo: 2.0,
            chain_multipliers: GradeTable {
                fail: 0.0,
                hit: 1.0,
                perfect: 1.5,
            },

            travel_ms_per_cell: 40,
            min_step_gap_ms: 120,
            lightning_decay: 0.85,
            omnislash_strikes: 6,
            omnislash_finisher: 2.0,
            meteor_count: 5,
            meteor_zone_scale: 1.25,
        }
    }
}

//! Chain QTE orchestrator
//!
//! A chain is a playlist of timed steps sharing one `serverBaseTime`. The
//! client plays it locally and reports each step (or the whole batch); the
//! server grades every step against its expected instant, applies damage as
//! it goes and finalises once the last step lands, the chain breaks, or the
//! single chain-wide deadline fires.

use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

use crate::battle::field::Battlefield;
use crate::ws::protocol::ServerMsg;

use super::arena::PendingArena;
use super::deadline::{DeadlineKey, TimerHandle};
use super::tuning::QteTuning;
use super::types::{
    ChainBatchResponse, ChainId, ChainQteConfig, ChainQteStep, ChainResult, ChainStepResponse,
    ChainStepResult, FailMode, QteGrade, QteInput,
};
use super::zones::evaluate_grade;
use super::{check_base_damage, live_unit, QteError, QteRuntime};

struct PendingChainQte {
    config: ChainQteConfig,
    step_results: Vec<ChainStepResult>,
    current_combo: f64,
    consecutive_hits: u32,
    consecutive_perfects: u32,
    chain_broken: bool,
    broken_at_step: Option<usize>,
    timer: Option<TimerHandle>,
    completion: Option<oneshot::Sender<ChainResult>>,
}

impl PendingChainQte {
    fn is_resolved(&self, step_index: usize) -> bool {
        self.step_results.iter().any(|r| r.step_index == step_index)
    }

    fn is_finished(&self) -> bool {
        self.chain_broken || self.step_results.len() >= self.config.steps.len()
    }

    /// Update streaks and the combo multiplier for one graded step
    fn record_grade(&mut self, grade: QteGrade, step_index: usize, tuning: &QteTuning) {
        match grade {
            QteGrade::Fail => {
                self.consecutive_hits = 0;
                self.consecutive_perfects = 0;
                match self.config.fail_mode {
                    FailMode::Break => {
                        self.chain_broken = true;
                        self.broken_at_step = Some(step_index + 1);
                    }
                    FailMode::Combo => self.current_combo = 1.0,
                    FailMode::Continue => {}
                }
                return;
            }
            QteGrade::Hit => {
                self.consecutive_hits += 1;
                self.consecutive_perfects = 0;
            }
            QteGrade::Perfect => {
                self.consecutive_hits += 1;
                self.consecutive_perfects += 1;
            }
        }

        self.current_combo = (1.0
            + self.consecutive_hits as f64 * tuning.combo_per_hit
            + self.consecutive_perfects as f64 * tuning.combo_perfect_bonus)
            .min(tuning.max_combo);
    }
}

/// Playlist orchestrator, one per battle
#[derive(Default)]
pub struct ChainQteOrchestrator {
    pending: PendingArena<PendingChainQte>,
}

impl ChainQteOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, chain_id: &ChainId) -> bool {
        self.pending.contains(chain_id)
    }

    pub fn resolved_steps(&self, chain_id: &ChainId) -> Option<usize> {
        self.pending.get(chain_id).map(|p| p.step_results.len())
    }

    pub fn current_combo(&self, chain_id: &ChainId) -> Option<f64> {
        self.pending.get(chain_id).map(|p| p.current_combo)
    }

    /// Register a chain, arm its deadline and announce it. The responder gets
    /// the full playlist; everyone else gets a summary.
    pub fn initiate_chain_qte(
        &mut self,
        rt: &mut QteRuntime,
        field: &Battlefield,
        config: ChainQteConfig,
    ) -> Result<oneshot::Receiver<ChainResult>, QteError> {
        if config.steps.is_empty() {
            return Err(QteError::EmptyChain);
        }
        check_base_damage(config.base_damage)?;
        live_unit(field, config.caster_id)?;

        let chain_id = config.chain_id;
        let end_time = config.server_base_time + config.end_offset_ms();
        let timer = rt.arm_deadline(
            DeadlineKey::Chain(chain_id),
            end_time,
            rt.tuning.timeout_buffer_ms * 2,
        );
        let (tx, rx) = oneshot::channel();

        info!(
            battle_id = %rt.battle_id,
            chain_id = %chain_id,
            chain_type = ?config.chain_type,
            caster_id = %config.caster_id,
            steps = config.steps.len(),
            "Chain QTE started"
        );

        rt.outbox.unicast(
            config.responder_owner_id,
            ServerMsg::ChainQteStart {
                config: config.clone(),
            },
        );
        rt.outbox.broadcast(ServerMsg::ChainQteInitiated {
            chain_id,
            caster_id: config.caster_id,
            target_ids: config.target_ids(),
            chain_type: config.chain_type,
            total_steps: config.steps.len(),
        });

        self.pending.insert(
            chain_id,
            PendingChainQte {
                config,
                step_results: Vec::new(),
                current_combo: 1.0,
                consecutive_hits: 0,
                consecutive_perfects: 0,
                chain_broken: false,
                broken_at_step: None,
                timer: Some(timer),
                completion: Some(tx),
            },
        );

        Ok(rx)
    }

    /// Grade one step. Returns whether the reply was used.
    pub fn process_step_response(
        &mut self,
        rt: &mut QteRuntime,
        field: &mut Battlefield,
        response: ChainStepResponse,
    ) -> bool {
        let chain_id = response.chain_id;
        let Some(pending) = self.pending.get_mut(&chain_id) else {
            warn!(battle_id = %rt.battle_id, chain_id = %chain_id, "Step for unknown chain, dropping");
            return false;
        };

        if response.player_id != pending.config.responder_owner_id {
            warn!(
                battle_id = %rt.battle_id,
                chain_id = %chain_id,
                player_id = %response.player_id,
                "Step from non-responder, dropping"
            );
            return false;
        }
        if pending.chain_broken {
            debug!(chain_id = %chain_id, "Step after break, dropping");
            return false;
        }
        let Some(step) = pending.config.step(response.step_index).cloned() else {
            warn!(
                chain_id = %chain_id,
                step_index = response.step_index,
                "Unknown step index, dropping"
            );
            return false;
        };
        if pending.is_resolved(step.step_index) {
            debug!(chain_id = %chain_id, step_index = step.step_index, "Step already resolved, dropping");
            return false;
        }

        // Steps resolve in playlist order; answering a later step forfeits
        // the unanswered ones before it
        let mut skipped: Vec<ChainQteStep> = pending
            .config
            .steps
            .iter()
            .filter(|s| s.step_index < step.step_index && !pending.is_resolved(s.step_index))
            .cloned()
            .collect();
        skipped.sort_by_key(|s| s.step_index);

        let mut used = false;
        for forfeited in &skipped {
            let result = missed_step(forfeited, false);
            pending.record_grade(QteGrade::Fail, forfeited.step_index, &rt.tuning);
            publish_step(rt, pending, result);
            if pending.chain_broken {
                break;
            }
        }
        if !pending.chain_broken {
            let result = resolve_step(pending, rt, field, &step, &response);
            publish_step(rt, pending, result);
            used = true;
        }

        if pending.chain_broken {
            let broken_at_step = pending.broken_at_step.unwrap_or(step.step_index + 1);
            info!(battle_id = %rt.battle_id, chain_id = %chain_id, broken_at_step, "Chain broken");
            rt.outbox.broadcast(ServerMsg::ChainQteBroken {
                chain_id,
                broken_at_step,
                reason: format!("Step {broken_at_step} failed"),
            });
        }

        if pending.is_finished() {
            self.finalize(rt, &chain_id, false);
        }
        used
    }

    /// Apply buffered steps in order, stopping once the chain is finalised.
    /// Returns how many steps were used.
    pub fn process_batch_response(
        &mut self,
        rt: &mut QteRuntime,
        field: &mut Battlefield,
        batch: ChainBatchResponse,
    ) -> usize {
        let chain_id = batch.chain_id;
        let mut applied = 0;
        let mut responses = batch.into_step_responses();
        responses.sort_by_key(|r| r.step_index);
        for response in responses {
            if !self.pending.contains(&chain_id) {
                break;
            }
            if self.process_step_response(rt, field, response) {
                applied += 1;
            }
        }
        applied
    }

    /// Chain-wide expiry: every unresolved step becomes a timed-out FAIL
    pub fn handle_deadline(&mut self, rt: &mut QteRuntime, chain_id: ChainId, handle: TimerHandle) {
        let Some(pending) = self.pending.get_mut(&chain_id) else {
            debug!(battle_id = %rt.battle_id, chain_id = %chain_id, "Deadline for finished chain ignored");
            return;
        };
        if pending.timer != Some(handle) {
            debug!(battle_id = %rt.battle_id, chain_id = %chain_id, "Stale chain deadline ignored");
            return;
        }
        pending.timer = None;

        let missing: Vec<ChainStepResult> = pending
            .config
            .steps
            .iter()
            .filter(|step| !pending.is_resolved(step.step_index))
            .map(|step| missed_step(step, true))
            .collect();

        info!(
            battle_id = %rt.battle_id,
            chain_id = %chain_id,
            missing = missing.len(),
            "Chain QTE timed out"
        );
        pending.step_results.extend(missing);
        self.finalize(rt, &chain_id, true);
    }

    /// Drop every pending chain and cancel its deadline
    pub fn clear(&mut self, rt: &mut QteRuntime) -> usize {
        let drained = self.pending.drain();
        for (_, pending) in &drained {
            if let Some(handle) = pending.timer {
                rt.deadlines.cancel(handle);
            }
        }
        drained.len()
    }

    fn finalize(&mut self, rt: &mut QteRuntime, chain_id: &ChainId, timed_out: bool) {
        let Some(mut done) = self.pending.remove(chain_id) else {
            return;
        };
        if let Some(handle) = done.timer.take() {
            rt.deadlines.cancel(handle);
        }

        let mut step_results = std::mem::take(&mut done.step_results);
        step_results.sort_by_key(|r| r.step_index);

        let total_hits = step_results.iter().filter(|r| r.grade.is_success()).count();
        let total_perfects = step_results
            .iter()
            .filter(|r| r.grade == QteGrade::Perfect)
            .count();
        let total_fails = step_results.len() - total_hits;
        let total_steps = done.config.steps.len();
        let (feedback, feedback_color) =
            chain_feedback(done.chain_broken, total_steps, total_perfects, total_hits, total_fails);

        let result = ChainResult {
            chain_id: done.config.chain_id,
            chain_type: done.config.chain_type,
            caster_id: done.config.caster_id,
            max_combo: longest_success_run(&step_results),
            total_damage: step_results
                .iter()
                .fold(0i32, |total, r| total.saturating_add(r.damage)),
            step_results,
            total_steps,
            total_hits,
            total_perfects,
            total_fails,
            chain_broken: done.chain_broken,
            broken_at_step: done.broken_at_step,
            timed_out,
            feedback: feedback.to_string(),
            feedback_color: feedback_color.to_string(),
        };

        info!(
            battle_id = %rt.battle_id,
            chain_id = %result.chain_id,
            hits = result.total_hits,
            fails = result.total_fails,
            total_damage = result.total_damage,
            "Chain QTE complete"
        );
        rt.outbox.broadcast(ServerMsg::ChainQteComplete {
            result: result.clone(),
        });

        if let Some(tx) = done.completion.take() {
            if tx.send(result).is_err() {
                debug!(chain_id = %chain_id, "Chain completion receiver dropped");
            }
        }
    }
}

fn resolve_step(
    pending: &mut PendingChainQte,
    rt: &QteRuntime,
    field: &mut Battlefield,
    step: &ChainQteStep,
    response: &ChainStepResponse,
) -> ChainStepResult {
    let tuning = &rt.tuning;
    let expected = pending.config.server_base_time + step.offset_ms;
    let window = step.duration / 2 + tuning.tolerance_ms;
    let timing_rejected = response.server_timestamp.abs_diff(expected) > window;

    let grade = if timing_rejected || !step.accepts(response.input) {
        QteGrade::Fail
    } else {
        evaluate_grade(response.input, response.hit_position, &step.zones())
    };

    pending.record_grade(grade, step.step_index, tuning);

    let raw = pending.config.base_damage
        * step.combo_multiplier
        * tuning.chain_multipliers.get(grade)
        * pending.current_combo;
    let amount = raw.round().max(0.0) as i32;

    let mut damage = 0;
    let mut target_killed = false;
    let target_alive = field.unit(&step.target_id).is_some_and(|u| u.is_alive());
    if amount > 0 && target_alive {
        if let Some(report) = field.apply_damage(&step.target_id, amount, pending.config.damage_type) {
            trace!(target_id = %step.target_id, amount, hp_lost = report.hp_lost, "Chain damage applied");
            damage = amount;
            target_killed = report.killed;
        }
    }

    ChainStepResult {
        step_index: step.step_index,
        target_id: step.target_id,
        grade,
        input: response.input,
        hit_position: response.hit_position,
        damage,
        combo: pending.current_combo,
        target_killed,
        timed_out: false,
        timing_rejected,
    }
}

/// FAIL with no input, for a step that expired or was skipped
fn missed_step(step: &ChainQteStep, timed_out: bool) -> ChainStepResult {
    ChainStepResult {
        step_index: step.step_index,
        target_id: step.target_id,
        grade: QteGrade::Fail,
        input: QteInput::None,
        hit_position: 0.0,
        damage: 0,
        combo: 0.0,
        target_killed: false,
        timed_out,
        timing_rejected: false,
    }
}

fn publish_step(rt: &QteRuntime, pending: &mut PendingChainQte, result: ChainStepResult) {
    debug!(
        battle_id = %rt.battle_id,
        chain_id = %pending.config.chain_id,
        step_index = result.step_index,
        grade = ?result.grade,
        damage = result.damage,
        combo = result.combo,
        "Chain step resolved"
    );
    rt.outbox.broadcast(ServerMsg::ChainQteStepResolved {
        chain_id: pending.config.chain_id,
        step_result: result.clone(),
    });
    pending.step_results.push(result);
}

/// Longest run of consecutive non-FAIL steps in step order
fn longest_success_run(results: &[ChainStepResult]) -> usize {
    let mut best = 0;
    let mut run = 0;
    for r in results {
        if r.grade.is_success() {
            run += 1;
            best = best.max(run);
        } else {
            run = 0;
        }
    }
    best
}

fn chain_feedback(
    broken: bool,
    total_steps: usize,
    perfects: usize,
    hits: usize,
    fails: usize,
) -> (&'static str, &'static str) {
    if broken {
        ("CHAIN BROKEN!", "#ff4d4d")
    } else if total_steps > 0 && perfects == total_steps {
        ("FLAWLESS!", "#ffd700")
    } else if fails == 0 {
        ("CHAIN COMPLETE!", "#4caf50")
    } else if hits > fails {
        ("GOOD CHAIN", "#4fc3f7")
    } else {
        ("CHAIN FALTERED", "#9e9e9e")
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use uuid::Uuid;

    use super::*;
    use crate::battle::damage::DamageType;
    use crate::qte::testkit::Harness;
    use crate::qte::types::ChainType;

    const STEP_GAP: u64 = 600;

    fn playlist(h: &Harness, caster: Uuid, targets: &[Uuid], fail_mode: FailMode, base: f64) -> ChainQteConfig {
        let steps = targets
            .iter()
            .enumerate()
            .map(|(i, target_id)| ChainQteStep {
                step_index: i,
                target_id: *target_id,
                offset_ms: i as u64 * STEP_GAP,
                duration: 500,
                hit_zone_size: 25.0,
                perfect_zone_size: 8.0,
                valid_inputs: vec![QteInput::Strike],
                combo_multiplier: 1.0,
            })
            .collect();

        ChainQteConfig {
            chain_id: Uuid::new_v4(),
            battle_id: h.rt.battle_id,
            chain_type: ChainType::Omnislash,
            caster_id: caster,
            responder_owner_id: h.owner_of(caster),
            server_base_time: h.rt.now() + 500,
            fail_mode,
            base_damage: base,
            damage_type: DamageType::Physical,
            steps,
        }
    }

    fn step(config: &ChainQteConfig, index: usize, grade: QteGrade) -> ChainStepResponse {
        let position = match grade {
            QteGrade::Perfect => 50.0,
            QteGrade::Hit => 40.0,
            QteGrade::Fail => 5.0,
        };
        ChainStepResponse {
            chain_id: config.chain_id,
            player_id: config.responder_owner_id,
            step_index: index,
            input: QteInput::Strike,
            hit_position: position,
            server_timestamp: config.server_base_time + config.steps[index].offset_ms + 10,
        }
    }

    struct Fixture {
        h: Harness,
        caster: Uuid,
        targets: Vec<Uuid>,
    }

    fn fixture(targets: usize) -> Fixture {
        let mut h = Harness::new(10, 10);
        let caster = h.spawn("caster", 0, 0);
        let targets = (0..targets)
            .map(|i| h.spawn(&format!("target-{i}"), 2 + i as i32, 3))
            .collect();
        Fixture { h, caster, targets }
    }

    #[test]
    fn initiate_unicasts_playlist_and_arms_chain_deadline() {
        let Fixture { mut h, caster, targets } = fixture(3);
        let config = playlist(&h, caster, &targets, FailMode::Break, 10.0);
        let mut orch = ChainQteOrchestrator::new();

        orch.initiate_chain_qte(&mut h.rt, &h.field, config.clone()).unwrap();

        let owner = h.owner_of(caster);
        let private = h.outbox.unicasts_to(owner);
        assert!(matches!(&private[..], [ServerMsg::ChainQteStart { config: c }] if c.chain_id == config.chain_id));

        let initiated = h.outbox.broadcasts();
        assert!(matches!(
            &initiated[..],
            [ServerMsg::ChainQteInitiated { total_steps: 3, target_ids, .. }] if *target_ids == targets
        ));

        // lead + last offset + last duration + 2 x buffer
        let (_, delay) = h.deadlines.latest_for(DeadlineKey::Chain(config.chain_id)).unwrap();
        assert_eq!(delay, Duration::from_millis(500 + 1200 + 500 + 1000));
    }

    #[test]
    fn empty_chain_is_rejected() {
        let Fixture { mut h, caster, .. } = fixture(0);
        let config = playlist(&h, caster, &[], FailMode::Break, 10.0);
        let mut orch = ChainQteOrchestrator::new();

        let err = orch.initiate_chain_qte(&mut h.rt, &h.field, config).unwrap_err();
        assert_eq!(err, QteError::EmptyChain);
        assert_eq!(h.deadlines.live_count(), 0);
    }

    #[test]
    fn first_step_fail_breaks_chain() {
        let Fixture { mut h, caster, targets } = fixture(3);
        let config = playlist(&h, caster, &targets, FailMode::Break, 10.0);
        let mut orch = ChainQteOrchestrator::new();
        let mut done = orch.initiate_chain_qte(&mut h.rt, &h.field, config.clone()).unwrap();

        assert!(orch.process_step_response(&mut h.rt, &mut h.field, step(&config, 0, QteGrade::Fail)));

        let result = done.try_recv().unwrap();
        assert!(result.chain_broken);
        assert_eq!(result.broken_at_step, Some(1));
        assert_eq!(result.step_results.len(), 1);
        assert_eq!(result.feedback, "CHAIN BROKEN!");
        assert_eq!(orch.pending_count(), 0);
        assert_eq!(h.deadlines.live_count(), 0);

        let broken = h
            .outbox
            .broadcasts()
            .into_iter()
            .any(|m| matches!(m, ServerMsg::ChainQteBroken { broken_at_step: 1, .. }));
        assert!(broken);

        // Later steps for the finished chain go nowhere
        assert!(!orch.process_step_response(&mut h.rt, &mut h.field, step(&config, 1, QteGrade::Hit)));
    }

    #[test]
    fn streaks_build_the_combo_multiplier() {
        let Fixture { mut h, caster, targets } = fixture(3);
        let config = playlist(&h, caster, &targets, FailMode::Combo, 40.0);
        let mut orch = ChainQteOrchestrator::new();
        let mut done = orch.initiate_chain_qte(&mut h.rt, &h.field, config.clone()).unwrap();

        orch.process_step_response(&mut h.rt, &mut h.field, step(&config, 0, QteGrade::Perfect));
        assert!((orch.current_combo(&config.chain_id).unwrap() - 1.15).abs() < 1e-9);
        orch.process_step_response(&mut h.rt, &mut h.field, step(&config, 1, QteGrade::Hit));
        // A HIT keeps the hit streak but ends the perfect streak
        assert!((orch.current_combo(&config.chain_id).unwrap() - 1.2).abs() < 1e-9);
        orch.process_step_response(&mut h.rt, &mut h.field, step(&config, 2, QteGrade::Perfect));

        let result = done.try_recv().unwrap();
        let damage: Vec<i32> = result.step_results.iter().map(|r| r.damage).collect();
        assert_eq!(damage, vec![69, 48, 81]);
        assert_eq!(h.hp(targets[0]), 31);
        assert_eq!(result.total_damage, 198);
        assert_eq!(result.max_combo, 3);
        assert_eq!(result.total_hits, 3);
        assert_eq!(result.total_perfects, 2);
        assert_eq!(result.feedback, "CHAIN COMPLETE!");
        assert_eq!(result.feedback_color, "#4caf50");
    }

    #[test]
    fn combo_mode_resets_multiplier_on_fail() {
        let Fixture { mut h, caster, targets } = fixture(3);
        let config = playlist(&h, caster, &targets, FailMode::Combo, 10.0);
        let mut orch = ChainQteOrchestrator::new();
        let mut done = orch.initiate_chain_qte(&mut h.rt, &h.field, config.clone()).unwrap();

        for (i, grade) in [QteGrade::Hit, QteGrade::Fail, QteGrade::Hit].into_iter().enumerate() {
            orch.process_step_response(&mut h.rt, &mut h.field, step(&config, i, grade));
        }

        let result = done.try_recv().unwrap();
        let combos: Vec<f64> = result.step_results.iter().map(|r| r.combo).collect();
        assert!((combos[0] - 1.1).abs() < 1e-9);
        assert_eq!(combos[1], 1.0);
        assert!((combos[2] - 1.1).abs() < 1e-9);
        assert!(!result.chain_broken);
        assert_eq!(result.total_hits + result.total_fails, result.total_steps);
        assert_eq!(result.max_combo, 1);
        assert_eq!(result.feedback, "GOOD CHAIN");
    }

    #[test]
    fn continue_mode_keeps_multiplier_on_fail() {
        let Fixture { mut h, caster, targets } = fixture(3);
        let config = playlist(&h, caster, &targets, FailMode::Continue, 10.0);
        let mut orch = ChainQteOrchestrator::new();
        let mut done = orch.initiate_chain_qte(&mut h.rt, &h.field, config.clone()).unwrap();

        for (i, grade) in [QteGrade::Hit, QteGrade::Hit, QteGrade::Fail].into_iter().enumerate() {
            orch.process_step_response(&mut h.rt, &mut h.field, step(&config, i, grade));
        }

        let result = done.try_recv().unwrap();
        assert!((result.step_results[2].combo - 1.2).abs() < 1e-9);
        assert_eq!(result.step_results[2].damage, 0);
        assert!(!result.chain_broken);
        assert_eq!(result.max_combo, 2);
    }

    #[test]
    fn step_outside_tolerance_is_forced_to_fail() {
        let Fixture { mut h, caster, targets } = fixture(2);
        let config = playlist(&h, caster, &targets, FailMode::Continue, 10.0);
        let mut orch = ChainQteOrchestrator::new();
        let mut done = orch.initiate_chain_qte(&mut h.rt, &h.field, config.clone()).unwrap();

        // duration/2 + tolerance = 250 + 150
        let expected = config.server_base_time + config.steps[0].offset_ms;
        let mut edge = step(&config, 0, QteGrade::Perfect);
        edge.server_timestamp = expected - 400;
        orch.process_step_response(&mut h.rt, &mut h.field, edge);

        let expected = config.server_base_time + config.steps[1].offset_ms;
        let mut late = step(&config, 1, QteGrade::Perfect);
        late.server_timestamp = expected + 401;
        orch.process_step_response(&mut h.rt, &mut h.field, late);

        let result = done.try_recv().unwrap();
        assert_eq!(result.step_results[0].grade, QteGrade::Perfect);
        assert!(!result.step_results[0].timing_rejected);
        assert_eq!(result.step_results[1].grade, QteGrade::Fail);
        assert!(result.step_results[1].timing_rejected);
    }

    #[test]
    fn invalid_input_fails_the_step() {
        let Fixture { mut h, caster, targets } = fixture(1);
        let config = playlist(&h, caster, &targets, FailMode::Continue, 10.0);
        let mut orch = ChainQteOrchestrator::new();
        let mut done = orch.initiate_chain_qte(&mut h.rt, &h.field, config.clone()).unwrap();

        let mut wrong = step(&config, 0, QteGrade::Perfect);
        wrong.input = QteInput::Block;
        orch.process_step_response(&mut h.rt, &mut h.field, wrong);

        let result = done.try_recv().unwrap();
        assert_eq!(result.step_results[0].grade, QteGrade::Fail);
        assert_eq!(result.feedback, "CHAIN FALTERED");
    }

    #[test]
    fn duplicate_and_foreign_steps_are_dropped() {
        let Fixture { mut h, caster, targets } = fixture(3);
        let config = playlist(&h, caster, &targets, FailMode::Continue, 10.0);
        let mut orch = ChainQteOrchestrator::new();
        orch.initiate_chain_qte(&mut h.rt, &h.field, config.clone()).unwrap();

        assert!(orch.process_step_response(&mut h.rt, &mut h.field, step(&config, 0, QteGrade::Hit)));
        assert!(!orch.process_step_response(&mut h.rt, &mut h.field, step(&config, 0, QteGrade::Perfect)));

        let mut foreign = step(&config, 1, QteGrade::Hit);
        foreign.player_id = Uuid::new_v4();
        assert!(!orch.process_step_response(&mut h.rt, &mut h.field, foreign));
        assert!(!orch.process_step_response(&mut h.rt, &mut h.field, step_beyond(&config)));

        assert_eq!(orch.resolved_steps(&config.chain_id), Some(1));
    }

    fn step_beyond(config: &ChainQteConfig) -> ChainStepResponse {
        let mut response = step(config, 0, QteGrade::Hit);
        response.step_index = config.steps.len() + 4;
        response
    }

    #[test]
    fn timeout_fills_every_missing_step() {
        let Fixture { mut h, caster, targets } = fixture(4);
        let config = playlist(&h, caster, &targets, FailMode::Combo, 10.0);
        let mut orch = ChainQteOrchestrator::new();
        let mut done = orch.initiate_chain_qte(&mut h.rt, &h.field, config.clone()).unwrap();

        orch.process_step_response(&mut h.rt, &mut h.field, step(&config, 0, QteGrade::Hit));

        let (deadline, _) = h.deadlines.latest_for(DeadlineKey::Chain(config.chain_id)).unwrap();
        h.clock.advance(10_000);
        orch.handle_deadline(&mut h.rt, config.chain_id, deadline.handle);

        let result = done.try_recv().unwrap();
        assert!(result.timed_out);
        assert!(!result.chain_broken);
        assert_eq!(result.step_results.len(), 4);
        let indices: Vec<usize> = result.step_results.iter().map(|r| r.step_index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
        let synthetic: Vec<&ChainStepResult> = result.step_results.iter().filter(|r| r.timed_out).collect();
        assert_eq!(synthetic.len(), 3);
        assert!(synthetic.iter().all(|r| r.grade == QteGrade::Fail && r.combo == 0.0 && r.damage == 0));
        assert_eq!(result.total_fails, 3);
        assert_eq!(result.max_combo, 1);

        // Re-delivery of the same deadline is harmless
        orch.handle_deadline(&mut h.rt, config.chain_id, deadline.handle);
        assert_eq!(orch.pending_count(), 0);
    }

    #[test]
    fn answering_ahead_forfeits_skipped_steps() {
        let Fixture { mut h, caster, targets } = fixture(3);
        let config = playlist(&h, caster, &targets, FailMode::Combo, 10.0);
        let mut orch = ChainQteOrchestrator::new();
        let mut done = orch.initiate_chain_qte(&mut h.rt, &h.field, config.clone()).unwrap();

        assert!(orch.process_step_response(&mut h.rt, &mut h.field, step(&config, 1, QteGrade::Hit)));
        assert_eq!(orch.resolved_steps(&config.chain_id), Some(2));
        // The forfeited step cannot be answered afterwards
        assert!(!orch.process_step_response(&mut h.rt, &mut h.field, step(&config, 0, QteGrade::Perfect)));
        assert!((orch.current_combo(&config.chain_id).unwrap() - 1.1).abs() < 1e-9);

        orch.process_step_response(&mut h.rt, &mut h.field, step(&config, 2, QteGrade::Hit));

        let result = done.try_recv().unwrap();
        let skipped = &result.step_results[0];
        assert_eq!(skipped.grade, QteGrade::Fail);
        assert_eq!(skipped.input, QteInput::None);
        assert!(!skipped.timed_out);
        assert_eq!(h.hp(targets[0]), 100);
        assert!((result.step_results[2].combo - 1.2).abs() < 1e-9);
        assert_eq!(result.max_combo, 2);
        assert_eq!(result.total_fails, 1);
    }

    #[test]
    fn skipped_step_breaks_a_break_mode_chain() {
        let Fixture { mut h, caster, targets } = fixture(3);
        let config = playlist(&h, caster, &targets, FailMode::Break, 10.0);
        let mut orch = ChainQteOrchestrator::new();
        let mut done = orch.initiate_chain_qte(&mut h.rt, &h.field, config.clone()).unwrap();

        assert!(!orch.process_step_response(&mut h.rt, &mut h.field, step(&config, 2, QteGrade::Perfect)));

        let result = done.try_recv().unwrap();
        assert!(result.chain_broken);
        assert_eq!(result.broken_at_step, Some(1));
        assert_eq!(result.step_results.len(), 1);
        assert_eq!(h.hp(targets[2]), 100);
    }

    #[test]
    fn unusable_base_damage_is_rejected() {
        let Fixture { mut h, caster, targets } = fixture(2);
        let mut orch = ChainQteOrchestrator::new();

        for base in [f64::NAN, f64::NEG_INFINITY, -5.0] {
            let config = playlist(&h, caster, &targets, FailMode::Break, base);
            let err = orch.initiate_chain_qte(&mut h.rt, &h.field, config).unwrap_err();
            assert_eq!(err, QteError::InvalidDamage);
        }
        assert_eq!(orch.pending_count(), 0);
        assert!(h.outbox.sent().is_empty());
    }

    #[test]
    fn huge_base_damage_saturates_the_total() {
        let Fixture { mut h, caster, targets } = fixture(2);
        let config = playlist(&h, caster, &targets, FailMode::Break, 1e12);
        let mut orch = ChainQteOrchestrator::new();
        let mut done = orch.initiate_chain_qte(&mut h.rt, &h.field, config.clone()).unwrap();

        orch.process_step_response(&mut h.rt, &mut h.field, step(&config, 0, QteGrade::Perfect));
        orch.process_step_response(&mut h.rt, &mut h.field, step(&config, 1, QteGrade::Perfect));

        let result = done.try_recv().unwrap();
        assert!(result.step_results.iter().all(|r| r.damage == i32::MAX));
        assert_eq!(result.total_damage, i32::MAX);
    }

    #[test]
    fn batch_stops_once_chain_breaks() {
        let Fixture { mut h, caster, targets } = fixture(3);
        let config = playlist(&h, caster, &targets, FailMode::Break, 10.0);
        let mut orch = ChainQteOrchestrator::new();
        let mut done = orch.initiate_chain_qte(&mut h.rt, &h.field, config.clone()).unwrap();

        let entries = [QteGrade::Hit, QteGrade::Fail, QteGrade::Perfect]
            .into_iter()
            .enumerate()
            .map(|(i, g)| {
                let s = step(&config, i, g);
                crate::qte::types::BatchStepInput {
                    step_index: s.step_index,
                    input: s.input,
                    hit_position: s.hit_position,
                    server_timestamp: s.server_timestamp,
                }
            })
            .collect();
        let batch = ChainBatchResponse {
            chain_id: config.chain_id,
            player_id: config.responder_owner_id,
            step_results: entries,
        };

        assert_eq!(orch.process_batch_response(&mut h.rt, &mut h.field, batch), 2);

        let result = done.try_recv().unwrap();
        assert_eq!(result.step_results.len(), 2);
        assert_eq!(result.broken_at_step, Some(2));
        assert_eq!(h.hp(targets[2]), 100);
    }

    #[test]
    fn perfect_run_is_flawless_and_can_kill() {
        let Fixture { mut h, caster, targets } = fixture(2);
        let config = playlist(&h, caster, &targets, FailMode::Break, 120.0);
        let mut orch = ChainQteOrchestrator::new();
        let mut done = orch.initiate_chain_qte(&mut h.rt, &h.field, config.clone()).unwrap();

        orch.process_step_response(&mut h.rt, &mut h.field, step(&config, 0, QteGrade::Perfect));
        orch.process_step_response(&mut h.rt, &mut h.field, step(&config, 1, QteGrade::Perfect));

        let result = done.try_recv().unwrap();
        assert_eq!(result.feedback, "FLAWLESS!");
        assert_eq!(result.feedback_color, "#ffd700");
        assert!(result.step_results.iter().all(|r| r.target_killed));
        assert!(!h.field.unit(&targets[0]).unwrap().is_alive());
    }

    #[test]
    fn longest_run_counts_by_step_order() {
        let grades = [
            QteGrade::Hit,
            QteGrade::Fail,
            QteGrade::Perfect,
            QteGrade::Hit,
            QteGrade::Hit,
            QteGrade::Fail,
        ];
        let results: Vec<ChainStepResult> = grades
            .iter()
            .enumerate()
            .map(|(i, g)| ChainStepResult {
                step_index: i,
                target_id: Uuid::nil(),
                grade: *g,
                input: QteInput::Strike,
                hit_position: 50.0,
                damage: 0,
                combo: 1.0,
                target_killed: false,
                timed_out: false,
                timing_rejected: false,
            })
            .collect();
        assert_eq!(longest_success_run(&results), 3);
        assert_eq!(longest_success_run(&[]), 0);
    }
}

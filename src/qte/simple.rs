//! Simple QTE orchestrator: attack phase, defense phase, projectile cascades
//!
//! One exchange lives in one `PendingQte`. The attacker's check fixes the
//! quality of the blow; the defender's check decides how much of it lands.
//! The aggregate is re-keyed to each new `qteId`, so only the newest config
//! of an exchange can ever be answered.

use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::battle::damage::DamageType;
use crate::battle::field::{Battlefield, Direction};
use crate::battle::unit::Unit;
use crate::ws::protocol::ServerMsg;

use super::arena::PendingArena;
use super::deadline::{DeadlineKey, TimerHandle};
use super::params::{self, attack_phase_geometry, defense_phase_geometry};
use super::tuning::QteTuning;
use super::types::{
    ExchangeOutcome, ProjectileTrajectory, QteActionType, QteConfig, QteGrade, QteId, QteInput,
    QtePhase, QteResponse, QteResult,
};
use super::zones::evaluate_grade;
use super::{check_base_damage, live_unit, QteError, QteRuntime};

/// Combat-initiation request from round control or a player command
#[derive(Debug, Clone, Copy)]
pub struct AttackRequest {
    pub attacker_id: Uuid,
    pub target_id: Uuid,
    pub base_damage: f64,
    pub is_magic: bool,
}

/// Server-side state of one in-flight exchange
struct PendingQte {
    config: QteConfig,
    exchange_id: QteId,
    attacker_id: Uuid,
    target_id: Uuid,
    /// Carries the original attack modifier after a cascade
    base_damage: f64,
    damage_type: DamageType,
    phase: QtePhase,
    travel: Direction,
    is_projectile: bool,
    cascade_depth: u32,
    /// Units the projectile has already passed through
    involved: Vec<Uuid>,
    opening: Option<QteResult>,
    /// Attack result in effect for the current defense
    attack_result: Option<QteResult>,
    defenses: Vec<QteResult>,
    total_damage: i32,
    timer: Option<TimerHandle>,
    completion: Option<oneshot::Sender<ExchangeOutcome>>,
}

#[derive(Debug, Clone, Copy)]
struct Graded {
    grade: QteGrade,
    timing_rejected: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DefenseAction {
    Dodge(Direction),
    Block,
    Nothing,
}

impl DefenseAction {
    fn from_input(input: QteInput) -> Self {
        match input {
            QteInput::Block => DefenseAction::Block,
            other => other
                .direction()
                .map(DefenseAction::Dodge)
                .unwrap_or(DefenseAction::Nothing),
        }
    }
}

struct CascadeHop {
    next_target_id: Uuid,
    trajectory: ProjectileTrajectory,
}

/// Two-phase attack/defense orchestrator, one per battle
#[derive(Default)]
pub struct SimpleQteOrchestrator {
    pending: PendingArena<PendingQte>,
}

impl SimpleQteOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, qte_id: &QteId) -> bool {
        self.pending.contains(qte_id)
    }

    pub fn pending_phase(&self, qte_id: &QteId) -> Option<QtePhase> {
        self.pending.get(qte_id).map(|p| p.phase)
    }

    /// Start an exchange: emit the attack-phase config and arm its deadline.
    /// The receiver completes once the exchange (including any cascade) is
    /// fully resolved.
    pub fn initiate_attack(
        &mut self,
        rt: &mut QteRuntime,
        field: &Battlefield,
        request: AttackRequest,
    ) -> Result<oneshot::Receiver<ExchangeOutcome>, QteError> {
        if request.attacker_id == request.target_id {
            return Err(QteError::SelfTarget);
        }
        check_base_damage(request.base_damage)?;
        let attacker = live_unit(field, request.attacker_id)?;
        let target = live_unit(field, request.target_id)?;

        let geometry = attack_phase_geometry(&attacker.attributes, &target.attributes, &rt.tuning);
        let start = rt.now() + rt.tuning.future_delay_ms;
        let config = QteConfig {
            qte_id: Uuid::new_v4(),
            battle_id: rt.battle_id,
            action_type: QteActionType::Attack,
            responder_id: attacker.id,
            responder_owner_id: attacker.owner_id,
            attacker_id: Some(attacker.id),
            target_id: Some(target.id),
            duration: geometry.duration_ms,
            shake_intensity: geometry.shake_intensity,
            hit_zone_size: geometry.hit_zone_size,
            perfect_zone_size: geometry.perfect_zone_size,
            valid_inputs: vec![QteInput::Strike],
            invalid_inputs: Vec::new(),
            server_start_time: start,
            server_end_time: start + geometry.duration_ms,
        };

        let qte_id = config.qte_id;
        let timer = rt.arm_deadline(
            DeadlineKey::Qte(qte_id),
            config.server_end_time,
            rt.tuning.timeout_buffer_ms,
        );
        let (tx, rx) = oneshot::channel();

        let pending = PendingQte {
            config: config.clone(),
            exchange_id: qte_id,
            attacker_id: attacker.id,
            target_id: target.id,
            base_damage: request.base_damage,
            damage_type: DamageType::from_magic(request.is_magic),
            phase: QtePhase::Attack,
            travel: params::attack_direction(attacker.position, target.position),
            is_projectile: !attacker.position.is_adjacent(target.position),
            cascade_depth: 0,
            involved: vec![attacker.id, target.id],
            opening: None,
            attack_result: None,
            defenses: Vec::new(),
            total_damage: 0,
            timer: Some(timer),
            completion: Some(tx),
        };
        self.pending.insert(qte_id, pending);

        info!(
            battle_id = %rt.battle_id,
            qte_id = %qte_id,
            attacker_id = %request.attacker_id,
            target_id = %request.target_id,
            duration_ms = config.duration,
            "Attack QTE started"
        );
        rt.outbox.broadcast(ServerMsg::QteStart { config });

        Ok(rx)
    }

    /// Handle a client reply. Unknown ids and replies from anyone but the
    /// responder's owner are dropped. Returns whether the reply was used.
    pub fn process_response(
        &mut self,
        rt: &mut QteRuntime,
        field: &mut Battlefield,
        response: QteResponse,
    ) -> bool {
        let Some(pending) = self.pending.get(&response.qte_id) else {
            warn!(
                battle_id = %rt.battle_id,
                qte_id = %response.qte_id,
                "Response for unknown or resolved QTE, dropping"
            );
            return false;
        };

        let config = &pending.config;
        if response.battle_id != rt.battle_id
            || response.player_id != config.responder_owner_id
            || response.unit_id != config.responder_id
        {
            warn!(
                battle_id = %rt.battle_id,
                qte_id = %response.qte_id,
                player_id = %response.player_id,
                unit_id = %response.unit_id,
                "Response from non-responder, dropping"
            );
            return false;
        }

        self.resolve(rt, field, response, false);
        true
    }

    /// Deadline expiry: resolve as a NONE input through the normal path
    pub fn handle_deadline(
        &mut self,
        rt: &mut QteRuntime,
        field: &mut Battlefield,
        qte_id: QteId,
        handle: TimerHandle,
    ) {
        let Some(pending) = self.pending.get(&qte_id) else {
            debug!(battle_id = %rt.battle_id, qte_id = %qte_id, "Deadline for resolved QTE ignored");
            return;
        };
        if pending.timer != Some(handle) {
            debug!(battle_id = %rt.battle_id, qte_id = %qte_id, "Stale deadline ignored");
            return;
        }

        let response = QteResponse {
            qte_id,
            battle_id: pending.config.battle_id,
            player_id: pending.config.responder_owner_id,
            unit_id: pending.config.responder_id,
            input: QteInput::None,
            hit_position: 0.0,
            server_timestamp: rt.now(),
        };

        info!(battle_id = %rt.battle_id, qte_id = %qte_id, "QTE timed out");
        self.resolve(rt, field, response, true);
    }

    /// Drop every pending exchange and cancel its deadline. Completion
    /// receivers observe a closed channel.
    pub fn clear(&mut self, rt: &mut QteRuntime) -> usize {
        let drained = self.pending.drain();
        for (_, pending) in &drained {
            if let Some(handle) = pending.timer {
                rt.deadlines.cancel(handle);
            }
        }
        drained.len()
    }

    fn resolve(
        &mut self,
        rt: &mut QteRuntime,
        field: &mut Battlefield,
        response: QteResponse,
        timed_out: bool,
    ) {
        let qte_id = response.qte_id;
        let Some(pending) = self.pending.get_mut(&qte_id) else {
            return;
        };

        // First writer wins: whichever of reply/deadline gets here disarms the other
        if let Some(handle) = pending.timer.take() {
            rt.deadlines.cancel(handle);
        }

        let graded = grade_response(&pending.config, &response, &rt.tuning);

        match pending.phase {
            QtePhase::Attack => {
                match Self::resolve_attack(pending, rt, field, &response, graded, timed_out) {
                    Some(defense_id) => {
                        self.pending.rekey(&qte_id, defense_id);
                    }
                    None => {
                        if let Some(done) = self.pending.remove(&qte_id) {
                            Self::complete(done);
                        }
                    }
                }
            }
            QtePhase::Defense => {
                let hop = Self::resolve_defense(pending, rt, field, &response, graded, timed_out);
                let Some(done) = self.pending.remove(&qte_id) else {
                    return;
                };

                let next = hop.and_then(|hop| {
                    let config = Self::cascade_config(rt, field, &done, &hop)?;
                    Some((hop, config))
                });
                match next {
                    Some((hop, config)) => {
                        let fresh = Self::enter_cascade(done, rt, hop, config);
                        self.pending.insert(fresh.config.qte_id, fresh);
                    }
                    None => Self::complete(done),
                }
            }
        }
    }

    /// Grade the attacker, then swap the aggregate over to a defense config.
    /// Returns the new qteId, or `None` when the target is gone.
    fn resolve_attack(
        pending: &mut PendingQte,
        rt: &mut QteRuntime,
        field: &Battlefield,
        response: &QteResponse,
        graded: Graded,
        timed_out: bool,
    ) -> Option<QteId> {
        let modifier = rt.tuning.attack_multipliers.get(graded.grade);

        let mut result = QteResult::new(&pending.config, graded.grade, response.input, response.hit_position);
        result.attack_modifier = Some(modifier);
        result.timed_out = timed_out;
        result.timing_rejected = graded.timing_rejected;
        result.feedback = attack_feedback(graded, timed_out).to_string();

        debug!(
            battle_id = %rt.battle_id,
            qte_id = %result.qte_id,
            grade = ?result.grade,
            modifier,
            "Attack phase resolved"
        );
        publish_result(rt, &result);
        pending.opening = Some(result.clone());
        pending.attack_result = Some(result);

        let attacker = field.unit(&pending.attacker_id)?;
        let Some(target) = field.unit(&pending.target_id).filter(|t| t.is_alive()) else {
            info!(
                battle_id = %rt.battle_id,
                exchange_id = %pending.exchange_id,
                "Target gone before defense phase"
            );
            return None;
        };

        pending.travel = params::attack_direction(attacker.position, target.position);
        let config = build_defense_config(rt, field, attacker, target, pending.travel);
        let defense_id = config.qte_id;

        pending.timer = Some(rt.arm_deadline(
            DeadlineKey::Qte(defense_id),
            config.server_end_time,
            rt.tuning.timeout_buffer_ms,
        ));
        pending.config = config.clone();
        pending.phase = QtePhase::Defense;

        rt.outbox.broadcast(ServerMsg::QteStart { config });
        Some(defense_id)
    }

    /// Grade the defender, apply damage and side effects. Returns the next
    /// hop when a dodged projectile flies on into another unit.
    fn resolve_defense(
        pending: &mut PendingQte,
        rt: &mut QteRuntime,
        field: &mut Battlefield,
        response: &QteResponse,
        graded: Graded,
        timed_out: bool,
    ) -> Option<CascadeHop> {
        let tuning = &rt.tuning;
        let target_id = pending.target_id;
        let origin = field.unit(&target_id).map(|u| u.position);

        let action = if graded.grade.is_success() {
            DefenseAction::from_input(response.input)
        } else {
            DefenseAction::Nothing
        };
        let defense_modifier = match (action, graded.grade) {
            (DefenseAction::Dodge(_), _) => tuning.dodge_modifier,
            (DefenseAction::Block, QteGrade::Perfect) => tuning.block_perfect_modifier,
            (DefenseAction::Block, _) => tuning.block_hit_modifier,
            (DefenseAction::Nothing, _) => 1.0,
        };
        let attack_modifier = pending
            .attack_result
            .as_ref()
            .and_then(|r| r.attack_modifier)
            .unwrap_or(1.0);
        let amount = (pending.base_damage * attack_modifier * defense_modifier)
            .round()
            .max(0.0) as i32;

        let mut result = QteResult::new(&pending.config, graded.grade, response.input, response.hit_position);
        result.defense_modifier = Some(defense_modifier);
        result.timed_out = timed_out;
        result.timing_rejected = graded.timing_rejected;
        result.damage_dealt = Some(0);

        if amount > 0 {
            if let Some(report) = field.apply_damage(&target_id, amount, pending.damage_type) {
                trace!(target_id = %target_id, amount, hp_lost = report.hp_lost, "Defense damage applied");
                result.damage_dealt = Some(amount);
                result.target_killed = report.killed;
                pending.total_damage = pending.total_damage.saturating_add(amount);
            }
        }

        let mut hop = None;
        if let (DefenseAction::Dodge(dir), Some(from)) = (action, origin) {
            result.dodged = true;
            result.dodge_direction = Some(dir);

            let to = from.step(dir);
            if field.move_unit(&target_id, to) {
                result.new_position = Some(to);
            }
            if graded.grade == QteGrade::Perfect {
                field.grant_perfect_dodge(&target_id, tuning.perfect_dodge_buff_turns);
            }

            if pending.is_projectile && pending.cascade_depth < tuning.max_cascade_depth {
                hop = params::projectile_next_target(
                    field,
                    from,
                    pending.travel,
                    tuning.projectile_range,
                    &pending.involved,
                )
                .map(|(next_target_id, to)| CascadeHop {
                    next_target_id,
                    trajectory: ProjectileTrajectory {
                        from,
                        to,
                        direction: pending.travel,
                    },
                });
                result.cascade_target_id = hop.as_ref().map(|h| h.next_target_id);
            }
        }

        result.feedback = defense_feedback(action, graded, timed_out).to_string();

        debug!(
            battle_id = %rt.battle_id,
            qte_id = %result.qte_id,
            grade = ?result.grade,
            damage = amount,
            dodged = result.dodged,
            "Defense phase resolved"
        );
        publish_result(rt, &result);
        pending.defenses.push(result);

        hop
    }

    fn cascade_config(
        rt: &QteRuntime,
        field: &Battlefield,
        done: &PendingQte,
        hop: &CascadeHop,
    ) -> Option<QteConfig> {
        let attacker = field.unit(&done.attacker_id)?;
        let target = field
            .unit(&hop.next_target_id)
            .filter(|t| t.is_alive())?;
        Some(build_defense_config(rt, field, attacker, target, done.travel))
    }

    /// DEFENSE -> DEFENSE' for the next unit in the projectile's path. The
    /// attack phase is skipped; its quality is folded into the base damage
    /// and a synthetic HIT stands in for it.
    fn enter_cascade(
        done: PendingQte,
        rt: &mut QteRuntime,
        hop: CascadeHop,
        config: QteConfig,
    ) -> PendingQte {
        let previous_qte_id = done.config.qte_id;
        let attack_modifier = done
            .attack_result
            .as_ref()
            .and_then(|r| r.attack_modifier)
            .unwrap_or(1.0);

        let mut carried = QteResult::blank(
            done.exchange_id,
            done.attacker_id,
            QteActionType::Attack,
            QteGrade::Hit,
            QteInput::Strike,
            50.0,
        );
        carried.attack_modifier = Some(1.0);
        carried.feedback = "Cascade".to_string();

        let timer = rt.arm_deadline(
            DeadlineKey::Qte(config.qte_id),
            config.server_end_time,
            rt.tuning.timeout_buffer_ms,
        );

        info!(
            battle_id = %rt.battle_id,
            exchange_id = %done.exchange_id,
            previous_qte_id = %previous_qte_id,
            next_target_id = %hop.next_target_id,
            depth = done.cascade_depth + 1,
            "Projectile cascades"
        );
        rt.outbox.broadcast(ServerMsg::QteCascade {
            previous_qte_id,
            new_config: config.clone(),
            projectile_trajectory: hop.trajectory,
        });

        let mut involved = done.involved;
        involved.push(hop.next_target_id);

        PendingQte {
            config,
            exchange_id: done.exchange_id,
            attacker_id: done.attacker_id,
            target_id: hop.next_target_id,
            base_damage: done.base_damage * attack_modifier,
            damage_type: done.damage_type,
            phase: QtePhase::Defense,
            travel: done.travel,
            is_projectile: true,
            cascade_depth: done.cascade_depth + 1,
            involved,
            opening: done.opening,
            attack_result: Some(carried),
            defenses: done.defenses,
            total_damage: done.total_damage,
            timer: Some(timer),
            completion: done.completion,
        }
    }

    fn complete(done: PendingQte) {
        let outcome = ExchangeOutcome {
            exchange_id: done.exchange_id,
            attacker_id: done.attacker_id,
            attack: done.opening,
            defenses: done.defenses,
            total_damage: done.total_damage,
        };

        info!(
            exchange_id = %outcome.exchange_id,
            total_damage = outcome.total_damage,
            defenders = outcome.defenses.len(),
            "Exchange complete"
        );

        if let Some(tx) = done.completion {
            if tx.send(outcome).is_err() {
                debug!("Exchange completion receiver dropped");
            }
        }
    }
}

fn build_defense_config(
    rt: &QteRuntime,
    field: &Battlefield,
    attacker: &Unit,
    target: &Unit,
    travel: Direction,
) -> QteConfig {
    let geometry = defense_phase_geometry(&attacker.attributes, &target.attributes, &rt.tuning);
    let (valid_inputs, invalid_inputs) = params::defense_inputs(field, target.position, travel);
    let start = rt.now() + rt.tuning.future_delay_ms;

    QteConfig {
        qte_id: Uuid::new_v4(),
        battle_id: rt.battle_id,
        action_type: QteActionType::Defense,
        responder_id: target.id,
        responder_owner_id: target.owner_id,
        attacker_id: Some(attacker.id),
        target_id: Some(target.id),
        duration: geometry.duration_ms,
        shake_intensity: geometry.shake_intensity,
        hit_zone_size: geometry.hit_zone_size,
        perfect_zone_size: geometry.perfect_zone_size,
        valid_inputs,
        invalid_inputs,
        server_start_time: start,
        server_end_time: start + geometry.duration_ms,
    }
}

/// Zone grade, forced to FAIL for unaccepted inputs or (when enabled) a
/// timestamp outside the window plus tolerance
fn grade_response(config: &QteConfig, response: &QteResponse, tuning: &QteTuning) -> Graded {
    let timing_rejected = tuning.enforce_simple_timing
        && response.input != QteInput::None
        && !within_window(config, response.server_timestamp, tuning.tolerance_ms);

    let grade = if timing_rejected || !config.accepts(response.input) {
        QteGrade::Fail
    } else {
        evaluate_grade(response.input, response.hit_position, &config.zones())
    };

    Graded {
        grade,
        timing_rejected,
    }
}

fn within_window(config: &QteConfig, timestamp: u64, tolerance_ms: u64) -> bool {
    timestamp >= config.server_start_time.saturating_sub(tolerance_ms)
        && timestamp <= config.server_end_time.saturating_add(tolerance_ms)
}

fn publish_result(rt: &QteRuntime, result: &QteResult) {
    rt.outbox.broadcast(ServerMsg::QteResolved {
        result: result.clone(),
    });
    if result.timed_out {
        rt.outbox.broadcast(ServerMsg::QteExpired {
            qte_id: result.qte_id,
            responder_id: result.responder_id,
            result: result.clone(),
        });
    }
}

fn attack_feedback(graded: Graded, timed_out: bool) -> &'static str {
    if timed_out {
        return "Too slow!";
    }
    if graded.timing_rejected {
        return "Out of sync!";
    }
    match graded.grade {
        QteGrade::Perfect => "Perfect strike!",
        QteGrade::Hit => "Solid hit",
        QteGrade::Fail => "Glancing blow",
    }
}

fn defense_feedback(action: DefenseAction, graded: Graded, timed_out: bool) -> &'static str {
    if timed_out {
        return "No reaction!";
    }
    if graded.timing_rejected {
        return "Out of sync!";
    }
    match (action, graded.grade) {
        (DefenseAction::Dodge(_), QteGrade::Perfect) => "Perfect dodge!",
        (DefenseAction::Dodge(_), _) => "Dodged",
        (DefenseAction::Block, QteGrade::Perfect) => "Perfect block!",
        (DefenseAction::Block, _) => "Blocked",
        (DefenseAction::Nothing, _) => "Hit taken",
    }
}

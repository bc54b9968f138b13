//! Battle session task
//!
//! Each battle runs as one tokio task that owns the grid, both QTE
//! orchestrators and the deadline registry. Client messages, deadline
//! firings and exchange completions all arrive over channels and are handled
//! one at a time, so no battle state is ever shared.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use parking_lot::RwLock;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::qte::types::{ChainResult, ExchangeOutcome};
use crate::qte::{
    build_chain, AttackRequest, ChainQteOrchestrator, ChainRequest, Deadline, DeadlineKey, Outbox,
    QteError, QteRuntime, QteTuning, SimpleQteOrchestrator, TokioDeadlines,
};
use crate::util::time::ServerClock;
use crate::ws::protocol::{ClientMsg, ServerMsg};

use super::field::{BattleSetup, Battlefield, FieldError};

/// Player message received from WebSocket
#[derive(Debug, Clone)]
pub struct PlayerInput {
    pub user_id: Uuid,
    pub msg: ClientMsg,
    pub received_at: u64,
}

#[derive(Debug)]
pub enum BattleInput {
    Player(PlayerInput),
    /// The player's socket closed
    Disconnected { user_id: Uuid },
    /// Stop the battle and cancel everything pending
    End,
}

/// Outbound message addressed to everyone (`to: None`) or one player
#[derive(Debug, Clone)]
pub struct Envelope {
    pub to: Option<Uuid>,
    pub msg: ServerMsg,
}

impl Envelope {
    pub fn is_for(&self, user_id: Uuid) -> bool {
        self.to.map_or(true, |to| to == user_id)
    }
}

/// Outbox over the battle's broadcast channel; writers filter by recipient
struct ChannelOutbox {
    tx: broadcast::Sender<Envelope>,
}

impl Outbox for ChannelOutbox {
    fn broadcast(&self, msg: ServerMsg) {
        // No subscribers is fine: nobody is watching yet
        let _ = self.tx.send(Envelope { to: None, msg });
    }

    fn unicast(&self, user_id: Uuid, msg: ServerMsg) {
        let _ = self.tx.send(Envelope {
            to: Some(user_id),
            msg,
        });
    }
}

/// Read-only view of a battle for HTTP queries
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BattleSummary {
    pub width: i32,
    pub height: i32,
    pub participants: usize,
    pub units_alive: usize,
    pub pending_qtes: usize,
    pub pending_chains: usize,
    pub ended: bool,
}

/// Handle to a running battle
#[derive(Clone)]
pub struct BattleHandle {
    pub id: Uuid,
    pub input_tx: mpsc::Sender<BattleInput>,
    pub events_tx: broadcast::Sender<Envelope>,
    pub summary: Arc<RwLock<BattleSummary>>,
    pub created_at: DateTime<Utc>,
}

impl BattleHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.events_tx.subscribe()
    }

    pub fn summary(&self) -> BattleSummary {
        self.summary.read().clone()
    }

    pub fn participant_count(&self) -> usize {
        self.summary.read().participants
    }
}

enum Completion {
    Exchange(Result<ExchangeOutcome, oneshot::error::RecvError>),
    Chain(Result<ChainResult, oneshot::error::RecvError>),
}

/// The authoritative battle
pub struct BattleSession {
    id: Uuid,
    field: Battlefield,
    rt: QteRuntime,
    simple: SimpleQteOrchestrator,
    chains: ChainQteOrchestrator,
    rng: ChaCha8Rng,
    participants: HashSet<Uuid>,
    had_participants: bool,
    input_rx: mpsc::Receiver<BattleInput>,
    deadline_rx: mpsc::UnboundedReceiver<Deadline>,
    completions: FuturesUnordered<BoxFuture<'static, Completion>>,
    summary: Arc<RwLock<BattleSummary>>,
}

impl BattleSession {
    /// Create a new battle
    pub fn new(
        id: Uuid,
        setup: BattleSetup,
        tuning: QteTuning,
        clock: Arc<dyn ServerClock>,
    ) -> Result<(Self, BattleHandle), FieldError> {
        let seed = setup.seed.unwrap_or_else(rand::random);
        let field = Battlefield::from_setup(setup)?;

        let (input_tx, input_rx) = mpsc::channel(256);
        let (events_tx, _) = broadcast::channel(256);
        let (deadlines, deadline_rx) = TokioDeadlines::new();
        let summary = Arc::new(RwLock::new(BattleSummary::default()));

        let handle = BattleHandle {
            id,
            input_tx,
            events_tx: events_tx.clone(),
            summary: summary.clone(),
            created_at: Utc::now(),
        };

        let rt = QteRuntime {
            battle_id: id,
            tuning,
            clock,
            outbox: Arc::new(ChannelOutbox { tx: events_tx }),
            deadlines: Box::new(deadlines),
        };

        let session = Self {
            id,
            field,
            rt,
            simple: SimpleQteOrchestrator::new(),
            chains: ChainQteOrchestrator::new(),
            rng: ChaCha8Rng::seed_from_u64(seed),
            participants: HashSet::new(),
            had_participants: false,
            input_rx,
            deadline_rx,
            completions: FuturesUnordered::new(),
            summary,
        };
        session.publish_summary(false);

        Ok((session, handle))
    }

    /// Run the event loop until the battle ends
    pub async fn run(mut self) {
        info!(battle_id = %self.id, units = self.field.alive_count(), "Battle started");

        loop {
            tokio::select! {
                input = self.input_rx.recv() => match input {
                    Some(BattleInput::Player(input)) => self.handle_player(input),
                    Some(BattleInput::Disconnected { user_id }) => self.handle_leave(user_id),
                    Some(BattleInput::End) | None => {
                        info!(battle_id = %self.id, "Battle ended");
                        break;
                    }
                },
                Some(deadline) = self.deadline_rx.recv() => self.handle_deadline(deadline),
                Some(done) = self.completions.next(), if !self.completions.is_empty() => {
                    self.handle_completion(done)
                }
            }

            self.publish_summary(false);

            if self.had_participants && self.participants.is_empty() {
                info!(battle_id = %self.id, "All players left, ending battle");
                break;
            }
        }

        self.shutdown();
    }

    fn shutdown(&mut self) {
        let exchanges = self.simple.clear(&mut self.rt);
        let chains = self.chains.clear(&mut self.rt);
        let timers = self.rt.deadlines.cancel_all();
        self.publish_summary(true);

        info!(
            battle_id = %self.id,
            exchanges,
            chains,
            timers,
            "Battle session stopped"
        );
    }

    fn handle_player(&mut self, input: PlayerInput) {
        let user_id = input.user_id;
        trace!(
            battle_id = %self.id,
            user_id = %user_id,
            queued_ms = self.rt.now().saturating_sub(input.received_at),
            "Player input"
        );
        match input.msg.with_player(user_id) {
            ClientMsg::JoinBattle { battle_id } => self.handle_join(user_id, battle_id),
            ClientMsg::LeaveBattle => self.handle_leave(user_id),
            ClientMsg::Ping { t } => {
                self.rt.outbox.unicast(
                    user_id,
                    ServerMsg::Pong {
                        t,
                        server_time: self.rt.now(),
                    },
                );
            }
            msg if !self.participants.contains(&user_id) => {
                debug!(battle_id = %self.id, user_id = %user_id, ?msg, "Message from non-participant");
                self.rt.outbox.unicast(
                    user_id,
                    ServerMsg::error("not_joined", "Join the battle first"),
                );
            }
            ClientMsg::Attack {
                attacker_id,
                target_id,
                base_damage,
                is_magic,
            } => {
                let request = AttackRequest {
                    attacker_id,
                    target_id,
                    base_damage,
                    is_magic,
                };
                if let Err(e) = self.start_attack(user_id, request) {
                    self.reject(user_id, e);
                }
            }
            ClientMsg::CastChain(request) => {
                if let Err(e) = self.start_chain(user_id, &request) {
                    self.reject(user_id, e);
                }
            }
            ClientMsg::QteResponse(response) => {
                self.simple.process_response(&mut self.rt, &mut self.field, response);
            }
            ClientMsg::ChainStepResponse(response) => {
                self.chains
                    .process_step_response(&mut self.rt, &mut self.field, response);
            }
            ClientMsg::ChainBatchResponse(batch) => {
                self.chains
                    .process_batch_response(&mut self.rt, &mut self.field, batch);
            }
        }
    }

    fn handle_join(&mut self, user_id: Uuid, battle_id: Uuid) {
        if battle_id != self.id {
            self.rt.outbox.unicast(
                user_id,
                ServerMsg::error("wrong_battle", "Connected to a different battle"),
            );
            return;
        }

        self.participants.insert(user_id);
        self.had_participants = true;

        self.rt.outbox.unicast(
            user_id,
            ServerMsg::BattleJoined {
                battle_id: self.id,
                server_time: self.rt.now(),
                width: self.field.width(),
                height: self.field.height(),
                units: self.field.snapshot(),
                obstacles: self.field.obstacles().to_vec(),
            },
        );

        info!(
            battle_id = %self.id,
            user_id = %user_id,
            participants = self.participants.len(),
            "Player joined battle"
        );
    }

    fn handle_leave(&mut self, user_id: Uuid) {
        if self.participants.remove(&user_id) {
            info!(battle_id = %self.id, user_id = %user_id, "Player left battle");
        }
    }

    /// The acting unit must belong to the sender
    fn check_owner(&self, unit_id: Uuid, user_id: Uuid) -> Result<(), QteError> {
        let unit = self
            .field
            .unit(&unit_id)
            .ok_or(QteError::UnknownUnit(unit_id))?;
        if unit.owner_id != user_id {
            return Err(QteError::NotOwner {
                unit_id,
                player_id: user_id,
            });
        }
        Ok(())
    }

    fn start_attack(&mut self, user_id: Uuid, request: AttackRequest) -> Result<(), QteError> {
        self.check_owner(request.attacker_id, user_id)?;
        let rx = self
            .simple
            .initiate_attack(&mut self.rt, &self.field, request)?;
        self.completions
            .push(async move { Completion::Exchange(rx.await) }.boxed());
        Ok(())
    }

    fn start_chain(&mut self, user_id: Uuid, request: &ChainRequest) -> Result<(), QteError> {
        self.check_owner(request.caster_id, user_id)?;
        let config = build_chain(&self.rt, &self.field, &mut self.rng, request)?;
        let rx = self
            .chains
            .initiate_chain_qte(&mut self.rt, &self.field, config)?;
        self.completions
            .push(async move { Completion::Chain(rx.await) }.boxed());
        Ok(())
    }

    fn reject(&self, user_id: Uuid, err: QteError) {
        warn!(battle_id = %self.id, user_id = %user_id, error = %err, "Rejected battle command");
        self.rt
            .outbox
            .unicast(user_id, ServerMsg::error(err.code(), err.to_string()));
    }

    fn handle_deadline(&mut self, deadline: Deadline) {
        self.rt.deadlines.acknowledge(deadline.handle);
        match deadline.key {
            DeadlineKey::Qte(qte_id) => {
                self.simple
                    .handle_deadline(&mut self.rt, &mut self.field, qte_id, deadline.handle)
            }
            DeadlineKey::Chain(chain_id) => {
                self.chains
                    .handle_deadline(&mut self.rt, chain_id, deadline.handle)
            }
        }
    }

    fn handle_completion(&mut self, done: Completion) {
        match done {
            Completion::Exchange(Ok(outcome)) => {
                self.rt
                    .outbox
                    .broadcast(ServerMsg::ExchangeComplete { outcome });
            }
            Completion::Chain(Ok(result)) => {
                debug!(battle_id = %self.id, chain_id = %result.chain_id, "Chain settled");
            }
            Completion::Exchange(Err(_)) | Completion::Chain(Err(_)) => {
                debug!(battle_id = %self.id, "Pending QTE dropped before completion");
                return;
            }
        }

        self.rt.outbox.broadcast(ServerMsg::BattleState {
            units: self.field.snapshot(),
        });
    }

    fn publish_summary(&self, ended: bool) {
        let mut summary = self.summary.write();
        summary.width = self.field.width();
        summary.height = self.field.height();
        summary.participants = self.participants.len();
        summary.units_alive = self.field.alive_count();
        summary.pending_qtes = self.simple.pending_count();
        summary.pending_chains = self.chains.pending_count();
        summary.ended = ended;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::battle::field::GridPos;
    use crate::battle::unit::Unit;
    use crate::qte::types::{QteActionType, QteInput, QteResponse};
    use crate::util::time::SystemClock;

    struct Table {
        handle: BattleHandle,
        events: broadcast::Receiver<Envelope>,
        task: tokio::task::JoinHandle<()>,
        alice: Uuid,
        bob: Uuid,
        knight: Uuid,
        archer: Uuid,
    }

    fn setup(alice: Uuid, bob: Uuid) -> (BattleSetup, Uuid, Uuid) {
        let knight = Unit::new(Uuid::new_v4(), alice, "knight", GridPos::new(1, 1), 100);
        let archer = Unit::new(Uuid::new_v4(), bob, "archer", GridPos::new(2, 1), 100);
        let ids = (knight.id, archer.id);
        let setup = BattleSetup {
            width: 6,
            height: 6,
            units: vec![knight, archer],
            obstacles: Vec::new(),
            seed: Some(3),
        };
        (setup, ids.0, ids.1)
    }

    async fn open_table() -> Table {
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let (battle, knight, archer) = setup(alice, bob);
        let (session, handle) =
            BattleSession::new(Uuid::new_v4(), battle, QteTuning::default(), Arc::new(SystemClock)).unwrap();
        let events = handle.subscribe();
        let task = tokio::spawn(session.run());

        let table = Table {
            handle,
            events,
            task,
            alice,
            bob,
            knight,
            archer,
        };
        send(&table, alice, ClientMsg::JoinBattle { battle_id: table.handle.id }).await;
        send(&table, bob, ClientMsg::JoinBattle { battle_id: table.handle.id }).await;
        table
    }

    async fn send(table: &Table, user_id: Uuid, msg: ClientMsg) {
        table
            .handle
            .input_tx
            .send(BattleInput::Player(PlayerInput {
                user_id,
                msg,
                received_at: 0,
            }))
            .await
            .unwrap();
    }

    /// Next message visible to `user_id` that `pick` accepts
    async fn next_for<T>(
        events: &mut broadcast::Receiver<Envelope>,
        user_id: Uuid,
        mut pick: impl FnMut(ServerMsg) -> Option<T>,
    ) -> T {
        let wait = async {
            loop {
                let envelope = events.recv().await.unwrap();
                if envelope.is_for(user_id) {
                    if let Some(found) = pick(envelope.msg) {
                        return found;
                    }
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(60), wait)
            .await
            .expect("event arrived")
    }

    #[tokio::test(start_paused = true)]
    async fn exchange_runs_through_attack_and_timed_out_defense() {
        let mut t = open_table().await;

        send(
            &t,
            t.alice,
            ClientMsg::Attack {
                attacker_id: t.knight,
                target_id: t.archer,
                base_damage: 20.0,
                is_magic: false,
            },
        )
        .await;

        let attack = next_for(&mut t.events, t.alice, |m| match m {
            ServerMsg::QteStart { config } => Some(config),
            _ => None,
        })
        .await;
        assert_eq!(attack.action_type, QteActionType::Attack);
        assert_eq!(attack.responder_owner_id, t.alice);

        // playerId is filled in from the authenticated sender
        let response = QteResponse {
            qte_id: attack.qte_id,
            battle_id: attack.battle_id,
            player_id: Uuid::nil(),
            unit_id: t.knight,
            input: QteInput::Strike,
            hit_position: 50.0,
            server_timestamp: attack.server_start_time + 50,
        };
        send(&t, t.alice, ClientMsg::QteResponse(response)).await;

        let defense = next_for(&mut t.events, t.bob, |m| match m {
            ServerMsg::QteStart { config } if config.action_type == QteActionType::Defense => Some(config),
            _ => None,
        })
        .await;
        assert_eq!(defense.responder_id, t.archer);

        // Bob never answers; the deadline resolves it
        let outcome = next_for(&mut t.events, t.bob, |m| match m {
            ServerMsg::ExchangeComplete { outcome } => Some(outcome),
            _ => None,
        })
        .await;
        assert_eq!(outcome.total_damage, 30);
        assert!(outcome.defenses[0].timed_out);

        let units = next_for(&mut t.events, t.alice, |m| match m {
            ServerMsg::BattleState { units } => Some(units),
            _ => None,
        })
        .await;
        let archer = units.iter().find(|u| u.id == t.archer).unwrap();
        assert_eq!(archer.hp, 70);
        assert_eq!(t.handle.summary().pending_qtes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn commanding_someone_elses_unit_is_rejected() {
        let mut t = open_table().await;

        send(
            &t,
            t.bob,
            ClientMsg::Attack {
                attacker_id: t.knight,
                target_id: t.archer,
                base_damage: 20.0,
                is_magic: false,
            },
        )
        .await;

        let code = next_for(&mut t.events, t.bob, |m| match m {
            ServerMsg::Error { code, .. } => Some(code),
            _ => None,
        })
        .await;
        assert_eq!(code, "not_owner");
        assert_eq!(t.handle.summary().pending_qtes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn ping_is_answered_privately() {
        let mut t = open_table().await;
        send(&t, t.bob, ClientMsg::Ping { t: 77 }).await;

        let envelope = loop {
            let envelope = t.events.recv().await.unwrap();
            if matches!(envelope.msg, ServerMsg::Pong { .. }) {
                break envelope;
            }
        };
        assert_eq!(envelope.to, Some(t.bob));
        assert!(!envelope.is_for(t.alice));
        assert!(matches!(envelope.msg, ServerMsg::Pong { t: 77, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn end_command_cancels_pending_work() {
        let mut t = open_table().await;
        send(
            &t,
            t.alice,
            ClientMsg::Attack {
                attacker_id: t.knight,
                target_id: t.archer,
                base_damage: 20.0,
                is_magic: false,
            },
        )
        .await;
        next_for(&mut t.events, t.alice, |m| match m {
            ServerMsg::QteStart { config } => Some(config),
            _ => None,
        })
        .await;

        t.handle.input_tx.send(BattleInput::End).await.unwrap();
        t.task.await.unwrap();

        let summary = t.handle.summary();
        assert!(summary.ended);
        assert_eq!(summary.pending_qtes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn battle_stops_when_everyone_leaves() {
        let t = open_table().await;
        send(&t, t.alice, ClientMsg::LeaveBattle).await;
        t.handle
            .input_tx
            .send(BattleInput::Disconnected { user_id: t.bob })
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), t.task)
            .await
            .expect("session exits")
            .unwrap();
        assert!(t.handle.summary().ended);
    }
}

//! Deterministic collaborators for engine tests

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::battle::field::{Battlefield, GridPos};
use crate::battle::unit::{Unit, UnitAttributes};
use crate::util::time::ManualClock;
use crate::ws::protocol::ServerMsg;

use super::deadline::{Deadline, DeadlineKey, DeadlineScheduler, TimerHandle};
use super::tuning::QteTuning;
use super::types::QteConfig;
use super::{Outbox, QteRuntime};

pub const START_MS: u64 = 1_000_000;

#[derive(Debug, Clone)]
pub struct Sent {
    pub to: Option<Uuid>,
    pub msg: ServerMsg,
}

/// Outbox that keeps everything it is asked to send
#[derive(Debug, Default)]
pub struct RecordingOutbox {
    sent: Mutex<Vec<Sent>>,
}

impl RecordingOutbox {
    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().clone()
    }

    pub fn broadcasts(&self) -> Vec<ServerMsg> {
        self.sent
            .lock()
            .iter()
            .filter(|s| s.to.is_none())
            .map(|s| s.msg.clone())
            .collect()
    }

    pub fn unicasts_to(&self, user_id: Uuid) -> Vec<ServerMsg> {
        self.sent
            .lock()
            .iter()
            .filter(|s| s.to == Some(user_id))
            .map(|s| s.msg.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }

    /// Config of the newest `qte:start` or `qte:cascade`
    pub fn last_config(&self) -> Option<QteConfig> {
        self.sent.lock().iter().rev().find_map(|s| match &s.msg {
            ServerMsg::QteStart { config } => Some(config.clone()),
            ServerMsg::QteCascade { new_config, .. } => Some(new_config.clone()),
            _ => None,
        })
    }
}

impl Outbox for RecordingOutbox {
    fn broadcast(&self, msg: ServerMsg) {
        self.sent.lock().push(Sent { to: None, msg });
    }

    fn unicast(&self, user_id: Uuid, msg: ServerMsg) {
        self.sent.lock().push(Sent {
            to: Some(user_id),
            msg,
        });
    }
}

#[derive(Debug, Default)]
struct ManualInner {
    next_id: u64,
    scheduled: Vec<(Deadline, Duration)>,
    live: HashMap<TimerHandle, DeadlineKey>,
}

/// Scheduler that records deadlines; tests fire them by hand
#[derive(Debug, Clone, Default)]
pub struct ManualDeadlines {
    inner: Arc<Mutex<ManualInner>>,
}

impl ManualDeadlines {
    pub fn is_live(&self, handle: TimerHandle) -> bool {
        self.inner.lock().live.contains_key(&handle)
    }

    /// Most recently scheduled deadline for `key`
    pub fn latest_for(&self, key: DeadlineKey) -> Option<(Deadline, Duration)> {
        self.inner
            .lock()
            .scheduled
            .iter()
            .rev()
            .find(|(d, _)| d.key == key)
            .copied()
    }

    pub fn live_count(&self) -> usize {
        self.inner.lock().live.len()
    }
}

impl DeadlineScheduler for ManualDeadlines {
    fn schedule(&mut self, key: DeadlineKey, delay: Duration) -> TimerHandle {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let handle = TimerHandle::new(inner.next_id);
        inner.scheduled.push((Deadline { handle, key }, delay));
        inner.live.insert(handle, key);
        handle
    }

    fn cancel(&mut self, handle: TimerHandle) {
        self.inner.lock().live.remove(&handle);
    }

    fn acknowledge(&mut self, handle: TimerHandle) {
        self.inner.lock().live.remove(&handle);
    }

    fn cancel_all(&mut self) -> usize {
        let mut inner = self.inner.lock();
        let count = inner.live.len();
        inner.live.clear();
        count
    }

    fn outstanding(&self) -> usize {
        self.inner.lock().live.len()
    }
}

/// A runtime wired to manual collaborators plus an empty battlefield
pub struct Harness {
    pub rt: QteRuntime,
    pub clock: Arc<ManualClock>,
    pub outbox: Arc<RecordingOutbox>,
    pub deadlines: ManualDeadlines,
    pub field: Battlefield,
}

impl Harness {
    pub fn new(width: i32, height: i32) -> Self {
        Self::with_tuning(width, height, QteTuning::default())
    }

    pub fn with_tuning(width: i32, height: i32, tuning: QteTuning) -> Self {
        let clock = Arc::new(ManualClock::new(START_MS));
        let outbox = Arc::new(RecordingOutbox::default());
        let deadlines = ManualDeadlines::default();
        let rt = QteRuntime {
            battle_id: Uuid::new_v4(),
            tuning,
            clock: clock.clone(),
            outbox: outbox.clone(),
            deadlines: Box::new(deadlines.clone()),
        };
        let field = Battlefield::new(width, height).expect("valid grid");

        Self {
            rt,
            clock,
            outbox,
            deadlines,
            field,
        }
    }

    /// Place a 100 HP unit with default attributes, owned by a fresh player
    pub fn spawn(&mut self, name: &str, x: i32, y: i32) -> Uuid {
        self.spawn_with(name, x, y, UnitAttributes::default())
    }

    pub fn spawn_with(&mut self, name: &str, x: i32, y: i32, attributes: UnitAttributes) -> Uuid {
        let unit = Unit::new(Uuid::new_v4(), Uuid::new_v4(), name, GridPos::new(x, y), 100)
            .with_attributes(attributes);
        let id = unit.id;
        self.field.add_unit(unit).expect("free cell");
        id
    }

    pub fn owner_of(&self, unit_id: Uuid) -> Uuid {
        self.field.unit(&unit_id).expect("known unit").owner_id
    }

    pub fn hp(&self, unit_id: Uuid) -> i32 {
        self.field.unit(&unit_id).expect("known unit").hp
    }
}

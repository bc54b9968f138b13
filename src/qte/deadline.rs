//! Cancellable per-battle deadline timers
//!
//! Timers never touch battle state. When one expires it posts a `Deadline`
//! message into the battle's event loop, which then races it against client
//! responses in arrival order.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

impl TimerHandle {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }
}

/// What a deadline belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeadlineKey {
    Qte(Uuid),
    Chain(Uuid),
}

/// Posted when a timer expires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    pub handle: TimerHandle,
    pub key: DeadlineKey,
}

pub trait DeadlineScheduler: Send {
    fn schedule(&mut self, key: DeadlineKey, delay: Duration) -> TimerHandle;

    /// No-op for unknown or already fired handles
    fn cancel(&mut self, handle: TimerHandle);

    /// Forget a handle whose `Deadline` has been delivered
    fn acknowledge(&mut self, handle: TimerHandle);

    /// Cancel everything outstanding, returning how many were live
    fn cancel_all(&mut self) -> usize;

    fn outstanding(&self) -> usize;
}

/// tokio-backed scheduler: one sleeping task per deadline
pub struct TokioDeadlines {
    next_id: u64,
    tasks: HashMap<TimerHandle, AbortHandle>,
    fired_tx: mpsc::UnboundedSender<Deadline>,
}

impl TokioDeadlines {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Deadline>) {
        let (fired_tx, fired_rx) = mpsc::unbounded_channel();
        (
            Self {
                next_id: 0,
                tasks: HashMap::new(),
                fired_tx,
            },
            fired_rx,
        )
    }
}

impl DeadlineScheduler for TokioDeadlines {
    fn schedule(&mut self, key: DeadlineKey, delay: Duration) -> TimerHandle {
        self.next_id += 1;
        let handle = TimerHandle::new(self.next_id);
        let tx = self.fired_tx.clone();

        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Deadline { handle, key });
        });
        self.tasks.insert(handle, task.abort_handle());
        handle
    }

    fn cancel(&mut self, handle: TimerHandle) {
        if let Some(task) = self.tasks.remove(&handle) {
            task.abort();
        }
    }

    fn acknowledge(&mut self, handle: TimerHandle) {
        self.tasks.remove(&handle);
    }

    fn cancel_all(&mut self) -> usize {
        let count = self.tasks.len();
        for (_, task) in self.tasks.drain() {
            task.abort();
        }
        if count > 0 {
            debug!(count, "Cancelled outstanding deadlines");
        }
        count
    }

    fn outstanding(&self) -> usize {
        self.tasks.len()
    }
}

impl Drop for TokioDeadlines {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

//! Slot arena with an id index, owned by one orchestrator per battle

use std::collections::HashMap;

use uuid::Uuid;

/// Pending aggregates live in slots; the index maps the current public id to
/// a slot so an aggregate can change ids without moving.
#[derive(Debug)]
pub struct PendingArena<V> {
    slots: Vec<Option<V>>,
    free: Vec<usize>,
    index: HashMap<Uuid, usize>,
}

impl<V> PendingArena<V> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Insert under `key`, replacing any value already stored there
    pub fn insert(&mut self, key: Uuid, value: V) -> usize {
        if let Some(&slot) = self.index.get(&key) {
            self.slots[slot] = Some(value);
            return slot;
        }

        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(value);
                slot
            }
            None => {
                self.slots.push(Some(value));
                self.slots.len() - 1
            }
        };
        self.index.insert(key, slot);
        slot
    }

    pub fn get(&self, key: &Uuid) -> Option<&V> {
        let slot = *self.index.get(key)?;
        self.slots.get(slot)?.as_ref()
    }

    pub fn get_mut(&mut self, key: &Uuid) -> Option<&mut V> {
        let slot = *self.index.get(key)?;
        self.slots.get_mut(slot)?.as_mut()
    }

    pub fn contains(&self, key: &Uuid) -> bool {
        self.index.contains_key(key)
    }

    pub fn remove(&mut self, key: &Uuid) -> Option<V> {
        let slot = self.index.remove(key)?;
        let value = self.slots.get_mut(slot)?.take();
        self.free.push(slot);
        value
    }

    /// Move the value at `old` to `new` in one step. The old id stops
    /// resolving immediately. Returns false if `old` is unknown or `new` is
    /// already taken.
    pub fn rekey(&mut self, old: &Uuid, new: Uuid) -> bool {
        if self.index.contains_key(&new) {
            return false;
        }
        match self.index.remove(old) {
            Some(slot) => {
                self.index.insert(new, slot);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Remove every value
    pub fn drain(&mut self) -> Vec<(Uuid, V)> {
        let entries: Vec<(Uuid, usize)> = self.index.drain().collect();
        let drained = entries
            .into_iter()
            .filter_map(|(key, slot)| self.slots.get_mut(slot)?.take().map(|v| (key, v)))
            .collect();
        self.slots.clear();
        self.free.clear();
        drained
    }
}

impl<V> Default for PendingArena<V> {
    fn default() -> Self {
        Self::new()
    }
}

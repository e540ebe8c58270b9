//! Per-signal instance tables.
//!
//! A signal carries up to `capacity` concurrent instances, each with its
//! own value and a New → Active → Released lifecycle. Instances fed by a
//! map are keyed by the upstream's network-wide instance id; when the
//! table is full the configured [`StealMode`] decides whether an existing
//! instance is evicted.

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::model::{InstanceId, Timetag, Value};

/// What to do when an upstream instance arrives and no local instance is free.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StealMode {
    /// Drop updates for the new instance.
    #[default]
    None,
    /// Evict the instance that was activated first.
    Oldest,
    /// Evict the instance that was activated last.
    Newest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceStatus {
    /// Allocated; no value yet.
    New,
    /// Has received at least one value.
    Active,
    /// Removed from the table.
    Released,
}

#[derive(Debug, Clone)]
pub struct Instance {
    pub id: InstanceId,
    pub status: InstanceStatus,
    pub value: Option<Value>,
    pub time: Timetag,
    /// Activation order, for stealing.
    sequence: u64,
    upstream: Option<u64>,
}

impl Instance {
    /// Network-wide id of the instance feeding this one, if any.
    pub fn upstream(&self) -> Option<u64> {
        self.upstream
    }
}

/// Result of mapping an upstream instance onto the local table.
#[derive(Debug, Clone)]
pub struct Acquired {
    pub id: InstanceId,
    /// A new local instance was allocated.
    pub created: bool,
    /// The instance evicted to make room, already released.
    pub stolen: Option<Instance>,
}

#[derive(Debug, Clone)]
pub struct InstanceTable {
    capacity: usize,
    steal: StealMode,
    active: HashMap<InstanceId, Instance>,
    upstream: HashMap<u64, InstanceId>,
    sequence: u64,
}

impl InstanceTable {
    pub fn new(capacity: usize, steal: StealMode) -> Self {
        Self {
            capacity: capacity.max(1),
            steal,
            active: HashMap::new(),
            upstream: HashMap::new(),
            sequence: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn steal_mode(&self) -> StealMode {
        self.steal
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn get(&self, id: InstanceId) -> Option<&Instance> {
        self.active.get(&id)
    }

    /// Live instances in id order.
    pub fn ids(&self) -> Vec<InstanceId> {
        let mut ids: Vec<InstanceId> = self.active.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Make `id` live for a local owner. Returns `Some(created)` or `None`
    /// when the table is full.
    pub fn activate(&mut self, id: InstanceId) -> Option<bool> {
        if self.active.contains_key(&id) {
            return Some(false);
        }
        if self.active.len() >= self.capacity {
            return None;
        }
        self.insert(id, None);
        Some(true)
    }

    /// Store a value, moving the instance to Active.
    pub fn set(&mut self, id: InstanceId, value: Value, time: Timetag) {
        if let Some(inst) = self.active.get_mut(&id) {
            inst.value = Some(value);
            inst.time = time;
            inst.status = InstanceStatus::Active;
        }
    }

    /// Local instance for an upstream id, allocating the lowest free id or
    /// stealing per the table's mode. `None` if the update must be dropped.
    pub fn acquire_upstream(&mut self, global: u64) -> Option<Acquired> {
        if let Some(id) = self.upstream.get(&global) {
            return Some(Acquired { id: *id, created: false, stolen: None });
        }
        if let Some(id) = self.lowest_free() {
            self.insert(id, Some(global));
            return Some(Acquired { id, created: true, stolen: None });
        }
        let victim = match self.steal {
            StealMode::None => return None,
            StealMode::Oldest => self.active.values().min_by_key(|i| i.sequence)?.id,
            StealMode::Newest => self.active.values().max_by_key(|i| i.sequence)?.id,
        };
        let stolen = self.release(victim);
        self.insert(victim, Some(global));
        Some(Acquired { id: victim, created: true, stolen })
    }

    /// Remove an instance; the returned copy has status Released.
    pub fn release(&mut self, id: InstanceId) -> Option<Instance> {
        let mut inst = self.active.remove(&id)?;
        if let Some(global) = inst.upstream {
            self.upstream.remove(&global);
        }
        inst.status = InstanceStatus::Released;
        Some(inst)
    }

    pub fn release_upstream(&mut self, global: u64) -> Option<Instance> {
        let id = *self.upstream.get(&global)?;
        self.release(id)
    }

    fn lowest_free(&self) -> Option<InstanceId> {
        (0..self.capacity as u64).map(InstanceId).find(|id| !self.active.contains_key(id))
    }

    fn insert(&mut self, id: InstanceId, upstream: Option<u64>) {
        self.sequence += 1;
        if let Some(global) = upstream {
            self.upstream.insert(global, id);
        }
        self.active.insert(id, Instance {
            id,
            status: InstanceStatus::New,
            value: None,
            time: Timetag::ZERO,
            sequence: self.sequence,
            upstream,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle() {
        let mut t = InstanceTable::new(2, StealMode::None);
        assert_eq!(t.activate(InstanceId(5)), Some(true));
        assert_eq!(t.get(InstanceId(5)).map(|i| i.status), Some(InstanceStatus::New));
        t.set(InstanceId(5), Value::from(1.0f32), Timetag::new(1, 0));
        assert_eq!(t.get(InstanceId(5)).map(|i| i.status), Some(InstanceStatus::Active));
        let released = t.release(InstanceId(5)).unwrap();
        assert_eq!(released.status, InstanceStatus::Released);
        assert!(t.get(InstanceId(5)).is_none());
    }

    #[test]
    fn test_capacity_limits_local_activation() {
        let mut t = InstanceTable::new(1, StealMode::None);
        assert_eq!(t.activate(InstanceId(0)), Some(true));
        assert_eq!(t.activate(InstanceId(0)), Some(false));
        assert_eq!(t.activate(InstanceId(1)), None);
    }

    #[test]
    fn test_upstream_allocates_lowest_free() {
        let mut t = InstanceTable::new(3, StealMode::None);
        assert_eq!(t.acquire_upstream(900).map(|a| a.id), Some(InstanceId(0)));
        assert_eq!(t.acquire_upstream(901).map(|a| a.id), Some(InstanceId(1)));
        // Same upstream id maps to the same local instance
        let again = t.acquire_upstream(900).unwrap();
        assert_eq!((again.id, again.created), (InstanceId(0), false));
        assert!(again.stolen.is_none());
        t.release_upstream(900);
        assert_eq!(t.acquire_upstream(902).map(|a| a.id), Some(InstanceId(0)));
    }

    #[test]
    fn test_steal_none_drops() {
        let mut t = InstanceTable::new(1, StealMode::None);
        assert!(t.acquire_upstream(1).is_some());
        assert!(t.acquire_upstream(2).is_none());
    }

    #[test]
    fn test_steal_oldest_and_newest() {
        let mut oldest = InstanceTable::new(2, StealMode::Oldest);
        oldest.acquire_upstream(1);
        oldest.acquire_upstream(2);
        let got = oldest.acquire_upstream(3).unwrap();
        assert_eq!((got.id, got.created), (InstanceId(0), true));
        assert_eq!(got.stolen.and_then(|i| i.upstream()), Some(1));
        // The evicted upstream no longer resolves to that slot
        assert_eq!(oldest.acquire_upstream(3).map(|a| a.created), Some(false));

        let mut newest = InstanceTable::new(2, StealMode::Newest);
        newest.acquire_upstream(1);
        newest.acquire_upstream(2);
        assert_eq!(newest.acquire_upstream(3).map(|a| a.id), Some(InstanceId(1)));
    }
}

//! # Signals
//!
//! A signal is a named, typed, directional endpoint owned by a device.
//! Outgoing signals are written by the application with `set_value`;
//! incoming signals are written by maps and remote sets during `poll`.

pub mod instance;

use std::fmt;
use std::ops::BitOr;

use serde::{Deserialize, Serialize};

use crate::expr::Signature;
use crate::graph::SignalRecord;
use crate::model::{InstanceId, Timetag, Type, Value};
use crate::{Error, Result};

pub use instance::{Acquired, Instance, InstanceStatus, InstanceTable, StealMode};

/// Data flow direction, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Incoming,
    Outgoing,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Incoming => "in",
            Direction::Outgoing => "out",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "in" => Some(Direction::Incoming),
            "out" => Some(Direction::Outgoing),
            _ => None,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle to a signal on its owning device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SignalId(pub u32);

// ============================================================================
// Events and callbacks
// ============================================================================

/// Set of signal event kinds a handler wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventMask(u8);

impl EventMask {
    pub const UPDATE: EventMask = EventMask(0b001);
    pub const INSTANCE_NEW: EventMask = EventMask(0b010);
    pub const INSTANCE_RELEASED: EventMask = EventMask(0b100);
    pub const ALL: EventMask = EventMask(0b111);

    pub fn contains(self, kind: SignalEventKind) -> bool {
        let bit = match kind {
            SignalEventKind::Update => Self::UPDATE,
            SignalEventKind::InstanceNew => Self::INSTANCE_NEW,
            SignalEventKind::InstanceReleased => Self::INSTANCE_RELEASED,
        };
        self.0 & bit.0 != 0
    }
}

impl BitOr for EventMask {
    type Output = EventMask;

    fn bitor(self, rhs: EventMask) -> EventMask {
        EventMask(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEventKind {
    Update,
    InstanceNew,
    InstanceReleased,
}

/// Delivered to signal handlers inside `poll`.
#[derive(Debug)]
pub struct SignalEvent<'a> {
    pub signal: SignalId,
    pub name: &'a str,
    pub kind: SignalEventKind,
    pub instance: InstanceId,
    pub value: Option<&'a Value>,
    pub time: Timetag,
}

pub type SignalHandler = Box<dyn FnMut(&SignalEvent<'_>) + Send>;

// ============================================================================
// SignalSpec
// ============================================================================

/// Everything needed to create a signal.
pub struct SignalSpec {
    pub name: String,
    pub direction: Direction,
    pub ty: Type,
    pub len: usize,
    pub unit: Option<String>,
    pub min: Option<Value>,
    pub max: Option<Value>,
    pub instances: usize,
    pub steal: StealMode,
    handler: Option<(EventMask, SignalHandler)>,
}

impl SignalSpec {
    pub fn new(name: impl Into<String>, direction: Direction, ty: Type, len: usize) -> Self {
        Self {
            name: name.into(),
            direction,
            ty,
            len,
            unit: None,
            min: None,
            max: None,
            instances: 1,
            steal: StealMode::None,
            handler: None,
        }
    }

    pub fn outgoing(name: impl Into<String>, ty: Type, len: usize) -> Self {
        Self::new(name, Direction::Outgoing, ty, len)
    }

    pub fn incoming(name: impl Into<String>, ty: Type, len: usize) -> Self {
        Self::new(name, Direction::Incoming, ty, len)
    }

    pub fn unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Advisory range; values outside it are not clamped.
    pub fn bounds(mut self, min: impl Into<Value>, max: impl Into<Value>) -> Self {
        self.min = Some(min.into());
        self.max = Some(max.into());
        self
    }

    pub fn instances(mut self, count: usize) -> Self {
        self.instances = count;
        self
    }

    pub fn steal(mut self, mode: StealMode) -> Self {
        self.steal = mode;
        self
    }

    pub fn on_event(mut self, mask: EventMask, handler: impl FnMut(&SignalEvent<'_>) + Send + 'static) -> Self {
        self.handler = Some((mask, Box::new(handler)));
        self
    }
}

impl fmt::Debug for SignalSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalSpec")
            .field("name", &self.name)
            .field("direction", &self.direction)
            .field("ty", &self.ty)
            .field("len", &self.len)
            .field("instances", &self.instances)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Signal
// ============================================================================

pub struct Signal {
    id: SignalId,
    name: String,
    direction: Direction,
    ty: Type,
    len: usize,
    unit: Option<String>,
    min: Option<Value>,
    max: Option<Value>,
    pub(crate) instances: InstanceTable,
    handlers: Vec<(EventMask, SignalHandler)>,
}

impl Signal {
    pub(crate) fn from_spec(id: SignalId, spec: SignalSpec) -> Result<Signal> {
        if spec.name.is_empty() || spec.name.starts_with('/') || spec.name.starts_with('@') {
            return Err(Error::Config(format!("invalid signal name '{}'", spec.name)));
        }
        if spec.len == 0 {
            return Err(Error::LengthMismatch { expected: 1, got: 0 });
        }
        // Bounds are stored in the signal's own type
        let coerce_bound = |b: Option<Value>| -> Result<Option<Value>> {
            match b {
                Some(v) if v.len() != spec.len => Err(Error::LengthMismatch { expected: spec.len, got: v.len() }),
                Some(v) => Ok(Some(v.coerce(spec.ty))),
                None => Ok(None),
            }
        };
        let min = coerce_bound(spec.min)?;
        let max = coerce_bound(spec.max)?;
        Ok(Signal {
            id,
            name: spec.name,
            direction: spec.direction,
            ty: spec.ty,
            len: spec.len,
            unit: spec.unit,
            min,
            max,
            instances: InstanceTable::new(spec.instances, spec.steal),
            handlers: spec.handler.into_iter().collect(),
        })
    }

    pub fn id(&self) -> SignalId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn ty(&self) -> Type {
        self.ty
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn unit(&self) -> Option<&str> {
        self.unit.as_deref()
    }

    pub fn min(&self) -> Option<&Value> {
        self.min.as_ref()
    }

    pub fn max(&self) -> Option<&Value> {
        self.max.as_ref()
    }

    pub fn signature(&self) -> Signature {
        Signature::new(self.ty, self.len)
    }

    pub fn instance_capacity(&self) -> usize {
        self.instances.capacity()
    }

    /// Current value of an instance, if it has ever been set.
    pub fn value(&self, instance: InstanceId) -> Option<(&Value, Timetag)> {
        let inst = self.instances.get(instance)?;
        inst.value.as_ref().map(|v| (v, inst.time))
    }

    pub fn add_handler(&mut self, mask: EventMask, handler: SignalHandler) {
        self.handlers.push((mask, handler));
    }

    /// Store a value on an instance, activating it. Returns `Some(created)`
    /// or `None` if no instance slot is free.
    pub(crate) fn store(&mut self, instance: InstanceId, value: Value, time: Timetag) -> Option<bool> {
        let created = self.instances.activate(instance)?;
        self.instances.set(instance, value, time);
        Some(created)
    }

    /// Fire handlers for an event on a live instance.
    pub(crate) fn notify(&mut self, kind: SignalEventKind, instance: InstanceId) {
        let (value, time) = match self.instances.get(instance) {
            Some(inst) => (inst.value.as_ref(), inst.time),
            None => (None, Timetag::ZERO),
        };
        let event = SignalEvent { signal: self.id, name: &self.name, kind, instance, value, time };
        for (mask, handler) in self.handlers.iter_mut() {
            if mask.contains(kind) {
                handler(&event);
            }
        }
    }

    /// Fire InstanceReleased for an instance already removed from the table.
    pub(crate) fn notify_released(&mut self, released: &Instance) {
        let event = SignalEvent {
            signal: self.id,
            name: &self.name,
            kind: SignalEventKind::InstanceReleased,
            instance: released.id,
            value: released.value.as_ref(),
            time: released.time,
        };
        for (mask, handler) in self.handlers.iter_mut() {
            if mask.contains(SignalEventKind::InstanceReleased) {
                handler(&event);
            }
        }
    }

    /// The replicated description of this signal.
    pub(crate) fn record(&self, device: &str) -> SignalRecord {
        SignalRecord {
            device: device.to_string(),
            name: self.name.clone(),
            direction: self.direction,
            ty: self.ty,
            len: self.len,
            unit: self.unit.clone(),
            min: self.min.clone(),
            max: self.max.clone(),
            instances: self.instances.capacity() as u32,
            last_value: None,
        }
    }
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("direction", &self.direction)
            .field("ty", &self.ty)
            .field("len", &self.len)
            .field("instances", &self.instances.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_spec_builder() {
        let spec = SignalSpec::outgoing("freq", Type::Float32, 1)
            .unit("Hz")
            .bounds(20.0f32, 20_000.0f32)
            .instances(4);
        let sig = Signal::from_spec(SignalId(0), spec).unwrap();
        assert_eq!(sig.unit(), Some("Hz"));
        assert_eq!(sig.instance_capacity(), 4);
        assert_eq!(sig.signature(), Signature::new(Type::Float32, 1));
    }

    #[test]
    fn test_bounds_are_coerced_and_checked() {
        let sig = Signal::from_spec(
            SignalId(0),
            SignalSpec::incoming("level", Type::Float64, 1).bounds(0, 10),
        ).unwrap();
        assert_eq!(sig.min(), Some(&Value::from(0.0f64)));

        let err = Signal::from_spec(
            SignalId(0),
            SignalSpec::incoming("pos", Type::Float32, 2).bounds(0.0f32, 1.0f32),
        ).unwrap_err();
        assert!(matches!(err, Error::LengthMismatch { expected: 2, got: 1 }));
    }

    #[test]
    fn test_invalid_names() {
        assert!(Signal::from_spec(SignalId(0), SignalSpec::incoming("", Type::Int32, 1)).is_err());
        assert!(Signal::from_spec(SignalId(0), SignalSpec::incoming("/abs", Type::Int32, 1)).is_err());
        assert!(Signal::from_spec(SignalId(0), SignalSpec::incoming("zero", Type::Int32, 0)).is_err());
    }

    #[test]
    fn test_handlers_respect_mask() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let spec = SignalSpec::incoming("in", Type::Int32, 1)
            .on_event(EventMask::UPDATE, move |e| sink.lock().unwrap().push((e.kind, e.value.cloned())));
        let mut sig = Signal::from_spec(SignalId(1), spec).unwrap();

        sig.store(InstanceId::DEFAULT, Value::from(3), Timetag::new(1, 0));
        sig.notify(SignalEventKind::InstanceNew, InstanceId::DEFAULT);
        sig.notify(SignalEventKind::Update, InstanceId::DEFAULT);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], (SignalEventKind::Update, Some(Value::from(3))));
    }

    #[test]
    fn test_value_absent_until_set() {
        let mut sig = Signal::from_spec(SignalId(0), SignalSpec::incoming("in", Type::Int32, 1)).unwrap();
        assert!(sig.value(InstanceId::DEFAULT).is_none());
        sig.store(InstanceId::DEFAULT, Value::from(9), Timetag::new(5, 0));
        assert_eq!(sig.value(InstanceId::DEFAULT), Some((&Value::from(9), Timetag::new(5, 0))));
    }

    #[test]
    fn test_event_mask_union() {
        let m = EventMask::UPDATE | EventMask::INSTANCE_RELEASED;
        assert!(m.contains(SignalEventKind::Update));
        assert!(m.contains(SignalEventKind::InstanceReleased));
        assert!(!m.contains(SignalEventKind::InstanceNew));
    }
}

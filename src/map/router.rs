//! Endpoint side of maps.
//!
//! Every device with a signal in a map keeps a [`Route`] for it: which of
//! its outgoing signals feed which source slot, and for each local
//! destination the compiled expression plus one evaluation state per
//! upstream instance. Expressions run at the destination unless the map
//! was negotiated to process at the source, in which case the source
//! device evaluates one expression per destination and the destination
//! only stores what arrives.

use std::sync::Arc;

use hashbrown::HashMap;
use tracing::{debug, trace};

use crate::expr::{EvalState, Expression, Signature};
use crate::graph::MapRecord;
use crate::model::{InstanceId, MapId, Timetag, Value};
use crate::signal::{Direction, Signal, SignalEventKind};
use crate::Error;

use super::{MapFailure, MapStatus, ProcessLocation};

/// Local signals by name.
pub(crate) type SignalTable = HashMap<String, Signal>;

/// A local destination of a map.
#[derive(Debug)]
struct DestRoute {
    /// Position in the map's destination list.
    index: usize,
    signal: String,
    expression: Arc<Expression>,
    passthrough: bool,
    /// Keyed by upstream instance id; `0` for singleton traffic.
    states: HashMap<u64, EvalState>,
}

/// Source-side evaluation toward one destination.
#[derive(Debug)]
struct SourceProcessor {
    /// Position in the map's destination list.
    index: usize,
    device: String,
    expression: Arc<Expression>,
    states: HashMap<u64, EvalState>,
}

#[derive(Debug)]
pub(crate) struct Route {
    pub record: MapRecord,
    pub ready: bool,
    /// `(slot, local outgoing signal)` pairs.
    pub sources: Vec<(usize, String)>,
    destinations: Vec<DestRoute>,
    processors: Vec<SourceProcessor>,
}

/// One update leaving a local source signal through a map.
///
/// For destination processing `slot` is the source slot and `value` the
/// raw update; for source processing it is the destination index and the
/// evaluated result.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Emission {
    pub map: MapId,
    pub slot: usize,
    pub devices: Vec<String>,
    /// `None` releases the instance.
    pub value: Option<Value>,
}

#[derive(Debug, Default)]
pub(crate) struct Router {
    routes: HashMap<MapId, Route>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Validate a map definition against the local signals and install it.
    ///
    /// Re-installing an identical definition keeps existing state and
    /// readiness; a changed definition restarts negotiation.
    pub fn install(&mut self, record: &MapRecord, local: &str, signals: &SignalTable) -> Result<(), MapFailure> {
        if let Some(existing) = self.routes.get(&record.id) {
            if same_definition(&existing.record, record) {
                return Ok(());
            }
        }

        let mut sources = Vec::new();
        for (slot, path) in record.sources.iter().enumerate() {
            if path.device != local {
                continue;
            }
            let signal = lookup(signals, &path.signal, Direction::Outgoing, || path.to_string())?;
            if let Some(declared) = record.source_types.get(slot) {
                check_signature(*declared, signal)?;
            }
            sources.push((slot, path.signal.clone()));
        }

        let at_source = record.location == ProcessLocation::Source;
        let text = record.expression.as_deref().unwrap_or("y=x");

        let mut processors = Vec::new();
        if at_source && !sources.is_empty() {
            for (index, path) in record.destinations.iter().enumerate() {
                let output = record
                    .destination_types
                    .get(index)
                    .copied()
                    .ok_or_else(|| MapFailure::UnknownSignal(path.to_string()))?;
                let expression = Expression::compile(text, &record.source_types, output)
                    .map_err(|e| MapFailure::from_error(&e))?;
                processors.push(SourceProcessor {
                    index,
                    device: path.device.clone(),
                    expression: Arc::new(expression),
                    states: HashMap::new(),
                });
            }
        }

        let mut destinations = Vec::new();
        for (index, path) in record.destinations.iter().enumerate() {
            if path.device != local {
                continue;
            }
            let signal = lookup(signals, &path.signal, Direction::Incoming, || path.to_string())?;
            let expression = if at_source {
                // Values arrive evaluated with the announced signature.
                if let Some(declared) = record.destination_types.get(index) {
                    check_signature(*declared, signal)?;
                }
                Expression::identity(signal.signature(), signal.signature())
            } else {
                Expression::compile(text, &record.source_types, signal.signature())
            }
            .map_err(|e| MapFailure::from_error(&e))?;
            destinations.push(DestRoute {
                index,
                signal: path.signal.clone(),
                passthrough: expression.is_passthrough(),
                expression: Arc::new(expression),
                states: HashMap::new(),
            });
        }

        debug!(
            map = %record.id,
            sources = sources.len(),
            destinations = destinations.len(),
            location = record.location.as_str(),
            "route installed"
        );
        let mut record = record.clone();
        record.status = MapStatus::Pending;
        self.routes.insert(record.id, Route { record, ready: false, sources, destinations, processors });
        Ok(())
    }

    /// Apply a `/mapped` announcement for a map this device takes part in.
    /// Returns false if the route does not exist.
    pub fn set_status(&mut self, id: MapId, status: &MapStatus, muted: bool) -> bool {
        match self.routes.get_mut(&id) {
            Some(route) => {
                route.ready = status.is_ready();
                route.record.status = status.clone();
                route.record.muted = muted;
                true
            }
            None => false,
        }
    }

    /// Drop a route, releasing every destination instance it fed.
    pub fn remove(&mut self, id: MapId, signals: &mut SignalTable) -> Option<Route> {
        let route = self.routes.remove(&id)?;
        let singleton = route.record.source_instances.iter().all(|n| *n <= 1);
        for dest in &route.destinations {
            let Some(signal) = signals.get_mut(&dest.signal) else {
                continue;
            };
            for key in dest.states.keys() {
                let released = if singleton || signal.instance_capacity() == 1 {
                    None
                } else {
                    signal.instances.release_upstream(*key)
                };
                if let Some(inst) = released {
                    signal.notify_released(&inst);
                }
            }
        }
        debug!(map = %id, "route removed");
        Some(route)
    }

    /// Remove routes touching any of the given devices or referencing a
    /// signal that no longer exists.
    pub fn retain(&mut self, mut keep: impl FnMut(&MapRecord) -> bool, signals: &mut SignalTable) -> Vec<MapId> {
        let gone: Vec<MapId> = self.routes.values().filter(|r| !keep(&r.record)).map(|r| r.record.id).collect();
        for id in &gone {
            self.remove(*id, signals);
        }
        gone
    }

    /// Turn an update of local outgoing `signal` on device `local` into
    /// what each ready map must carry. Muted maps and maps that do not
    /// scope `local` carry nothing. Evaluation failures of source-processed
    /// maps are returned with the map id and skip only this update.
    pub fn emit(
        &mut self,
        signal: &str,
        local: &str,
        global: u64,
        value: Option<&Value>,
    ) -> (Vec<Emission>, Vec<(MapId, Error)>) {
        let mut out = Vec::new();
        let mut errors = Vec::new();
        let mut ids: Vec<MapId> = self.routes.keys().copied().collect();
        ids.sort();

        for id in ids {
            let Some(route) = self.routes.get_mut(&id) else { continue };
            if !route.ready || route.record.muted {
                continue;
            }
            if !route.record.scopes.iter().any(|s| s == local) {
                trace!(map = %id, device = local, "update out of scope");
                continue;
            }
            let slots: Vec<usize> =
                route.sources.iter().filter(|(_, name)| name == signal).map(|(slot, _)| *slot).collect();

            for slot in slots {
                if route.record.location == ProcessLocation::Destination || route.processors.is_empty() {
                    out.push(Emission {
                        map: id,
                        slot,
                        devices: route.record.destination_devices(),
                        value: value.cloned(),
                    });
                    continue;
                }

                let singleton = route.record.source_instances.get(slot).is_none_or(|n| *n <= 1);
                let key = if singleton { 0 } else { global };
                for proc in route.processors.iter_mut() {
                    let Some(values) = value else {
                        proc.states.remove(&key);
                        out.push(Emission { map: id, slot: proc.index, devices: vec![proc.device.clone()], value: None });
                        continue;
                    };
                    let expression = &proc.expression;
                    let state = proc
                        .states
                        .entry(key)
                        .or_insert_with(|| EvalState::new(expression, id.0 ^ key));
                    let mut scratch = crate::expr::Vector::new();
                    values.write_f64s(&mut scratch);
                    state.push_source(slot, &scratch);
                    if !state.has_all_sources() {
                        continue;
                    }
                    let output = expression.output();
                    let result = if expression.is_passthrough() {
                        values.coerce(output.ty)
                    } else {
                        match expression.evaluate(state) {
                            Ok(Some(v)) => Value::from_f64s(output.ty, &v),
                            Ok(None) => continue,
                            Err(e) => {
                                debug!(map = %id, error = %e, "evaluation at source failed");
                                errors.push((id, e));
                                continue;
                            }
                        }
                    };
                    out.push(Emission {
                        map: id,
                        slot: proc.index,
                        devices: vec![proc.device.clone()],
                        value: Some(result),
                    });
                }
            }
        }
        (out, errors)
    }

    /// Feed one update into a map's local destinations.
    ///
    /// `slot` is a source slot, or a destination index for maps processed
    /// at the source. `values == None` releases the upstream instance.
    /// Updates for unknown or not-yet-ready maps are dropped. Evaluation
    /// failures are returned for reporting and skip only this update.
    pub fn deliver(
        &mut self,
        id: MapId,
        slot: usize,
        global: u64,
        time: Timetag,
        values: Option<&Value>,
        signals: &mut SignalTable,
    ) -> Vec<Error> {
        let mut errors = Vec::new();
        let Some(route) = self.routes.get_mut(&id) else {
            trace!(map = %id, "data for unknown map dropped");
            return errors;
        };
        if !route.ready {
            trace!(map = %id, "data for pending map dropped");
            return errors;
        }
        let at_source = route.record.location == ProcessLocation::Source;
        let upstream_singleton = if at_source {
            route.record.source_instances.iter().all(|n| *n <= 1)
        } else {
            route.record.source_instances.get(slot).is_none_or(|n| *n <= 1)
        };

        for dest in route.destinations.iter_mut() {
            if at_source && dest.index != slot {
                continue;
            }
            let Some(signal) = signals.get_mut(&dest.signal) else {
                continue;
            };
            let singleton = upstream_singleton || signal.instance_capacity() == 1;
            let key = if singleton { 0 } else { global };

            let Some(values) = values else {
                if let Some(state) = dest.states.get_mut(&key) {
                    state.reset();
                }
                let released = if singleton {
                    signal.instances.release(InstanceId::DEFAULT)
                } else {
                    dest.states.remove(&key);
                    signal.instances.release_upstream(global)
                };
                if let Some(inst) = released {
                    signal.notify_released(&inst);
                }
                continue;
            };

            let instance = if singleton {
                InstanceId::DEFAULT
            } else {
                let Some(acquired) = signal.instances.acquire_upstream(global) else {
                    trace!(map = %id, signal = %dest.signal, "no free instance, update dropped");
                    continue;
                };
                if let Some(stolen) = acquired.stolen {
                    if let Some(old) = stolen.upstream() {
                        dest.states.remove(&old);
                    }
                    signal.notify_released(&stolen);
                }
                if acquired.created {
                    signal.notify(SignalEventKind::InstanceNew, acquired.id);
                }
                acquired.id
            };

            // One state per live upstream instance; `remove` releases by
            // these keys.
            let expression = &dest.expression;
            let state = dest
                .states
                .entry(key)
                .or_insert_with(|| EvalState::new(expression, id.0 ^ key));
            let out = if at_source || dest.passthrough {
                values.coerce(signal.ty())
            } else {
                let mut scratch = crate::expr::Vector::new();
                values.write_f64s(&mut scratch);
                state.push_source(slot, &scratch);
                if !state.has_all_sources() {
                    continue;
                }
                match expression.evaluate(state) {
                    Ok(Some(v)) => Value::from_f64s(signal.ty(), &v),
                    Ok(None) => continue,
                    Err(e) => {
                        debug!(map = %id, signal = %dest.signal, error = %e, "evaluation failed");
                        errors.push(e);
                        continue;
                    }
                }
            };

            match signal.store(instance, out, time) {
                Some(created) => {
                    if created {
                        signal.notify(SignalEventKind::InstanceNew, instance);
                    }
                    signal.notify(SignalEventKind::Update, instance);
                }
                None => trace!(map = %id, signal = %dest.signal, "instance unavailable"),
            }
        }
        errors
    }
}

fn lookup<'a>(
    signals: &'a SignalTable,
    name: &str,
    expected: Direction,
    path: impl Fn() -> String,
) -> Result<&'a Signal, MapFailure> {
    let signal = signals.get(name).ok_or_else(|| MapFailure::UnknownSignal(path()))?;
    if signal.direction() != expected {
        return Err(MapFailure::InvalidDirection { signal: path(), expected });
    }
    Ok(signal)
}

fn check_signature(declared: Signature, signal: &Signal) -> Result<(), MapFailure> {
    if declared.ty != signal.ty() {
        return Err(MapFailure::TypeMismatch {
            expected: signal.ty().name().into(),
            got: declared.ty.name().into(),
        });
    }
    if declared.len != signal.len() {
        return Err(MapFailure::LengthMismatch { expected: signal.len(), got: declared.len });
    }
    Ok(())
}

/// Equal up to negotiation status.
fn same_definition(a: &MapRecord, b: &MapRecord) -> bool {
    a.sources == b.sources
        && a.destinations == b.destinations
        && a.source_types == b.source_types
        && a.source_instances == b.source_instances
        && a.destination_types == b.destination_types
        && a.mode == b.mode
        && a.expression == b.expression
        && a.muted == b.muted
        && a.location == b.location
        && a.scopes == b.scopes
}

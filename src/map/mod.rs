//! # Maps
//!
//! A map connects one or more source signals to one or more destination
//! signals through an expression. The device that creates a map owns it:
//! it resolves the endpoints in its graph, pushes the definition to every
//! endpoint device, and counts acknowledgements until the map is ready.
//!
//! ```text
//! Unresolved ──push──▶ Pending ──all acks ok──▶ Ready ──release──▶ Released
//!      ▲                  │
//!      └──── endpoint ────┴──any ack failed──▶ Failed(kind)
//!            vanished
//! ```
//!
//! Endpoint devices run the data path in [`router`].

pub mod router;

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::expr::{self, Expression, Signature};
use crate::graph::{Graph, MapRecord};
use crate::model::{MapId, SignalPath, Value};
use crate::signal::Direction;
use crate::{Error, Result};

// ============================================================================
// Mode, status and failures
// ============================================================================

/// How a map transforms its sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MapMode {
    /// Identity copy with type coercion.
    #[default]
    Raw,
    Expression,
    /// Legacy keyed mode, rewritten at push time into a `linear()` call
    /// over the endpoint bounds.
    Linear,
}

impl MapMode {
    pub fn as_str(self) -> &'static str {
        match self {
            MapMode::Raw => "raw",
            MapMode::Expression => "expression",
            MapMode::Linear => "linear",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "raw" => Some(MapMode::Raw),
            "expression" | "expr" => Some(MapMode::Expression),
            "linear" => Some(MapMode::Linear),
            _ => None,
        }
    }
}

/// Where a map's expression is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ProcessLocation {
    /// At the device holding the sources. Only possible when every source
    /// lives on one device; otherwise the map falls back to `Destination`.
    Source,
    #[default]
    Destination,
}

impl ProcessLocation {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessLocation::Source => "source",
            ProcessLocation::Destination => "destination",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "source" | "src" => Some(ProcessLocation::Source),
            "destination" | "dst" => Some(ProcessLocation::Destination),
            _ => None,
        }
    }
}

/// Why an endpoint refused a map definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MapFailure {
    LengthMismatch { expected: usize, got: usize },
    TypeMismatch { expected: String, got: String },
    ExpressionSyntax { position: usize, message: String },
    UnknownSignal(String),
    InvalidDirection { signal: String, expected: Direction },
}

impl MapFailure {
    /// Short kind name used on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            MapFailure::LengthMismatch { .. } => "length",
            MapFailure::TypeMismatch { .. } => "type",
            MapFailure::ExpressionSyntax { .. } => "syntax",
            MapFailure::UnknownSignal(_) => "unknown",
            MapFailure::InvalidDirection { .. } => "direction",
        }
    }

    /// Classify a compile or validation error. Errors with no negotiation
    /// meaning are reported as an unknown signal.
    pub fn from_error(err: &Error) -> MapFailure {
        match err {
            Error::LengthMismatch { expected, got } => {
                MapFailure::LengthMismatch { expected: *expected, got: *got }
            }
            Error::TypeMismatch { expected, got } => {
                MapFailure::TypeMismatch { expected: expected.clone(), got: got.clone() }
            }
            Error::ExpressionSyntax { position, message } => {
                MapFailure::ExpressionSyntax { position: *position, message: message.clone() }
            }
            Error::InvalidDirection { signal, expected } => {
                MapFailure::InvalidDirection { signal: signal.clone(), expected: *expected }
            }
            Error::NotFound(what) => MapFailure::UnknownSignal(what.clone()),
            other => MapFailure::UnknownSignal(other.to_string()),
        }
    }
}

impl From<MapFailure> for Error {
    fn from(f: MapFailure) -> Error {
        match f {
            MapFailure::LengthMismatch { expected, got } => Error::LengthMismatch { expected, got },
            MapFailure::TypeMismatch { expected, got } => Error::TypeMismatch { expected, got },
            MapFailure::ExpressionSyntax { position, message } => {
                Error::ExpressionSyntax { position, message }
            }
            MapFailure::UnknownSignal(what) => Error::NotFound(what),
            MapFailure::InvalidDirection { signal, expected } => {
                Error::InvalidDirection { signal, expected }
            }
        }
    }
}

impl fmt::Display for MapFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let err: Error = self.clone().into();
        write!(f, "{err}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MapStatus {
    /// Waiting for every endpoint to appear in the graph.
    #[default]
    Unresolved,
    /// Definition sent; waiting for endpoint acknowledgements.
    Pending,
    Ready,
    /// Negotiation failed; the map never carries data.
    Failed(MapFailure),
    Released,
}

impl MapStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, MapStatus::Ready)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MapStatus::Unresolved => "unresolved",
            MapStatus::Pending => "pending",
            MapStatus::Ready => "ready",
            MapStatus::Failed(_) => "failed",
            MapStatus::Released => "released",
        }
    }
}

// ============================================================================
// MapSpec
// ============================================================================

/// What a map connects and how. Built by the caller and handed to
/// [`Device::new_map`](crate::Device::new_map).
#[derive(Debug, Clone, PartialEq)]
pub struct MapSpec {
    pub sources: Vec<SignalPath>,
    pub destinations: Vec<SignalPath>,
    pub mode: MapMode,
    pub expression: Option<String>,
    pub muted: bool,
    pub location: ProcessLocation,
    /// Devices whose instance updates propagate through the map. Starts as
    /// the source devices.
    pub scopes: Vec<String>,
}

impl MapSpec {
    pub fn new(
        sources: impl IntoIterator<Item = SignalPath>,
        destinations: impl IntoIterator<Item = SignalPath>,
    ) -> Self {
        let sources: Vec<SignalPath> = sources.into_iter().collect();
        let mut scopes: Vec<String> = Vec::new();
        for p in &sources {
            if !scopes.contains(&p.device) {
                scopes.push(p.device.clone());
            }
        }
        Self {
            sources,
            destinations: destinations.into_iter().collect(),
            mode: MapMode::Raw,
            expression: None,
            muted: false,
            location: ProcessLocation::Destination,
            scopes,
        }
    }

    /// One-to-one map from `device/signal` style paths.
    pub fn between(source: &str, destination: &str) -> Result<Self> {
        Ok(Self::new([source.parse()?], [destination.parse()?]))
    }

    pub fn expression(mut self, text: impl Into<String>) -> Self {
        self.mode = MapMode::Expression;
        self.expression = Some(text.into());
        self
    }

    pub fn linear(mut self) -> Self {
        self.mode = MapMode::Linear;
        self.expression = None;
        self
    }

    pub fn muted(mut self, muted: bool) -> Self {
        self.muted = muted;
        self
    }

    pub fn process_at(mut self, location: ProcessLocation) -> Self {
        self.location = location;
        self
    }

    /// Replace the propagation scopes.
    pub fn scopes<S: Into<String>>(mut self, devices: impl IntoIterator<Item = S>) -> Self {
        self.scopes = devices.into_iter().map(Into::into).collect();
        self
    }

    fn validate(&self) -> Result<()> {
        if self.sources.is_empty() || self.destinations.is_empty() {
            return Err(Error::Config("a map needs at least one source and one destination".into()));
        }
        if self.sources.len() > 8 {
            return Err(Error::Config("a map takes at most 8 sources".into()));
        }
        if self.mode == MapMode::Expression {
            let text = self.expression.as_deref().unwrap_or("");
            expr::check_syntax(text)?;
        }
        Ok(())
    }
}

// ============================================================================
// Map (creator side)
// ============================================================================

pub type MapErrorHandler = Box<dyn FnMut(MapId, &Error) + Send>;

/// Progress of a pushed map after an acknowledgement arrives.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum AckProgress {
    Waiting,
    Ready,
    Failed(MapFailure),
    /// Stale or unexpected acknowledgement.
    Ignored,
}

/// A map owned by the local device.
pub struct Map {
    id: MapId,
    spec: MapSpec,
    status: MapStatus,
    /// Definition most recently sent to the endpoints.
    pub(crate) record: Option<MapRecord>,
    pub(crate) endpoints: Vec<String>,
    pub(crate) acked: Vec<String>,
    pub(crate) last_sent: Option<Instant>,
    /// Set by `push`; unpushed maps are never resolved.
    pub(crate) pushed: bool,
    /// Removal broadcasts still owed after a release.
    pub(crate) unmap_repeats: u8,
    error_handler: Option<MapErrorHandler>,
}

impl Map {
    pub(crate) fn new(id: MapId, spec: MapSpec) -> Result<Map> {
        spec.validate()?;
        Ok(Map {
            id,
            spec,
            status: MapStatus::Unresolved,
            record: None,
            endpoints: Vec::new(),
            acked: Vec::new(),
            last_sent: None,
            pushed: false,
            unmap_repeats: 0,
            error_handler: None,
        })
    }

    pub fn id(&self) -> MapId {
        self.id
    }

    pub fn spec(&self) -> &MapSpec {
        &self.spec
    }

    pub fn status(&self) -> &MapStatus {
        &self.status
    }

    pub fn is_ready(&self) -> bool {
        self.status.is_ready()
    }

    pub fn sources(&self) -> &[SignalPath] {
        &self.spec.sources
    }

    pub fn destinations(&self) -> &[SignalPath] {
        &self.spec.destinations
    }

    pub fn mode(&self) -> MapMode {
        self.spec.mode
    }

    /// The expression actually sent, which for linear maps is the
    /// generated `linear()` call.
    pub fn expression(&self) -> Option<&str> {
        match &self.record {
            Some(r) => r.expression.as_deref(),
            None => self.spec.expression.as_deref(),
        }
    }

    pub fn is_muted(&self) -> bool {
        self.spec.muted
    }

    /// Requested processing location. The negotiated one is in the
    /// announced record.
    pub fn location(&self) -> ProcessLocation {
        self.spec.location
    }

    pub fn scopes(&self) -> &[String] {
        &self.spec.scopes
    }

    /// Replace the expression. Takes effect on the next push.
    pub fn set_expression(&mut self, text: impl Into<String>) -> Result<()> {
        let text = text.into();
        expr::check_syntax(&text)?;
        self.spec.mode = MapMode::Expression;
        self.spec.expression = Some(text);
        Ok(())
    }

    /// Muted maps keep their negotiated state but carry no data. Takes
    /// effect on the next push.
    pub fn set_muted(&mut self, muted: bool) {
        self.spec.muted = muted;
    }

    /// Takes effect on the next push.
    pub fn set_location(&mut self, location: ProcessLocation) {
        self.spec.location = location;
    }

    /// Let instance updates from `device` propagate. Takes effect on the
    /// next push.
    pub fn add_scope(&mut self, device: &str) {
        if !self.spec.scopes.iter().any(|s| s == device) {
            self.spec.scopes.push(device.to_string());
        }
    }

    /// Takes effect on the next push.
    pub fn remove_scope(&mut self, device: &str) {
        self.spec.scopes.retain(|s| s != device);
    }

    /// Called with runtime evaluation errors and negotiation failures.
    pub fn on_error(&mut self, handler: impl FnMut(MapId, &Error) + Send + 'static) {
        self.error_handler = Some(Box::new(handler));
    }

    pub(crate) fn report(&mut self, err: &Error) {
        if let Some(handler) = self.error_handler.as_mut() {
            handler(self.id, err);
        }
    }

    pub(crate) fn set_status(&mut self, status: MapStatus) {
        self.status = status;
    }

    /// Restart negotiation from scratch.
    pub(crate) fn reset(&mut self) {
        self.status = MapStatus::Unresolved;
        self.record = None;
        self.endpoints.clear();
        self.acked.clear();
        self.last_sent = None;
    }

    /// Try to resolve every endpoint in `graph` and build the definition
    /// to send.
    ///
    /// `Ok(None)` means some endpoint is not known yet. `Err` means the
    /// endpoints are known but can never form this map; the status is
    /// already `Failed`.
    pub(crate) fn resolve(&mut self, graph: &Graph, creator: &str) -> std::result::Result<Option<MapRecord>, MapFailure> {
        let mut sources = Vec::with_capacity(self.spec.sources.len());
        for path in &self.spec.sources {
            match graph.signal(path) {
                Some(s) => sources.push(s),
                None => return Ok(None),
            }
        }
        let mut destinations = Vec::with_capacity(self.spec.destinations.len());
        for path in &self.spec.destinations {
            match graph.signal(path) {
                Some(s) => destinations.push(s),
                None => return Ok(None),
            }
        }

        let check = || -> std::result::Result<MapRecord, MapFailure> {
            for s in &sources {
                if s.direction != Direction::Outgoing {
                    return Err(MapFailure::InvalidDirection {
                        signal: s.path().to_string(),
                        expected: Direction::Outgoing,
                    });
                }
            }
            for d in &destinations {
                if d.direction != Direction::Incoming {
                    return Err(MapFailure::InvalidDirection {
                        signal: d.path().to_string(),
                        expected: Direction::Incoming,
                    });
                }
            }

            let source_types: Vec<Signature> = sources.iter().map(|s| s.signature()).collect();
            let (mode, expression) = match self.spec.mode {
                MapMode::Raw => (MapMode::Raw, None),
                MapMode::Expression => (MapMode::Expression, self.spec.expression.clone()),
                MapMode::Linear => match linear_expression(
                    (sources[0].min.as_ref(), sources[0].max.as_ref()),
                    (destinations[0].min.as_ref(), destinations[0].max.as_ref()),
                ) {
                    Some(text) => (MapMode::Expression, Some(text)),
                    None => (MapMode::Raw, None),
                },
            };
            let single_source_device = sources.iter().all(|s| s.device == sources[0].device);
            let location = match self.spec.location {
                ProcessLocation::Source if single_source_device => ProcessLocation::Source,
                _ => ProcessLocation::Destination,
            };

            // Fail fast on what the endpoints would reject.
            for d in &destinations {
                let text = expression.as_deref().unwrap_or("y=x");
                Expression::compile(text, &source_types, d.signature())
                    .map_err(|e| MapFailure::from_error(&e))?;
            }

            Ok(MapRecord {
                id: self.id,
                creator: creator.to_string(),
                sources: self.spec.sources.clone(),
                destinations: self.spec.destinations.clone(),
                source_types,
                source_instances: sources.iter().map(|s| s.instances).collect(),
                destination_types: destinations.iter().map(|d| d.signature()).collect(),
                mode,
                expression,
                muted: self.spec.muted,
                location,
                scopes: self.spec.scopes.clone(),
                status: MapStatus::Pending,
            })
        };

        match check() {
            Ok(record) => {
                self.endpoints = record.endpoint_devices();
                self.acked.clear();
                self.record = Some(record.clone());
                self.status = MapStatus::Pending;
                Ok(Some(record))
            }
            Err(failure) => {
                self.fail(failure.clone());
                Err(failure)
            }
        }
    }

    /// Account for one endpoint acknowledgement.
    pub(crate) fn on_ack(&mut self, device: &str, outcome: std::result::Result<(), MapFailure>) -> AckProgress {
        if self.status != MapStatus::Pending || !self.endpoints.iter().any(|e| e == device) {
            return AckProgress::Ignored;
        }
        match outcome {
            Err(failure) => {
                self.fail(failure.clone());
                AckProgress::Failed(failure)
            }
            Ok(()) => {
                if !self.acked.iter().any(|a| a == device) {
                    self.acked.push(device.to_string());
                }
                if self.acked.len() == self.endpoints.len() {
                    self.status = MapStatus::Ready;
                    if let Some(r) = self.record.as_mut() {
                        r.status = MapStatus::Ready;
                    }
                    AckProgress::Ready
                } else {
                    AckProgress::Waiting
                }
            }
        }
    }

    pub(crate) fn fail(&mut self, failure: MapFailure) {
        warn!(map = %self.id, reason = %failure, "map negotiation failed");
        let err: Error = failure.clone().into();
        self.status = MapStatus::Failed(failure);
        self.report(&err);
    }
}

impl fmt::Debug for Map {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Map")
            .field("id", &self.id)
            .field("spec", &self.spec)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// `y=linear(x,smin,smax,dmin,dmax)` from endpoint bounds, or `None` if any
/// bound is missing.
fn linear_expression(src: (Option<&Value>, Option<&Value>), dst: (Option<&Value>, Option<&Value>)) -> Option<String> {
    let (Some(smin), Some(smax)) = src else { return None };
    let (Some(dmin), Some(dmax)) = dst else { return None };
    Some(format!(
        "y=linear(x,{},{},{},{})",
        bound_literal(smin),
        bound_literal(smax),
        bound_literal(dmin),
        bound_literal(dmax)
    ))
}

fn bound_literal(v: &Value) -> String {
    let parts: Vec<String> = v.iter_f64().map(|x| format!("{x:?}")).collect();
    if parts.len() == 1 {
        parts.into_iter().collect()
    } else {
        format!("[{}]", parts.join(","))
    }
}

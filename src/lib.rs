//! # libmapper-rs: Distributed Signal Mapping
//!
//! Devices on a LAN announce typed, directional signals and connect them
//! with maps that convert values through small expressions. There is no
//! central server: every device keeps its own replica of the network graph
//! and negotiates maps peer to peer.
//!
//! ## Design Principles
//!
//! 1. **Poll-driven**: all network work and every callback runs inside
//!    [`Device::poll`] on the caller's thread
//! 2. **Plain records**: `Value`, `Timetag` and graph records cross all boundaries
//! 3. **Parser owns nothing**: expression text → AST is a pure function
//! 4. **Transport-agnostic**: device logic runs unchanged over UDP multicast
//!    or an in-process loopback network
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use libmapper_rs::{Device, DeviceConfig, MapSpec, SignalSpec, Type};
//!
//! # fn example() -> libmapper_rs::Result<()> {
//! let mut synth = Device::new("synth", DeviceConfig::default())?;
//! let freq = synth.add_signal(SignalSpec::incoming("freq", Type::Float32, 1).bounds(20.0f32, 2000.0f32))?;
//!
//! let mut ctl = Device::new("ctl", DeviceConfig::default())?;
//! let knob = ctl.add_signal(SignalSpec::outgoing("knob", Type::Float32, 1).bounds(0.0f32, 1.0f32))?;
//!
//! while !synth.is_ready() || !ctl.is_ready() {
//!     synth.poll(Duration::from_millis(10))?;
//!     ctl.poll(Duration::from_millis(10))?;
//! }
//!
//! let source = ctl.signal_path(knob).expect("named device");
//! let dest = synth.signal_path(freq).expect("named device");
//!
//! // Maps only connect signals the creator has heard about.
//! while ctl.graph().signal(&dest).is_none() {
//!     synth.poll(Duration::from_millis(10))?;
//!     ctl.poll(Duration::from_millis(10))?;
//! }
//! let map = ctl.new_map(MapSpec::new([source], [dest]).expression("y=x*1980+20"))?;
//! ctl.push_map(map)?;
//!
//! ctl.set_value(knob, 0.5f32)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Transports
//!
//! | Transport | Feature | Description |
//! |-----------|---------|-------------|
//! | UDP | `udp` (default) | Multicast bus plus unicast mesh on real sockets |
//! | Loopback | (always) | In-process network for tests and embedding |

// ============================================================================
// Modules
// ============================================================================

pub mod config;
pub mod device;
pub mod export;
pub mod expr;
pub mod graph;
pub mod map;
pub mod model;
pub mod net;
pub mod signal;

// ============================================================================
// Re-exports: Model
// ============================================================================

pub use model::{DeviceId, InstanceId, MapId, SignalPath, Timetag, Type, Value};

// ============================================================================
// Re-exports: Devices and signals
// ============================================================================

pub use config::{DeviceConfig, NamingConfig, TransportConfig};
pub use device::Device;
pub use signal::{
    Direction, EventMask, Signal, SignalEvent, SignalEventKind, SignalId,
    SignalSpec, StealMode,
};

// ============================================================================
// Re-exports: Maps and graph
// ============================================================================

pub use map::{Map, MapFailure, MapMode, MapSpec, MapStatus, ProcessLocation};
pub use graph::{
    DeviceRecord, Graph, GraphEvent, GraphEventKind, GraphObject,
    MapFilter, MapRecord, ObjectMask, SignalFilter, SignalRecord, Snapshot,
};

// ============================================================================
// Re-exports: Networking
// ============================================================================

pub use net::{LoopbackNetwork, Transport};
#[cfg(feature = "udp")]
pub use net::UdpTransport;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Could not claim a name for '{prefix}' after {attempts} attempts")]
    NameResolutionFailed { prefix: String, attempts: u32 },

    #[error("Expression syntax error at position {position}: {message}")]
    ExpressionSyntax { position: usize, message: String },

    #[error("Evaluation error: {0}")]
    Evaluation(String),

    #[error("Length mismatch: expected {expected}, got {got}")]
    LengthMismatch { expected: usize, got: usize },

    #[error("Type error: expected {expected}, got {got}")]
    TypeMismatch { expected: String, got: String },

    #[error("Signal {signal} must be {expected}")]
    InvalidDirection { signal: String, expected: Direction },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Not ready: {0}")]
    NotReady(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

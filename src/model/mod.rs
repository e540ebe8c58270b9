//! # Data Model
//!
//! Plain data that crosses every boundary: signal payloads, timestamps and
//! network-wide identifiers. No I/O, no state.

pub mod ids;
pub mod timetag;
pub mod value;

pub use ids::{DeviceId, InstanceId, MapId, SignalPath};
pub(crate) use ids::stable_hash;
pub use timetag::Timetag;
pub use value::{Elements, Type, Value};

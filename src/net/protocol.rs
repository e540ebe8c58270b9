//! Protocol messages.
//!
//! Bus messages go to the shared multicast group and describe presence
//! and the graph. Mesh messages go unicast to one device's address and
//! carry map negotiation and data.
//!
//! | Path | Channel | Meaning |
//! |------|---------|---------|
//! | `/name/probe` | bus | a device proposes a name |
//! | `/name/registered` | bus | a name is taken |
//! | `/who` | bus | ask everyone to re-announce |
//! | `/device` | bus | device presence and address |
//! | `/sync` | bus | liveness heartbeat |
//! | `/signal` | bus | signal definition |
//! | `/signal/removed` | bus | signal retracted |
//! | `/logout` | bus | device departure |
//! | `/mapped` | bus | map definition and status, from its creator |
//! | `/unmap` | bus | map released |
//! | `/map` | mesh | map definition sent to an endpoint |
//! | `/map/ack` | mesh | endpoint verdict on a definition |
//! | `/map/data` | mesh | one source update through a map |
//! | `/signal/update` | mesh | direct signal write or subscription update |
//! | `/subscribe` | mesh | lease raw updates of a signal |

use std::net::{IpAddr, SocketAddr};

use bytes::Bytes;

use crate::expr::Signature;
use crate::graph::{DeviceRecord, MapRecord, SignalRecord};
use crate::map::{MapFailure, MapMode, MapStatus, ProcessLocation};
use crate::model::{DeviceId, MapId, SignalPath, Timetag, Type, Value};
use crate::signal::Direction;
use crate::{Error, Result};

use super::wire::{value_from_args, Arg, Message};

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    NameProbe { name: String, id: u32 },
    NameRegistered { name: String },
    Who,
    Device(DeviceRecord),
    Sync { name: String },
    Signal(SignalRecord),
    SignalRemoved { path: SignalPath },
    Logout { name: String },
    Mapped(MapRecord),
    Unmap { id: MapId },
    Map(MapRecord),
    MapAck { id: MapId, device: String, outcome: std::result::Result<(), MapFailure> },
    /// `value == None` releases the upstream instance.
    MapData { id: MapId, slot: usize, instance: u64, time: Timetag, value: Option<Value> },
    SignalUpdate { path: SignalPath, instance: u64, time: Timetag, value: Option<Value> },
    Subscribe { subscriber: String, path: SignalPath, lease_ms: u32 },
}

impl Packet {
    /// True for messages sent to the multicast group.
    pub fn is_bus(&self) -> bool {
        !matches!(
            self,
            Packet::Map(_) | Packet::MapAck { .. } | Packet::MapData { .. } | Packet::SignalUpdate { .. } | Packet::Subscribe { .. }
        )
    }

    /// Address path this packet travels under.
    pub fn path(&self) -> &'static str {
        match self {
            Packet::NameProbe { .. } => "/name/probe",
            Packet::NameRegistered { .. } => "/name/registered",
            Packet::Who => "/who",
            Packet::Device(_) => "/device",
            Packet::Sync { .. } => "/sync",
            Packet::Signal(_) => "/signal",
            Packet::SignalRemoved { .. } => "/signal/removed",
            Packet::Logout { .. } => "/logout",
            Packet::Mapped(_) => "/mapped",
            Packet::Unmap { .. } => "/unmap",
            Packet::Map(_) => "/map",
            Packet::MapAck { .. } => "/map/ack",
            Packet::MapData { .. } => "/map/data",
            Packet::SignalUpdate { .. } => "/signal/update",
            Packet::Subscribe { .. } => "/subscribe",
        }
    }

    pub fn encode(&self) -> Bytes {
        self.to_message().encode()
    }

    pub fn decode(data: &[u8]) -> Result<Packet> {
        Packet::from_message(&Message::decode(data)?)
    }

    // ========================================================================
    // To message
    // ========================================================================

    pub fn to_message(&self) -> Message {
        match self {
            Packet::NameProbe { name, id } => Message::new("/name/probe").arg(name.as_str()).arg(*id as i64),
            Packet::NameRegistered { name } => Message::new("/name/registered").arg(name.as_str()),
            Packet::Who => Message::new("/who"),
            Packet::Device(d) => Message::new("/device")
                .arg(d.name.as_str())
                .prop("id", [d.id.0])
                .prop("host", [d.address.ip().to_string()])
                .prop("port", [d.address.port() as i32]),
            Packet::Sync { name } => Message::new("/sync").arg(name.as_str()),
            Packet::Signal(s) => {
                let mut m = Message::new("/signal")
                    .arg(s.path().to_string())
                    .prop("direction", [s.direction.as_str()])
                    .prop("type", [s.ty.type_char().to_string()])
                    .prop("length", [s.len as i32])
                    .prop("instances", [s.instances as i32]);
                if let Some(unit) = &s.unit {
                    m = m.prop("unit", [unit.as_str()]);
                }
                if let Some(min) = &s.min {
                    m = m.value_prop("min", min);
                }
                if let Some(max) = &s.max {
                    m = m.value_prop("max", max);
                }
                m
            }
            Packet::SignalRemoved { path } => Message::new("/signal/removed").arg(path.to_string()),
            Packet::Logout { name } => Message::new("/logout").arg(name.as_str()),
            Packet::Mapped(r) => map_message("/mapped", r),
            Packet::Unmap { id } => Message::new("/unmap").arg(id.0),
            Packet::Map(r) => map_message("/map", r),
            Packet::MapAck { id, device, outcome } => {
                let m = Message::new("/map/ack").arg(id.0).arg(device.as_str());
                match outcome {
                    Ok(()) => m.prop("status", ["ok"]),
                    Err(failure) => failure_props(m.prop("status", ["failed"]), failure),
                }
            }
            Packet::MapData { id, slot, instance, time, value } => {
                let m = Message::new("/map/data").arg(id.0).arg(*slot as i32).arg(*instance).arg(*time);
                match value {
                    Some(v) => m.value(v),
                    None => m,
                }
            }
            Packet::SignalUpdate { path, instance, time, value } => {
                let m = Message::new("/signal/update").arg(path.to_string()).arg(*instance).arg(*time);
                match value {
                    Some(v) => m.value(v),
                    None => m,
                }
            }
            Packet::Subscribe { subscriber, path, lease_ms } => Message::new("/subscribe")
                .arg(subscriber.as_str())
                .arg(path.to_string())
                .arg(*lease_ms as i32),
        }
    }

    // ========================================================================
    // From message
    // ========================================================================

    pub fn from_message(m: &Message) -> Result<Packet> {
        let pos = m.positional();
        Ok(match m.path.as_str() {
            "/name/probe" => Packet::NameProbe { name: str_at(pos, 0)?, id: int_at(pos, 1)? as u32 },
            "/name/registered" => Packet::NameRegistered { name: str_at(pos, 0)? },
            "/who" => Packet::Who,
            "/device" => {
                let name = str_at(pos, 0)?;
                let host: IpAddr = required_str(m, "host")?
                    .parse()
                    .map_err(|_| Error::Protocol("bad @host".into()))?;
                let port = required_i64(m, "port")? as u16;
                let id = m.prop_i64("id").map(|v| DeviceId(v as u64)).unwrap_or_else(|| DeviceId::for_name(&name));
                Packet::Device(DeviceRecord { name, id, address: SocketAddr::new(host, port) })
            }
            "/sync" => Packet::Sync { name: str_at(pos, 0)? },
            "/signal" => {
                let path: SignalPath = str_at(pos, 0)?.parse()?;
                let direction = Direction::parse(required_str(m, "direction")?)
                    .ok_or_else(|| Error::Protocol("bad @direction".into()))?;
                let ty = parse_type(required_str(m, "type")?)?;
                Packet::Signal(SignalRecord {
                    device: path.device,
                    name: path.signal,
                    direction,
                    ty,
                    len: required_i64(m, "length")? as usize,
                    unit: m.prop_str("unit").map(String::from),
                    min: m.prop_value("min")?,
                    max: m.prop_value("max")?,
                    instances: m.prop_i64("instances").unwrap_or(1).max(1) as u32,
                    last_value: None,
                })
            }
            "/signal/removed" => Packet::SignalRemoved { path: str_at(pos, 0)?.parse()? },
            "/logout" => Packet::Logout { name: str_at(pos, 0)? },
            "/mapped" => Packet::Mapped(map_record(m)?),
            "/unmap" => Packet::Unmap { id: MapId(int_at(pos, 0)? as u64) },
            "/map" => Packet::Map(map_record(m)?),
            "/map/ack" => {
                let outcome = match required_str(m, "status")? {
                    "ok" => Ok(()),
                    _ => Err(failure_from(m)?),
                };
                Packet::MapAck { id: MapId(int_at(pos, 0)? as u64), device: str_at(pos, 1)?, outcome }
            }
            "/map/data" => Packet::MapData {
                id: MapId(int_at(pos, 0)? as u64),
                slot: int_at(pos, 1)? as usize,
                instance: int_at(pos, 2)? as u64,
                time: time_at(pos, 3)?,
                value: trailing_value(pos, 4)?,
            },
            "/signal/update" => Packet::SignalUpdate {
                path: str_at(pos, 0)?.parse()?,
                instance: int_at(pos, 1)? as u64,
                time: time_at(pos, 2)?,
                value: trailing_value(pos, 3)?,
            },
            "/subscribe" => Packet::Subscribe {
                subscriber: str_at(pos, 0)?,
                path: str_at(pos, 1)?.parse()?,
                lease_ms: int_at(pos, 2)?.max(0) as u32,
            },
            other => return Err(Error::Protocol(format!("unknown message '{other}'"))),
        })
    }
}

// ============================================================================
// Map records
// ============================================================================

fn map_message(path: &str, r: &MapRecord) -> Message {
    let mut m = Message::new(path)
        .arg(r.id.0)
        .prop("creator", [r.creator.as_str()])
        .prop("src", r.sources.iter().map(|p| p.to_string()))
        .prop("dst", r.destinations.iter().map(|p| p.to_string()))
        .prop("srctype", r.source_types.iter().map(|s| s.ty.type_char().to_string()))
        .prop("srclen", r.source_types.iter().map(|s| s.len as i32))
        .prop("srcinst", r.source_instances.iter().map(|n| *n as i32))
        .prop("dsttype", r.destination_types.iter().map(|s| s.ty.type_char().to_string()))
        .prop("dstlen", r.destination_types.iter().map(|s| s.len as i32))
        .prop("mode", [r.mode.as_str()])
        .prop("muted", [r.muted as i32])
        .prop("process", [r.location.as_str()])
        .prop("scope", r.scopes.iter().map(String::as_str))
        .prop("state", [r.status.as_str()]);
    if let Some(expr) = &r.expression {
        m = m.prop("expr", [expr.as_str()]);
    }
    if let MapStatus::Failed(failure) = &r.status {
        m = failure_props(m, failure);
    }
    m
}

fn map_record(m: &Message) -> Result<MapRecord> {
    let id = MapId(int_at(m.positional(), 0)? as u64);
    let paths = |key: &str| -> Result<Vec<SignalPath>> {
        m.prop_strs(key).into_iter().map(str::parse).collect()
    };
    let sources = paths("src")?;
    let destinations = paths("dst")?;
    if sources.is_empty() || destinations.is_empty() {
        return Err(Error::Protocol("map without endpoints".into()));
    }

    let types = m.prop_strs("srctype");
    let lens = ints(m, "srclen");
    if types.len() != sources.len() || lens.len() != sources.len() {
        return Err(Error::Protocol("map source signatures incomplete".into()));
    }
    let source_types = types
        .iter()
        .zip(&lens)
        .map(|(t, l)| Ok(Signature::new(parse_type(t)?, *l as usize)))
        .collect::<Result<Vec<_>>>()?;
    let mut source_instances: Vec<u32> = ints(m, "srcinst").into_iter().map(|n| n.max(1) as u32).collect();
    source_instances.resize(sources.len(), 1);

    let dst_types = m.prop_strs("dsttype");
    let dst_lens = ints(m, "dstlen");
    if dst_types.len() != destinations.len() || dst_lens.len() != destinations.len() {
        return Err(Error::Protocol("map destination signatures incomplete".into()));
    }
    let destination_types = dst_types
        .iter()
        .zip(&dst_lens)
        .map(|(t, l)| Ok(Signature::new(parse_type(t)?, *l as usize)))
        .collect::<Result<Vec<_>>>()?;
    let location = match m.prop_str("process") {
        None => ProcessLocation::Destination,
        Some(s) => ProcessLocation::parse(s).ok_or_else(|| Error::Protocol(format!("bad @process '{s}'")))?,
    };

    let mode = MapMode::parse(required_str(m, "mode")?).ok_or_else(|| Error::Protocol("bad @mode".into()))?;
    let status = match m.prop_str("state").unwrap_or("pending") {
        "unresolved" => MapStatus::Unresolved,
        "pending" => MapStatus::Pending,
        "ready" => MapStatus::Ready,
        "released" => MapStatus::Released,
        "failed" => MapStatus::Failed(failure_from(m)?),
        other => return Err(Error::Protocol(format!("bad @state '{other}'"))),
    };

    Ok(MapRecord {
        id,
        creator: required_str(m, "creator")?.to_string(),
        sources,
        destinations,
        source_types,
        source_instances,
        destination_types,
        mode,
        expression: m.prop_str("expr").map(String::from),
        muted: m.prop_i64("muted").unwrap_or(0) != 0,
        location,
        scopes: m.prop_strs("scope").into_iter().map(String::from).collect(),
        status,
    })
}

fn failure_props(m: Message, failure: &MapFailure) -> Message {
    let m = m.prop("error", [failure.kind()]);
    match failure {
        MapFailure::LengthMismatch { expected, got } => {
            m.prop("expected", [*expected as i64]).prop("got", [*got as i64])
        }
        MapFailure::TypeMismatch { expected, got } => {
            m.prop("expected", [expected.as_str()]).prop("got", [got.as_str()])
        }
        MapFailure::ExpressionSyntax { position, message } => {
            m.prop("position", [*position as i64]).prop("message", [message.as_str()])
        }
        MapFailure::UnknownSignal(what) => m.prop("message", [what.as_str()]),
        MapFailure::InvalidDirection { signal, expected } => {
            m.prop("signal", [signal.as_str()]).prop("direction", [expected.as_str()])
        }
    }
}

fn failure_from(m: &Message) -> Result<MapFailure> {
    let text = |key: &str| m.prop_str(key).unwrap_or_default().to_string();
    let num = |key: &str| m.prop_i64(key).unwrap_or(0).max(0) as usize;
    Ok(match required_str(m, "error")? {
        "length" => MapFailure::LengthMismatch { expected: num("expected"), got: num("got") },
        "type" => MapFailure::TypeMismatch { expected: text("expected"), got: text("got") },
        "syntax" => MapFailure::ExpressionSyntax { position: num("position"), message: text("message") },
        "unknown" => MapFailure::UnknownSignal(text("message")),
        "direction" => MapFailure::InvalidDirection {
            signal: text("signal"),
            expected: Direction::parse(&text("direction")).unwrap_or(Direction::Incoming),
        },
        other => return Err(Error::Protocol(format!("unknown failure kind '{other}'"))),
    })
}

// ============================================================================
// Argument helpers
// ============================================================================

fn str_at(args: &[Arg], i: usize) -> Result<String> {
    args.get(i)
        .and_then(Arg::as_str)
        .map(String::from)
        .ok_or_else(|| Error::Protocol(format!("expected string argument {i}")))
}

fn int_at(args: &[Arg], i: usize) -> Result<i64> {
    args.get(i).and_then(Arg::as_i64).ok_or_else(|| Error::Protocol(format!("expected integer argument {i}")))
}

fn time_at(args: &[Arg], i: usize) -> Result<Timetag> {
    args.get(i).and_then(Arg::as_time).ok_or_else(|| Error::Protocol(format!("expected timetag argument {i}")))
}

fn trailing_value(args: &[Arg], from: usize) -> Result<Option<Value>> {
    match args.get(from..) {
        Some(rest) if !rest.is_empty() => value_from_args(rest).map(Some),
        _ => Ok(None),
    }
}

fn required_str<'a>(m: &'a Message, key: &str) -> Result<&'a str> {
    m.prop_str(key).ok_or_else(|| Error::Protocol(format!("{} missing @{key}", m.path)))
}

fn required_i64(m: &Message, key: &str) -> Result<i64> {
    m.prop_i64(key).ok_or_else(|| Error::Protocol(format!("{} missing @{key}", m.path)))
}

fn ints(m: &Message, key: &str) -> Vec<i64> {
    m.property(key).map(|args| args.iter().filter_map(Arg::as_i64).collect()).unwrap_or_default()
}

fn parse_type(s: &str) -> Result<Type> {
    s.chars()
        .next()
        .and_then(Type::from_char)
        .ok_or_else(|| Error::Protocol(format!("bad signal type '{s}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_map(status: MapStatus) -> MapRecord {
        MapRecord {
            id: MapId(0xABCD_0000_0000_0003),
            creator: "patch.0".into(),
            sources: vec![SignalPath::new("a.0", "x"), SignalPath::new("b.1", "y/z")],
            destinations: vec![SignalPath::new("c.0", "in")],
            source_types: vec![Signature::new(Type::Float32, 1), Signature::new(Type::Int32, 3)],
            source_instances: vec![1, 4],
            destination_types: vec![Signature::new(Type::Float64, 2)],
            mode: MapMode::Expression,
            expression: Some("y=x0+sum(x1)".into()),
            muted: true,
            location: ProcessLocation::Destination,
            scopes: vec!["a.0".into(), "b.1".into()],
            status,
        }
    }

    #[test]
    fn test_map_definition_survives_the_wire() {
        for status in [
            MapStatus::Pending,
            MapStatus::Ready,
            MapStatus::Failed(MapFailure::LengthMismatch { expected: 2, got: 3 }),
        ] {
            let packet = Packet::Mapped(sample_map(status));
            assert_eq!(Packet::decode(&packet.encode()).unwrap(), packet);
        }
    }

    #[test]
    fn test_processing_location_and_empty_scope_survive_the_wire() {
        let mut record = sample_map(MapStatus::Pending);
        record.location = ProcessLocation::Source;
        record.scopes.clear();
        let packet = Packet::Map(record);
        assert_eq!(Packet::decode(&packet.encode()).unwrap(), packet);
    }

    #[test]
    fn test_signal_definition_survives_the_wire() {
        let packet = Packet::Signal(SignalRecord {
            device: "synth.2".into(),
            name: "freq".into(),
            direction: Direction::Incoming,
            ty: Type::Float64,
            len: 2,
            unit: Some("Hz".into()),
            min: Some(Value::from([20.0f64, 20.0])),
            max: Some(Value::from([20000.0f64, 20000.0])),
            instances: 8,
            last_value: None,
        });
        assert_eq!(Packet::decode(&packet.encode()).unwrap(), packet);
    }

    #[test]
    fn test_release_has_no_values() {
        let packet = Packet::MapData { id: MapId(9), slot: 0, instance: 77, time: Timetag::new(5, 6), value: None };
        assert_eq!(Packet::decode(&packet.encode()).unwrap(), packet);
        assert!(!packet.is_bus());
    }

    #[test]
    fn test_ack_failures() {
        let packet = Packet::MapAck {
            id: MapId(1),
            device: "dst.0".into(),
            outcome: Err(MapFailure::InvalidDirection { signal: "dst.0/out".into(), expected: Direction::Incoming }),
        };
        assert_eq!(Packet::decode(&packet.encode()).unwrap(), packet);
    }

    #[test]
    fn test_device_announcement() {
        let packet = Packet::Device(DeviceRecord {
            name: "dev.1".into(),
            id: DeviceId::for_name("dev.1"),
            address: "192.168.1.20:40123".parse().unwrap(),
        });
        assert_eq!(Packet::decode(&packet.encode()).unwrap(), packet);
        assert!(packet.is_bus());
    }

    #[test]
    fn test_malformed_messages_rejected() {
        assert!(Packet::from_message(&Message::new("/nonsense")).is_err());
        assert!(Packet::from_message(&Message::new("/device").arg("x.0")).is_err());
        let no_endpoints = Message::new("/map").arg(1i64).prop("creator", ["a.0"]).prop("mode", ["raw"]);
        assert!(Packet::from_message(&no_endpoints).is_err());
    }
}

//! OSC-shaped datagram codec.
//!
//! ## Wire Format
//!
//! ```text
//! path        NUL-terminated string, padded to 4 bytes   "/map/data"
//! type tags   NUL-terminated string, padded to 4 bytes   ",hihtfff"
//! arguments   in tag order, big-endian
//!   i  i32      h  i64      f  f32      d  f64
//!   s  string (NUL-terminated, padded to 4 bytes)
//!   t  timetag (u32 seconds, u32 fraction)
//! ```
//!
//! Named properties are flattened into the argument list as an `@key`
//! string followed by the property's values.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::model::{Timetag, Type, Value};
use crate::{Error, Result};

/// Largest datagram we will build or accept.
pub const MAX_DATAGRAM: usize = 8192;

/// One typed message argument.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Str(String),
    Time(Timetag),
}

impl Arg {
    pub fn tag(&self) -> u8 {
        match self {
            Arg::Int(_) => b'i',
            Arg::Long(_) => b'h',
            Arg::Float(_) => b'f',
            Arg::Double(_) => b'd',
            Arg::Str(_) => b's',
            Arg::Time(_) => b't',
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Arg::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Any integer argument widened to i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Arg::Int(v) => Some(*v as i64),
            Arg::Long(v) => Some(*v),
            _ => None,
        }
    }

    /// Any numeric argument widened to f64.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Arg::Int(v) => Some(*v as f64),
            Arg::Long(v) => Some(*v as f64),
            Arg::Float(v) => Some(*v as f64),
            Arg::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_time(&self) -> Option<Timetag> {
        match self {
            Arg::Time(t) => Some(*t),
            _ => None,
        }
    }

    fn is_property_key(&self) -> bool {
        matches!(self, Arg::Str(s) if s.starts_with('@'))
    }
}

impl From<i32> for Arg { fn from(v: i32) -> Self { Arg::Int(v) } }
impl From<i64> for Arg { fn from(v: i64) -> Self { Arg::Long(v) } }
impl From<u64> for Arg { fn from(v: u64) -> Self { Arg::Long(v as i64) } }
impl From<f32> for Arg { fn from(v: f32) -> Self { Arg::Float(v) } }
impl From<f64> for Arg { fn from(v: f64) -> Self { Arg::Double(v) } }
impl From<&str> for Arg { fn from(v: &str) -> Self { Arg::Str(v.to_string()) } }
impl From<String> for Arg { fn from(v: String) -> Self { Arg::Str(v) } }
impl From<Timetag> for Arg { fn from(v: Timetag) -> Self { Arg::Time(v) } }

/// A decoded message: address path plus arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub path: String,
    pub args: Vec<Arg>,
}

impl Message {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into(), args: Vec::new() }
    }

    pub fn arg(mut self, arg: impl Into<Arg>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append `@key` followed by `values`.
    pub fn prop<I, A>(mut self, key: &str, values: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Arg>,
    {
        self.args.push(Arg::Str(format!("@{key}")));
        self.args.extend(values.into_iter().map(Into::into));
        self
    }

    /// Append `@key` followed by the elements of a value.
    pub fn value_prop(mut self, key: &str, value: &Value) -> Self {
        self.args.push(Arg::Str(format!("@{key}")));
        push_value(&mut self.args, value);
        self
    }

    /// Append the elements of a value as positional arguments.
    pub fn value(mut self, value: &Value) -> Self {
        push_value(&mut self.args, value);
        self
    }

    // ========================================================================
    // Encoding
    // ========================================================================

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64 + self.args.len() * 8);
        put_padded_str(&mut buf, &self.path);

        let mut tags = String::with_capacity(self.args.len() + 1);
        tags.push(',');
        tags.extend(self.args.iter().map(|a| a.tag() as char));
        put_padded_str(&mut buf, &tags);

        for arg in &self.args {
            match arg {
                Arg::Int(v) => buf.put_i32(*v),
                Arg::Long(v) => buf.put_i64(*v),
                Arg::Float(v) => buf.put_f32(*v),
                Arg::Double(v) => buf.put_f64(*v),
                Arg::Str(s) => put_padded_str(&mut buf, s),
                Arg::Time(t) => {
                    buf.put_u32(t.secs.min(u32::MAX as u64) as u32);
                    buf.put_u32(t.frac);
                }
            }
        }
        buf.freeze()
    }

    // ========================================================================
    // Decoding
    // ========================================================================

    pub fn decode(mut data: &[u8]) -> Result<Message> {
        if data.len() > MAX_DATAGRAM {
            return Err(Error::Protocol(format!("datagram of {} bytes exceeds limit", data.len())));
        }
        let path = get_padded_str(&mut data)?;
        if !path.starts_with('/') {
            return Err(Error::Protocol(format!("bad message path '{path}'")));
        }
        let tags = get_padded_str(&mut data)?;
        let Some(tags) = tags.strip_prefix(',') else {
            return Err(Error::Protocol("missing type tag string".into()));
        };

        let mut args = Vec::with_capacity(tags.len());
        for tag in tags.bytes() {
            let arg = match tag {
                b'i' => Arg::Int(need(&data, 4).map(|_| data.get_i32())?),
                b'h' => Arg::Long(need(&data, 8).map(|_| data.get_i64())?),
                b'f' => Arg::Float(need(&data, 4).map(|_| data.get_f32())?),
                b'd' => Arg::Double(need(&data, 8).map(|_| data.get_f64())?),
                b's' => Arg::Str(get_padded_str(&mut data)?),
                b't' => {
                    need(&data, 8)?;
                    let secs = data.get_u32() as u64;
                    let frac = data.get_u32();
                    Arg::Time(Timetag::new(secs, frac))
                }
                other => {
                    return Err(Error::Protocol(format!("unknown type tag '{}'", other as char)));
                }
            };
            args.push(arg);
        }
        Ok(Message { path, args })
    }

    // ========================================================================
    // Property access
    // ========================================================================

    /// Arguments before the first `@key`.
    pub fn positional(&self) -> &[Arg] {
        let end = self.args.iter().position(Arg::is_property_key).unwrap_or(self.args.len());
        &self.args[..end]
    }

    /// Values following `@key`, up to the next key.
    pub fn property(&self, key: &str) -> Option<&[Arg]> {
        let start = self.args.iter().position(|a| {
            matches!(a, Arg::Str(s) if s.strip_prefix('@') == Some(key))
        })? + 1;
        let len = self.args[start..].iter().position(Arg::is_property_key).unwrap_or(self.args.len() - start);
        Some(&self.args[start..start + len])
    }

    pub fn prop_str(&self, key: &str) -> Option<&str> {
        self.property(key)?.first()?.as_str()
    }

    pub fn prop_i64(&self, key: &str) -> Option<i64> {
        self.property(key)?.first()?.as_i64()
    }

    /// All string values of a property.
    pub fn prop_strs(&self, key: &str) -> Vec<&str> {
        self.property(key)
            .map(|args| args.iter().filter_map(Arg::as_str).collect())
            .unwrap_or_default()
    }

    pub fn prop_value(&self, key: &str) -> Result<Option<Value>> {
        match self.property(key) {
            Some(args) if !args.is_empty() => value_from_args(args).map(Some),
            _ => Ok(None),
        }
    }
}

fn push_value(args: &mut Vec<Arg>, value: &Value) {
    match value {
        Value::Int32(v) => args.extend(v.iter().map(|x| Arg::Int(*x))),
        Value::Float32(v) => args.extend(v.iter().map(|x| Arg::Float(*x))),
        Value::Float64(v) => args.extend(v.iter().map(|x| Arg::Double(*x))),
    }
}

/// Rebuild a value from homogeneous numeric arguments.
pub fn value_from_args(args: &[Arg]) -> Result<Value> {
    let ty = match args.first() {
        Some(Arg::Int(_)) => Type::Int32,
        Some(Arg::Float(_)) => Type::Float32,
        Some(Arg::Double(_)) => Type::Float64,
        Some(other) => {
            return Err(Error::Protocol(format!("non-numeric value argument '{}'", other.tag() as char)));
        }
        None => return Err(Error::Protocol("empty value".into())),
    };
    let mixed = || Error::Protocol("mixed value argument types".into());
    Ok(match ty {
        Type::Int32 => Value::Int32(args.iter().map(|a| match a { Arg::Int(v) => Ok(*v), _ => Err(mixed()) }).collect::<Result<_>>()?),
        Type::Float32 => Value::Float32(args.iter().map(|a| match a { Arg::Float(v) => Ok(*v), _ => Err(mixed()) }).collect::<Result<_>>()?),
        Type::Float64 => Value::Float64(args.iter().map(|a| match a { Arg::Double(v) => Ok(*v), _ => Err(mixed()) }).collect::<Result<_>>()?),
    })
}

fn put_padded_str(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    // At least one NUL, then pad to a multiple of four
    let pad = 4 - (s.len() % 4);
    buf.put_bytes(0, pad);
}

fn get_padded_str(data: &mut &[u8]) -> Result<String> {
    let Some(nul) = data.iter().position(|b| *b == 0) else {
        return Err(Error::Protocol("unterminated string".into()));
    };
    let s = std::str::from_utf8(&data[..nul])
        .map_err(|_| Error::Protocol("invalid UTF-8 in string".into()))?
        .to_string();
    let padded = (nul / 4 + 1) * 4;
    need(data, padded)?;
    data.advance(padded);
    Ok(s)
}

fn need(data: &&[u8], n: usize) -> Result<()> {
    if data.remaining() < n {
        Err(Error::Protocol(format!("truncated message: need {n} bytes, have {}", data.remaining())))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_string_padding() {
        let bytes = Message::new("/who").encode();
        // "/who" + 4 NULs, "," + 3 NULs
        assert_eq!(bytes.len(), 12);
        assert_eq!(&bytes[..8], b"/who\0\0\0\0");
    }

    #[test]
    fn test_encode_decode_all_types() {
        let msg = Message::new("/map/data")
            .arg(7i64)
            .arg(2)
            .arg(Timetag::new(3_900_000_000, 0x8000_0000))
            .arg(1.5f32)
            .arg(-2.25f64)
            .arg("name.0");
        let decoded = Message::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_properties() {
        let msg = Message::new("/signal")
            .arg("dev.0/freq")
            .prop("type", ["f"])
            .prop("length", [2])
            .value_prop("min", &Value::from([0.0f32, -1.0]));
        assert_eq!(msg.positional(), &[Arg::Str("dev.0/freq".into())]);
        assert_eq!(msg.prop_str("type"), Some("f"));
        assert_eq!(msg.prop_i64("length"), Some(2));
        assert_eq!(msg.prop_value("min").unwrap(), Some(Value::from([0.0f32, -1.0])));
        assert!(msg.property("max").is_none());
    }

    #[test]
    fn test_truncated_is_protocol_error() {
        let bytes = Message::new("/x").arg(1.0f64).encode();
        let err = Message::decode(&bytes[..bytes.len() - 3]).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(Message::decode(b"no-slash\0\0\0\0,\0\0\0").is_err());
        assert!(Message::decode(b"/ok\0nocomma\0").is_err());
        assert!(Message::decode(b"").is_err());
    }

    #[test]
    fn test_mixed_value_args() {
        assert!(value_from_args(&[Arg::Float(1.0), Arg::Int(2)]).is_err());
        assert_eq!(value_from_args(&[Arg::Int(1), Arg::Int(2)]).unwrap(), Value::from([1, 2]));
    }
}

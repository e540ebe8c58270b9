//! Graph dump: serialize what a device currently knows about the network.
//!
//! ```text
//! Graph → write_json() → {"devices": [...], "signals": [...], "maps": [...]}
//! Graph → write_text() → one line per device, signal and map
//! ```
//!
//! Both read a snapshot, so a dump taken inside a graph callback is safe.

use std::io::Write;
use std::sync::Arc;

use serde::Serialize;

use crate::graph::{DeviceRecord, Graph, MapFilter, MapRecord, SignalFilter, SignalRecord};
use crate::map::ProcessLocation;
use crate::Result;

#[derive(Serialize)]
struct Dump<'a> {
    devices: Vec<&'a DeviceRecord>,
    signals: Vec<&'a SignalRecord>,
    maps: Vec<&'a MapRecord>,
}

/// Write the graph as one pretty-printed JSON document.
pub fn write_json(graph: &Graph, writer: &mut dyn Write) -> Result<()> {
    let devices = graph.devices().to_vec();
    let signals = graph.signals(SignalFilter::all()).to_vec();
    let maps = graph.maps(MapFilter::all()).to_vec();
    let dump = Dump {
        devices: devices.iter().map(Arc::as_ref).collect(),
        signals: signals.iter().map(Arc::as_ref).collect(),
        maps: maps.iter().map(Arc::as_ref).collect(),
    };
    serde_json::to_writer_pretty(&mut *writer, &dump)?;
    writeln!(writer)?;
    Ok(())
}

/// Write a human-readable listing of the graph.
pub fn write_text(graph: &Graph, writer: &mut dyn Write) -> Result<()> {
    writeln!(writer, "# devices: {}", graph.device_count())?;
    for device in graph.devices().iter() {
        writeln!(writer, "{} @ {}", device.name, device.address)?;
        for signal in graph.signals(SignalFilter::all().device(device.name.as_str())).iter() {
            let unit = signal.unit.as_deref().map(|u| format!(" {u}")).unwrap_or_default();
            writeln!(
                writer,
                "  {} {} {}[{}]{}",
                signal.direction,
                signal.name,
                signal.ty.name(),
                signal.len,
                unit,
            )?;
        }
    }

    writeln!(writer)?;
    writeln!(writer, "# maps: {}", graph.map_count())?;
    for map in graph.maps(MapFilter::all()).iter() {
        writeln!(writer, "{}", format_map(map))?;
    }
    Ok(())
}

/// `a.0/x, a.0/y -> b.0/z [ready] y=x*2`
fn format_map(map: &MapRecord) -> String {
    let join = |paths: &[crate::model::SignalPath]| {
        paths.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(", ")
    };
    let mut line = format!(
        "{} -> {} [{}]",
        join(&map.sources),
        join(&map.destinations),
        map.status.as_str(),
    );
    if map.muted {
        line.push_str(" muted");
    }
    if map.location == ProcessLocation::Source {
        line.push_str(" @source");
    }
    if let Some(expr) = &map.expression {
        line.push(' ');
        line.push_str(expr);
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::{MapMode, MapStatus, ProcessLocation};
    use crate::model::MapId;

    fn record(expression: Option<&str>, muted: bool) -> MapRecord {
        MapRecord {
            id: MapId(9),
            creator: "a.0".into(),
            sources: vec!["a.0/x".parse().unwrap(), "a.0/y".parse().unwrap()],
            destinations: vec!["b.0/z".parse().unwrap()],
            source_types: Vec::new(),
            source_instances: vec![1, 1],
            mode: if expression.is_some() { MapMode::Expression } else { MapMode::Raw },
            expression: expression.map(String::from),
            muted,
            destination_types: Vec::new(),
            location: ProcessLocation::Destination,
            scopes: Vec::new(),
            status: MapStatus::Ready,
        }
    }

    #[test]
    fn test_format_map() {
        assert_eq!(format_map(&record(Some("y=x0+x1"), false)), "a.0/x, a.0/y -> b.0/z [ready] y=x0+x1");
        assert_eq!(format_map(&record(None, true)), "a.0/x, a.0/y -> b.0/z [ready] muted");
        let mut at_source = record(Some("y=x0"), false);
        at_source.location = ProcessLocation::Source;
        assert_eq!(format_map(&at_source), "a.0/x, a.0/y -> b.0/z [ready] @source y=x0");
    }

    #[test]
    fn test_empty_graph_json() {
        let mut out = Vec::new();
        write_json(&Graph::new(), &mut out).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(parsed["devices"], serde_json::json!([]));
        assert_eq!(parsed["maps"], serde_json::json!([]));
    }

    #[test]
    fn test_empty_graph_text() {
        let mut out = Vec::new();
        write_text(&Graph::new(), &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("# devices: 0"));
        assert!(text.contains("# maps: 0"));
    }
}

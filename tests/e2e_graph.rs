//! End-to-end tests for the replicated graph: events, queries,
//! subscriptions and export.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::*;
use libmapper_rs::export;
use libmapper_rs::{
    Direction, GraphEventKind, GraphObject, LoopbackNetwork, MapFilter, MapSpec, ObjectMask,
    SignalFilter, SignalSpec, Type, Value,
};

type Log = Arc<Mutex<Vec<(GraphEventKind, String)>>>;

fn describe(object: &GraphObject) -> String {
    match object {
        GraphObject::Device(d) => format!("device {}", d.name),
        GraphObject::Signal(s) => format!("signal {}", s.path()),
        GraphObject::Map(m) => format!("map {}", m.id),
    }
}

// ============================================================================
// 1. Events
// ============================================================================

#[test]
fn test_announcements_are_idempotent() {
    let net = LoopbackNetwork::new();
    let mut a = device(&net, "a");
    let mut b = device(&net, "b");
    b.add_signal(SignalSpec::outgoing("out", Type::Float32, 1)).unwrap();

    let log: Log = Arc::default();
    let sink = log.clone();
    a.add_graph_callback(ObjectMask::ALL, move |e| sink.lock().unwrap().push((e.kind, describe(&e.object))));

    settle(&mut [&mut a, &mut b]);
    assert!(run_until(&mut [&mut a, &mut b], |ds| ds[0].graph().signal_count() == 1));
    // Several heartbeat periods with nothing changing.
    run_for(&mut [&mut a, &mut b], Duration::from_millis(200));

    let log = log.lock().unwrap().clone();
    let added: Vec<&String> = log.iter().filter(|(k, _)| *k == GraphEventKind::Added).map(|(_, d)| d).collect();
    assert_eq!(added.len(), 3, "{log:?}");
    assert!(log.iter().all(|(k, _)| *k == GraphEventKind::Added), "{log:?}");
    assert!(log.iter().any(|(_, d)| d == &format!("signal {}/out", b.name())));
}

#[test]
fn test_map_events_and_removal() {
    let net = LoopbackNetwork::new();
    let mut a = device(&net, "a");
    let mut b = device(&net, "b");
    let out = a.add_signal(SignalSpec::outgoing("out", Type::Int32, 1)).unwrap();
    let inp = b.add_signal(SignalSpec::incoming("in", Type::Int32, 1)).unwrap();

    let log: Log = Arc::default();
    let sink = log.clone();
    b.add_graph_callback(ObjectMask::MAPS, move |e| sink.lock().unwrap().push((e.kind, describe(&e.object))));

    settle(&mut [&mut a, &mut b]);
    let to = b.signal_path(inp).unwrap();
    wait_for_signal(&mut [&mut a, &mut b], &to);
    let map = a.new_map(MapSpec::new([a.signal_path(out).unwrap()], [to])).unwrap();
    a.push_map(map).unwrap();
    wait_for_map(&mut [&mut a, &mut b], map);

    a.release_map(map).unwrap();
    assert!(run_until(&mut [&mut a, &mut b], |ds| ds[1].graph().map(map).is_none()));

    let kinds: Vec<GraphEventKind> = log.lock().unwrap().iter().map(|(k, _)| *k).collect();
    assert_eq!(kinds.first(), Some(&GraphEventKind::Added));
    assert_eq!(kinds.last(), Some(&GraphEventKind::Removed));
}

// ============================================================================
// 2. Queries
// ============================================================================

#[test]
fn test_filtered_queries_are_snapshots() {
    let net = LoopbackNetwork::new();
    let mut a = device(&net, "a");
    let mut b = device(&net, "b");
    a.add_signal(SignalSpec::outgoing("pos/x", Type::Float32, 1)).unwrap();
    a.add_signal(SignalSpec::outgoing("pos/y", Type::Float32, 1)).unwrap();
    let gate = a.add_signal(SignalSpec::incoming("gate", Type::Int32, 1)).unwrap();
    settle(&mut [&mut a, &mut b]);
    assert!(run_until(&mut [&mut a, &mut b], |ds| ds[1].graph().signal_count() == 3));

    let outputs = b.graph().signals(SignalFilter::all().direction(Direction::Outgoing));
    let names: Vec<String> = outputs.iter().map(|s| s.name.clone()).collect();
    assert_eq!(names, vec!["pos/x", "pos/y"]);
    assert_eq!(b.graph().signals(SignalFilter::all().name_contains("pos").ty(Type::Int32)).count(), 0);

    // Removing a signal does not change a snapshot already taken.
    let everything = b.graph().signals(SignalFilter::all());
    a.remove_signal(gate).unwrap();
    assert!(run_until(&mut [&mut a, &mut b], |ds| ds[1].graph().signal_count() == 2));
    assert_eq!(everything.count(), 3);
    assert_eq!(everything.iter().count(), 3);
    assert_eq!(b.graph().signals(SignalFilter::all()).count(), 2);
    assert_eq!(b.graph().maps(MapFilter::all()).count(), 0);
}

// ============================================================================
// 3. Subscriptions
// ============================================================================

#[test]
fn test_subscription_mirrors_remote_values() {
    let net = LoopbackNetwork::new();
    let mut viewer = device(&net, "viewer");
    let mut sensor = device(&net, "sensor");
    let temp = sensor.add_signal(SignalSpec::outgoing("temp", Type::Float32, 1).unit("C")).unwrap();
    settle(&mut [&mut viewer, &mut sensor]);
    let path = sensor.signal_path(temp).unwrap();
    wait_for_signal(&mut [&mut viewer, &mut sensor], &path);

    sensor.set_value(temp, 20.5f32).unwrap();
    viewer.subscribe(&path).unwrap();
    let last = |v: &libmapper_rs::Device| v.graph().signal(&path).and_then(|s| s.last_value.clone()).map(|(v, _)| v);

    // The current value is sent on subscription.
    assert!(run_until(&mut [&mut viewer, &mut sensor], |ds| last(&ds[0]).is_some()));
    assert_eq!(last(&viewer), Some(Value::from(20.5f32)));

    sensor.set_value(temp, 21.0f32).unwrap();
    assert!(run_until(&mut [&mut viewer, &mut sensor], |ds| last(&ds[0]) == Some(Value::from(21.0f32))));

    // Leases are renewed while both sides poll.
    run_for(&mut [&mut viewer, &mut sensor], Duration::from_millis(600));
    sensor.set_value(temp, 22.0f32).unwrap();
    assert!(run_until(&mut [&mut viewer, &mut sensor], |ds| last(&ds[0]) == Some(Value::from(22.0f32))));

    viewer.unsubscribe(&path);
    run_for(&mut [&mut viewer, &mut sensor], Duration::from_millis(50));
    sensor.set_value(temp, 30.0f32).unwrap();
    run_for(&mut [&mut viewer, &mut sensor], Duration::from_millis(100));
    assert_eq!(last(&viewer), Some(Value::from(22.0f32)));
}

// ============================================================================
// 4. Export
// ============================================================================

#[test]
fn test_export_lists_devices_signals_and_maps() {
    let net = LoopbackNetwork::new();
    let mut a = device(&net, "a");
    let mut b = device(&net, "b");
    let out = a.add_signal(SignalSpec::outgoing("out", Type::Float32, 1).bounds(0.0f32, 1.0f32)).unwrap();
    let inp = b.add_signal(SignalSpec::incoming("in", Type::Float32, 1)).unwrap();
    settle(&mut [&mut a, &mut b]);
    let to = b.signal_path(inp).unwrap();
    wait_for_signal(&mut [&mut a, &mut b], &to);
    let map = a.new_map(MapSpec::new([a.signal_path(out).unwrap()], [to]).expression("y=x*2")).unwrap();
    a.push_map(map).unwrap();
    wait_for_map(&mut [&mut a, &mut b], map);

    let mut json = Vec::new();
    export::write_json(b.graph(), &mut json).unwrap();
    let doc: serde_json::Value = serde_json::from_slice(&json).unwrap();
    assert_eq!(doc["devices"].as_array().map(Vec::len), Some(2));
    assert_eq!(doc["signals"].as_array().map(Vec::len), Some(2));
    assert_eq!(doc["maps"][0]["expression"], serde_json::json!("y=x*2"));

    let mut text = Vec::new();
    export::write_text(b.graph(), &mut text).unwrap();
    let text = String::from_utf8(text).unwrap();
    assert!(text.contains(&format!("{}/out -> {}/in [ready] y=x*2", a.name(), b.name())), "{text}");
}

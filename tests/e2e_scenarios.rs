//! End-to-end tests for device discovery, naming and basic map delivery.
//!
//! Every test runs its devices on one thread over a private
//! `LoopbackNetwork`, polling them in turn.

mod common;

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::*;
use libmapper_rs::{
    EventMask, LoopbackNetwork, MapFailure, MapSpec, MapStatus, SignalFilter, SignalSpec, Type, Value,
};

// ============================================================================
// 1. Linear scaling through an expression map
// ============================================================================

#[test]
fn test_linear_expression_map() {
    let net = LoopbackNetwork::new();
    let mut src = device(&net, "src");
    let mut dst = device(&net, "dst");
    let outsig = src
        .add_signal(SignalSpec::outgoing("outsig", Type::Float32, 1).bounds(0.0f32, 1000.0f32))
        .unwrap();
    let insig = dst
        .add_signal(SignalSpec::incoming("insig", Type::Float32, 1).bounds(0.0f32, 1.0f32))
        .unwrap();
    settle(&mut [&mut src, &mut dst]);

    let from = src.signal_path(outsig).unwrap();
    let to = dst.signal_path(insig).unwrap();
    wait_for_signal(&mut [&mut src, &mut dst], &to);

    let map = src.new_map(MapSpec::new([from], [to]).expression("y=linear(x,0,100,0,3)")).unwrap();
    src.push_map(map).unwrap();
    wait_for_map(&mut [&mut src, &mut dst], map);
    assert!(src.map(map).unwrap().is_ready());

    src.set_value(outsig, 50.0f32).unwrap();
    assert!(run_until(&mut [&mut src, &mut dst], |ds| float(&ds[1], insig).is_some()));
    let got = float(&dst, insig).unwrap();
    assert!((got - 1.5).abs() < 1e-6, "got {got}");
}

// ============================================================================
// 2. Clashing name prefixes get distinct ordinals
// ============================================================================

#[test]
fn test_name_collision_resolves() {
    let net = LoopbackNetwork::new();
    let mut a = device(&net, "dev");
    let mut b = device(&net, "dev");
    settle(&mut [&mut a, &mut b]);

    let mut names = vec![a.name().to_string(), b.name().to_string()];
    names.sort();
    assert_eq!(names, vec!["dev.0", "dev.1"]);
    assert_ne!(a.id(), b.id());
}

#[test]
fn test_late_joiner_skips_taken_name() {
    let net = LoopbackNetwork::new();
    let mut first = device(&net, "synth");
    settle(&mut [&mut first]);
    assert_eq!(first.name(), "synth.0");

    let mut second = device(&net, "synth");
    settle(&mut [&mut first, &mut second]);
    assert_eq!(first.name(), "synth.0");
    assert_eq!(second.name(), "synth.1");
}

// ============================================================================
// 3. Releasing a map stops delivery
// ============================================================================

#[test]
fn test_release_stops_delivery() {
    let net = LoopbackNetwork::new();
    let mut src = device(&net, "src");
    let mut dst = device(&net, "dst");
    let out = src.add_signal(SignalSpec::outgoing("out", Type::Int32, 1)).unwrap();
    let inp = dst.add_signal(SignalSpec::incoming("in", Type::Int32, 1)).unwrap();
    settle(&mut [&mut src, &mut dst]);
    let to = dst.signal_path(inp).unwrap();
    wait_for_signal(&mut [&mut src, &mut dst], &to);

    let map = src.new_map(MapSpec::new([src.signal_path(out).unwrap()], [to])).unwrap();
    src.push_map(map).unwrap();
    wait_for_map(&mut [&mut src, &mut dst], map);

    src.set_value(out, 1).unwrap();
    assert!(run_until(&mut [&mut src, &mut dst], |ds| ds[1].value(inp).is_some()));

    src.release_map(map).unwrap();
    assert_eq!(*src.map(map).unwrap().status(), MapStatus::Released);
    src.set_value(out, 2).unwrap();
    run_for(&mut [&mut src, &mut dst], Duration::from_millis(150));

    assert_eq!(dst.value(inp).map(|(v, _)| v), Some(Value::from(1)));
    assert!(dst.graph().map(map).is_none());
    assert!(src.graph().map(map).is_none());
}

#[test]
fn test_released_map_can_be_recreated() {
    let net = LoopbackNetwork::new();
    let mut src = device(&net, "src");
    let mut dst = device(&net, "dst");
    let out = src.add_signal(SignalSpec::outgoing("out", Type::Int32, 1)).unwrap();
    let inp = dst.add_signal(SignalSpec::incoming("in", Type::Int32, 1)).unwrap();
    settle(&mut [&mut src, &mut dst]);
    let from = src.signal_path(out).unwrap();
    let to = dst.signal_path(inp).unwrap();
    wait_for_signal(&mut [&mut src, &mut dst], &to);

    let first = src.new_map(MapSpec::new([from.clone()], [to.clone()])).unwrap();
    src.push_map(first).unwrap();
    wait_for_map(&mut [&mut src, &mut dst], first);
    src.release_map(first).unwrap();
    assert!(run_until(&mut [&mut src, &mut dst], |ds| ds[1].graph().map(first).is_none()));

    let second = src.new_map(MapSpec::new([from], [to])).unwrap();
    assert_ne!(first, second);
    src.push_map(second).unwrap();
    wait_for_map(&mut [&mut src, &mut dst], second);

    src.set_value(out, 11).unwrap();
    assert!(run_until(&mut [&mut src, &mut dst], |ds| ds[1].value(inp).is_some()));
    assert_eq!(dst.value(inp).unwrap().0, Value::from(11));
    // The released map stays gone.
    run_for(&mut [&mut src, &mut dst], Duration::from_millis(200));
    assert!(dst.graph().map(first).is_none());
    assert!(dst.graph().map(second).is_some_and(|m| m.status == MapStatus::Ready));
}

#[test]
fn test_updates_before_poll_arrive_in_order() {
    let net = LoopbackNetwork::new();
    let mut src = device(&net, "src");
    let mut dst = device(&net, "dst");
    let out = src.add_signal(SignalSpec::outgoing("out", Type::Int32, 1)).unwrap();
    let inp = dst.add_signal(SignalSpec::incoming("in", Type::Int32, 1)).unwrap();
    let seen: Arc<Mutex<Vec<f64>>> = Arc::default();
    let sink = seen.clone();
    dst.on_signal(inp, EventMask::UPDATE, move |e| {
        sink.lock().unwrap().extend(e.value.and_then(|v| v.get(0)));
    })
    .unwrap();
    settle(&mut [&mut src, &mut dst]);
    let to = dst.signal_path(inp).unwrap();
    wait_for_signal(&mut [&mut src, &mut dst], &to);

    let map = src.new_map(MapSpec::new([src.signal_path(out).unwrap()], [to])).unwrap();
    src.push_map(map).unwrap();
    wait_for_map(&mut [&mut src, &mut dst], map);

    // No coalescing: every update is delivered, oldest first.
    for v in [1, 2, 3] {
        src.set_value(out, v).unwrap();
    }
    assert!(run_until(&mut [&mut src, &mut dst], |_| seen.lock().unwrap().len() >= 3));
    assert_eq!(*seen.lock().unwrap(), vec![1.0, 2.0, 3.0]);
    assert_eq!(dst.value(inp).unwrap().0, Value::from(3));
}

// ============================================================================
// 4. A silent device expires from peers' graphs
// ============================================================================

#[test]
fn test_silent_device_expires_with_its_maps() {
    let net = LoopbackNetwork::new();
    let mut a = device(&net, "a");
    let mut b = device(&net, "b");
    let mut gone = device(&net, "gone");
    let out = a.add_signal(SignalSpec::outgoing("out", Type::Float32, 1)).unwrap();
    let inp = gone.add_signal(SignalSpec::incoming("in", Type::Float32, 1)).unwrap();
    settle(&mut [&mut a, &mut b, &mut gone]);
    let to = gone.signal_path(inp).unwrap();
    wait_for_signal(&mut [&mut a, &mut b, &mut gone], &to);

    let map = a.new_map(MapSpec::new([a.signal_path(out).unwrap()], [to.clone()])).unwrap();
    a.push_map(map).unwrap();
    wait_for_map(&mut [&mut a, &mut b, &mut gone], map);

    // `gone` stops polling.
    let gone_name = gone.name().to_string();
    let expired = run_until(&mut [&mut a, &mut b], |ds| {
        ds.iter().all(|d| d.graph().device(&gone_name).is_none())
    });
    assert!(expired);

    for d in [&a, &b] {
        assert!(d.graph().signal(&to).is_none());
        assert!(d.graph().map(map).is_none());
        assert_eq!(d.graph().signals(SignalFilter::all().device(gone_name.as_str())).count(), 0);
    }
    assert_eq!(*a.map(map).unwrap().status(), MapStatus::Released);
}

// ============================================================================
// 5. Raw maps copy values exactly
// ============================================================================

#[test]
fn test_raw_map_is_bit_exact() {
    let net = LoopbackNetwork::new();
    let mut src = device(&net, "src");
    let mut dst = device(&net, "dst");
    let ints = src.add_signal(SignalSpec::outgoing("ints", Type::Int32, 2)).unwrap();
    let doubles = src.add_signal(SignalSpec::outgoing("doubles", Type::Float64, 1)).unwrap();
    let ints_in = dst.add_signal(SignalSpec::incoming("ints", Type::Int32, 2)).unwrap();
    let doubles_in = dst.add_signal(SignalSpec::incoming("doubles", Type::Float64, 1)).unwrap();
    settle(&mut [&mut src, &mut dst]);
    for sig in [ints_in, doubles_in] {
        let path = dst.signal_path(sig).unwrap();
        wait_for_signal(&mut [&mut src, &mut dst], &path);
    }

    for (from, to) in [(ints, ints_in), (doubles, doubles_in)] {
        let spec = MapSpec::new([src.signal_path(from).unwrap()], [dst.signal_path(to).unwrap()]);
        let map = src.new_map(spec).unwrap();
        src.push_map(map).unwrap();
        wait_for_map(&mut [&mut src, &mut dst], map);
    }

    src.set_value(ints, [i32::MAX, -7]).unwrap();
    src.set_value(doubles, 0.1f64).unwrap();
    assert!(run_until(&mut [&mut src, &mut dst], |ds| {
        ds[1].value(ints_in).is_some() && ds[1].value(doubles_in).is_some()
    }));
    assert_eq!(dst.value(ints_in).unwrap().0, Value::from([i32::MAX, -7]));
    assert_eq!(dst.value(doubles_in).unwrap().0, Value::from(0.1f64));
}

// ============================================================================
// 6. Incompatible signals never become ready
// ============================================================================

#[test]
fn test_length_mismatch_fails() {
    let net = LoopbackNetwork::new();
    let mut src = device(&net, "src");
    let mut dst = device(&net, "dst");
    let out = src.add_signal(SignalSpec::outgoing("pair", Type::Float32, 2)).unwrap();
    let inp = dst.add_signal(SignalSpec::incoming("triple", Type::Float32, 3)).unwrap();
    settle(&mut [&mut src, &mut dst]);
    let to = dst.signal_path(inp).unwrap();
    wait_for_signal(&mut [&mut src, &mut dst], &to);

    let map = src.new_map(MapSpec::new([src.signal_path(out).unwrap()], [to])).unwrap();
    src.push_map(map).unwrap();
    let failed = run_until(&mut [&mut src, &mut dst], |ds| {
        matches!(ds[0].map(map).unwrap().status(), MapStatus::Failed(_))
    });
    assert!(failed);
    assert_eq!(
        *src.map(map).unwrap().status(),
        MapStatus::Failed(MapFailure::LengthMismatch { expected: 3, got: 2 })
    );

    run_for(&mut [&mut src, &mut dst], Duration::from_millis(100));
    assert!(!src.map(map).unwrap().is_ready());
}

// ============================================================================
// 7. Device departure
// ============================================================================

#[test]
fn test_free_logs_out_immediately() {
    let net = LoopbackNetwork::new();
    let mut a = device(&net, "a");
    let mut b = device(&net, "b");
    b.add_signal(SignalSpec::outgoing("out", Type::Int32, 1)).unwrap();
    settle(&mut [&mut a, &mut b]);
    let b_name = b.name().to_string();
    assert!(run_until(&mut [&mut a, &mut b], |ds| ds[0].graph().signal_count() == 1));

    b.free();
    // Well within the liveness timeout.
    assert!(run_until(&mut [&mut a], |ds| ds[0].graph().device(&b_name).is_none()));
    assert_eq!(a.graph().signal_count(), 0);
}

#[test]
fn test_new_map_requires_name() {
    let net = LoopbackNetwork::new();
    let mut a = device(&net, "a");
    let spec = MapSpec::between("a.0/out", "b.0/in").unwrap();
    assert!(matches!(a.new_map(spec), Err(libmapper_rs::Error::NotReady(_))));
}

// ============================================================================
// 8. Lost negotiation traffic is repaired
// ============================================================================

#[test]
fn test_lost_ready_announcement_is_repeated() {
    let net = LoopbackNetwork::new();
    let (mut src, dropped) = lossy_device(&net, "src", "/mapped", 1);
    let mut dst = device(&net, "dst");
    let out = src.add_signal(SignalSpec::outgoing("out", Type::Float32, 1)).unwrap();
    let inp = dst.add_signal(SignalSpec::incoming("in", Type::Float32, 1)).unwrap();
    settle(&mut [&mut src, &mut dst]);
    let to = dst.signal_path(inp).unwrap();
    wait_for_signal(&mut [&mut src, &mut dst], &to);

    let map = src.new_map(MapSpec::new([src.signal_path(out).unwrap()], [to])).unwrap();
    src.push_map(map).unwrap();
    wait_for_map(&mut [&mut src, &mut dst], map);
    assert_eq!(dropped.load(Ordering::SeqCst), 1);

    src.set_value(out, 0.75f32).unwrap();
    assert!(run_until(&mut [&mut src, &mut dst], |ds| ds[1].value(inp).is_some()));
    assert_eq!(float(&dst, inp), Some(0.75));
}

#[test]
fn test_lost_unmap_is_repeated() {
    let net = LoopbackNetwork::new();
    let (mut src, dropped) = lossy_device(&net, "src", "/unmap", 1);
    let mut dst = device(&net, "dst");
    let out = src.add_signal(SignalSpec::outgoing("out", Type::Float32, 1)).unwrap();
    let inp = dst.add_signal(SignalSpec::incoming("in", Type::Float32, 1)).unwrap();
    settle(&mut [&mut src, &mut dst]);
    let to = dst.signal_path(inp).unwrap();
    wait_for_signal(&mut [&mut src, &mut dst], &to);

    let map = src.new_map(MapSpec::new([src.signal_path(out).unwrap()], [to])).unwrap();
    src.push_map(map).unwrap();
    wait_for_map(&mut [&mut src, &mut dst], map);

    src.release_map(map).unwrap();
    assert!(run_until(&mut [&mut src, &mut dst], |ds| ds[1].graph().map(map).is_none()));
    assert_eq!(dropped.load(Ordering::SeqCst), 1);

    src.set_value(out, 1.0f32).unwrap();
    run_for(&mut [&mut src, &mut dst], Duration::from_millis(100));
    assert!(dst.value(inp).is_none());
}

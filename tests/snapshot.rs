/// Snapshot round-trips: serialize mid-execution, restore into a fresh
/// runtime, resume, and observe identical behaviour; plus the checkpoint
/// file protocol.
use cityvm::interp::Runtime;
use cityvm::intrinsics::NativeImpl;
use cityvm::snapshot;
use cityvm::value::Value;

const LOOP_SRC: &str = "var x = 0; for (var i = 0; i < 3; i++) x += i; x;";

fn global(rt: &Runtime, name: &str) -> Value {
    rt.heap.lookup(rt.global, name).unwrap_or(Value::Undefined)
}

#[test]
fn restore_mid_loop_resumes_to_the_same_result() {
    let mut rt = Runtime::boot();
    rt.append_code(LOOP_SRC).expect("parses");

    // Step partway into the loop, somewhere mid-expression.
    for _ in 0..25 {
        assert!(rt.step().expect("step"), "program should not finish this early");
    }
    let text = snapshot::serialize(&rt);

    // The original continues to completion.
    assert!(!rt.run().expect("original run"));
    assert_eq!(rt.value(), Value::Num(3.0));

    // A fresh process restores and reaches the same final state.
    let mut fresh = Runtime::new();
    snapshot::restore(&mut fresh, &text).expect("restore");
    assert!(!fresh.run().expect("restored run"));
    assert_eq!(fresh.value(), Value::Num(3.0));
    assert_eq!(global(&fresh, "x"), Value::Num(3.0));
    assert_eq!(global(&fresh, "i"), Value::Num(3.0));
}

#[test]
fn every_interruption_point_restores_identically() {
    // Serialize after every single step of the whole program and make sure
    // each restored copy still produces the final value.
    let reference = {
        let mut rt = Runtime::boot();
        rt.append_code(LOOP_SRC).expect("parses");
        assert!(!rt.run().expect("runs"));
        rt.value()
    };
    let mut rt = Runtime::boot();
    rt.append_code(LOOP_SRC).expect("parses");
    let mut steps = 0;
    loop {
        let text = snapshot::serialize(&rt);
        let mut fresh = Runtime::new();
        snapshot::restore(&mut fresh, &text).expect("restore");
        assert!(!fresh.run().expect("restored run"), "restored copy runs to completion");
        assert_eq!(fresh.value(), reference, "diverged after {} steps", steps);
        if !rt.step().expect("step") {
            break;
        }
        steps += 1;
        assert!(steps < 100_000, "runaway program");
    }
}

#[test]
fn re_snapshot_is_byte_identical() {
    let mut rt = Runtime::boot();
    rt.append_code("var o = { a: [1, 2], b: 'x' }; o.self = o; function f(n) { return n; }")
        .expect("parses");
    for _ in 0..10 {
        rt.step().expect("step");
    }
    let first = snapshot::serialize(&rt);
    let mut fresh = Runtime::new();
    snapshot::restore(&mut fresh, &first).expect("restore");
    let second = snapshot::serialize(&fresh);
    assert_eq!(first, second);
}

#[test]
fn closures_and_cycles_survive_the_round_trip() {
    let mut rt = Runtime::boot();
    rt.append_code(
        "var counter = (function() { var n = 0; return function() { n++; return n; }; })(); \
         counter(); counter(); \
         var ring = { name: 'a' }; ring.next = { name: 'b', next: ring };",
    )
    .expect("parses");
    assert!(!rt.run().expect("runs"));

    let text = snapshot::serialize(&rt);
    let mut fresh = Runtime::new();
    snapshot::restore(&mut fresh, &text).expect("restore");

    // The closure keeps counting from its captured state.
    fresh
        .append_code("var third = counter(); var loopName = ring.next.next.name;")
        .expect("append parses");
    assert!(!fresh.run().expect("appended run"));
    assert_eq!(global(&fresh, "third"), Value::Num(3.0));
    assert_eq!(global(&fresh, "loopName"), Value::Str("a".into()));
}

#[test]
fn snapshot_taken_inside_a_call_restores_the_call() {
    let src = "function fib(n) { return n < 2 ? n : fib(n - 1) + fib(n - 2); } var r = fib(10);";
    let mut rt = Runtime::boot();
    rt.append_code(src).expect("parses");
    for _ in 0..500 {
        assert!(rt.step().expect("step"), "fib(10) takes more than 500 steps");
    }
    let text = snapshot::serialize(&rt);
    let mut fresh = Runtime::new();
    snapshot::restore(&mut fresh, &text).expect("restore");
    assert!(!fresh.run().expect("restored run"));
    assert_eq!(global(&fresh, "r"), Value::Num(55.0));
}

#[test]
fn checkpoint_files_are_written_atomically() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut rt = Runtime::boot();
    rt.append_code("var marker = 'persisted';").expect("parses");
    assert!(!rt.run().expect("runs"));

    rt.pause();
    let path = snapshot::write_checkpoint(&rt, dir.path()).expect("checkpoint");
    rt.resume();

    let name = path.file_name().expect("file name").to_string_lossy().to_string();
    assert!(name.ends_with(".city"), "snapshot name: {}", name);
    assert!(cityvm::retention::parse_snapshot_name(&name).is_some());

    // No partial file left behind.
    let partials: Vec<_> = std::fs::read_dir(dir.path())
        .expect("read dir")
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".partial"))
        .collect();
    assert!(partials.is_empty());

    let mut fresh = Runtime::new();
    snapshot::load_file(&mut fresh, &path).expect("load");
    assert_eq!(global(&fresh, "marker"), Value::Str("persisted".into()));
}

#[test]
fn checkpoint_write_failure_leaves_no_partial_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let missing = dir.path().join("no-such-subdir");
    let rt = Runtime::boot();
    assert!(snapshot::write_checkpoint(&rt, &missing).is_err());
    // The parent directory stays clean.
    assert_eq!(std::fs::read_dir(dir.path()).expect("read dir").count(), 0);
}

fn noop_initiator(_rt: &mut Runtime, _this: &Value, _args: &[Value]) {}

#[test]
fn restoring_an_async_waiting_snapshot_stays_paused() {
    let mut rt = Runtime::boot();
    let tag = rt.natives.register("test.defer", 0, NativeImpl::Async(noop_initiator));
    let f = rt.heap.new_async_native_func(tag, 0);
    rt.heap.declare(rt.global, "defer", Value::Obj(f), false);
    rt.append_code("var got = defer();").expect("parses");
    assert!(rt.run().expect("runs to the async call"));

    let text = snapshot::serialize(&rt);
    let mut fresh = Runtime::new();
    fresh.natives.register("test.defer", 0, NativeImpl::Async(noop_initiator));
    snapshot::restore(&mut fresh, &text).expect("restore");

    // The call frame is still parked; the host must complete it.
    assert!(fresh.paused);
    fresh.complete_async(Value::Num(7.0));
    assert!(!fresh.run().expect("completes"));
    assert_eq!(global(&fresh, "got"), Value::Num(7.0));
}

#[test]
fn restore_rejects_unknown_native_tags() {
    let mut rt = Runtime::boot();
    let tag = rt.natives.register("test.defer", 0, NativeImpl::Async(noop_initiator));
    let f = rt.heap.new_async_native_func(tag, 0);
    rt.heap.declare(rt.global, "defer", Value::Obj(f), false);
    let text = snapshot::serialize(&rt);

    // A build without the extra native refuses the snapshot.
    let mut fresh = Runtime::new();
    assert!(matches!(
        snapshot::restore(&mut fresh, &text),
        Err(cityvm::SnapshotError::UnknownNative { .. })
    ));
}

#[test]
fn snapshot_text_is_one_record_per_line() {
    let rt = Runtime::boot();
    let text = snapshot::serialize(&rt);
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.first(), Some(&"["));
    assert_eq!(lines.last(), Some(&"]"));
    // Every interior line is a single JSON object record.
    for line in &lines[1..lines.len() - 1] {
        let trimmed = line.trim_end_matches(',');
        let parsed: serde_json::Value = serde_json::from_str(trimmed).expect("record parses");
        assert!(parsed.is_object());
    }
    // And the whole file is itself valid JSON.
    let whole: serde_json::Value = serde_json::from_str(&text).expect("whole file parses");
    assert!(whole.is_array());
}

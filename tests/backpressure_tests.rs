//! Integration tests for bounded-queue backpressure and stop semantics.

use millrace::error::Result;
use millrace::frame::{Bundle, PixelFormat, VideoFrame};
use millrace::module::{Module, Output, ParamMap};
use millrace::pipeline::Pipeline;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

fn make_frame(stream: &str, frame_id: i64) -> VideoFrame {
    VideoFrame::new(stream, frame_id, PixelFormat::Bgr24, 2, 2)
}

fn wait_until(mut cond: impl FnMut() -> bool, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!("timed out waiting for {what}");
}

/// A parallelism-0 stand-in for a source module.
struct Feeder {
    name: String,
}

impl Module for Feeder {
    fn name(&self) -> &str {
        &self.name
    }
    fn open(&mut self, _params: &ParamMap) -> bool {
        true
    }
    fn process(&self, _bundle: &Arc<Bundle>) -> Result<Output> {
        Ok(Output::Discard)
    }
    fn close(&mut self) {}
}

/// A sink whose process call blocks until the gate opens.
struct GatedSink {
    name: String,
    gate: Arc<(Mutex<bool>, Condvar)>,
    seen: Arc<AtomicUsize>,
}

impl GatedSink {
    fn open_gate(gate: &Arc<(Mutex<bool>, Condvar)>) {
        let (lock, cvar) = &**gate;
        *lock.lock().unwrap() = true;
        cvar.notify_all();
    }
}

impl Module for GatedSink {
    fn name(&self) -> &str {
        &self.name
    }
    fn open(&mut self, _params: &ParamMap) -> bool {
        true
    }
    fn process(&self, _bundle: &Arc<Bundle>) -> Result<Output> {
        let (lock, cvar) = &*self.gate;
        let mut open = lock.lock().unwrap();
        while !*open {
            open = cvar.wait(open).unwrap();
        }
        drop(open);
        self.seen.fetch_add(1, Ordering::SeqCst);
        Ok(Output::Discard)
    }
    fn close(&mut self) {}
}

fn gated_pipeline(
    capacity: usize,
) -> (Pipeline, Arc<(Mutex<bool>, Condvar)>, Arc<AtomicUsize>) {
    let gate = Arc::new((Mutex::new(false), Condvar::new()));
    let seen = Arc::new(AtomicUsize::new(0));
    let mut pipeline = Pipeline::new("backpressure");
    pipeline
        .add_module(Box::new(Feeder {
            name: "source".into(),
        }))
        .unwrap();
    pipeline
        .add_module(Box::new(GatedSink {
            name: "sink".into(),
            gate: gate.clone(),
            seen: seen.clone(),
        }))
        .unwrap();
    pipeline.set_module_parallelism("source", 0).unwrap();
    pipeline.link_modules("source", "sink", capacity).unwrap();
    pipeline.start().unwrap();
    (pipeline, gate, seen)
}

#[test]
fn full_queue_blocks_producer_until_slot_frees() {
    let (pipeline, gate, seen) = gated_pipeline(2);
    let streams = pipeline.streams();

    let pushed = Arc::new(AtomicUsize::new(0));
    let producer = {
        let pushed = pushed.clone();
        let pipeline_streams = streams.clone();
        let handle = pipeline.handle();
        thread::spawn(move || {
            for i in 0..5 {
                let bundle =
                    Bundle::create(&pipeline_streams, make_frame("cam0", i)).unwrap();
                handle.provide_data("source", bundle).unwrap();
                pushed.fetch_add(1, Ordering::SeqCst);
            }
        })
    };

    // Capacity 2, one bundle parked inside the blocked sink: the producer
    // cannot get all 5 through while the gate is shut.
    thread::sleep(Duration::from_millis(200));
    let stalled_at = pushed.load(Ordering::SeqCst);
    assert!(
        stalled_at < 5,
        "producer should be blocked by the full queue, pushed {stalled_at}"
    );

    GatedSink::open_gate(&gate);
    producer.join().unwrap();
    assert_eq!(pushed.load(Ordering::SeqCst), 5);
    wait_until(|| seen.load(Ordering::SeqCst) == 5, "sink to drain");

    let mut pipeline = pipeline;
    pipeline.stop().unwrap();
}

#[test]
fn stop_unblocks_and_fails_a_stuck_producer() {
    let (pipeline, gate, _seen) = gated_pipeline(1);
    let streams = pipeline.streams();

    let result = Arc::new(Mutex::new(None));
    let producer = {
        let result = result.clone();
        let streams = streams.clone();
        let handle = pipeline.handle();
        thread::spawn(move || {
            for i in 0..10 {
                let bundle = Bundle::create(&streams, make_frame("cam0", i)).unwrap();
                if let Err(e) = handle.provide_data("source", bundle) {
                    *result.lock().unwrap() = Some(e);
                    return;
                }
            }
        })
    };

    // Let the producer wedge against the full queue, then stop from
    // another thread: closing the queues must fail the blocked push
    // immediately, even while the sink is still parked in its current
    // process call.
    thread::sleep(Duration::from_millis(100));
    let stopper = thread::spawn(move || {
        let mut pipeline = pipeline;
        pipeline.stop().unwrap();
    });

    producer.join().unwrap();
    assert!(result.lock().unwrap().is_some());

    // Shutdown is cooperative: the worker finishes its in-flight process
    // call once the gate opens, then observes the closed queue and exits.
    GatedSink::open_gate(&gate);
    stopper.join().unwrap();
}

#[test]
fn enqueue_after_stop_fails_fast() {
    let (pipeline, gate, _seen) = gated_pipeline(4);
    GatedSink::open_gate(&gate);
    let streams = pipeline.streams();

    let mut pipeline = pipeline;
    pipeline.stop().unwrap();

    let started = Instant::now();
    let bundle = Bundle::create(&streams, make_frame("cam0", 0)).unwrap();
    assert!(pipeline.provide_data("source", bundle).is_err());
    // Fail fast: no blocking, no timeout.
    assert!(started.elapsed() < Duration::from_millis(100));
}

#[test]
fn per_stream_frame_limit_bounds_in_flight_bundles() {
    let (pipeline, gate, seen) = gated_pipeline(8);
    let streams = pipeline.streams();
    streams.set_frame_limit(Some(3));

    let mut held = Vec::new();
    for i in 0..3 {
        held.push(Bundle::try_create(&streams, make_frame("cam0", i)).unwrap());
    }
    assert!(matches!(
        Bundle::try_create(&streams, make_frame("cam0", 3)),
        Err(millrace::Error::StreamBusy(_))
    ));

    // Dropping a live bundle frees a slot.
    held.pop();
    let bundle = Bundle::try_create(&streams, make_frame("cam0", 3)).unwrap();

    GatedSink::open_gate(&gate);
    pipeline.provide_data("source", bundle).unwrap();
    wait_until(|| seen.load(Ordering::SeqCst) == 1, "sink to drain");

    let mut pipeline = pipeline;
    pipeline.stop().unwrap();
    drop(held);
}

#[test]
fn idle_workers_unblock_on_stop() {
    // No data at all: every worker is parked in its queue pop. Stop must
    // wake them and join cleanly.
    let (pipeline, _gate, _seen) = gated_pipeline(4);
    thread::sleep(Duration::from_millis(50));
    let mut pipeline = pipeline;
    let started = Instant::now();
    pipeline.stop().unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
}

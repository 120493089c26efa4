//! The data plane: routing, enqueueing, and the per-worker loop.

use super::{NodeRuntime, PipelineCore, RuntimeGraph};
use crate::error::{Error, Result};
use crate::event::{Event, EventKind};
use crate::frame::Bundle;
use crate::metrics::{record_frame_dropped, record_frame_processed, record_process_time};
use crate::module::Output;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace, warn};

/// Observability snapshot of one link's transport state.
#[derive(Debug, Clone)]
pub struct LinkStatus {
    /// Whether data transmission has stopped.
    pub stopped: bool,
    /// Current occupancy of each downstream worker queue.
    pub queue_len: Vec<u32>,
}

/// One queue slot: a shared bundle handle plus the upstream module that
/// sent it (None only for events injected outside the graph).
pub(crate) struct Envelope {
    pub from: Option<u32>,
    pub bundle: Arc<Bundle>,
}

/// Deterministic stream-affinity routing: the same stream id always maps
/// to the same worker index, preserving per-stream order across a module's
/// workers. FNV-1a over the stream id, modulo the worker count.
pub(crate) fn route_index(stream_id: &str, workers: usize) -> usize {
    debug_assert!(workers > 0);
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in stream_id.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    (hash % workers as u64) as usize
}

/// Enqueue an envelope onto `down`'s routed worker queue.
///
/// Blocks while the queue is full; fails fast once the pipeline is
/// stopping (stop closes every queue, which also unblocks waiting
/// producers).
fn push_to(rt: &RuntimeGraph, down: u32, envelope: Envelope) -> Result<()> {
    let node = &rt.nodes[down as usize];
    if node.senders.is_empty() {
        return Err(Error::Transport(format!(
            "module '{}' has no input queues (parallelism 0)",
            node.name
        )));
    }
    let worker = route_index(envelope.bundle.stream_id(), node.senders.len());
    node.senders[worker]
        .send(envelope)
        .map_err(|_| Error::Transport(format!("input queue of '{}' is closed", node.name)))
}

/// Transmit `bundle` as the output of module `from` to every downstream
/// link (fan-out shares the handle, never the payload).
///
/// EOS bundles are not data: they complete `from` for their stream and
/// cascade from there.
pub(crate) fn transmit(core: &PipelineCore, rt: &RuntimeGraph, from: u32, bundle: Arc<Bundle>) -> Result<()> {
    if !core.running.load(Ordering::Acquire) {
        return Err(Error::NotRunning);
    }
    if bundle.is_eos() {
        let stream_id = bundle.stream_id().to_string();
        if core.eos.mark_complete(&stream_id, rt.nodes.len(), from) {
            propagate_eos(core, rt, from, &stream_id)?;
        }
        return Ok(());
    }
    let node = &rt.nodes[from as usize];
    if !bundle.mark_forwarded(from) {
        warn!(
            module = %node.name,
            stream = bundle.stream_id(),
            frame = bundle.frame().frame_id,
            "duplicate completion of a bundle"
        );
    }
    for &down in &node.downstream {
        push_to(
            rt,
            down,
            Envelope {
                from: Some(from),
                bundle: bundle.clone(),
            },
        )?;
    }
    Ok(())
}

/// Module `from` has completed EOS for `stream_id`: forward a fresh
/// sentinel per downstream edge, or record sink completion and raise the
/// stream's EOS event when the last sink finishes.
pub(crate) fn propagate_eos(
    core: &PipelineCore,
    rt: &RuntimeGraph,
    from: u32,
    stream_id: &str,
) -> Result<()> {
    let node = &rt.nodes[from as usize];
    debug!(module = %node.name, stream = stream_id, "module completed eos");
    if node.downstream.is_empty() {
        if core.eos.mark_sink_done(stream_id, from, rt.sink_mask) {
            core.bus.post(Event::for_stream(
                EventKind::Eos,
                node.name.clone(),
                stream_id,
                "stream received eos in all modules",
            ));
        }
        return Ok(());
    }
    for &down in &node.downstream {
        let sentinel = Bundle::eos(&core.streams, stream_id);
        push_to(
            rt,
            down,
            Envelope {
                from: Some(from),
                bundle: sentinel,
            },
        )?;
    }
    Ok(())
}

/// The worker loop for worker `worker` of module `module_idx`.
///
/// Pops one envelope at a time — the queue pop is the only suspension
/// point — intercepts EOS sentinels, gates fan-in arrivals, runs the
/// module's process call, and transmits the result downstream. Exits when
/// the queue closes (pipeline stop).
pub(crate) fn worker_loop(
    core: &PipelineCore,
    rt: &RuntimeGraph,
    module_idx: u32,
    worker: usize,
    rx: kanal::Receiver<Envelope>,
) {
    let node = &rt.nodes[module_idx as usize];
    debug!(module = %node.name, worker, "worker running");

    while let Ok(envelope) = rx.recv() {
        if envelope.bundle.is_eos() {
            handle_eos(core, rt, module_idx, node, &envelope);
            continue;
        }

        // Fan-in gate: with several upstream edges the shared bundle
        // arrives once per edge; only the arrival that completes the
        // upstream set gets processed.
        if node.upstream_count > 1 {
            if let Some(from) = envelope.from {
                let mask = envelope.bundle.record_arrival(module_idx, 1u64 << from);
                if mask & node.upstream_mask != node.upstream_mask {
                    continue;
                }
                envelope.bundle.clear_arrival(module_idx);
            }
        }

        let started = Instant::now();
        let verdict = {
            let module = node.module.read().unwrap();
            module.process(&envelope.bundle)
        };
        let elapsed = started.elapsed();
        node.timer
            .lock()
            .unwrap()
            .dot_ms(elapsed.as_secs_f64() * 1e3, 1);
        record_process_time(&core.name, &node.name, elapsed);

        match verdict {
            Ok(Output::Forward) => {
                record_frame_processed(&core.name, &node.name);
                if let Err(e) = transmit(core, rt, module_idx, envelope.bundle) {
                    trace!(module = %node.name, error = %e, "transmit failed, dropping bundle");
                }
            }
            Ok(Output::Emit(produced)) => {
                record_frame_processed(&core.name, &node.name);
                if let Err(e) = transmit(core, rt, module_idx, produced) {
                    trace!(module = %node.name, error = %e, "transmit failed, dropping bundle");
                }
            }
            Ok(Output::Hold) => {
                trace!(module = %node.name, "module retained bundle for async completion");
            }
            Ok(Output::Discard) => {
                record_frame_processed(&core.name, &node.name);
            }
            Err(e) => {
                record_frame_dropped(&core.name, &node.name);
                core.bus.post(Event::for_stream(
                    EventKind::Error,
                    node.name.clone(),
                    envelope.bundle.stream_id(),
                    format!("frame {}: {e}", envelope.bundle.frame().frame_id),
                ));
                // The bundle is dropped here; subsequent bundles keep
                // flowing.
            }
        }
    }

    debug!(module = %node.name, worker, "worker exited");
}

fn handle_eos(
    core: &PipelineCore,
    rt: &RuntimeGraph,
    module_idx: u32,
    node: &NodeRuntime,
    envelope: &Envelope,
) {
    let stream_id = envelope.bundle.stream_id().to_string();
    let done = match envelope.from {
        Some(from) => core.eos.record_arrival(
            &stream_id,
            rt.nodes.len(),
            module_idx,
            1u64 << from,
            node.upstream_mask,
        ),
        None => core.eos.mark_complete(&stream_id, rt.nodes.len(), module_idx),
    };
    if done {
        if let Err(e) = propagate_eos(core, rt, module_idx, &stream_id) {
            trace!(module = %node.name, error = %e, "eos propagation cut short by stop");
        }
    }
}

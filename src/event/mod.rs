//! Lifecycle event bus.
//!
//! Any worker thread can post events (errors, warnings, EOS, stop
//! requests); a single dedicated poller thread delivers each event to the
//! registered watchers in registration order. Watchers decide how delivery
//! continues: pass the event on, intercept it, or terminate polling
//! entirely (pipeline-wide shutdown on fatal error).

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use tracing::{debug, trace, warn};

/// Kind of a lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Placeholder for default-constructed events.
    Invalid,
    /// A module failed to process a frame, or another fatal condition.
    Error,
    /// A non-fatal issue worth surfacing.
    Warning,
    /// A stream completed in every sink module.
    Eos,
    /// Shutdown requested, usually by the application layer.
    Stop,
}

/// A lifecycle event posted on the bus.
#[derive(Debug, Clone)]
pub struct Event {
    /// Event kind.
    pub kind: EventKind,
    /// Free-form message.
    pub message: String,
    /// Name of the module that posted the event.
    pub module: String,
    /// Stream the event concerns, when it concerns one.
    pub stream_id: Option<String>,
    /// Thread the event was posted from.
    pub thread: ThreadId,
}

impl Event {
    /// Create an event posted from the current thread.
    pub fn new(kind: EventKind, module: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            module: module.into(),
            stream_id: None,
            thread: thread::current().id(),
        }
    }

    /// Create an event tied to a stream.
    pub fn for_stream(
        kind: EventKind,
        module: impl Into<String>,
        stream_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            module: module.into(),
            stream_id: Some(stream_id.into()),
            thread: thread::current().id(),
        }
    }
}

/// How a watcher handled an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchVerdict {
    /// Not handled; keep informing later watchers.
    NotHandled,
    /// Handled; stop informing later watchers for this event.
    Intercepted,
    /// Handled; keep informing later watchers.
    Handled,
    /// Terminate the poller loop entirely.
    StopPolling,
}

/// A watcher callback: receives each event together with the name of the
/// module that registered the watch.
pub type BusWatcher = Box<dyn Fn(&Event, &str) -> WatchVerdict + Send + Sync>;

/// Blocking single-consumer/multi-producer event channel with a watcher
/// chain.
///
/// Producers call [`post`](Self::post) from any thread. The pipeline runs
/// one poller thread ([`start_poller`](Self::start_poller)) that blocks on
/// the queue and walks the watcher list for each event. Watchers may only
/// be added before polling starts; that ordering is enforced by the
/// pipeline, not the bus.
pub struct EventBus {
    tx: kanal::Sender<Event>,
    rx: kanal::Receiver<Event>,
    watchers: Mutex<Vec<(BusWatcher, String)>>,
    stopped: AtomicBool,
}

impl EventBus {
    /// Create a bus with an empty watcher list.
    pub fn new() -> Self {
        let (tx, rx) = kanal::unbounded();
        Self {
            tx,
            rx,
            watchers: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        }
    }

    /// Post an event. Returns false once the bus has been stopped.
    pub fn post(&self, event: Event) -> bool {
        if self.stopped.load(Ordering::Acquire) {
            return false;
        }
        trace!(kind = ?event.kind, module = %event.module, "event posted");
        self.tx.send(event).is_ok()
    }

    /// Register a watcher on behalf of `module`. Returns the watcher count
    /// after registration.
    pub fn add_watcher(&self, watcher: BusWatcher, module: impl Into<String>) -> usize {
        let mut watchers = self.watchers.lock().unwrap();
        watchers.push((watcher, module.into()));
        watchers.len()
    }

    /// Number of registered watchers.
    pub fn watcher_count(&self) -> usize {
        self.watchers.lock().unwrap().len()
    }

    /// Whether the bus still accepts events.
    pub fn is_running(&self) -> bool {
        !self.stopped.load(Ordering::Acquire)
    }

    /// Stop the bus: further posts fail, the poller unblocks and exits.
    /// Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.tx.close();
        debug!("event bus stopped");
    }

    /// Spawn the dedicated poller thread.
    ///
    /// The poller blocks until an event arrives or the bus stops, then
    /// invokes every watcher in registration order, honoring each verdict.
    /// A [`WatchVerdict::StopPolling`] verdict stops the bus and ends the
    /// thread.
    pub fn start_poller(self: Arc<Self>) -> Result<JoinHandle<()>> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(Error::State("event bus already stopped".into()));
        }
        thread::Builder::new()
            .name("event-bus".into())
            .spawn(move || self.poll_loop())
            .map_err(|e| Error::State(format!("failed to spawn event poller: {e}")))
    }

    fn poll_loop(&self) {
        debug!("event poller running");
        while let Ok(event) = self.rx.recv() {
            let watchers = self.watchers.lock().unwrap();
            for (watcher, module) in watchers.iter() {
                match watcher(&event, module) {
                    WatchVerdict::NotHandled | WatchVerdict::Handled => {}
                    WatchVerdict::Intercepted => break,
                    WatchVerdict::StopPolling => {
                        drop(watchers);
                        self.stop();
                        debug!("event poller terminated by watcher");
                        return;
                    }
                }
            }
        }
        if !self.stopped.load(Ordering::Acquire) {
            warn!("event queue closed while bus still marked running");
        }
        debug!("event poller exited");
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

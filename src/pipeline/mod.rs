//! Pipeline construction and execution.
//!
//! The pipeline owns the module graph and the event bus, drives module
//! lifecycle (open all, link all, run worker loops, close all on stop),
//! and exposes [`Pipeline::provide_data`] as the single data-injection
//! point. A pipeline is itself a [`Module`], so pipelines nest.
//!
//! # Example
//!
//! ```rust,ignore
//! use millrace::module::ModuleRegistry;
//! use millrace::pipeline::Pipeline;
//!
//! let registry = ModuleRegistry::with_builtins();
//! let mut pipeline = Pipeline::new("demo");
//! pipeline.build_from_description(
//!     "testsrc name=cam parallelism=0 ! passthrough name=filter ! nullsink name=out",
//!     &registry,
//! )?;
//! pipeline.start()?;
//! // ... inject bundles via pipeline.provide_data("cam", bundle) ...
//! pipeline.stop()?;
//! ```

mod graph;
pub mod parser;
mod streams;
mod transport;

pub use parser::parse_description;
pub use transport::LinkStatus;

pub(crate) use graph::{BuildNode, Graph};
pub(crate) use streams::EosTracker;
pub(crate) use transport::Envelope;

use crate::error::{Error, Result};
use crate::event::{Event, EventBus, EventKind, WatchVerdict};
use crate::frame::{Bundle, StreamRegistry};
use crate::metrics::ProcTimer;
use crate::module::{Module, ModuleConfig, ModuleRegistry, Output, ParamMap};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

/// Lifecycle state of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipelineState {
    /// Topology may still be mutated; nothing runs.
    #[default]
    Constructed,
    /// Workers and the event poller are running.
    Started,
    /// Terminal: everything joined and closed.
    Stopped,
}

/// Kind of a user-visible stream message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMsgType {
    /// The stream received EOS in all sink modules.
    Eos,
    /// Processing failed somewhere in the graph.
    Error,
    /// Application-defined message, `n` in `0..=9`.
    User(u8),
}

/// A message delivered to the registered stream observer.
#[derive(Debug, Clone)]
pub struct StreamMsg {
    /// Message kind.
    pub msg_type: StreamMsgType,
    /// Channel index of the stream; -1 when unknown.
    pub channel_idx: i32,
    /// Stream id; empty when unknown.
    pub stream_id: String,
}

/// Receives stream messages from the pipeline.
///
/// Messages are delivered from the pipeline's event poller thread, never
/// from arbitrary worker threads.
pub trait StreamMsgObserver: Send + Sync {
    /// Handle one stream message.
    fn update(&self, msg: &StreamMsg);
}

/// One module in the frozen runtime graph.
pub(crate) struct NodeRuntime {
    pub name: String,
    pub module: RwLock<Box<dyn Module>>,
    pub parallelism: u32,
    pub senders: Vec<kanal::Sender<Envelope>>,
    pub downstream: Vec<u32>,
    pub upstream_mask: u64,
    pub upstream_count: u32,
    pub timer: Mutex<ProcTimer>,
}

/// A recorded link for status queries.
pub(crate) struct LinkRecord {
    pub id: String,
    pub down: u32,
}

/// The immutable topology snapshot built at start.
pub(crate) struct RuntimeGraph {
    pub nodes: Vec<NodeRuntime>,
    pub by_name: HashMap<String, u32>,
    pub links: Vec<LinkRecord>,
    pub sink_mask: u64,
}

/// State shared between the pipeline, its workers, and its watchers.
pub(crate) struct PipelineCore {
    pub name: String,
    pub running: AtomicBool,
    pub bus: Arc<EventBus>,
    pub streams: Arc<StreamRegistry>,
    pub eos: EosTracker,
    pub observer: Mutex<Option<Arc<dyn StreamMsgObserver>>>,
    pub runtime: OnceLock<RuntimeGraph>,
}

impl PipelineCore {
    /// Transmit `bundle` as the output of `module`.
    pub fn provide_data(&self, module: &str, bundle: Arc<Bundle>) -> Result<()> {
        if !self.running.load(Ordering::Acquire) {
            return Err(Error::NotRunning);
        }
        let rt = self.runtime.get().ok_or(Error::NotRunning)?;
        let idx = *rt
            .by_name
            .get(module)
            .ok_or_else(|| Error::UnknownModule(module.to_string()))?;
        transport::transmit(self, rt, idx, bundle)
    }

    /// Stop accepting data and unblock every queue. Idempotent; safe to
    /// call from the event poller.
    pub fn shutdown_transport(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            debug!(pipeline = %self.name, "transport shutting down");
        }
        if let Some(rt) = self.runtime.get() {
            for node in &rt.nodes {
                for sender in &node.senders {
                    let _ = sender.close();
                }
            }
        }
    }

    fn notify_observer(&self, msg: StreamMsg) {
        let observer = self.observer.lock().unwrap().clone();
        if let Some(observer) = observer {
            observer.update(&msg);
        }
    }

    /// A stream completed in every sink: surface it once and release the
    /// stream's bookkeeping.
    fn finish_stream(&self, stream_id: &str) {
        let channel_idx = self
            .streams
            .channel_index(stream_id)
            .map(|c| c as i32)
            .unwrap_or(-1);
        info!(pipeline = %self.name, stream = stream_id, "stream finished");
        self.notify_observer(StreamMsg {
            msg_type: StreamMsgType::Eos,
            channel_idx,
            stream_id: stream_id.to_string(),
        });
        self.eos.release(stream_id);
        self.streams.finish(stream_id);
    }
}

/// Clonable handle for modules that inject data themselves.
///
/// Source modules and modules using the asynchronous completion pattern
/// ([`Output::Hold`]) receive one through
/// [`Module::set_pipeline`](crate::module::Module::set_pipeline).
#[derive(Clone)]
pub struct PipelineHandle {
    core: Weak<PipelineCore>,
}

impl PipelineHandle {
    /// Transmit `bundle` as the output of `module`.
    /// See [`Pipeline::provide_data`].
    pub fn provide_data(&self, module: &str, bundle: Arc<Bundle>) -> Result<()> {
        self.core
            .upgrade()
            .ok_or(Error::NotRunning)?
            .provide_data(module, bundle)
    }

    /// Post an event on the owning pipeline's bus.
    pub fn post_event(&self, event: Event) -> bool {
        match self.core.upgrade() {
            Some(core) => core.bus.post(event),
            None => false,
        }
    }

    /// The owning pipeline's stream registry, for bundle creation.
    pub fn streams(&self) -> Option<Arc<StreamRegistry>> {
        self.core.upgrade().map(|core| core.streams.clone())
    }

    /// Whether the owning pipeline is running.
    pub fn is_running(&self) -> bool {
        self.core
            .upgrade()
            .map(|core| core.running.load(Ordering::Acquire))
            .unwrap_or(false)
    }
}

/// The manager of modules: owns the graph, the event bus, and every
/// worker thread.
pub struct Pipeline {
    core: Arc<PipelineCore>,
    graph: Option<Graph>,
    configs: HashMap<String, ModuleConfig>,
    state: PipelineState,
    workers: Vec<JoinHandle<()>>,
    poller: Option<JoinHandle<()>>,
}

impl Pipeline {
    /// Create an empty pipeline.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            core: Arc::new(PipelineCore {
                name: name.into(),
                running: AtomicBool::new(false),
                bus: Arc::new(EventBus::new()),
                streams: Arc::new(StreamRegistry::new()),
                eos: EosTracker::new(),
                observer: Mutex::new(None),
                runtime: OnceLock::new(),
            }),
            graph: Some(Graph::new()),
            configs: HashMap::new(),
            state: PipelineState::Constructed,
            workers: Vec::new(),
            poller: None,
        }
    }

    /// The pipeline's name.
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Whether the pipeline is running.
    pub fn is_running(&self) -> bool {
        self.core.running.load(Ordering::Acquire)
    }

    /// The pipeline's event bus.
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.core.bus
    }

    /// The per-stream registry used to create bundles for this pipeline.
    pub fn streams(&self) -> Arc<StreamRegistry> {
        self.core.streams.clone()
    }

    /// A handle modules can use to inject data from their own threads.
    pub fn handle(&self) -> PipelineHandle {
        PipelineHandle {
            core: Arc::downgrade(&self.core),
        }
    }

    /// Register the stream message observer. One observer per pipeline;
    /// replaces any previous registration.
    pub fn set_stream_observer(&self, observer: Arc<dyn StreamMsgObserver>) {
        *self.core.observer.lock().unwrap() = Some(observer);
    }

    /// Deliver a stream message to the registered observer.
    pub fn notify_stream_msg(&self, msg: StreamMsg) {
        self.core.notify_observer(msg);
    }

    /// Add a module with default parallelism (1) and queue capacity.
    ///
    /// The module's own [`name`](Module::name) becomes its graph name.
    pub fn add_module(&mut self, mut module: Box<dyn Module>) -> Result<()> {
        let graph = self.graph_mut()?;
        let name = module.name().to_string();
        if graph.contains(&name) {
            return Err(Error::Graph(format!("module '{name}' already added")));
        }
        module.set_pipeline(PipelineHandle {
            core: Arc::downgrade(&self.core),
        });
        self.graph_mut()?.add(BuildNode {
            name,
            module,
            parallelism: 1,
            queue_capacity: ModuleConfig::DEFAULT_QUEUE_SIZE,
            parameters: ParamMap::new(),
        })?;
        Ok(())
    }

    /// Set a module's worker count. 0 means externally driven.
    pub fn set_module_parallelism(&mut self, module: &str, parallelism: u32) -> Result<()> {
        let graph = self.graph_mut()?;
        let idx = graph.index_of(module)?;
        graph.node_mut(idx).parallelism = parallelism;
        Ok(())
    }

    /// A module's configured worker count, if the module exists.
    pub fn module_parallelism(&self, module: &str) -> Option<u32> {
        let graph = self.graph.as_ref()?;
        let idx = graph.index_of(module).ok()?;
        Some(graph.node(idx).parallelism)
    }

    /// Set the parameters handed to a module's `open`.
    pub fn set_module_parameters(&mut self, module: &str, parameters: ParamMap) -> Result<()> {
        let graph = self.graph_mut()?;
        let idx = graph.index_of(module)?;
        graph.node_mut(idx).parameters = parameters;
        Ok(())
    }

    /// The parameters a module will be opened with. Empty if the module
    /// is unknown.
    pub fn module_parameters(&self, module: &str) -> ParamMap {
        self.graph
            .as_ref()
            .and_then(|graph| graph.index_of(module).ok().map(|idx| graph.node(idx).parameters.clone()))
            .unwrap_or_default()
    }

    /// The configuration record a module was built from, when the module
    /// came in through [`build_pipeline`](Self::build_pipeline).
    pub fn module_config(&self, module: &str) -> Option<&ModuleConfig> {
        self.configs.get(module)
    }

    /// Link two modules. Returns the link id for status queries.
    ///
    /// The downstream module's input queues are created at start with
    /// `queue_capacity` slots each; on a fan-in module the capacity from
    /// its first inbound link wins.
    pub fn link_modules(&mut self, up: &str, down: &str, queue_capacity: usize) -> Result<String> {
        if queue_capacity == 0 {
            return Err(Error::InvalidArgument(
                "queue capacity must be at least 1".into(),
            ));
        }
        let graph = self.graph_mut()?;
        let down_idx = graph.index_of(down)?;
        let first_inbound = graph.upstream_mask(down_idx) == 0;
        let id = graph.link(up, down)?;
        let node = graph.node_mut(down_idx);
        if first_inbound {
            node.queue_capacity = queue_capacity;
        } else if node.queue_capacity != queue_capacity {
            warn!(
                module = down,
                configured = node.queue_capacity,
                requested = queue_capacity,
                "fan-in module keeps the queue capacity of its first inbound link"
            );
        }
        Ok(id)
    }

    /// All link ids, in creation order.
    pub fn link_ids(&self) -> Vec<String> {
        if let Some(rt) = self.core.runtime.get() {
            return rt.links.iter().map(|link| link.id.clone()).collect();
        }
        self.graph
            .as_ref()
            .map(|graph| graph.links().into_iter().map(|(id, ..)| id).collect())
            .unwrap_or_default()
    }

    /// Best-effort snapshot of a link's transport state. Never blocks.
    pub fn query_link_status(&self, link_id: &str) -> Option<LinkStatus> {
        if let Some(rt) = self.core.runtime.get() {
            let link = rt.links.iter().find(|link| link.id == link_id)?;
            let node = &rt.nodes[link.down as usize];
            return Some(LinkStatus {
                stopped: !self.is_running(),
                queue_len: node.senders.iter().map(|s| s.len() as u32).collect(),
            });
        }
        let graph = self.graph.as_ref()?;
        let (_, _, down) = graph
            .links()
            .into_iter()
            .find(|(id, ..)| id.as_str() == link_id)?;
        let node = graph.node(daggy::NodeIndex::new(down as usize));
        Some(LinkStatus {
            stopped: true,
            queue_len: vec![0; node.parallelism.max(1) as usize],
        })
    }

    /// Build modules and links from configuration records.
    ///
    /// Fails atomically: every name, class, and downstream reference is
    /// validated (including acyclicity) before anything is instantiated.
    pub fn build_pipeline(
        &mut self,
        configs: &[ModuleConfig],
        registry: &ModuleRegistry,
    ) -> Result<()> {
        {
            let graph = self.graph_ref()?;
            graph.validate_configs(configs, registry)?;
        }
        for config in configs {
            let mut module = registry.create(&config.class_name, &config.name)?;
            module.set_pipeline(PipelineHandle {
                core: Arc::downgrade(&self.core),
            });
            self.graph_mut()?.add(BuildNode {
                name: config.name.clone(),
                module,
                parallelism: config.parallelism,
                queue_capacity: config.max_input_queue_size,
                parameters: config.parameters.clone(),
            })?;
            self.configs.insert(config.name.clone(), config.clone());
        }
        for config in configs {
            for next in &config.next {
                let capacity = self
                    .configs
                    .get(next)
                    .map(|c| c.max_input_queue_size)
                    .unwrap_or(ModuleConfig::DEFAULT_QUEUE_SIZE);
                self.link_modules(&config.name, next, capacity)?;
            }
        }
        Ok(())
    }

    /// Build modules and links from a textual description.
    /// See [`parser`] for the syntax.
    pub fn build_from_description(
        &mut self,
        description: &str,
        registry: &ModuleRegistry,
    ) -> Result<()> {
        let configs = parser::parse_description(description)?;
        self.build_pipeline(&configs, registry)
    }

    /// Start the pipeline: open every module, freeze the topology, spin
    /// up the event poller and all worker threads.
    ///
    /// Any `open` failure aborts startup — already-opened modules are
    /// closed again, no thread is created, and the pipeline stays
    /// `Constructed`.
    pub fn start(&mut self) -> Result<()> {
        if self.state != PipelineState::Constructed {
            return Err(Error::State(format!(
                "cannot start from {:?}",
                self.state
            )));
        }
        let graph = self.graph_ref()?;
        if graph.is_empty() {
            return Err(Error::Graph("pipeline has no modules".into()));
        }
        // A module that receives data needs workers to drain its queues.
        for (idx, node) in graph.nodes() {
            if node.parallelism == 0 && graph.upstream_mask(idx) != 0 {
                return Err(Error::Graph(format!(
                    "module '{}' has inbound links but parallelism 0",
                    node.name
                )));
            }
        }

        // Open all modules; unwind on the first failure.
        let mut opened: Vec<daggy::NodeIndex> = Vec::new();
        let node_indices: Vec<_> = graph.nodes().map(|(idx, _)| idx).collect();
        for idx in node_indices {
            let graph = self.graph_mut()?;
            let params = graph.node(idx).parameters.clone();
            let node = graph.node_mut(idx);
            if node.module.open(&params) {
                opened.push(idx);
                continue;
            }
            let failed = node.name.clone();
            warn!(pipeline = %self.core.name, module = %failed, "module open failed");
            for idx in opened.into_iter().rev() {
                self.graph_mut()?.node_mut(idx).module.close();
            }
            return Err(Error::ModuleOpen(failed));
        }

        // Freeze the topology.
        let graph = self.graph.take().ok_or_else(|| {
            Error::State("pipeline graph already consumed".into())
        })?;
        let mut receivers: Vec<Vec<kanal::Receiver<Envelope>>> = Vec::new();
        let mut shells: Vec<(String, u32, usize, Vec<u32>, u64)> = Vec::new();
        let mut sink_mask = 0u64;
        for (idx, node) in graph.nodes() {
            let downstream = graph.downstream(idx);
            let upstream_mask = graph.upstream_mask(idx);
            if downstream.is_empty() {
                sink_mask |= 1u64 << idx.index();
            }
            shells.push((
                node.name.clone(),
                node.parallelism,
                node.queue_capacity,
                downstream,
                upstream_mask,
            ));
        }
        let links = graph
            .links()
            .into_iter()
            .map(|(id, _, down)| LinkRecord { id, down })
            .collect();
        let modules = graph.take_modules();

        let mut nodes = Vec::with_capacity(modules.len());
        let mut by_name = HashMap::new();
        for (i, (build, (name, parallelism, queue_capacity, downstream, upstream_mask))) in
            modules.into_iter().zip(shells).enumerate()
        {
            let mut senders = Vec::new();
            let mut node_receivers = Vec::new();
            for _ in 0..parallelism {
                let (tx, rx) = kanal::bounded(queue_capacity);
                senders.push(tx);
                node_receivers.push(rx);
            }
            receivers.push(node_receivers);
            by_name.insert(name.clone(), i as u32);
            nodes.push(NodeRuntime {
                name,
                module: RwLock::new(build.module),
                parallelism,
                senders,
                downstream,
                upstream_count: upstream_mask.count_ones(),
                upstream_mask,
                timer: Mutex::new(ProcTimer::new()),
            });
        }
        let runtime = RuntimeGraph {
            nodes,
            by_name,
            links,
            sink_mask,
        };
        if self.core.runtime.set(runtime).is_err() {
            return Err(Error::State("pipeline runtime already built".into()));
        }

        // The default watch runs after any user watchers, so applications
        // get the chance to intercept errors before they stop the world.
        let weak = Arc::downgrade(&self.core);
        self.core.bus.add_watcher(
            Box::new(move |event, _module| default_bus_watch(&weak, event)),
            self.core.name.clone(),
        );

        self.core.running.store(true, Ordering::Release);
        self.poller = Some(self.core.bus.clone().start_poller()?);

        let rt = self.core.runtime.get().ok_or(Error::NotRunning)?;
        for (i, node_receivers) in receivers.into_iter().enumerate() {
            for (w, rx) in node_receivers.into_iter().enumerate() {
                let core = self.core.clone();
                let handle = std::thread::Builder::new()
                    .name(format!("{}-w{w}", rt.nodes[i].name))
                    .spawn(move || {
                        let Some(rt) = core.runtime.get() else {
                            return;
                        };
                        transport::worker_loop(&core, rt, i as u32, w, rx);
                    })
                    .map_err(|e| Error::State(format!("failed to spawn worker: {e}")))?;
                self.workers.push(handle);
            }
        }

        self.state = PipelineState::Started;
        info!(
            pipeline = %self.core.name,
            modules = rt.nodes.len(),
            workers = self.workers.len(),
            "pipeline started"
        );
        Ok(())
    }

    /// Stop the pipeline: fail-fast all producers, join every worker,
    /// close every module, stop the event bus. Idempotent.
    pub fn stop(&mut self) -> Result<()> {
        match self.state {
            PipelineState::Stopped => return Ok(()),
            PipelineState::Constructed => {
                self.state = PipelineState::Stopped;
                return Ok(());
            }
            PipelineState::Started => {}
        }

        self.core.shutdown_transport();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!(pipeline = %self.core.name, "worker panicked during shutdown");
            }
        }
        if let Some(rt) = self.core.runtime.get() {
            for node in &rt.nodes {
                node.module.write().unwrap().close();
            }
        }
        self.core.bus.stop();
        if let Some(poller) = self.poller.take() {
            if poller.join().is_err() {
                warn!(pipeline = %self.core.name, "event poller panicked during shutdown");
            }
        }
        self.state = PipelineState::Stopped;
        info!(pipeline = %self.core.name, "pipeline stopped");
        Ok(())
    }

    /// Inject `bundle` as the output of `module`.
    ///
    /// This is the sole mid-graph injection point, used by source modules
    /// (parallelism 0) and by modules completing transmission
    /// asynchronously. Fails when the module is unknown or the pipeline
    /// is not started.
    pub fn provide_data(&self, module: &str, bundle: Arc<Bundle>) -> Result<()> {
        self.core.provide_data(module, bundle)
    }

    /// Log every module's frame count, average latency, and fps.
    pub fn print_performance(&self) {
        let Some(rt) = self.core.runtime.get() else {
            return;
        };
        let mut total = ProcTimer::new();
        for node in &rt.nodes {
            let timer = node.timer.lock().unwrap().clone();
            timer.print_fps(&format!("[{}] {}", self.core.name, node.name));
            total.mix(&timer);
        }
        total.print_fps(&format!("[{}] overall", self.core.name));
    }

    fn graph_ref(&self) -> Result<&Graph> {
        self.graph
            .as_ref()
            .ok_or_else(|| Error::State("pipeline already started".into()))
    }

    fn graph_mut(&mut self) -> Result<&mut Graph> {
        if self.state != PipelineState::Constructed {
            return Err(Error::State(format!(
                "topology is frozen in {:?}",
                self.state
            )));
        }
        self.graph
            .as_mut()
            .ok_or_else(|| Error::State("pipeline already started".into()))
    }
}

/// The pipeline's own watcher, registered at start after all user
/// watchers: unintercepted errors stop the pipeline; per-stream EOS
/// completion becomes a single observer message.
fn default_bus_watch(core: &Weak<PipelineCore>, event: &Event) -> WatchVerdict {
    let Some(core) = core.upgrade() else {
        return WatchVerdict::NotHandled;
    };
    match event.kind {
        EventKind::Eos => {
            if let Some(stream_id) = &event.stream_id {
                core.finish_stream(stream_id);
            }
            WatchVerdict::Handled
        }
        EventKind::Error => {
            let stream_id = event.stream_id.clone().unwrap_or_default();
            let channel_idx = core
                .streams
                .channel_index(&stream_id)
                .map(|c| c as i32)
                .unwrap_or(-1);
            core.notify_observer(StreamMsg {
                msg_type: StreamMsgType::Error,
                channel_idx,
                stream_id,
            });
            core.shutdown_transport();
            WatchVerdict::StopPolling
        }
        EventKind::Stop => {
            core.shutdown_transport();
            WatchVerdict::StopPolling
        }
        EventKind::Warning | EventKind::Invalid => WatchVerdict::NotHandled,
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if self.state == PipelineState::Started {
            let _ = self.stop();
        }
    }
}

impl Module for Pipeline {
    fn name(&self) -> &str {
        &self.core.name
    }

    fn open(&mut self, _params: &ParamMap) -> bool {
        self.start().is_ok()
    }

    fn process(&self, _bundle: &Arc<Bundle>) -> Result<Output> {
        Err(Error::InvalidArgument(
            "a pipeline does not process bundles directly; inject through provide_data".into(),
        ))
    }

    fn close(&mut self) {
        let _ = self.stop();
    }
}

//! # millrace
//!
//! A thread-per-worker media/analytics pipeline engine.
//!
//! Modules — named processing stages with an open/process/close contract —
//! are linked into a directed graph. Frames flow through the graph as
//! shared bundles over bounded queues with backpressure, while each module
//! runs on its own pool of OS worker threads. A dual-location synced
//! buffer moves frame payloads lazily between host memory and an
//! accelerator device.
//!
//! ## Features
//!
//! - **Bounded transport**: per-worker input queues; producers block under
//!   backpressure and fail fast once the pipeline stops
//! - **Per-stream ordering**: stream-affinity routing keeps every stream
//!   on one worker per module, preserving arrival order end-to-end
//! - **EOS bookkeeping**: end-of-stream sentinels fan out and rejoin
//!   across parallel branches; each stream's completion surfaces exactly
//!   once
//! - **Event bus**: errors, warnings, and EOS flow to watchers on a single
//!   poller thread; a default watcher turns unhandled errors into a
//!   pipeline stop
//! - **Synced buffers**: lazy, state-tracked copies between host and
//!   device address spaces behind a narrow device-runtime seam
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use millrace::prelude::*;
//! use millrace::module::ModuleRegistry;
//!
//! let registry = ModuleRegistry::with_builtins();
//! let mut pipeline = Pipeline::new("demo");
//! pipeline.build_from_description(
//!     "testsrc name=cam parallelism=0 ! passthrough name=filter ! nullsink name=out",
//!     &registry,
//! )?;
//! pipeline.start()?;
//!
//! let streams = pipeline.streams();
//! let bundle = Bundle::create(&streams, frame)?;
//! pipeline.provide_data("cam", bundle)?;
//! pipeline.provide_data("cam", Bundle::eos(&streams, "cam0"))?;
//!
//! pipeline.stop()?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod error;
pub mod event;
pub mod frame;
pub mod memory;
pub mod metrics;
pub mod module;
pub mod modules;
pub mod pipeline;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::event::{Event, EventBus, EventKind, WatchVerdict};
    pub use crate::frame::{Bundle, PixelFormat, StreamRegistry, VideoFrame};
    pub use crate::memory::{DeviceRuntime, SimDevice, SyncState, SyncedBuffer};
    pub use crate::module::{Module, ModuleConfig, ModuleRegistry, Output};
    pub use crate::pipeline::{
        Pipeline, PipelineState, StreamMsg, StreamMsgObserver, StreamMsgType,
    };
}

pub use error::{Error, Result};

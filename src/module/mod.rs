//! The module contract: the unit of work a pipeline schedules.

mod config;
mod registry;

pub use config::{ModuleConfig, ParamMap};
pub use registry::{ModuleCtor, ModuleRegistry};

use crate::error::Result;
use crate::frame::Bundle;
use crate::pipeline::PipelineHandle;
use std::sync::Arc;

/// Outcome of processing one bundle.
#[derive(Debug)]
pub enum Output {
    /// Transmit the input bundle to every downstream link.
    Forward,
    /// Transmit a module-produced bundle instead of the input.
    Emit(Arc<Bundle>),
    /// The module keeps the bundle and will complete transmission later
    /// through [`PipelineHandle::provide_data`] (asynchronous pattern).
    Hold,
    /// Consume the bundle silently (filters, sinks).
    Discard,
}

/// A named processing stage scheduled by the pipeline.
///
/// # Lifecycle
///
/// - [`open`](Self::open) runs once before any frame flows; a false return
///   aborts pipeline startup.
/// - [`process`](Self::process) runs per bundle. With parallelism N it is
///   called concurrently from up to N worker threads, each with disjoint
///   bundles — implementations share state through interior mutability if
///   they need any.
/// - [`close`](Self::close) runs once after all workers have drained.
///
/// `Err` from `process` is a per-frame failure: the pipeline posts an
/// error event, drops the bundle, and keeps the module running. The core
/// never retries.
pub trait Module: Send + Sync {
    /// Graph-unique instance name.
    fn name(&self) -> &str;

    /// One-time setup from opaque string parameters.
    ///
    /// Modules parse and validate their own parameters; configuration
    /// errors are reported as a false return.
    fn open(&mut self, params: &ParamMap) -> bool;

    /// Process one bundle.
    fn process(&self, bundle: &Arc<Bundle>) -> Result<Output>;

    /// One-time teardown.
    fn close(&mut self);

    /// Receive a handle to the owning pipeline when added.
    ///
    /// Modules that transmit asynchronously ([`Output::Hold`]) or inject
    /// data themselves (sources) keep this handle; others can ignore it.
    fn set_pipeline(&mut self, handle: PipelineHandle) {
        let _ = handle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe {
        name: String,
        opened: bool,
    }

    impl Module for Probe {
        fn name(&self) -> &str {
            &self.name
        }
        fn open(&mut self, params: &ParamMap) -> bool {
            self.opened = params.get("fail").is_none();
            self.opened
        }
        fn process(&self, _bundle: &Arc<Bundle>) -> Result<Output> {
            Ok(Output::Forward)
        }
        fn close(&mut self) {
            self.opened = false;
        }
    }

    #[test]
    fn open_reports_parameter_rejection() {
        let mut module = Probe {
            name: "probe".into(),
            opened: false,
        };
        let mut params = ParamMap::new();
        assert!(module.open(&params));
        params.insert("fail".into(), "1".into());
        assert!(!module.open(&params));
    }
}

//! A transform that forwards bundles unchanged.

use crate::error::Result;
use crate::frame::Bundle;
use crate::module::{Module, Output, ParamMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Forwards every bundle unchanged.
///
/// Useful as a placeholder stage and for measuring transport overhead.
pub struct PassThrough {
    name: String,
    count: AtomicU64,
}

impl PassThrough {
    /// Create a pass-through named `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            count: AtomicU64::new(0),
        }
    }

    /// Number of bundles forwarded so far.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }
}

impl Module for PassThrough {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self, _params: &ParamMap) -> bool {
        true
    }

    fn process(&self, _bundle: &Arc<Bundle>) -> Result<Output> {
        self.count.fetch_add(1, Ordering::AcqRel);
        Ok(Output::Forward)
    }

    fn close(&mut self) {}
}

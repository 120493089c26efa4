//! Module configuration records.

use std::collections::HashMap;

/// Opaque string parameters handed to a module's `open`.
pub type ParamMap = HashMap<String, String>;

/// Configuration for one module in a graph description.
///
/// Pure data: the pipeline builder resolves `class_name` through a
/// [`ModuleRegistry`](super::ModuleRegistry) and wires `next` by name.
/// Records come from the textual description parser or are built directly
/// by the embedding application.
#[derive(Debug, Clone)]
pub struct ModuleConfig {
    /// Graph-unique instance name.
    pub name: String,
    /// Implementation identifier resolved through the registry.
    pub class_name: String,
    /// Worker count. 0 means externally driven: the module owns no workers
    /// and injects data itself.
    pub parallelism: u32,
    /// Capacity of each worker input queue.
    pub max_input_queue_size: usize,
    /// Opaque parameters for the module's `open`.
    pub parameters: ParamMap,
    /// Names of downstream modules, in link order.
    pub next: Vec<String>,
}

impl ModuleConfig {
    /// Default input queue capacity.
    pub const DEFAULT_QUEUE_SIZE: usize = 20;

    /// Create a config with one worker and the default queue capacity.
    pub fn new(name: impl Into<String>, class_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            class_name: class_name.into(),
            parallelism: 1,
            max_input_queue_size: Self::DEFAULT_QUEUE_SIZE,
            parameters: ParamMap::new(),
            next: Vec::new(),
        }
    }

    /// Set the worker count.
    pub fn with_parallelism(mut self, parallelism: u32) -> Self {
        self.parallelism = parallelism;
        self
    }

    /// Set the input queue capacity.
    pub fn with_queue_size(mut self, capacity: usize) -> Self {
        self.max_input_queue_size = capacity;
        self
    }

    /// Add a parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Add a downstream module by name.
    pub fn with_next(mut self, name: impl Into<String>) -> Self {
        self.next.push(name.into());
        self
    }
}

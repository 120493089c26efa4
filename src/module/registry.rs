//! Registry mapping implementation identifiers to module constructors.

use super::Module;
use crate::error::{Error, Result};
use std::collections::HashMap;

/// Constructor function for a module implementation. Receives the
/// instance name from the graph description.
pub type ModuleCtor = fn(&str) -> Box<dyn Module>;

/// Explicit registry of module implementations.
///
/// Graph descriptions refer to implementations by string identifier; the
/// registry resolves those identifiers to constructor functions. It is
/// populated at process startup — built-ins via
/// [`with_builtins`](Self::with_builtins), application modules via
/// [`register`](Self::register).
pub struct ModuleRegistry {
    ctors: HashMap<String, ModuleCtor>,
}

impl ModuleRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            ctors: HashMap::new(),
        }
    }

    /// Create a registry with the built-in modules registered:
    /// `testsrc`, `passthrough`, `nullsink`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("testsrc", |name| {
            Box::new(crate::modules::TestSource::new(name))
        });
        registry.register("passthrough", |name| {
            Box::new(crate::modules::PassThrough::new(name))
        });
        registry.register("nullsink", |name| {
            Box::new(crate::modules::NullSink::new(name))
        });
        registry
    }

    /// Register a constructor under `class_name`. Replaces any previous
    /// registration with the same identifier.
    pub fn register(&mut self, class_name: impl Into<String>, ctor: ModuleCtor) {
        self.ctors.insert(class_name.into(), ctor);
    }

    /// Check whether an implementation identifier is registered.
    pub fn contains(&self, class_name: &str) -> bool {
        self.ctors.contains_key(class_name)
    }

    /// Instantiate `class_name` as a module named `instance_name`.
    pub fn create(&self, class_name: &str, instance_name: &str) -> Result<Box<dyn Module>> {
        let ctor = self
            .ctors
            .get(class_name)
            .ok_or_else(|| Error::Graph(format!("unknown module class: {class_name}")))?;
        Ok(ctor(instance_name))
    }

    /// Sorted list of registered implementation identifiers.
    pub fn class_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.ctors.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

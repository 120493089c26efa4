//! Built-in modules: a frame-generating test source, a pass-through
//! transform, and a counting null sink.
//!
//! These are registered by
//! [`ModuleRegistry::with_builtins`](crate::module::ModuleRegistry::with_builtins)
//! under `testsrc`, `passthrough`, and `nullsink`.

mod null;
mod passthrough;
mod testsrc;

pub use null::NullSink;
pub use passthrough::PassThrough;
pub use testsrc::TestSource;

//! Error types for millrace.

use thiserror::Error;

/// Result type alias using millrace's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for millrace operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Memory allocation failed.
    #[error("memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Device runtime call failed.
    #[error("device runtime error: {0}")]
    Device(String),

    /// The buffer has size 0 and exposes no data on either side.
    #[error("buffer is empty: no host or device view available")]
    EmptyBuffer,

    /// An argument was out of range or otherwise invalid.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Graph construction failed (duplicate name, unresolved reference, cycle).
    #[error("invalid graph: {0}")]
    Graph(String),

    /// Data could not be moved between modules.
    #[error("transport error: {0}")]
    Transport(String),

    /// The operation requires a running pipeline.
    #[error("pipeline is not running")]
    NotRunning,

    /// The operation is not valid in the pipeline's current state.
    #[error("invalid pipeline state: {0}")]
    State(String),

    /// A module rejected its parameters during open.
    #[error("module '{0}' failed to open")]
    ModuleOpen(String),

    /// No module with the given name exists in the pipeline.
    #[error("unknown module: {0}")]
    UnknownModule(String),

    /// The per-stream in-flight frame limit was reached.
    #[error("stream '{0}' is at its in-flight frame limit")]
    StreamBusy(String),

    /// Pipeline description parsing failed.
    #[error("invalid pipeline description: {0}")]
    Parse(String),
}

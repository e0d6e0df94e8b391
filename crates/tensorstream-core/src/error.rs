//! Error types for tensorstream-core
//!
//! One crate-level error enum covers the whole engine; components report
//! which kind of failure occurred rather than growing per-module
//! hierarchies.

use thiserror::Error;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

/// Main error type for the engine core
#[derive(Error, Debug)]
pub enum CoreError {
    /// A fixed-capacity resource ran out (pool has no free pages)
    #[error("capacity exhausted: {0}")]
    CapacityExhausted(String),

    /// Caller misuse: rank mismatch, out-of-range coordinate or page id,
    /// double release
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Lookup for a key or tile that does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Storage or fetch-callback failure
    #[error("I/O failure: {0}")]
    Io(String),

    /// Operation attempted on a stopped pipeline
    #[error("pipeline stopped")]
    Shutdown,

    /// The external store reported state outside the registry's grid
    #[error("store contract violation: {0}")]
    ContractViolation(String),

    /// Construction-time validation or allocation failure
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

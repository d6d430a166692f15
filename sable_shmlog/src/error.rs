//! Error types for shared-memory log operations

use thiserror::Error;

/// Errors that can occur while managing the shared-memory arena and its
/// segments.
///
/// Programmer precondition violations (misaligned cursors, reserved tags,
/// double `end()`) are asserts, not variants: they are bugs, not runtime
/// failures.
#[derive(Error, Debug)]
pub enum ShmError {
    /// Arena has no contiguous free range of the requested size.
    #[error("Arena exhausted: no room for {requested} bytes")]
    ArenaExhausted {
        /// Requested payload size in bytes.
        requested: usize,
    },

    /// Arena file or a segment within it was not found.
    #[error("Segment not found: {name}")]
    NotFound {
        /// Segment name or class searched for.
        name: String,
    },

    /// A mapped structure did not carry the expected marker bytes.
    #[error("Bad {what} marker - not a sable shared-memory file?")]
    BadMarker {
        /// Which structure failed validation.
        what: &'static str,
    },

    /// Requested or mapped size is out of bounds.
    #[error("Invalid size: {size} bytes")]
    InvalidSize {
        /// Offending size.
        size: usize,
    },

    /// Rejected runtime parameters.
    #[error("Invalid parameters: {source}")]
    Params {
        /// Source validation error.
        #[from]
        source: sable::params::ConfigError,
    },

    /// IO error
    #[error("IO error: {source}")]
    Io {
        /// Source IO error
        #[from]
        source: std::io::Error,
    },

    /// Nix system call error
    #[error("System call error: {source}")]
    Nix {
        /// Source nix error
        #[from]
        source: nix::Error,
    },
}

/// Result type for shared-memory log operations.
pub type ShmResult<T> = Result<T, ShmError>;

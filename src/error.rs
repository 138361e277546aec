//! Error type shared by every fallible operation in the crate.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the tracing compiler.
///
/// All variants are fatal: the tracer never retries, and a failed
/// `evaluate` leaves partially materialized buffers owned by their
/// variables, to be released through normal reference counting.
#[derive(Debug, Error)]
pub enum Error {
    /// Violation of an internal invariant: a dangling variable index, a
    /// negative reference count, or a collected variable reached by the
    /// scheduler.
    #[error("internal error: {0}")]
    Internal(String),

    /// Malformed instruction template: an unrecognized `$` sequence, an
    /// operand index without a matching dependency, or an unsupported
    /// element type.
    #[error("template error: {0}")]
    Template(String),

    /// Error reported by the CUDA driver (allocation, copy, linking or
    /// launch). The driver message, including the linker log where
    /// available, is carried verbatim.
    #[error("driver error: {0}")]
    Driver(String),

    /// A kernel partition contained a variable whose element count is
    /// neither 1 nor the partition size.
    #[error(
        "variable {index} has {size} elements, incompatible with a kernel over {bucket} elements"
    )]
    BucketShape {
        /// Offending variable index.
        index: u32,
        /// Its element count.
        size: usize,
        /// The element count of the partition being compiled.
        bucket: usize,
    },

    /// A device operation was requested but the crate was built without
    /// the `cuda` feature.
    #[error("CUDA support not compiled in (enable the `cuda` feature)")]
    CudaNotEnabled,
}

impl Error {
    /// Shorthand for an [`Error::Internal`] with a formatted message.
    pub(crate) fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// Shorthand for an [`Error::Template`] with a formatted message.
    pub(crate) fn template(msg: impl Into<String>) -> Self {
        Error::Template(msg.into())
    }
}

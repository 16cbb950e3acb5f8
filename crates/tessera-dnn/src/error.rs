//! Error types for the dispatch crate.

use thiserror::Error;

use crate::vendor::Status;

/// Dispatch errors.
///
/// Every variant is terminal for the call that produced it: nothing in
/// this crate retries, and callers should not either.
#[derive(Debug, Error)]
pub enum Error {
    /// A vendor or kernel call reported a non-success status after the
    /// strategy had been confirmed available.
    #[error("{call} failed with {status} (algorithm {algo}); args: {args}")]
    VendorCallFailed {
        call: &'static str,
        status: Status,
        algo: String,
        args: String,
    },

    /// Selection exhausted every strategy.
    #[error("no usable {op} algorithm under a workspace limit of {limit} bytes; args: {args}")]
    NoUsableAlgorithm {
        op: &'static str,
        args: String,
        limit: usize,
    },

    /// The borrowed workspace is smaller than the strategy needs.
    #[error("algorithm {algo} needs {required} bytes of workspace, got {provided}")]
    WorkspaceTooSmall {
        algo: String,
        required: usize,
        provided: usize,
    },

    /// Arguments violate a precondition of the operation.
    #[error("Invalid arguments: {0}")]
    InvalidArgs(String),

    #[error(transparent)]
    Core(#[from] tessera_core::Error),
}

/// Specialized Result type for dispatch operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Map a vendor status to `VendorCallFailed`, building the context lazily.
pub(crate) fn check_status(
    status: Status,
    call: &'static str,
    algo: &str,
    args: impl FnOnce() -> String,
) -> Result<()> {
    status.ok().map_err(|status| Error::VendorCallFailed {
        call,
        status,
        algo: algo.to_string(),
        args: args(),
    })
}

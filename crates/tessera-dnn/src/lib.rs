//! Algorithm selection and vendor-library dispatch for Tessera.
//!
//! An operation kind (e.g. convolution backward-filter) is implemented by
//! several interchangeable strategies. This crate provides:
//! - The `Algorithm` trait every strategy implements, and the ordered
//!   `AlgorithmRegistry` a device `Handle` builds once per operation kind
//! - The selection policy that picks a strategy under a workspace limit
//!   and an optional reproducibility requirement
//! - Scope-owned adapters for vendor descriptors
//! - Operator front-ends (`ConvolutionBackwardFilter`, `BatchNormForward`,
//!   ...) that size and run one call
//!
//! The vendor library and the raw compute kernels are consumed through the
//! `VendorLibrary` and `KernelLibrary` traits.

pub mod algo;
pub mod batch_norm;
pub mod convolution;
pub mod deformable_conv;
pub mod descriptor;
mod error;
pub mod handle;
pub mod kernels;
pub mod policy;
pub mod registry;
pub mod tensor_remap;
pub mod vendor;
pub mod workspace;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Public exports
pub use algo::{Algorithm, Operation};
pub use error::{Error, Result};
pub use handle::{ComputingContext, Handle};
pub use policy::{ExecutionPolicy, find_algorithm, select_algorithm};
pub use registry::AlgorithmRegistry;
pub use vendor::{LibraryVersion, Status, VendorLibrary};
pub use workspace::WorkspaceBundle;

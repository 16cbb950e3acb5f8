//! Core tensor descriptions for Tessera.
//!
//! This crate provides the vocabulary every other Tessera crate speaks:
//! - Element types and their categories (`DType`, `DTypeCategory`)
//! - Immutable shape/stride descriptors (`TensorShape`, `TensorLayout`)
//! - Static operator parameters (`ConvolutionParam`, `BatchNormParam`, ...)
//! - Device buffer handles (`DevicePtr`, `TensorND`, `Workspace`)

pub mod dtype;
pub mod layout;
pub mod param;
pub mod tensor;

// Re-export commonly used types
pub use dtype::{DType, DTypeCategory};
pub use layout::{MAX_NDIM, TensorLayout, TensorShape};
pub use tensor::{DevicePtr, TensorND, Workspace};

/// Result type using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for tessera-core operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("Layout error: {0}")]
    Layout(String),

    #[error("Shape error: {0}")]
    Shape(String),

    #[error("DType error: {0}")]
    DType(String),
}

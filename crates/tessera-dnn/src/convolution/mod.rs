//! Convolution operations.

pub mod backward_filter;
pub mod helper;

pub use backward_filter::{ConvBwdFilterOp, ConvolutionBackwardFilter};
pub use helper::CanonizedFilterMeta;

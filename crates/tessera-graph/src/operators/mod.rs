//! Graph operator nodes backed by the dispatch layer.

pub mod batch_norm;
pub mod convolution;

pub use batch_norm::{
    BatchNormBackward, BatchNormBackwardInputs, BatchNormForward, BatchNormGrads,
    BatchNormInputs, BatchNormOutputs, RunningStats, batch_norm, batch_norm_backward,
};
pub use convolution::{ConvolutionBackwardFilter, convolution_backward_filter};

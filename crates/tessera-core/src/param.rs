//! Static operator parameters.
//!
//! These are the statically known settings an operator is constructed
//! with. They are plain values: the dispatch layer reads them to size and
//! run a strategy, the graph layer stores them on its nodes.

use std::fmt;

/// Whether the filter is applied as cross-correlation or true convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConvMode {
    #[default]
    CrossCorrelation,
    Convolution,
}

/// Dense filters are `[OC, IC, FH, FW]`, group filters `[G, OCPG, ICPG, FH, FW]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Sparse {
    #[default]
    Dense,
    Group,
}

/// Memory format of activations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Format {
    #[default]
    Nchw,
    Nhwc,
}

/// Accumulation precision requested for reduced-precision inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ComputeMode {
    #[default]
    Default,
    Float32,
}

/// Parameters of a 2-D convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConvolutionParam {
    pub mode: ConvMode,
    pub pad_h: usize,
    pub pad_w: usize,
    pub stride_h: usize,
    pub stride_w: usize,
    pub dilate_h: usize,
    pub dilate_w: usize,
    pub sparse: Sparse,
    pub format: Format,
    pub compute_mode: ComputeMode,
}

impl Default for ConvolutionParam {
    fn default() -> Self {
        Self {
            mode: ConvMode::default(),
            pad_h: 0,
            pad_w: 0,
            stride_h: 1,
            stride_w: 1,
            dilate_h: 1,
            dilate_w: 1,
            sparse: Sparse::default(),
            format: Format::default(),
            compute_mode: ComputeMode::default(),
        }
    }
}

impl ConvolutionParam {
    pub fn with_padding(mut self, pad_h: usize, pad_w: usize) -> Self {
        self.pad_h = pad_h;
        self.pad_w = pad_w;
        self
    }

    pub fn with_stride(mut self, stride_h: usize, stride_w: usize) -> Self {
        self.stride_h = stride_h;
        self.stride_w = stride_w;
        self
    }

    pub fn with_dilation(mut self, dilate_h: usize, dilate_w: usize) -> Self {
        self.dilate_h = dilate_h;
        self.dilate_w = dilate_w;
        self
    }

    pub fn with_sparse(mut self, sparse: Sparse) -> Self {
        self.sparse = sparse;
        self
    }
}

impl fmt::Display for ConvolutionParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pad={}x{} stride={}x{} dilate={}x{} {:?} {:?} {:?}",
            self.pad_h,
            self.pad_w,
            self.stride_h,
            self.stride_w,
            self.dilate_h,
            self.dilate_w,
            self.mode,
            self.sparse,
            self.format
        )
    }
}

/// Which axes the batch-norm statistics are shared over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BnParamDim {
    /// One statistic per channel: `[1, C, 1, 1]`.
    #[default]
    Dim1C11,
    /// One statistic per activation: `[1, C, H, W]`.
    Dim1CHW,
    /// One statistic per spatial location: `[1, 1, H, W]`.
    Dim11HW,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BnFwdMode {
    #[default]
    Training,
    Inference,
}

/// Parameters of a batch normalization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchNormParam {
    pub param_dim: BnParamDim,
    pub fwd_mode: BnFwdMode,
    pub epsilon: f64,
    /// Weight of the current batch in the running-average update.
    pub avg_factor: f64,
}

impl Default for BatchNormParam {
    fn default() -> Self {
        Self {
            param_dim: BnParamDim::default(),
            fwd_mode: BnFwdMode::default(),
            epsilon: 1e-4,
            avg_factor: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PoolingMode {
    #[default]
    Max,
    Average,
    AverageCountExcludePadding,
}

/// Parameters of a 2-D pooling window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolingParam {
    pub mode: PoolingMode,
    pub pad_h: usize,
    pub pad_w: usize,
    pub stride_h: usize,
    pub stride_w: usize,
    pub window_h: usize,
    pub window_w: usize,
}

impl Default for PoolingParam {
    fn default() -> Self {
        Self {
            mode: PoolingMode::default(),
            pad_h: 0,
            pad_w: 0,
            stride_h: 2,
            stride_w: 2,
            window_h: 2,
            window_w: 2,
        }
    }
}

/// Parameters of local response normalization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LrnParam {
    pub n: u32,
    pub k: f64,
    pub alpha: f64,
    pub beta: f64,
}

impl Default for LrnParam {
    fn default() -> Self {
        Self {
            n: 5,
            k: 2.0,
            alpha: 1e-4,
            beta: 0.75,
        }
    }
}

/// Parameters of the indexing remap operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct IndexingRemapParam {
    /// The caller promises no two destinations map to the same source,
    /// which lets the backward pass skip atomic accumulation.
    pub is_non_overlapping: bool,
}

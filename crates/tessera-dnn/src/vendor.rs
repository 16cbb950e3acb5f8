//! The vendor compute library, as consumed by the dispatch layer.
//!
//! The library itself is not part of Tessera. It is reached through the
//! [`VendorLibrary`] trait, which mirrors the shape of a typical GPU DNN
//! library: opaque descriptors describing tensors and operation
//! parameters, a workspace query per strategy, and an execute entry point
//! that enqueues work on a stream and reports a status.

use std::fmt;

use tessera_core::param::{ConvMode, Format, PoolingMode};
use tessera_core::{DType, DevicePtr, Workspace};

/// Status code reported by every vendor entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Success,
    NotInitialized,
    AllocFailed,
    BadParam,
    InternalError,
    InvalidValue,
    ArchMismatch,
    ExecutionFailed,
    NotSupported,
}

impl Status {
    pub fn is_success(&self) -> bool {
        matches!(self, Status::Success)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Success => "STATUS_SUCCESS",
            Status::NotInitialized => "STATUS_NOT_INITIALIZED",
            Status::AllocFailed => "STATUS_ALLOC_FAILED",
            Status::BadParam => "STATUS_BAD_PARAM",
            Status::InternalError => "STATUS_INTERNAL_ERROR",
            Status::InvalidValue => "STATUS_INVALID_VALUE",
            Status::ArchMismatch => "STATUS_ARCH_MISMATCH",
            Status::ExecutionFailed => "STATUS_EXECUTION_FAILED",
            Status::NotSupported => "STATUS_NOT_SUPPORTED",
        }
    }

    /// Convert into a `Result`, keeping the status as the error.
    pub fn ok(self) -> VendorResult<()> {
        if self.is_success() { Ok(()) } else { Err(self) }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a vendor query: the value, or the non-success status.
pub type VendorResult<T> = std::result::Result<T, Status>;

/// Version of the loaded vendor library.
///
/// Used to decide which named strategies exist and to tag their names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LibraryVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl LibraryVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// True if this version is `major.minor` or newer.
    pub fn at_least(&self, major: u32, minor: u32) -> bool {
        (self.major, self.minor) >= (major, minor)
    }
}

impl fmt::Display for LibraryVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Device stream that vendor and kernel calls are enqueued on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StreamHandle(pub u64);

/// Opaque vendor descriptor handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawDescriptor(pub u64);

/// Kind of vendor descriptor to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    Tensor,
    Filter,
    Convolution,
    Pooling,
    Lrn,
}

/// Affine output combination `y = alpha * op(inputs) + beta * y`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scaling {
    pub alpha: f32,
    pub beta: f32,
}

impl Scaling {
    /// `y = op(inputs)`: the only combination this dispatch path issues.
    pub const OVERWRITE: Scaling = Scaling {
        alpha: 1.0,
        beta: 0.0,
    };
}

/// Settings bound to a convolution descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvDescConfig {
    pub pads: [i32; 2],
    pub strides: [i32; 2],
    pub dilations: [i32; 2],
    pub mode: ConvMode,
    pub group_count: i32,
    pub compute_dtype: DType,
}

/// Settings bound to a pooling descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolingDescConfig {
    pub mode: PoolingMode,
    pub window: [i32; 2],
    pub pads: [i32; 2],
    pub strides: [i32; 2],
}

/// Settings bound to an LRN descriptor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LrnDescConfig {
    pub n: u32,
    pub alpha: f64,
    pub beta: f64,
    pub k: f64,
}

/// Vendor strategies for the convolution backward-filter pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConvBwdFilterAlgo {
    Algo0,
    Algo1,
    Fft,
    Algo3,
    WinogradNonfused,
    FftTiling,
}

impl ConvBwdFilterAlgo {
    /// The vendor's enumerator name.
    pub fn enum_name(&self) -> &'static str {
        match self {
            ConvBwdFilterAlgo::Algo0 => "CONVOLUTION_BWD_FILTER_ALGO_0",
            ConvBwdFilterAlgo::Algo1 => "CONVOLUTION_BWD_FILTER_ALGO_1",
            ConvBwdFilterAlgo::Fft => "CONVOLUTION_BWD_FILTER_ALGO_FFT",
            ConvBwdFilterAlgo::Algo3 => "CONVOLUTION_BWD_FILTER_ALGO_3",
            ConvBwdFilterAlgo::WinogradNonfused => "CONVOLUTION_BWD_FILTER_ALGO_WINOGRAD_NONFUSED",
            ConvBwdFilterAlgo::FftTiling => "CONVOLUTION_BWD_FILTER_ALGO_FFT_TILING",
        }
    }
}

/// Normalization modes of the vendor batch-norm entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BnMode {
    PerActivation,
    Spatial,
    SpatialPersistent,
}

impl BnMode {
    pub fn enum_name(&self) -> &'static str {
        match self {
            BnMode::PerActivation => "BATCHNORM_PER_ACTIVATION",
            BnMode::Spatial => "BATCHNORM_SPATIAL",
            BnMode::SpatialPersistent => "BATCHNORM_SPATIAL_PERSISTENT",
        }
    }
}

/// Arguments of one backward-filter convolution call.
#[derive(Debug, Clone, Copy)]
pub struct ConvBwdFilterCall {
    pub stream: StreamHandle,
    pub scaling: Scaling,
    pub src_desc: RawDescriptor,
    pub src: DevicePtr,
    pub diff_desc: RawDescriptor,
    pub diff: DevicePtr,
    pub conv_desc: RawDescriptor,
    pub algo: ConvBwdFilterAlgo,
    pub workspace: Workspace,
    pub grad_desc: RawDescriptor,
    pub grad: DevicePtr,
}

/// Arguments of one training-mode batch-norm forward call.
///
/// Running statistics are `None` when the caller keeps no cross-iteration
/// state.
#[derive(Debug, Clone, Copy)]
pub struct BnForwardTrainingCall {
    pub stream: StreamHandle,
    pub mode: BnMode,
    pub scaling: Scaling,
    pub x_desc: RawDescriptor,
    pub x: DevicePtr,
    pub y_desc: RawDescriptor,
    pub y: DevicePtr,
    pub param_desc: RawDescriptor,
    pub scale: DevicePtr,
    pub bias: DevicePtr,
    pub avg_factor: f64,
    pub running_mean: Option<DevicePtr>,
    pub running_variance: Option<DevicePtr>,
    pub epsilon: f64,
    pub save_mean: DevicePtr,
    pub save_inv_variance: DevicePtr,
    pub workspace: Workspace,
}

/// Arguments of one inference-mode batch-norm forward call.
#[derive(Debug, Clone, Copy)]
pub struct BnForwardInferenceCall {
    pub stream: StreamHandle,
    pub mode: BnMode,
    pub scaling: Scaling,
    pub x_desc: RawDescriptor,
    pub x: DevicePtr,
    pub y_desc: RawDescriptor,
    pub y: DevicePtr,
    pub param_desc: RawDescriptor,
    pub scale: DevicePtr,
    pub bias: DevicePtr,
    pub mean: DevicePtr,
    pub variance: DevicePtr,
    pub epsilon: f64,
}

/// Arguments of one batch-norm backward call.
#[derive(Debug, Clone, Copy)]
pub struct BnBackwardCall {
    pub stream: StreamHandle,
    pub mode: BnMode,
    pub data_scaling: Scaling,
    pub param_scaling: Scaling,
    pub x_desc: RawDescriptor,
    pub x: DevicePtr,
    pub dy_desc: RawDescriptor,
    pub dy: DevicePtr,
    pub dx_desc: RawDescriptor,
    pub dx: DevicePtr,
    pub param_desc: RawDescriptor,
    pub scale: DevicePtr,
    pub d_scale: DevicePtr,
    pub d_bias: DevicePtr,
    pub epsilon: f64,
    pub save_mean: DevicePtr,
    pub save_inv_variance: DevicePtr,
    pub workspace: Workspace,
}

/// The vendor DNN library.
///
/// Queries are synchronous and cheap. Execute entry points only enqueue
/// work on the given stream and return immediately.
pub trait VendorLibrary: Send + Sync {
    /// Version of the loaded library.
    fn version(&self) -> LibraryVersion;

    fn create_descriptor(&self, kind: DescriptorKind) -> VendorResult<RawDescriptor>;

    fn destroy_descriptor(&self, desc: RawDescriptor) -> Status;

    /// Bind a tensor descriptor to NCHW-ordered extents and strides.
    fn set_tensor_descriptor(
        &self,
        desc: RawDescriptor,
        dtype: DType,
        dims: &[i32],
        strides: &[i32],
    ) -> Status;

    fn set_filter_descriptor(
        &self,
        desc: RawDescriptor,
        dtype: DType,
        format: Format,
        dims: &[i32],
    ) -> Status;

    fn set_convolution_descriptor(&self, desc: RawDescriptor, config: &ConvDescConfig) -> Status;

    fn set_pooling_descriptor(&self, desc: RawDescriptor, config: &PoolingDescConfig) -> Status;

    fn set_lrn_descriptor(&self, desc: RawDescriptor, config: &LrnDescConfig) -> Status;

    /// Bind `desc` to the statistics shape implied by `x_desc` and `mode`.
    fn derive_bn_descriptor(&self, desc: RawDescriptor, x_desc: RawDescriptor, mode: BnMode)
    -> Status;

    fn conv_bwd_filter_workspace_size(
        &self,
        src_desc: RawDescriptor,
        diff_desc: RawDescriptor,
        conv_desc: RawDescriptor,
        grad_desc: RawDescriptor,
        algo: ConvBwdFilterAlgo,
    ) -> VendorResult<usize>;

    fn conv_bwd_filter(&self, call: &ConvBwdFilterCall) -> Status;

    fn bn_forward_training_workspace_size(
        &self,
        mode: BnMode,
        x_desc: RawDescriptor,
        param_desc: RawDescriptor,
    ) -> VendorResult<usize>;

    fn bn_forward_training(&self, call: &BnForwardTrainingCall) -> Status;

    fn bn_forward_inference(&self, call: &BnForwardInferenceCall) -> Status;

    fn bn_backward_workspace_size(
        &self,
        mode: BnMode,
        x_desc: RawDescriptor,
        param_desc: RawDescriptor,
    ) -> VendorResult<usize>;

    fn bn_backward(&self, call: &BnBackwardCall) -> Status;
}

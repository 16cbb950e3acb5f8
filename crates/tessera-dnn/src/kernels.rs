//! Raw compute kernels used by the built-in strategies.
//!
//! Built-in strategies do not call the vendor library. They compose a few
//! generic kernels (im2col, GEMM, small transposes) that live outside this
//! crate and are reached through [`KernelLibrary`].

use tessera_core::{DType, DevicePtr, MAX_NDIM};

use crate::vendor::{Scaling, Status, StreamHandle};

/// Extents of one 2-D convolution, NCHW.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvGeometry {
    pub n: usize,
    pub ic: usize,
    pub ih: usize,
    pub iw: usize,
    pub oc: usize,
    pub oh: usize,
    pub ow: usize,
    pub fh: usize,
    pub fw: usize,
    pub ph: usize,
    pub pw: usize,
    pub sh: usize,
    pub sw: usize,
    pub dh: usize,
    pub dw: usize,
    pub group: usize,
}

impl ConvGeometry {
    pub fn icpg(&self) -> usize {
        self.ic / self.group
    }

    pub fn ocpg(&self) -> usize {
        self.oc / self.group
    }

    /// Rows of the im2col matrix: `IC * FH * FW`.
    pub fn col_rows(&self) -> usize {
        self.ic * self.fh * self.fw
    }

    /// Columns of the im2col matrix: `N * OH * OW`.
    pub fn col_cols(&self) -> usize {
        self.n * self.oh * self.ow
    }
}

/// Extra extents of a deformable convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeformableGeometry {
    pub conv: ConvGeometry,
    /// Number of offset groups sharing one set of offsets.
    pub deformable_group: usize,
}

/// One row-major GEMM: `C = alpha * op(A) * op(B) + beta * C`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GemmCall {
    pub stream: StreamHandle,
    pub dtype: DType,
    pub transpose_a: bool,
    pub transpose_b: bool,
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub a: DevicePtr,
    pub lda: usize,
    pub b: DevicePtr,
    pub ldb: usize,
    pub c: DevicePtr,
    pub ldc: usize,
    pub scaling: Scaling,
}

/// Gather `dst[i] = src[map[i]]` over up to [`MAX_NDIM`] dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemapForwardCall {
    pub stream: StreamHandle,
    pub src: DevicePtr,
    pub map: DevicePtr,
    pub dst: DevicePtr,
    pub src_ndim: usize,
    pub dst_ndim: usize,
    pub src_stride: [i32; MAX_NDIM],
    pub dst_stride: [i32; MAX_NDIM],
    pub dst_shape: [u32; MAX_NDIM],
}

/// Scatter-add `grad[map[i]] += diff[i]`, after zero-filling `grad`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemapBackwardCall {
    pub stream: StreamHandle,
    pub diff: DevicePtr,
    pub map: DevicePtr,
    pub grad: DevicePtr,
    pub grad_ndim: usize,
    pub diff_ndim: usize,
    pub grad_stride: [i32; MAX_NDIM],
    pub grad_shape: [u32; MAX_NDIM],
    pub diff_stride: [i32; MAX_NDIM],
    pub diff_shape: [u32; MAX_NDIM],
    pub is_non_overlapping: bool,
}

/// Generic device kernels. Every call is enqueued on `stream`.
pub trait KernelLibrary: Send + Sync {
    /// Unfold `src` into a `[IC*FH*FW, N*OH*OW]` column matrix.
    fn im2col(
        &self,
        stream: StreamHandle,
        dtype: DType,
        src: DevicePtr,
        col: DevicePtr,
        geometry: &ConvGeometry,
    ) -> Status;

    /// Unfold `im` sampled at `offset` and weighted by `mask`.
    #[allow(clippy::too_many_arguments)]
    fn deformable_im2col(
        &self,
        stream: StreamHandle,
        dtype: DType,
        im: DevicePtr,
        offset: DevicePtr,
        mask: DevicePtr,
        col: DevicePtr,
        geometry: &DeformableGeometry,
    ) -> Status;

    /// Transpose `[N, C, HW]` into `[C, N, HW]`.
    #[allow(clippy::too_many_arguments)]
    fn nchw_to_cnhw(
        &self,
        stream: StreamHandle,
        dtype: DType,
        src: DevicePtr,
        dst: DevicePtr,
        n: usize,
        c: usize,
        hw: usize,
    ) -> Status;

    fn gemm(&self, call: &GemmCall) -> Status;

    /// Filter gradient of a channel-wise (one channel per group) convolution.
    fn chanwise_bwd_filter(
        &self,
        stream: StreamHandle,
        dtype: DType,
        src: DevicePtr,
        diff: DevicePtr,
        grad: DevicePtr,
        geometry: &ConvGeometry,
    ) -> Status;

    fn indexing_remap_forward(&self, call: &RemapForwardCall) -> Status;

    fn indexing_remap_backward(&self, call: &RemapBackwardCall) -> Status;
}

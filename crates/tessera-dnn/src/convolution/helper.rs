//! Filter canonization and layout checks shared by convolution passes.

use tessera_core::param::{ConvMode, ConvolutionParam, Format, Sparse};
use tessera_core::{DType, DevicePtr, TensorLayout};

use crate::error::check_status;
use crate::handle::Handle;
use crate::kernels::{ConvGeometry, GemmCall};
use crate::vendor::Scaling;
use crate::{Error, Result};

/// A filter layout normalized to group form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanonizedFilterMeta {
    pub dtype: DType,
    pub format: Format,
    pub should_flip: bool,
    pub group: usize,
    /// Input channels per group.
    pub icpg: usize,
    /// Output channels per group.
    pub ocpg: usize,
    /// Filter height and width.
    pub spatial: [usize; 2],
    pub stride: [usize; 2],
    pub padding: [usize; 2],
    pub dilation: [usize; 2],
}

impl CanonizedFilterMeta {
    /// Build from a filter layout. Dense filters are `[OC, IC, FH, FW]`,
    /// group filters `[G, OCPG, ICPG, FH, FW]`; NHWC moves the input
    /// channels last.
    pub fn new(src_ndim: usize, filter: &TensorLayout, param: &ConvolutionParam) -> Result<Self> {
        if src_ndim != 4 {
            return Err(Error::InvalidArgs(format!(
                "only 2-D convolutions are supported, src has {src_ndim} dimensions"
            )));
        }
        if param.stride_h == 0 || param.stride_w == 0 || param.dilate_h == 0 || param.dilate_w == 0 {
            return Err(Error::InvalidArgs(format!(
                "stride and dilation must be positive: {param}"
            )));
        }
        let dims = filter.dims();
        let (group, rest) = match (param.sparse, dims.len()) {
            (Sparse::Dense, 4) => (1, dims),
            (Sparse::Group, 5) => (dims[0], &dims[1..]),
            _ => {
                return Err(Error::InvalidArgs(format!(
                    "filter {filter} does not match {:?} convolution",
                    param.sparse
                )));
            }
        };
        let (ocpg, icpg, spatial) = match param.format {
            Format::Nchw => (rest[0], rest[1], [rest[2], rest[3]]),
            Format::Nhwc => (rest[0], rest[3], [rest[1], rest[2]]),
        };
        if group == 0 || ocpg == 0 || icpg == 0 {
            return Err(Error::InvalidArgs(format!("empty filter {filter}")));
        }
        Ok(Self {
            dtype: filter.dtype(),
            format: param.format,
            should_flip: param.mode == ConvMode::Convolution,
            group,
            icpg,
            ocpg,
            spatial,
            stride: [param.stride_h, param.stride_w],
            padding: [param.pad_h, param.pad_w],
            dilation: [param.dilate_h, param.dilate_w],
        })
    }

    pub fn ic(&self) -> usize {
        self.group * self.icpg
    }

    pub fn oc(&self) -> usize {
        self.group * self.ocpg
    }

    /// Output extent of spatial axis `axis` for input extent `input`.
    pub fn output_extent(&self, axis: usize, input: usize) -> Option<usize> {
        conv_output_extent(
            input,
            self.spatial[axis],
            self.padding[axis],
            self.stride[axis],
            self.dilation[axis],
        )
    }
}

/// `(i + 2p - ((f - 1) * d + 1)) / s + 1`, or `None` if the dilated filter
/// does not fit in the padded input.
pub fn conv_output_extent(i: usize, f: usize, p: usize, s: usize, d: usize) -> Option<usize> {
    let effective = f.checked_sub(1)? * d + 1;
    let padded = i + 2 * p;
    if padded < effective || s == 0 {
        return None;
    }
    Some((padded - effective) / s + 1)
}

/// `[N, C, H, W]` extents of a 4-D activation layout.
pub fn nchw_extents(layout: &TensorLayout, format: Format) -> [usize; 4] {
    let d = layout.dims();
    match format {
        Format::Nchw => [d[0], d[1], d[2], d[3]],
        Format::Nhwc => [d[0], d[3], d[1], d[2]],
    }
}

/// Check that `src`, `diff` and the filter agree on channels, batch and
/// output extents.
pub fn check_layout_fwd(
    src: &TensorLayout,
    meta: &CanonizedFilterMeta,
    dst: &TensorLayout,
) -> Result<()> {
    let mismatch = |what: &str| {
        Err(Error::InvalidArgs(format!(
            "{what}: src={src} dst={dst} filter group={} icpg={} ocpg={} spatial={:?}",
            meta.group, meta.icpg, meta.ocpg, meta.spatial
        )))
    };
    if src.ndim() != 4 || dst.ndim() != 4 {
        return mismatch("activations must be 4-D");
    }
    if src.dtype() != dst.dtype() {
        return mismatch("dtype mismatch");
    }
    let [n, ic, ih, iw] = nchw_extents(src, meta.format);
    let [on, oc, oh, ow] = nchw_extents(dst, meta.format);
    if n != on {
        return mismatch("batch mismatch");
    }
    if ic != meta.ic() {
        return mismatch("input channel mismatch");
    }
    if oc != meta.oc() {
        return mismatch("output channel mismatch");
    }
    if meta.output_extent(0, ih) != Some(oh) || meta.output_extent(1, iw) != Some(ow) {
        return mismatch("output extent mismatch");
    }
    Ok(())
}

/// Extents of the convolution described by `src`, `dst` and `meta`.
pub fn conv_geometry(
    src: &TensorLayout,
    dst: &TensorLayout,
    meta: &CanonizedFilterMeta,
) -> ConvGeometry {
    let [n, ic, ih, iw] = nchw_extents(src, meta.format);
    let [_, oc, oh, ow] = nchw_extents(dst, meta.format);
    ConvGeometry {
        n,
        ic,
        ih,
        iw,
        oc,
        oh,
        ow,
        fh: meta.spatial[0],
        fw: meta.spatial[1],
        ph: meta.padding[0],
        pw: meta.padding[1],
        sh: meta.stride[0],
        sw: meta.stride[1],
        dh: meta.dilation[0],
        dw: meta.dilation[1],
        group: meta.group,
    }
}

/// Whether the vendor convolution entry points can describe these layouts.
///
/// Filter descriptors carry no strides, so the filter side must be
/// contiguous.
pub fn is_vendor_supported(
    src: &TensorLayout,
    diff: &TensorLayout,
    grad: &TensorLayout,
    meta: &CanonizedFilterMeta,
) -> bool {
    let dtype_ok = matches!(src.dtype(), DType::Float32 | DType::Float16)
        && diff.dtype() == src.dtype()
        && grad.dtype() == src.dtype();
    dtype_ok && grad.is_contiguous() && src.ndim() == 4 && diff.ndim() == 4 && meta.group > 0
}

/// Per-group `grad[g] = diff_t[g] * col[g]^T`, where `diff_t` is
/// `[OC, N*OH*OW]` and `col` is `[IC*FH*FW, N*OH*OW]`.
#[allow(clippy::too_many_arguments)]
pub(crate) fn bwd_filter_gemm(
    handle: &Handle,
    dtype: DType,
    geometry: &ConvGeometry,
    diff_t: DevicePtr,
    col: DevicePtr,
    grad: DevicePtr,
    algo: &str,
    info: impl Fn() -> String,
) -> Result<()> {
    let esize = dtype.size_in_bytes();
    let m = geometry.ocpg();
    let n = geometry.icpg() * geometry.fh * geometry.fw;
    let k = geometry.col_cols();
    for group in 0..geometry.group {
        let call = GemmCall {
            stream: handle.stream(),
            dtype,
            transpose_a: false,
            transpose_b: true,
            m,
            n,
            k,
            a: diff_t.offset(group * m * k * esize),
            lda: k,
            b: col.offset(group * n * k * esize),
            ldb: k,
            c: grad.offset(group * m * n * esize),
            ldc: n,
            scaling: Scaling::OVERWRITE,
        };
        check_status(handle.kernels().gemm(&call), "gemm", algo, &info)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_extent() {
        assert_eq!(conv_output_extent(8, 3, 1, 1, 1), Some(8));
        assert_eq!(conv_output_extent(8, 3, 0, 2, 1), Some(3));
        assert_eq!(conv_output_extent(8, 3, 0, 1, 2), Some(4));
        assert_eq!(conv_output_extent(2, 5, 0, 1, 1), None);
    }

    #[test]
    fn test_canonize_dense_and_group() {
        let param = ConvolutionParam::default().with_padding(1, 1);
        let dense = TensorLayout::from_dims(&[16, 8, 3, 3], DType::Float32).unwrap();
        let meta = CanonizedFilterMeta::new(4, &dense, &param).unwrap();
        assert_eq!((meta.group, meta.ocpg, meta.icpg), (1, 16, 8));
        assert!(!meta.should_flip);

        let param = param.with_sparse(Sparse::Group);
        let group = TensorLayout::from_dims(&[4, 2, 1, 3, 3], DType::Float32).unwrap();
        let meta = CanonizedFilterMeta::new(4, &group, &param).unwrap();
        assert_eq!((meta.group, meta.ocpg, meta.icpg), (4, 2, 1));
        assert_eq!((meta.ic(), meta.oc()), (4, 8));

        assert!(CanonizedFilterMeta::new(4, &dense, &param).is_err());
    }

    #[test]
    fn test_check_layout_fwd() {
        let param = ConvolutionParam::default().with_padding(1, 1);
        let filter = TensorLayout::from_dims(&[16, 8, 3, 3], DType::Float32).unwrap();
        let meta = CanonizedFilterMeta::new(4, &filter, &param).unwrap();
        let src = TensorLayout::from_dims(&[2, 8, 10, 10], DType::Float32).unwrap();
        let dst = TensorLayout::from_dims(&[2, 16, 10, 10], DType::Float32).unwrap();
        check_layout_fwd(&src, &meta, &dst).unwrap();

        let bad = TensorLayout::from_dims(&[2, 16, 9, 10], DType::Float32).unwrap();
        assert!(check_layout_fwd(&src, &meta, &bad).is_err());
    }
}

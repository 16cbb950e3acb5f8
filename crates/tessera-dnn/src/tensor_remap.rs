//! Indexing remap: gather through an explicit index map, and its gradient.
//!
//! `map` is an int32 tensor of shape `dst.shape ++ [src.ndim]`; entry
//! `map[i]` holds the source coordinates `dst[i]` is read from. Both
//! directions run as a single kernel and need no workspace.

use tracing::instrument;

use tessera_core::param::IndexingRemapParam;
use tessera_core::{DType, MAX_NDIM, TensorLayout, TensorND, Workspace};

use crate::error::check_status;
use crate::handle::Handle;
use crate::kernels::{RemapBackwardCall, RemapForwardCall};
use crate::{Error, Result};

/// Check the data, map and result layouts of a remap.
///
/// `src` is the tensor indexed into, `dst` the tensor with the map's
/// leading shape.
pub fn check_layout_fwd(src: &TensorLayout, map: &TensorLayout, dst: &TensorLayout) -> Result<()> {
    let invalid = |what: &str| {
        Err(Error::InvalidArgs(format!(
            "{what}: src={src} map={map} dst={dst}"
        )))
    };
    if src.dtype() != DType::Float32 || dst.dtype() != DType::Float32 {
        return invalid("data must be float32");
    }
    if map.dtype() != DType::Int32 {
        return invalid("map must be int32");
    }
    if map.ndim() != dst.ndim() + 1 {
        return invalid("map must have one more dimension than dst");
    }
    if map.dims()[..dst.ndim()] != *dst.dims() {
        return invalid("map must share the leading shape of dst");
    }
    if map.dims()[dst.ndim()] != src.ndim() {
        return invalid("last map dimension must equal src ndim");
    }
    if !map.is_contiguous() {
        return invalid("map must be contiguous");
    }
    Ok(())
}

fn strides(layout: &TensorLayout) -> Result<[i32; MAX_NDIM]> {
    let mut out = [0i32; MAX_NDIM];
    for (slot, &stride) in out.iter_mut().zip(layout.strides()) {
        *slot = i32::try_from(stride)
            .map_err(|_| Error::InvalidArgs(format!("stride of {layout} does not fit in i32")))?;
    }
    Ok(out)
}

fn shape(layout: &TensorLayout) -> Result<[u32; MAX_NDIM]> {
    let mut out = [0u32; MAX_NDIM];
    for (slot, &dim) in out.iter_mut().zip(layout.dims()) {
        *slot = u32::try_from(dim)
            .map_err(|_| Error::InvalidArgs(format!("extent of {layout} does not fit in u32")))?;
    }
    Ok(out)
}

/// `dst[i] = src[map[i]]`.
pub struct IndexingRemapForward<'h> {
    handle: &'h Handle,
    param: IndexingRemapParam,
}

impl<'h> IndexingRemapForward<'h> {
    pub fn new(handle: &'h Handle, param: IndexingRemapParam) -> Self {
        Self { handle, param }
    }

    pub fn param(&self) -> &IndexingRemapParam {
        &self.param
    }

    pub fn get_workspace_in_bytes(
        &self,
        _src: &TensorLayout,
        _map: &TensorLayout,
        _dst: &TensorLayout,
    ) -> usize {
        0
    }

    pub fn check_exec(
        &self,
        src: &TensorLayout,
        map: &TensorLayout,
        dst: &TensorLayout,
        workspace_in_bytes: usize,
    ) -> Result<()> {
        check_layout_fwd(src, map, dst)?;
        let required = self.get_workspace_in_bytes(src, map, dst);
        if workspace_in_bytes < required {
            return Err(Error::WorkspaceTooSmall {
                algo: "INDEXING_REMAP".to_string(),
                required,
                provided: workspace_in_bytes,
            });
        }
        Ok(())
    }

    #[instrument(skip_all, fields(src = %src.layout, dst = %dst.layout))]
    pub fn exec(
        &self,
        src: &TensorND,
        map: &TensorND,
        dst: &TensorND,
        workspace: Workspace,
    ) -> Result<()> {
        self.check_exec(&src.layout, &map.layout, &dst.layout, workspace.size)?;
        let call = RemapForwardCall {
            stream: self.handle.stream(),
            src: src.ptr,
            map: map.ptr,
            dst: dst.ptr,
            src_ndim: src.layout.ndim(),
            dst_ndim: dst.layout.ndim(),
            src_stride: strides(&src.layout)?,
            dst_stride: strides(&dst.layout)?,
            dst_shape: shape(&dst.layout)?,
        };
        let status = self.handle.kernels().indexing_remap_forward(&call);
        check_status(status, "indexing_remap_forward", "INDEXING_REMAP", || {
            format!("src={} map={} dst={}", src.layout, map.layout, dst.layout)
        })
    }
}

/// Gradient of [`IndexingRemapForward`]: `grad[map[i]] += diff[i]`.
///
/// With `is_non_overlapping` the caller promises every source element is
/// hit at most once, so the kernel may store instead of accumulate.
pub struct IndexingRemapBackward<'h> {
    handle: &'h Handle,
    param: IndexingRemapParam,
}

impl<'h> IndexingRemapBackward<'h> {
    pub fn new(handle: &'h Handle, param: IndexingRemapParam) -> Self {
        Self { handle, param }
    }

    pub fn param(&self) -> &IndexingRemapParam {
        &self.param
    }

    pub fn get_workspace_in_bytes(
        &self,
        _diff: &TensorLayout,
        _map: &TensorLayout,
        _grad: &TensorLayout,
    ) -> usize {
        0
    }

    pub fn check_exec(
        &self,
        diff: &TensorLayout,
        map: &TensorLayout,
        grad: &TensorLayout,
        workspace_in_bytes: usize,
    ) -> Result<()> {
        check_layout_fwd(grad, map, diff)?;
        let required = self.get_workspace_in_bytes(diff, map, grad);
        if workspace_in_bytes < required {
            return Err(Error::WorkspaceTooSmall {
                algo: "INDEXING_REMAP".to_string(),
                required,
                provided: workspace_in_bytes,
            });
        }
        Ok(())
    }

    #[instrument(skip_all, fields(diff = %diff.layout, grad = %grad.layout))]
    pub fn exec(
        &self,
        diff: &TensorND,
        map: &TensorND,
        grad: &TensorND,
        workspace: Workspace,
    ) -> Result<()> {
        self.check_exec(&diff.layout, &map.layout, &grad.layout, workspace.size)?;
        let call = RemapBackwardCall {
            stream: self.handle.stream(),
            diff: diff.ptr,
            map: map.ptr,
            grad: grad.ptr,
            grad_ndim: grad.layout.ndim(),
            diff_ndim: diff.layout.ndim(),
            grad_stride: strides(&grad.layout)?,
            grad_shape: shape(&grad.layout)?,
            diff_stride: strides(&diff.layout)?,
            diff_shape: shape(&diff.layout)?,
            is_non_overlapping: self.param.is_non_overlapping,
        };
        let status = self.handle.kernels().indexing_remap_backward(&call);
        check_status(status, "indexing_remap_backward", "INDEXING_REMAP", || {
            format!("diff={} map={} grad={}", diff.layout, map.layout, grad.layout)
        })
    }
}

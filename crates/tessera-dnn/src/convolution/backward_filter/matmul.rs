use tessera_core::param::Format;
use tessera_core::{DType, DevicePtr};

use crate::Result;
use crate::algo::Algorithm;
use crate::error::check_status;
use crate::convolution::helper::bwd_filter_gemm;
use crate::workspace::WorkspaceBundle;

use super::{ConvBwdFilterOp, ExecArgs, SizeArgs};

/// im2col followed by one GEMM per group:
/// `grad[g] = diff_t[g] * col[g]^T`.
///
/// Workspace holds the column matrix `[IC*FH*FW, N*OH*OW]` and the
/// output gradient transposed to `[OC, N*OH*OW]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlgoMatmul;

impl AlgoMatmul {
    pub const NAME: &'static str = "MATMUL";

    fn get_workspace_bundle(args: &SizeArgs<'_>, ptr: DevicePtr) -> WorkspaceBundle {
        let geometry = args.geometry();
        let esize = args.src_layout.dtype().size_in_bytes();
        let col = geometry.col_rows() * geometry.col_cols() * esize;
        let diff_t = geometry.oc * geometry.col_cols() * esize;
        WorkspaceBundle::new(ptr, vec![col, diff_t])
    }
}

impl Algorithm<ConvBwdFilterOp> for AlgoMatmul {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn is_reproducible(&self) -> bool {
        true
    }

    fn is_available(&self, args: &SizeArgs<'_>) -> bool {
        let meta = &args.grad_filter_meta;
        meta.format == Format::Nchw
            && !meta.should_flip
            && matches!(args.src_layout.dtype(), DType::Float32 | DType::Float16)
            && args.src_layout.is_contiguous()
            && args.diff_layout.is_contiguous()
            && args.grad_layout.is_contiguous()
    }

    fn get_workspace_in_bytes(&self, args: &SizeArgs<'_>) -> Result<usize> {
        Ok(Self::get_workspace_bundle(args, DevicePtr::NULL).total_size_in_bytes())
    }

    fn exec(&self, args: &ExecArgs<'_>) -> Result<()> {
        let handle = args.handle;
        let kernels = handle.kernels();
        let stream = handle.stream();
        let dtype = args.src_layout.dtype();
        let geometry = args.geometry();
        let bundle = Self::get_workspace_bundle(&args.size, args.workspace.ptr);
        let (col, diff_t) = (bundle.get(0), bundle.get(1));
        let info = || args.size.to_string();

        let status = kernels.im2col(stream, dtype, args.src.ptr, col, &geometry);
        check_status(status, "im2col", Self::NAME, info)?;

        let status = kernels.nchw_to_cnhw(
            stream,
            dtype,
            args.diff.ptr,
            diff_t,
            geometry.n,
            geometry.oc,
            geometry.oh * geometry.ow,
        );
        check_status(status, "nchw_to_cnhw", Self::NAME, info)?;

        bwd_filter_gemm(
            handle,
            dtype,
            &geometry,
            diff_t,
            col,
            args.grad.ptr,
            Self::NAME,
            info,
        )
    }
}

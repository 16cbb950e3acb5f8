use tessera_core::{DType, DevicePtr};

use crate::Result;
use crate::algo::Algorithm;
use crate::convolution::helper::bwd_filter_gemm;
use crate::error::check_status;
use crate::workspace::WorkspaceBundle;

use super::{DeformableConvBwdFilterOp, ExecArgs, SizeArgs};

/// Deformable im2col followed by one GEMM per group.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlgoMatmul;

impl AlgoMatmul {
    pub const NAME: &'static str = "MATMUL";

    fn get_bundle(args: &SizeArgs<'_>, ptr: DevicePtr) -> WorkspaceBundle {
        let geometry = args.geometry().conv;
        let esize = args.im_layout.dtype().size_in_bytes();
        let col = geometry.col_rows() * geometry.col_cols() * esize;
        let out_grad_t = geometry.oc * geometry.col_cols() * esize;
        WorkspaceBundle::new(ptr, vec![col, out_grad_t])
    }
}

impl Algorithm<DeformableConvBwdFilterOp> for AlgoMatmul {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn is_reproducible(&self) -> bool {
        true
    }

    fn is_available(&self, args: &SizeArgs<'_>) -> bool {
        args.im_layout.dtype() == DType::Float32
            && !args.filter_grad_meta.should_flip
            && args.im_layout.is_contiguous()
            && args.offset_layout.is_contiguous()
            && args.mask_layout.is_contiguous()
            && args.out_grad_layout.is_contiguous()
            && args.filter_grad_layout.is_contiguous()
    }

    fn get_workspace_in_bytes(&self, args: &SizeArgs<'_>) -> Result<usize> {
        Ok(Self::get_bundle(args, DevicePtr::NULL).total_size_in_bytes())
    }

    fn exec(&self, args: &ExecArgs<'_>) -> Result<()> {
        let handle = args.handle;
        let stream = handle.stream();
        let dtype = args.im_layout.dtype();
        let geometry = args.geometry();
        let bundle = Self::get_bundle(&args.size, args.workspace.ptr);
        let (col, out_grad_t) = (bundle.get(0), bundle.get(1));
        let info = || args.size.to_string();

        let status = handle.kernels().deformable_im2col(
            stream,
            dtype,
            args.im.ptr,
            args.offset.ptr,
            args.mask.ptr,
            col,
            &geometry,
        );
        check_status(status, "deformable_im2col", Self::NAME, info)?;

        let conv = geometry.conv;
        let status = handle.kernels().nchw_to_cnhw(
            stream,
            dtype,
            args.out_grad.ptr,
            out_grad_t,
            conv.n,
            conv.oc,
            conv.oh * conv.ow,
        );
        check_status(status, "nchw_to_cnhw", Self::NAME, info)?;

        bwd_filter_gemm(
            handle,
            dtype,
            &conv,
            out_grad_t,
            col,
            args.filter_grad.ptr,
            Self::NAME,
            info,
        )
    }
}

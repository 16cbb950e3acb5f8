use tessera_core::DType;
use tessera_core::param::{Format, Sparse};

use crate::Result;
use crate::algo::Algorithm;
use crate::error::check_status;

use super::{ConvBwdFilterOp, ExecArgs, SizeArgs};

/// Filter gradient of a channel-wise convolution (one input channel per
/// group) computed directly, without scratch memory.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlgoChanwise;

impl AlgoChanwise {
    pub const NAME: &'static str = "CHANNEL_WISE";
}

impl Algorithm<ConvBwdFilterOp> for AlgoChanwise {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn is_reproducible(&self) -> bool {
        true
    }

    fn is_available(&self, args: &SizeArgs<'_>) -> bool {
        let meta = &args.grad_filter_meta;
        args.param.sparse == Sparse::Group
            && meta.icpg == 1
            && meta.dilation == [1, 1]
            && meta.format == Format::Nchw
            && !meta.should_flip
            && args.src_layout.dtype() == DType::Float32
            && args.diff_layout.dtype() == DType::Float32
            && args.src_layout.is_contiguous()
            && args.diff_layout.is_contiguous()
            && args.grad_layout.is_contiguous()
    }

    fn get_workspace_in_bytes(&self, _args: &SizeArgs<'_>) -> Result<usize> {
        Ok(0)
    }

    fn exec(&self, args: &ExecArgs<'_>) -> Result<()> {
        let geometry = args.geometry();
        let status = args.handle.kernels().chanwise_bwd_filter(
            args.handle.stream(),
            args.src_layout.dtype(),
            args.src.ptr,
            args.diff.ptr,
            args.grad.ptr,
            &geometry,
        );
        check_status(status, "chanwise_bwd_filter", Self::NAME, || {
            args.size.to_string()
        })
    }
}

//! Deformable convolution backward-filter.
//!
//! Layouts, NCHW only:
//! - `im`: `[N, IC, IH, IW]`
//! - `offset`: `[N, 2 * DG * FH * FW, OH, OW]`
//! - `mask`: `[N, DG * FH * FW, OH, OW]`
//! - `out_grad`: `[N, OC, OH, OW]`
//! - `filter_grad`: dense or group filter, as for plain convolution
//!
//! where `DG` is the number of deformable groups.

mod matmul;

use std::fmt;
use std::ops::Deref;

use tracing::instrument;

use tessera_core::param::{ConvolutionParam, Format};
use tessera_core::{TensorLayout, TensorND, Workspace};

use crate::algo::{Algorithm, Operation};
use crate::convolution::helper::{CanonizedFilterMeta, check_layout_fwd, conv_geometry};
use crate::handle::Handle;
use crate::kernels::DeformableGeometry;
use crate::policy::{ExecutionPolicy, exec_checked, select_algorithm};
use crate::registry::AlgorithmRegistry;
use crate::{Error, Result};

pub use matmul::AlgoMatmul;

/// Marker for the deformable convolution backward-filter operation kind.
pub struct DeformableConvBwdFilterOp;

impl Operation for DeformableConvBwdFilterOp {
    const NAME: &'static str = "deformable_conv_bwd_filter";
    type SizeArgs<'a> = SizeArgs<'a>;
    type ExecArgs<'a> = ExecArgs<'a>;

    fn size_args<'s, 'a: 's>(args: &'s ExecArgs<'a>) -> &'s SizeArgs<'a> {
        &args.size
    }

    fn workspace(args: &ExecArgs<'_>) -> Workspace {
        args.workspace
    }
}

#[derive(Clone)]
pub struct SizeArgs<'a> {
    pub handle: &'a Handle,
    pub im_layout: &'a TensorLayout,
    pub offset_layout: &'a TensorLayout,
    pub mask_layout: &'a TensorLayout,
    pub out_grad_layout: &'a TensorLayout,
    pub filter_grad_layout: &'a TensorLayout,
    pub filter_grad_meta: CanonizedFilterMeta,
    pub deformable_group: usize,
}

impl<'a> SizeArgs<'a> {
    pub fn new(
        handle: &'a Handle,
        param: &ConvolutionParam,
        im: &'a TensorLayout,
        offset: &'a TensorLayout,
        mask: &'a TensorLayout,
        out_grad: &'a TensorLayout,
        filter_grad: &'a TensorLayout,
    ) -> Result<Self> {
        if param.format != Format::Nchw {
            return Err(Error::InvalidArgs(
                "deformable convolution supports NCHW only".to_string(),
            ));
        }
        let meta = CanonizedFilterMeta::new(im.ndim(), filter_grad, param)?;
        check_layout_fwd(im, &meta, out_grad)?;

        let invalid = |what: &str| {
            Err(Error::InvalidArgs(format!(
                "{what}: im={im} offset={offset} mask={mask} out_grad={out_grad}"
            )))
        };
        if offset.ndim() != 4 || mask.ndim() != 4 {
            return invalid("offset and mask must be 4-D");
        }
        if offset.dtype() != im.dtype() || mask.dtype() != im.dtype() {
            return invalid("offset and mask must match the im dtype");
        }
        let taps = meta.spatial[0] * meta.spatial[1];
        let (o, m, g) = (offset.dims(), mask.dims(), out_grad.dims());
        if o[1] == 0 || o[1] % (2 * taps) != 0 {
            return invalid("offset channels must be a multiple of 2 * FH * FW");
        }
        let deformable_group = o[1] / (2 * taps);
        if meta.ic() % deformable_group != 0 {
            return invalid("input channels must divide into deformable groups");
        }
        if m[1] != deformable_group * taps {
            return invalid("mask channels must equal DG * FH * FW");
        }
        let spatial_ok = [o, m]
            .iter()
            .all(|d| d[0] == g[0] && d[2] == g[2] && d[3] == g[3]);
        if !spatial_ok {
            return invalid("offset and mask must match the output batch and extents");
        }
        Ok(Self {
            handle,
            im_layout: im,
            offset_layout: offset,
            mask_layout: mask,
            out_grad_layout: out_grad,
            filter_grad_layout: filter_grad,
            filter_grad_meta: meta,
            deformable_group,
        })
    }

    pub fn geometry(&self) -> DeformableGeometry {
        DeformableGeometry {
            conv: conv_geometry(self.im_layout, self.out_grad_layout, &self.filter_grad_meta),
            deformable_group: self.deformable_group,
        }
    }
}

impl fmt::Display for SizeArgs<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "im={} offset={} mask={} out_grad={} filter_grad={}",
            self.im_layout,
            self.offset_layout,
            self.mask_layout,
            self.out_grad_layout,
            self.filter_grad_layout
        )
    }
}

pub struct ExecArgs<'a> {
    pub size: SizeArgs<'a>,
    pub im: &'a TensorND,
    pub offset: &'a TensorND,
    pub mask: &'a TensorND,
    pub out_grad: &'a TensorND,
    pub filter_grad: &'a TensorND,
    pub workspace: Workspace,
}

impl<'a> Deref for ExecArgs<'a> {
    type Target = SizeArgs<'a>;

    fn deref(&self) -> &SizeArgs<'a> {
        &self.size
    }
}

/// Tensors of one deformable backward-filter call.
#[derive(Debug, Clone, Copy)]
pub struct DeformableTensors<'a> {
    pub im: &'a TensorND,
    pub offset: &'a TensorND,
    pub mask: &'a TensorND,
    pub out_grad: &'a TensorND,
    pub filter_grad: &'a TensorND,
}

pub fn build_registry() -> AlgorithmRegistry<DeformableConvBwdFilterOp> {
    let mut registry = AlgorithmRegistry::new();
    registry.register(AlgoMatmul);
    registry
}

pub struct DeformableConvBackwardFilter<'h> {
    handle: &'h Handle,
    param: ConvolutionParam,
    policy: ExecutionPolicy,
}

impl<'h> DeformableConvBackwardFilter<'h> {
    pub fn new(handle: &'h Handle, param: ConvolutionParam) -> Self {
        Self {
            handle,
            param,
            policy: ExecutionPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: ExecutionPolicy) -> Self {
        self.policy = policy;
        self
    }

    fn size_args<'a>(
        &self,
        layouts: [&'a TensorLayout; 5],
    ) -> Result<SizeArgs<'a>>
    where
        'h: 'a,
    {
        let [im, offset, mask, out_grad, filter_grad] = layouts;
        SizeArgs::new(self.handle, &self.param, im, offset, mask, out_grad, filter_grad)
    }

    /// Strategy for the layouts `[im, offset, mask, out_grad, filter_grad]`.
    pub fn get_algorithm(
        &self,
        layouts: [&TensorLayout; 5],
        workspace_limit: usize,
    ) -> Result<&'h dyn Algorithm<DeformableConvBwdFilterOp>> {
        let args = self.size_args(layouts)?;
        let policy = self.policy.with_workspace_limit(workspace_limit);
        select_algorithm(self.handle.deformable_conv_bwd_filter_algos(), &args, &policy)
    }

    pub fn get_workspace_in_bytes(&self, layouts: [&TensorLayout; 5]) -> Result<usize> {
        let args = self.size_args(layouts)?;
        let algo = select_algorithm(
            self.handle.deformable_conv_bwd_filter_algos(),
            &args,
            &self.policy,
        )?;
        algo.get_workspace_in_bytes(&args)
    }

    #[instrument(skip_all, fields(im = %tensors.im.layout))]
    pub fn exec(&self, tensors: DeformableTensors<'_>, workspace: Workspace) -> Result<()> {
        let size = self.size_args([
            &tensors.im.layout,
            &tensors.offset.layout,
            &tensors.mask.layout,
            &tensors.out_grad.layout,
            &tensors.filter_grad.layout,
        ])?;
        let args = ExecArgs {
            size,
            im: tensors.im,
            offset: tensors.offset,
            mask: tensors.mask,
            out_grad: tensors.out_grad,
            filter_grad: tensors.filter_grad,
            workspace,
        };
        let policy = self.policy.capped_to(workspace.size);
        let algo = select_algorithm(
            self.handle.deformable_conv_bwd_filter_algos(),
            &args.size,
            &policy,
        )?;
        exec_checked(algo, &args)
    }
}

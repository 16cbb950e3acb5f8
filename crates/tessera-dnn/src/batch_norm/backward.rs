use std::fmt;

use tracing::{instrument, trace};

use tessera_core::param::{BatchNormParam, Format};
use tessera_core::{TensorLayout, TensorND, Workspace};

use crate::algo::{Algorithm, Operation};
use crate::descriptor::TensorDesc;
use crate::error::check_status;
use crate::handle::Handle;
use crate::policy::{ExecutionPolicy, exec_checked, select_algorithm};
use crate::vendor::{BnBackwardCall, Scaling};
use crate::{Error, Result};

use super::{BnDescs, BnStrategy, check_layouts, vendor_dtypes_supported};

/// Marker for the batch-norm backward operation kind.
pub struct BnBackwardOp;

impl Operation for BnBackwardOp {
    const NAME: &'static str = "bn_backward";
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
    pub param: BatchNormParam,
    pub x: &'a TensorLayout,
    pub dy: &'a TensorLayout,
    pub bn_param: &'a TensorLayout,
    pub dx: &'a TensorLayout,
}

impl<'a> SizeArgs<'a> {
    pub fn new(
        handle: &'a Handle,
        param: &BatchNormParam,
        x: &'a TensorLayout,
        dy: &'a TensorLayout,
        bn_param: &'a TensorLayout,
        dx: &'a TensorLayout,
    ) -> Result<Self> {
        check_layouts(x, dy, bn_param, param.param_dim)?;
        check_layouts(x, dx, bn_param, param.param_dim)?;
        Ok(Self {
            handle,
            param: *param,
            x,
            dy,
            bn_param,
            dx,
        })
    }
}

impl fmt::Display for SizeArgs<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "x={} dy={} param={} dx={}",
            self.x, self.dy, self.bn_param, self.dx
        )
    }
}

/// Tensors of one backward call. `save_mean` and `save_variance` are the
/// batch statistics the training forward pass saved.
#[derive(Debug, Clone, Copy)]
pub struct BnBackwardTensors<'a> {
    pub x: &'a TensorND,
    pub dy: &'a TensorND,
    pub save_mean: &'a TensorND,
    pub save_variance: &'a TensorND,
    pub scale: &'a TensorND,
    pub d_scale: &'a TensorND,
    pub d_bias: &'a TensorND,
    pub dx: &'a TensorND,
}

pub struct ExecArgs<'a> {
    pub size: SizeArgs<'a>,
    pub tensors: BnBackwardTensors<'a>,
    pub workspace: Workspace,
}

impl<'a> ExecArgs<'a> {
    pub fn new(
        handle: &'a Handle,
        param: &BatchNormParam,
        tensors: BnBackwardTensors<'a>,
        workspace: Workspace,
    ) -> Result<Self> {
        let size = SizeArgs::new(
            handle,
            param,
            &tensors.x.layout,
            &tensors.dy.layout,
            &tensors.scale.layout,
            &tensors.dx.layout,
        )?;
        let per_channel = [
            tensors.save_mean,
            tensors.save_variance,
            tensors.d_scale,
            tensors.d_bias,
        ];
        if let Some(bad) = per_channel
            .iter()
            .find(|t| !t.layout.eq_shape(size.bn_param))
        {
            return Err(Error::InvalidArgs(format!(
                "statistics tensor {} does not match scale {}",
                bad.layout, size.bn_param
            )));
        }
        Ok(Self {
            size,
            tensors,
            workspace,
        })
    }
}

impl Algorithm<BnBackwardOp> for BnStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_reproducible(&self) -> bool {
        self.reproducible
    }

    fn is_available(&self, args: &SizeArgs<'_>) -> bool {
        if !self.serves(args.param.param_dim) || !vendor_dtypes_supported(args.x, args.bn_param) {
            return false;
        }
        let Ok(descs) = BnDescs::bind(args.handle, args.x, args.dx, self.mode) else {
            return false;
        };
        let (Ok(x), Ok(param)) = (descs.x.bound(), descs.param.bound()) else {
            return false;
        };
        match args
            .handle
            .library()
            .bn_backward_workspace_size(self.mode, x, param)
        {
            Ok(_) => true,
            Err(status) => {
                trace!(algo = %self.name, %status, "unavailable");
                false
            }
        }
    }

    fn get_workspace_in_bytes(&self, args: &SizeArgs<'_>) -> Result<usize> {
        let descs = BnDescs::bind(args.handle, args.x, args.dx, self.mode)?;
        args.handle
            .library()
            .bn_backward_workspace_size(self.mode, descs.x.bound()?, descs.param.bound()?)
            .map_err(|status| Error::VendorCallFailed {
                call: "bn_backward_workspace_size",
                status,
                algo: self.name.clone(),
                args: args.to_string(),
            })
    }

    fn exec(&self, args: &ExecArgs<'_>) -> Result<()> {
        let size = &args.size;
        let t = &args.tensors;
        let descs = BnDescs::bind(size.handle, size.x, size.dx, self.mode)?;
        let mut dy_desc = TensorDesc::new(size.handle.library());
        dy_desc.set(size.dy, Format::Nchw)?;
        let call = BnBackwardCall {
            stream: size.handle.stream(),
            mode: self.mode,
            data_scaling: Scaling::OVERWRITE,
            param_scaling: Scaling::OVERWRITE,
            x_desc: descs.x.bound()?,
            x: t.x.ptr,
            dy_desc: dy_desc.bound()?,
            dy: t.dy.ptr,
            dx_desc: descs.y.bound()?,
            dx: t.dx.ptr,
            param_desc: descs.param.bound()?,
            scale: t.scale.ptr,
            d_scale: t.d_scale.ptr,
            d_bias: t.d_bias.ptr,
            epsilon: size.param.epsilon,
            save_mean: t.save_mean.ptr,
            save_inv_variance: t.save_variance.ptr,
            workspace: args.workspace,
        };
        let status = size.handle.library().bn_backward(&call);
        check_status(status, "bn_backward", &self.name, || size.to_string())
    }
}

/// Batch-norm backward operator bound to one device handle.
pub struct BatchNormBackward<'h> {
    handle: &'h Handle,
    param: BatchNormParam,
    policy: ExecutionPolicy,
}

impl<'h> BatchNormBackward<'h> {
    pub fn new(handle: &'h Handle, param: BatchNormParam) -> Self {
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

    pub fn get_algorithm(
        &self,
        x: &TensorLayout,
        dy: &TensorLayout,
        bn_param: &TensorLayout,
        dx: &TensorLayout,
        workspace_limit: usize,
    ) -> Result<&'h dyn Algorithm<BnBackwardOp>> {
        let args = SizeArgs::new(self.handle, &self.param, x, dy, bn_param, dx)?;
        let policy = self.policy.with_workspace_limit(workspace_limit);
        select_algorithm(self.handle.bn_backward_algos(), &args, &policy)
    }

    pub fn get_workspace_in_bytes(
        &self,
        x: &TensorLayout,
        dy: &TensorLayout,
        bn_param: &TensorLayout,
        dx: &TensorLayout,
    ) -> Result<usize> {
        let args = SizeArgs::new(self.handle, &self.param, x, dy, bn_param, dx)?;
        let algo = select_algorithm(self.handle.bn_backward_algos(), &args, &self.policy)?;
        algo.get_workspace_in_bytes(&args)
    }

    #[instrument(skip_all, fields(x = %tensors.x.layout))]
    pub fn exec(&self, tensors: BnBackwardTensors<'_>, workspace: Workspace) -> Result<()> {
        let args = ExecArgs::new(self.handle, &self.param, tensors, workspace)?;
        let policy = self.policy.capped_to(workspace.size);
        let algo = select_algorithm(self.handle.bn_backward_algos(), &args.size, &policy)?;
        exec_checked(algo, &args)
    }
}

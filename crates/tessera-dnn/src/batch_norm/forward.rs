use std::fmt;

use tracing::{instrument, trace};

use tessera_core::param::{BatchNormParam, BnFwdMode};
use tessera_core::{TensorLayout, TensorND, Workspace};

use crate::algo::{Algorithm, Operation};
use crate::error::check_status;
use crate::handle::Handle;
use crate::policy::{ExecutionPolicy, exec_checked, select_algorithm};
use crate::vendor::{BnForwardInferenceCall, BnForwardTrainingCall, Scaling};
use crate::{Error, Result};

use super::{BnDescs, BnStrategy, check_layouts, vendor_dtypes_supported};

/// Marker for the batch-norm forward operation kind.
pub struct BnForwardOp;

impl Operation for BnForwardOp {
    const NAME: &'static str = "bn_forward";
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
    /// Layout shared by scale, bias and all statistics.
    pub bn_param: &'a TensorLayout,
    pub y: &'a TensorLayout,
}

impl<'a> SizeArgs<'a> {
    pub fn new(
        handle: &'a Handle,
        param: &BatchNormParam,
        x: &'a TensorLayout,
        bn_param: &'a TensorLayout,
        y: &'a TensorLayout,
    ) -> Result<Self> {
        check_layouts(x, y, bn_param, param.param_dim)?;
        Ok(Self {
            handle,
            param: *param,
            x,
            bn_param,
            y,
        })
    }

    fn is_training(&self) -> bool {
        self.param.fwd_mode == BnFwdMode::Training
    }
}

impl fmt::Display for SizeArgs<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "x={} param={} y={} {:?}",
            self.x, self.bn_param, self.y, self.param.fwd_mode
        )
    }
}

/// Tensors of one forward call.
///
/// `mean` and `variance` are the running statistics. They are updated in
/// place when training and read when running inference; a caller without
/// cross-iteration state passes `None`, which only training accepts.
#[derive(Debug, Clone, Copy)]
pub struct BnForwardTensors<'a> {
    pub x: &'a TensorND,
    pub scale: &'a TensorND,
    pub bias: &'a TensorND,
    pub mean: Option<&'a TensorND>,
    pub variance: Option<&'a TensorND>,
    pub save_mean: &'a TensorND,
    pub save_variance: &'a TensorND,
    pub y: &'a TensorND,
}

pub struct ExecArgs<'a> {
    pub size: SizeArgs<'a>,
    pub tensors: BnForwardTensors<'a>,
    pub workspace: Workspace,
}

impl<'a> ExecArgs<'a> {
    pub fn new(
        handle: &'a Handle,
        param: &BatchNormParam,
        tensors: BnForwardTensors<'a>,
        workspace: Workspace,
    ) -> Result<Self> {
        let size = SizeArgs::new(
            handle,
            param,
            &tensors.x.layout,
            &tensors.scale.layout,
            &tensors.y.layout,
        )?;
        let per_channel = [
            Some(tensors.bias),
            tensors.mean,
            tensors.variance,
            Some(tensors.save_mean),
            Some(tensors.save_variance),
        ];
        for tensor in per_channel.into_iter().flatten() {
            if !tensor.layout.eq_shape(size.bn_param) {
                return Err(Error::InvalidArgs(format!(
                    "statistics tensor {} does not match scale {}",
                    tensor.layout, size.bn_param
                )));
            }
        }
        if tensors.mean.is_some() != tensors.variance.is_some() {
            return Err(Error::InvalidArgs(
                "running mean and variance must be given together".to_string(),
            ));
        }
        if !size.is_training() && tensors.mean.is_none() {
            return Err(Error::InvalidArgs(
                "inference needs running statistics".to_string(),
            ));
        }
        Ok(Self {
            size,
            tensors,
            workspace,
        })
    }
}

impl Algorithm<BnForwardOp> for BnStrategy {
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
        let Ok(descs) = BnDescs::bind(args.handle, args.x, args.y, self.mode) else {
            return false;
        };
        if !args.is_training() {
            return true;
        }
        let (Ok(x), Ok(param)) = (descs.x.bound(), descs.param.bound()) else {
            return false;
        };
        match args
            .handle
            .library()
            .bn_forward_training_workspace_size(self.mode, x, param)
        {
            Ok(_) => true,
            Err(status) => {
                trace!(algo = %self.name, %status, "unavailable");
                false
            }
        }
    }

    fn get_workspace_in_bytes(&self, args: &SizeArgs<'_>) -> Result<usize> {
        if !args.is_training() {
            return Ok(0);
        }
        let descs = BnDescs::bind(args.handle, args.x, args.y, self.mode)?;
        args.handle
            .library()
            .bn_forward_training_workspace_size(self.mode, descs.x.bound()?, descs.param.bound()?)
            .map_err(|status| Error::VendorCallFailed {
                call: "bn_forward_training_workspace_size",
                status,
                algo: self.name.clone(),
                args: args.to_string(),
            })
    }

    fn exec(&self, args: &ExecArgs<'_>) -> Result<()> {
        let size = &args.size;
        let t = &args.tensors;
        let library = size.handle.library();
        let descs = BnDescs::bind(size.handle, size.x, size.y, self.mode)?;
        let status = if size.is_training() {
            library.bn_forward_training(&BnForwardTrainingCall {
                stream: size.handle.stream(),
                mode: self.mode,
                scaling: Scaling::OVERWRITE,
                x_desc: descs.x.bound()?,
                x: t.x.ptr,
                y_desc: descs.y.bound()?,
                y: t.y.ptr,
                param_desc: descs.param.bound()?,
                scale: t.scale.ptr,
                bias: t.bias.ptr,
                avg_factor: size.param.avg_factor,
                running_mean: t.mean.map(|m| m.ptr),
                running_variance: t.variance.map(|v| v.ptr),
                epsilon: size.param.epsilon,
                save_mean: t.save_mean.ptr,
                save_inv_variance: t.save_variance.ptr,
                workspace: args.workspace,
            })
        } else {
            let (Some(mean), Some(variance)) = (t.mean, t.variance) else {
                return Err(Error::InvalidArgs(
                    "inference needs running statistics".to_string(),
                ));
            };
            library.bn_forward_inference(&BnForwardInferenceCall {
                stream: size.handle.stream(),
                mode: self.mode,
                scaling: Scaling::OVERWRITE,
                x_desc: descs.x.bound()?,
                x: t.x.ptr,
                y_desc: descs.y.bound()?,
                y: t.y.ptr,
                param_desc: descs.param.bound()?,
                scale: t.scale.ptr,
                bias: t.bias.ptr,
                mean: mean.ptr,
                variance: variance.ptr,
                epsilon: size.param.epsilon,
            })
        };
        check_status(status, "bn_forward", &self.name, || size.to_string())
    }
}

/// Batch-norm forward operator bound to one device handle.
pub struct BatchNormForward<'h> {
    handle: &'h Handle,
    param: BatchNormParam,
    policy: ExecutionPolicy,
}

impl<'h> BatchNormForward<'h> {
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

    pub fn param(&self) -> &BatchNormParam {
        &self.param
    }

    pub fn get_algorithm(
        &self,
        x: &TensorLayout,
        bn_param: &TensorLayout,
        y: &TensorLayout,
        workspace_limit: usize,
    ) -> Result<&'h dyn Algorithm<BnForwardOp>> {
        let args = SizeArgs::new(self.handle, &self.param, x, bn_param, y)?;
        let policy = self.policy.with_workspace_limit(workspace_limit);
        select_algorithm(self.handle.bn_forward_algos(), &args, &policy)
    }

    pub fn get_workspace_in_bytes(
        &self,
        x: &TensorLayout,
        bn_param: &TensorLayout,
        y: &TensorLayout,
    ) -> Result<usize> {
        let args = SizeArgs::new(self.handle, &self.param, x, bn_param, y)?;
        let algo = select_algorithm(self.handle.bn_forward_algos(), &args, &self.policy)?;
        algo.get_workspace_in_bytes(&args)
    }

    #[instrument(skip_all, fields(x = %tensors.x.layout, mode = ?self.param.fwd_mode))]
    pub fn exec(&self, tensors: BnForwardTensors<'_>, workspace: Workspace) -> Result<()> {
        let args = ExecArgs::new(self.handle, &self.param, tensors, workspace)?;
        let policy = self.policy.capped_to(workspace.size);
        let algo = select_algorithm(self.handle.bn_forward_algos(), &args.size, &policy)?;
        exec_checked(algo, &args)
    }
}

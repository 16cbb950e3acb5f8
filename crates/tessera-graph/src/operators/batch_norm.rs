//! Batch normalization graph nodes.
//!
//! `BatchNormForward` has five outputs: running mean, running variance,
//! saved batch mean, saved batch variance and the normalized data `y`.
//!
//! With running statistics (five inputs) the first two outputs are the
//! statistics buffers themselves, updated in place; both must be shared
//! device tensors. Without them (three inputs) the first two outputs are
//! empty placeholders.

use tessera_core::param::{BatchNormParam, BnFwdMode};
use tessera_core::{DType, TensorLayout, TensorND, TensorShape, Workspace};
use tessera_dnn::batch_norm::{self as dnn, BnBackwardTensors, BnForwardTensors};
use tessera_dnn::{ExecutionPolicy, Handle};

use crate::config::OperatorNodeConfig;
use crate::ir::{ComputingGraph, NodeProps, OprId, VarFlags, VarId};
use crate::operator::{Operator, OutputSpec, check_arity};
use crate::{Error, Result};

/// Index of `y` among the forward outputs.
pub const Y: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Variant {
    WithRunningStats,
    Stateless,
}

impl Variant {
    fn nr_inputs(self) -> usize {
        match self {
            Variant::WithRunningStats => 5,
            Variant::Stateless => 3,
        }
    }
}

/// Running statistics updated in place by a training forward pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunningStats {
    pub mean: VarId,
    pub variance: VarId,
}

/// Inputs of a forward node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchNormInputs {
    pub x: VarId,
    pub scale: VarId,
    pub bias: VarId,
    pub running: Option<RunningStats>,
}

impl BatchNormInputs {
    pub fn new(x: VarId, scale: VarId, bias: VarId) -> Self {
        Self {
            x,
            scale,
            bias,
            running: None,
        }
    }

    pub fn with_running_stats(mut self, mean: VarId, variance: VarId) -> Self {
        self.running = Some(RunningStats { mean, variance });
        self
    }

    fn to_vec(self) -> Vec<VarId> {
        let mut inputs = vec![self.x, self.scale, self.bias];
        if let Some(running) = self.running {
            inputs.extend([running.mean, running.variance]);
        }
        inputs
    }
}

/// Output variables of a forward node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchNormOutputs {
    pub opr: OprId,
    pub mean: VarId,
    pub variance: VarId,
    pub save_mean: VarId,
    pub save_variance: VarId,
    pub y: VarId,
}

/// Insert a batch-norm forward node.
///
/// Running statistics, when given, must come from shared device tensors
/// since the node writes them in place. Inference mode reads them and so
/// requires them.
pub fn batch_norm(
    graph: &mut ComputingGraph,
    inputs: BatchNormInputs,
    param: BatchNormParam,
    config: OperatorNodeConfig,
) -> Result<BatchNormOutputs> {
    let variant = match inputs.running {
        Some(running) => {
            for (what, var) in [("mean", running.mean), ("variance", running.variance)] {
                let var = graph.var(var)?;
                if !var.source.is_shared_device_tensor() {
                    return Err(Error::InvalidGraph(format!(
                        "running {what} of BatchNormForward must be a shared device tensor; \
                         got {} from {:?}",
                        var.name, var.source
                    )));
                }
            }
            Variant::WithRunningStats
        }
        None if param.fwd_mode == BnFwdMode::Inference => {
            return Err(Error::InvalidGraph(
                "BatchNormForward in inference mode needs running statistics".to_string(),
            ));
        }
        None => Variant::Stateless,
    };

    let operator = BatchNormForward {
        param,
        policy: graph.policy_for(&config),
        variant,
    };
    let opr = graph.insert_opr(operator, &inputs.to_vec(), config)?;
    let outputs = graph.opr(opr)?.outputs();
    Ok(BatchNormOutputs {
        opr,
        mean: outputs[0],
        variance: outputs[1],
        save_mean: outputs[2],
        save_variance: outputs[3],
        y: outputs[Y],
    })
}

/// Inputs of a backward node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchNormBackwardInputs {
    pub x: VarId,
    pub y_grad: VarId,
    pub save_mean: VarId,
    pub save_variance: VarId,
    pub scale: VarId,
}

/// Gradients produced by a backward node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchNormGrads {
    pub opr: OprId,
    pub d_scale: VarId,
    pub d_bias: VarId,
    pub dx: VarId,
}

/// Insert a batch-norm backward node.
pub fn batch_norm_backward(
    graph: &mut ComputingGraph,
    inputs: BatchNormBackwardInputs,
    param: BatchNormParam,
    config: OperatorNodeConfig,
) -> Result<BatchNormGrads> {
    let operator = BatchNormBackward {
        param,
        policy: graph.policy_for(&config),
    };
    let vars = [
        inputs.x,
        inputs.y_grad,
        inputs.save_mean,
        inputs.save_variance,
        inputs.scale,
    ];
    let opr = graph.insert_opr(operator, &vars, config)?;
    let outputs = graph.opr(opr)?.outputs();
    Ok(BatchNormGrads {
        opr,
        d_scale: outputs[0],
        d_bias: outputs[1],
        dx: outputs[2],
    })
}

fn require_contiguous(op: &str, what: &str, tensor: &TensorND) -> Result<()> {
    if tensor.layout.is_contiguous() {
        Ok(())
    } else {
        Err(Error::Layout(format!(
            "{op} needs contiguous {what}, got {}",
            tensor.layout
        )))
    }
}

/// Check that the statistics shape fits the data shape under `param`.
fn check_param_shape(x: &TensorShape, stat: &TensorShape, param: &BatchNormParam) -> Result<()> {
    let data = TensorLayout::new(x.clone(), DType::Float32);
    let expected = dnn::param_shape(&data, param.param_dim)?;
    if stat.dims() != expected {
        return Err(Error::InvalidGraph(format!(
            "statistics shape {stat} does not fit data {x} under {:?}, expected {expected:?}",
            param.param_dim
        )));
    }
    Ok(())
}

/// Forward node.
pub struct BatchNormForward {
    param: BatchNormParam,
    policy: ExecutionPolicy,
    variant: Variant,
}

impl BatchNormForward {
    pub const TYPE: &'static str = "BatchNormForward";

    pub fn param(&self) -> &BatchNormParam {
        &self.param
    }

    pub fn has_running_stats(&self) -> bool {
        self.variant == Variant::WithRunningStats
    }
}

impl Operator for BatchNormForward {
    fn type_name(&self) -> &'static str {
        Self::TYPE
    }

    fn nr_outputs(&self) -> usize {
        5
    }

    fn output_spec(&self, idx: usize) -> OutputSpec {
        match (self.variant, idx) {
            (Variant::WithRunningStats, 0) => OutputSpec::in_place(3),
            (Variant::WithRunningStats, 1) => OutputSpec::in_place(4),
            (Variant::Stateless, 0 | 1) => {
                OutputSpec::plain().with_flags(VarFlags::ALLOW_EMPTY_SHAPE | VarFlags::VOLATILE_CONTENT)
            }
            _ => OutputSpec::plain(),
        }
    }

    fn node_props(&self) -> NodeProps {
        match self.variant {
            Variant::WithRunningStats => NodeProps::FORCE_UPDATE_INPUT_VAR,
            Variant::Stateless => NodeProps::empty(),
        }
    }

    fn infer_dtypes(&self, inputs: &[DType]) -> Result<Vec<DType>> {
        check_arity(Self::TYPE, inputs.len(), &[self.variant.nr_inputs()])?;
        let (x, stat) = (inputs[0], inputs[1]);
        if x.category() != stat.category() {
            return Err(Error::DTypeMismatch(format!(
                "{}: data {x} and scale {stat} differ in category",
                Self::TYPE
            )));
        }
        for (i, &dtype) in inputs.iter().enumerate().skip(2) {
            if dtype != stat {
                return Err(Error::DTypeMismatch(format!(
                    "{}: input {i} is {dtype}, scale is {stat}",
                    Self::TYPE
                )));
            }
        }
        Ok(vec![stat, stat, stat, stat, x])
    }

    fn infer_shapes(&self, inputs: &[&TensorShape]) -> Result<Vec<TensorShape>> {
        check_arity(Self::TYPE, inputs.len(), &[self.variant.nr_inputs()])?;
        let (x, scale, bias) = (inputs[0], inputs[1], inputs[2]);
        check_param_shape(x, scale, &self.param)?;
        if bias != scale {
            return Err(Error::InvalidGraph(format!(
                "{}: bias {bias} and scale {scale} differ",
                Self::TYPE
            )));
        }

        let mut shapes = vec![scale.clone(); 4];
        shapes.push(x.clone());
        if self.variant == Variant::Stateless {
            shapes[0] = TensorShape::empty();
            shapes[1] = TensorShape::empty();
        }
        Ok(shapes)
    }

    fn workspace_in_bytes(
        &self,
        handle: &Handle,
        inputs: &[TensorLayout],
        outputs: &[TensorLayout],
    ) -> Result<usize> {
        check_arity(Self::TYPE, inputs.len(), &[self.variant.nr_inputs()])?;
        check_arity(Self::TYPE, outputs.len(), &[5])?;
        let bytes = dnn::BatchNormForward::new(handle, self.param)
            .with_policy(self.policy)
            .get_workspace_in_bytes(&inputs[0], &inputs[1], &outputs[Y])?;
        Ok(bytes)
    }

    fn execute(
        &self,
        handle: &Handle,
        inputs: &[TensorND],
        outputs: &[TensorND],
        workspace: Workspace,
    ) -> Result<()> {
        check_arity(Self::TYPE, inputs.len(), &[self.variant.nr_inputs()])?;
        check_arity(Self::TYPE, outputs.len(), &[5])?;
        require_contiguous(Self::TYPE, "x", &inputs[0])?;
        require_contiguous(Self::TYPE, "y", &outputs[Y])?;

        let (mean, variance) = match self.variant {
            Variant::WithRunningStats => (Some(&outputs[0]), Some(&outputs[1])),
            Variant::Stateless => (None, None),
        };
        let tensors = BnForwardTensors {
            x: &inputs[0],
            scale: &inputs[1],
            bias: &inputs[2],
            mean,
            variance,
            save_mean: &outputs[2],
            save_variance: &outputs[3],
            y: &outputs[Y],
        };
        dnn::BatchNormForward::new(handle, self.param)
            .with_policy(self.policy)
            .exec(tensors, workspace)?;
        Ok(())
    }

    /// x, scale and bias are differentiable through one shared backward
    /// node; the running statistics are not.
    fn grad(
        &self,
        graph: &mut ComputingGraph,
        opr: OprId,
        wrt_idx: usize,
        out_grads: &[Option<VarId>],
    ) -> Result<Option<VarId>> {
        if wrt_idx >= 3 {
            return Ok(None);
        }
        let Some(y_grad) = out_grads.get(Y).copied().flatten() else {
            return Ok(None);
        };

        let (param, policy) = (self.param, self.policy);
        let grads = graph.cached_grad(opr, y_grad, |graph| {
            let node = graph.opr(opr)?;
            let inputs = BatchNormBackwardInputs {
                x: node.inputs()[0],
                y_grad,
                save_mean: node.outputs()[2],
                save_variance: node.outputs()[3],
                scale: node.inputs()[1],
            };
            let config = OperatorNodeConfig::new()
                .with_name(format!("{}:grad", node.name()))
                .with_policy(policy);
            let grads = batch_norm_backward(graph, inputs, param, config)?;
            Ok(vec![grads.d_scale, grads.d_bias, grads.dx])
        })?;
        Ok(Some(grads[(wrt_idx + 2) % 3]))
    }
}

/// Backward node: (x, y_grad, save_mean, save_variance, scale) to
/// (d_scale, d_bias, dx).
pub struct BatchNormBackward {
    param: BatchNormParam,
    policy: ExecutionPolicy,
}

impl BatchNormBackward {
    pub const TYPE: &'static str = "BatchNormBackward";
}

impl Operator for BatchNormBackward {
    fn type_name(&self) -> &'static str {
        Self::TYPE
    }

    fn nr_outputs(&self) -> usize {
        3
    }

    fn infer_dtypes(&self, inputs: &[DType]) -> Result<Vec<DType>> {
        check_arity(Self::TYPE, inputs.len(), &[5])?;
        let mismatch = |a: usize, b: usize| {
            Err(Error::DTypeMismatch(format!(
                "{}: input {a} is {}, input {b} is {}",
                Self::TYPE,
                inputs[a],
                inputs[b]
            )))
        };
        if inputs[0].category() != inputs[2].category() {
            return mismatch(0, 2);
        }
        if inputs[0] != inputs[1] {
            return mismatch(0, 1);
        }
        for i in [3, 4] {
            if inputs[i] != inputs[2] {
                return mismatch(2, i);
            }
        }
        Ok(vec![inputs[2], inputs[2], inputs[0]])
    }

    fn infer_shapes(&self, inputs: &[&TensorShape]) -> Result<Vec<TensorShape>> {
        check_arity(Self::TYPE, inputs.len(), &[5])?;
        let (x, dy, scale) = (inputs[0], inputs[1], inputs[4]);
        if x != dy {
            return Err(Error::InvalidGraph(format!(
                "{}: gradient {dy} does not match data {x}",
                Self::TYPE
            )));
        }
        check_param_shape(x, scale, &self.param)?;
        Ok(vec![scale.clone(), scale.clone(), x.clone()])
    }

    fn workspace_in_bytes(
        &self,
        handle: &Handle,
        inputs: &[TensorLayout],
        outputs: &[TensorLayout],
    ) -> Result<usize> {
        check_arity(Self::TYPE, inputs.len(), &[5])?;
        check_arity(Self::TYPE, outputs.len(), &[3])?;
        let bytes = dnn::BatchNormBackward::new(handle, self.param)
            .with_policy(self.policy)
            .get_workspace_in_bytes(&inputs[0], &inputs[1], &inputs[4], &outputs[2])?;
        Ok(bytes)
    }

    fn execute(
        &self,
        handle: &Handle,
        inputs: &[TensorND],
        outputs: &[TensorND],
        workspace: Workspace,
    ) -> Result<()> {
        check_arity(Self::TYPE, inputs.len(), &[5])?;
        check_arity(Self::TYPE, outputs.len(), &[3])?;
        require_contiguous(Self::TYPE, "x", &inputs[0])?;
        require_contiguous(Self::TYPE, "y_grad", &inputs[1])?;
        require_contiguous(Self::TYPE, "dx", &outputs[2])?;

        let tensors = BnBackwardTensors {
            x: &inputs[0],
            dy: &inputs[1],
            save_mean: &inputs[2],
            save_variance: &inputs[3],
            scale: &inputs[4],
            d_scale: &outputs[0],
            d_bias: &outputs[1],
            dx: &outputs[2],
        };
        dnn::BatchNormBackward::new(handle, self.param)
            .with_policy(self.policy)
            .exec(tensors, workspace)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape(dims: &[usize]) -> TensorShape {
        TensorShape::new(dims).unwrap()
    }

    fn forward(variant: Variant) -> BatchNormForward {
        BatchNormForward {
            param: BatchNormParam::default(),
            policy: ExecutionPolicy::default(),
            variant,
        }
    }

    #[test]
    fn test_forward_dtypes() {
        let op = forward(Variant::WithRunningStats);
        let f32x5 = [DType::Float32; 5];
        assert_eq!(op.infer_dtypes(&f32x5).unwrap(), vec![DType::Float32; 5]);

        let half = [
            DType::Float16,
            DType::Float32,
            DType::Float32,
            DType::Float32,
            DType::Float32,
        ];
        let out = op.infer_dtypes(&half).unwrap();
        assert_eq!(out[..4], [DType::Float32; 4]);
        assert_eq!(out[Y], DType::Float16);

        let bad_bias = [
            DType::Float32,
            DType::Float32,
            DType::Float16,
            DType::Float32,
            DType::Float32,
        ];
        assert!(matches!(op.infer_dtypes(&bad_bias), Err(Error::DTypeMismatch(_))));

        let int_data = [DType::Int32, DType::Float32, DType::Float32];
        assert!(matches!(
            forward(Variant::Stateless).infer_dtypes(&int_data),
            Err(Error::DTypeMismatch(_))
        ));
        assert!(matches!(
            op.infer_dtypes(&[DType::Float32; 3]),
            Err(Error::InvalidGraph(_))
        ));
    }

    #[test]
    fn test_forward_shapes() {
        let (x, p) = (shape(&[2, 3, 8, 8]), shape(&[1, 3, 1, 1]));

        let op = forward(Variant::WithRunningStats);
        let shapes = op.infer_shapes(&[&x, &p, &p, &p, &p]).unwrap();
        assert_eq!(shapes, vec![p.clone(), p.clone(), p.clone(), p.clone(), x.clone()]);

        let op = forward(Variant::Stateless);
        let shapes = op.infer_shapes(&[&x, &p, &p]).unwrap();
        assert_eq!(shapes[0], TensorShape::empty());
        assert_eq!(shapes[1], TensorShape::empty());
        assert_eq!(shapes[2], p);
        assert_eq!(shapes[Y], x);

        let wide = shape(&[1, 4, 1, 1]);
        assert!(op.infer_shapes(&[&x, &wide, &wide]).is_err());
        assert!(op.infer_shapes(&[&x, &p, &wide]).is_err());
    }

    #[test]
    fn test_output_specs() {
        let op = forward(Variant::WithRunningStats);
        assert_eq!(op.output_spec(0).force_in_place, Some(3));
        assert_eq!(op.output_spec(1).force_in_place, Some(4));
        assert!(op.output_spec(1).flags.contains(VarFlags::NO_MEM_RECLAIM));
        assert_eq!(op.output_spec(Y), OutputSpec::plain());
        assert!(op.node_props().contains(NodeProps::FORCE_UPDATE_INPUT_VAR));

        let op = forward(Variant::Stateless);
        let spec = op.output_spec(0);
        assert_eq!(spec.force_in_place, None);
        assert!(spec.flags.contains(VarFlags::ALLOW_EMPTY_SHAPE | VarFlags::VOLATILE_CONTENT));
        assert!(!spec.flags.contains(VarFlags::NO_MEM_RECLAIM));
        assert_eq!(op.node_props(), NodeProps::empty());
    }

    #[test]
    fn test_backward_inference() {
        let op = BatchNormBackward {
            param: BatchNormParam::default(),
            policy: ExecutionPolicy::default(),
        };
        let dtypes = [
            DType::Float16,
            DType::Float16,
            DType::Float32,
            DType::Float32,
            DType::Float32,
        ];
        assert_eq!(
            op.infer_dtypes(&dtypes).unwrap(),
            vec![DType::Float32, DType::Float32, DType::Float16]
        );
        let mut bad = dtypes;
        bad[1] = DType::Float32;
        assert!(matches!(op.infer_dtypes(&bad), Err(Error::DTypeMismatch(_))));

        let (x, p) = (shape(&[2, 3, 8, 8]), shape(&[1, 3, 1, 1]));
        assert_eq!(
            op.infer_shapes(&[&x, &x, &p, &p, &p]).unwrap(),
            vec![p.clone(), p.clone(), x.clone()]
        );
        let other = shape(&[2, 3, 4, 4]);
        assert!(op.infer_shapes(&[&x, &other, &p, &p, &p]).is_err());
    }
}

//! Filter-gradient graph node.

use tessera_core::param::ConvolutionParam;
use tessera_core::{DType, TensorLayout, TensorND, TensorShape, Workspace};
use tessera_dnn::convolution::helper::{CanonizedFilterMeta, check_layout_fwd};
use tessera_dnn::convolution::ConvolutionBackwardFilter as DnnBackwardFilter;
use tessera_dnn::{ExecutionPolicy, Handle};

use crate::config::OperatorNodeConfig;
use crate::ir::{ComputingGraph, VarId};
use crate::operator::{Operator, check_arity};
use crate::{Error, Result};

/// Gradient of a convolution with respect to its filter.
///
/// Inputs are `(src, diff, filter)`; `filter` only provides the gradient's
/// shape. Not differentiable.
pub struct ConvolutionBackwardFilter {
    param: ConvolutionParam,
    policy: ExecutionPolicy,
}

impl ConvolutionBackwardFilter {
    pub const TYPE: &'static str = "ConvolutionBackwardFilter";
}

/// Insert a filter-gradient node and return the gradient variable.
pub fn convolution_backward_filter(
    graph: &mut ComputingGraph,
    src: VarId,
    diff: VarId,
    filter: VarId,
    param: ConvolutionParam,
    config: OperatorNodeConfig,
) -> Result<VarId> {
    let operator = ConvolutionBackwardFilter {
        param,
        policy: graph.policy_for(&config),
    };
    let opr = graph.insert_opr(operator, &[src, diff, filter], config)?;
    Ok(graph.opr(opr)?.outputs()[0])
}

impl Operator for ConvolutionBackwardFilter {
    fn type_name(&self) -> &'static str {
        Self::TYPE
    }

    fn nr_outputs(&self) -> usize {
        1
    }

    fn infer_dtypes(&self, inputs: &[DType]) -> Result<Vec<DType>> {
        check_arity(Self::TYPE, inputs.len(), &[3])?;
        if inputs.iter().any(|&dtype| dtype != inputs[0]) {
            return Err(Error::DTypeMismatch(format!(
                "{}: src, diff and filter must share a dtype, got {inputs:?}",
                Self::TYPE
            )));
        }
        Ok(vec![inputs[0]])
    }

    fn infer_shapes(&self, inputs: &[&TensorShape]) -> Result<Vec<TensorShape>> {
        check_arity(Self::TYPE, inputs.len(), &[3])?;
        let layout = |shape: &TensorShape| TensorLayout::new(shape.clone(), DType::Float32);
        let (src, diff, filter) = (layout(inputs[0]), layout(inputs[1]), layout(inputs[2]));
        let meta = CanonizedFilterMeta::new(src.ndim(), &filter, &self.param)?;
        check_layout_fwd(&src, &meta, &diff)?;
        Ok(vec![inputs[2].clone()])
    }

    fn workspace_in_bytes(
        &self,
        handle: &Handle,
        inputs: &[TensorLayout],
        outputs: &[TensorLayout],
    ) -> Result<usize> {
        check_arity(Self::TYPE, inputs.len(), &[3])?;
        check_arity(Self::TYPE, outputs.len(), &[1])?;
        let bytes = DnnBackwardFilter::new(handle, self.param)
            .with_policy(self.policy)
            .get_workspace_in_bytes(&inputs[0], &inputs[1], &outputs[0])?;
        Ok(bytes)
    }

    fn execute(
        &self,
        handle: &Handle,
        inputs: &[TensorND],
        outputs: &[TensorND],
        workspace: Workspace,
    ) -> Result<()> {
        check_arity(Self::TYPE, inputs.len(), &[3])?;
        check_arity(Self::TYPE, outputs.len(), &[1])?;
        DnnBackwardFilter::new(handle, self.param)
            .with_policy(self.policy)
            .exec(&inputs[0], &inputs[1], &outputs[0], workspace)?;
        Ok(())
    }
}

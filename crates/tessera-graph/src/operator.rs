//! The operator trait implemented by every graph node kind.

use tessera_core::{DType, TensorLayout, TensorND, TensorShape, Workspace};
use tessera_dnn::Handle;

use crate::ir::{ComputingGraph, NodeProps, OprId, VarFlags, VarId};
use crate::{Error, Result};

/// Storage requirements of one output variable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutputSpec {
    pub flags: VarFlags,
    /// Index of the input whose storage this output must reuse.
    pub force_in_place: Option<usize>,
}

impl OutputSpec {
    /// An ordinary output with storage of its own.
    pub fn plain() -> Self {
        Self::default()
    }

    /// An output that reuses the storage of input `input` and is never
    /// reclaimed by the allocator.
    pub fn in_place(input: usize) -> Self {
        Self {
            flags: VarFlags::NO_MEM_RECLAIM,
            force_in_place: Some(input),
        }
    }

    pub fn with_flags(mut self, flags: VarFlags) -> Self {
        self.flags = self.flags | flags;
        self
    }
}

/// A node kind of the computing graph.
///
/// Inference runs on types and shapes only. `execute` binds buffers and
/// issues device work through the handle; it never waits for completion.
pub trait Operator: Send + Sync {
    /// Operator type name (e.g. "BatchNormForward").
    fn type_name(&self) -> &'static str;

    fn nr_outputs(&self) -> usize;

    fn output_spec(&self, _idx: usize) -> OutputSpec {
        OutputSpec::plain()
    }

    fn node_props(&self) -> NodeProps {
        NodeProps::empty()
    }

    /// Output dtypes from input dtypes. Called once, when the node is
    /// inserted; a mismatch rejects the node.
    fn infer_dtypes(&self, inputs: &[DType]) -> Result<Vec<DType>>;

    /// Output shapes from input shapes.
    fn infer_shapes(&self, inputs: &[&TensorShape]) -> Result<Vec<TensorShape>>;

    /// Scratch memory `execute` needs for these layouts.
    fn workspace_in_bytes(
        &self,
        _handle: &Handle,
        _inputs: &[TensorLayout],
        _outputs: &[TensorLayout],
    ) -> Result<usize> {
        Ok(0)
    }

    fn execute(
        &self,
        handle: &Handle,
        inputs: &[TensorND],
        outputs: &[TensorND],
        workspace: Workspace,
    ) -> Result<()>;

    /// Gradient variable for input `wrt_idx` of node `opr`, given one
    /// optional gradient per output. `None` means the input is not
    /// differentiable through this node.
    fn grad(
        &self,
        _graph: &mut ComputingGraph,
        _opr: OprId,
        _wrt_idx: usize,
        _out_grads: &[Option<VarId>],
    ) -> Result<Option<VarId>> {
        Ok(None)
    }
}

/// Check that `got` is one of the accepted input counts.
pub(crate) fn check_arity(op: &str, got: usize, accepted: &[usize]) -> Result<()> {
    if accepted.contains(&got) {
        Ok(())
    } else {
        Err(Error::InvalidGraph(format!(
            "{op} takes {accepted:?} inputs, got {got}"
        )))
    }
}

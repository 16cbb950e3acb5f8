//! The computing graph.
//!
//! The graph is a directed graph where:
//! - **Nodes** (`OprNode`) are operators (e.g. BatchNormForward)
//! - **Variables** (`VarNode`) are typed, shaped values flowing between
//!   operators, kept in a side table
//!
//! petgraph edges mirror producer → consumer variable flow and exist for
//! topological ordering. Source variables (graph inputs and shared device
//! tensors) have no producer node.

use std::collections::HashMap;
use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;

use petgraph::graph::NodeIndex;
use petgraph::stable_graph::StableGraph;
use petgraph::visit::Topo;
use tracing::{debug, instrument, trace};

use tessera_core::{DType, TensorLayout, TensorND, TensorShape, Workspace};
use tessera_dnn::{ExecutionPolicy, Handle};

use crate::config::OperatorNodeConfig;
use crate::operator::{Operator, OutputSpec};
use crate::{Error, Result};

/// Operator node identifier (backed by petgraph NodeIndex).
pub type OprId = NodeIndex;

/// Variable identifier: an index into the graph's variable table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(pub usize);

impl VarId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for VarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "var{}", self.0)
    }
}

/// Per-variable memory flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct VarFlags(u8);

impl VarFlags {
    /// Storage is never reclaimed by the allocator.
    pub const NO_MEM_RECLAIM: VarFlags = VarFlags(1);
    /// Content is not meaningful to consumers; only the buffer exists.
    pub const VOLATILE_CONTENT: VarFlags = VarFlags(1 << 1);
    /// The inferred shape may hold zero elements.
    pub const ALLOW_EMPTY_SHAPE: VarFlags = VarFlags(1 << 2);

    pub const fn empty() -> Self {
        VarFlags(0)
    }

    pub fn contains(self, other: VarFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for VarFlags {
    type Output = VarFlags;

    fn bitor(self, rhs: VarFlags) -> VarFlags {
        VarFlags(self.0 | rhs.0)
    }
}

/// Per-node properties consumed by the external scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct NodeProps(u8);

impl NodeProps {
    /// The node writes into storage of some of its inputs. Reads and
    /// writes of that storage must be ordered relative to this node.
    pub const FORCE_UPDATE_INPUT_VAR: NodeProps = NodeProps(1);

    pub const fn empty() -> Self {
        NodeProps(0)
    }

    pub fn contains(self, other: NodeProps) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Where a variable comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarSource {
    /// Graph input, bound per execution.
    Input,
    /// Long-lived device tensor shared across executions.
    SharedDeviceTensor,
    /// Long-lived device tensor whose buffer may be swapped between
    /// executions.
    VolatileSharedDeviceTensor,
    /// Output `idx` of operator `opr`.
    Opr { opr: OprId, idx: usize },
}

impl VarSource {
    /// Whether the variable is backed by persistent device storage that an
    /// operator may update in place.
    pub fn is_shared_device_tensor(&self) -> bool {
        matches!(
            self,
            VarSource::SharedDeviceTensor | VarSource::VolatileSharedDeviceTensor
        )
    }
}

/// Storage relation of an output variable to another variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageRelation {
    /// The variable aliases the exact storage of `source` and mutates it.
    ForceInPlace { source: VarId },
}

/// A typed, shaped value in the graph.
#[derive(Debug, Clone)]
pub struct VarNode {
    pub name: String,
    pub dtype: DType,
    /// `None` until inferred.
    pub shape: Option<TensorShape>,
    pub flags: VarFlags,
    pub source: VarSource,
    pub storage: Option<StorageRelation>,
}

impl VarNode {
    /// Contiguous layout of the inferred shape.
    pub fn layout(&self) -> Result<TensorLayout> {
        let shape = self
            .shape
            .clone()
            .ok_or_else(|| Error::InvalidGraph(format!("shape of {} is not inferred", self.name)))?;
        Ok(TensorLayout::new(shape, self.dtype))
    }

    pub fn producer(&self) -> Option<OprId> {
        match self.source {
            VarSource::Opr { opr, .. } => Some(opr),
            _ => None,
        }
    }
}

/// An operator node.
pub struct OprNode {
    name: String,
    operator: Arc<dyn Operator>,
    inputs: Vec<VarId>,
    outputs: Vec<VarId>,
    props: NodeProps,
    config: OperatorNodeConfig,
    workspace: Option<usize>,
}

impl OprNode {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_name(&self) -> &'static str {
        self.operator.type_name()
    }

    pub fn operator(&self) -> &dyn Operator {
        self.operator.as_ref()
    }

    pub fn inputs(&self) -> &[VarId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[VarId] {
        &self.outputs
    }

    pub fn props(&self) -> NodeProps {
        self.props
    }

    pub fn config(&self) -> &OperatorNodeConfig {
        &self.config
    }

    /// Workspace size recorded by the sizing pass, if it has run.
    pub fn workspace_in_bytes(&self) -> Option<usize> {
        self.workspace
    }
}

/// Computing graph bound to one device handle.
pub struct ComputingGraph {
    handle: Arc<Handle>,

    /// Policy for nodes whose config carries none.
    default_policy: ExecutionPolicy,

    /// Operator nodes; edge weights name the variable that flows.
    graph: StableGraph<OprNode, VarId>,

    /// Variable side table.
    vars: Vec<VarNode>,

    /// Lookup table: variable → consuming nodes.
    consumers: HashMap<VarId, Vec<OprId>>,

    /// Backward outputs built per (forward node, output gradient).
    grad_cache: HashMap<(OprId, VarId), Vec<VarId>>,
}

impl ComputingGraph {
    pub fn new(handle: Arc<Handle>) -> Self {
        Self {
            handle,
            default_policy: ExecutionPolicy::default(),
            graph: StableGraph::new(),
            vars: Vec::new(),
            consumers: HashMap::new(),
            grad_cache: HashMap::new(),
        }
    }

    /// A graph whose default policy is read from the environment.
    pub fn from_env(handle: Arc<Handle>) -> Result<Self> {
        Ok(Self::new(handle).with_default_policy(ExecutionPolicy::from_env()?))
    }

    pub fn with_default_policy(mut self, policy: ExecutionPolicy) -> Self {
        self.default_policy = policy;
        self
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn default_policy(&self) -> &ExecutionPolicy {
        &self.default_policy
    }

    /// The policy a node built with `config` selects under.
    pub fn policy_for(&self, config: &OperatorNodeConfig) -> ExecutionPolicy {
        config.policy().copied().unwrap_or(self.default_policy)
    }

    // ── Variables ──

    /// Add an input bound anew on every execution.
    pub fn add_input(&mut self, name: &str, dims: &[usize], dtype: DType) -> Result<VarId> {
        self.add_source(name, dims, dtype, VarSource::Input)
    }

    /// Add a long-lived device tensor, e.g. running statistics.
    pub fn add_shared_device_tensor(
        &mut self,
        name: &str,
        dims: &[usize],
        dtype: DType,
    ) -> Result<VarId> {
        self.add_source(name, dims, dtype, VarSource::SharedDeviceTensor)
    }

    pub fn add_volatile_shared_device_tensor(
        &mut self,
        name: &str,
        dims: &[usize],
        dtype: DType,
    ) -> Result<VarId> {
        self.add_source(name, dims, dtype, VarSource::VolatileSharedDeviceTensor)
    }

    fn add_source(
        &mut self,
        name: &str,
        dims: &[usize],
        dtype: DType,
        source: VarSource,
    ) -> Result<VarId> {
        let shape = TensorShape::new(dims)?;
        Ok(self.push_var(VarNode {
            name: name.to_string(),
            dtype,
            shape: Some(shape),
            flags: VarFlags::empty(),
            source,
            storage: None,
        }))
    }

    fn push_var(&mut self, var: VarNode) -> VarId {
        let id = VarId(self.vars.len());
        trace!(%id, name = %var.name, dtype = %var.dtype, "add var");
        self.vars.push(var);
        id
    }

    pub fn var(&self, id: VarId) -> Result<&VarNode> {
        self.vars
            .get(id.index())
            .ok_or_else(|| Error::InvalidGraph(format!("{id} not found")))
    }

    pub fn var_count(&self) -> usize {
        self.vars.len()
    }

    /// Change the shape of a source variable. Operator outputs pick the new
    /// shape up the next time shape inference runs.
    pub fn set_shape(&mut self, id: VarId, dims: &[usize]) -> Result<()> {
        let shape = TensorShape::new(dims)?;
        let var = self
            .vars
            .get_mut(id.index())
            .ok_or_else(|| Error::InvalidGraph(format!("{id} not found")))?;
        if let VarSource::Opr { .. } = var.source {
            return Err(Error::InvalidGraph(format!(
                "{} is an operator output; its shape is inferred",
                var.name
            )));
        }
        var.shape = Some(shape);
        Ok(())
    }

    /// Nodes consuming `id`.
    pub fn consumers(&self, id: VarId) -> Vec<OprId> {
        self.consumers.get(&id).cloned().unwrap_or_default()
    }

    /// Every `(output, source)` pair where `output` must reuse the storage
    /// of `source`.
    pub fn forced_aliases(&self) -> Vec<(VarId, VarId)> {
        self.vars
            .iter()
            .enumerate()
            .filter_map(|(i, var)| match var.storage {
                Some(StorageRelation::ForceInPlace { source }) => Some((VarId(i), source)),
                None => None,
            })
            .collect()
    }

    // ── Operators ──

    pub fn opr(&self, id: OprId) -> Result<&OprNode> {
        self.graph
            .node_weight(id)
            .ok_or_else(|| Error::InvalidGraph(format!("Operator {id:?} not found")))
    }

    fn opr_mut(&mut self, id: OprId) -> Result<&mut OprNode> {
        self.graph
            .node_weight_mut(id)
            .ok_or_else(|| Error::InvalidGraph(format!("Operator {id:?} not found")))
    }

    pub fn opr_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn oprs(&self) -> impl Iterator<Item = (OprId, &OprNode)> {
        self.graph
            .node_indices()
            .filter_map(|id| self.graph.node_weight(id).map(|node| (id, node)))
    }

    /// Insert an operator node consuming `inputs`.
    ///
    /// Output dtypes are inferred and checked here; a mismatch rejects the
    /// node and leaves the graph untouched. Output shapes are inferred as
    /// well when every input shape is known.
    pub fn insert_opr(
        &mut self,
        operator: impl Operator + 'static,
        inputs: &[VarId],
        config: OperatorNodeConfig,
    ) -> Result<OprId> {
        let operator: Arc<dyn Operator> = Arc::new(operator);
        let name = config
            .name()
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}{}", operator.type_name(), self.graph.node_count()));

        let in_dtypes = inputs
            .iter()
            .map(|&v| self.var(v).map(|var| var.dtype))
            .collect::<Result<Vec<_>>>()?;
        let out_dtypes = operator.infer_dtypes(&in_dtypes)?;
        if out_dtypes.len() != operator.nr_outputs() {
            return Err(Error::InvalidGraph(format!(
                "{name}: inferred {} output dtypes for {} outputs",
                out_dtypes.len(),
                operator.nr_outputs()
            )));
        }

        let specs: Vec<OutputSpec> = (0..out_dtypes.len())
            .map(|i| operator.output_spec(i))
            .collect();
        for (idx, spec) in specs.iter().enumerate() {
            if let Some(k) = spec.force_in_place {
                let Some(&source) = in_dtypes.get(k) else {
                    return Err(Error::InvalidGraph(format!(
                        "{name}: output {idx} aliases missing input {k}"
                    )));
                };
                if source != out_dtypes[idx] {
                    return Err(Error::DTypeMismatch(format!(
                        "{name}: output {idx} ({}) aliases input {k} ({source})",
                        out_dtypes[idx]
                    )));
                }
            }
        }

        let shapes = self.infer_output_shapes(operator.as_ref(), &name, inputs, &specs)?;

        let opr = self.graph.add_node(OprNode {
            name: name.clone(),
            operator: Arc::clone(&operator),
            inputs: inputs.to_vec(),
            outputs: Vec::new(),
            props: operator.node_props(),
            config,
            workspace: None,
        });

        let mut outputs = Vec::with_capacity(specs.len());
        for (idx, (dtype, spec)) in out_dtypes.into_iter().zip(&specs).enumerate() {
            let storage = spec
                .force_in_place
                .map(|k| StorageRelation::ForceInPlace { source: inputs[k] });
            let shape = shapes.as_ref().map(|s| s[idx].clone());
            outputs.push(self.push_var(VarNode {
                name: format!("{name}:{idx}"),
                dtype,
                shape,
                flags: spec.flags,
                source: VarSource::Opr { opr, idx },
                storage,
            }));
        }

        for &input in inputs {
            self.consumers.entry(input).or_default().push(opr);
            if let Some(producer) = self.vars[input.index()].producer() {
                self.graph.add_edge(producer, opr, input);
            }
        }

        debug!(
            opr = %name,
            op_type = operator.type_name(),
            inputs = inputs.len(),
            outputs = outputs.len(),
            "insert operator"
        );
        self.opr_mut(opr)?.outputs = outputs;
        Ok(opr)
    }

    /// Output shapes of `operator` over `inputs`, or `None` while an input
    /// shape is unknown.
    fn infer_output_shapes(
        &self,
        operator: &dyn Operator,
        name: &str,
        inputs: &[VarId],
        specs: &[OutputSpec],
    ) -> Result<Option<Vec<TensorShape>>> {
        let mut in_shapes = Vec::with_capacity(inputs.len());
        for &v in inputs {
            match &self.var(v)?.shape {
                Some(shape) => in_shapes.push(shape),
                None => return Ok(None),
            }
        }

        let shapes = operator.infer_shapes(&in_shapes)?;
        if shapes.len() != specs.len() {
            return Err(Error::InvalidGraph(format!(
                "{name}: inferred {} output shapes for {} outputs",
                shapes.len(),
                specs.len()
            )));
        }

        for (idx, (shape, spec)) in shapes.iter().zip(specs).enumerate() {
            if shape.is_empty() && !spec.flags.contains(VarFlags::ALLOW_EMPTY_SHAPE) {
                return Err(Error::InvalidGraph(format!(
                    "{name}: output {idx} has empty shape {shape}"
                )));
            }
            if let Some(k) = spec.force_in_place {
                if in_shapes[k] != shape {
                    return Err(Error::StorageAlias(format!(
                        "{name}: output {idx} of shape {shape} cannot reuse input {k} of shape {}",
                        in_shapes[k]
                    )));
                }
            }
        }
        Ok(Some(shapes))
    }

    /// Re-infer the output shapes of `opr` from its current input shapes.
    ///
    /// Returns `true` if any output shape changed.
    pub fn infer_opr_shapes(&mut self, opr: OprId) -> Result<bool> {
        let node = self.opr(opr)?;
        let operator = Arc::clone(&node.operator);
        let inputs = node.inputs.clone();
        let outputs = node.outputs.clone();
        let specs: Vec<OutputSpec> = (0..outputs.len()).map(|i| operator.output_spec(i)).collect();

        let Some(shapes) = self.infer_output_shapes(operator.as_ref(), &node.name, &inputs, &specs)?
        else {
            return Err(Error::InvalidGraph(format!(
                "{}: input shapes are not all known",
                node.name
            )));
        };

        let mut changed = false;
        for (var, shape) in outputs.into_iter().zip(shapes) {
            let slot = &mut self.vars[var.index()].shape;
            if slot.as_ref() != Some(&shape) {
                trace!(%var, %shape, "output shape updated");
                *slot = Some(shape);
                changed = true;
            }
        }
        Ok(changed)
    }

    /// Get nodes in topological order.
    pub fn topological_order(&self) -> Vec<OprId> {
        let mut topo = Topo::new(&self.graph);
        let mut order = Vec::with_capacity(self.graph.node_count());
        while let Some(id) = topo.next(&self.graph) {
            order.push(id);
        }
        order
    }

    // ── Workspace ──

    /// Workspace `opr` needs at its current shapes, under its node policy.
    pub fn compute_workspace(&self, opr: OprId) -> Result<usize> {
        let node = self.opr(opr)?;
        let inputs = self.layouts(&node.inputs)?;
        let outputs = self.layouts(&node.outputs)?;
        node.operator
            .workspace_in_bytes(&self.handle, &inputs, &outputs)
    }

    /// Record the workspace size the allocator must provide for `opr`.
    pub fn set_workspace(&mut self, opr: OprId, bytes: usize) -> Result<()> {
        self.opr_mut(opr)?.workspace = Some(bytes);
        Ok(())
    }

    fn layouts(&self, vars: &[VarId]) -> Result<Vec<TensorLayout>> {
        vars.iter().map(|&v| self.var(v)?.layout()).collect()
    }

    // ── Execution ──

    /// Run `opr` on bound buffers.
    ///
    /// Buffers must match the inferred shapes and dtypes, outputs forced
    /// in place must be bound to the storage of their source input, and
    /// the workspace must be at least the recorded size. All of this is
    /// checked before any device work is issued.
    #[instrument(skip_all, fields(opr = ?opr, workspace = workspace.size))]
    pub fn execute_opr(
        &self,
        opr: OprId,
        inputs: &[TensorND],
        outputs: &[TensorND],
        workspace: Workspace,
    ) -> Result<()> {
        let node = self.opr(opr)?;
        if inputs.len() != node.inputs.len() || outputs.len() != node.outputs.len() {
            return Err(Error::InvalidGraph(format!(
                "{}: bound {} inputs and {} outputs, expected {} and {}",
                node.name,
                inputs.len(),
                outputs.len(),
                node.inputs.len(),
                node.outputs.len()
            )));
        }
        for (&var, tensor) in node.inputs.iter().zip(inputs) {
            self.check_bound(var, tensor)?;
        }
        for (&var, tensor) in node.outputs.iter().zip(outputs) {
            self.check_bound(var, tensor)?;
        }

        for (&var, tensor) in node.outputs.iter().zip(outputs) {
            let Some(StorageRelation::ForceInPlace { source }) = self.var(var)?.storage else {
                continue;
            };
            let k = node
                .inputs
                .iter()
                .position(|&v| v == source)
                .ok_or_else(|| {
                    Error::StorageAlias(format!("{}: alias source {source} is not an input", node.name))
                })?;
            if tensor.ptr != inputs[k].ptr {
                return Err(Error::StorageAlias(format!(
                    "{}: {} bound at {} but must reuse input {k} at {}",
                    node.name,
                    self.var(var)?.name,
                    tensor.ptr,
                    inputs[k].ptr
                )));
            }
        }

        let required = match node.workspace {
            Some(bytes) => bytes,
            None => self.compute_workspace(opr)?,
        };
        if workspace.size < required {
            return Err(tessera_dnn::Error::WorkspaceTooSmall {
                algo: node.name.clone(),
                required,
                provided: workspace.size,
            }
            .into());
        }

        debug!(opr = %node.name, op_type = node.type_name(), "execute");
        node.operator
            .execute(&self.handle, inputs, outputs, workspace)
    }

    fn check_bound(&self, var: VarId, tensor: &TensorND) -> Result<()> {
        let node = self.var(var)?;
        let expected = node.layout()?;
        if !tensor.layout.eq_shape(&expected) || tensor.layout.dtype() != expected.dtype() {
            return Err(Error::Layout(format!(
                "{} bound to {} but inferred {}",
                node.name, tensor.layout, expected
            )));
        }
        Ok(())
    }

    // ── Gradients ──

    /// Gradient of `wrt_idx`-th input of `opr`, given one optional
    /// gradient per output.
    pub fn grad(
        &mut self,
        opr: OprId,
        wrt_idx: usize,
        out_grads: &[Option<VarId>],
    ) -> Result<Option<VarId>> {
        let node = self.opr(opr)?;
        if wrt_idx >= node.inputs.len() {
            return Err(Error::InvalidGraph(format!(
                "{} has {} inputs, gradient requested for input {wrt_idx}",
                node.name,
                node.inputs.len()
            )));
        }
        if out_grads.len() != node.outputs.len() {
            return Err(Error::InvalidGraph(format!(
                "{} has {} outputs, got {} output gradients",
                node.name,
                node.outputs.len(),
                out_grads.len()
            )));
        }
        for (&out, grad) in node.outputs.iter().zip(out_grads) {
            if let Some(grad) = grad {
                let (out, grad) = (self.var(out)?, self.var(*grad)?);
                if out.dtype != grad.dtype {
                    return Err(Error::DTypeMismatch(format!(
                        "gradient {} ({}) of {} ({})",
                        grad.name, grad.dtype, out.name, out.dtype
                    )));
                }
            }
        }
        let operator = Arc::clone(&node.operator);
        operator.grad(self, opr, wrt_idx, out_grads)
    }

    /// Backward outputs for `(opr, out_grad)`, building them with `build`
    /// only the first time they are requested.
    pub fn cached_grad(
        &mut self,
        opr: OprId,
        out_grad: VarId,
        build: impl FnOnce(&mut Self) -> Result<Vec<VarId>>,
    ) -> Result<Vec<VarId>> {
        if let Some(grads) = self.grad_cache.get(&(opr, out_grad)) {
            return Ok(grads.clone());
        }
        let grads = build(self)?;
        self.grad_cache.insert((opr, out_grad), grads.clone());
        Ok(grads)
    }
}

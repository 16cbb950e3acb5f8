//! Graph pass trait, stages and the pipeline that runs them.

use crate::Result;
use crate::ir::ComputingGraph;
use crate::passes::{ShapeInferencePass, WorkspaceSizingPass};

/// Stage a pass runs in. Stages run in declaration order; within a stage,
/// passes run in registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    /// Propagate shapes through the graph.
    Inference,

    /// Prepare for execution: workspace sizes and anything else the
    /// external scheduler or allocator consumes.
    Planning,
}

/// A graph transformation.
///
/// `run` returns `Ok(true)` if it changed the graph.
pub trait Pass: Send + Sync {
    /// Pass name, used for logging.
    fn name(&self) -> &str;

    fn stage(&self) -> Stage;

    fn run(&self, graph: &mut ComputingGraph) -> Result<bool>;
}

/// Ordered set of passes run after the graph is built or its source
/// shapes change.
pub struct GraphPipeline {
    passes: Vec<Box<dyn Pass>>,
}

impl GraphPipeline {
    /// Pipeline with the built-in `ShapeInferencePass` and
    /// `WorkspaceSizingPass`.
    pub fn new() -> Self {
        let mut pipeline = Self { passes: Vec::new() };
        pipeline
            .add_pass(ShapeInferencePass::new())
            .add_pass(WorkspaceSizingPass::new());
        pipeline
    }

    pub fn add_pass(&mut self, pass: impl Pass + 'static) -> &mut Self {
        self.passes.push(Box::new(pass));
        self
    }

    /// Run every pass in stage order. Returns `true` if any pass changed
    /// the graph.
    #[tracing::instrument(skip_all, fields(oprs = graph.opr_count(), vars = graph.var_count()))]
    pub fn run(&mut self, graph: &mut ComputingGraph) -> Result<bool> {
        self.passes.sort_by_key(|p| p.stage());

        let mut changed = false;
        for pass in &self.passes {
            let _span =
                tracing::debug_span!("pass", name = pass.name(), stage = ?pass.stage()).entered();
            changed |= pass.run(graph)?;
        }
        Ok(changed)
    }
}

impl Default for GraphPipeline {
    fn default() -> Self {
        Self::new()
    }
}

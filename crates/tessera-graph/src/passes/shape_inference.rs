//! Shape inference pass.
//!
//! Re-infers every operator's output shapes in topological order, so a
//! change to a source shape reaches every downstream variable.

use tracing::debug;

use crate::ir::ComputingGraph;
use crate::pass::{Pass, Stage};
use crate::Result;

pub struct ShapeInferencePass;

impl ShapeInferencePass {
    pub fn new() -> Self {
        Self
    }
}

impl Pass for ShapeInferencePass {
    fn name(&self) -> &str {
        "shape_inference"
    }

    fn stage(&self) -> Stage {
        Stage::Inference
    }

    fn run(&self, graph: &mut ComputingGraph) -> Result<bool> {
        let mut changed = false;
        for opr in graph.topological_order() {
            if graph.infer_opr_shapes(opr)? {
                debug!(opr = graph.opr(opr)?.name(), "output shapes changed");
                changed = true;
            }
        }
        Ok(changed)
    }
}

impl Default for ShapeInferencePass {
    fn default() -> Self {
        Self::new()
    }
}

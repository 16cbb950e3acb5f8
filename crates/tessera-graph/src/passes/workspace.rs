//! Workspace sizing pass.
//!
//! Records on every operator node the workspace its execution needs at the
//! current shapes. The external allocator reads the recorded sizes.

use tracing::debug;

use crate::ir::ComputingGraph;
use crate::pass::{Pass, Stage};
use crate::Result;

pub struct WorkspaceSizingPass;

impl WorkspaceSizingPass {
    pub fn new() -> Self {
        Self
    }
}

impl Pass for WorkspaceSizingPass {
    fn name(&self) -> &str {
        "workspace_sizing"
    }

    fn stage(&self) -> Stage {
        Stage::Planning
    }

    fn run(&self, graph: &mut ComputingGraph) -> Result<bool> {
        let mut changed = false;
        for opr in graph.topological_order() {
            let bytes = graph.compute_workspace(opr)?;
            let node = graph.opr(opr)?;
            if node.workspace_in_bytes() != Some(bytes) {
                debug!(opr = node.name(), bytes, "workspace sized");
                graph.set_workspace(opr, bytes)?;
                changed = true;
            }
        }
        Ok(changed)
    }
}

impl Default for WorkspaceSizingPass {
    fn default() -> Self {
        Self::new()
    }
}

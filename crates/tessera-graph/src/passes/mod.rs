//! Built-in graph passes.

mod shape_inference;
mod workspace;

pub use shape_inference::ShapeInferencePass;
pub use workspace::WorkspaceSizingPass;

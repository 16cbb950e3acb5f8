//! Differentiable operator nodes for the Tessera computing graph.
//!
//! This crate adapts the dispatch layer of `tessera-dnn` into nodes of a
//! symbolic graph:
//! - `ComputingGraph`: operator nodes over a petgraph stable graph, with
//!   typed, shaped variables kept in a side table
//! - The `Operator` trait a node kind implements: dtype and shape
//!   inference, output storage requirements, workspace sizing, execution
//!   and gradient construction
//! - Graph operator nodes (`BatchNormForward`, `BatchNormBackward`,
//!   `ConvolutionBackwardFilter`)
//! - Passes that re-run shape inference and record per-node workspace
//!   sizes for an external allocator

pub mod config;
pub mod ir;
pub mod operator;
pub mod operators;
pub mod pass;
pub mod passes;

use thiserror::Error;

// Public exports
pub use config::OperatorNodeConfig;
pub use ir::{
    ComputingGraph, NodeProps, OprId, OprNode, StorageRelation, VarFlags, VarId, VarNode,
    VarSource,
};
pub use operator::{Operator, OutputSpec};
pub use pass::{GraphPipeline, Pass, Stage};

/// Result type using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Graph construction and execution errors.
///
/// Construction-time errors are raised before any device work is
/// scheduled. None of them is retryable.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    #[error("DType mismatch: {0}")]
    DTypeMismatch(String),

    #[error("Layout error: {0}")]
    Layout(String),

    /// A forced storage alias is unsatisfiable or was not honored.
    #[error("Storage alias error: {0}")]
    StorageAlias(String),

    #[error(transparent)]
    Dnn(#[from] tessera_dnn::Error),

    #[error(transparent)]
    Core(#[from] tessera_core::Error),
}

//! Shared helpers for the graph integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use tessera_core::{DType, DevicePtr, TensorLayout, TensorND};
use tessera_dnn::Handle;
use tessera_dnn::testing::ScriptedLibrary;
use tessera_dnn::vendor::LibraryVersion;
use tessera_graph::ComputingGraph;

pub const VERSION: LibraryVersion = LibraryVersion::new(7, 6, 5);

/// Install a test-friendly subscriber once per binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_target(false)
        .with_test_writer()
        .try_init();
}

pub fn scripted() -> Arc<ScriptedLibrary> {
    Arc::new(ScriptedLibrary::new(VERSION))
}

/// An empty graph on a handle backed by `lib`.
pub fn graph(lib: &Arc<ScriptedLibrary>) -> ComputingGraph {
    ComputingGraph::new(Arc::new(Handle::new(lib.clone(), lib.clone())))
}

/// A contiguous buffer of `dims` at a fake device address.
pub fn tensor(addr: u64, dims: &[usize], dtype: DType) -> TensorND {
    let layout = TensorLayout::from_dims(dims, dtype).expect("valid test layout");
    TensorND::new(DevicePtr(addr), layout)
}

pub fn f32_tensor(addr: u64, dims: &[usize]) -> TensorND {
    tensor(addr, dims, DType::Float32)
}

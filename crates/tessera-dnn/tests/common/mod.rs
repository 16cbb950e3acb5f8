//! Shared helpers for the dispatch integration tests.
//!
//! Every test runs against `ScriptedLibrary`, which answers workspace
//! queries from the bound descriptor shapes and records each execution
//! call instead of touching a device.

#![allow(dead_code)]

use std::sync::Arc;

use rand::Rng;
use rand::rngs::StdRng;
use tessera_core::param::{ConvolutionParam, Sparse};
use tessera_core::{DType, DevicePtr, TensorLayout, TensorND};
use tessera_dnn::Handle;
use tessera_dnn::convolution::helper::conv_output_extent;
use tessera_dnn::testing::ScriptedLibrary;
use tessera_dnn::vendor::LibraryVersion;

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

pub fn handle(lib: &Arc<ScriptedLibrary>) -> Handle {
    Handle::new(lib.clone(), lib.clone())
}

pub fn layout(dims: &[usize], dtype: DType) -> TensorLayout {
    TensorLayout::from_dims(dims, dtype).expect("valid test layout")
}

pub fn f32_layout(dims: &[usize]) -> TensorLayout {
    layout(dims, DType::Float32)
}

/// Bind `layout` to a fake device address.
pub fn tensor(addr: u64, layout: TensorLayout) -> TensorND {
    TensorND::new(DevicePtr(addr), layout)
}

/// One backward-filter problem: parameters plus the src, diff and
/// filter-gradient layouts.
#[derive(Debug, Clone)]
pub struct ConvCase {
    pub param: ConvolutionParam,
    pub src: TensorLayout,
    pub diff: TensorLayout,
    pub grad: TensorLayout,
}

impl ConvCase {
    /// Dense NCHW cross-correlation with square filter `f`.
    pub fn dense(n: usize, ic: usize, hw: usize, oc: usize, f: usize, pad: usize, stride: usize) -> Self {
        let param = ConvolutionParam::default()
            .with_padding(pad, pad)
            .with_stride(stride, stride);
        let o = conv_output_extent(hw, f, pad, stride, 1).expect("filter fits");
        Self {
            param,
            src: f32_layout(&[n, ic, hw, hw]),
            diff: f32_layout(&[n, oc, o, o]),
            grad: f32_layout(&[oc, ic, f, f]),
        }
    }

    /// Channel-wise (one input channel per group) convolution.
    pub fn chanwise(n: usize, c: usize, hw: usize, ocpg: usize, f: usize, pad: usize) -> Self {
        let param = ConvolutionParam::default()
            .with_padding(pad, pad)
            .with_sparse(Sparse::Group);
        let o = conv_output_extent(hw, f, pad, 1, 1).expect("filter fits");
        Self {
            param,
            src: f32_layout(&[n, c, hw, hw]),
            diff: f32_layout(&[n, c * ocpg, o, o]),
            grad: f32_layout(&[c, ocpg, 1, f, f]),
        }
    }

    /// A random small problem, dense or channel-wise.
    pub fn random(rng: &mut StdRng) -> Self {
        let n = rng.random_range(1..=3);
        let hw = rng.random_range(3..=12);
        let f = if rng.random_bool(0.5) { 3 } else { 1 };
        let pad = rng.random_range(0..=1);
        if rng.random_bool(0.25) {
            let c = rng.random_range(1..=6);
            let ocpg = rng.random_range(1..=2);
            Self::chanwise(n, c, hw, ocpg, f, pad)
        } else {
            let ic = rng.random_range(1..=8);
            let oc = rng.random_range(1..=8);
            let stride = rng.random_range(1..=2);
            Self::dense(n, ic, hw, oc, f, pad, stride)
        }
    }

    /// Bytes of src, diff and filter gradient together.
    pub fn tensor_bytes(&self) -> usize {
        self.src.span_in_bytes() + self.diff.span_in_bytes() + self.grad.span_in_bytes()
    }
}

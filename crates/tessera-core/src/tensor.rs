//! Device buffer handles.
//!
//! Nothing here owns device memory. Buffers are allocated and reclaimed by
//! an external allocator; these types only name an address and describe
//! what lives there for the duration of one call.

use crate::layout::TensorLayout;
use std::fmt;

/// An opaque device address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct DevicePtr(pub u64);

impl DevicePtr {
    pub const NULL: DevicePtr = DevicePtr(0);

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Address `bytes` past this one.
    pub fn offset(&self, bytes: usize) -> DevicePtr {
        DevicePtr(self.0 + bytes as u64)
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A device buffer together with the layout of the tensor it holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorND {
    pub ptr: DevicePtr,
    pub layout: TensorLayout,
}

impl TensorND {
    pub fn new(ptr: DevicePtr, layout: TensorLayout) -> Self {
        Self { ptr, layout }
    }
}

/// Scratch device memory borrowed for exactly one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Workspace {
    pub ptr: DevicePtr,
    pub size: usize,
}

impl Workspace {
    pub fn new(ptr: DevicePtr, size: usize) -> Self {
        Self { ptr, size }
    }

    /// A zero-sized workspace.
    pub fn empty() -> Self {
        Self::default()
    }
}

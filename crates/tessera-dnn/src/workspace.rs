//! Carving one borrowed workspace into aligned sub-buffers.

use tessera_core::{DevicePtr, Workspace};

/// Default alignment of every sub-buffer, in bytes.
pub const WORKSPACE_ALIGNMENT: usize = 512;

/// A list of scratch buffers laid out back to back in one workspace.
///
/// Each buffer starts on an `align`-byte boundary relative to the base
/// pointer. The same bundle is used twice: with a null base to compute the
/// total size a strategy asks for, then with the borrowed workspace to find
/// each buffer's address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceBundle {
    ptr: DevicePtr,
    sizes: Vec<usize>,
    offsets: Vec<usize>,
    total: usize,
}

impl WorkspaceBundle {
    pub fn new(ptr: DevicePtr, sizes: Vec<usize>) -> Self {
        Self::with_alignment(ptr, sizes, WORKSPACE_ALIGNMENT)
    }

    pub fn with_alignment(ptr: DevicePtr, sizes: Vec<usize>, align: usize) -> Self {
        let align = align.max(1);
        let mut offsets = Vec::with_capacity(sizes.len());
        let mut total = 0usize;
        for &size in &sizes {
            offsets.push(total);
            total += size.div_ceil(align) * align;
        }
        Self {
            ptr,
            sizes,
            offsets,
            total,
        }
    }

    /// Sum of all sub-buffer sizes, each rounded up to the alignment.
    pub fn total_size_in_bytes(&self) -> usize {
        self.total
    }

    pub fn nr_workspace(&self) -> usize {
        self.sizes.len()
    }

    /// Address of sub-buffer `idx`.
    ///
    /// # Panics
    ///
    /// Panics if `idx >= nr_workspace()`.
    pub fn get(&self, idx: usize) -> DevicePtr {
        self.ptr.offset(self.offsets[idx])
    }

    /// Sub-buffer `idx` as a workspace of its unrounded size.
    pub fn get_workspace(&self, idx: usize) -> Workspace {
        Workspace::new(self.get(idx), self.sizes[idx])
    }

    /// The whole bundle as one workspace.
    pub fn as_workspace(&self) -> Workspace {
        Workspace::new(self.ptr, self.total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offsets_are_aligned() {
        let bundle = WorkspaceBundle::new(DevicePtr(0x1000), vec![100, 1024, 1]);
        assert_eq!(bundle.get(0), DevicePtr(0x1000));
        assert_eq!(bundle.get(1), DevicePtr(0x1000 + 512));
        assert_eq!(bundle.get(2), DevicePtr(0x1000 + 512 + 1024));
        assert_eq!(bundle.total_size_in_bytes(), 512 + 1024 + 512);
        assert_eq!(bundle.get_workspace(0).size, 100);
    }

    #[test]
    fn test_empty_buffers_take_no_space() {
        let bundle = WorkspaceBundle::new(DevicePtr::NULL, vec![0, 0]);
        assert_eq!(bundle.total_size_in_bytes(), 0);
        assert_eq!(bundle.nr_workspace(), 2);
    }
}

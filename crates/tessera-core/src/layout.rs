//! Shape and stride descriptors.
//!
//! A `TensorLayout` is the shape-only description of a tensor: per-dimension
//! extents and strides plus the element type. Layouts are immutable once
//! built and compare structurally, so they double as cache and inference
//! keys. Neither type ever holds a device buffer.

use crate::dtype::DType;
use crate::{Error, Result};
use std::fmt;

/// Maximum number of dimensions a shape may have.
pub const MAX_NDIM: usize = 7;

/// Tensor extents, at most [`MAX_NDIM`] dimensions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorShape {
    dims: Vec<usize>,
}

impl TensorShape {
    /// Create a shape from its extents.
    ///
    /// Fails if the shape has more than [`MAX_NDIM`] dimensions.
    pub fn new(dims: &[usize]) -> Result<Self> {
        if dims.len() > MAX_NDIM {
            return Err(Error::Shape(format!(
                "shape {dims:?} has {} dimensions, at most {MAX_NDIM} are supported",
                dims.len()
            )));
        }
        Ok(Self {
            dims: dims.to_vec(),
        })
    }

    /// The placeholder shape `{0}` given to outputs that carry no content.
    pub fn empty() -> Self {
        Self { dims: vec![0] }
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    /// Number of elements (1 for a scalar shape).
    pub fn total_nr_elems(&self) -> usize {
        self.dims.iter().product()
    }

    /// True if the shape holds no elements.
    pub fn is_empty(&self) -> bool {
        self.total_nr_elems() == 0
    }

    /// Extent of dimension `axis`.
    ///
    /// # Panics
    ///
    /// Panics if `axis >= ndim()`.
    pub fn dim(&self, axis: usize) -> usize {
        self.dims[axis]
    }
}

impl fmt::Display for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_list(f, &self.dims)
    }
}

/// Shape + strides + dtype of one tensor.
///
/// Strides are measured in elements, as in the vendor APIs this layout is
/// translated to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorLayout {
    shape: TensorShape,
    strides: Vec<isize>,
    dtype: DType,
}

impl TensorLayout {
    /// Create a contiguous (row-major) layout.
    pub fn new(shape: TensorShape, dtype: DType) -> Self {
        let strides = contiguous_strides(shape.dims());
        Self {
            shape,
            strides,
            dtype,
        }
    }

    /// Convenience constructor from raw extents.
    pub fn from_dims(dims: &[usize], dtype: DType) -> Result<Self> {
        Ok(Self::new(TensorShape::new(dims)?, dtype))
    }

    /// Create a layout with explicit strides.
    pub fn with_strides(shape: TensorShape, strides: &[isize], dtype: DType) -> Result<Self> {
        if strides.len() != shape.ndim() {
            return Err(Error::Layout(format!(
                "shape {shape} has {} dimensions but {} strides were given",
                shape.ndim(),
                strides.len()
            )));
        }
        Ok(Self {
            shape,
            strides: strides.to_vec(),
            dtype,
        })
    }

    pub fn shape(&self) -> &TensorShape {
        &self.shape
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn strides(&self) -> &[isize] {
        &self.strides
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn ndim(&self) -> usize {
        self.shape.ndim()
    }

    pub fn total_nr_elems(&self) -> usize {
        self.shape.total_nr_elems()
    }

    /// Check whether the layout is row-major without gaps.
    ///
    /// Strides of unit-extent dimensions are ignored.
    pub fn is_contiguous(&self) -> bool {
        let mut expected = 1isize;
        for (&dim, &stride) in self.dims().iter().zip(&self.strides).rev() {
            if dim == 1 {
                continue;
            }
            if stride != expected {
                return false;
            }
            expected *= dim as isize;
        }
        true
    }

    /// Number of bytes between the lowest and highest addressed element,
    /// inclusive. Zero for an empty layout.
    pub fn span_in_bytes(&self) -> usize {
        if self.shape.is_empty() {
            return 0;
        }
        let mut low = 0isize;
        let mut high = 0isize;
        for (&dim, &stride) in self.dims().iter().zip(&self.strides) {
            let reach = (dim as isize - 1) * stride;
            if reach < 0 {
                low += reach;
            } else {
                high += reach;
            }
        }
        (high - low + 1) as usize * self.dtype.size_in_bytes()
    }

    /// Same extents, ignoring strides and dtype.
    pub fn eq_shape(&self, other: &TensorLayout) -> bool {
        self.shape == other.shape
    }

    /// Copy of this layout with a different dtype and contiguous strides.
    pub fn contiguous_as(&self, dtype: DType) -> TensorLayout {
        TensorLayout::new(self.shape.clone(), dtype)
    }
}

impl fmt::Display for TensorLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_list(f, self.dims())?;
        f.write_str("(")?;
        for (i, stride) in self.strides.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{stride}")?;
        }
        write!(f, "):{}", self.dtype)
    }
}

fn contiguous_strides(dims: &[usize]) -> Vec<isize> {
    let mut strides = vec![0isize; dims.len()];
    let mut acc = 1isize;
    for (stride, &dim) in strides.iter_mut().zip(dims).rev() {
        *stride = acc;
        acc *= dim.max(1) as isize;
    }
    strides
}

fn write_list(f: &mut fmt::Formatter<'_>, dims: &[usize]) -> fmt::Result {
    f.write_str("{")?;
    for (i, dim) in dims.iter().enumerate() {
        if i > 0 {
            f.write_str(",")?;
        }
        write!(f, "{dim}")?;
    }
    f.write_str("}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_rejects_too_many_dims() {
        assert!(TensorShape::new(&[1; MAX_NDIM]).is_ok());
        let err = TensorShape::new(&[1; MAX_NDIM + 1]).unwrap_err();
        assert!(matches!(err, Error::Shape(_)));
    }

    #[test]
    fn test_empty_placeholder() {
        let shape = TensorShape::empty();
        assert_eq!(shape.dims(), &[0]);
        assert!(shape.is_empty());
        assert_eq!(TensorLayout::new(shape, DType::Float32).span_in_bytes(), 0);
    }

    #[test]
    fn test_contiguous_layout() {
        let layout = TensorLayout::from_dims(&[2, 3, 8, 8], DType::Float32).unwrap();
        assert_eq!(layout.strides(), &[192, 64, 8, 1]);
        assert!(layout.is_contiguous());
        assert_eq!(layout.span_in_bytes(), 2 * 3 * 8 * 8 * 4);
        assert_eq!(layout.to_string(), "{2,3,8,8}(192,64,8,1):Float32");
    }

    #[test]
    fn test_strided_layout() {
        let shape = TensorShape::new(&[4, 4]).unwrap();
        let transposed = TensorLayout::with_strides(shape.clone(), &[1, 4], DType::Float16).unwrap();
        assert!(!transposed.is_contiguous());
        assert_eq!(transposed.span_in_bytes(), 16 * 2);

        let padded = TensorLayout::with_strides(shape.clone(), &[8, 1], DType::Float32).unwrap();
        assert!(!padded.is_contiguous());
        assert_eq!(padded.span_in_bytes(), (3 * 8 + 3 + 1) * 4);

        assert!(TensorLayout::with_strides(shape, &[1], DType::Float32).is_err());
    }

    #[test]
    fn test_unit_dims_ignore_stride() {
        let shape = TensorShape::new(&[1, 3, 1, 1]).unwrap();
        let layout = TensorLayout::with_strides(shape, &[99, 1, 7, 5], DType::Float32).unwrap();
        assert!(layout.is_contiguous());
    }

    #[test]
    fn test_structural_equality() {
        let a = TensorLayout::from_dims(&[1, 3, 1, 1], DType::Float32).unwrap();
        let b = TensorLayout::from_dims(&[1, 3, 1, 1], DType::Float32).unwrap();
        let c = TensorLayout::from_dims(&[1, 3, 1, 1], DType::Float16).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.eq_shape(&c));
    }
}

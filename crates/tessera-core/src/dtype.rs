//! Element types.

use std::fmt;

/// Broad family of an element type.
///
/// Operators that mix precisions (e.g. float16 activations with float32
/// statistics) only require their operands to agree on the category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DTypeCategory {
    Float,
    Int,
    Bool,
}

/// Tensor element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    Float32,
    Float16,
    BFloat16,
    Int32,
    Int16,
    Int8,
    Uint8,
    Bool,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::Float32 | DType::Int32 => 4,
            DType::Float16 | DType::BFloat16 | DType::Int16 => 2,
            DType::Int8 | DType::Uint8 | DType::Bool => 1,
        }
    }

    pub fn category(&self) -> DTypeCategory {
        match self {
            DType::Float32 | DType::Float16 | DType::BFloat16 => DTypeCategory::Float,
            DType::Int32 | DType::Int16 | DType::Int8 | DType::Uint8 => DTypeCategory::Int,
            DType::Bool => DTypeCategory::Bool,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DType::Float32 => "Float32",
            DType::Float16 => "Float16",
            DType::BFloat16 => "BFloat16",
            DType::Int32 => "Int32",
            DType::Int16 => "Int16",
            DType::Int8 => "Int8",
            DType::Uint8 => "Uint8",
            DType::Bool => "Bool",
        }
    }

    /// Check if this is a floating point type.
    pub fn is_float(&self) -> bool {
        self.category() == DTypeCategory::Float
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_sizes() {
        assert_eq!(DType::Float32.size_in_bytes(), 4);
        assert_eq!(DType::Float16.size_in_bytes(), 2);
        assert_eq!(DType::Int8.size_in_bytes(), 1);
    }

    #[test]
    fn test_dtype_category() {
        assert_eq!(DType::Float16.category(), DType::Float32.category());
        assert_ne!(DType::Int32.category(), DType::Float32.category());
        assert!(DType::BFloat16.is_float());
        assert!(!DType::Bool.is_float());
    }
}

//! Batch normalization forward and backward.
//!
//! Both passes are served by the vendor library's normalization modes. A
//! strategy is one mode; which modes can serve a call depends on the shape
//! of the statistics tensor (`param_dim`) and on what the vendor reports
//! for the concrete shapes.

mod backward;
mod forward;

use tessera_core::param::{BnParamDim, Format};
use tessera_core::{DType, DTypeCategory, TensorLayout};

use crate::descriptor::{BnParamDesc, TensorDesc};
use crate::handle::Handle;
use crate::registry::AlgorithmRegistry;
use crate::vendor::{BnMode, LibraryVersion};
use crate::{Error, Result};

pub use backward::{BatchNormBackward, BnBackwardOp, BnBackwardTensors};
pub use forward::{BatchNormForward, BnForwardOp, BnForwardTensors};

/// One vendor normalization mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BnStrategy {
    mode: BnMode,
    reproducible: bool,
    name: String,
}

impl BnStrategy {
    pub fn new(mode: BnMode, reproducible: bool, version: LibraryVersion) -> Self {
        Self {
            mode,
            reproducible,
            name: format!("{}{}", mode.enum_name(), version),
        }
    }

    pub fn mode(&self) -> BnMode {
        self.mode
    }

    /// Whether this mode computes statistics of the shape `param_dim` asks for.
    pub fn serves(&self, param_dim: BnParamDim) -> bool {
        match self.mode {
            BnMode::Spatial | BnMode::SpatialPersistent => param_dim == BnParamDim::Dim1C11,
            BnMode::PerActivation => param_dim == BnParamDim::Dim1CHW,
        }
    }
}

/// Modes known for `version`, in vendor enumeration order.
///
/// The persistent spatial mode reduces in a scheduling-dependent order and
/// is non-reproducible.
pub fn strategies(version: LibraryVersion) -> Vec<BnStrategy> {
    let mut strategies = vec![
        BnStrategy::new(BnMode::Spatial, true, version),
        BnStrategy::new(BnMode::PerActivation, true, version),
    ];
    if version.at_least(7, 0) {
        strategies.push(BnStrategy::new(BnMode::SpatialPersistent, false, version));
    }
    strategies
}

pub fn build_forward_registry(version: LibraryVersion) -> AlgorithmRegistry<BnForwardOp> {
    let mut registry = AlgorithmRegistry::new();
    for strategy in strategies(version) {
        registry.register(strategy);
    }
    registry
}

pub fn build_backward_registry(version: LibraryVersion) -> AlgorithmRegistry<BnBackwardOp> {
    let mut registry = AlgorithmRegistry::new();
    for strategy in strategies(version) {
        registry.register(strategy);
    }
    registry
}

/// Shape of the statistics tensor for data of extents `x` (NCHW).
pub fn param_shape(x: &TensorLayout, param_dim: BnParamDim) -> Result<[usize; 4]> {
    let [_, c, h, w] = nchw(x)?;
    Ok(match param_dim {
        BnParamDim::Dim1C11 => [1, c, 1, 1],
        BnParamDim::Dim1CHW => [1, c, h, w],
        BnParamDim::Dim11HW => [1, 1, h, w],
    })
}

fn nchw(x: &TensorLayout) -> Result<[usize; 4]> {
    match x.dims() {
        &[n, c, h, w] => Ok([n, c, h, w]),
        _ => Err(Error::InvalidArgs(format!(
            "batch normalization needs 4-D data, got {x}"
        ))),
    }
}

/// Check a data layout pair and the statistics layout against each other.
fn check_layouts(
    x: &TensorLayout,
    other: &TensorLayout,
    bn_param: &TensorLayout,
    param_dim: BnParamDim,
) -> Result<()> {
    nchw(x)?;
    if !x.eq_shape(other) || x.dtype() != other.dtype() {
        return Err(Error::InvalidArgs(format!(
            "data layouts differ: {x} vs {other}"
        )));
    }
    if x.dtype().category() != DTypeCategory::Float {
        return Err(Error::InvalidArgs(format!(
            "batch normalization needs float data, got {x}"
        )));
    }
    let expected = param_shape(x, param_dim)?;
    if bn_param.dims() != expected {
        return Err(Error::InvalidArgs(format!(
            "statistics layout {bn_param} does not match {param_dim:?} of {x}, expected {expected:?}"
        )));
    }
    Ok(())
}

/// Data types the vendor normalization entry points accept.
fn vendor_dtypes_supported(x: &TensorLayout, bn_param: &TensorLayout) -> bool {
    matches!(x.dtype(), DType::Float32 | DType::Float16) && bn_param.dtype() == DType::Float32
}

/// Descriptors of one normalization call: data in, data out, statistics.
pub struct BnDescs<'l> {
    pub x: TensorDesc<'l>,
    pub y: TensorDesc<'l>,
    pub param: BnParamDesc<'l>,
}

impl<'l> BnDescs<'l> {
    fn bind(
        handle: &'l Handle,
        x: &TensorLayout,
        y: &TensorLayout,
        mode: BnMode,
    ) -> Result<Self> {
        let library = handle.library();
        let mut descs = Self {
            x: TensorDesc::new(library),
            y: TensorDesc::new(library),
            param: BnParamDesc::new(library),
        };
        descs.x.set(x, Format::Nchw)?;
        descs.y.set(y, Format::Nchw)?;
        descs.param.set(&descs.x, mode)?;
        Ok(descs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategies_by_version() {
        let names: Vec<_> = strategies(LibraryVersion::new(7, 6, 5))
            .into_iter()
            .map(|s| (s.name, s.reproducible))
            .collect();
        assert_eq!(
            names,
            vec![
                ("BATCHNORM_SPATIALv7.6.5".to_string(), true),
                ("BATCHNORM_PER_ACTIVATIONv7.6.5".to_string(), true),
                ("BATCHNORM_SPATIAL_PERSISTENTv7.6.5".to_string(), false),
            ]
        );
        assert_eq!(strategies(LibraryVersion::new(6, 0, 21)).len(), 2);
    }

    #[test]
    fn test_param_shape() {
        let x = TensorLayout::from_dims(&[2, 3, 8, 8], DType::Float32).unwrap();
        assert_eq!(param_shape(&x, BnParamDim::Dim1C11).unwrap(), [1, 3, 1, 1]);
        assert_eq!(param_shape(&x, BnParamDim::Dim1CHW).unwrap(), [1, 3, 8, 8]);
        assert_eq!(param_shape(&x, BnParamDim::Dim11HW).unwrap(), [1, 1, 8, 8]);

        let flat = TensorLayout::from_dims(&[2, 3], DType::Float32).unwrap();
        assert!(param_shape(&flat, BnParamDim::Dim1C11).is_err());
    }

    #[test]
    fn test_mode_serves_param_dim() {
        let v = LibraryVersion::new(7, 6, 5);
        assert!(BnStrategy::new(BnMode::Spatial, true, v).serves(BnParamDim::Dim1C11));
        assert!(!BnStrategy::new(BnMode::Spatial, true, v).serves(BnParamDim::Dim1CHW));
        assert!(BnStrategy::new(BnMode::PerActivation, true, v).serves(BnParamDim::Dim1CHW));
        assert!(!BnStrategy::new(BnMode::SpatialPersistent, false, v).serves(BnParamDim::Dim11HW));
    }
}

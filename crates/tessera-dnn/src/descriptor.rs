//! Scope-owned adapters for vendor descriptors.
//!
//! Each adapter starts out unbound. `set` allocates the vendor descriptor
//! on first use (later calls rebind the same one) and `Drop` releases it,
//! so a descriptor never outlives the argument bundle that created it,
//! whichever way that bundle's scope is left.

use tracing::{trace, warn};

use tessera_core::param::{ComputeMode, ConvolutionParam, Format, LrnParam, PoolingParam};
use tessera_core::{DType, TensorLayout};

use crate::convolution::helper::CanonizedFilterMeta;
use crate::error::check_status;
use crate::vendor::{
    BnMode, ConvDescConfig, DescriptorKind, LrnDescConfig, PoolingDescConfig, RawDescriptor,
    VendorLibrary,
};
use crate::{Error, Result};

struct RawHandle<'l> {
    library: &'l dyn VendorLibrary,
    kind: DescriptorKind,
    raw: Option<RawDescriptor>,
}

impl<'l> RawHandle<'l> {
    fn new(library: &'l dyn VendorLibrary, kind: DescriptorKind) -> Self {
        Self {
            library,
            kind,
            raw: None,
        }
    }

    fn get_or_create(&mut self) -> Result<RawDescriptor> {
        if let Some(raw) = self.raw {
            return Ok(raw);
        }
        let raw = self
            .library
            .create_descriptor(self.kind)
            .map_err(|status| Error::VendorCallFailed {
                call: "create_descriptor",
                status,
                algo: String::new(),
                args: format!("{:?}", self.kind),
            })?;
        trace!(kind = ?self.kind, raw = raw.0, "created descriptor");
        self.raw = Some(raw);
        Ok(raw)
    }

    fn bound(&self) -> Result<RawDescriptor> {
        self.raw
            .ok_or_else(|| Error::InvalidArgs(format!("{:?} descriptor used before set", self.kind)))
    }
}

impl Drop for RawHandle<'_> {
    fn drop(&mut self) {
        if let Some(raw) = self.raw.take() {
            let status = self.library.destroy_descriptor(raw);
            if status.is_success() {
                trace!(kind = ?self.kind, raw = raw.0, "destroyed descriptor");
            } else {
                warn!(kind = ?self.kind, raw = raw.0, %status, "failed to destroy descriptor");
            }
        }
    }
}

fn to_i32(value: usize, what: &str) -> Result<i32> {
    i32::try_from(value)
        .map_err(|_| Error::InvalidArgs(format!("{what} {value} does not fit in i32")))
}

fn stride_to_i32(value: isize) -> Result<i32> {
    i32::try_from(value)
        .map_err(|_| Error::InvalidArgs(format!("stride {value} does not fit in i32")))
}

/// Tensor descriptor for a 4-D or 5-D layout.
pub struct TensorDesc<'l> {
    handle: RawHandle<'l>,
}

impl<'l> TensorDesc<'l> {
    pub fn new(library: &'l dyn VendorLibrary) -> Self {
        Self {
            handle: RawHandle::new(library, DescriptorKind::Tensor),
        }
    }

    /// Bind to `layout`. NHWC layouts are described to the vendor in NCHW
    /// order with permuted strides.
    pub fn set(&mut self, layout: &TensorLayout, format: Format) -> Result<()> {
        let ndim = layout.ndim();
        if !(4..=5).contains(&ndim) {
            return Err(Error::InvalidArgs(format!(
                "tensor descriptors need 4 or 5 dimensions, got {layout}"
            )));
        }
        let mut dims = layout
            .dims()
            .iter()
            .map(|&d| to_i32(d, "extent"))
            .collect::<Result<Vec<_>>>()?;
        let mut strides = layout
            .strides()
            .iter()
            .map(|&s| stride_to_i32(s))
            .collect::<Result<Vec<_>>>()?;
        if format == Format::Nhwc && ndim == 4 {
            dims = vec![dims[0], dims[3], dims[1], dims[2]];
            strides = vec![strides[0], strides[3], strides[1], strides[2]];
        }

        let raw = self.handle.get_or_create()?;
        let status =
            self.handle
                .library
                .set_tensor_descriptor(raw, layout.dtype(), &dims, &strides);
        check_status(status, "set_tensor_descriptor", "", || layout.to_string())
    }

    pub fn raw(&self) -> Option<RawDescriptor> {
        self.handle.raw
    }

    pub fn bound(&self) -> Result<RawDescriptor> {
        self.handle.bound()
    }
}

/// Filter descriptor for a canonized (possibly grouped) filter.
pub struct FilterDesc<'l> {
    handle: RawHandle<'l>,
}

impl<'l> FilterDesc<'l> {
    pub fn new(library: &'l dyn VendorLibrary) -> Self {
        Self {
            handle: RawHandle::new(library, DescriptorKind::Filter),
        }
    }

    pub fn set(&mut self, meta: &CanonizedFilterMeta) -> Result<()> {
        let dims = [
            to_i32(meta.group * meta.ocpg, "output channels")?,
            to_i32(meta.icpg, "input channels")?,
            to_i32(meta.spatial[0], "filter height")?,
            to_i32(meta.spatial[1], "filter width")?,
        ];
        let raw = self.handle.get_or_create()?;
        let status =
            self.handle
                .library
                .set_filter_descriptor(raw, meta.dtype, meta.format, &dims);
        check_status(status, "set_filter_descriptor", "", || format!("{dims:?}"))
    }

    pub fn raw(&self) -> Option<RawDescriptor> {
        self.handle.raw
    }

    pub fn bound(&self) -> Result<RawDescriptor> {
        self.handle.bound()
    }
}

/// Accumulation type the vendor should use for `data_type` inputs.
pub fn conv_compute_dtype(data_type: DType, compute_mode: ComputeMode) -> DType {
    match (data_type, compute_mode) {
        (DType::Float16 | DType::BFloat16, ComputeMode::Default) => data_type,
        (DType::Int8 | DType::Uint8 | DType::Int16 | DType::Int32, _) => DType::Int32,
        _ => DType::Float32,
    }
}

pub struct ConvDesc<'l> {
    handle: RawHandle<'l>,
}

impl<'l> ConvDesc<'l> {
    pub fn new(library: &'l dyn VendorLibrary) -> Self {
        Self {
            handle: RawHandle::new(library, DescriptorKind::Convolution),
        }
    }

    pub fn set(
        &mut self,
        data_type: DType,
        param: &ConvolutionParam,
        nr_group: usize,
    ) -> Result<()> {
        let config = ConvDescConfig {
            pads: [to_i32(param.pad_h, "pad")?, to_i32(param.pad_w, "pad")?],
            strides: [
                to_i32(param.stride_h, "stride")?,
                to_i32(param.stride_w, "stride")?,
            ],
            dilations: [
                to_i32(param.dilate_h, "dilation")?,
                to_i32(param.dilate_w, "dilation")?,
            ],
            mode: param.mode,
            group_count: to_i32(nr_group, "group count")?,
            compute_dtype: conv_compute_dtype(data_type, param.compute_mode),
        };
        let raw = self.handle.get_or_create()?;
        let status = self.handle.library.set_convolution_descriptor(raw, &config);
        check_status(status, "set_convolution_descriptor", "", || {
            param.to_string()
        })
    }

    pub fn raw(&self) -> Option<RawDescriptor> {
        self.handle.raw
    }

    pub fn bound(&self) -> Result<RawDescriptor> {
        self.handle.bound()
    }
}

pub struct PoolingDesc<'l> {
    handle: RawHandle<'l>,
}

impl<'l> PoolingDesc<'l> {
    pub fn new(library: &'l dyn VendorLibrary) -> Self {
        Self {
            handle: RawHandle::new(library, DescriptorKind::Pooling),
        }
    }

    pub fn set(&mut self, param: &PoolingParam) -> Result<()> {
        let config = PoolingDescConfig {
            mode: param.mode,
            window: [
                to_i32(param.window_h, "window")?,
                to_i32(param.window_w, "window")?,
            ],
            pads: [to_i32(param.pad_h, "pad")?, to_i32(param.pad_w, "pad")?],
            strides: [
                to_i32(param.stride_h, "stride")?,
                to_i32(param.stride_w, "stride")?,
            ],
        };
        let raw = self.handle.get_or_create()?;
        let status = self.handle.library.set_pooling_descriptor(raw, &config);
        check_status(status, "set_pooling_descriptor", "", || format!("{param:?}"))
    }

    pub fn raw(&self) -> Option<RawDescriptor> {
        self.handle.raw
    }

    pub fn bound(&self) -> Result<RawDescriptor> {
        self.handle.bound()
    }
}

pub struct LrnDesc<'l> {
    handle: RawHandle<'l>,
}

impl<'l> LrnDesc<'l> {
    pub fn new(library: &'l dyn VendorLibrary) -> Self {
        Self {
            handle: RawHandle::new(library, DescriptorKind::Lrn),
        }
    }

    pub fn set(&mut self, param: &LrnParam) -> Result<()> {
        let config = LrnDescConfig {
            n: param.n,
            alpha: param.alpha,
            beta: param.beta,
            k: param.k,
        };
        let raw = self.handle.get_or_create()?;
        let status = self.handle.library.set_lrn_descriptor(raw, &config);
        check_status(status, "set_lrn_descriptor", "", || format!("{param:?}"))
    }

    pub fn raw(&self) -> Option<RawDescriptor> {
        self.handle.raw
    }

    pub fn bound(&self) -> Result<RawDescriptor> {
        self.handle.bound()
    }
}

/// Descriptor of the batch-norm statistics tensor, derived from the data
/// descriptor and the normalization mode.
pub struct BnParamDesc<'l> {
    handle: RawHandle<'l>,
}

impl<'l> BnParamDesc<'l> {
    pub fn new(library: &'l dyn VendorLibrary) -> Self {
        Self {
            handle: RawHandle::new(library, DescriptorKind::Tensor),
        }
    }

    pub fn set(&mut self, x_desc: &TensorDesc<'_>, mode: BnMode) -> Result<()> {
        let x = x_desc.bound()?;
        let raw = self.handle.get_or_create()?;
        let status = self.handle.library.derive_bn_descriptor(raw, x, mode);
        check_status(status, "derive_bn_descriptor", mode.enum_name(), || {
            format!("{mode:?}")
        })
    }

    pub fn raw(&self) -> Option<RawDescriptor> {
        self.handle.raw
    }

    pub fn bound(&self) -> Result<RawDescriptor> {
        self.handle.bound()
    }
}

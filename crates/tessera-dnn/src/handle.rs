//! Per-device handle.

use std::fmt;
use std::sync::{Arc, OnceLock};

use tracing::debug;

use crate::batch_norm::{self, BnBackwardOp, BnForwardOp};
use crate::convolution::backward_filter::{self, ConvBwdFilterOp};
use crate::deformable_conv::{self, DeformableConvBwdFilterOp};
use crate::kernels::KernelLibrary;
use crate::registry::AlgorithmRegistry;
use crate::vendor::{StreamHandle, VendorLibrary};

/// Device and stream every call through a handle is issued on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ComputingContext {
    pub device: i32,
    pub stream: StreamHandle,
}

/// Owns the library capabilities of one device and the strategy
/// registries built for it.
///
/// Registries are built on first use and immutable afterwards, so a handle
/// can be shared by any number of concurrent dispatch calls.
pub struct Handle {
    library: Arc<dyn VendorLibrary>,
    kernels: Arc<dyn KernelLibrary>,
    context: ComputingContext,
    conv_bwd_filter: OnceLock<AlgorithmRegistry<ConvBwdFilterOp>>,
    deformable_conv_bwd_filter: OnceLock<AlgorithmRegistry<DeformableConvBwdFilterOp>>,
    bn_forward: OnceLock<AlgorithmRegistry<BnForwardOp>>,
    bn_backward: OnceLock<AlgorithmRegistry<BnBackwardOp>>,
}

impl Handle {
    pub fn new(library: Arc<dyn VendorLibrary>, kernels: Arc<dyn KernelLibrary>) -> Self {
        Self::with_context(library, kernels, ComputingContext::default())
    }

    pub fn with_context(
        library: Arc<dyn VendorLibrary>,
        kernels: Arc<dyn KernelLibrary>,
        context: ComputingContext,
    ) -> Self {
        Self {
            library,
            kernels,
            context,
            conv_bwd_filter: OnceLock::new(),
            deformable_conv_bwd_filter: OnceLock::new(),
            bn_forward: OnceLock::new(),
            bn_backward: OnceLock::new(),
        }
    }

    pub fn library(&self) -> &dyn VendorLibrary {
        self.library.as_ref()
    }

    pub fn kernels(&self) -> &dyn KernelLibrary {
        self.kernels.as_ref()
    }

    pub fn context(&self) -> &ComputingContext {
        &self.context
    }

    pub fn stream(&self) -> StreamHandle {
        self.context.stream
    }

    pub fn conv_bwd_filter_algos(&self) -> &AlgorithmRegistry<ConvBwdFilterOp> {
        self.conv_bwd_filter.get_or_init(|| {
            let registry = backward_filter::build_registry(self.library.version());
            self.log_built("conv_bwd_filter", registry.len());
            registry
        })
    }

    pub fn deformable_conv_bwd_filter_algos(&self) -> &AlgorithmRegistry<DeformableConvBwdFilterOp> {
        self.deformable_conv_bwd_filter.get_or_init(|| {
            let registry = deformable_conv::build_registry();
            self.log_built("deformable_conv_bwd_filter", registry.len());
            registry
        })
    }

    pub fn bn_forward_algos(&self) -> &AlgorithmRegistry<BnForwardOp> {
        self.bn_forward.get_or_init(|| {
            let registry = batch_norm::build_forward_registry(self.library.version());
            self.log_built("bn_forward", registry.len());
            registry
        })
    }

    pub fn bn_backward_algos(&self) -> &AlgorithmRegistry<BnBackwardOp> {
        self.bn_backward.get_or_init(|| {
            let registry = batch_norm::build_backward_registry(self.library.version());
            self.log_built("bn_backward", registry.len());
            registry
        })
    }

    fn log_built(&self, op: &str, count: usize) {
        debug!(
            op,
            count,
            version = %self.library.version(),
            device = self.context.device,
            "built algorithm registry"
        );
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("version", &self.library.version())
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

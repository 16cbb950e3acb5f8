//! Convolution backward-filter: the filter gradient from `src` and the
//! output gradient `diff`.

mod chanwise;
mod matmul;
mod vendor_algo;

use std::fmt;
use std::ops::Deref;

use tracing::instrument;

use tessera_core::param::ConvolutionParam;
use tessera_core::{TensorLayout, TensorND, Workspace};

use crate::algo::{Algorithm, Operation};
use crate::convolution::helper::{
    CanonizedFilterMeta, check_layout_fwd, conv_geometry, is_vendor_supported,
};
use crate::descriptor::{ConvDesc, FilterDesc, TensorDesc};
use crate::handle::Handle;
use crate::kernels::ConvGeometry;
use crate::policy::{ExecutionPolicy, exec_checked, select_algorithm};
use crate::registry::AlgorithmRegistry;
use crate::vendor::LibraryVersion;
use crate::{Error, Result};

pub use chanwise::AlgoChanwise;
pub use matmul::AlgoMatmul;
pub use vendor_algo::{AlgoVendor, vendor_algos};

/// Marker for the convolution backward-filter operation kind.
pub struct ConvBwdFilterOp;

impl Operation for ConvBwdFilterOp {
    const NAME: &'static str = "conv_bwd_filter";
    type SizeArgs<'a> = SizeArgs<'a>;
    type ExecArgs<'a> = ExecArgs<'a>;

    fn size_args<'s, 'a: 's>(args: &'s ExecArgs<'a>) -> &'s SizeArgs<'a> {
        &args.size
    }

    fn workspace(args: &ExecArgs<'_>) -> Workspace {
        args.workspace
    }
}

/// Shape-only arguments of one backward-filter call.
#[derive(Clone)]
pub struct SizeArgs<'a> {
    pub handle: &'a Handle,
    pub param: ConvolutionParam,
    pub src_layout: &'a TensorLayout,
    pub diff_layout: &'a TensorLayout,
    pub grad_layout: &'a TensorLayout,
    pub grad_filter_meta: CanonizedFilterMeta,
}

impl<'a> SizeArgs<'a> {
    /// Canonize the filter and check the three layouts agree.
    pub fn new(
        handle: &'a Handle,
        param: &ConvolutionParam,
        src: &'a TensorLayout,
        diff: &'a TensorLayout,
        grad: &'a TensorLayout,
    ) -> Result<Self> {
        let grad_filter_meta = CanonizedFilterMeta::new(src.ndim(), grad, param)?;
        if grad.dtype() != src.dtype() {
            return Err(Error::InvalidArgs(format!(
                "filter gradient {grad} does not match src dtype {}",
                src.dtype()
            )));
        }
        check_layout_fwd(src, &grad_filter_meta, diff)?;
        Ok(Self {
            handle,
            param: *param,
            src_layout: src,
            diff_layout: diff,
            grad_layout: grad,
            grad_filter_meta,
        })
    }

    pub fn geometry(&self) -> ConvGeometry {
        conv_geometry(self.src_layout, self.diff_layout, &self.grad_filter_meta)
    }

    pub fn is_vendor_supported(&self) -> bool {
        is_vendor_supported(
            self.src_layout,
            self.diff_layout,
            self.grad_layout,
            &self.grad_filter_meta,
        )
    }

    /// Create and bind the vendor descriptors for these layouts.
    ///
    /// The descriptors are released when the returned value is dropped.
    pub fn init_desc(&self) -> Result<VendorDescs<'a>> {
        let library = self.handle.library();
        let format = self.grad_filter_meta.format;
        let mut descs = VendorDescs {
            src: TensorDesc::new(library),
            diff: TensorDesc::new(library),
            conv: ConvDesc::new(library),
            grad: FilterDesc::new(library),
        };
        descs.src.set(self.src_layout, format)?;
        descs.diff.set(self.diff_layout, format)?;
        descs.grad.set(&self.grad_filter_meta)?;
        descs
            .conv
            .set(self.src_layout.dtype(), &self.param, self.grad_filter_meta.group)?;
        Ok(descs)
    }
}

impl fmt::Display for SizeArgs<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "src={} diff={} grad={} {}",
            self.src_layout, self.diff_layout, self.grad_layout, self.param
        )
    }
}

/// Vendor descriptors for one backward-filter call.
pub struct VendorDescs<'l> {
    pub src: TensorDesc<'l>,
    pub diff: TensorDesc<'l>,
    pub conv: ConvDesc<'l>,
    pub grad: FilterDesc<'l>,
}

/// Buffer-bound arguments of one backward-filter call.
pub struct ExecArgs<'a> {
    pub size: SizeArgs<'a>,
    pub src: &'a TensorND,
    pub diff: &'a TensorND,
    pub grad: &'a TensorND,
    pub workspace: Workspace,
}

impl<'a> ExecArgs<'a> {
    pub fn new(
        handle: &'a Handle,
        param: &ConvolutionParam,
        src: &'a TensorND,
        diff: &'a TensorND,
        grad: &'a TensorND,
        workspace: Workspace,
    ) -> Result<Self> {
        Ok(Self {
            size: SizeArgs::new(handle, param, &src.layout, &diff.layout, &grad.layout)?,
            src,
            diff,
            grad,
            workspace,
        })
    }
}

impl<'a> Deref for ExecArgs<'a> {
    type Target = SizeArgs<'a>;

    fn deref(&self) -> &SizeArgs<'a> {
        &self.size
    }
}

/// Built-ins first, then the vendor strategies of `version`.
pub fn build_registry(version: LibraryVersion) -> AlgorithmRegistry<ConvBwdFilterOp> {
    let mut registry = AlgorithmRegistry::new();
    registry.register(AlgoChanwise).register(AlgoMatmul);
    for algo in vendor_algos(version) {
        registry.register(algo);
    }
    registry
}

/// Filter-gradient operator bound to one device handle.
pub struct ConvolutionBackwardFilter<'h> {
    handle: &'h Handle,
    param: ConvolutionParam,
    policy: ExecutionPolicy,
}

impl<'h> ConvolutionBackwardFilter<'h> {
    pub fn new(handle: &'h Handle, param: ConvolutionParam) -> Self {
        Self {
            handle,
            param,
            policy: ExecutionPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: ExecutionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn param(&self) -> &ConvolutionParam {
        &self.param
    }

    pub fn policy(&self) -> &ExecutionPolicy {
        &self.policy
    }

    /// Strategy for these layouts under `workspace_limit`.
    pub fn get_algorithm(
        &self,
        src: &TensorLayout,
        diff: &TensorLayout,
        grad: &TensorLayout,
        workspace_limit: usize,
    ) -> Result<&'h dyn Algorithm<ConvBwdFilterOp>> {
        let args = SizeArgs::new(self.handle, &self.param, src, diff, grad)?;
        let policy = self.policy.with_workspace_limit(workspace_limit);
        select_algorithm(self.handle.conv_bwd_filter_algos(), &args, &policy)
    }

    /// Workspace the strategy chosen under the policy limit needs.
    pub fn get_workspace_in_bytes(
        &self,
        src: &TensorLayout,
        diff: &TensorLayout,
        grad: &TensorLayout,
    ) -> Result<usize> {
        let args = SizeArgs::new(self.handle, &self.param, src, diff, grad)?;
        let algo = select_algorithm(self.handle.conv_bwd_filter_algos(), &args, &self.policy)?;
        algo.get_workspace_in_bytes(&args)
    }

    /// Select under the policy limit capped to the size of `workspace`,
    /// then run.
    #[instrument(skip_all, fields(src = %src.layout, diff = %diff.layout))]
    pub fn exec(
        &self,
        src: &TensorND,
        diff: &TensorND,
        grad: &TensorND,
        workspace: Workspace,
    ) -> Result<()> {
        let args = ExecArgs::new(self.handle, &self.param, src, diff, grad, workspace)?;
        let policy = self.policy.capped_to(workspace.size);
        let algo = select_algorithm(self.handle.conv_bwd_filter_algos(), &args.size, &policy)?;
        exec_checked(algo, &args)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tessera_core::{DType, DevicePtr};

    use super::*;
    use crate::testing::{Call, ScriptedLibrary};
    use crate::vendor::ConvBwdFilterAlgo;

    fn handle(lib: &Arc<ScriptedLibrary>) -> Handle {
        Handle::new(lib.clone(), lib.clone())
    }

    fn layouts() -> (TensorLayout, TensorLayout, TensorLayout) {
        (
            TensorLayout::from_dims(&[2, 8, 10, 10], DType::Float32).unwrap(),
            TensorLayout::from_dims(&[2, 16, 10, 10], DType::Float32).unwrap(),
            TensorLayout::from_dims(&[16, 8, 3, 3], DType::Float32).unwrap(),
        )
    }

    #[test]
    fn test_registry_order() {
        let registry = build_registry(LibraryVersion::new(7, 6, 5));
        let names: Vec<_> = registry.names().collect();
        assert_eq!(
            names,
            vec![
                "CHANNEL_WISE",
                "MATMUL",
                "CONVOLUTION_BWD_FILTER_ALGO_0v7.6.5",
                "CONVOLUTION_BWD_FILTER_ALGO_1v7.6.5",
                "CONVOLUTION_BWD_FILTER_ALGO_FFTv7.6.5",
                "CONVOLUTION_BWD_FILTER_ALGO_3v7.6.5",
                "CONVOLUTION_BWD_FILTER_ALGO_WINOGRAD_NONFUSEDv7.6.5",
                "CONVOLUTION_BWD_FILTER_ALGO_FFT_TILINGv7.6.5",
            ]
        );

        let old = build_registry(LibraryVersion::new(5, 0, 5));
        assert_eq!(old.len(), 6);
        assert!(old.get("CONVOLUTION_BWD_FILTER_ALGO_WINOGRAD_NONFUSEDv5.0.5").is_none());
    }

    #[test]
    fn test_size_args_reject_mismatched_layouts() {
        let lib = Arc::new(ScriptedLibrary::new(LibraryVersion::new(7, 6, 5)));
        let handle = handle(&lib);
        let (src, _, grad) = layouts();
        let diff = TensorLayout::from_dims(&[2, 16, 8, 8], DType::Float32).unwrap();
        let param = ConvolutionParam::default().with_padding(1, 1);
        assert!(SizeArgs::new(&handle, &param, &src, &diff, &grad).is_err());
    }

    #[test]
    fn test_exec_selects_under_workspace_size() {
        let lib = Arc::new(ScriptedLibrary::new(LibraryVersion::new(7, 6, 5)));
        let handle = handle(&lib);
        let (src, diff, grad) = layouts();
        let opr = ConvolutionBackwardFilter::new(
            &handle,
            ConvolutionParam::default().with_padding(1, 1),
        );

        // MATMUL needs workspace; with none, the first vendor strategy wins.
        let src = TensorND::new(DevicePtr(0x1000), src);
        let diff = TensorND::new(DevicePtr(0x2000), diff);
        let grad = TensorND::new(DevicePtr(0x3000), grad);
        opr.exec(&src, &diff, &grad, Workspace::empty()).unwrap();

        let calls = lib.calls();
        assert_eq!(calls.len(), 1);
        assert!(matches!(
            calls[0],
            Call::ConvBwdFilter {
                algo: ConvBwdFilterAlgo::Algo0,
                ..
            }
        ));
        assert_eq!(lib.live_descriptors(), 0);
    }

    #[test]
    fn test_workspace_matches_selected_algorithm() {
        let lib = Arc::new(ScriptedLibrary::new(LibraryVersion::new(7, 6, 5)));
        let handle = handle(&lib);
        let (src, diff, grad) = layouts();
        let opr = ConvolutionBackwardFilter::new(
            &handle,
            ConvolutionParam::default().with_padding(1, 1),
        );
        let algo = opr.get_algorithm(&src, &diff, &grad, usize::MAX).unwrap();
        assert_eq!(algo.name(), "MATMUL");
        let args = SizeArgs::new(&handle, opr.param(), &src, &diff, &grad).unwrap();
        assert_eq!(
            opr.get_workspace_in_bytes(&src, &diff, &grad).unwrap(),
            algo.get_workspace_in_bytes(&args).unwrap()
        );
    }

    #[test]
    fn test_exec_args_expose_size_view() {
        let lib = Arc::new(ScriptedLibrary::new(LibraryVersion::new(7, 6, 5)));
        let handle = handle(&lib);
        let (src, diff, grad) = layouts();
        let param = ConvolutionParam::default().with_padding(1, 1);
        let (src, diff, grad) = (
            TensorND::new(DevicePtr(0x1000), src),
            TensorND::new(DevicePtr(0x2000), diff),
            TensorND::new(DevicePtr(0x3000), grad),
        );
        let workspace = Workspace::new(DevicePtr(0x8000), 64);
        let args = ExecArgs::new(&handle, &param, &src, &diff, &grad, workspace).unwrap();

        let size = ConvBwdFilterOp::size_args(&args);
        assert_eq!(size.to_string(), args.size.to_string());
        assert_eq!(ConvBwdFilterOp::workspace(&args), workspace);
    }

    #[test]
    fn test_exec_keeps_configured_limit() {
        let lib = Arc::new(ScriptedLibrary::new(LibraryVersion::new(7, 6, 5)));
        let handle = handle(&lib);
        let (src, diff, grad) = layouts();
        let opr = ConvolutionBackwardFilter::new(
            &handle,
            ConvolutionParam::default().with_padding(1, 1),
        )
        .with_policy(ExecutionPolicy::default().with_workspace_limit(0));

        // A generous buffer does not lift the node's limit back to MATMUL.
        let src = TensorND::new(DevicePtr(0x1000), src);
        let diff = TensorND::new(DevicePtr(0x2000), diff);
        let grad = TensorND::new(DevicePtr(0x3000), grad);
        let workspace = Workspace::new(DevicePtr(0x10000), 1 << 20);
        opr.exec(&src, &diff, &grad, workspace).unwrap();

        let calls = lib.calls();
        assert_eq!(calls.len(), 1);
        assert!(matches!(
            calls[0],
            Call::ConvBwdFilter {
                algo: ConvBwdFilterAlgo::Algo0,
                ..
            }
        ));
    }
}

use tracing::trace;

use crate::{Error, Result};
use crate::algo::Algorithm;
use crate::error::check_status;
use crate::vendor::{ConvBwdFilterAlgo, ConvBwdFilterCall, LibraryVersion, Scaling};

use super::{ConvBwdFilterOp, ExecArgs, SizeArgs, VendorDescs};

/// A named strategy of the vendor library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlgoVendor {
    algo: ConvBwdFilterAlgo,
    reproducible: bool,
    name: String,
}

impl AlgoVendor {
    pub fn new(algo: ConvBwdFilterAlgo, reproducible: bool, version: LibraryVersion) -> Self {
        Self {
            algo,
            reproducible,
            name: format!("{}{}", algo.enum_name(), version),
        }
    }

    pub fn vendor_algo(&self) -> ConvBwdFilterAlgo {
        self.algo
    }

    fn query_workspace(&self, args: &SizeArgs<'_>, descs: &VendorDescs<'_>) -> Result<usize> {
        args.handle
            .library()
            .conv_bwd_filter_workspace_size(
                descs.src.bound()?,
                descs.diff.bound()?,
                descs.conv.bound()?,
                descs.grad.bound()?,
                self.algo,
            )
            .map_err(|status| Error::VendorCallFailed {
                call: "conv_bwd_filter_workspace_size",
                status,
                algo: self.name.clone(),
                args: args.to_string(),
            })
    }
}

/// Vendor strategies known for `version`, in vendor enumeration order.
///
/// Strategies whose reduction order depends on scheduling are marked
/// non-reproducible.
pub fn vendor_algos(version: LibraryVersion) -> Vec<AlgoVendor> {
    let mut algos = vec![
        AlgoVendor::new(ConvBwdFilterAlgo::Algo0, false, version),
        AlgoVendor::new(ConvBwdFilterAlgo::Algo1, true, version),
        AlgoVendor::new(ConvBwdFilterAlgo::Fft, true, version),
        AlgoVendor::new(ConvBwdFilterAlgo::Algo3, false, version),
    ];
    if version.at_least(5, 1) {
        algos.push(AlgoVendor::new(
            ConvBwdFilterAlgo::WinogradNonfused,
            true,
            version,
        ));
    }
    if version.at_least(6, 0) {
        algos.push(AlgoVendor::new(ConvBwdFilterAlgo::FftTiling, true, version));
    }
    algos
}

impl Algorithm<ConvBwdFilterOp> for AlgoVendor {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_reproducible(&self) -> bool {
        self.reproducible
    }

    fn is_available(&self, args: &SizeArgs<'_>) -> bool {
        if !args.is_vendor_supported() {
            return false;
        }
        let Ok(descs) = args.init_desc() else {
            return false;
        };
        match self.query_workspace(args, &descs) {
            Ok(_) => true,
            Err(err) => {
                trace!(algo = %self.name, %err, "unavailable");
                false
            }
        }
    }

    fn get_workspace_in_bytes(&self, args: &SizeArgs<'_>) -> Result<usize> {
        let descs = args.init_desc()?;
        self.query_workspace(args, &descs)
    }

    fn exec(&self, args: &ExecArgs<'_>) -> Result<()> {
        let descs = args.init_desc()?;
        let call = ConvBwdFilterCall {
            stream: args.handle.stream(),
            scaling: Scaling::OVERWRITE,
            src_desc: descs.src.bound()?,
            src: args.src.ptr,
            diff_desc: descs.diff.bound()?,
            diff: args.diff.ptr,
            conv_desc: descs.conv.bound()?,
            algo: self.algo,
            workspace: args.workspace,
            grad_desc: descs.grad.bound()?,
            grad: args.grad.ptr,
        };
        let status = args.handle.library().conv_bwd_filter(&call);
        check_status(status, "conv_bwd_filter", &self.name, || {
            args.size.to_string()
        })
    }
}

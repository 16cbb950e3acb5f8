//! An in-process stand-in for the vendor library and the kernels.
//!
//! [`ScriptedLibrary`] does no arithmetic. It keeps descriptor state,
//! answers workspace queries from the bound shapes, records every
//! execution call, and can be scripted to report unsupported strategies,
//! custom workspace sizes and failures. Every workspace it reports stays
//! below `4 * (src + diff + grad)` bytes for convolutions and
//! `4 * param` bytes for batch normalization.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tessera_core::param::Format;
use tessera_core::{DType, DevicePtr, Workspace};

use crate::kernels::{
    ConvGeometry, DeformableGeometry, GemmCall, KernelLibrary, RemapBackwardCall,
    RemapForwardCall,
};
use crate::vendor::{
    BnBackwardCall, BnForwardInferenceCall, BnForwardTrainingCall, BnMode, ConvBwdFilterAlgo,
    ConvBwdFilterCall, ConvDescConfig, DescriptorKind, LibraryVersion, LrnDescConfig,
    PoolingDescConfig, RawDescriptor, Scaling, Status, StreamHandle, VendorLibrary, VendorResult,
};

/// One recorded execution call.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    ConvBwdFilter {
        algo: ConvBwdFilterAlgo,
        workspace: Workspace,
        scaling: Scaling,
    },
    BnForwardTraining {
        mode: BnMode,
        running_stats: bool,
        workspace: Workspace,
    },
    BnForwardInference {
        mode: BnMode,
    },
    BnBackward {
        mode: BnMode,
        workspace: Workspace,
    },
    Im2col,
    DeformableIm2col {
        deformable_group: usize,
    },
    NchwToCnhw {
        n: usize,
        c: usize,
        hw: usize,
    },
    Gemm {
        m: usize,
        n: usize,
        k: usize,
        c: DevicePtr,
    },
    ChanwiseBwdFilter,
    RemapForward {
        src_ndim: usize,
        dst_ndim: usize,
    },
    RemapBackward {
        is_non_overlapping: bool,
    },
}

#[derive(Debug, Clone)]
enum Descriptor {
    Unset(DescriptorKind),
    Tensor {
        dtype: DType,
        dims: Vec<i32>,
        strides: Vec<i32>,
    },
    Filter {
        dtype: DType,
        dims: Vec<i32>,
    },
    Convolution(ConvDescConfig),
    Pooling(PoolingDescConfig),
    Lrn(LrnDescConfig),
}

#[derive(Default)]
struct State {
    next_id: u64,
    descriptors: HashMap<u64, Descriptor>,
    created: usize,
    calls: Vec<Call>,
}

/// Scripted vendor library. See the module docs.
pub struct ScriptedLibrary {
    version: LibraryVersion,
    unsupported_conv: HashSet<ConvBwdFilterAlgo>,
    conv_workspace: HashMap<ConvBwdFilterAlgo, usize>,
    unsupported_bn: HashSet<BnMode>,
    descriptor_failure: Option<Status>,
    exec_failure: Option<Status>,
    state: Mutex<State>,
}

impl ScriptedLibrary {
    pub fn new(version: LibraryVersion) -> Self {
        Self {
            version,
            unsupported_conv: HashSet::new(),
            conv_workspace: HashMap::new(),
            unsupported_bn: HashSet::new(),
            descriptor_failure: None,
            exec_failure: None,
            state: Mutex::new(State {
                next_id: 1,
                ..State::default()
            }),
        }
    }

    /// Report `algo` as unsupported for every shape.
    pub fn with_unsupported_conv_algo(mut self, algo: ConvBwdFilterAlgo) -> Self {
        self.unsupported_conv.insert(algo);
        self
    }

    /// Report a fixed workspace size for `algo`.
    pub fn with_conv_workspace(mut self, algo: ConvBwdFilterAlgo, bytes: usize) -> Self {
        self.conv_workspace.insert(algo, bytes);
        self
    }

    pub fn with_unsupported_bn_mode(mut self, mode: BnMode) -> Self {
        self.unsupported_bn.insert(mode);
        self
    }

    /// Fail every descriptor `set_*` call with `status`.
    pub fn with_descriptor_failure(mut self, status: Status) -> Self {
        self.descriptor_failure = Some(status);
        self
    }

    /// Fail every execution call (vendor and kernel) with `status`.
    pub fn with_exec_failure(mut self, status: Status) -> Self {
        self.exec_failure = Some(status);
        self
    }

    /// Execution calls issued so far, in order.
    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Descriptors created and not yet destroyed.
    pub fn live_descriptors(&self) -> usize {
        self.state().descriptors.len()
    }

    /// Descriptors created over the library's lifetime.
    pub fn created_descriptors(&self) -> usize {
        self.state().created
    }

    /// Extents and strides bound to a live tensor descriptor.
    pub fn tensor_descriptor(&self, desc: RawDescriptor) -> Option<(Vec<i32>, Vec<i32>)> {
        match self.state().descriptors.get(&desc.0) {
            Some(Descriptor::Tensor { dims, strides, .. }) => Some((dims.clone(), strides.clone())),
            _ => None,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, call: Call) -> Status {
        self.state().calls.push(call);
        self.exec_failure.unwrap_or(Status::Success)
    }

    fn bind(&self, desc: RawDescriptor, value: Descriptor) -> Status {
        if let Some(status) = self.descriptor_failure {
            return status;
        }
        match self.state().descriptors.get_mut(&desc.0) {
            Some(slot) => {
                *slot = value;
                Status::Success
            }
            None => Status::BadParam,
        }
    }

    fn tensor(&self, desc: RawDescriptor) -> VendorResult<(DType, Vec<i32>)> {
        match self.state().descriptors.get(&desc.0) {
            Some(Descriptor::Tensor { dtype, dims, .. }) => Ok((*dtype, dims.clone())),
            _ => Err(Status::BadParam),
        }
    }

    fn filter(&self, desc: RawDescriptor) -> VendorResult<Vec<i32>> {
        match self.state().descriptors.get(&desc.0) {
            Some(Descriptor::Filter { dims, .. }) => Ok(dims.clone()),
            _ => Err(Status::BadParam),
        }
    }

    fn convolution(&self, desc: RawDescriptor) -> VendorResult<ConvDescConfig> {
        match self.state().descriptors.get(&desc.0) {
            Some(Descriptor::Convolution(config)) => Ok(*config),
            _ => Err(Status::BadParam),
        }
    }

    fn bn_workspace(
        &self,
        mode: BnMode,
        x_desc: RawDescriptor,
        param_desc: RawDescriptor,
    ) -> VendorResult<usize> {
        if self.unsupported_bn.contains(&mode) {
            return Err(Status::NotSupported);
        }
        self.tensor(x_desc)?;
        let (dtype, dims) = self.tensor(param_desc)?;
        let param_bytes = bytes(dtype, &dims);
        Ok(match mode {
            BnMode::Spatial | BnMode::PerActivation => 0,
            BnMode::SpatialPersistent => 4 * param_bytes,
        })
    }
}

fn bytes(dtype: DType, dims: &[i32]) -> usize {
    dims.iter().map(|&d| d.max(0) as usize).product::<usize>() * dtype.size_in_bytes()
}

impl VendorLibrary for ScriptedLibrary {
    fn version(&self) -> LibraryVersion {
        self.version
    }

    fn create_descriptor(&self, kind: DescriptorKind) -> VendorResult<RawDescriptor> {
        let mut state = self.state();
        let id = state.next_id;
        state.next_id += 1;
        state.created += 1;
        state.descriptors.insert(id, Descriptor::Unset(kind));
        Ok(RawDescriptor(id))
    }

    fn destroy_descriptor(&self, desc: RawDescriptor) -> Status {
        match self.state().descriptors.remove(&desc.0) {
            Some(_) => Status::Success,
            None => Status::BadParam,
        }
    }

    fn set_tensor_descriptor(
        &self,
        desc: RawDescriptor,
        dtype: DType,
        dims: &[i32],
        strides: &[i32],
    ) -> Status {
        if !(4..=5).contains(&dims.len()) || dims.len() != strides.len() || dims.iter().any(|&d| d <= 0)
        {
            return Status::BadParam;
        }
        self.bind(
            desc,
            Descriptor::Tensor {
                dtype,
                dims: dims.to_vec(),
                strides: strides.to_vec(),
            },
        )
    }

    fn set_filter_descriptor(
        &self,
        desc: RawDescriptor,
        dtype: DType,
        _format: Format,
        dims: &[i32],
    ) -> Status {
        if dims.len() != 4 || dims.iter().any(|&d| d <= 0) {
            return Status::BadParam;
        }
        self.bind(
            desc,
            Descriptor::Filter {
                dtype,
                dims: dims.to_vec(),
            },
        )
    }

    fn set_convolution_descriptor(&self, desc: RawDescriptor, config: &ConvDescConfig) -> Status {
        if config.group_count <= 0 || config.strides.iter().any(|&s| s <= 0) {
            return Status::BadParam;
        }
        self.bind(desc, Descriptor::Convolution(*config))
    }

    fn set_pooling_descriptor(&self, desc: RawDescriptor, config: &PoolingDescConfig) -> Status {
        self.bind(desc, Descriptor::Pooling(*config))
    }

    fn set_lrn_descriptor(&self, desc: RawDescriptor, config: &LrnDescConfig) -> Status {
        if config.n == 0 {
            return Status::BadParam;
        }
        self.bind(desc, Descriptor::Lrn(*config))
    }

    fn derive_bn_descriptor(
        &self,
        desc: RawDescriptor,
        x_desc: RawDescriptor,
        mode: BnMode,
    ) -> Status {
        let (dtype, dims) = match self.tensor(x_desc) {
            Ok(x) => x,
            Err(status) => return status,
        };
        if dims.len() != 4 {
            return Status::BadParam;
        }
        let param_dims = match mode {
            BnMode::Spatial | BnMode::SpatialPersistent => vec![1, dims[1], 1, 1],
            BnMode::PerActivation => vec![1, dims[1], dims[2], dims[3]],
        };
        let param_dtype = if dtype == DType::Float16 { DType::Float32 } else { dtype };
        let strides = vec![0; 4];
        self.bind(
            desc,
            Descriptor::Tensor {
                dtype: param_dtype,
                dims: param_dims,
                strides,
            },
        )
    }

    fn conv_bwd_filter_workspace_size(
        &self,
        src_desc: RawDescriptor,
        diff_desc: RawDescriptor,
        conv_desc: RawDescriptor,
        grad_desc: RawDescriptor,
        algo: ConvBwdFilterAlgo,
    ) -> VendorResult<usize> {
        let (dtype, src) = self.tensor(src_desc)?;
        let (_, diff) = self.tensor(diff_desc)?;
        let grad = self.filter(grad_desc)?;
        let conv = self.convolution(conv_desc)?;
        if self.unsupported_conv.contains(&algo) {
            return Err(Status::NotSupported);
        }
        if let Some(&bytes) = self.conv_workspace.get(&algo) {
            return Ok(bytes);
        }

        let (src_b, diff_b, grad_b) = (bytes(dtype, &src), bytes(dtype, &diff), bytes(dtype, &grad));
        let unit = conv.strides == [1, 1] && conv.dilations == [1, 1];
        let dense = conv.group_count == 1;
        match algo {
            ConvBwdFilterAlgo::Algo0 => Ok(0),
            ConvBwdFilterAlgo::Algo1 => Ok(grad_b),
            ConvBwdFilterAlgo::Algo3 => Ok(diff_b),
            ConvBwdFilterAlgo::Fft if unit && dense => Ok(2 * (src_b + diff_b)),
            ConvBwdFilterAlgo::FftTiling if unit && dense => Ok(src_b + diff_b),
            ConvBwdFilterAlgo::WinogradNonfused if unit && dense && grad[2..] == [3, 3] => {
                Ok(4 * grad_b + src_b)
            }
            _ => Err(Status::NotSupported),
        }
    }

    fn conv_bwd_filter(&self, call: &ConvBwdFilterCall) -> Status {
        let required = self.conv_bwd_filter_workspace_size(
            call.src_desc,
            call.diff_desc,
            call.conv_desc,
            call.grad_desc,
            call.algo,
        );
        let status = self.record(Call::ConvBwdFilter {
            algo: call.algo,
            workspace: call.workspace,
            scaling: call.scaling,
        });
        match required {
            Err(status) => status,
            Ok(required) if required > call.workspace.size => Status::BadParam,
            Ok(_) => status,
        }
    }

    fn bn_forward_training_workspace_size(
        &self,
        mode: BnMode,
        x_desc: RawDescriptor,
        param_desc: RawDescriptor,
    ) -> VendorResult<usize> {
        self.bn_workspace(mode, x_desc, param_desc)
    }

    fn bn_forward_training(&self, call: &BnForwardTrainingCall) -> Status {
        let required = self.bn_workspace(call.mode, call.x_desc, call.param_desc);
        let status = self.record(Call::BnForwardTraining {
            mode: call.mode,
            running_stats: call.running_mean.is_some(),
            workspace: call.workspace,
        });
        match required {
            Err(status) => status,
            Ok(required) if required > call.workspace.size => Status::BadParam,
            Ok(_) => status,
        }
    }

    fn bn_forward_inference(&self, call: &BnForwardInferenceCall) -> Status {
        if self.unsupported_bn.contains(&call.mode) {
            return Status::NotSupported;
        }
        self.record(Call::BnForwardInference { mode: call.mode })
    }

    fn bn_backward_workspace_size(
        &self,
        mode: BnMode,
        x_desc: RawDescriptor,
        param_desc: RawDescriptor,
    ) -> VendorResult<usize> {
        self.bn_workspace(mode, x_desc, param_desc)
    }

    fn bn_backward(&self, call: &BnBackwardCall) -> Status {
        let required = self.bn_workspace(call.mode, call.x_desc, call.param_desc);
        let status = self.record(Call::BnBackward {
            mode: call.mode,
            workspace: call.workspace,
        });
        match required {
            Err(status) => status,
            Ok(required) if required > call.workspace.size => Status::BadParam,
            Ok(_) => status,
        }
    }
}

impl KernelLibrary for ScriptedLibrary {
    fn im2col(
        &self,
        _stream: StreamHandle,
        _dtype: DType,
        _src: DevicePtr,
        _col: DevicePtr,
        _geometry: &ConvGeometry,
    ) -> Status {
        self.record(Call::Im2col)
    }

    fn deformable_im2col(
        &self,
        _stream: StreamHandle,
        _dtype: DType,
        _im: DevicePtr,
        _offset: DevicePtr,
        _mask: DevicePtr,
        _col: DevicePtr,
        geometry: &DeformableGeometry,
    ) -> Status {
        self.record(Call::DeformableIm2col {
            deformable_group: geometry.deformable_group,
        })
    }

    fn nchw_to_cnhw(
        &self,
        _stream: StreamHandle,
        _dtype: DType,
        _src: DevicePtr,
        _dst: DevicePtr,
        n: usize,
        c: usize,
        hw: usize,
    ) -> Status {
        self.record(Call::NchwToCnhw { n, c, hw })
    }

    fn gemm(&self, call: &GemmCall) -> Status {
        self.record(Call::Gemm {
            m: call.m,
            n: call.n,
            k: call.k,
            c: call.c,
        })
    }

    fn chanwise_bwd_filter(
        &self,
        _stream: StreamHandle,
        _dtype: DType,
        _src: DevicePtr,
        _diff: DevicePtr,
        _grad: DevicePtr,
        _geometry: &ConvGeometry,
    ) -> Status {
        self.record(Call::ChanwiseBwdFilter)
    }

    fn indexing_remap_forward(&self, call: &RemapForwardCall) -> Status {
        self.record(Call::RemapForward {
            src_ndim: call.src_ndim,
            dst_ndim: call.dst_ndim,
        })
    }

    fn indexing_remap_backward(&self, call: &RemapBackwardCall) -> Status {
        self.record(Call::RemapBackward {
            is_non_overlapping: call.is_non_overlapping,
        })
    }
}

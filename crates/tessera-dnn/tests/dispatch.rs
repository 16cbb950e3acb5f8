//! End-to-end dispatch against the scripted vendor library.

mod common;

use common::{ConvCase, f32_layout, handle, init_tracing, scripted, tensor};
use std::sync::Arc;
use tessera_core::param::{BatchNormParam, BnFwdMode, BnParamDim};
use tessera_core::{DevicePtr, Workspace};
use tessera_dnn::batch_norm::{
    BatchNormBackward, BatchNormForward, BnBackwardTensors, BnForwardTensors,
};
use tessera_dnn::convolution::ConvolutionBackwardFilter;
use tessera_dnn::convolution::backward_filter::{AlgoMatmul, ExecArgs};
use tessera_dnn::policy::exec_checked;
use tessera_dnn::testing::{Call, ScriptedLibrary};
use tessera_dnn::vendor::{BnMode, ConvBwdFilterAlgo, Scaling};
use tessera_dnn::{Error, ExecutionPolicy, Handle, Status};

const ALL_VENDOR_ALGOS: [ConvBwdFilterAlgo; 6] = [
    ConvBwdFilterAlgo::Algo0,
    ConvBwdFilterAlgo::Algo1,
    ConvBwdFilterAlgo::Fft,
    ConvBwdFilterAlgo::Algo3,
    ConvBwdFilterAlgo::WinogradNonfused,
    ConvBwdFilterAlgo::FftTiling,
];

fn without_vendor_conv() -> Arc<ScriptedLibrary> {
    let lib = ALL_VENDOR_ALGOS
        .into_iter()
        .fold(ScriptedLibrary::new(common::VERSION), |lib, algo| {
            lib.with_unsupported_conv_algo(algo)
        });
    Arc::new(lib)
}

#[test]
fn test_vendor_exec_uses_overwrite_scaling() -> anyhow::Result<()> {
    init_tracing();
    let lib = scripted();
    let handle = handle(&lib);
    let case = ConvCase::dense(2, 4, 8, 6, 3, 1, 1);
    let opr = ConvolutionBackwardFilter::new(&handle, case.param);

    let src = tensor(0x1000, case.src.clone());
    let diff = tensor(0x2000, case.diff.clone());
    let grad = tensor(0x3000, case.grad.clone());
    opr.exec(&src, &diff, &grad, Workspace::empty())?;

    assert_eq!(
        lib.calls(),
        vec![Call::ConvBwdFilter {
            algo: ConvBwdFilterAlgo::Algo0,
            workspace: Workspace::empty(),
            scaling: Scaling { alpha: 1.0, beta: 0.0 },
        }]
    );
    assert_eq!(lib.live_descriptors(), 0);
    Ok(())
}

#[test]
fn test_reproducible_policy_skips_nondeterministic_algorithms() -> anyhow::Result<()> {
    init_tracing();
    let lib = Arc::new(
        ScriptedLibrary::new(common::VERSION).with_conv_workspace(ConvBwdFilterAlgo::Algo1, 64),
    );
    let handle = handle(&lib);
    let case = ConvCase::dense(1, 2, 6, 2, 3, 1, 1);
    let opr = ConvolutionBackwardFilter::new(&handle, case.param)
        .with_policy(ExecutionPolicy::default().with_reproducible(true));

    // MATMUL does not fit in 64 bytes, ALGO_0 fits but is not reproducible.
    let algo = opr.get_algorithm(&case.src, &case.diff, &case.grad, 64)?;
    assert_eq!(algo.name(), "CONVOLUTION_BWD_FILTER_ALGO_1v7.6.5");
    assert!(algo.is_reproducible());

    // Nothing reproducible fits in zero bytes: fall back to ALGO_0.
    let algo = opr.get_algorithm(&case.src, &case.diff, &case.grad, 0)?;
    assert_eq!(algo.name(), "CONVOLUTION_BWD_FILTER_ALGO_0v7.6.5");
    Ok(())
}

#[test]
fn test_channel_wise_is_preferred_for_depthwise() -> anyhow::Result<()> {
    init_tracing();
    let lib = scripted();
    let handle = handle(&lib);
    let case = ConvCase::chanwise(2, 4, 7, 1, 3, 1);
    let opr = ConvolutionBackwardFilter::new(&handle, case.param);
    let algo = opr.get_algorithm(&case.src, &case.diff, &case.grad, usize::MAX)?;
    assert_eq!(algo.name(), "CHANNEL_WISE");

    let src = tensor(0x1000, case.src.clone());
    let diff = tensor(0x2000, case.diff.clone());
    let grad = tensor(0x3000, case.grad.clone());
    opr.exec(&src, &diff, &grad, Workspace::empty())?;
    assert_eq!(lib.calls(), vec![Call::ChanwiseBwdFilter]);
    Ok(())
}

#[test]
fn test_matmul_runs_one_gemm_per_group() -> anyhow::Result<()> {
    init_tracing();
    let lib = scripted();
    let handle = handle(&lib);
    let case = ConvCase::dense(2, 4, 8, 6, 3, 1, 1);
    let opr = ConvolutionBackwardFilter::new(&handle, case.param);
    let size = opr.get_workspace_in_bytes(&case.src, &case.diff, &case.grad)?;

    let src = tensor(0x1000, case.src.clone());
    let diff = tensor(0x2000, case.diff.clone());
    let grad = tensor(0x3000, case.grad.clone());
    opr.exec(&src, &diff, &grad, Workspace::new(DevicePtr(0x10000), size))?;

    assert_eq!(
        lib.calls(),
        vec![
            Call::Im2col,
            Call::NchwToCnhw { n: 2, c: 6, hw: 64 },
            Call::Gemm {
                m: 6,
                n: 36,
                k: 128,
                c: DevicePtr(0x3000),
            },
        ]
    );
    Ok(())
}

#[test]
fn test_undersized_workspace_fails_before_any_exec() -> anyhow::Result<()> {
    init_tracing();
    let lib = scripted();
    let handle = handle(&lib);
    let case = ConvCase::dense(1, 3, 6, 4, 3, 1, 1);
    let src = tensor(0x1000, case.src.clone());
    let diff = tensor(0x2000, case.diff.clone());
    let grad = tensor(0x3000, case.grad.clone());

    let registry = handle.conv_bwd_filter_algos();
    let algo = registry
        .get(AlgoMatmul::NAME)
        .ok_or_else(|| anyhow::anyhow!("MATMUL is registered"))?;
    let sizing = ExecArgs::new(&handle, &case.param, &src, &diff, &grad, Workspace::empty())?;
    let required = algo.get_workspace_in_bytes(&sizing.size)?;

    let workspace = Workspace::new(DevicePtr(0x10000), required - 1);
    let args = ExecArgs::new(&handle, &case.param, &src, &diff, &grad, workspace)?;
    let err = exec_checked(algo, &args).unwrap_err();
    match err {
        Error::WorkspaceTooSmall {
            algo,
            required: r,
            provided,
        } => {
            assert_eq!(algo, "MATMUL");
            assert_eq!(r, required);
            assert_eq!(provided, required - 1);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(lib.calls().is_empty());
    Ok(())
}

#[test]
fn test_no_usable_algorithm_reports_limit() -> anyhow::Result<()> {
    init_tracing();
    let lib = without_vendor_conv();
    let handle = handle(&lib);
    let case = ConvCase::dense(1, 3, 6, 4, 3, 1, 1);
    let opr = ConvolutionBackwardFilter::new(&handle, case.param);

    let src = tensor(0x1000, case.src.clone());
    let diff = tensor(0x2000, case.diff.clone());
    let grad = tensor(0x3000, case.grad.clone());
    let err = opr
        .exec(&src, &diff, &grad, Workspace::new(DevicePtr(0x10000), 16))
        .unwrap_err();
    assert!(matches!(
        err,
        Error::NoUsableAlgorithm {
            op: "conv_bwd_filter",
            limit: 16,
            ..
        }
    ));
    assert!(lib.calls().is_empty());
    assert_eq!(lib.live_descriptors(), 0);
    Ok(())
}

#[test]
fn test_exec_failure_is_reported_and_descriptors_released() -> anyhow::Result<()> {
    init_tracing();
    let lib = Arc::new(ScriptedLibrary::new(common::VERSION).with_exec_failure(Status::ExecutionFailed));
    let handle = handle(&lib);
    let case = ConvCase::dense(1, 3, 6, 4, 3, 1, 1);
    let opr = ConvolutionBackwardFilter::new(&handle, case.param);

    let src = tensor(0x1000, case.src.clone());
    let diff = tensor(0x2000, case.diff.clone());
    let grad = tensor(0x3000, case.grad.clone());
    let err = opr
        .exec(&src, &diff, &grad, Workspace::empty())
        .unwrap_err();
    match err {
        Error::VendorCallFailed {
            call, status, algo, ..
        } => {
            assert_eq!(call, "conv_bwd_filter");
            assert_eq!(status, Status::ExecutionFailed);
            assert_eq!(algo, "CONVOLUTION_BWD_FILTER_ALGO_0v7.6.5");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(lib.live_descriptors(), 0);
    assert!(lib.created_descriptors() > 0);
    Ok(())
}

#[test]
fn test_descriptor_failure_makes_vendor_algorithms_unavailable() -> anyhow::Result<()> {
    init_tracing();
    let lib = Arc::new(ScriptedLibrary::new(common::VERSION).with_descriptor_failure(Status::BadParam));
    let handle = handle(&lib);
    let case = ConvCase::dense(1, 3, 6, 4, 3, 1, 1);
    let opr = ConvolutionBackwardFilter::new(&handle, case.param);

    // Only the built-ins remain, and MATMUL needs workspace.
    let algo = opr.get_algorithm(&case.src, &case.diff, &case.grad, usize::MAX)?;
    assert_eq!(algo.name(), "MATMUL");
    assert!(matches!(
        opr.get_algorithm(&case.src, &case.diff, &case.grad, 0),
        Err(Error::NoUsableAlgorithm { .. })
    ));
    assert_eq!(lib.live_descriptors(), 0);
    Ok(())
}

struct BnBuffers {
    x: tessera_core::TensorND,
    scale: tessera_core::TensorND,
    bias: tessera_core::TensorND,
    mean: tessera_core::TensorND,
    variance: tessera_core::TensorND,
    save_mean: tessera_core::TensorND,
    save_variance: tessera_core::TensorND,
    y: tessera_core::TensorND,
}

impl BnBuffers {
    fn new(x: &[usize], param: &[usize]) -> Self {
        Self {
            x: tensor(0x1000, f32_layout(x)),
            scale: tensor(0x2000, f32_layout(param)),
            bias: tensor(0x3000, f32_layout(param)),
            mean: tensor(0x4000, f32_layout(param)),
            variance: tensor(0x5000, f32_layout(param)),
            save_mean: tensor(0x6000, f32_layout(param)),
            save_variance: tensor(0x7000, f32_layout(param)),
            y: tensor(0x8000, f32_layout(x)),
        }
    }

    fn forward(&self, running_stats: bool) -> BnForwardTensors<'_> {
        BnForwardTensors {
            x: &self.x,
            scale: &self.scale,
            bias: &self.bias,
            mean: running_stats.then_some(&self.mean),
            variance: running_stats.then_some(&self.variance),
            save_mean: &self.save_mean,
            save_variance: &self.save_variance,
            y: &self.y,
        }
    }
}

fn bn_handle() -> (Arc<ScriptedLibrary>, Handle) {
    let lib = scripted();
    let handle = handle(&lib);
    (lib, handle)
}

#[test]
fn test_bn_forward_training_with_and_without_running_stats() -> anyhow::Result<()> {
    init_tracing();
    let (lib, handle) = bn_handle();
    let buffers = BnBuffers::new(&[2, 3, 8, 8], &[1, 3, 1, 1]);
    let opr = BatchNormForward::new(&handle, BatchNormParam::default());
    let size = opr.get_workspace_in_bytes(&buffers.x.layout, &buffers.scale.layout, &buffers.y.layout)?;
    assert_eq!(size, 0);

    opr.exec(buffers.forward(true), Workspace::empty())?;
    opr.exec(buffers.forward(false), Workspace::empty())?;
    assert_eq!(
        lib.calls(),
        vec![
            Call::BnForwardTraining {
                mode: BnMode::Spatial,
                running_stats: true,
                workspace: Workspace::empty(),
            },
            Call::BnForwardTraining {
                mode: BnMode::Spatial,
                running_stats: false,
                workspace: Workspace::empty(),
            },
        ]
    );
    assert_eq!(lib.live_descriptors(), 0);
    Ok(())
}

#[test]
fn test_bn_forward_inference_needs_running_stats() -> anyhow::Result<()> {
    init_tracing();
    let (lib, handle) = bn_handle();
    let buffers = BnBuffers::new(&[2, 3, 8, 8], &[1, 3, 1, 1]);
    let param = BatchNormParam {
        fwd_mode: BnFwdMode::Inference,
        ..BatchNormParam::default()
    };
    let opr = BatchNormForward::new(&handle, param);

    assert!(matches!(
        opr.exec(buffers.forward(false), Workspace::empty()),
        Err(Error::InvalidArgs(_))
    ));
    opr.exec(buffers.forward(true), Workspace::empty())?;
    assert_eq!(
        lib.calls(),
        vec![Call::BnForwardInference {
            mode: BnMode::Spatial
        }]
    );
    Ok(())
}

#[test]
fn test_bn_per_activation_statistics() -> anyhow::Result<()> {
    init_tracing();
    let (lib, handle) = bn_handle();
    let buffers = BnBuffers::new(&[2, 3, 4, 4], &[1, 3, 4, 4]);
    let param = BatchNormParam {
        param_dim: BnParamDim::Dim1CHW,
        ..BatchNormParam::default()
    };
    let opr = BatchNormForward::new(&handle, param);
    let algo = opr.get_algorithm(
        &buffers.x.layout,
        &buffers.scale.layout,
        &buffers.y.layout,
        usize::MAX,
    )?;
    assert_eq!(algo.name(), "BATCHNORM_PER_ACTIVATIONv7.6.5");
    opr.exec(buffers.forward(true), Workspace::empty())?;
    assert!(matches!(
        lib.calls()[0],
        Call::BnForwardTraining {
            mode: BnMode::PerActivation,
            ..
        }
    ));
    Ok(())
}

#[test]
fn test_bn_falls_back_to_persistent_mode() -> anyhow::Result<()> {
    init_tracing();
    let lib = Arc::new(ScriptedLibrary::new(common::VERSION).with_unsupported_bn_mode(BnMode::Spatial));
    let handle = handle(&lib);
    let buffers = BnBuffers::new(&[2, 3, 8, 8], &[1, 3, 1, 1]);
    let opr = BatchNormForward::new(&handle, BatchNormParam::default())
        .with_policy(ExecutionPolicy::default().with_reproducible(true));

    let size = opr.get_workspace_in_bytes(&buffers.x.layout, &buffers.scale.layout, &buffers.y.layout)?;
    assert!(size > 0);

    // Too small: nothing is enqueued.
    let err = opr
        .exec(buffers.forward(true), Workspace::new(DevicePtr(0x9000), size - 1))
        .unwrap_err();
    assert!(matches!(err, Error::NoUsableAlgorithm { op: "bn_forward", .. }));
    assert!(lib.calls().is_empty());

    let workspace = Workspace::new(DevicePtr(0x9000), size);
    opr.exec(buffers.forward(true), workspace)?;
    assert_eq!(
        lib.calls(),
        vec![Call::BnForwardTraining {
            mode: BnMode::SpatialPersistent,
            running_stats: true,
            workspace,
        }]
    );
    Ok(())
}

#[test]
fn test_bn_forward_rejects_mismatched_statistics() {
    init_tracing();
    let (lib, handle) = bn_handle();
    let mut buffers = BnBuffers::new(&[2, 3, 8, 8], &[1, 3, 1, 1]);
    buffers.variance = tensor(0x5000, f32_layout(&[1, 4, 1, 1]));
    let opr = BatchNormForward::new(&handle, BatchNormParam::default());
    assert!(matches!(
        opr.exec(buffers.forward(true), Workspace::empty()),
        Err(Error::InvalidArgs(_))
    ));
    assert!(lib.calls().is_empty());
}

#[test]
fn test_bn_backward() -> anyhow::Result<()> {
    init_tracing();
    let (lib, handle) = bn_handle();
    let buffers = BnBuffers::new(&[2, 3, 8, 8], &[1, 3, 1, 1]);
    let dy = tensor(0xa000, f32_layout(&[2, 3, 8, 8]));
    let dx = tensor(0xb000, f32_layout(&[2, 3, 8, 8]));
    let d_scale = tensor(0xc000, f32_layout(&[1, 3, 1, 1]));
    let d_bias = tensor(0xd000, f32_layout(&[1, 3, 1, 1]));

    let opr = BatchNormBackward::new(&handle, BatchNormParam::default());
    let size = opr.get_workspace_in_bytes(
        &buffers.x.layout,
        &dy.layout,
        &buffers.scale.layout,
        &dx.layout,
    )?;
    let workspace = Workspace::new(DevicePtr(0x9000), size);
    opr.exec(
        BnBackwardTensors {
            x: &buffers.x,
            dy: &dy,
            save_mean: &buffers.save_mean,
            save_variance: &buffers.save_variance,
            scale: &buffers.scale,
            d_scale: &d_scale,
            d_bias: &d_bias,
            dx: &dx,
        },
        workspace,
    )?;
    assert_eq!(
        lib.calls(),
        vec![Call::BnBackward {
            mode: BnMode::Spatial,
            workspace,
        }]
    );
    assert_eq!(lib.live_descriptors(), 0);
    Ok(())
}

#[test]
fn test_registries_are_built_once_and_shared() {
    init_tracing();
    let (_lib, handle) = bn_handle();
    let handle = Arc::new(handle);
    let pointers: Vec<usize> = std::thread::scope(|s| {
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let handle = handle.clone();
                s.spawn(move || handle.conv_bwd_filter_algos() as *const _ as usize)
            })
            .collect();
        workers
            .into_iter()
            .map(|w| w.join().expect("worker panicked"))
            .collect()
    });
    assert!(pointers.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(handle.conv_bwd_filter_algos().len(), 8);
}

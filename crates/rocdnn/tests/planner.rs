//! Algorithm planning against the reference backend.
//!
//! Every test drives the full protocol: workspace query, search with real
//! buffers, selection, execution.

use rocdnn::{
    ConvFwdAlgorithm, ConvolutionDescriptor, ConvolutionParams, DataType, DnnError, Handle,
    HostBuffer, Planner, PlannerState, Runtime, TensorDescriptor,
};
use rocdnn::backend::ReferenceBackend;
use rocdnn::{Config, ConvAlgorithm};
use std::sync::Arc;

struct Problem {
    rt: Runtime,
    conv: ConvolutionDescriptor,
    x: TensorDescriptor,
    w: TensorDescriptor,
    y: TensorDescriptor,
}

/// `[1, 3, 8, 8] * [4, 3, 3, 3]`, same padding.
fn problem(rt: Runtime) -> Problem {
    let conv =
        ConvolutionDescriptor::new(&rt, ConvolutionParams::new(&[1, 1], &[1, 1], &[1, 1])).unwrap();
    let x = TensorDescriptor::with_shape(&rt, DataType::Float32, &[1, 3, 8, 8]).unwrap();
    let w = TensorDescriptor::with_shape(&rt, DataType::Float32, &[4, 3, 3, 3]).unwrap();
    let y = TensorDescriptor::with_shape(&rt, DataType::Float32, &[1, 4, 8, 8]).unwrap();
    Problem { rt, conv, x, w, y }
}

fn runtime_with_requests(request_count: usize) -> Runtime {
    let mut config = Config::default();
    config.find.request_count = request_count;
    Runtime::with_backend(Arc::new(ReferenceBackend::new()), config)
}

/// Deterministic, non-trivial data.
fn ramp(len: usize, scale: f32) -> Vec<f32> {
    (0..len)
        .map(|i| ((i * 7 + 3) % 11) as f32 * scale - 0.5)
        .collect()
}

#[test]
fn test_undersized_workspace_is_rejected() {
    let p = problem(Runtime::reference());
    let handle = Handle::new(&p.rt);
    let mut planner = Planner::forward(&p.conv, &p.x, &p.w, &p.y).unwrap();
    let bytes = planner.workspace_size(&handle).unwrap();
    assert!(bytes > 0, "GEMM lowering needs an im2col buffer");

    let (x, w, y) = (
        HostBuffer::<f32>::new(3 * 64),
        HostBuffer::<f32>::new(4 * 27),
        HostBuffer::<f32>::new(4 * 64),
    );
    let short = HostBuffer::<u8>::new(bytes - 1);
    let err = planner
        .find(&handle, &x, &w, &y, Some(&short))
        .unwrap_err();
    assert!(matches!(err, DnnError::BadParam { .. }), "{err}");
    assert_eq!(planner.state(), PlannerState::WorkspaceSized);

    let err = planner.find(&handle, &x, &w, &y, None).unwrap_err();
    assert!(matches!(err, DnnError::BadParam { .. }));
}

#[test]
fn test_results_sorted_and_capped() {
    let p = problem(runtime_with_requests(2));
    let handle = Handle::new(&p.rt);
    let mut planner = Planner::forward(&p.conv, &p.x, &p.w, &p.y).unwrap();
    let bytes = planner.workspace_size(&handle).unwrap();
    let ws = HostBuffer::<u8>::new(bytes);
    let (x, w, y) = (
        HostBuffer::from_slice(&ramp(3 * 64, 0.1)),
        HostBuffer::from_slice(&ramp(4 * 27, 0.05)),
        HostBuffer::<f32>::new(4 * 64),
    );
    let results = planner.find(&handle, &x, &w, &y, Some(&ws)).unwrap();
    assert_eq!(results.len(), 2);
    assert!(results.windows(2).all(|r| r[0].time_ms <= r[1].time_ms));
    assert!(results.iter().all(|r| r.workspace_bytes <= bytes));

    let fastest = planner.select_fastest().unwrap();
    assert_eq!(
        ConvAlgorithm::Forward(fastest.algorithm()),
        planner.results()[0].algorithm
    );
    assert_eq!(planner.state(), PlannerState::AlgorithmBound);
}

#[test]
fn test_heuristic_search_still_benchmarks_candidates() {
    let mut config = Config::default();
    config.find.request_count = 8;
    config.find.exhaustive = false;
    let p = problem(Runtime::with_backend(Arc::new(ReferenceBackend::new()), config));
    let handle = Handle::new(&p.rt);
    let mut planner = Planner::forward(&p.conv, &p.x, &p.w, &p.y).unwrap();
    let ws = HostBuffer::<u8>::new(planner.workspace_size(&handle).unwrap());
    let (x, w, y) = (
        HostBuffer::from_slice(&ramp(3 * 64, 0.1)),
        HostBuffer::from_slice(&ramp(4 * 27, 0.05)),
        HostBuffer::<f32>::new(4 * 64),
    );
    let heuristic: Vec<ConvAlgorithm> = planner
        .find(&handle, &x, &w, &y, Some(&ws))
        .unwrap()
        .iter()
        .map(|r| r.algorithm)
        .collect();
    assert!(heuristic.len() > 1, "{heuristic:?}");
    assert!(heuristic.contains(&ConvAlgorithm::Forward(ConvFwdAlgorithm::Direct)));
    assert!(heuristic.contains(&ConvAlgorithm::Forward(ConvFwdAlgorithm::Gemm)));
    assert!(!heuristic.contains(&ConvAlgorithm::Forward(ConvFwdAlgorithm::Fft)));

    let exhaustive = problem(runtime_with_requests(8));
    let handle = Handle::new(&exhaustive.rt);
    let mut planner =
        Planner::forward(&exhaustive.conv, &exhaustive.x, &exhaustive.w, &exhaustive.y).unwrap();
    let ws = HostBuffer::<u8>::new(planner.workspace_size(&handle).unwrap());
    let widened = planner.find(&handle, &x, &w, &y, Some(&ws)).unwrap();
    assert!(widened.len() > heuristic.len());
    assert!(widened
        .iter()
        .any(|r| r.algorithm == ConvAlgorithm::Forward(ConvFwdAlgorithm::Fft)));
}

#[test]
fn test_every_forward_algorithm_agrees() {
    let p = problem(runtime_with_requests(8));
    let handle = Handle::new(&p.rt);
    let mut planner = Planner::forward(&p.conv, &p.x, &p.w, &p.y).unwrap();
    let bytes = planner.workspace_size(&handle).unwrap();
    let ws = HostBuffer::<u8>::new(bytes);
    let x = HostBuffer::from_slice(&ramp(3 * 64, 0.1));
    let w = HostBuffer::from_slice(&ramp(4 * 27, 0.05));
    let y = HostBuffer::<f32>::new(4 * 64);

    let algorithms: Vec<ConvFwdAlgorithm> = planner
        .find(&handle, &x, &w, &y, Some(&ws))
        .unwrap()
        .iter()
        .map(|r| match r.algorithm {
            ConvAlgorithm::Forward(a) => a,
            other => panic!("forward search returned {other}"),
        })
        .collect();
    assert!(algorithms.contains(&ConvFwdAlgorithm::Gemm));
    assert!(algorithms.contains(&ConvFwdAlgorithm::Direct));
    assert!(algorithms.contains(&ConvFwdAlgorithm::Winograd));

    let run = |planner: &mut Planner<rocdnn::Forward>, algorithm| {
        let bound = planner.select(algorithm).unwrap();
        let out = HostBuffer::<f32>::new(4 * 64);
        p.conv
            .forward(
                &handle, 1.0, &p.x, &x, &p.w, &w, &bound, 0.0, &p.y, &out,
                Some(&ws),
            )
            .unwrap();
        out.to_vec()
    };
    let expected = run(&mut planner, ConvFwdAlgorithm::Direct);
    assert!(expected.iter().any(|&v| v != 0.0));
    for algorithm in algorithms {
        let got = run(&mut planner, algorithm);
        for (i, (a, b)) in got.iter().zip(&expected).enumerate() {
            assert!(
                (a - b).abs() <= 1e-3 * (1.0 + b.abs()),
                "{algorithm} differs from direct at {i}: {a} vs {b}"
            );
        }
    }
}

#[test]
fn test_budget_selects_workspace_free_algorithm() {
    let p = problem(runtime_with_requests(8));
    let handle = Handle::new(&p.rt);
    let mut planner = Planner::forward(&p.conv, &p.x, &p.w, &p.y).unwrap();
    let bytes = planner.workspace_size(&handle).unwrap();
    let ws = HostBuffer::<u8>::new(bytes);
    let (x, w, y) = (
        HostBuffer::<f32>::new(3 * 64),
        HostBuffer::<f32>::new(4 * 27),
        HostBuffer::<f32>::new(4 * 64),
    );
    planner.find(&handle, &x, &w, &y, Some(&ws)).unwrap();
    let bound = planner.select_within_budget(0).unwrap();
    assert_eq!(bound.workspace_bytes(), 0);

    // Bound to a zero-workspace algorithm, execution needs no workspace.
    p.conv
        .forward(&handle, 1.0, &p.x, &x, &p.w, &w, &bound, 0.0, &p.y, &y, None)
        .unwrap();
}

#[test]
fn test_execution_rejects_short_workspace() {
    let p = problem(runtime_with_requests(8));
    let handle = Handle::new(&p.rt);
    let mut planner = Planner::forward(&p.conv, &p.x, &p.w, &p.y).unwrap();
    let bytes = planner.workspace_size(&handle).unwrap();
    let ws = HostBuffer::<u8>::new(bytes);
    let (x, w, y) = (
        HostBuffer::<f32>::new(3 * 64),
        HostBuffer::<f32>::new(4 * 27),
        HostBuffer::<f32>::new(4 * 64),
    );
    planner.find(&handle, &x, &w, &y, Some(&ws)).unwrap();
    let gemm = planner.select(ConvFwdAlgorithm::Gemm).unwrap();
    assert!(gemm.workspace_bytes() > 0);

    let err = p
        .conv
        .forward(&handle, 1.0, &p.x, &x, &p.w, &w, &gemm, 0.0, &p.y, &y, None)
        .unwrap_err();
    assert!(matches!(err, DnnError::BadParam { .. }), "{err}");
}

#[test]
fn test_requery_restarts_protocol() {
    let p = problem(Runtime::reference());
    let handle = Handle::new(&p.rt);
    let mut planner = Planner::forward(&p.conv, &p.x, &p.w, &p.y).unwrap();
    let bytes = planner.workspace_size(&handle).unwrap();
    let ws = HostBuffer::<u8>::new(bytes);
    let (x, w, y) = (
        HostBuffer::<f32>::new(3 * 64),
        HostBuffer::<f32>::new(4 * 27),
        HostBuffer::<f32>::new(4 * 64),
    );
    planner.find(&handle, &x, &w, &y, Some(&ws)).unwrap();
    assert!(!planner.results().is_empty());

    assert_eq!(planner.workspace_size(&handle).unwrap(), bytes);
    assert_eq!(planner.state(), PlannerState::WorkspaceSized);
    assert!(planner.results().is_empty());
    assert!(matches!(
        planner.select_fastest(),
        Err(DnnError::InvalidState { .. })
    ));
}

#[test]
fn test_backward_passes_plan_and_run() {
    let p = problem(Runtime::reference());
    let handle = Handle::new(&p.rt);
    let x = HostBuffer::from_slice(&ramp(3 * 64, 0.1));
    let w = HostBuffer::from_slice(&ramp(4 * 27, 0.05));
    let dy = HostBuffer::from_slice(&ramp(4 * 64, 0.02));

    let mut data = Planner::backward_data(&p.conv, &p.y, &p.w, &p.x).unwrap();
    let ws = HostBuffer::<u8>::new(data.workspace_size(&handle).unwrap());
    let dx = HostBuffer::<f32>::new(3 * 64);
    data.find(&handle, &dx, &w, &dy, Some(&ws)).unwrap();
    let bound = data.select_fastest().unwrap();
    p.conv
        .backward_data(&handle, 1.0, &p.y, &dy, &p.w, &w, &bound, 0.0, &p.x, &dx, Some(&ws))
        .unwrap();
    assert!(dx.to_vec().iter().any(|&v| v != 0.0));

    let mut weights = Planner::backward_weights(&p.conv, &p.y, &p.x, &p.w).unwrap();
    let ws = HostBuffer::<u8>::new(weights.workspace_size(&handle).unwrap());
    let dw = HostBuffer::<f32>::new(4 * 27);
    weights.find(&handle, &x, &dw, &dy, Some(&ws)).unwrap();
    let bound = weights.select_fastest().unwrap();
    p.conv
        .backward_weights(&handle, 1.0, &p.y, &dy, &p.x, &x, &bound, 0.0, &p.w, &dw, Some(&ws))
        .unwrap();
    assert!(dw.to_vec().iter().any(|&v| v != 0.0));
}

#[test]
fn test_planner_rejects_mixed_element_types() {
    let rt = Runtime::reference();
    let conv =
        ConvolutionDescriptor::new(&rt, ConvolutionParams::new(&[0, 0], &[1, 1], &[1, 1])).unwrap();
    let x = TensorDescriptor::with_shape(&rt, DataType::Float16, &[1, 1, 4, 4]).unwrap();
    let w = TensorDescriptor::with_shape(&rt, DataType::Float32, &[1, 1, 3, 3]).unwrap();
    let y = TensorDescriptor::with_shape(&rt, DataType::Float32, &[1, 1, 2, 2]).unwrap();
    assert!(matches!(
        Planner::forward(&conv, &x, &w, &y),
        Err(DnnError::BadParam { .. })
    ));
}

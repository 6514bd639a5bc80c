//! Fused chains must compute what the same layers compute one by one.

use rocdnn::convolution::forward_bias;
use rocdnn::{
    ActivationCoefficients, ActivationDescriptor, ActivationMode, ActivationParams, BatchNorm,
    BatchNormMode, ConvFwdAlgorithm, ConvolutionDescriptor, ConvolutionParams, DataType,
    FusionDirection, FusionPlan, Handle, HostBuffer, OperatorArgs, Planner, Runtime,
    TensorDescriptor,
};

const RELU: ActivationCoefficients = ActivationCoefficients {
    alpha: 0.0,
    beta: 0.0,
    gamma: 0.0,
};

fn wave(len: usize, phase: f32) -> Vec<f32> {
    (0..len).map(|i| (i as f32 * 0.7 + phase).sin()).collect()
}

fn assert_close(got: &[f32], expected: &[f32]) {
    assert_eq!(got.len(), expected.len());
    for (i, (a, b)) in got.iter().zip(expected).enumerate() {
        assert!((a - b).abs() <= 1e-4, "element {i}: fused {a}, unfused {b}");
    }
}

#[test]
fn test_conv_bias_relu_matches_unfused() {
    let rt = Runtime::reference();
    let handle = Handle::new(&rt);
    let x_desc = TensorDescriptor::with_shape(&rt, DataType::Float32, &[2, 3, 6, 6]).unwrap();
    let w_desc = TensorDescriptor::with_shape(&rt, DataType::Float32, &[4, 3, 3, 3]).unwrap();
    let b_desc = TensorDescriptor::with_shape(&rt, DataType::Float32, &[1, 4, 1, 1]).unwrap();
    let y_desc = TensorDescriptor::with_shape(&rt, DataType::Float32, &[2, 4, 6, 6]).unwrap();
    let conv =
        ConvolutionDescriptor::new(&rt, ConvolutionParams::new(&[1, 1], &[1, 1], &[1, 1])).unwrap();

    let x = HostBuffer::from_slice(&wave(2 * 3 * 36, 0.0));
    let w = HostBuffer::from_slice(&wave(4 * 27, 1.3));
    let b = HostBuffer::from_slice(&[0.25f32, -0.5, 0.0, 1.0]);

    // Unfused: conv, bias, relu.
    let mut planner = Planner::forward(&conv, &x_desc, &w_desc, &y_desc).unwrap();
    let ws = HostBuffer::<u8>::new(planner.workspace_size(&handle).unwrap());
    let y = HostBuffer::<f32>::new(2 * 4 * 36);
    planner.find(&handle, &x, &w, &y, Some(&ws)).unwrap();
    let direct = planner.select(ConvFwdAlgorithm::Direct).unwrap();
    conv.forward(&handle, 1.0, &x_desc, &x, &w_desc, &w, &direct, 0.0, &y_desc, &y, None)
        .unwrap();
    forward_bias(&handle, 1.0, &b_desc, &b, 1.0, &y_desc, &y).unwrap();
    let relu = ActivationDescriptor::new(&rt, ActivationParams::new(ActivationMode::Relu)).unwrap();
    let unfused = HostBuffer::<f32>::new(2 * 4 * 36);
    relu.forward(&handle, 1.0, &y_desc, &y, 0.0, &y_desc, &unfused)
        .unwrap();

    // Fused.
    let mut plan = FusionPlan::new(&rt, FusionDirection::Vertical, &x_desc).unwrap();
    let conv_op = {
        let mut op = plan.create_conv_forward(&conv, &w_desc).unwrap();
        op.set_algorithm(ConvFwdAlgorithm::Direct).unwrap();
        op.op()
    };
    let bias_op = plan.create_bias_forward(&b_desc).unwrap();
    let relu_op = plan.create_activation_forward(ActivationMode::Relu).unwrap();
    plan.compile(&handle).unwrap();
    assert_eq!(plan.output_layout().unwrap().dims.as_slice(), &[2, 4, 6, 6]);

    let mut args = OperatorArgs::new(&plan).unwrap();
    args.set_conv_forward(conv_op, 1.0, 0.0, &w).unwrap();
    args.set_bias_forward(bias_op, 1.0, 0.0, &b).unwrap();
    args.set_activation_forward(relu_op, 1.0, 0.0, RELU).unwrap();
    let fused = HostBuffer::<f32>::new(2 * 4 * 36);
    plan.execute(&handle, &x_desc, &x, &y_desc, &fused, &args)
        .unwrap();

    assert!(unfused.to_vec().iter().any(|&v| v > 0.0));
    assert_close(&fused.to_vec(), &unfused.to_vec());

    // Arguments are reusable across executions.
    let again = HostBuffer::<f32>::new(2 * 4 * 36);
    plan.execute(&handle, &x_desc, &x, &y_desc, &again, &args)
        .unwrap();
    assert_eq!(again.to_vec(), fused.to_vec());
}

#[test]
fn test_batch_norm_inference_relu_matches_unfused() {
    let rt = Runtime::reference();
    let handle = Handle::new(&rt);
    let x_desc = TensorDescriptor::with_shape(&rt, DataType::Float32, &[2, 3, 4, 4]).unwrap();
    let bn = BatchNorm::new(BatchNormMode::Spatial);
    let bn_desc = bn.derive_descriptor(&x_desc).unwrap();

    let x = HostBuffer::from_slice(&wave(2 * 3 * 16, 0.4));
    let scale = HostBuffer::from_slice(&[1.0f32, 2.0, 0.5]);
    let bias = HostBuffer::from_slice(&[0.0f32, -0.25, 0.5]);
    let mean = HostBuffer::from_slice(&[0.1f32, -0.1, 0.0]);
    let variance = HostBuffer::from_slice(&[1.0f32, 0.5, 2.0]);
    let epsilon = 1e-5;

    let normalized = HostBuffer::<f32>::new(96);
    bn.forward_inference(
        &handle,
        1.0,
        0.0,
        &x_desc,
        &x,
        &x_desc,
        &normalized,
        &bn_desc,
        &scale,
        &bias,
        Some(&mean),
        Some(&variance),
        epsilon,
    )
    .unwrap();
    let relu = ActivationDescriptor::new(&rt, ActivationParams::new(ActivationMode::Relu)).unwrap();
    let unfused = HostBuffer::<f32>::new(96);
    relu.forward(&handle, 1.0, &x_desc, &normalized, 0.0, &x_desc, &unfused)
        .unwrap();

    let mut plan = FusionPlan::new(&rt, FusionDirection::Vertical, &x_desc).unwrap();
    let bn_op = plan
        .create_batch_norm_inference(BatchNormMode::Spatial, &bn_desc)
        .unwrap();
    let relu_op = plan.create_activation_forward(ActivationMode::Relu).unwrap();
    plan.compile(&handle).unwrap();

    let mut args = OperatorArgs::new(&plan).unwrap();
    args.set_batch_norm_inference(bn_op, 1.0, 0.0, &scale, &bias, &mean, &variance, epsilon)
        .unwrap();
    args.set_activation_forward(relu_op, 1.0, 0.0, RELU).unwrap();
    let fused = HostBuffer::<f32>::new(96);
    plan.execute(&handle, &x_desc, &x, &x_desc, &fused, &args)
        .unwrap();

    assert_close(&fused.to_vec(), &unfused.to_vec());
}

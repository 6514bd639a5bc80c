//! Fusion plans.
//!
//! A fusion plan chains several operators so the backend can run them as
//! one kernel sequence without materializing intermediate tensors.
//!
//! # Lifecycle
//!
//! ```text
//!  FusionPlan::new ─▶ Built ─(create_*)─▶ Built ─(compile)─▶ Compiled ─(execute)─▶ Executed ─(execute)─▶ Executed
//!
//!  OperatorArgs::new(&plan) ─(set_* per operator)─▶ passed to every execute
//! ```
//!
//! Operators can only be appended while the plan is `Built`; execution is
//! only possible once it is `Compiled`, and leaves it `Executed`; a failed
//! execution leaves the state unchanged. Every operator must have arguments
//! bound in the [`OperatorArgs`] passed to
//! [`execute`](FusionPlan::execute).
//!
//! # Supported chains
//!
//! The reference backend fuses vertical chains of the shape
//!
//! - `conv? -> bias? -> batchnorm? -> activation?` (inference and training)
//! - `activation-backward -> batchnorm-backward?`
//!
//! in single or half precision. Anything else is rejected at compile time
//! with [`DnnError::UnsupportedOp`](crate::DnnError::UnsupportedOp).

mod args;
mod plan;

pub use crate::backend::ActivationCoefficients;
pub use args::OperatorArgs;
pub use plan::{ConvForwardOp, FusionOp, FusionOpKind, FusionPlan, PlanState};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convolution::{ConvolutionDescriptor, ConvolutionParams};
    use crate::handle::Handle;
    use crate::memory::HostBuffer;
    use crate::runtime::Runtime;
    use crate::tensor::TensorDescriptor;
    use crate::types::{ActivationMode, BatchNormMode, ConvFwdAlgorithm, DataType, FusionDirection};
    use crate::DnnError;

    const RELU: ActivationCoefficients = ActivationCoefficients {
        alpha: 0.0,
        beta: 0.0,
        gamma: 0.0,
    };

    fn input(rt: &Runtime) -> TensorDescriptor {
        TensorDescriptor::with_shape(rt, DataType::Float32, &[1, 2, 2, 2]).unwrap()
    }

    #[test]
    fn test_horizontal_not_implemented() {
        let rt = Runtime::reference();
        let err = FusionPlan::new(&rt, FusionDirection::Horizontal, &input(&rt)).unwrap_err();
        assert!(matches!(err, DnnError::NotImplemented { .. }));
    }

    #[test]
    fn test_state_machine() {
        let rt = Runtime::reference();
        let handle = Handle::new(&rt);
        let mut plan = FusionPlan::new(&rt, FusionDirection::Vertical, &input(&rt)).unwrap();
        assert_eq!(plan.state(), PlanState::Built);
        assert!(matches!(
            plan.compile(&handle),
            Err(DnnError::BadParam { .. })
        ));

        let relu = plan.create_activation_forward(ActivationMode::Relu).unwrap();
        assert_eq!(relu.index(), 0);
        assert_eq!(relu.kind(), FusionOpKind::ActivationForward);
        assert!(plan.output_layout().is_none());

        plan.compile(&handle).unwrap();
        assert_eq!(plan.state(), PlanState::Compiled);
        assert_eq!(plan.output_layout().unwrap().dims.as_slice(), &[1, 2, 2, 2]);
        assert!(matches!(
            plan.compile(&handle),
            Err(DnnError::InvalidState { .. })
        ));
        assert!(matches!(
            plan.create_activation_forward(ActivationMode::Tanh),
            Err(DnnError::InvalidState { .. })
        ));
        assert_eq!(plan.ops().count(), 1);
    }

    #[test]
    fn test_execute_before_compile() {
        let rt = Runtime::reference();
        let handle = Handle::new(&rt);
        let x_desc = input(&rt);
        let mut plan = FusionPlan::new(&rt, FusionDirection::Vertical, &x_desc).unwrap();
        let relu = plan.create_activation_forward(ActivationMode::Relu).unwrap();
        let mut args = OperatorArgs::new(&plan).unwrap();
        args.set_activation_forward(relu, 1.0, 0.0, RELU).unwrap();

        let x = HostBuffer::<f32>::new(8);
        let y = HostBuffer::<f32>::new(8);
        let err = plan.execute(&handle, &x_desc, &x, &x_desc, &y, &args).unwrap_err();
        assert!(matches!(err, DnnError::InvalidState { .. }));
    }

    #[test]
    fn test_execution_enters_executed_state() {
        let rt = Runtime::reference();
        let handle = Handle::new(&rt);
        let x_desc = input(&rt);
        let mut plan = FusionPlan::new(&rt, FusionDirection::Vertical, &x_desc).unwrap();
        let relu = plan.create_activation_forward(ActivationMode::Relu).unwrap();
        plan.compile(&handle).unwrap();
        let mut args = OperatorArgs::new(&plan).unwrap();

        let x = HostBuffer::from_slice(&[-1.0f32, 2.0, -3.0, 4.0, 0.5, -0.5, 1.0, -2.0]);
        let y = HostBuffer::<f32>::new(8);
        let short = HostBuffer::<f32>::new(4);
        assert!(plan.execute(&handle, &x_desc, &x, &x_desc, &y, &args).is_err());
        assert_eq!(plan.state(), PlanState::Compiled);

        args.set_activation_forward(relu, 1.0, 0.0, RELU).unwrap();
        assert!(plan.execute(&handle, &x_desc, &x, &x_desc, &short, &args).is_err());
        assert_eq!(plan.state(), PlanState::Compiled);

        plan.execute(&handle, &x_desc, &x, &x_desc, &y, &args).unwrap();
        assert_eq!(plan.state(), PlanState::Executed);
        plan.execute(&handle, &x_desc, &x, &x_desc, &y, &args).unwrap();
        assert_eq!(plan.state(), PlanState::Executed);
        assert_eq!(plan.executions(), 2);
        assert_eq!(y.to_vec(), vec![0.0, 2.0, 0.0, 4.0, 0.5, 0.0, 1.0, 0.0]);
        assert!(matches!(
            plan.create_activation_forward(ActivationMode::Tanh),
            Err(DnnError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_execute_requires_every_binding() {
        let rt = Runtime::reference();
        let handle = Handle::new(&rt);
        let x_desc = input(&rt);
        let b_desc = TensorDescriptor::with_shape(&rt, DataType::Float32, &[1, 2, 1, 1]).unwrap();
        let mut plan = FusionPlan::new(&rt, FusionDirection::Vertical, &x_desc).unwrap();
        plan.create_bias_forward(&b_desc).unwrap();
        let relu = plan.create_activation_forward(ActivationMode::Relu).unwrap();
        plan.compile(&handle).unwrap();

        let mut args = OperatorArgs::new(&plan).unwrap();
        args.set_activation_forward(relu, 1.0, 0.0, RELU).unwrap();
        let x = HostBuffer::<f32>::new(8);
        let y = HostBuffer::<f32>::new(8);
        let err = plan.execute(&handle, &x_desc, &x, &x_desc, &y, &args).unwrap_err();
        assert!(matches!(err, DnnError::BadParam { .. }));
    }

    #[test]
    fn test_args_of_another_plan() {
        let rt = Runtime::reference();
        let handle = Handle::new(&rt);
        let x_desc = input(&rt);
        let mut a = FusionPlan::new(&rt, FusionDirection::Vertical, &x_desc).unwrap();
        let mut b = FusionPlan::new(&rt, FusionDirection::Vertical, &x_desc).unwrap();
        let relu_a = a.create_activation_forward(ActivationMode::Relu).unwrap();
        let relu_b = b.create_activation_forward(ActivationMode::Relu).unwrap();
        a.compile(&handle).unwrap();
        b.compile(&handle).unwrap();

        let mut args_b = OperatorArgs::new(&b).unwrap();
        // Operator of plan `a` cannot be bound into plan `b`'s table.
        assert!(matches!(
            args_b.set_activation_forward(relu_a, 1.0, 0.0, RELU),
            Err(DnnError::BadParam { .. })
        ));
        args_b.set_activation_forward(relu_b, 1.0, 0.0, RELU).unwrap();

        let x = HostBuffer::<f32>::new(8);
        let y = HostBuffer::<f32>::new(8);
        let err = a.execute(&handle, &x_desc, &x, &x_desc, &y, &args_b).unwrap_err();
        assert!(matches!(err, DnnError::BadParam { .. }));
    }

    #[test]
    fn test_setter_kind_mismatch() {
        let rt = Runtime::reference();
        let x_desc = input(&rt);
        let b_desc = TensorDescriptor::with_shape(&rt, DataType::Float32, &[1, 2, 1, 1]).unwrap();
        let b = HostBuffer::<f32>::new(2);
        let mut plan = FusionPlan::new(&rt, FusionDirection::Vertical, &x_desc).unwrap();
        let bias = plan.create_bias_forward(&b_desc).unwrap();
        let mut args = OperatorArgs::new(&plan).unwrap();
        assert!(args.is_empty());
        assert!(matches!(
            args.set_activation_forward(bias, 1.0, 0.0, RELU),
            Err(DnnError::BadParam { .. })
        ));
        args.set_bias_forward(bias, 1.0, 0.0, &b).unwrap();
        assert_eq!(args.len(), 1);
    }

    #[test]
    fn test_undersized_param_buffer() {
        let rt = Runtime::reference();
        let handle = Handle::new(&rt);
        let x_desc = input(&rt);
        let b_desc = TensorDescriptor::with_shape(&rt, DataType::Float32, &[1, 2, 1, 1]).unwrap();
        let mut plan = FusionPlan::new(&rt, FusionDirection::Vertical, &x_desc).unwrap();
        let bias = plan.create_bias_forward(&b_desc).unwrap();
        plan.compile(&handle).unwrap();

        let short = HostBuffer::<f32>::new(1);
        let mut args = OperatorArgs::new(&plan).unwrap();
        args.set_bias_forward(bias, 1.0, 0.0, &short).unwrap();
        let x = HostBuffer::<f32>::new(8);
        let y = HostBuffer::<f32>::new(8);
        let err = plan.execute(&handle, &x_desc, &x, &x_desc, &y, &args).unwrap_err();
        assert!(matches!(err, DnnError::InvalidValue { .. }));
    }

    #[test]
    fn test_unsupported_chain() {
        let rt = Runtime::reference();
        let handle = Handle::new(&rt);
        let mut plan = FusionPlan::new(&rt, FusionDirection::Vertical, &input(&rt)).unwrap();
        plan.create_activation_forward(ActivationMode::Relu).unwrap();
        plan.create_batch_norm_backward(BatchNormMode::Spatial).unwrap();
        assert!(matches!(
            plan.compile(&handle),
            Err(DnnError::UnsupportedOp { .. })
        ));
        assert_eq!(plan.state(), PlanState::Built);
    }

    #[test]
    fn test_conv_algorithm_pinning() {
        let rt = Runtime::reference();
        let handle = Handle::new(&rt);
        let x_desc = TensorDescriptor::with_shape(&rt, DataType::Float32, &[1, 1, 4, 4]).unwrap();
        let w_desc = TensorDescriptor::with_shape(&rt, DataType::Float32, &[1, 1, 3, 3]).unwrap();
        let conv =
            ConvolutionDescriptor::new(&rt, ConvolutionParams::new(&[1, 1], &[1, 1], &[1, 1]))
                .unwrap();
        let mut plan = FusionPlan::new(&rt, FusionDirection::Vertical, &x_desc).unwrap();
        {
            let mut op = plan.create_conv_forward(&conv, &w_desc).unwrap();
            let algorithms = op.algorithms().unwrap();
            assert!(algorithms.contains(&ConvFwdAlgorithm::Direct));
            op.set_algorithm(ConvFwdAlgorithm::Direct).unwrap();
        }
        assert_eq!(plan.conv_algorithm(), Some(ConvFwdAlgorithm::Direct));
        plan.compile(&handle).unwrap();
        assert_eq!(
            plan.workspace_size(&handle, ConvFwdAlgorithm::Direct).unwrap(),
            0
        );
        assert!(plan.conv_forward().is_some());
    }
}

//! A reference backend with injectable failures, for unit tests.

use super::*;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Forward a list of trait methods to the wrapped backend unchanged.
macro_rules! delegate {
    ($(fn $name:ident(&self $(, $arg:ident: $ty:ty)* $(,)?) -> $ret:ty;)*) => {
        $(
            fn $name(&self $(, $arg: $ty)*) -> $ret {
                self.inner.$name($($arg),*)
            }
        )*
    };
}

/// Wraps [`ReferenceBackend`], failing profiling on request and counting
/// live handles.
#[derive(Debug, Default)]
pub(crate) struct FaultyBackend {
    inner: ReferenceBackend,
    fail_profiling: bool,
    live_handles: AtomicUsize,
}

impl FaultyBackend {
    pub(crate) fn new(fail_profiling: bool) -> Self {
        Self {
            fail_profiling,
            ..Self::default()
        }
    }

    pub(crate) fn live_handles(&self) -> usize {
        self.live_handles.load(Ordering::SeqCst)
    }
}

#[allow(clippy::too_many_arguments)]
impl Backend for FaultyBackend {
    fn name(&self) -> &'static str {
        "faulty"
    }

    fn create_handle(&self) -> DnnResult<RawHandle> {
        let raw = self.inner.create_handle()?;
        self.live_handles.fetch_add(1, Ordering::SeqCst);
        Ok(raw)
    }

    fn destroy_handle(&self, handle: RawHandle) -> DnnResult<()> {
        self.inner.destroy_handle(handle)?;
        self.live_handles.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    fn enable_profiling(&self, handle: RawHandle, enable: bool) -> DnnResult<()> {
        if self.fail_profiling {
            return Err(crate::DnnError::bad_param("miopenEnableProfiling", "injected failure"));
        }
        self.inner.enable_profiling(handle, enable)
    }

    delegate! {
        fn set_stream(&self, handle: RawHandle, stream: u64) -> DnnResult<()>;
        fn stream(&self, handle: RawHandle) -> DnnResult<u64>;
        fn kernel_time(&self, handle: RawHandle) -> DnnResult<f32>;
        fn create_descriptor(&self, kind: DescriptorKind) -> DnnResult<RawDescriptor>;
        fn destroy_descriptor(&self, kind: DescriptorKind, desc: RawDescriptor) -> DnnResult<()>;
        fn set_descriptor(&self, desc: RawDescriptor, config: &DescriptorConfig) -> DnnResult<()>;
        fn get_descriptor(
            &self,
            desc: RawDescriptor,
            kind: DescriptorKind,
            rank: usize,
        ) -> DnnResult<DescriptorConfig>;
        fn tensor_num_bytes(&self, desc: RawDescriptor) -> DnnResult<usize>;
        fn set_pooling_index_type(&self, desc: RawDescriptor, index: IndexType) -> DnnResult<()>;
        fn pooling_index_type(&self, desc: RawDescriptor) -> DnnResult<IndexType>;
        fn derive_batch_norm_descriptor(
            &self,
            derived: RawDescriptor,
            x: RawDescriptor,
            mode: BatchNormMode,
        ) -> DnnResult<()>;
        fn conv_output_dim(
            &self,
            conv: RawDescriptor,
            x: RawDescriptor,
            w: RawDescriptor,
        ) -> DnnResult<Vec<i32>>;
        fn conv_workspace_size(&self, handle: RawHandle, problem: &ConvProblem) -> DnnResult<usize>;
        fn find_conv_algorithms(
            &self,
            handle: RawHandle,
            problem: &ConvProblem,
            buffers: &ConvBuffers,
            request: &SearchRequest,
        ) -> DnnResult<Vec<PerformanceRecord>>;
        fn convolution(
            &self,
            handle: RawHandle,
            problem: &ConvProblem,
            algorithm: ConvAlgorithm,
            buffers: &ConvBuffers,
            alpha: Scalar,
            beta: Scalar,
            workspace: Workspace,
        ) -> DnnResult<()>;
        fn convolution_forward_bias(
            &self,
            handle: RawHandle,
            alpha: Scalar,
            bias: TensorArg,
            beta: Scalar,
            y: TensorArg,
        ) -> DnnResult<()>;
        fn convolution_backward_bias(
            &self,
            handle: RawHandle,
            alpha: Scalar,
            dy: TensorArg,
            beta: Scalar,
            db: TensorArg,
        ) -> DnnResult<()>;
        fn set_tensor(&self, handle: RawHandle, y: TensorArg, value: Scalar) -> DnnResult<()>;
        fn scale_tensor(&self, handle: RawHandle, y: TensorArg, alpha: Scalar) -> DnnResult<()>;
        fn transform_tensor(
            &self,
            handle: RawHandle,
            alpha: Scalar,
            x: TensorArg,
            beta: Scalar,
            y: TensorArg,
        ) -> DnnResult<()>;
        fn op_tensor(
            &self,
            handle: RawHandle,
            op: TensorOp,
            alpha1: Scalar,
            a: TensorArg,
            alpha2: Scalar,
            b: TensorArg,
            beta: Scalar,
            c: TensorArg,
        ) -> DnnResult<()>;
        fn activation_forward(
            &self,
            handle: RawHandle,
            desc: RawDescriptor,
            alpha: Scalar,
            x: TensorArg,
            beta: Scalar,
            y: TensorArg,
        ) -> DnnResult<()>;
        fn activation_backward(
            &self,
            handle: RawHandle,
            desc: RawDescriptor,
            alpha: Scalar,
            y: TensorArg,
            dy: TensorArg,
            x: TensorArg,
            beta: Scalar,
            dx: TensorArg,
        ) -> DnnResult<()>;
        fn softmax_forward(
            &self,
            handle: RawHandle,
            alpha: Scalar,
            x: TensorArg,
            beta: Scalar,
            y: TensorArg,
        ) -> DnnResult<()>;
        fn softmax_backward(
            &self,
            handle: RawHandle,
            alpha: Scalar,
            y: TensorArg,
            dy: TensorArg,
            beta: Scalar,
            dx: TensorArg,
        ) -> DnnResult<()>;
        fn pooling_output_dim(&self, desc: RawDescriptor, x: RawDescriptor) -> DnnResult<Vec<i32>>;
        fn pooling_workspace_size(&self, desc: RawDescriptor, y: RawDescriptor) -> DnnResult<usize>;
        fn pooling_forward(
            &self,
            handle: RawHandle,
            desc: RawDescriptor,
            alpha: Scalar,
            x: TensorArg,
            beta: Scalar,
            y: TensorArg,
            do_backward: bool,
            workspace: Workspace,
        ) -> DnnResult<()>;
        fn pooling_backward(
            &self,
            handle: RawHandle,
            desc: RawDescriptor,
            alpha: Scalar,
            y: TensorArg,
            dy: TensorArg,
            x: TensorArg,
            beta: Scalar,
            dx: TensorArg,
            workspace: Workspace,
        ) -> DnnResult<()>;
        fn lrn_workspace_size(&self, y: RawDescriptor) -> DnnResult<usize>;
        fn lrn_forward(
            &self,
            handle: RawHandle,
            desc: RawDescriptor,
            alpha: Scalar,
            x: TensorArg,
            beta: Scalar,
            y: TensorArg,
            do_backward: bool,
            workspace: Workspace,
        ) -> DnnResult<()>;
        fn lrn_backward(
            &self,
            handle: RawHandle,
            desc: RawDescriptor,
            alpha: Scalar,
            y: TensorArg,
            dy: TensorArg,
            x: TensorArg,
            beta: Scalar,
            dx: TensorArg,
            workspace: Workspace,
        ) -> DnnResult<()>;
        fn batch_norm_inference(
            &self,
            handle: RawHandle,
            mode: BatchNormMode,
            alpha: Scalar,
            beta: Scalar,
            x: TensorArg,
            y: TensorArg,
            params: &BatchNormInferenceArgs,
        ) -> DnnResult<()>;
        fn batch_norm_training(
            &self,
            handle: RawHandle,
            mode: BatchNormMode,
            alpha: Scalar,
            beta: Scalar,
            x: TensorArg,
            y: TensorArg,
            params: &BatchNormTrainingArgs,
        ) -> DnnResult<()>;
        fn batch_norm_backward(
            &self,
            handle: RawHandle,
            mode: BatchNormMode,
            scales: &BatchNormBackwardScales,
            x: TensorArg,
            dy: TensorArg,
            dx: TensorArg,
            params: &BatchNormBackwardArgs,
        ) -> DnnResult<()>;
        fn rnn_workspace_size(
            &self,
            handle: RawHandle,
            desc: RawDescriptor,
            xs: &[RawDescriptor],
        ) -> DnnResult<usize>;
        fn rnn_training_reserve_size(
            &self,
            handle: RawHandle,
            desc: RawDescriptor,
            xs: &[RawDescriptor],
        ) -> DnnResult<usize>;
        fn rnn_params_size(
            &self,
            handle: RawHandle,
            desc: RawDescriptor,
            x: RawDescriptor,
            data_type: DataType,
        ) -> DnnResult<usize>;
        fn create_fusion_plan(
            &self,
            direction: FusionDirection,
            input: RawDescriptor,
        ) -> DnnResult<RawPlan>;
        fn destroy_fusion_plan(&self, plan: RawPlan) -> DnnResult<()>;
        fn create_fusion_op(&self, plan: RawPlan, spec: &FusionOpSpec) -> DnnResult<RawOp>;
        fn compile_fusion_plan(&self, handle: RawHandle, plan: RawPlan) -> DnnResult<()>;
        fn fusion_workspace_size(
            &self,
            handle: RawHandle,
            plan: RawPlan,
            algorithm: ConvFwdAlgorithm,
        ) -> DnnResult<usize>;
        fn fusion_conv_algorithms(
            &self,
            plan: RawPlan,
            request_count: usize,
        ) -> DnnResult<Vec<ConvFwdAlgorithm>>;
        fn fusion_set_conv_algorithm(
            &self,
            plan: RawPlan,
            algorithm: ConvFwdAlgorithm,
        ) -> DnnResult<()>;
        fn create_operator_args(&self) -> DnnResult<RawArgs>;
        fn destroy_operator_args(&self, args: RawArgs) -> DnnResult<()>;
        fn set_operator_args(&self, args: RawArgs, op: RawOp, binding: &OpBinding) -> DnnResult<()>;
        fn execute_fusion_plan(
            &self,
            handle: RawHandle,
            plan: RawPlan,
            input: TensorArg,
            output: TensorArg,
            args: RawArgs,
        ) -> DnnResult<()>;
    }
}

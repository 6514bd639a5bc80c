//! Backend abstraction.
//!
//! A [`Backend`] is the opaque native library this crate drives. Every object
//! it owns (handles, descriptors, fusion plans, operator argument tables) is
//! identified by a raw id; the typed wrappers in the rest of the crate own
//! those ids and release them on drop.
//!
//! Two implementations exist:
//!
//! - [`ReferenceBackend`]: host memory, plain kernels, always available
//! - `MiopenBackend` (feature `rocm`): forwards to `libMIOpen` loaded at
//!   runtime
//!
//! # Conventions
//!
//! Tensor operands are passed as [`TensorArg`] (descriptor plus pointer).
//! Convolution problems always name the three tensors in forward order
//! `(x, w, y)`; the [`ConvPass`] decides which one is written.

pub mod reference;

#[cfg(feature = "rocm")]
pub mod miopen;

#[cfg(test)]
pub(crate) mod testing;

use crate::activation::ActivationParams;
use crate::convolution::{ConvAlgorithm, ConvolutionParams, PerformanceRecord};
use crate::lrn::LrnParams;
use crate::memory::DevicePtr;
use crate::pooling::PoolingParams;
use crate::rnn::RnnParams;
use crate::scalar::Scalar;
use crate::tensor::TensorLayout;
use crate::types::{
    ActivationMode, BatchNormMode, ConvFwdAlgorithm, DataType, FusionDirection, IndexType,
    TensorOp,
};
use crate::DnnResult;
use std::fmt;

pub use reference::ReferenceBackend;

macro_rules! raw_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub struct $name(pub u64);

        impl $name {
            /// Raw id value.
            #[must_use]
            pub const fn as_raw(self) -> u64 {
                self.0
            }
        }
    };
}

raw_id!(
    /// Backend execution context.
    RawHandle
);
raw_id!(
    /// Backend descriptor of any kind.
    RawDescriptor
);
raw_id!(
    /// Backend fusion plan.
    RawPlan
);
raw_id!(
    /// Operator inside a fusion plan.
    RawOp
);
raw_id!(
    /// Backend operator-argument table.
    RawArgs
);

/// Kind of a backend descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    /// Tensor shape/stride/type.
    Tensor,
    /// Convolution geometry.
    Convolution,
    /// Activation function.
    Activation,
    /// Pooling window.
    Pooling,
    /// Local response normalization.
    Lrn,
    /// Recurrent network.
    Rnn,
}

/// Contents of a descriptor, by kind.
#[derive(Clone, Debug, PartialEq)]
pub enum DescriptorConfig {
    /// Tensor layout.
    Tensor(TensorLayout),
    /// Convolution parameters.
    Convolution(ConvolutionParams),
    /// Activation parameters.
    Activation(ActivationParams),
    /// Pooling parameters.
    Pooling(PoolingParams),
    /// LRN parameters.
    Lrn(LrnParams),
    /// RNN parameters.
    Rnn(RnnParams),
}

impl DescriptorConfig {
    /// The descriptor kind this configuration belongs to.
    #[must_use]
    pub const fn kind(&self) -> DescriptorKind {
        match self {
            Self::Tensor(_) => DescriptorKind::Tensor,
            Self::Convolution(_) => DescriptorKind::Convolution,
            Self::Activation(_) => DescriptorKind::Activation,
            Self::Pooling(_) => DescriptorKind::Pooling,
            Self::Lrn(_) => DescriptorKind::Lrn,
            Self::Rnn(_) => DescriptorKind::Rnn,
        }
    }
}

/// A tensor operand: its descriptor and the memory holding it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TensorArg {
    /// Layout descriptor.
    pub desc: RawDescriptor,
    /// Data address.
    pub ptr: DevicePtr,
}

impl TensorArg {
    /// Pair a descriptor with a pointer.
    #[must_use]
    pub const fn new(desc: RawDescriptor, ptr: DevicePtr) -> Self {
        Self { desc, ptr }
    }
}

/// Which convolution pass a call concerns.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConvPass {
    /// `y = conv(x, w)`
    Forward,
    /// `dx = conv^T(dy, w)`
    BackwardData,
    /// `dw = corr(x, dy)`
    BackwardWeights,
}

impl ConvPass {
    /// Human-readable name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Forward => "forward",
            Self::BackwardData => "backward-data",
            Self::BackwardWeights => "backward-weights",
        }
    }
}

/// The descriptors of one convolution problem, in forward order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConvProblem {
    /// Pass being planned or executed.
    pub pass: ConvPass,
    /// Convolution descriptor.
    pub conv: RawDescriptor,
    /// Input (`x` or `dx`).
    pub x: RawDescriptor,
    /// Filter (`w` or `dw`).
    pub w: RawDescriptor,
    /// Output (`y` or `dy`).
    pub y: RawDescriptor,
}

/// Buffers of one convolution problem, in forward order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConvBuffers {
    /// Input (`x` or `dx`).
    pub x: DevicePtr,
    /// Filter (`w` or `dw`).
    pub w: DevicePtr,
    /// Output (`y` or `dy`).
    pub y: DevicePtr,
}

/// Workspace handed to a call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Workspace {
    /// Address of the scratch region (may be null when `bytes == 0`).
    pub ptr: DevicePtr,
    /// Usable size in bytes.
    pub bytes: usize,
}

impl Workspace {
    /// No workspace.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            ptr: DevicePtr::null(),
            bytes: 0,
        }
    }
}

/// Parameters of an algorithm search.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SearchRequest {
    /// Maximum number of records to return.
    pub request_count: usize,
    /// Also benchmark algorithms a heuristic search skips.
    pub exhaustive: bool,
    /// Scratch space candidates may use.
    pub workspace: Workspace,
}

/// Per-channel operands of batch-normalization inference.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BatchNormInferenceArgs {
    /// Descriptor shared by all four vectors.
    pub desc: RawDescriptor,
    /// Scale (gamma).
    pub scale: DevicePtr,
    /// Bias (beta).
    pub bias: DevicePtr,
    /// Estimated mean.
    pub mean: DevicePtr,
    /// Estimated variance.
    pub variance: DevicePtr,
    /// Variance epsilon.
    pub epsilon: f64,
}

/// Per-channel operands of batch-normalization training.
///
/// Null running/saved pointers mean the statistic is not produced.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BatchNormTrainingArgs {
    /// Descriptor shared by all per-channel vectors.
    pub desc: RawDescriptor,
    /// Scale (gamma).
    pub scale: DevicePtr,
    /// Bias (beta).
    pub bias: DevicePtr,
    /// Running-average factor.
    pub factor: f64,
    /// Running mean, updated in place.
    pub running_mean: DevicePtr,
    /// Running variance, updated in place.
    pub running_variance: DevicePtr,
    /// Batch mean output.
    pub save_mean: DevicePtr,
    /// Batch inverse standard deviation output.
    pub save_inv_variance: DevicePtr,
    /// Variance epsilon.
    pub epsilon: f64,
}

/// Per-channel operands of the batch-normalization backward pass.
///
/// Null saved pointers make the backend recompute the statistics.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BatchNormBackwardArgs {
    /// Descriptor shared by all per-channel vectors.
    pub desc: RawDescriptor,
    /// Scale (gamma).
    pub scale: DevicePtr,
    /// Scale gradient output.
    pub scale_diff: DevicePtr,
    /// Bias gradient output.
    pub bias_diff: DevicePtr,
    /// Saved batch mean.
    pub saved_mean: DevicePtr,
    /// Saved inverse standard deviation.
    pub saved_inv_variance: DevicePtr,
    /// Variance epsilon.
    pub epsilon: f64,
}

/// Scaling of a batch-normalization backward pass.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BatchNormBackwardScales {
    /// Scale of the data gradient.
    pub alpha_data: Scalar,
    /// Blend of the prior data gradient.
    pub beta_data: Scalar,
    /// Scale of the parameter gradients.
    pub alpha_param: Scalar,
    /// Blend of the prior parameter gradients.
    pub beta_param: Scalar,
}

/// An operator to append to a fusion plan.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FusionOpSpec {
    /// Forward convolution.
    ConvForward {
        /// Convolution descriptor.
        conv: RawDescriptor,
        /// Filter descriptor.
        weights: RawDescriptor,
    },
    /// Channel bias.
    BiasForward {
        /// Bias descriptor.
        bias: RawDescriptor,
    },
    /// Forward activation.
    ActivationForward {
        /// Function.
        mode: ActivationMode,
    },
    /// Activation gradient.
    ActivationBackward {
        /// Function.
        mode: ActivationMode,
    },
    /// Batch-norm inference.
    BatchNormInference {
        /// Statistics granularity.
        mode: BatchNormMode,
        /// Descriptor of the per-channel vectors.
        params: RawDescriptor,
    },
    /// Batch-norm training.
    BatchNormForward {
        /// Statistics granularity.
        mode: BatchNormMode,
        /// Whether running statistics are updated.
        running_stats: bool,
    },
    /// Batch-norm gradient.
    BatchNormBackward {
        /// Statistics granularity.
        mode: BatchNormMode,
    },
}

/// Activation coefficients `(alpha, beta, gamma)` of the function itself.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ActivationCoefficients {
    /// Function alpha.
    pub alpha: f64,
    /// Function beta.
    pub beta: f64,
    /// Function gamma.
    pub gamma: f64,
}

/// Runtime arguments of one fusion operator.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum OpBinding {
    /// Arguments of a convolution operator.
    ConvForward {
        /// Result scale.
        alpha: Scalar,
        /// Destination blend.
        beta: Scalar,
        /// Filter data.
        weights: DevicePtr,
    },
    /// Arguments of a bias operator.
    BiasForward {
        /// Result scale.
        alpha: Scalar,
        /// Destination blend.
        beta: Scalar,
        /// Bias data.
        bias: DevicePtr,
    },
    /// Arguments of a forward activation.
    ActivationForward {
        /// Result scale.
        alpha: Scalar,
        /// Destination blend.
        beta: Scalar,
        /// Function coefficients.
        coefficients: ActivationCoefficients,
    },
    /// Arguments of an activation gradient.
    ActivationBackward {
        /// Result scale.
        alpha: Scalar,
        /// Destination blend.
        beta: Scalar,
        /// Forward output.
        y: DevicePtr,
        /// Function coefficients.
        coefficients: ActivationCoefficients,
    },
    /// Arguments of batch-norm inference.
    BatchNormInference {
        /// Result scale.
        alpha: Scalar,
        /// Destination blend.
        beta: Scalar,
        /// Scale.
        scale: DevicePtr,
        /// Bias.
        bias: DevicePtr,
        /// Estimated mean.
        mean: DevicePtr,
        /// Estimated variance.
        variance: DevicePtr,
        /// Variance epsilon.
        epsilon: f64,
    },
    /// Arguments of batch-norm training.
    BatchNormForward {
        /// Result scale.
        alpha: Scalar,
        /// Destination blend.
        beta: Scalar,
        /// Scale.
        scale: DevicePtr,
        /// Bias.
        bias: DevicePtr,
        /// Batch mean output.
        saved_mean: DevicePtr,
        /// Batch inverse standard deviation output.
        saved_inv_variance: DevicePtr,
        /// Running mean.
        running_mean: DevicePtr,
        /// Running variance.
        running_variance: DevicePtr,
        /// Running-average factor.
        factor: f64,
        /// Variance epsilon.
        epsilon: f64,
    },
    /// Arguments of batch-norm gradient.
    BatchNormBackward {
        /// Result scale.
        alpha: Scalar,
        /// Destination blend.
        beta: Scalar,
        /// Forward input.
        x: DevicePtr,
        /// Scale.
        scale: DevicePtr,
        /// Bias.
        bias: DevicePtr,
        /// Scale gradient output.
        scale_diff: DevicePtr,
        /// Bias gradient output.
        bias_diff: DevicePtr,
        /// Saved batch mean.
        saved_mean: DevicePtr,
        /// Saved inverse standard deviation.
        saved_inv_variance: DevicePtr,
    },
}

/// The native library surface this crate drives.
///
/// Every method converts native failures into [`DnnError`](crate::DnnError)s
/// tagged with the native function name. Pointers are trusted: callers
/// validate buffer capacity before calling.
#[allow(clippy::too_many_arguments)]
pub trait Backend: Send + Sync + fmt::Debug {
    /// Backend name for logs.
    fn name(&self) -> &'static str;

    // ------------------------------------------------------------------
    // Handles
    // ------------------------------------------------------------------

    /// Create an execution context.
    fn create_handle(&self) -> DnnResult<RawHandle>;
    /// Destroy an execution context.
    fn destroy_handle(&self, handle: RawHandle) -> DnnResult<()>;
    /// Bind a stream to a context.
    fn set_stream(&self, handle: RawHandle, stream: u64) -> DnnResult<()>;
    /// Stream currently bound to a context.
    fn stream(&self, handle: RawHandle) -> DnnResult<u64>;
    /// Toggle kernel timing.
    fn enable_profiling(&self, handle: RawHandle, enable: bool) -> DnnResult<()>;
    /// Time of the last kernel in milliseconds.
    fn kernel_time(&self, handle: RawHandle) -> DnnResult<f32>;

    // ------------------------------------------------------------------
    // Descriptors
    // ------------------------------------------------------------------

    /// Create an empty descriptor.
    fn create_descriptor(&self, kind: DescriptorKind) -> DnnResult<RawDescriptor>;
    /// Destroy a descriptor.
    fn destroy_descriptor(&self, kind: DescriptorKind, desc: RawDescriptor) -> DnnResult<()>;
    /// Set a descriptor's contents.
    fn set_descriptor(&self, desc: RawDescriptor, config: &DescriptorConfig) -> DnnResult<()>;
    /// Read a descriptor's contents; `rank` is the number of dimensions to
    /// read for tensors and convolutions.
    fn get_descriptor(
        &self,
        desc: RawDescriptor,
        kind: DescriptorKind,
        rank: usize,
    ) -> DnnResult<DescriptorConfig>;
    /// Bytes spanned by a tensor.
    fn tensor_num_bytes(&self, desc: RawDescriptor) -> DnnResult<usize>;
    /// Set the index width of a pooling descriptor.
    fn set_pooling_index_type(&self, desc: RawDescriptor, index: IndexType) -> DnnResult<()>;
    /// Index width of a pooling descriptor.
    fn pooling_index_type(&self, desc: RawDescriptor) -> DnnResult<IndexType>;
    /// Fill `derived` with the batch-norm parameter shape for `x`.
    fn derive_batch_norm_descriptor(
        &self,
        derived: RawDescriptor,
        x: RawDescriptor,
        mode: BatchNormMode,
    ) -> DnnResult<()>;

    // ------------------------------------------------------------------
    // Convolution
    // ------------------------------------------------------------------

    /// Output shape of a forward convolution.
    fn conv_output_dim(
        &self,
        conv: RawDescriptor,
        x: RawDescriptor,
        w: RawDescriptor,
    ) -> DnnResult<Vec<i32>>;
    /// Workspace the largest applicable algorithm needs.
    fn conv_workspace_size(&self, handle: RawHandle, problem: &ConvProblem) -> DnnResult<usize>;
    /// Benchmark applicable algorithms; writes the pass's output buffer.
    fn find_conv_algorithms(
        &self,
        handle: RawHandle,
        problem: &ConvProblem,
        buffers: &ConvBuffers,
        request: &SearchRequest,
    ) -> DnnResult<Vec<PerformanceRecord>>;
    /// Run one convolution pass with `alpha`/`beta` blending.
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
    /// `y = alpha * b + beta * y`, `b` broadcast per channel.
    fn convolution_forward_bias(
        &self,
        handle: RawHandle,
        alpha: Scalar,
        bias: TensorArg,
        beta: Scalar,
        y: TensorArg,
    ) -> DnnResult<()>;
    /// `db = alpha * sum(dy) + beta * db` per channel.
    fn convolution_backward_bias(
        &self,
        handle: RawHandle,
        alpha: Scalar,
        dy: TensorArg,
        beta: Scalar,
        db: TensorArg,
    ) -> DnnResult<()>;

    // ------------------------------------------------------------------
    // Tensor operations
    // ------------------------------------------------------------------

    /// Set every element of `y`.
    fn set_tensor(&self, handle: RawHandle, y: TensorArg, value: Scalar) -> DnnResult<()>;
    /// Multiply every element of `y`.
    fn scale_tensor(&self, handle: RawHandle, y: TensorArg, alpha: Scalar) -> DnnResult<()>;
    /// `y = alpha * x + beta * y` across layouts.
    fn transform_tensor(
        &self,
        handle: RawHandle,
        alpha: Scalar,
        x: TensorArg,
        beta: Scalar,
        y: TensorArg,
    ) -> DnnResult<()>;
    /// `c = op(alpha1 * a, alpha2 * b) + beta * c`.
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

    // ------------------------------------------------------------------
    // Activation, softmax
    // ------------------------------------------------------------------

    /// Forward activation.
    fn activation_forward(
        &self,
        handle: RawHandle,
        desc: RawDescriptor,
        alpha: Scalar,
        x: TensorArg,
        beta: Scalar,
        y: TensorArg,
    ) -> DnnResult<()>;
    /// Activation gradient.
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
    /// Channel softmax.
    fn softmax_forward(
        &self,
        handle: RawHandle,
        alpha: Scalar,
        x: TensorArg,
        beta: Scalar,
        y: TensorArg,
    ) -> DnnResult<()>;
    /// Channel softmax gradient.
    fn softmax_backward(
        &self,
        handle: RawHandle,
        alpha: Scalar,
        y: TensorArg,
        dy: TensorArg,
        beta: Scalar,
        dx: TensorArg,
    ) -> DnnResult<()>;

    // ------------------------------------------------------------------
    // Pooling, LRN
    // ------------------------------------------------------------------

    /// Output shape of a pooling pass.
    fn pooling_output_dim(&self, desc: RawDescriptor, x: RawDescriptor) -> DnnResult<Vec<i32>>;
    /// Workspace for recording max indices of `y`.
    fn pooling_workspace_size(&self, desc: RawDescriptor, y: RawDescriptor) -> DnnResult<usize>;
    /// Forward pooling; records indices when `do_backward`.
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
    /// Pooling gradient.
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
    /// Workspace for LRN scale factors of `y`.
    fn lrn_workspace_size(&self, y: RawDescriptor) -> DnnResult<usize>;
    /// Forward LRN.
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
    /// LRN gradient.
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

    // ------------------------------------------------------------------
    // Batch normalization
    // ------------------------------------------------------------------

    /// Inference with estimated statistics.
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
    /// Training with batch statistics.
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
    /// Data and parameter gradients.
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

    // ------------------------------------------------------------------
    // RNN sizing
    // ------------------------------------------------------------------

    /// Inference workspace for a sequence of per-step input descriptors.
    fn rnn_workspace_size(
        &self,
        handle: RawHandle,
        desc: RawDescriptor,
        xs: &[RawDescriptor],
    ) -> DnnResult<usize>;
    /// Training reserve space.
    fn rnn_training_reserve_size(
        &self,
        handle: RawHandle,
        desc: RawDescriptor,
        xs: &[RawDescriptor],
    ) -> DnnResult<usize>;
    /// Bytes of all weights and biases.
    fn rnn_params_size(
        &self,
        handle: RawHandle,
        desc: RawDescriptor,
        x: RawDescriptor,
        data_type: DataType,
    ) -> DnnResult<usize>;

    // ------------------------------------------------------------------
    // Fusion
    // ------------------------------------------------------------------

    /// Create an empty plan over `input`.
    fn create_fusion_plan(
        &self,
        direction: FusionDirection,
        input: RawDescriptor,
    ) -> DnnResult<RawPlan>;
    /// Destroy a plan.
    fn destroy_fusion_plan(&self, plan: RawPlan) -> DnnResult<()>;
    /// Append an operator.
    fn create_fusion_op(&self, plan: RawPlan, spec: &FusionOpSpec) -> DnnResult<RawOp>;
    /// Compile the plan's operator chain.
    fn compile_fusion_plan(&self, handle: RawHandle, plan: RawPlan) -> DnnResult<()>;
    /// Workspace the compiled plan needs with `algorithm`.
    fn fusion_workspace_size(
        &self,
        handle: RawHandle,
        plan: RawPlan,
        algorithm: ConvFwdAlgorithm,
    ) -> DnnResult<usize>;
    /// Algorithms the plan's convolution operator may use.
    fn fusion_conv_algorithms(
        &self,
        plan: RawPlan,
        request_count: usize,
    ) -> DnnResult<Vec<ConvFwdAlgorithm>>;
    /// Pin the plan's convolution algorithm.
    fn fusion_set_conv_algorithm(
        &self,
        plan: RawPlan,
        algorithm: ConvFwdAlgorithm,
    ) -> DnnResult<()>;
    /// Create an empty argument table.
    fn create_operator_args(&self) -> DnnResult<RawArgs>;
    /// Destroy an argument table.
    fn destroy_operator_args(&self, args: RawArgs) -> DnnResult<()>;
    /// Bind arguments for one operator.
    fn set_operator_args(&self, args: RawArgs, op: RawOp, binding: &OpBinding) -> DnnResult<()>;
    /// Run a compiled plan.
    fn execute_fusion_plan(
        &self,
        handle: RawHandle,
        plan: RawPlan,
        input: TensorArg,
        output: TensorArg,
        args: RawArgs,
    ) -> DnnResult<()>;
}

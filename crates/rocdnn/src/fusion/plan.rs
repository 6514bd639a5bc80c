//! Fusion plan construction, compilation and execution.

use super::args::{BufferRole, OperatorArgs};
use crate::backend::{FusionOpSpec, RawOp, RawPlan};
use crate::batchnorm::param_layout;
use crate::convolution::ConvolutionDescriptor;
use crate::handle::Handle;
use crate::memory::DeviceMemory;
use crate::runtime::Runtime;
use crate::tensor::{TensorDescriptor, TensorLayout};
use crate::types::{ActivationMode, BatchNormMode, ConvFwdAlgorithm, DataType, FusionDirection};
use crate::{DnnError, DnnResult};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_PLAN_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a [`FusionPlan`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlanState {
    /// Operators may be appended.
    Built,
    /// Frozen and executable.
    Compiled,
    /// Compiled and executed at least once; stays executable.
    Executed,
}

/// Kind of a fused operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FusionOpKind {
    /// Forward convolution.
    ConvForward,
    /// Channel bias.
    BiasForward,
    /// Forward activation.
    ActivationForward,
    /// Activation gradient.
    ActivationBackward,
    /// Batch-norm inference.
    BatchNormInference,
    /// Batch-norm training.
    BatchNormForward,
    /// Batch-norm gradient.
    BatchNormBackward,
}

impl FusionOpKind {
    /// Human-readable name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::ConvForward => "conv-forward",
            Self::BiasForward => "bias-forward",
            Self::ActivationForward => "activation-forward",
            Self::ActivationBackward => "activation-backward",
            Self::BatchNormInference => "batchnorm-inference",
            Self::BatchNormForward => "batchnorm-forward",
            Self::BatchNormBackward => "batchnorm-backward",
        }
    }
}

impl fmt::Display for FusionOpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An operator inside a particular [`FusionPlan`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FusionOp {
    pub(crate) plan_id: u64,
    pub(crate) index: usize,
    pub(crate) kind: FusionOpKind,
    pub(crate) raw: RawOp,
}

impl FusionOp {
    /// Position in the chain.
    #[must_use]
    pub const fn index(self) -> usize {
        self.index
    }

    /// Operator kind.
    #[must_use]
    pub const fn kind(self) -> FusionOpKind {
        self.kind
    }
}

/// Descriptors an operator keeps alive and needs for shape inference.
enum OpDetail {
    Conv {
        conv: ConvolutionDescriptor,
        weights: TensorDescriptor,
    },
    Bias {
        bias: TensorDescriptor,
    },
    Activation,
    BatchNorm {
        mode: BatchNormMode,
        params: Option<TensorDescriptor>,
    },
}

struct OpRecord {
    op: FusionOp,
    detail: OpDetail,
    /// Bytes each per-operator parameter buffer must hold; known after compile.
    param_bytes: usize,
}

/// Shapes fixed by compilation.
#[derive(Clone, Debug)]
struct Compiled {
    output: TensorLayout,
    data_bytes: usize,
}

/// A chain of operators compiled once and executed many times.
///
/// ```text
/// FusionPlan::new ─▶ create_* ... ─▶ compile ─▶ execute, execute, ...
/// ```
///
/// Operators are appended in execution order. After [`compile`](Self::compile)
/// the chain is frozen.
pub struct FusionPlan {
    runtime: Runtime,
    raw: RawPlan,
    id: u64,
    input: TensorDescriptor,
    input_layout: TensorLayout,
    ops: Vec<OpRecord>,
    conv_algorithm: Option<ConvFwdAlgorithm>,
    compiled: Option<Compiled>,
    executions: AtomicU64,
}

impl FusionPlan {
    /// Create an empty plan over inputs shaped like `input`.
    ///
    /// # Errors
    ///
    /// - [`DnnError::NotImplemented`] for [`FusionDirection::Horizontal`]
    /// - [`DnnError::BadParam`] if `input` is unset
    pub fn new(
        runtime: &Runtime,
        direction: FusionDirection,
        input: &TensorDescriptor,
    ) -> DnnResult<Self> {
        const OP: &str = "FusionPlan::new";
        if direction == FusionDirection::Horizontal {
            return Err(DnnError::not_implemented(OP, "horizontal fusion"));
        }
        let input_layout = input.require_layout(OP)?;
        let raw = runtime
            .backend()
            .create_fusion_plan(direction, input.raw())?;
        let id = NEXT_PLAN_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(plan = id, input = %input_layout, "fusion plan created");
        Ok(Self {
            runtime: runtime.clone(),
            raw,
            id,
            input: input.clone(),
            input_layout,
            ops: Vec::new(),
            conv_algorithm: None,
            compiled: None,
            executions: AtomicU64::new(0),
        })
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> PlanState {
        match (&self.compiled, self.executions()) {
            (None, _) => PlanState::Built,
            (Some(_), 0) => PlanState::Compiled,
            (Some(_), _) => PlanState::Executed,
        }
    }

    /// Number of successful executions.
    #[must_use]
    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }

    /// Operators in chain order.
    pub fn ops(&self) -> impl Iterator<Item = FusionOp> + '_ {
        self.ops.iter().map(|r| r.op)
    }

    /// Operator at `index`.
    #[must_use]
    pub fn op(&self, index: usize) -> Option<FusionOp> {
        self.ops.get(index).map(|r| r.op)
    }

    /// Convolution algorithm pinned with [`ConvForwardOp::set_algorithm`].
    #[must_use]
    pub const fn conv_algorithm(&self) -> Option<ConvFwdAlgorithm> {
        self.conv_algorithm
    }

    /// Layout of the plan's output, known once compiled.
    #[must_use]
    pub fn output_layout(&self) -> Option<&TensorLayout> {
        self.compiled.as_ref().map(|c| &c.output)
    }

    fn push(
        &mut self,
        op: &'static str,
        spec: FusionOpSpec,
        kind: FusionOpKind,
        detail: OpDetail,
    ) -> DnnResult<FusionOp> {
        if self.compiled.is_some() {
            return Err(DnnError::invalid_state(
                op,
                "operators cannot be added to a compiled plan",
            ));
        }
        let raw = self.runtime.backend().create_fusion_op(self.raw, &spec)?;
        let fused = FusionOp {
            plan_id: self.id,
            index: self.ops.len(),
            kind,
            raw,
        };
        self.ops.push(OpRecord {
            op: fused,
            detail,
            param_bytes: 0,
        });
        tracing::trace!(plan = self.id, op = %kind, index = fused.index, "operator appended");
        Ok(fused)
    }

    /// Append a forward convolution with filter `weights`.
    ///
    /// The returned handle is the only way to query and pin the fused
    /// convolution's algorithm.
    ///
    /// # Errors
    ///
    /// Returns [`DnnError::InvalidState`] after compile and
    /// [`DnnError::BadParam`] if `weights` is unset.
    pub fn create_conv_forward(
        &mut self,
        conv: &ConvolutionDescriptor,
        weights: &TensorDescriptor,
    ) -> DnnResult<ConvForwardOp<'_>> {
        const OP: &str = "FusionPlan::create_conv_forward";
        weights.require_layout(OP)?;
        let op = self.push(
            OP,
            FusionOpSpec::ConvForward {
                conv: conv.raw(),
                weights: weights.raw(),
            },
            FusionOpKind::ConvForward,
            OpDetail::Conv {
                conv: conv.clone(),
                weights: weights.clone(),
            },
        )?;
        Ok(ConvForwardOp { plan: self, op })
    }

    /// Re-borrow the plan's convolution operator, if it has one.
    pub fn conv_forward(&mut self) -> Option<ConvForwardOp<'_>> {
        let op = self
            .ops
            .iter()
            .find(|r| r.op.kind == FusionOpKind::ConvForward)?
            .op;
        Some(ConvForwardOp { plan: self, op })
    }

    /// Append a channel bias.
    ///
    /// # Errors
    ///
    /// Returns [`DnnError::InvalidState`] after compile and
    /// [`DnnError::BadParam`] if `bias` is unset.
    pub fn create_bias_forward(&mut self, bias: &TensorDescriptor) -> DnnResult<FusionOp> {
        const OP: &str = "FusionPlan::create_bias_forward";
        bias.require_layout(OP)?;
        self.push(
            OP,
            FusionOpSpec::BiasForward { bias: bias.raw() },
            FusionOpKind::BiasForward,
            OpDetail::Bias { bias: bias.clone() },
        )
    }

    /// Append a forward activation.
    ///
    /// # Errors
    ///
    /// Returns [`DnnError::InvalidState`] after compile.
    pub fn create_activation_forward(&mut self, mode: ActivationMode) -> DnnResult<FusionOp> {
        self.push(
            "FusionPlan::create_activation_forward",
            FusionOpSpec::ActivationForward { mode },
            FusionOpKind::ActivationForward,
            OpDetail::Activation,
        )
    }

    /// Append an activation gradient.
    ///
    /// # Errors
    ///
    /// Returns [`DnnError::InvalidState`] after compile.
    pub fn create_activation_backward(&mut self, mode: ActivationMode) -> DnnResult<FusionOp> {
        self.push(
            "FusionPlan::create_activation_backward",
            FusionOpSpec::ActivationBackward { mode },
            FusionOpKind::ActivationBackward,
            OpDetail::Activation,
        )
    }

    /// Append batch-norm inference with per-channel vectors shaped `params`.
    ///
    /// # Errors
    ///
    /// Returns [`DnnError::InvalidState`] after compile and
    /// [`DnnError::BadParam`] if `params` is unset.
    pub fn create_batch_norm_inference(
        &mut self,
        mode: BatchNormMode,
        params: &TensorDescriptor,
    ) -> DnnResult<FusionOp> {
        const OP: &str = "FusionPlan::create_batch_norm_inference";
        params.require_layout(OP)?;
        self.push(
            OP,
            FusionOpSpec::BatchNormInference {
                mode,
                params: params.raw(),
            },
            FusionOpKind::BatchNormInference,
            OpDetail::BatchNorm {
                mode,
                params: Some(params.clone()),
            },
        )
    }

    /// Append batch-norm training; `running_stats` keeps running averages.
    ///
    /// # Errors
    ///
    /// Returns [`DnnError::InvalidState`] after compile.
    pub fn create_batch_norm_forward(
        &mut self,
        mode: BatchNormMode,
        running_stats: bool,
    ) -> DnnResult<FusionOp> {
        self.push(
            "FusionPlan::create_batch_norm_forward",
            FusionOpSpec::BatchNormForward {
                mode,
                running_stats,
            },
            FusionOpKind::BatchNormForward,
            OpDetail::BatchNorm { mode, params: None },
        )
    }

    /// Append a batch-norm gradient.
    ///
    /// # Errors
    ///
    /// Returns [`DnnError::InvalidState`] after compile.
    pub fn create_batch_norm_backward(&mut self, mode: BatchNormMode) -> DnnResult<FusionOp> {
        self.push(
            "FusionPlan::create_batch_norm_backward",
            FusionOpSpec::BatchNormBackward { mode },
            FusionOpKind::BatchNormBackward,
            OpDetail::BatchNorm { mode, params: None },
        )
    }

    /// Freeze the chain.
    ///
    /// Infers the shape flowing between operators and the size every
    /// operator's parameter buffers must have.
    ///
    /// # Errors
    ///
    /// - [`DnnError::InvalidState`] if already compiled
    /// - [`DnnError::BadParam`] if an operator's descriptors do not fit the
    ///   shape reaching it, or the chain is empty
    /// - [`DnnError::UnsupportedOp`] if the backend cannot fuse the chain
    pub fn compile(&mut self, handle: &Handle) -> DnnResult<()> {
        const OP: &str = "FusionPlan::compile";
        if self.compiled.is_some() {
            return Err(DnnError::invalid_state(OP, "plan is already compiled"));
        }
        if self.ops.is_empty() {
            return Err(DnnError::bad_param(OP, "plan has no operators"));
        }

        let mut current = self.input_layout.clone();
        let mut param_bytes = Vec::with_capacity(self.ops.len());
        for record in &self.ops {
            let (next, bytes) = infer_op(OP, &record.detail, &current)?;
            param_bytes.push(bytes);
            current = next;
        }

        handle.backend().compile_fusion_plan(handle.raw(), self.raw)?;
        for (record, bytes) in self.ops.iter_mut().zip(param_bytes) {
            record.param_bytes = bytes;
        }
        tracing::debug!(
            plan = self.id,
            ops = self.ops.len(),
            output = %current,
            "fusion plan compiled"
        );
        self.compiled = Some(Compiled {
            output: current,
            data_bytes: self.input_layout.num_bytes(),
        });
        Ok(())
    }

    /// Workspace the compiled plan needs when its convolution uses
    /// `algorithm`.
    ///
    /// # Errors
    ///
    /// Returns [`DnnError::InvalidState`] before compile.
    pub fn workspace_size(&self, handle: &Handle, algorithm: ConvFwdAlgorithm) -> DnnResult<usize> {
        self.require_compiled("FusionPlan::workspace_size")?;
        handle
            .backend()
            .fusion_workspace_size(handle.raw(), self.raw, algorithm)
    }

    fn require_compiled(&self, op: &'static str) -> DnnResult<&Compiled> {
        self.compiled
            .as_ref()
            .ok_or_else(|| DnnError::invalid_state(op, "plan has not been compiled"))
    }

    /// Run the compiled chain from `input` to `output`.
    ///
    /// # Errors
    ///
    /// - [`DnnError::InvalidState`] before compile
    /// - [`DnnError::BadParam`] if `args` belong to another plan, miss an
    ///   operator, or the tensors do not match the compiled shapes
    /// - [`DnnError::InvalidValue`] for undersized buffers
    pub fn execute(
        &self,
        handle: &Handle,
        in_desc: &TensorDescriptor,
        input: &dyn DeviceMemory,
        out_desc: &TensorDescriptor,
        output: &dyn DeviceMemory,
        args: &OperatorArgs<'_>,
    ) -> DnnResult<()> {
        const OP: &str = "FusionPlan::execute";
        let compiled = self.require_compiled(OP)?;
        if args.plan_id() != self.id {
            return Err(DnnError::bad_param(
                OP,
                "operator arguments were built for another plan",
            ));
        }
        for record in &self.ops {
            let required = |role: BufferRole| match role {
                BufferRole::Param => record.param_bytes,
                BufferRole::Data => compiled.data_bytes,
            };
            args.check_binding(OP, record.op, required)?;
        }

        let il = in_desc.require_layout(OP)?;
        if il.dims != self.input_layout.dims || il.data_type != self.input_layout.data_type {
            return Err(DnnError::bad_param(
                OP,
                format!("input {il} differs from the planned {}", self.input_layout),
            ));
        }
        let ol = out_desc.require_layout(OP)?;
        if ol.dims != compiled.output.dims || ol.data_type != compiled.output.data_type {
            return Err(DnnError::bad_param(
                OP,
                format!("output {ol} differs from the compiled {}", compiled.output),
            ));
        }
        let input = in_desc.arg(input, "input", OP)?;
        let output = out_desc.arg(output, "output", OP)?;
        tracing::trace!(plan = self.id, "executing fusion plan");
        handle
            .backend()
            .execute_fusion_plan(handle.raw(), self.raw, input, output, args.raw())?;
        self.executions.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Input descriptor the plan was created over.
    #[must_use]
    pub fn input(&self) -> &TensorDescriptor {
        &self.input
    }

    pub(crate) const fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub(crate) fn data_type(&self) -> DataType {
        self.input_layout.data_type
    }
}

/// Output layout and parameter-buffer bytes of one operator fed `input`.
fn infer_op(
    op: &'static str,
    detail: &OpDetail,
    input: &TensorLayout,
) -> DnnResult<(TensorLayout, usize)> {
    match detail {
        OpDetail::Conv { conv, weights } => {
            let wl = weights.require_layout(op)?;
            if wl.data_type != input.data_type {
                return Err(DnnError::bad_param(
                    op,
                    format!("filter {wl} does not match input {input}"),
                ));
            }
            let dims = conv.params().output_dims(&input.dims, &wl.dims)?;
            Ok((TensorLayout::packed(input.data_type, &dims)?, wl.num_bytes()))
        }
        OpDetail::Bias { bias } => {
            let bl = bias.require_layout(op)?;
            let per_channel = bl.rank() == input.rank()
                && input.rank() >= 2
                && bl.dims[1] == input.dims[1]
                && bl.dims.iter().enumerate().all(|(i, &d)| i == 1 || d == 1);
            if !per_channel || bl.data_type != input.data_type {
                return Err(DnnError::bad_param(
                    op,
                    format!("bias {bl} is not a per-channel vector for {input}"),
                ));
            }
            Ok((input.clone(), bl.num_bytes()))
        }
        OpDetail::Activation => Ok((input.clone(), 0)),
        OpDetail::BatchNorm { mode, params } => {
            if !(4..=5).contains(&input.rank()) {
                return Err(DnnError::bad_param(
                    op,
                    format!("batch normalization needs a rank 4 or 5 input, got {input}"),
                ));
            }
            let expected = param_layout(*mode, input)?;
            if let Some(params) = params {
                let pl = params.require_layout(op)?;
                if pl.dims != expected.dims {
                    return Err(DnnError::bad_param(
                        op,
                        format!("{pl} is not the {mode} parameter shape of {input}"),
                    ));
                }
                return Ok((input.clone(), pl.num_bytes()));
            }
            Ok((input.clone(), expected.num_bytes()))
        }
    }
}

impl Drop for FusionPlan {
    fn drop(&mut self) {
        if let Err(err) = self.runtime.backend().destroy_fusion_plan(self.raw) {
            tracing::warn!(plan = self.id, "failed to destroy fusion plan: {err}");
        }
    }
}

impl fmt::Debug for FusionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FusionPlan")
            .field("id", &self.id)
            .field("raw", &self.raw)
            .field("state", &self.state())
            .field("ops", &self.ops.iter().map(|r| r.op.kind).collect::<Vec<_>>())
            .field("conv_algorithm", &self.conv_algorithm)
            .finish()
    }
}

/// The convolution operator of a plan, borrowed from it.
///
/// Algorithm queries and pinning are only reachable through this handle, so
/// they always refer to a convolution that exists in the plan.
pub struct ConvForwardOp<'p> {
    plan: &'p mut FusionPlan,
    op: FusionOp,
}

impl ConvForwardOp<'_> {
    /// The operator, for binding arguments.
    #[must_use]
    pub const fn op(&self) -> FusionOp {
        self.op
    }

    /// Algorithms the fused convolution may use, best first, up to the
    /// configured request count.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub fn algorithms(&self) -> DnnResult<Vec<ConvFwdAlgorithm>> {
        let count = self.plan.runtime.config().find.request_count;
        self.plan
            .runtime
            .backend()
            .fusion_conv_algorithms(self.plan.raw, count)
    }

    /// Pin the fused convolution's algorithm.
    ///
    /// # Errors
    ///
    /// Returns [`DnnError::BadParam`] if the backend cannot run the
    /// convolution with `algorithm`.
    pub fn set_algorithm(&mut self, algorithm: ConvFwdAlgorithm) -> DnnResult<()> {
        self.plan
            .runtime
            .backend()
            .fusion_set_conv_algorithm(self.plan.raw, algorithm)?;
        self.plan.conv_algorithm = Some(algorithm);
        Ok(())
    }
}

impl fmt::Debug for ConvForwardOp<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConvForwardOp")
            .field("plan", &self.plan.id)
            .field("op", &self.op)
            .finish()
    }
}

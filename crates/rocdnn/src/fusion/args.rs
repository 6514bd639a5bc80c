//! Runtime arguments of a fusion plan.

use super::plan::{FusionOp, FusionOpKind, FusionPlan};
use crate::backend::{ActivationCoefficients, OpBinding, RawArgs};
use crate::batchnorm::{check_epsilon, TrainingOutputs};
use crate::memory::{ptr_or_null, DeviceMemory};
use crate::runtime::Runtime;
use crate::scalar::Scalar;
use crate::types::DataType;
use crate::{DnnError, DnnResult};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::fmt;
use std::marker::PhantomData;

/// What a bound buffer must be sized like.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BufferRole {
    /// The operator's parameter shape (filter, bias, per-channel vector).
    Param,
    /// The plan's input shape.
    Data,
}

#[derive(Clone, Copy, Debug)]
struct BoundBuffer {
    what: &'static str,
    role: BufferRole,
    bytes: usize,
}

#[derive(Debug)]
struct Binding {
    kind: FusionOpKind,
    buffers: SmallVec<[BoundBuffer; 8]>,
}

/// Scalars and buffers for every operator of one [`FusionPlan`].
///
/// Bound buffers are borrowed for `'a`, so they outlive every execution
/// that uses these arguments. Binding an operator twice replaces the
/// earlier binding.
pub struct OperatorArgs<'a> {
    runtime: Runtime,
    raw: RawArgs,
    plan_id: u64,
    data_type: DataType,
    bindings: FxHashMap<usize, Binding>,
    _buffers: PhantomData<&'a dyn DeviceMemory>,
}

impl<'a> OperatorArgs<'a> {
    /// Create an empty argument table for `plan`.
    ///
    /// # Errors
    ///
    /// Returns [`DnnError::AllocationFailed`] if the backend cannot create
    /// the table.
    pub fn new(plan: &FusionPlan) -> DnnResult<Self> {
        let runtime = plan.runtime().clone();
        let raw = runtime.backend().create_operator_args()?;
        Ok(Self {
            runtime,
            raw,
            plan_id: plan.id(),
            data_type: plan.data_type(),
            bindings: FxHashMap::default(),
            _buffers: PhantomData,
        })
    }

    /// Number of operators bound so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Whether nothing is bound yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub(crate) const fn plan_id(&self) -> u64 {
        self.plan_id
    }

    pub(crate) const fn raw(&self) -> RawArgs {
        self.raw
    }

    fn scalar(&self, value: f64, op: &'static str) -> DnnResult<Scalar> {
        Scalar::for_data_type(self.data_type, value)
            .map_err(|err| DnnError::not_implemented(op, err.to_string()))
    }

    fn bind(
        &mut self,
        op_name: &'static str,
        op: FusionOp,
        expected: FusionOpKind,
        binding: &OpBinding,
        buffers: SmallVec<[BoundBuffer; 8]>,
    ) -> DnnResult<()> {
        if op.plan_id != self.plan_id {
            return Err(DnnError::bad_param(
                op_name,
                "operator belongs to another plan",
            ));
        }
        if op.kind != expected {
            return Err(DnnError::bad_param(
                op_name,
                format!("operator {} is a {}, not a {expected}", op.index, op.kind),
            ));
        }
        self.runtime
            .backend()
            .set_operator_args(self.raw, op.raw, binding)?;
        self.bindings.insert(
            op.index,
            Binding {
                kind: op.kind,
                buffers,
            },
        );
        Ok(())
    }

    /// Check `op` is bound and every bound buffer holds `required(role)`
    /// bytes.
    pub(crate) fn check_binding(
        &self,
        op_name: &'static str,
        op: FusionOp,
        required: impl Fn(BufferRole) -> usize,
    ) -> DnnResult<()> {
        let binding = self.bindings.get(&op.index).ok_or_else(|| {
            DnnError::bad_param(
                op_name,
                format!("no arguments bound for operator {} ({})", op.index, op.kind),
            )
        })?;
        debug_assert_eq!(binding.kind, op.kind);
        for buffer in &binding.buffers {
            let needed = required(buffer.role);
            if buffer.bytes < needed {
                return Err(DnnError::invalid_value(
                    op_name,
                    format!(
                        "{} buffer of operator {} holds {} bytes, {needed} required",
                        buffer.what, op.index, buffer.bytes
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Bind a convolution's filter.
    ///
    /// # Errors
    ///
    /// Returns [`DnnError::BadParam`] if `op` is not a convolution of this
    /// plan.
    pub fn set_conv_forward(
        &mut self,
        op: FusionOp,
        alpha: f64,
        beta: f64,
        weights: &'a dyn DeviceMemory,
    ) -> DnnResult<()> {
        const OP: &str = "OperatorArgs::set_conv_forward";
        let binding = OpBinding::ConvForward {
            alpha: self.scalar(alpha, OP)?,
            beta: self.scalar(beta, OP)?,
            weights: weights.device_ptr(),
        };
        let buffers = SmallVec::from_iter([param("weights", weights)]);
        self.bind(OP, op, FusionOpKind::ConvForward, &binding, buffers)
    }

    /// Bind a channel bias.
    ///
    /// # Errors
    ///
    /// Returns [`DnnError::BadParam`] if `op` is not a bias of this plan.
    pub fn set_bias_forward(
        &mut self,
        op: FusionOp,
        alpha: f64,
        beta: f64,
        bias: &'a dyn DeviceMemory,
    ) -> DnnResult<()> {
        const OP: &str = "OperatorArgs::set_bias_forward";
        let binding = OpBinding::BiasForward {
            alpha: self.scalar(alpha, OP)?,
            beta: self.scalar(beta, OP)?,
            bias: bias.device_ptr(),
        };
        let buffers = SmallVec::from_iter([param("bias", bias)]);
        self.bind(OP, op, FusionOpKind::BiasForward, &binding, buffers)
    }

    /// Bind a forward activation's coefficients.
    ///
    /// # Errors
    ///
    /// Returns [`DnnError::BadParam`] if `op` is not a forward activation of
    /// this plan.
    pub fn set_activation_forward(
        &mut self,
        op: FusionOp,
        alpha: f64,
        beta: f64,
        coefficients: ActivationCoefficients,
    ) -> DnnResult<()> {
        const OP: &str = "OperatorArgs::set_activation_forward";
        let binding = OpBinding::ActivationForward {
            alpha: self.scalar(alpha, OP)?,
            beta: self.scalar(beta, OP)?,
            coefficients,
        };
        self.bind(OP, op, FusionOpKind::ActivationForward, &binding, SmallVec::new())
    }

    /// Bind an activation gradient: the forward output `y` and coefficients.
    ///
    /// # Errors
    ///
    /// Returns [`DnnError::BadParam`] if `op` is not an activation gradient
    /// of this plan.
    pub fn set_activation_backward(
        &mut self,
        op: FusionOp,
        alpha: f64,
        beta: f64,
        y: &'a dyn DeviceMemory,
        coefficients: ActivationCoefficients,
    ) -> DnnResult<()> {
        const OP: &str = "OperatorArgs::set_activation_backward";
        let binding = OpBinding::ActivationBackward {
            alpha: self.scalar(alpha, OP)?,
            beta: self.scalar(beta, OP)?,
            y: y.device_ptr(),
            coefficients,
        };
        let buffers = SmallVec::from_iter([data("y", y)]);
        self.bind(OP, op, FusionOpKind::ActivationBackward, &binding, buffers)
    }

    /// Bind batch-norm inference statistics.
    ///
    /// # Errors
    ///
    /// Returns [`DnnError::BadParam`] if `op` is not a batch-norm inference
    /// of this plan or `epsilon` is below the library floor.
    #[allow(clippy::too_many_arguments)]
    pub fn set_batch_norm_inference(
        &mut self,
        op: FusionOp,
        alpha: f64,
        beta: f64,
        scale: &'a dyn DeviceMemory,
        bias: &'a dyn DeviceMemory,
        mean: &'a dyn DeviceMemory,
        variance: &'a dyn DeviceMemory,
        epsilon: f64,
    ) -> DnnResult<()> {
        const OP: &str = "OperatorArgs::set_batch_norm_inference";
        check_epsilon(OP, epsilon)?;
        let binding = OpBinding::BatchNormInference {
            alpha: self.scalar(alpha, OP)?,
            beta: self.scalar(beta, OP)?,
            scale: scale.device_ptr(),
            bias: bias.device_ptr(),
            mean: mean.device_ptr(),
            variance: variance.device_ptr(),
            epsilon,
        };
        let buffers = SmallVec::from_iter([
            param("scale", scale),
            param("bias", bias),
            param("mean", mean),
            param("variance", variance),
        ]);
        self.bind(OP, op, FusionOpKind::BatchNormInference, &binding, buffers)
    }

    /// Bind batch-norm training parameters and optional statistics outputs.
    ///
    /// # Errors
    ///
    /// Returns [`DnnError::BadParam`] if `op` is not a batch-norm training
    /// operator of this plan, `epsilon` is below the library floor, or
    /// `factor` is outside `[0, 1]`.
    #[allow(clippy::too_many_arguments)]
    pub fn set_batch_norm_forward(
        &mut self,
        op: FusionOp,
        alpha: f64,
        beta: f64,
        scale: &'a dyn DeviceMemory,
        bias: &'a dyn DeviceMemory,
        factor: f64,
        epsilon: f64,
        outputs: TrainingOutputs<'a>,
    ) -> DnnResult<()> {
        const OP: &str = "OperatorArgs::set_batch_norm_forward";
        check_epsilon(OP, epsilon)?;
        if !(0.0..=1.0).contains(&factor) {
            return Err(DnnError::bad_param(
                OP,
                format!("averaging factor {factor} outside [0, 1]"),
            ));
        }
        let binding = OpBinding::BatchNormForward {
            alpha: self.scalar(alpha, OP)?,
            beta: self.scalar(beta, OP)?,
            scale: scale.device_ptr(),
            bias: bias.device_ptr(),
            saved_mean: ptr_or_null(outputs.save_mean),
            saved_inv_variance: ptr_or_null(outputs.save_inv_variance),
            running_mean: ptr_or_null(outputs.running_mean),
            running_variance: ptr_or_null(outputs.running_variance),
            factor,
            epsilon,
        };
        let mut buffers = SmallVec::from_iter([param("scale", scale), param("bias", bias)]);
        let optional = [
            ("saved mean", outputs.save_mean),
            ("saved inverse variance", outputs.save_inv_variance),
            ("running mean", outputs.running_mean),
            ("running variance", outputs.running_variance),
        ];
        buffers.extend(
            optional
                .into_iter()
                .filter_map(|(what, mem)| mem.map(|mem| param(what, mem))),
        );
        self.bind(OP, op, FusionOpKind::BatchNormForward, &binding, buffers)
    }

    /// Bind a batch-norm gradient.
    ///
    /// Without saved statistics the backend recomputes them from `x`.
    ///
    /// # Errors
    ///
    /// Returns [`DnnError::BadParam`] if `op` is not a batch-norm gradient
    /// of this plan.
    #[allow(clippy::too_many_arguments)]
    pub fn set_batch_norm_backward(
        &mut self,
        op: FusionOp,
        alpha: f64,
        beta: f64,
        x: &'a dyn DeviceMemory,
        scale: &'a dyn DeviceMemory,
        bias: &'a dyn DeviceMemory,
        scale_diff: &'a dyn DeviceMemory,
        bias_diff: &'a dyn DeviceMemory,
        saved_mean: Option<&'a dyn DeviceMemory>,
        saved_inv_variance: Option<&'a dyn DeviceMemory>,
    ) -> DnnResult<()> {
        const OP: &str = "OperatorArgs::set_batch_norm_backward";
        let binding = OpBinding::BatchNormBackward {
            alpha: self.scalar(alpha, OP)?,
            beta: self.scalar(beta, OP)?,
            x: x.device_ptr(),
            scale: scale.device_ptr(),
            bias: bias.device_ptr(),
            scale_diff: scale_diff.device_ptr(),
            bias_diff: bias_diff.device_ptr(),
            saved_mean: ptr_or_null(saved_mean),
            saved_inv_variance: ptr_or_null(saved_inv_variance),
        };
        let mut buffers = SmallVec::from_iter([
            data("x", x),
            param("scale", scale),
            param("bias", bias),
            param("scale gradient", scale_diff),
            param("bias gradient", bias_diff),
        ]);
        if let (Some(mean), Some(inv)) = (saved_mean, saved_inv_variance) {
            buffers.push(param("saved mean", mean));
            buffers.push(param("saved inverse variance", inv));
        }
        self.bind(OP, op, FusionOpKind::BatchNormBackward, &binding, buffers)
    }
}

fn param(what: &'static str, mem: &dyn DeviceMemory) -> BoundBuffer {
    BoundBuffer {
        what,
        role: BufferRole::Param,
        bytes: mem.size_bytes(),
    }
}

fn data(what: &'static str, mem: &dyn DeviceMemory) -> BoundBuffer {
    BoundBuffer {
        what,
        role: BufferRole::Data,
        bytes: mem.size_bytes(),
    }
}

impl Drop for OperatorArgs<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.runtime.backend().destroy_operator_args(self.raw) {
            tracing::warn!(args = self.raw.as_raw(), "failed to destroy operator args: {err}");
        }
    }
}

impl fmt::Debug for OperatorArgs<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperatorArgs")
            .field("plan", &self.plan_id)
            .field("raw", &self.raw)
            .field("bound", &self.bindings.len())
            .finish()
    }
}

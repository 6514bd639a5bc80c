//! Recurrent network descriptors and memory sizing.
//!
//! Sequence inputs are described by one tensor descriptor per time step,
//! each `[batch, input_size]`. Batch sizes may shrink from one step to the
//! next but never grow; the input size is the same for every step.

use crate::backend::{DescriptorConfig, DescriptorKind, RawDescriptor};
use crate::handle::Handle;
use crate::runtime::{OwnedDescriptor, Runtime};
use crate::tensor::TensorDescriptor;
use crate::types::{DataType, RnnAlgorithm, RnnBiasMode, RnnDirection, RnnInputMode, RnnMode};
use crate::{DnnError, DnnResult};
use std::fmt;
use std::sync::Arc;

/// Configuration of a stacked recurrent network.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RnnParams {
    /// Hidden state size.
    pub hidden_size: i32,
    /// Number of stacked layers.
    pub layers: i32,
    /// First-layer input handling.
    pub input_mode: RnnInputMode,
    /// Uni- or bidirectional.
    pub direction: RnnDirection,
    /// Cell type.
    pub mode: RnnMode,
    /// Whether biases are present.
    pub bias_mode: RnnBiasMode,
    /// Algorithm.
    pub algorithm: RnnAlgorithm,
    /// Element type of weights and activations.
    pub data_type: DataType,
}

impl RnnParams {
    /// A unidirectional, biased, linear-input network.
    #[must_use]
    pub const fn new(mode: RnnMode, hidden_size: i32, layers: i32) -> Self {
        Self {
            hidden_size,
            layers,
            input_mode: RnnInputMode::Linear,
            direction: RnnDirection::Unidirectional,
            mode,
            bias_mode: RnnBiasMode::WithBias,
            algorithm: RnnAlgorithm::Default,
            data_type: DataType::Float32,
        }
    }

    fn validate(&self) -> DnnResult<()> {
        const OP: &str = "RnnParams::validate";
        if self.hidden_size < 1 || self.layers < 1 {
            return Err(DnnError::invalid_value(
                OP,
                format!(
                    "hidden size {} and layer count {} must be >= 1",
                    self.hidden_size, self.layers
                ),
            ));
        }
        if !self.data_type.is_floating_point() {
            return Err(DnnError::invalid_value(
                OP,
                format!("recurrent networks need a floating-point type, got {}", self.data_type),
            ));
        }
        Ok(())
    }
}

struct RnnInner {
    owned: OwnedDescriptor,
    params: RnnParams,
}

/// A reference-counted RNN descriptor.
#[derive(Clone)]
pub struct RnnDescriptor {
    inner: Arc<RnnInner>,
}

impl RnnDescriptor {
    /// Create a descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`DnnError::InvalidValue`] for non-positive sizes or an
    /// integer data type, [`DnnError::AllocationFailed`] if the backend
    /// cannot create it.
    pub fn new(runtime: &Runtime, params: RnnParams) -> DnnResult<Self> {
        params.validate()?;
        let owned = OwnedDescriptor::create(runtime, DescriptorKind::Rnn)?;
        owned
            .backend()
            .set_descriptor(owned.raw(), &DescriptorConfig::Rnn(params))?;
        Ok(Self {
            inner: Arc::new(RnnInner { owned, params }),
        })
    }

    /// Parameters the descriptor was created with.
    #[must_use]
    pub fn params(&self) -> RnnParams {
        self.inner.params
    }

    /// Read the parameters back from the backend.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub fn get(&self) -> DnnResult<RnnParams> {
        match self
            .inner
            .owned
            .backend()
            .get_descriptor(self.raw(), DescriptorKind::Rnn, 0)?
        {
            DescriptorConfig::Rnn(params) => Ok(params),
            other => Err(DnnError::internal(
                "RnnDescriptor::get",
                format!("backend returned a {:?} descriptor", other.kind()),
            )),
        }
    }

    fn sequence(
        &self,
        op: &'static str,
        sequence_len: usize,
        xs: &[TensorDescriptor],
    ) -> DnnResult<Vec<RawDescriptor>> {
        if xs.len() != sequence_len || sequence_len == 0 {
            return Err(DnnError::invalid_value(
                op,
                format!("{} step descriptors for a sequence of {sequence_len}", xs.len()),
            ));
        }
        let mut previous: Option<(i32, i32)> = None;
        for (step, x) in xs.iter().enumerate() {
            let layout = x.require_layout(op)?;
            if layout.rank() != 2 {
                return Err(DnnError::bad_param(
                    op,
                    format!("step {step} input {layout} is not [batch, input_size]"),
                ));
            }
            let (batch, input) = (layout.dims[0], layout.dims[1]);
            if let Some((prev_batch, prev_input)) = previous {
                if batch > prev_batch || input != prev_input {
                    return Err(DnnError::bad_param(
                        op,
                        format!(
                            "step {step} input {layout} follows [{prev_batch}, {prev_input}]: \
                             batch may only shrink and input size must not change"
                        ),
                    ));
                }
            }
            previous = Some((batch, input));
        }
        Ok(xs.iter().map(TensorDescriptor::raw).collect())
    }

    /// Workspace an inference pass over `xs` needs.
    ///
    /// # Errors
    ///
    /// Returns [`DnnError::InvalidValue`] if `xs.len() != sequence_len` and
    /// [`DnnError::BadParam`] for inconsistent step descriptors.
    pub fn workspace_size(
        &self,
        handle: &Handle,
        sequence_len: usize,
        xs: &[TensorDescriptor],
    ) -> DnnResult<usize> {
        let raws = self.sequence("RnnDescriptor::workspace_size", sequence_len, xs)?;
        handle
            .backend()
            .rnn_workspace_size(handle.raw(), self.raw(), &raws)
    }

    /// Reserve space a training pass over `xs` needs.
    ///
    /// # Errors
    ///
    /// Same as [`workspace_size`](Self::workspace_size).
    pub fn training_reserve_size(
        &self,
        handle: &Handle,
        sequence_len: usize,
        xs: &[TensorDescriptor],
    ) -> DnnResult<usize> {
        let raws = self.sequence("RnnDescriptor::training_reserve_size", sequence_len, xs)?;
        handle
            .backend()
            .rnn_training_reserve_size(handle.raw(), self.raw(), &raws)
    }

    /// Bytes of all weights and biases for inputs shaped like `x`.
    ///
    /// # Errors
    ///
    /// Returns [`DnnError::BadParam`] if `x` is not `[batch, input_size]`.
    pub fn params_size(
        &self,
        handle: &Handle,
        x: &TensorDescriptor,
        data_type: DataType,
    ) -> DnnResult<usize> {
        let raws = self.sequence("RnnDescriptor::params_size", 1, std::slice::from_ref(x))?;
        handle
            .backend()
            .rnn_params_size(handle.raw(), self.raw(), raws[0], data_type)
    }

    /// Backend id.
    #[must_use]
    pub fn raw(&self) -> RawDescriptor {
        self.inner.owned.raw()
    }
}

impl fmt::Debug for RnnDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RnnDescriptor")
            .field("raw", &self.raw())
            .field("params", &self.inner.params)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn steps(rt: &Runtime, shapes: &[[i32; 2]]) -> Vec<TensorDescriptor> {
        shapes
            .iter()
            .map(|s| TensorDescriptor::with_shape(rt, DataType::Float32, s).unwrap())
            .collect()
    }

    #[test]
    fn test_params_roundtrip() {
        let rt = Runtime::reference();
        let params = RnnParams {
            direction: RnnDirection::Bidirectional,
            ..RnnParams::new(RnnMode::Gru, 16, 2)
        };
        let rnn = RnnDescriptor::new(&rt, params).unwrap();
        assert_eq!(rnn.get().unwrap(), params);
    }

    #[test]
    fn test_rejects_integer_type() {
        let rt = Runtime::reference();
        let params = RnnParams {
            data_type: DataType::Int8,
            ..RnnParams::new(RnnMode::Lstm, 8, 1)
        };
        assert!(matches!(
            RnnDescriptor::new(&rt, params),
            Err(DnnError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_sequence_length_must_match() {
        let rt = Runtime::reference();
        let handle = Handle::new(&rt);
        let rnn = RnnDescriptor::new(&rt, RnnParams::new(RnnMode::Lstm, 8, 1)).unwrap();
        let xs = steps(&rt, &[[4, 10], [4, 10]]);
        assert!(matches!(
            rnn.workspace_size(&handle, 3, &xs),
            Err(DnnError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_batch_may_only_shrink() {
        let rt = Runtime::reference();
        let handle = Handle::new(&rt);
        let rnn = RnnDescriptor::new(&rt, RnnParams::new(RnnMode::Tanh, 8, 1)).unwrap();
        let growing = steps(&rt, &[[2, 10], [4, 10]]);
        assert!(matches!(
            rnn.training_reserve_size(&handle, 2, &growing),
            Err(DnnError::BadParam { .. })
        ));
        let shrinking = steps(&rt, &[[4, 10], [2, 10]]);
        let ws = rnn.workspace_size(&handle, 2, &shrinking).unwrap();
        let reserve = rnn.training_reserve_size(&handle, 2, &shrinking).unwrap();
        assert!(ws > 0);
        assert!(reserve >= ws);
    }

    #[test]
    fn test_params_size_lstm() {
        let rt = Runtime::reference();
        let handle = Handle::new(&rt);
        let rnn = RnnDescriptor::new(&rt, RnnParams::new(RnnMode::Lstm, 4, 1)).unwrap();
        let x = TensorDescriptor::with_shape(&rt, DataType::Float32, &[1, 3]).unwrap();
        // 4 gates x (4x3 input + 4x4 recurrent weights + 2x4 biases) floats.
        assert_eq!(
            rnn.params_size(&handle, &x, DataType::Float32).unwrap(),
            4 * (12 + 16 + 8) * 4
        );
    }
}

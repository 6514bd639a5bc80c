//! Batch normalization.
//!
//! Per-channel vectors (scale, bias, means, variances) share one descriptor
//! derived from the input with [`BatchNorm::derive_descriptor`]:
//!
//! | Input   | Spatial | Per-activation |
//! |---------|---------|----------------|
//! | `NCHW`  | `1C11`  | `1CHW`         |
//! | `NCDHW` | `1C111` | `1CDHW`        |
//!
//! Running statistics follow `running = factor * batch + (1 - factor) * running`.

use crate::activation::same_shape;
use crate::backend::{
    BatchNormBackwardArgs, BatchNormBackwardScales, BatchNormInferenceArgs, BatchNormTrainingArgs,
};
use crate::handle::Handle;
use crate::memory::{ensure_capacity, ptr_or_null, DeviceMemory};
use crate::tensor::{TensorDescriptor, TensorLayout, MAX_TENSOR_RANK};
use crate::types::{BatchNormMode, DataType};
use crate::{DnnError, DnnResult};
use smallvec::SmallVec;

/// Smallest epsilon the library accepts.
pub const MIN_EPSILON: f64 = 1e-5;

/// Batch-normalization passes in one statistics mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchNorm {
    mode: BatchNormMode,
}

/// Optional statistics written by [`BatchNorm::forward_training`].
#[derive(Clone, Copy, Default)]
pub struct TrainingOutputs<'a> {
    /// Running mean, blended in place.
    pub running_mean: Option<&'a dyn DeviceMemory>,
    /// Running variance, blended in place.
    pub running_variance: Option<&'a dyn DeviceMemory>,
    /// Batch mean for the backward pass.
    pub save_mean: Option<&'a dyn DeviceMemory>,
    /// Batch inverse standard deviation for the backward pass.
    pub save_inv_variance: Option<&'a dyn DeviceMemory>,
}

impl BatchNorm {
    /// Passes normalizing per `mode`.
    #[must_use]
    pub const fn new(mode: BatchNormMode) -> Self {
        Self { mode }
    }

    /// Statistics mode.
    #[must_use]
    pub const fn mode(self) -> BatchNormMode {
        self.mode
    }

    /// Create the descriptor of the per-channel vectors for input `x`.
    ///
    /// Half-precision inputs get single-precision statistics.
    ///
    /// # Errors
    ///
    /// Returns [`DnnError::BadParam`] unless `x` is set with rank 4 or 5.
    pub fn derive_descriptor(self, x: &TensorDescriptor) -> DnnResult<TensorDescriptor> {
        const OP: &str = "BatchNorm::derive_descriptor";
        let xl = x.require_layout(OP)?;
        if !(4..=5).contains(&xl.rank()) {
            return Err(DnnError::bad_param(
                OP,
                format!("batch normalization needs a rank 4 or 5 input, got {xl}"),
            ));
        }
        let derived = TensorDescriptor::new(x.runtime())?;
        x.runtime()
            .backend()
            .derive_batch_norm_descriptor(derived.raw(), x.raw(), self.mode)?;
        // Mirror the backend's layout on our side.
        derived.set_layout(derived.get_with_rank(xl.rank())?)?;
        Ok(derived)
    }

    fn check_params(
        self,
        op: &'static str,
        x: &TensorDescriptor,
        bn: &TensorDescriptor,
        epsilon: f64,
    ) -> DnnResult<usize> {
        let xl = x.require_layout(op)?;
        let bl = bn.require_layout(op)?;
        let expected_rank = xl.rank();
        let channel_ok = bl.rank() == expected_rank && bl.dims[0] == 1 && bl.dims[1] == xl.dims[1];
        let spatial_ok = bl.dims.iter().zip(&xl.dims).skip(2).all(|(&b, &x)| match self.mode {
            BatchNormMode::Spatial => b == 1,
            BatchNormMode::PerActivation => b == x,
        });
        if !(channel_ok && spatial_ok) {
            return Err(DnnError::bad_param(
                op,
                format!("{bl} is not the {} parameter shape of {xl}", self.mode),
            ));
        }
        check_epsilon(op, epsilon)?;
        Ok(bl.num_bytes())
    }

    /// `y = alpha * (scale * (x - mean) / sqrt(variance + epsilon) + bias) + beta * y`.
    ///
    /// Without `mean` and `variance` the batch statistics are used.
    ///
    /// # Errors
    ///
    /// Returns [`DnnError::BadParam`] on mismatched shapes or an epsilon
    /// below [`MIN_EPSILON`], plus the usual descriptor and capacity errors.
    #[allow(clippy::too_many_arguments)]
    pub fn forward_inference(
        self,
        handle: &Handle,
        alpha: f64,
        beta: f64,
        x_desc: &TensorDescriptor,
        x: &dyn DeviceMemory,
        y_desc: &TensorDescriptor,
        y: &dyn DeviceMemory,
        bn_desc: &TensorDescriptor,
        scale: &dyn DeviceMemory,
        bias: &dyn DeviceMemory,
        mean: Option<&dyn DeviceMemory>,
        variance: Option<&dyn DeviceMemory>,
        epsilon: f64,
    ) -> DnnResult<()> {
        const OP: &str = "BatchNorm::forward_inference";
        same_shape(OP, &[x_desc, y_desc])?;
        let bytes = self.check_params(OP, x_desc, bn_desc, epsilon)?;
        for (mem, what) in [(scale, "scale"), (bias, "bias")] {
            ensure_capacity(mem, bytes, what, OP)?;
        }
        for (mem, what) in [(mean, "mean"), (variance, "variance")] {
            if let Some(mem) = mem {
                ensure_capacity(mem, bytes, what, OP)?;
            }
        }
        let args = BatchNormInferenceArgs {
            desc: bn_desc.raw(),
            scale: scale.device_ptr(),
            bias: bias.device_ptr(),
            mean: ptr_or_null(mean),
            variance: ptr_or_null(variance),
            epsilon,
        };
        let alpha = y_desc.scalar(alpha, OP)?;
        let beta = y_desc.scalar(beta, OP)?;
        let x = x_desc.arg(x, "x", OP)?;
        let y = y_desc.arg(y, "y", OP)?;
        handle
            .backend()
            .batch_norm_inference(handle.raw(), self.mode, alpha, beta, x, y, &args)
    }

    /// Normalize with batch statistics, optionally updating running
    /// statistics and saving the batch statistics.
    ///
    /// # Errors
    ///
    /// Returns [`DnnError::BadParam`] on mismatched shapes, an epsilon below
    /// [`MIN_EPSILON`] or a factor outside `[0, 1]`, plus the usual
    /// descriptor and capacity errors.
    #[allow(clippy::too_many_arguments)]
    pub fn forward_training(
        self,
        handle: &Handle,
        alpha: f64,
        beta: f64,
        x_desc: &TensorDescriptor,
        x: &dyn DeviceMemory,
        y_desc: &TensorDescriptor,
        y: &dyn DeviceMemory,
        bn_desc: &TensorDescriptor,
        scale: &dyn DeviceMemory,
        bias: &dyn DeviceMemory,
        factor: f64,
        epsilon: f64,
        outputs: TrainingOutputs<'_>,
    ) -> DnnResult<()> {
        const OP: &str = "BatchNorm::forward_training";
        same_shape(OP, &[x_desc, y_desc])?;
        let bytes = self.check_params(OP, x_desc, bn_desc, epsilon)?;
        if !(0.0..=1.0).contains(&factor) {
            return Err(DnnError::bad_param(
                OP,
                format!("averaging factor {factor} outside [0, 1]"),
            ));
        }
        for (mem, what) in [(scale, "scale"), (bias, "bias")] {
            ensure_capacity(mem, bytes, what, OP)?;
        }
        let optional = [
            (outputs.running_mean, "running mean"),
            (outputs.running_variance, "running variance"),
            (outputs.save_mean, "saved mean"),
            (outputs.save_inv_variance, "saved inverse variance"),
        ];
        for (mem, what) in optional {
            if let Some(mem) = mem {
                ensure_capacity(mem, bytes, what, OP)?;
            }
        }
        let args = BatchNormTrainingArgs {
            desc: bn_desc.raw(),
            scale: scale.device_ptr(),
            bias: bias.device_ptr(),
            factor,
            running_mean: ptr_or_null(outputs.running_mean),
            running_variance: ptr_or_null(outputs.running_variance),
            save_mean: ptr_or_null(outputs.save_mean),
            save_inv_variance: ptr_or_null(outputs.save_inv_variance),
            epsilon,
        };
        let alpha = y_desc.scalar(alpha, OP)?;
        let beta = y_desc.scalar(beta, OP)?;
        let x = x_desc.arg(x, "x", OP)?;
        let y = y_desc.arg(y, "y", OP)?;
        handle
            .backend()
            .batch_norm_training(handle.raw(), self.mode, alpha, beta, x, y, &args)
    }

    /// Data gradient `dx` and parameter gradients `scale_diff`, `bias_diff`.
    ///
    /// `alpha_data`/`beta_data` blend `dx`; `alpha_param`/`beta_param` blend
    /// the parameter gradients. Without saved statistics they are
    /// recomputed from `x`.
    ///
    /// # Errors
    ///
    /// Returns [`DnnError::BadParam`] on mismatched shapes or an epsilon
    /// below [`MIN_EPSILON`], plus the usual descriptor and capacity errors.
    #[allow(clippy::too_many_arguments)]
    pub fn backward(
        self,
        handle: &Handle,
        alpha_data: f64,
        beta_data: f64,
        alpha_param: f64,
        beta_param: f64,
        x_desc: &TensorDescriptor,
        x: &dyn DeviceMemory,
        dy_desc: &TensorDescriptor,
        dy: &dyn DeviceMemory,
        dx_desc: &TensorDescriptor,
        dx: &dyn DeviceMemory,
        bn_desc: &TensorDescriptor,
        scale: &dyn DeviceMemory,
        scale_diff: &dyn DeviceMemory,
        bias_diff: &dyn DeviceMemory,
        epsilon: f64,
        saved_mean: Option<&dyn DeviceMemory>,
        saved_inv_variance: Option<&dyn DeviceMemory>,
    ) -> DnnResult<()> {
        const OP: &str = "BatchNorm::backward";
        same_shape(OP, &[x_desc, dy_desc, dx_desc])?;
        let bytes = self.check_params(OP, x_desc, bn_desc, epsilon)?;
        for (mem, what) in [
            (scale, "scale"),
            (scale_diff, "scale gradient"),
            (bias_diff, "bias gradient"),
        ] {
            ensure_capacity(mem, bytes, what, OP)?;
        }
        for (mem, what) in [
            (saved_mean, "saved mean"),
            (saved_inv_variance, "saved inverse variance"),
        ] {
            if let Some(mem) = mem {
                ensure_capacity(mem, bytes, what, OP)?;
            }
        }
        let params = BatchNormBackwardArgs {
            desc: bn_desc.raw(),
            scale: scale.device_ptr(),
            scale_diff: scale_diff.device_ptr(),
            bias_diff: bias_diff.device_ptr(),
            saved_mean: ptr_or_null(saved_mean),
            saved_inv_variance: ptr_or_null(saved_inv_variance),
            epsilon,
        };
        let scales = BatchNormBackwardScales {
            alpha_data: dx_desc.scalar(alpha_data, OP)?,
            beta_data: dx_desc.scalar(beta_data, OP)?,
            alpha_param: bn_desc.scalar(alpha_param, OP)?,
            beta_param: bn_desc.scalar(beta_param, OP)?,
        };
        let x = x_desc.arg(x, "x", OP)?;
        let dy = dy_desc.arg(dy, "dy", OP)?;
        let dx = dx_desc.arg(dx, "dx", OP)?;
        handle
            .backend()
            .batch_norm_backward(handle.raw(), self.mode, &scales, x, dy, dx, &params)
    }
}

/// Layout of the per-channel vectors of a batch norm over `x`.
///
/// Half-precision inputs get single-precision vectors.
pub(crate) fn param_layout(mode: BatchNormMode, x: &TensorLayout) -> DnnResult<TensorLayout> {
    let dims: SmallVec<[i32; MAX_TENSOR_RANK]> = x
        .dims
        .iter()
        .enumerate()
        .map(|(i, &d)| match mode {
            _ if i == 0 => 1,
            BatchNormMode::Spatial if i >= 2 => 1,
            _ => d,
        })
        .collect();
    let data_type = match x.data_type {
        DataType::Float16 => DataType::Float32,
        other => other,
    };
    TensorLayout::packed(data_type, &dims)
}

pub(crate) fn check_epsilon(op: &'static str, epsilon: f64) -> DnnResult<()> {
    if epsilon < MIN_EPSILON {
        return Err(DnnError::bad_param(
            op,
            format!("epsilon {epsilon} is below {MIN_EPSILON}"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::HostBuffer;
    use crate::runtime::Runtime;

    #[test]
    fn test_derive_descriptor() {
        let rt = Runtime::reference();
        let x = TensorDescriptor::with_shape(&rt, DataType::Float16, &[2, 3, 4, 5]).unwrap();

        let spatial = BatchNorm::new(BatchNormMode::Spatial)
            .derive_descriptor(&x)
            .unwrap();
        let layout = spatial.layout().unwrap();
        assert_eq!(layout.dims.as_slice(), &[1, 3, 1, 1]);
        assert_eq!(layout.data_type, DataType::Float32);

        let per_act = BatchNorm::new(BatchNormMode::PerActivation)
            .derive_descriptor(&x)
            .unwrap();
        assert_eq!(per_act.layout().unwrap().dims.as_slice(), &[1, 3, 4, 5]);
    }

    #[test]
    fn test_derive_rejects_rank() {
        let rt = Runtime::reference();
        let x = TensorDescriptor::with_shape(&rt, DataType::Float32, &[2, 3]).unwrap();
        assert!(matches!(
            BatchNorm::new(BatchNormMode::Spatial).derive_descriptor(&x),
            Err(DnnError::BadParam { .. })
        ));
    }

    #[test]
    fn test_inference_applies_statistics() {
        let rt = Runtime::reference();
        let handle = Handle::new(&rt);
        let bn = BatchNorm::new(BatchNormMode::Spatial);
        let x_desc = TensorDescriptor::with_shape(&rt, DataType::Float32, &[1, 2, 1, 2]).unwrap();
        let bn_desc = bn.derive_descriptor(&x_desc).unwrap();
        let x = HostBuffer::from_slice(&[1.0f32, 3.0, 10.0, 20.0]);
        let y = HostBuffer::<f32>::new(4);
        let scale = HostBuffer::from_slice(&[2.0f32, 1.0]);
        let bias = HostBuffer::from_slice(&[0.0f32, 1.0]);
        let mean = HostBuffer::from_slice(&[1.0f32, 10.0]);
        let variance = HostBuffer::from_slice(&[4.0f32, 1.0]);
        bn.forward_inference(
            &handle,
            1.0,
            0.0,
            &x_desc,
            &x,
            &x_desc,
            &y,
            &bn_desc,
            &scale,
            &bias,
            Some(&mean),
            Some(&variance),
            MIN_EPSILON,
        )
        .unwrap();
        let got = y.to_vec();
        let want = [0.0f32, 2.0, 1.0, 11.0];
        for (g, w) in got.iter().zip(want) {
            assert!((g - w).abs() < 1e-3, "{got:?}");
        }
    }

    #[test]
    fn test_training_normalizes_batch() {
        let rt = Runtime::reference();
        let handle = Handle::new(&rt);
        let bn = BatchNorm::new(BatchNormMode::Spatial);
        let x_desc = TensorDescriptor::with_shape(&rt, DataType::Float32, &[2, 1, 1, 1]).unwrap();
        let bn_desc = bn.derive_descriptor(&x_desc).unwrap();
        let x = HostBuffer::from_slice(&[1.0f32, 3.0]);
        let y = HostBuffer::<f32>::new(2);
        let scale = HostBuffer::from_slice(&[1.0f32]);
        let bias = HostBuffer::from_slice(&[0.0f32]);
        let running_mean = HostBuffer::from_slice(&[0.0f32]);
        let running_variance = HostBuffer::from_slice(&[1.0f32]);
        let save_mean = HostBuffer::<f32>::new(1);
        bn.forward_training(
            &handle,
            1.0,
            0.0,
            &x_desc,
            &x,
            &x_desc,
            &y,
            &bn_desc,
            &scale,
            &bias,
            0.5,
            MIN_EPSILON,
            TrainingOutputs {
                running_mean: Some(&running_mean),
                running_variance: Some(&running_variance),
                save_mean: Some(&save_mean),
                save_inv_variance: None,
            },
        )
        .unwrap();
        let got = y.to_vec();
        assert!((got[0] + 1.0).abs() < 1e-3 && (got[1] - 1.0).abs() < 1e-3);
        assert_eq!(save_mean.to_vec(), vec![2.0]);
        assert_eq!(running_mean.to_vec(), vec![1.0]);
    }

    #[test]
    fn test_epsilon_floor() {
        let rt = Runtime::reference();
        let handle = Handle::new(&rt);
        let bn = BatchNorm::new(BatchNormMode::Spatial);
        let x_desc = TensorDescriptor::with_shape(&rt, DataType::Float32, &[1, 1, 1, 1]).unwrap();
        let bn_desc = bn.derive_descriptor(&x_desc).unwrap();
        let buf = HostBuffer::<f32>::new(1);
        let err = bn
            .forward_inference(
                &handle, 1.0, 0.0, &x_desc, &buf, &x_desc, &buf, &bn_desc, &buf, &buf, None, None,
                0.0,
            )
            .unwrap_err();
        assert!(matches!(err, DnnError::BadParam { .. }));
    }
}

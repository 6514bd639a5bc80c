//! Activation descriptors and passes.
//!
//! | Mode          | `f(x)`                               |
//! |---------------|--------------------------------------|
//! | `PassThrough` | `x`                                  |
//! | `Logistic`    | `1 / (1 + e^-x)`                     |
//! | `Tanh`        | `beta * tanh(alpha * x)`             |
//! | `Relu`        | `max(0, x)`                          |
//! | `SoftRelu`    | `ln(1 + e^x)`                        |
//! | `Abs`         | `abs(x)`                             |
//! | `Power`       | `(alpha + beta * x)^gamma`           |
//! | `ClippedRelu` | `min(alpha, max(0, x))`              |
//! | `LeakyRelu`   | `x` if positive, else `alpha * x`    |
//! | `Elu`         | `x` if positive, else `alpha(e^x-1)` |

use crate::backend::{DescriptorConfig, DescriptorKind, RawDescriptor};
use crate::handle::Handle;
use crate::memory::DeviceMemory;
use crate::runtime::{OwnedDescriptor, Runtime};
use crate::tensor::TensorDescriptor;
use crate::types::ActivationMode;
use crate::{DnnError, DnnResult};
use std::fmt;
use std::sync::Arc;

/// An activation function and its coefficients.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ActivationParams {
    /// Function.
    pub mode: ActivationMode,
    /// First coefficient.
    pub alpha: f64,
    /// Second coefficient.
    pub beta: f64,
    /// Third coefficient.
    pub gamma: f64,
}

impl ActivationParams {
    /// A function with all coefficients at their neutral values.
    #[must_use]
    pub const fn new(mode: ActivationMode) -> Self {
        Self {
            mode,
            alpha: 1.0,
            beta: 1.0,
            gamma: 1.0,
        }
    }

    /// Set the coefficients.
    #[must_use]
    pub const fn with_coefficients(mut self, alpha: f64, beta: f64, gamma: f64) -> Self {
        self.alpha = alpha;
        self.beta = beta;
        self.gamma = gamma;
        self
    }
}

impl Default for ActivationParams {
    fn default() -> Self {
        Self::new(ActivationMode::Relu)
    }
}

struct ActivationInner {
    owned: OwnedDescriptor,
    params: ActivationParams,
}

/// A reference-counted, immutable activation descriptor.
#[derive(Clone)]
pub struct ActivationDescriptor {
    inner: Arc<ActivationInner>,
}

impl ActivationDescriptor {
    /// Create a descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`DnnError::AllocationFailed`] if the backend cannot create
    /// the descriptor.
    pub fn new(runtime: &Runtime, params: ActivationParams) -> DnnResult<Self> {
        let owned = OwnedDescriptor::create(runtime, DescriptorKind::Activation)?;
        owned
            .backend()
            .set_descriptor(owned.raw(), &DescriptorConfig::Activation(params))?;
        Ok(Self {
            inner: Arc::new(ActivationInner { owned, params }),
        })
    }

    /// Parameters the descriptor was created with.
    #[must_use]
    pub fn params(&self) -> ActivationParams {
        self.inner.params
    }

    /// Read the parameters back from the backend.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub fn get(&self) -> DnnResult<ActivationParams> {
        match self
            .inner
            .owned
            .backend()
            .get_descriptor(self.raw(), DescriptorKind::Activation, 0)?
        {
            DescriptorConfig::Activation(params) => Ok(params),
            other => Err(DnnError::internal(
                "ActivationDescriptor::get",
                format!("backend returned a {:?} descriptor", other.kind()),
            )),
        }
    }

    /// `y = alpha * f(x) + beta * y`.
    ///
    /// # Errors
    ///
    /// Returns [`DnnError::BadParam`] if the shapes differ, plus the usual
    /// descriptor and capacity errors.
    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        handle: &Handle,
        alpha: f64,
        x_desc: &TensorDescriptor,
        x: &dyn DeviceMemory,
        beta: f64,
        y_desc: &TensorDescriptor,
        y: &dyn DeviceMemory,
    ) -> DnnResult<()> {
        const OP: &str = "ActivationDescriptor::forward";
        same_shape(OP, &[x_desc, y_desc])?;
        let alpha = y_desc.scalar(alpha, OP)?;
        let beta = y_desc.scalar(beta, OP)?;
        let x = x_desc.arg(x, "x", OP)?;
        let y = y_desc.arg(y, "y", OP)?;
        handle
            .backend()
            .activation_forward(handle.raw(), self.raw(), alpha, x, beta, y)
    }

    /// `dx = alpha * f'(x) * dy + beta * dx`.
    ///
    /// # Errors
    ///
    /// Returns [`DnnError::BadParam`] if the shapes differ, plus the usual
    /// descriptor and capacity errors.
    #[allow(clippy::too_many_arguments)]
    pub fn backward(
        &self,
        handle: &Handle,
        alpha: f64,
        y_desc: &TensorDescriptor,
        y: &dyn DeviceMemory,
        dy_desc: &TensorDescriptor,
        dy: &dyn DeviceMemory,
        x_desc: &TensorDescriptor,
        x: &dyn DeviceMemory,
        beta: f64,
        dx_desc: &TensorDescriptor,
        dx: &dyn DeviceMemory,
    ) -> DnnResult<()> {
        const OP: &str = "ActivationDescriptor::backward";
        same_shape(OP, &[y_desc, dy_desc, x_desc, dx_desc])?;
        let alpha = dx_desc.scalar(alpha, OP)?;
        let beta = dx_desc.scalar(beta, OP)?;
        let y = y_desc.arg(y, "y", OP)?;
        let dy = dy_desc.arg(dy, "dy", OP)?;
        let x = x_desc.arg(x, "x", OP)?;
        let dx = dx_desc.arg(dx, "dx", OP)?;
        handle
            .backend()
            .activation_backward(handle.raw(), self.raw(), alpha, y, dy, x, beta, dx)
    }

    /// Backend id.
    #[must_use]
    pub fn raw(&self) -> RawDescriptor {
        self.inner.owned.raw()
    }
}

impl fmt::Debug for ActivationDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivationDescriptor")
            .field("raw", &self.raw())
            .field("params", &self.inner.params)
            .finish()
    }
}

/// Check that all descriptors are set with identical dims and element type.
pub(crate) fn same_shape(op: &'static str, descs: &[&TensorDescriptor]) -> DnnResult<()> {
    let mut layouts = descs.iter().map(|d| d.require_layout(op));
    let Some(first) = layouts.next().transpose()? else {
        return Ok(());
    };
    for layout in layouts {
        let layout = layout?;
        if layout.dims != first.dims || layout.data_type != first.data_type {
            return Err(DnnError::bad_param(
                op,
                format!("tensor {layout} differs from {first}"),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::HostBuffer;
    use crate::types::DataType;

    fn run(params: ActivationParams, input: &[f32]) -> Vec<f32> {
        let rt = Runtime::reference();
        let handle = Handle::new(&rt);
        let act = ActivationDescriptor::new(&rt, params).unwrap();
        let len = i32::try_from(input.len()).unwrap();
        let desc = TensorDescriptor::with_shape(&rt, DataType::Float32, &[len]).unwrap();
        let x = HostBuffer::from_slice(input);
        let y = HostBuffer::<f32>::new(input.len());
        act.forward(&handle, 1.0, &desc, &x, 0.0, &desc, &y).unwrap();
        y.to_vec()
    }

    #[test]
    fn test_params_roundtrip() {
        let rt = Runtime::reference();
        let params =
            ActivationParams::new(ActivationMode::LeakyRelu).with_coefficients(0.1, 0.0, 0.0);
        let act = ActivationDescriptor::new(&rt, params).unwrap();
        assert_eq!(act.get().unwrap(), params);
    }

    #[test]
    fn test_relu_family() {
        let input = [-2.0f32, -0.5, 0.0, 3.0];
        assert_eq!(
            run(ActivationParams::new(ActivationMode::Relu), &input),
            vec![0.0, 0.0, 0.0, 3.0]
        );
        assert_eq!(
            run(
                ActivationParams::new(ActivationMode::ClippedRelu).with_coefficients(1.0, 0.0, 0.0),
                &input
            ),
            vec![0.0, 0.0, 0.0, 1.0]
        );
        assert_eq!(
            run(
                ActivationParams::new(ActivationMode::LeakyRelu).with_coefficients(0.5, 0.0, 0.0),
                &input
            ),
            vec![-1.0, -0.25, 0.0, 3.0]
        );
        assert_eq!(
            run(ActivationParams::new(ActivationMode::Abs), &input),
            vec![2.0, 0.5, 0.0, 3.0]
        );
    }

    #[test]
    fn test_relu_backward_masks_gradient() {
        let rt = Runtime::reference();
        let handle = Handle::new(&rt);
        let act = ActivationDescriptor::new(&rt, ActivationParams::new(ActivationMode::Relu))
            .unwrap();
        let desc = TensorDescriptor::with_shape(&rt, DataType::Float32, &[3]).unwrap();
        let x = HostBuffer::from_slice(&[-1.0f32, 2.0, 3.0]);
        let y = HostBuffer::from_slice(&[0.0f32, 2.0, 3.0]);
        let dy = HostBuffer::from_slice(&[5.0f32, 5.0, 5.0]);
        let dx = HostBuffer::<f32>::new(3);
        act.backward(&handle, 1.0, &desc, &y, &desc, &dy, &desc, &x, 0.0, &desc, &dx)
            .unwrap();
        assert_eq!(dx.to_vec(), vec![0.0, 5.0, 5.0]);
    }

    #[test]
    fn test_shape_mismatch() {
        let rt = Runtime::reference();
        let handle = Handle::new(&rt);
        let act = ActivationDescriptor::new(&rt, ActivationParams::default()).unwrap();
        let a = TensorDescriptor::with_shape(&rt, DataType::Float32, &[3]).unwrap();
        let b = TensorDescriptor::with_shape(&rt, DataType::Float32, &[4]).unwrap();
        let buf = HostBuffer::<f32>::new(4);
        let err = act.forward(&handle, 1.0, &a, &buf, 0.0, &b, &buf).unwrap_err();
        assert!(matches!(err, DnnError::BadParam { .. }));
    }
}

//! Local response normalization.
//!
//! `y = x / (k + alpha / n * sum(x^2))^beta`, the sum running over `n`
//! neighbouring channels (cross-channel). Within-channel normalization sums
//! over an `n x n` spatial window and scales by `alpha / n^2` instead.

use crate::activation::same_shape;
use crate::backend::{DescriptorConfig, DescriptorKind, RawDescriptor, Workspace};
use crate::handle::Handle;
use crate::memory::{ensure_capacity, DeviceMemory};
use crate::runtime::{OwnedDescriptor, Runtime};
use crate::tensor::TensorDescriptor;
use crate::types::LrnMode;
use crate::{DnnError, DnnResult};
use std::fmt;
use std::sync::Arc;

/// LRN window and coefficients.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LrnParams {
    /// Neighbourhood.
    pub mode: LrnMode,
    /// Window size.
    pub n: u32,
    /// Scale of the sum of squares.
    pub alpha: f64,
    /// Exponent.
    pub beta: f64,
    /// Offset.
    pub k: f64,
}

impl LrnParams {
    /// The usual AlexNet setting for `mode`.
    #[must_use]
    pub const fn new(mode: LrnMode) -> Self {
        Self {
            mode,
            n: 5,
            alpha: 1e-4,
            beta: 0.75,
            k: 2.0,
        }
    }

    fn validate(&self) -> DnnResult<()> {
        if self.n == 0 {
            return Err(DnnError::invalid_value("LrnParams::validate", "window size must be >= 1"));
        }
        Ok(())
    }
}

struct LrnInner {
    owned: OwnedDescriptor,
    params: LrnParams,
}

/// A reference-counted LRN descriptor.
#[derive(Clone)]
pub struct LrnDescriptor {
    inner: Arc<LrnInner>,
}

impl LrnDescriptor {
    /// Create a descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`DnnError::InvalidValue`] for an empty window,
    /// [`DnnError::AllocationFailed`] if the backend cannot create it.
    pub fn new(runtime: &Runtime, params: LrnParams) -> DnnResult<Self> {
        params.validate()?;
        let owned = OwnedDescriptor::create(runtime, DescriptorKind::Lrn)?;
        owned
            .backend()
            .set_descriptor(owned.raw(), &DescriptorConfig::Lrn(params))?;
        Ok(Self {
            inner: Arc::new(LrnInner { owned, params }),
        })
    }

    /// Parameters the descriptor was created with.
    #[must_use]
    pub fn params(&self) -> LrnParams {
        self.inner.params
    }

    /// Read the parameters back from the backend.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub fn get(&self) -> DnnResult<LrnParams> {
        match self
            .inner
            .owned
            .backend()
            .get_descriptor(self.raw(), DescriptorKind::Lrn, 0)?
        {
            DescriptorConfig::Lrn(params) => Ok(params),
            other => Err(DnnError::internal(
                "LrnDescriptor::get",
                format!("backend returned a {:?} descriptor", other.kind()),
            )),
        }
    }

    /// Workspace a forward pass producing `y` needs for the backward pass.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub fn workspace_size(&self, y: &TensorDescriptor) -> DnnResult<usize> {
        y.require_layout("LrnDescriptor::workspace_size")?;
        self.inner.owned.backend().lrn_workspace_size(y.raw())
    }

    fn workspace(
        &self,
        op: &'static str,
        y: &TensorDescriptor,
        workspace: Option<&dyn DeviceMemory>,
    ) -> DnnResult<Workspace> {
        let Some(mem) = workspace else {
            return Err(DnnError::bad_param(op, "LRN backward needs the forward workspace"));
        };
        ensure_capacity(mem, self.workspace_size(y)?, "workspace", op)?;
        Ok(Workspace {
            ptr: mem.device_ptr(),
            bytes: mem.size_bytes(),
        })
    }

    /// `y = alpha * lrn(x) + beta * y`; with `do_backward` the scale factors
    /// are kept in `workspace`.
    ///
    /// # Errors
    ///
    /// Returns [`DnnError::BadParam`] on a shape mismatch or a missing
    /// workspace, plus the usual descriptor and capacity errors.
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
        do_backward: bool,
        workspace: Option<&dyn DeviceMemory>,
    ) -> DnnResult<()> {
        const OP: &str = "LrnDescriptor::forward";
        same_shape(OP, &[x_desc, y_desc])?;
        let workspace = if do_backward {
            self.workspace(OP, y_desc, workspace)?
        } else {
            Workspace::none()
        };
        let alpha = y_desc.scalar(alpha, OP)?;
        let beta = y_desc.scalar(beta, OP)?;
        let x = x_desc.arg(x, "x", OP)?;
        let y = y_desc.arg(y, "y", OP)?;
        handle.backend().lrn_forward(
            handle.raw(),
            self.raw(),
            alpha,
            x,
            beta,
            y,
            do_backward,
            workspace,
        )
    }

    /// `dx = alpha * lrn'(dy) + beta * dx`, reading the forward workspace.
    ///
    /// # Errors
    ///
    /// Returns [`DnnError::BadParam`] on a shape mismatch or a missing
    /// workspace, plus the usual descriptor and capacity errors.
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
        workspace: Option<&dyn DeviceMemory>,
    ) -> DnnResult<()> {
        const OP: &str = "LrnDescriptor::backward";
        same_shape(OP, &[y_desc, dy_desc, x_desc, dx_desc])?;
        let workspace = self.workspace(OP, y_desc, workspace)?;
        let alpha = dx_desc.scalar(alpha, OP)?;
        let beta = dx_desc.scalar(beta, OP)?;
        let y = y_desc.arg(y, "y", OP)?;
        let dy = dy_desc.arg(dy, "dy", OP)?;
        let x = x_desc.arg(x, "x", OP)?;
        let dx = dx_desc.arg(dx, "dx", OP)?;
        handle.backend().lrn_backward(
            handle.raw(),
            self.raw(),
            alpha,
            y,
            dy,
            x,
            beta,
            dx,
            workspace,
        )
    }

    /// Backend id.
    #[must_use]
    pub fn raw(&self) -> RawDescriptor {
        self.inner.owned.raw()
    }
}

impl fmt::Debug for LrnDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LrnDescriptor")
            .field("raw", &self.raw())
            .field("params", &self.inner.params)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::HostBuffer;
    use crate::types::DataType;

    #[test]
    fn test_rejects_empty_window() {
        let rt = Runtime::reference();
        let params = LrnParams {
            n: 0,
            ..LrnParams::new(LrnMode::CrossChannel)
        };
        assert!(matches!(
            LrnDescriptor::new(&rt, params),
            Err(DnnError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_cross_channel_single_window() {
        let rt = Runtime::reference();
        let handle = Handle::new(&rt);
        let params = LrnParams {
            mode: LrnMode::CrossChannel,
            n: 1,
            alpha: 1.0,
            beta: 1.0,
            k: 1.0,
        };
        let lrn = LrnDescriptor::new(&rt, params).unwrap();
        assert_eq!(lrn.get().unwrap(), params);

        let desc = TensorDescriptor::with_shape(&rt, DataType::Float32, &[1, 2, 1, 1]).unwrap();
        let x = HostBuffer::from_slice(&[1.0f32, 2.0]);
        let y = HostBuffer::<f32>::new(2);
        let ws = HostBuffer::<u8>::new(lrn.workspace_size(&desc).unwrap());
        lrn.forward(&handle, 1.0, &desc, &x, 0.0, &desc, &y, true, Some(&ws))
            .unwrap();
        // x / (1 + x^2)
        assert_eq!(y.to_vec(), vec![0.5, 0.4]);

        let dy = HostBuffer::from_slice(&[1.0f32, 1.0]);
        let dx = HostBuffer::<f32>::new(2);
        lrn.backward(
            &handle, 1.0, &desc, &y, &desc, &dy, &desc, &x, 0.0, &desc, &dx, Some(&ws),
        )
        .unwrap();
        // d/dx x / (1 + x^2) = (1 - x^2) / (1 + x^2)^2
        let got = dx.to_vec();
        assert!((got[0] - 0.0).abs() < 1e-6);
        assert!((got[1] - (-3.0 / 25.0)).abs() < 1e-6);
    }
}

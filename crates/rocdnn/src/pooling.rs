//! 2-D pooling.
//!
//! Max pooling can record the position of each window's maximum in a
//! workspace during the forward pass; the backward pass routes gradients
//! through those positions. Positions are stored with the descriptor's
//! [`IndexType`] width, so windows larger than its range are rejected.

use crate::activation::same_shape;
use crate::backend::{DescriptorConfig, DescriptorKind, RawDescriptor, Workspace};
use crate::handle::Handle;
use crate::memory::{ensure_capacity, DeviceMemory};
use crate::runtime::{OwnedDescriptor, Runtime};
use crate::tensor::TensorDescriptor;
use crate::types::{IndexType, PoolingMode};
use crate::{DnnError, DnnResult};
use std::fmt;
use std::sync::Arc;

/// Window geometry of a 2-D pooling.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PoolingParams {
    /// Reduction.
    pub mode: PoolingMode,
    /// Window height and width.
    pub window: [i32; 2],
    /// Zero padding per dimension.
    pub pad: [i32; 2],
    /// Window stride per dimension.
    pub stride: [i32; 2],
}

impl PoolingParams {
    /// Build parameters from per-dimension slices.
    ///
    /// # Errors
    ///
    /// Returns [`DnnError::InvalidValue`] unless every slice has two entries,
    /// windows and strides are positive, and padding is non-negative and
    /// smaller than the window.
    pub fn new(mode: PoolingMode, window: &[i32], pad: &[i32], stride: &[i32]) -> DnnResult<Self> {
        const OP: &str = "PoolingParams::new";
        let pair = |what: &str, v: &[i32]| -> DnnResult<[i32; 2]> {
            <[i32; 2]>::try_from(v).map_err(|_| {
                DnnError::invalid_value(
                    OP,
                    format!("{what} has {} entries, only 2-D pooling is supported", v.len()),
                )
            })
        };
        let params = Self {
            mode,
            window: pair("window", window)?,
            pad: pair("pad", pad)?,
            stride: pair("stride", stride)?,
        };
        if params.window.iter().chain(&params.stride).any(|&v| v < 1) {
            return Err(DnnError::invalid_value(OP, "window and stride must be >= 1"));
        }
        if params
            .pad
            .iter()
            .zip(&params.window)
            .any(|(&p, &w)| p < 0 || p >= w)
        {
            return Err(DnnError::invalid_value(
                OP,
                "padding must be non-negative and smaller than the window",
            ));
        }
        Ok(params)
    }

    /// Output shape for an NCHW input.
    ///
    /// # Errors
    ///
    /// Returns [`DnnError::BadParam`] unless `x` has rank 4 and the window
    /// fits the padded input.
    pub fn output_dims(&self, x: &[i32]) -> DnnResult<[i32; 4]> {
        const OP: &str = "PoolingParams::output_dims";
        if x.len() != 4 {
            return Err(DnnError::bad_param(
                OP,
                format!("2-D pooling needs a rank-4 input, got rank {}", x.len()),
            ));
        }
        let mut out = [x[0], x[1], 0, 0];
        for i in 0..2 {
            let padded = i64::from(x[i + 2]) + 2 * i64::from(self.pad[i]);
            let (window, stride) = (i64::from(self.window[i]), i64::from(self.stride[i]));
            if stride < 1 {
                return Err(DnnError::bad_param(OP, format!("stride {stride} < 1")));
            }
            if padded < window {
                return Err(DnnError::bad_param(
                    OP,
                    format!("window {window} exceeds padded input {padded}"),
                ));
            }
            let size = (padded - window) / stride + 1;
            out[i + 2] = i32::try_from(size).map_err(|_| {
                DnnError::bad_param(OP, format!("output extent {size} overflows a dimension"))
            })?;
        }
        Ok(out)
    }
}

struct PoolingInner {
    owned: OwnedDescriptor,
    params: PoolingParams,
}

/// A reference-counted pooling descriptor.
#[derive(Clone)]
pub struct PoolingDescriptor {
    inner: Arc<PoolingInner>,
}

impl PoolingDescriptor {
    /// Create a descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`DnnError::AllocationFailed`] if the backend cannot create
    /// the descriptor.
    pub fn new(runtime: &Runtime, params: PoolingParams) -> DnnResult<Self> {
        let owned = OwnedDescriptor::create(runtime, DescriptorKind::Pooling)?;
        owned
            .backend()
            .set_descriptor(owned.raw(), &DescriptorConfig::Pooling(params))?;
        Ok(Self {
            inner: Arc::new(PoolingInner { owned, params }),
        })
    }

    /// Parameters the descriptor was created with.
    #[must_use]
    pub fn params(&self) -> PoolingParams {
        self.inner.params
    }

    /// Read the parameters back from the backend.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub fn get(&self) -> DnnResult<PoolingParams> {
        match self
            .inner
            .owned
            .backend()
            .get_descriptor(self.raw(), DescriptorKind::Pooling, 2)?
        {
            DescriptorConfig::Pooling(params) => Ok(params),
            other => Err(DnnError::internal(
                "PoolingDescriptor::get",
                format!("backend returned a {:?} descriptor", other.kind()),
            )),
        }
    }

    /// Width of the recorded max indices.
    ///
    /// # Errors
    ///
    /// Returns [`DnnError::BadParam`] if the window has more positions than
    /// `index` can address.
    pub fn set_index_type(&self, index: IndexType) -> DnnResult<()> {
        let [h, w] = self.inner.params.window;
        let positions = u64::try_from(h).unwrap_or(0) * u64::try_from(w).unwrap_or(0);
        if positions > index.max_index() {
            return Err(DnnError::bad_param(
                "PoolingDescriptor::set_index_type",
                format!("{index} cannot address {positions} window positions"),
            ));
        }
        self.inner
            .owned
            .backend()
            .set_pooling_index_type(self.raw(), index)
    }

    /// Width of the recorded max indices.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub fn index_type(&self) -> DnnResult<IndexType> {
        self.inner.owned.backend().pooling_index_type(self.raw())
    }

    /// Output shape for `x`, computed by the backend.
    ///
    /// # Errors
    ///
    /// Returns [`DnnError::BadParam`] for a non-NCHW input or an oversized
    /// window.
    pub fn forward_output_dim(&self, x: &TensorDescriptor) -> DnnResult<Vec<i32>> {
        x.require_layout("PoolingDescriptor::forward_output_dim")?;
        self.inner
            .owned
            .backend()
            .pooling_output_dim(self.raw(), x.raw())
    }

    /// Workspace a forward pass producing `y` needs to record indices.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub fn workspace_size(&self, y: &TensorDescriptor) -> DnnResult<usize> {
        y.require_layout("PoolingDescriptor::workspace_size")?;
        self.inner
            .owned
            .backend()
            .pooling_workspace_size(self.raw(), y.raw())
    }

    fn check_io(&self, op: &'static str, x: &TensorDescriptor, y: &TensorDescriptor) -> DnnResult<()> {
        let xl = x.require_layout(op)?;
        let yl = y.require_layout(op)?;
        let expected = self.inner.params.output_dims(&xl.dims)?;
        if yl.dims.as_slice() != expected || xl.data_type != yl.data_type {
            return Err(DnnError::bad_param(
                op,
                format!("output {yl} does not match pooling of {xl} ({expected:?})"),
            ));
        }
        Ok(())
    }

    fn workspace(
        &self,
        op: &'static str,
        required: bool,
        y: &TensorDescriptor,
        workspace: Option<&dyn DeviceMemory>,
    ) -> DnnResult<Workspace> {
        if !required {
            return Ok(Workspace::none());
        }
        let Some(mem) = workspace else {
            return Err(DnnError::bad_param(
                op,
                "max pooling needs an index workspace for the backward pass",
            ));
        };
        ensure_capacity(mem, self.workspace_size(y)?, "workspace", op)?;
        Ok(Workspace {
            ptr: mem.device_ptr(),
            bytes: mem.size_bytes(),
        })
    }

    /// `y = alpha * pool(x) + beta * y`.
    ///
    /// With `do_backward` in max mode the positions of the maxima are written
    /// to `workspace`, which must hold [`workspace_size`](Self::workspace_size)
    /// bytes.
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
        const OP: &str = "PoolingDescriptor::forward";
        self.check_io(OP, x_desc, y_desc)?;
        let records = do_backward && self.inner.params.mode == PoolingMode::Max;
        let workspace = self.workspace(OP, records, y_desc, workspace)?;
        let alpha = y_desc.scalar(alpha, OP)?;
        let beta = y_desc.scalar(beta, OP)?;
        let x = x_desc.arg(x, "x", OP)?;
        let y = y_desc.arg(y, "y", OP)?;
        handle.backend().pooling_forward(
            handle.raw(),
            self.raw(),
            alpha,
            x,
            beta,
            y,
            records,
            workspace,
        )
    }

    /// `dx = alpha * pool'(dy) + beta * dx`.
    ///
    /// Max mode reads the indices recorded by a forward pass with
    /// `do_backward`.
    ///
    /// # Errors
    ///
    /// Returns [`DnnError::BadParam`] on a shape mismatch or a missing
    /// workspace in max mode, plus the usual descriptor and capacity errors.
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
        const OP: &str = "PoolingDescriptor::backward";
        self.check_io(OP, x_desc, y_desc)?;
        same_shape(OP, &[y_desc, dy_desc])?;
        same_shape(OP, &[x_desc, dx_desc])?;
        let records = self.inner.params.mode == PoolingMode::Max;
        let workspace = self.workspace(OP, records, y_desc, workspace)?;
        let alpha = dx_desc.scalar(alpha, OP)?;
        let beta = dx_desc.scalar(beta, OP)?;
        let y = y_desc.arg(y, "y", OP)?;
        let dy = dy_desc.arg(dy, "dy", OP)?;
        let x = x_desc.arg(x, "x", OP)?;
        let dx = dx_desc.arg(dx, "dx", OP)?;
        handle.backend().pooling_backward(
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

impl fmt::Debug for PoolingDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolingDescriptor")
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

    fn max_pool(rt: &Runtime) -> PoolingDescriptor {
        let params = PoolingParams::new(PoolingMode::Max, &[2, 2], &[0, 0], &[2, 2]).unwrap();
        PoolingDescriptor::new(rt, params).unwrap()
    }

    #[test]
    fn test_params_are_two_dimensional() {
        assert!(matches!(
            PoolingParams::new(PoolingMode::Max, &[2, 2, 2], &[0, 0, 0], &[1, 1, 1]),
            Err(DnnError::InvalidValue { .. })
        ));
        assert!(PoolingParams::new(PoolingMode::Max, &[2, 2], &[2, 0], &[1, 1]).is_err());
    }

    #[test]
    fn test_output_dim() {
        let rt = Runtime::reference();
        let pool = max_pool(&rt);
        let x = TensorDescriptor::with_shape(&rt, DataType::Float32, &[1, 2, 4, 6]).unwrap();
        assert_eq!(pool.forward_output_dim(&x).unwrap(), vec![1, 2, 2, 3]);
        assert_eq!(pool.get().unwrap(), pool.params());
    }

    #[test]
    fn test_output_dim_overflow_is_bad_param() {
        let params =
            PoolingParams::new(PoolingMode::Max, &[i32::MAX, 1], &[i32::MAX - 1, 0], &[1, 1])
                .unwrap();
        assert!(matches!(
            params.output_dims(&[1, 1, 4, 4]),
            Err(DnnError::BadParam { .. })
        ));
    }

    #[test]
    fn test_index_type() {
        let rt = Runtime::reference();
        let pool = max_pool(&rt);
        assert_eq!(pool.index_type().unwrap(), IndexType::Uint8);
        pool.set_index_type(IndexType::Uint32).unwrap();
        assert_eq!(pool.index_type().unwrap(), IndexType::Uint32);

        let wide = PoolingParams::new(PoolingMode::Max, &[16, 17], &[0, 0], &[1, 1]).unwrap();
        let wide = PoolingDescriptor::new(&rt, wide).unwrap();
        assert!(wide.set_index_type(IndexType::Uint8).is_err());
    }

    #[test]
    fn test_max_forward_backward() {
        let rt = Runtime::reference();
        let handle = Handle::new(&rt);
        let pool = max_pool(&rt);
        let x_desc = TensorDescriptor::with_shape(&rt, DataType::Float32, &[1, 1, 2, 4]).unwrap();
        let y_desc = TensorDescriptor::with_shape(&rt, DataType::Float32, &[1, 1, 1, 2]).unwrap();
        let x = HostBuffer::from_slice(&[1.0f32, 5.0, 2.0, 0.0, 3.0, 4.0, 8.0, 1.0]);
        let y = HostBuffer::<f32>::new(2);
        let ws = HostBuffer::<u8>::new(pool.workspace_size(&y_desc).unwrap());

        pool.forward(&handle, 1.0, &x_desc, &x, 0.0, &y_desc, &y, true, Some(&ws))
            .unwrap();
        assert_eq!(y.to_vec(), vec![5.0, 8.0]);

        let dy = HostBuffer::from_slice(&[1.0f32, 2.0]);
        let dx = HostBuffer::<f32>::new(8);
        pool.backward(
            &handle, 1.0, &y_desc, &y, &y_desc, &dy, &x_desc, &x, 0.0, &x_desc, &dx, Some(&ws),
        )
        .unwrap();
        assert_eq!(dx.to_vec(), vec![0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 2.0, 0.0]);
    }

    #[test]
    fn test_max_backward_needs_workspace() {
        let rt = Runtime::reference();
        let handle = Handle::new(&rt);
        let pool = max_pool(&rt);
        let x_desc = TensorDescriptor::with_shape(&rt, DataType::Float32, &[1, 1, 2, 2]).unwrap();
        let y_desc = TensorDescriptor::with_shape(&rt, DataType::Float32, &[1, 1, 1, 1]).unwrap();
        let x = HostBuffer::<f32>::new(4);
        let y = HostBuffer::<f32>::new(1);
        let err = pool
            .backward(&handle, 1.0, &y_desc, &y, &y_desc, &y, &x_desc, &x, 0.0, &x_desc, &x, None)
            .unwrap_err();
        assert!(matches!(err, DnnError::BadParam { .. }));
    }

    #[test]
    fn test_average_forward() {
        let rt = Runtime::reference();
        let handle = Handle::new(&rt);
        let params = PoolingParams::new(PoolingMode::Average, &[2, 2], &[0, 0], &[2, 2]).unwrap();
        let pool = PoolingDescriptor::new(&rt, params).unwrap();
        let x_desc = TensorDescriptor::with_shape(&rt, DataType::Float32, &[1, 1, 2, 2]).unwrap();
        let y_desc = TensorDescriptor::with_shape(&rt, DataType::Float32, &[1, 1, 1, 1]).unwrap();
        let x = HostBuffer::from_slice(&[1.0f32, 2.0, 3.0, 6.0]);
        let y = HostBuffer::<f32>::new(1);
        pool.forward(&handle, 1.0, &x_desc, &x, 0.0, &y_desc, &y, false, None)
            .unwrap();
        assert_eq!(y.to_vec(), vec![3.0]);
    }
}

//! Channel softmax.
//!
//! The softmax runs over dimension 1 independently for every batch entry and
//! spatial position: `y[n, c, ...] = exp(x[n, c, ...]) / sum_c exp(x[n, c, ...])`.

use crate::activation::same_shape;
use crate::handle::Handle;
use crate::memory::DeviceMemory;
use crate::tensor::TensorDescriptor;
use crate::{DnnError, DnnResult};

fn check_rank(op: &'static str, desc: &TensorDescriptor) -> DnnResult<()> {
    let layout = desc.require_layout(op)?;
    if layout.rank() < 2 {
        return Err(DnnError::bad_param(
            op,
            format!("channel softmax needs a channel dimension, got {layout}"),
        ));
    }
    Ok(())
}

/// `y = alpha * softmax(x) + beta * y`.
///
/// # Errors
///
/// Returns [`DnnError::BadParam`] if the shapes differ or have no channel
/// dimension, plus the usual descriptor and capacity errors.
#[allow(clippy::too_many_arguments)]
pub fn forward(
    handle: &Handle,
    alpha: f64,
    x_desc: &TensorDescriptor,
    x: &dyn DeviceMemory,
    beta: f64,
    y_desc: &TensorDescriptor,
    y: &dyn DeviceMemory,
) -> DnnResult<()> {
    const OP: &str = "softmax::forward";
    same_shape(OP, &[x_desc, y_desc])?;
    check_rank(OP, x_desc)?;
    let alpha = y_desc.scalar(alpha, OP)?;
    let beta = y_desc.scalar(beta, OP)?;
    let x = x_desc.arg(x, "x", OP)?;
    let y = y_desc.arg(y, "y", OP)?;
    handle
        .backend()
        .softmax_forward(handle.raw(), alpha, x, beta, y)
}

/// `dx = alpha * y * (dy - sum_c(dy * y)) + beta * dx`.
///
/// # Errors
///
/// Returns [`DnnError::BadParam`] if the shapes differ or have no channel
/// dimension, plus the usual descriptor and capacity errors.
#[allow(clippy::too_many_arguments)]
pub fn backward(
    handle: &Handle,
    alpha: f64,
    y_desc: &TensorDescriptor,
    y: &dyn DeviceMemory,
    dy_desc: &TensorDescriptor,
    dy: &dyn DeviceMemory,
    beta: f64,
    dx_desc: &TensorDescriptor,
    dx: &dyn DeviceMemory,
) -> DnnResult<()> {
    const OP: &str = "softmax::backward";
    same_shape(OP, &[y_desc, dy_desc, dx_desc])?;
    check_rank(OP, y_desc)?;
    let alpha = dx_desc.scalar(alpha, OP)?;
    let beta = dx_desc.scalar(beta, OP)?;
    let y = y_desc.arg(y, "y", OP)?;
    let dy = dy_desc.arg(dy, "dy", OP)?;
    let dx = dx_desc.arg(dx, "dx", OP)?;
    handle
        .backend()
        .softmax_backward(handle.raw(), alpha, y, dy, beta, dx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::HostBuffer;
    use crate::runtime::Runtime;
    use crate::types::DataType;

    #[test]
    fn test_forward_sums_to_one_per_position() {
        let rt = Runtime::reference();
        let handle = Handle::new(&rt);
        let desc = TensorDescriptor::with_shape(&rt, DataType::Float32, &[1, 3, 1, 2]).unwrap();
        let x = HostBuffer::from_slice(&[0.0f32, 1.0, 0.0, 2.0, 0.0, 3.0]);
        let y = HostBuffer::<f32>::new(6);
        forward(&handle, 1.0, &desc, &x, 0.0, &desc, &y).unwrap();
        let y = y.to_vec();
        // Position 0 has equal logits.
        for c in 0..3 {
            assert!((y[c * 2] - 1.0 / 3.0).abs() < 1e-6);
        }
        let total: f32 = (0..3).map(|c| y[c * 2 + 1]).sum();
        assert!((total - 1.0).abs() < 1e-6);
        assert!(y[5] > y[3] && y[3] > y[1]);
    }

    #[test]
    fn test_backward_of_uniform_gradient_vanishes() {
        let rt = Runtime::reference();
        let handle = Handle::new(&rt);
        let desc = TensorDescriptor::with_shape(&rt, DataType::Float32, &[1, 2]).unwrap();
        let y = HostBuffer::from_slice(&[0.25f32, 0.75]);
        let dy = HostBuffer::from_slice(&[1.0f32, 1.0]);
        let dx = HostBuffer::<f32>::new(2);
        backward(&handle, 1.0, &desc, &y, &desc, &dy, 0.0, &desc, &dx).unwrap();
        assert!(dx.to_vec().iter().all(|v| v.abs() < 1e-6));
    }

    #[test]
    fn test_rejects_rank_one() {
        let rt = Runtime::reference();
        let handle = Handle::new(&rt);
        let desc = TensorDescriptor::with_shape(&rt, DataType::Float32, &[4]).unwrap();
        let buf = HostBuffer::<f32>::new(4);
        assert!(matches!(
            forward(&handle, 1.0, &desc, &buf, 0.0, &desc, &buf),
            Err(DnnError::BadParam { .. })
        ));
    }
}

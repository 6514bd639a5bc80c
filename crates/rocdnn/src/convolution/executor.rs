//! Convolution execution.
//!
//! Every pass blends into its destination: `dst = alpha * result + beta * dst`.
//! With `beta == 0` the destination is write-only and its prior contents
//! (including NaNs) never influence the result.

use super::planner::{fingerprint, BoundAlgorithm, ConvDirection};
use super::{BackwardData, BackwardWeights, ConvolutionDescriptor, Forward};
use crate::backend::{ConvBuffers, ConvPass, ConvProblem, Workspace};
use crate::handle::Handle;
use crate::memory::{DeviceMemory, DevicePtr};
use crate::tensor::{TensorDescriptor, TensorLayout};
use crate::{DnnError, DnnResult};

/// Descriptors and buffers of one pass, in forward order.
struct Operands<'a> {
    x: (&'a TensorDescriptor, &'a dyn DeviceMemory),
    w: (&'a TensorDescriptor, &'a dyn DeviceMemory),
    y: (&'a TensorDescriptor, &'a dyn DeviceMemory),
}

impl ConvolutionDescriptor {
    /// `y = alpha * conv(x, w) + beta * y`.
    ///
    /// # Errors
    ///
    /// - [`DnnError::BadParam`] if a descriptor is unset, the element types
    ///   differ, `algorithm` was planned for another configuration, or the
    ///   workspace is smaller than the algorithm needs
    /// - [`DnnError::InvalidValue`] if `y` is not the output shape of `x`
    ///   and `w`, or a buffer is smaller than its descriptor
    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        handle: &Handle,
        alpha: f64,
        x_desc: &TensorDescriptor,
        x: &dyn DeviceMemory,
        w_desc: &TensorDescriptor,
        w: &dyn DeviceMemory,
        algorithm: &BoundAlgorithm<Forward>,
        beta: f64,
        y_desc: &TensorDescriptor,
        y: &dyn DeviceMemory,
        workspace: Option<&dyn DeviceMemory>,
    ) -> DnnResult<()> {
        self.execute(
            "ConvolutionDescriptor::forward",
            handle,
            algorithm,
            alpha,
            beta,
            &Operands {
                x: (x_desc, x),
                w: (w_desc, w),
                y: (y_desc, y),
            },
            workspace,
        )
    }

    /// `dx = alpha * conv^T(dy, w) + beta * dx`.
    ///
    /// # Errors
    ///
    /// Same as [`forward`](Self::forward), with `dy` as the output shape of
    /// `dx` and `w`.
    #[allow(clippy::too_many_arguments)]
    pub fn backward_data(
        &self,
        handle: &Handle,
        alpha: f64,
        dy_desc: &TensorDescriptor,
        dy: &dyn DeviceMemory,
        w_desc: &TensorDescriptor,
        w: &dyn DeviceMemory,
        algorithm: &BoundAlgorithm<BackwardData>,
        beta: f64,
        dx_desc: &TensorDescriptor,
        dx: &dyn DeviceMemory,
        workspace: Option<&dyn DeviceMemory>,
    ) -> DnnResult<()> {
        self.execute(
            "ConvolutionDescriptor::backward_data",
            handle,
            algorithm,
            alpha,
            beta,
            &Operands {
                x: (dx_desc, dx),
                w: (w_desc, w),
                y: (dy_desc, dy),
            },
            workspace,
        )
    }

    /// `dw = alpha * corr(x, dy) + beta * dw`.
    ///
    /// # Errors
    ///
    /// Same as [`forward`](Self::forward), with `dy` as the output shape of
    /// `x` and `dw`.
    #[allow(clippy::too_many_arguments)]
    pub fn backward_weights(
        &self,
        handle: &Handle,
        alpha: f64,
        dy_desc: &TensorDescriptor,
        dy: &dyn DeviceMemory,
        x_desc: &TensorDescriptor,
        x: &dyn DeviceMemory,
        algorithm: &BoundAlgorithm<BackwardWeights>,
        beta: f64,
        dw_desc: &TensorDescriptor,
        dw: &dyn DeviceMemory,
        workspace: Option<&dyn DeviceMemory>,
    ) -> DnnResult<()> {
        self.execute(
            "ConvolutionDescriptor::backward_weights",
            handle,
            algorithm,
            alpha,
            beta,
            &Operands {
                x: (x_desc, x),
                w: (dw_desc, dw),
                y: (dy_desc, dy),
            },
            workspace,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn execute<D: ConvDirection>(
        &self,
        op: &'static str,
        handle: &Handle,
        algorithm: &BoundAlgorithm<D>,
        alpha: f64,
        beta: f64,
        operands: &Operands<'_>,
        workspace: Option<&dyn DeviceMemory>,
    ) -> DnnResult<()> {
        let (x_desc, x) = operands.x;
        let (w_desc, w) = operands.w;
        let (y_desc, y) = operands.y;
        let xl = x_desc.require_layout(op)?;
        let wl = w_desc.require_layout(op)?;
        let yl = y_desc.require_layout(op)?;

        self.check_shapes(op, &xl, &wl, &yl)?;
        if fingerprint(D::PASS, self.params(), &xl, &wl, &yl) != algorithm.fingerprint() {
            return Err(DnnError::bad_param(
                op,
                format!(
                    "{:?} was planned for a different convolution configuration",
                    algorithm.algorithm()
                ),
            ));
        }

        let buffers = ConvBuffers {
            x: x_desc.arg(x, "x", op)?.ptr,
            w: w_desc.arg(w, "w", op)?.ptr,
            y: y_desc.arg(y, "y", op)?.ptr,
        };
        let provided = workspace.map_or(0, DeviceMemory::size_bytes);
        if provided < algorithm.workspace_bytes() {
            return Err(DnnError::bad_param(
                op,
                format!(
                    "workspace of {provided} bytes is smaller than the {} bytes {:?} needs",
                    algorithm.workspace_bytes(),
                    algorithm.algorithm()
                ),
            ));
        }
        let workspace = Workspace {
            ptr: workspace.map_or(DevicePtr::null(), DeviceMemory::device_ptr),
            bytes: provided,
        };

        // The written tensor decides the scalar representation.
        let out_desc = match D::PASS {
            ConvPass::Forward => y_desc,
            ConvPass::BackwardData => x_desc,
            ConvPass::BackwardWeights => w_desc,
        };
        let alpha = out_desc.scalar(alpha, op)?;
        let beta = out_desc.scalar(beta, op)?;

        let problem = ConvProblem {
            pass: D::PASS,
            conv: self.raw(),
            x: x_desc.raw(),
            w: w_desc.raw(),
            y: y_desc.raw(),
        };
        tracing::trace!(op, algorithm = ?algorithm.algorithm(), "dispatch");
        handle.backend().convolution(
            handle.raw(),
            &problem,
            D::wrap(algorithm.algorithm()),
            &buffers,
            alpha,
            beta,
            workspace,
        )
    }

    fn check_shapes(
        &self,
        op: &'static str,
        x: &TensorLayout,
        w: &TensorLayout,
        y: &TensorLayout,
    ) -> DnnResult<()> {
        let expected = self
            .params()
            .output_dims(&x.dims, &w.dims)
            .map_err(|err| DnnError::invalid_value(op, err.to_string()))?;
        if expected != y.dims {
            return Err(DnnError::invalid_value(
                op,
                format!(
                    "output {y} does not match the convolution of {x} with {w} ({:?})",
                    expected.as_slice()
                ),
            ));
        }
        if x.data_type != w.data_type || x.data_type != y.data_type {
            return Err(DnnError::bad_param(
                op,
                format!("mixed element types {x}, {w}, {y}"),
            ));
        }
        Ok(())
    }
}

/// Check `bias` is `[1, K, 1, ...]` for an output with `K` channels.
fn check_bias_shape(op: &'static str, bias: &TensorLayout, out: &TensorLayout) -> DnnResult<()> {
    let matches = bias.rank() == out.rank()
        && out.rank() >= 2
        && bias.dims[1] == out.dims[1]
        && bias
            .dims
            .iter()
            .enumerate()
            .all(|(i, &d)| i == 1 || d == 1);
    if !matches {
        return Err(DnnError::bad_param(
            op,
            format!("bias {bias} is not a per-channel vector for {out}"),
        ));
    }
    if bias.data_type != out.data_type {
        return Err(DnnError::bad_param(
            op,
            format!("bias {bias} and output {out} differ in element type"),
        ));
    }
    Ok(())
}

/// `y = alpha * b + beta * y`, with `b` broadcast over every channel.
///
/// # Errors
///
/// Returns [`DnnError::BadParam`] unless `b` is `[1, K, 1, ...]` matching
/// `y`'s channel count, plus the usual descriptor and capacity errors.
#[allow(clippy::too_many_arguments)]
pub fn forward_bias(
    handle: &Handle,
    alpha: f64,
    b_desc: &TensorDescriptor,
    b: &dyn DeviceMemory,
    beta: f64,
    y_desc: &TensorDescriptor,
    y: &dyn DeviceMemory,
) -> DnnResult<()> {
    const OP: &str = "convolution::forward_bias";
    let bl = b_desc.require_layout(OP)?;
    let yl = y_desc.require_layout(OP)?;
    check_bias_shape(OP, &bl, &yl)?;
    let alpha = y_desc.scalar(alpha, OP)?;
    let beta = y_desc.scalar(beta, OP)?;
    let b = b_desc.arg(b, "bias", OP)?;
    let y = y_desc.arg(y, "y", OP)?;
    handle
        .backend()
        .convolution_forward_bias(handle.raw(), alpha, b, beta, y)
}

/// `db = alpha * sum(dy) + beta * db`, summed over everything but channels.
///
/// # Errors
///
/// Returns [`DnnError::BadParam`] unless `db` is `[1, K, 1, ...]` matching
/// `dy`'s channel count, plus the usual descriptor and capacity errors.
#[allow(clippy::too_many_arguments)]
pub fn backward_bias(
    handle: &Handle,
    alpha: f64,
    dy_desc: &TensorDescriptor,
    dy: &dyn DeviceMemory,
    beta: f64,
    db_desc: &TensorDescriptor,
    db: &dyn DeviceMemory,
) -> DnnResult<()> {
    const OP: &str = "convolution::backward_bias";
    let dyl = dy_desc.require_layout(OP)?;
    let dbl = db_desc.require_layout(OP)?;
    check_bias_shape(OP, &dbl, &dyl)?;
    let alpha = db_desc.scalar(alpha, OP)?;
    let beta = db_desc.scalar(beta, OP)?;
    let dy = dy_desc.arg(dy, "dy", OP)?;
    let db = db_desc.arg(db, "db", OP)?;
    handle
        .backend()
        .convolution_backward_bias(handle.raw(), alpha, dy, beta, db)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convolution::{ConvolutionParams, Planner};
    use crate::memory::HostBuffer;
    use crate::runtime::Runtime;
    use crate::types::DataType;

    fn plan_forward(
        handle: &Handle,
        conv: &ConvolutionDescriptor,
        x: &TensorDescriptor,
        w: &TensorDescriptor,
        y: &TensorDescriptor,
    ) -> BoundAlgorithm<Forward> {
        let mut planner = Planner::forward(conv, x, w, y).unwrap();
        let bytes = planner.workspace_size(handle).unwrap();
        let ws = HostBuffer::<u8>::new(bytes);
        let xb = HostBuffer::<f32>::new(x.volume().unwrap());
        let wb = HostBuffer::<f32>::new(w.volume().unwrap());
        let yb = HostBuffer::<f32>::new(y.volume().unwrap());
        planner.find(handle, &xb, &wb, &yb, Some(&ws)).unwrap();
        planner.select_within_budget(0).unwrap()
    }

    #[test]
    fn test_forward_single_pixel() {
        let rt = Runtime::reference();
        let handle = Handle::new(&rt);
        let conv =
            ConvolutionDescriptor::new(&rt, ConvolutionParams::new(&[0, 0], &[1, 1], &[1, 1]))
                .unwrap();
        let x_desc = TensorDescriptor::with_shape(&rt, DataType::Float32, &[1, 1, 2, 2]).unwrap();
        let w_desc = TensorDescriptor::with_shape(&rt, DataType::Float32, &[1, 1, 2, 2]).unwrap();
        let y_desc = TensorDescriptor::with_shape(&rt, DataType::Float32, &[1, 1, 1, 1]).unwrap();
        let bound = plan_forward(&handle, &conv, &x_desc, &w_desc, &y_desc);

        let x = HostBuffer::from_slice(&[1.0f32, 2.0, 3.0, 4.0]);
        let w = HostBuffer::from_slice(&[1.0f32, 0.0, 0.0, 1.0]);
        let y = HostBuffer::from_slice(&[100.0f32]);
        conv.forward(
            &handle, 2.0, &x_desc, &x, &w_desc, &w, &bound, 0.5, &y_desc, &y, None,
        )
        .unwrap();
        // 2 * (1 + 4) + 0.5 * 100
        assert_eq!(y.to_vec(), vec![60.0]);
    }

    #[test]
    fn test_forward_rejects_foreign_algorithm() {
        let rt = Runtime::reference();
        let handle = Handle::new(&rt);
        let conv =
            ConvolutionDescriptor::new(&rt, ConvolutionParams::new(&[0, 0], &[1, 1], &[1, 1]))
                .unwrap();
        let x_desc = TensorDescriptor::with_shape(&rt, DataType::Float32, &[1, 1, 3, 3]).unwrap();
        let w_desc = TensorDescriptor::with_shape(&rt, DataType::Float32, &[1, 1, 2, 2]).unwrap();
        let y_desc = TensorDescriptor::with_shape(&rt, DataType::Float32, &[1, 1, 2, 2]).unwrap();
        let bound = plan_forward(&handle, &conv, &x_desc, &w_desc, &y_desc);

        // Same conv, different problem.
        let x2 = TensorDescriptor::with_shape(&rt, DataType::Float32, &[2, 1, 3, 3]).unwrap();
        let y2 = TensorDescriptor::with_shape(&rt, DataType::Float32, &[2, 1, 2, 2]).unwrap();
        let (x, w, y) = (
            HostBuffer::<f32>::new(18),
            HostBuffer::<f32>::new(4),
            HostBuffer::<f32>::new(8),
        );
        let err = conv
            .forward(&handle, 1.0, &x2, &x, &w_desc, &w, &bound, 0.0, &y2, &y, None)
            .unwrap_err();
        assert!(matches!(err, DnnError::BadParam { .. }));
    }

    #[test]
    fn test_forward_rejects_wrong_output_shape() {
        let rt = Runtime::reference();
        let handle = Handle::new(&rt);
        let conv =
            ConvolutionDescriptor::new(&rt, ConvolutionParams::new(&[0, 0], &[1, 1], &[1, 1]))
                .unwrap();
        let x_desc = TensorDescriptor::with_shape(&rt, DataType::Float32, &[1, 1, 3, 3]).unwrap();
        let w_desc = TensorDescriptor::with_shape(&rt, DataType::Float32, &[1, 1, 2, 2]).unwrap();
        let y_desc = TensorDescriptor::with_shape(&rt, DataType::Float32, &[1, 1, 2, 2]).unwrap();
        let bound = plan_forward(&handle, &conv, &x_desc, &w_desc, &y_desc);

        let wrong = TensorDescriptor::with_shape(&rt, DataType::Float32, &[1, 1, 3, 3]).unwrap();
        let (x, w, y) = (
            HostBuffer::<f32>::new(9),
            HostBuffer::<f32>::new(4),
            HostBuffer::<f32>::new(9),
        );
        let err = conv
            .forward(&handle, 1.0, &x_desc, &x, &w_desc, &w, &bound, 0.0, &wrong, &y, None)
            .unwrap_err();
        assert!(matches!(err, DnnError::InvalidValue { .. }));
    }

    #[test]
    fn test_bias_roundtrip() {
        let rt = Runtime::reference();
        let handle = Handle::new(&rt);
        let y_desc = TensorDescriptor::with_shape(&rt, DataType::Float32, &[1, 2, 1, 2]).unwrap();
        let b_desc = TensorDescriptor::with_shape(&rt, DataType::Float32, &[1, 2, 1, 1]).unwrap();
        let y = HostBuffer::from_slice(&[1.0f32, 1.0, 1.0, 1.0]);
        let b = HostBuffer::from_slice(&[10.0f32, 20.0]);
        forward_bias(&handle, 1.0, &b_desc, &b, 1.0, &y_desc, &y).unwrap();
        assert_eq!(y.to_vec(), vec![11.0, 11.0, 21.0, 21.0]);

        let db = HostBuffer::<f32>::new(2);
        backward_bias(&handle, 1.0, &y_desc, &y, 0.0, &b_desc, &db).unwrap();
        assert_eq!(db.to_vec(), vec![22.0, 42.0]);
    }

    #[test]
    fn test_bias_shape_checked() {
        let rt = Runtime::reference();
        let handle = Handle::new(&rt);
        let y_desc = TensorDescriptor::with_shape(&rt, DataType::Float32, &[1, 2, 1, 2]).unwrap();
        let b_desc = TensorDescriptor::with_shape(&rt, DataType::Float32, &[1, 3, 1, 1]).unwrap();
        let y = HostBuffer::<f32>::new(4);
        let b = HostBuffer::<f32>::new(3);
        let err = forward_bias(&handle, 1.0, &b_desc, &b, 0.0, &y_desc, &y).unwrap_err();
        assert!(matches!(err, DnnError::BadParam { .. }));
    }
}

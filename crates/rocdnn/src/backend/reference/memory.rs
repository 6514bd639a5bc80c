//! Host views of tensors and scratch buffers.
//!
//! Kernels of the reference backend work on dense `f32` vectors in logical
//! row-major order. [`load`] gathers a strided tensor into such a vector and
//! [`store`] scatters one back with `alpha`/`beta` blending; half-precision
//! tensors are widened and narrowed on the way.

use crate::memory::DevicePtr;
use crate::scalar::Scalar;
use crate::tensor::TensorLayout;
use crate::types::DataType;
use crate::{DnnError, DnnResult};
use half::f16;

/// Element offsets of `layout`, visited in logical row-major order.
pub(super) fn offsets(layout: &TensorLayout) -> Vec<usize> {
    let volume = layout.volume();
    let mut out = Vec::with_capacity(volume);
    if volume == 0 {
        return out;
    }
    let dims = layout.dims_usize();
    let strides: Vec<usize> = layout.strides.iter().map(|&s| s.max(0) as usize).collect();
    let mut index = vec![0usize; dims.len()];
    for _ in 0..volume {
        out.push(index.iter().zip(&strides).map(|(i, s)| i * s).sum());
        for d in (0..dims.len()).rev() {
            index[d] += 1;
            if index[d] < dims[d] {
                break;
            }
            index[d] = 0;
        }
    }
    out
}

fn check_float(op: &'static str, data_type: DataType) -> DnnResult<()> {
    if data_type.is_floating_point() {
        Ok(())
    } else {
        Err(DnnError::not_implemented(
            op,
            format!("reference kernels compute in float16/float32, not {data_type}"),
        ))
    }
}

/// Gather a tensor into a dense vector.
pub(super) fn load(op: &'static str, layout: &TensorLayout, ptr: DevicePtr) -> DnnResult<Vec<f32>> {
    check_float(op, layout.data_type)?;
    let base = ptr.as_mut_ptr();
    let values = offsets(layout)
        .into_iter()
        .map(|off| {
            // Safety: callers validated that the buffer spans the layout.
            unsafe {
                match layout.data_type {
                    DataType::Float16 => base.cast::<f16>().add(off).read_unaligned().to_f32(),
                    _ => base.cast::<f32>().add(off).read_unaligned(),
                }
            }
        })
        .collect();
    Ok(values)
}

/// Scatter `values` into a tensor as `alpha * value + beta * dst`.
///
/// A zero `beta` never reads the destination, so it may hold garbage.
pub(super) fn store(
    op: &'static str,
    layout: &TensorLayout,
    ptr: DevicePtr,
    values: &[f32],
    alpha: Scalar,
    beta: Scalar,
) -> DnnResult<()> {
    check_float(op, layout.data_type)?;
    let offsets = offsets(layout);
    if offsets.len() != values.len() {
        return Err(DnnError::internal(
            op,
            format!("{} values for a tensor of {}", values.len(), offsets.len()),
        ));
    }
    let base = ptr.as_mut_ptr();
    let (alpha, beta) = (alpha.value(), beta.value());
    for (off, &value) in offsets.into_iter().zip(values) {
        // Safety: callers validated that the buffer spans the layout.
        unsafe {
            match layout.data_type {
                DataType::Float16 => {
                    let dst = base.cast::<f16>().add(off);
                    let blended = if beta == 0.0 {
                        alpha * value
                    } else {
                        alpha * value + beta * dst.read_unaligned().to_f32()
                    };
                    dst.write_unaligned(f16::from_f32(blended));
                }
                _ => {
                    let dst = base.cast::<f32>().add(off);
                    let blended = if beta == 0.0 {
                        alpha * value
                    } else {
                        alpha * value + beta * dst.read_unaligned()
                    };
                    dst.write_unaligned(blended);
                }
            }
        }
    }
    Ok(())
}

/// Write `values` verbatim.
pub(super) fn overwrite(
    op: &'static str,
    layout: &TensorLayout,
    ptr: DevicePtr,
    values: &[f32],
) -> DnnResult<()> {
    store(op, layout, ptr, values, Scalar::ONE, Scalar::ZERO)
}

/// A scratch region as bytes.
///
/// # Safety
///
/// `ptr` must be valid for `len` bytes and not otherwise borrowed while the
/// slice lives.
pub(super) unsafe fn bytes_mut<'a>(ptr: DevicePtr, len: usize) -> &'a mut [u8] {
    if len == 0 || ptr.is_null() {
        return &mut [];
    }
    std::slice::from_raw_parts_mut(ptr.as_mut_ptr().cast::<u8>(), len)
}

/// A scratch region as `f32` values, `len` elements long.
///
/// # Safety
///
/// Same as [`bytes_mut`], for `len * 4` bytes.
pub(super) unsafe fn floats_mut<'a>(ptr: DevicePtr, len: usize) -> &'a mut [f32] {
    if len == 0 || ptr.is_null() {
        return &mut [];
    }
    std::slice::from_raw_parts_mut(ptr.as_mut_ptr().cast::<f32>(), len)
}

/// Load a per-channel vector, or `None` for a null pointer.
pub(super) fn load_optional(
    op: &'static str,
    layout: &TensorLayout,
    ptr: DevicePtr,
) -> DnnResult<Option<Vec<f32>>> {
    if ptr.is_null() {
        Ok(None)
    } else {
        load(op, layout, ptr).map(Some)
    }
}

/// Store a per-channel vector unless the pointer is null.
pub(super) fn store_optional(
    op: &'static str,
    layout: &TensorLayout,
    ptr: DevicePtr,
    values: &[f32],
) -> DnnResult<()> {
    if ptr.is_null() {
        Ok(())
    } else {
        overwrite(op, layout, ptr, values)
    }
}

//! Tensor descriptors and whole-tensor operations.
//!
//! A [`TensorDescriptor`] describes shape, stride and element type of a
//! tensor living in device memory. Descriptors are reference counted: clones
//! share one backend descriptor, which is destroyed with the last clone.
//!
//! # Layout rules
//!
//! - rank is between 1 and [`MAX_TENSOR_RANK`]
//! - every dimension and stride is positive
//! - `dims.len() == strides.len()`
//! - omitted strides are the canonical row-major strides of the shape
//!   (`[2, 3, 4]` gives `[12, 4, 1]`)

use crate::backend::{DescriptorConfig, DescriptorKind, RawDescriptor, TensorArg};
use crate::handle::Handle;
use crate::memory::{ensure_capacity, DeviceMemory};
use crate::runtime::{OwnedDescriptor, Runtime};
use crate::scalar::Scalar;
use crate::types::{DataType, TensorOp};
use crate::{DnnError, DnnResult};
use parking_lot::RwLock;
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;

/// Maximum tensor rank.
pub const MAX_TENSOR_RANK: usize = 5;

/// Dimension or stride list.
pub type Dims = SmallVec<[i32; MAX_TENSOR_RANK]>;

/// Shape, stride and element type of a tensor.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TensorLayout {
    /// Element type.
    pub data_type: DataType,
    /// Extent of each dimension, outermost first.
    pub dims: Dims,
    /// Element stride of each dimension.
    pub strides: Dims,
}

impl TensorLayout {
    /// Validate and build a layout; `strides: None` means canonical strides.
    ///
    /// # Errors
    ///
    /// Returns [`DnnError::InvalidValue`] if the rank is outside
    /// `1..=MAX_TENSOR_RANK`, a dimension or stride is not
    /// positive, or the stride count differs from the rank.
    pub fn new(data_type: DataType, dims: &[i32], strides: Option<&[i32]>) -> DnnResult<Self> {
        const OP: &str = "TensorLayout::new";

        if dims.is_empty() || dims.len() > MAX_TENSOR_RANK {
            return Err(DnnError::invalid_value(
                OP,
                format!("rank {} outside 1..={MAX_TENSOR_RANK}", dims.len()),
            ));
        }
        if let Some(d) = dims.iter().find(|&&d| d <= 0) {
            return Err(DnnError::invalid_value(OP, format!("non-positive dimension {d}")));
        }
        let strides = match strides {
            Some(s) if s.len() != dims.len() => {
                return Err(DnnError::invalid_value(
                    OP,
                    format!("{} strides for rank {}", s.len(), dims.len()),
                ));
            }
            Some(s) => {
                if let Some(bad) = s.iter().find(|&&v| v <= 0) {
                    return Err(DnnError::invalid_value(
                        OP,
                        format!("non-positive stride {bad}"),
                    ));
                }
                s.iter().copied().collect()
            }
            None => Self::canonical_strides(dims),
        };
        Ok(Self {
            data_type,
            dims: dims.iter().copied().collect(),
            strides,
        })
    }

    /// A densely packed layout.
    ///
    /// # Errors
    ///
    /// Same as [`TensorLayout::new`].
    pub fn packed(data_type: DataType, dims: &[i32]) -> DnnResult<Self> {
        Self::new(data_type, dims, None)
    }

    /// Row-major strides of `dims`: the last dimension is contiguous.
    #[must_use]
    pub fn canonical_strides(dims: &[i32]) -> Dims {
        let mut strides: Dims = SmallVec::from_elem(1, dims.len());
        let mut acc = 1i32;
        for i in (0..dims.len()).rev() {
            strides[i] = acc;
            acc = acc.saturating_mul(dims[i].max(1));
        }
        strides
    }

    /// Number of dimensions.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Number of elements (product of the dimensions).
    #[must_use]
    pub fn volume(&self) -> usize {
        self.dims.iter().map(|&d| d.max(0) as usize).product()
    }

    /// Elements between the first and one past the last addressed element.
    #[must_use]
    pub fn span_elements(&self) -> usize {
        if self.volume() == 0 {
            return 0;
        }
        1 + self
            .dims
            .iter()
            .zip(&self.strides)
            .map(|(&d, &s)| (d as usize - 1) * s as usize)
            .sum::<usize>()
    }

    /// Bytes a buffer must hold for this layout.
    #[must_use]
    pub fn num_bytes(&self) -> usize {
        self.span_elements() * self.data_type.size_bytes()
    }

    /// Whether the strides are the canonical ones.
    #[must_use]
    pub fn is_packed(&self) -> bool {
        self.strides == Self::canonical_strides(&self.dims)
    }

    /// Dimensions as `usize`.
    #[must_use]
    pub fn dims_usize(&self) -> SmallVec<[usize; MAX_TENSOR_RANK]> {
        self.dims.iter().map(|&d| d.max(0) as usize).collect()
    }
}

impl fmt::Display for TensorLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:?}", self.data_type, self.dims.as_slice())
    }
}

struct TensorInner {
    owned: OwnedDescriptor,
    layout: RwLock<Option<TensorLayout>>,
}

/// A reference-counted tensor descriptor.
#[derive(Clone)]
pub struct TensorDescriptor {
    inner: Arc<TensorInner>,
}

impl TensorDescriptor {
    /// Create an empty descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`DnnError::AllocationFailed`] if the backend cannot create
    /// the descriptor.
    pub fn new(runtime: &Runtime) -> DnnResult<Self> {
        Ok(Self {
            inner: Arc::new(TensorInner {
                owned: OwnedDescriptor::create(runtime, DescriptorKind::Tensor)?,
                layout: RwLock::new(None),
            }),
        })
    }

    /// Create a packed descriptor of the given shape.
    ///
    /// # Errors
    ///
    /// Fails on creation failure or an invalid shape.
    pub fn with_shape(runtime: &Runtime, data_type: DataType, dims: &[i32]) -> DnnResult<Self> {
        let desc = Self::new(runtime)?;
        desc.set(data_type, dims, None)?;
        Ok(desc)
    }

    /// Create a descriptor with explicit strides.
    ///
    /// # Errors
    ///
    /// Fails on creation failure or an invalid layout.
    pub fn with_strides(
        runtime: &Runtime,
        data_type: DataType,
        dims: &[i32],
        strides: &[i32],
    ) -> DnnResult<Self> {
        let desc = Self::new(runtime)?;
        desc.set(data_type, dims, Some(strides))?;
        Ok(desc)
    }

    /// Set the layout; `strides: None` derives canonical strides.
    ///
    /// # Errors
    ///
    /// Returns [`DnnError::InvalidValue`] for an invalid layout, or the
    /// backend's error.
    pub fn set(&self, data_type: DataType, dims: &[i32], strides: Option<&[i32]>) -> DnnResult<()> {
        let layout = TensorLayout::new(data_type, dims, strides)?;
        self.set_layout(layout)
    }

    /// Set a prebuilt layout.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub fn set_layout(&self, layout: TensorLayout) -> DnnResult<()> {
        self.inner
            .owned
            .backend()
            .set_descriptor(self.raw(), &DescriptorConfig::Tensor(layout.clone()))?;
        *self.inner.layout.write() = Some(layout);
        Ok(())
    }

    /// Read the layout back from the backend.
    ///
    /// Before the first [`set`](Self::set) this reads
    /// [`MAX_TENSOR_RANK`] dimensions of the backend's default contents.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub fn get(&self) -> DnnResult<TensorLayout> {
        let rank = self
            .inner
            .layout
            .read()
            .as_ref()
            .map_or(MAX_TENSOR_RANK, TensorLayout::rank);
        self.get_with_rank(rank)
    }

    /// Read `rank` dimensions back from the backend.
    pub(crate) fn get_with_rank(&self, rank: usize) -> DnnResult<TensorLayout> {
        match self
            .inner
            .owned
            .backend()
            .get_descriptor(self.raw(), DescriptorKind::Tensor, rank)?
        {
            DescriptorConfig::Tensor(layout) => Ok(layout),
            other => Err(DnnError::internal(
                "TensorDescriptor::get",
                format!("backend returned a {:?} descriptor", other.kind()),
            )),
        }
    }

    /// The layout last set, if any.
    #[must_use]
    pub fn layout(&self) -> Option<TensorLayout> {
        self.inner.layout.read().clone()
    }

    /// Number of elements.
    ///
    /// # Errors
    ///
    /// Returns [`DnnError::BadParam`] if the descriptor was never set.
    pub fn volume(&self) -> DnnResult<usize> {
        Ok(self.require_layout("TensorDescriptor::volume")?.volume())
    }

    /// Bytes the tensor spans, as the backend computes it.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub fn num_bytes(&self) -> DnnResult<usize> {
        self.inner.owned.backend().tensor_num_bytes(self.raw())
    }

    /// Backend id.
    #[must_use]
    pub fn raw(&self) -> RawDescriptor {
        self.inner.owned.raw()
    }

    /// Runtime the descriptor belongs to.
    #[must_use]
    pub fn runtime(&self) -> &Runtime {
        self.inner.owned.runtime()
    }

    /// Whether two values share one backend descriptor.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Set every element of `y` to `value`.
    ///
    /// # Errors
    ///
    /// Fails if the descriptor is unset, `y` is too small, or the backend
    /// rejects the type.
    pub fn set_all(&self, handle: &Handle, y: &dyn DeviceMemory, value: f64) -> DnnResult<()> {
        const OP: &str = "TensorDescriptor::set_all";
        let value = self.scalar(value, OP)?;
        let y = self.arg(y, "y", OP)?;
        handle.backend().set_tensor(handle.raw(), y, value)
    }

    /// Multiply every element of `y` by `alpha`.
    ///
    /// # Errors
    ///
    /// Fails if the descriptor is unset, `y` is too small, or the backend
    /// rejects the type.
    pub fn scale(&self, handle: &Handle, y: &dyn DeviceMemory, alpha: f64) -> DnnResult<()> {
        const OP: &str = "TensorDescriptor::scale";
        let alpha = self.scalar(alpha, OP)?;
        let y = self.arg(y, "y", OP)?;
        handle.backend().scale_tensor(handle.raw(), y, alpha)
    }

    pub(crate) fn require_layout(&self, op: &'static str) -> DnnResult<TensorLayout> {
        self.layout()
            .ok_or_else(|| DnnError::bad_param(op, "tensor descriptor has not been set"))
    }

    pub(crate) fn data_type(&self, op: &'static str) -> DnnResult<DataType> {
        Ok(self.require_layout(op)?.data_type)
    }

    /// A scaling factor in this tensor's scalar representation.
    pub(crate) fn scalar(&self, value: f64, op: &'static str) -> DnnResult<Scalar> {
        Scalar::for_data_type(self.data_type(op)?, value)
    }

    /// Pair with `mem`, checking `mem` covers the layout.
    pub(crate) fn arg(
        &self,
        mem: &dyn DeviceMemory,
        what: &str,
        op: &'static str,
    ) -> DnnResult<TensorArg> {
        let layout = self.require_layout(op)?;
        ensure_capacity(mem, layout.num_bytes(), what, op)?;
        Ok(TensorArg::new(self.raw(), mem.device_ptr()))
    }
}

impl fmt::Debug for TensorDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TensorDescriptor")
            .field("raw", &self.raw())
            .field("layout", &self.layout())
            .finish()
    }
}

/// `y = alpha * x + beta * y`, converting between the two layouts.
///
/// # Errors
///
/// Returns [`DnnError::BadParam`] if the shapes differ, plus the usual
/// descriptor and capacity errors.
#[allow(clippy::too_many_arguments)]
pub fn transform_tensor(
    handle: &Handle,
    alpha: f64,
    x_desc: &TensorDescriptor,
    x: &dyn DeviceMemory,
    beta: f64,
    y_desc: &TensorDescriptor,
    y: &dyn DeviceMemory,
) -> DnnResult<()> {
    const OP: &str = "transform_tensor";
    let xl = x_desc.require_layout(OP)?;
    let yl = y_desc.require_layout(OP)?;
    if xl.dims != yl.dims {
        return Err(DnnError::bad_param(
            OP,
            format!("shape {xl} cannot be transformed into {yl}"),
        ));
    }
    let alpha = y_desc.scalar(alpha, OP)?;
    let beta = y_desc.scalar(beta, OP)?;
    let x = x_desc.arg(x, "x", OP)?;
    let y = y_desc.arg(y, "y", OP)?;
    handle
        .backend()
        .transform_tensor(handle.raw(), alpha, x, beta, y)
}

/// `c = op(alpha1 * a, alpha2 * b) + beta * c`.
///
/// `b` broadcasts: each of its dimensions equals `c`'s or is 1.
///
/// # Errors
///
/// Returns [`DnnError::BadParam`] on incompatible shapes, plus the usual
/// descriptor and capacity errors.
#[allow(clippy::too_many_arguments)]
pub fn op_tensor(
    handle: &Handle,
    op: TensorOp,
    alpha1: f64,
    a_desc: &TensorDescriptor,
    a: &dyn DeviceMemory,
    alpha2: f64,
    b_desc: &TensorDescriptor,
    b: &dyn DeviceMemory,
    beta: f64,
    c_desc: &TensorDescriptor,
    c: &dyn DeviceMemory,
) -> DnnResult<()> {
    const OP: &str = "op_tensor";
    let al = a_desc.require_layout(OP)?;
    let bl = b_desc.require_layout(OP)?;
    let cl = c_desc.require_layout(OP)?;
    if al.dims != cl.dims {
        return Err(DnnError::bad_param(OP, format!("a {al} does not match c {cl}")));
    }
    let broadcastable = bl.rank() == cl.rank()
        && bl
            .dims
            .iter()
            .zip(&cl.dims)
            .all(|(&bd, &cd)| bd == cd || bd == 1);
    if !broadcastable {
        return Err(DnnError::bad_param(
            OP,
            format!("b {bl} does not broadcast to c {cl}"),
        ));
    }
    let alpha1 = c_desc.scalar(alpha1, OP)?;
    let alpha2 = c_desc.scalar(alpha2, OP)?;
    let beta = c_desc.scalar(beta, OP)?;
    let a = a_desc.arg(a, "a", OP)?;
    let b = b_desc.arg(b, "b", OP)?;
    let c = c_desc.arg(c, "c", OP)?;
    handle
        .backend()
        .op_tensor(handle.raw(), op, alpha1, a, alpha2, b, beta, c)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::HostBuffer;

    #[test]
    fn test_canonical_strides() {
        assert_eq!(TensorLayout::canonical_strides(&[2, 3, 4]).as_slice(), &[12, 4, 1]);
        assert_eq!(TensorLayout::canonical_strides(&[7]).as_slice(), &[1]);
    }

    #[test]
    fn test_layout_validation() {
        assert!(TensorLayout::packed(DataType::Float32, &[]).is_err());
        assert!(TensorLayout::packed(DataType::Float32, &[1, 1, 1, 1, 1, 1]).is_err());
        assert!(TensorLayout::packed(DataType::Float32, &[2, -1]).is_err());
        assert!(TensorLayout::packed(DataType::Float32, &[3, 0]).is_err());
        assert!(TensorLayout::new(DataType::Float32, &[2, 3], Some(&[3])).is_err());
        assert!(TensorLayout::new(DataType::Float32, &[2, 3], Some(&[3, 0])).is_err());
    }

    #[test]
    fn test_volume_and_bytes() {
        let layout = TensorLayout::packed(DataType::Float32, &[2, 3, 4]).unwrap();
        assert_eq!(layout.volume(), 24);
        assert_eq!(layout.num_bytes(), 96);
        assert!(layout.is_packed());

        let padded = TensorLayout::new(DataType::Float16, &[2, 3], Some(&[4, 1])).unwrap();
        assert_eq!(padded.span_elements(), 7);
        assert_eq!(padded.num_bytes(), 14);
        assert!(!padded.is_packed());
    }

    #[test]
    fn test_descriptor_roundtrip() {
        let rt = Runtime::reference();
        let desc = TensorDescriptor::with_shape(&rt, DataType::Float32, &[1, 3, 8, 8]).unwrap();
        let layout = desc.get().unwrap();
        assert_eq!(layout.dims.as_slice(), &[1, 3, 8, 8]);
        assert_eq!(layout.strides.as_slice(), &[192, 64, 8, 1]);
        assert_eq!(desc.volume().unwrap(), 192);
        assert_eq!(desc.num_bytes().unwrap(), 768);
    }

    #[test]
    fn test_zero_dimension_is_invalid() {
        let rt = Runtime::reference();
        assert!(matches!(
            TensorDescriptor::with_shape(&rt, DataType::Float32, &[2, 0, 3]),
            Err(DnnError::InvalidValue { .. })
        ));
        let desc = TensorDescriptor::with_shape(&rt, DataType::Float32, &[2, 4, 3]).unwrap();
        assert!(matches!(
            desc.set(DataType::Float32, &[2, 0, 3], None),
            Err(DnnError::InvalidValue { .. })
        ));
        assert_eq!(desc.get().unwrap().dims.as_slice(), &[2, 4, 3]);
    }

    #[test]
    fn test_get_before_set_defaults_to_max_rank() {
        let rt = Runtime::reference();
        let desc = TensorDescriptor::new(&rt).unwrap();
        assert_eq!(desc.get().unwrap().rank(), MAX_TENSOR_RANK);
        assert!(matches!(desc.volume(), Err(DnnError::BadParam { .. })));
    }

    #[test]
    fn test_reset_replaces_layout() {
        let rt = Runtime::reference();
        let desc = TensorDescriptor::with_shape(&rt, DataType::Float32, &[4]).unwrap();
        let shared = desc.clone();
        desc.set(DataType::Float16, &[2, 2], None).unwrap();
        assert!(shared.ptr_eq(&desc));
        assert_eq!(shared.get().unwrap().dims.as_slice(), &[2, 2]);
        assert_eq!(shared.layout().unwrap().data_type, DataType::Float16);
    }

    #[test]
    fn test_set_all_and_scale() {
        let rt = Runtime::reference();
        let handle = Handle::new(&rt);
        let desc = TensorDescriptor::with_shape(&rt, DataType::Float32, &[2, 2]).unwrap();
        let buf = HostBuffer::<f32>::new(4);
        desc.set_all(&handle, &buf, 3.0).unwrap();
        desc.scale(&handle, &buf, 0.5).unwrap();
        assert_eq!(buf.to_vec(), vec![1.5; 4]);
    }

    #[test]
    fn test_set_all_rejects_small_buffer() {
        let rt = Runtime::reference();
        let handle = Handle::new(&rt);
        let desc = TensorDescriptor::with_shape(&rt, DataType::Float32, &[8]).unwrap();
        let buf = HostBuffer::<f32>::new(4);
        let err = desc.set_all(&handle, &buf, 1.0).unwrap_err();
        assert!(matches!(err, DnnError::InvalidValue { .. }));
    }

    #[test]
    fn test_transform_between_layouts() {
        let rt = Runtime::reference();
        let handle = Handle::new(&rt);
        let x_desc = TensorDescriptor::with_shape(&rt, DataType::Float32, &[2, 2]).unwrap();
        let y_desc =
            TensorDescriptor::with_strides(&rt, DataType::Float32, &[2, 2], &[1, 2]).unwrap();
        let x = HostBuffer::from_slice(&[1.0f32, 2.0, 3.0, 4.0]);
        let y = HostBuffer::<f32>::new(4);
        transform_tensor(&handle, 1.0, &x_desc, &x, 0.0, &y_desc, &y).unwrap();
        // Column-major destination.
        assert_eq!(y.to_vec(), vec![1.0, 3.0, 2.0, 4.0]);
    }

    #[test]
    fn test_op_tensor_broadcast() {
        let rt = Runtime::reference();
        let handle = Handle::new(&rt);
        let a_desc = TensorDescriptor::with_shape(&rt, DataType::Float32, &[1, 2, 1, 2]).unwrap();
        let b_desc = TensorDescriptor::with_shape(&rt, DataType::Float32, &[1, 2, 1, 1]).unwrap();
        let a = HostBuffer::from_slice(&[1.0f32, 2.0, 3.0, 4.0]);
        let b = HostBuffer::from_slice(&[10.0f32, 20.0]);
        let c = HostBuffer::filled(4, 1.0f32);
        op_tensor(
            &handle,
            TensorOp::Add,
            1.0,
            &a_desc,
            &a,
            1.0,
            &b_desc,
            &b,
            1.0,
            &a_desc,
            &c,
        )
        .unwrap();
        assert_eq!(c.to_vec(), vec![12.0, 13.0, 24.0, 25.0]);
    }

    #[test]
    fn test_op_tensor_rejects_bad_broadcast() {
        let rt = Runtime::reference();
        let handle = Handle::new(&rt);
        let a_desc = TensorDescriptor::with_shape(&rt, DataType::Float32, &[2, 2]).unwrap();
        let b_desc = TensorDescriptor::with_shape(&rt, DataType::Float32, &[3, 1]).unwrap();
        let buf = HostBuffer::<f32>::new(4);
        let b = HostBuffer::<f32>::new(3);
        let err = op_tensor(
            &handle,
            TensorOp::Mul,
            1.0,
            &a_desc,
            &buf,
            1.0,
            &b_desc,
            &b,
            0.0,
            &a_desc,
            &buf,
        )
        .unwrap_err();
        assert!(matches!(err, DnnError::BadParam { .. }));
    }
}

//! Device memory references.
//!
//! This layer never allocates device memory itself. Operations receive
//! buffers through the [`DeviceMemory`] trait, which yields a raw
//! [`DevicePtr`] and the size of the region behind it.
//!
//! [`HostBuffer`] is a host allocation implementing [`DeviceMemory`]. The
//! reference backend computes directly on such buffers, which makes every
//! protocol of the crate runnable without a GPU.

use crate::types::DataType;
use crate::{DnnError, DnnResult};
use std::alloc::Layout;
use std::fmt;
use std::marker::PhantomData;

/// Alignment of host buffers, matching typical device allocation granularity.
const HOST_BUFFER_ALIGN: usize = 256;

/// An untyped device address.
///
/// The representation depends on the backend: a HIP device pointer for the
/// vendor library, a host address for the reference backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DevicePtr(pub(crate) u64);

impl DevicePtr {
    /// The null pointer.
    #[must_use]
    pub const fn null() -> Self {
        Self(0)
    }

    /// Whether this is the null pointer.
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Raw address.
    #[must_use]
    pub const fn as_raw(self) -> u64 {
        self.0
    }

    /// Wrap a raw address.
    ///
    /// # Safety
    ///
    /// The address must be valid for the backend the pointer is handed to,
    /// for as long as it is used.
    #[must_use]
    pub const unsafe fn from_raw(ptr: u64) -> Self {
        Self(ptr)
    }

    /// Pointer `bytes` past this one.
    #[must_use]
    pub const fn offset(self, bytes: usize) -> Self {
        Self(self.0 + bytes as u64)
    }

    /// The address as a C `void*`.
    #[must_use]
    pub fn as_mut_ptr(self) -> *mut std::ffi::c_void {
        self.0 as usize as *mut std::ffi::c_void
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A region of memory an operation can read or write.
///
/// Implementors guarantee that `device_ptr()` stays valid for
/// `size_bytes()` bytes while the value is borrowed.
pub trait DeviceMemory {
    /// Address of the region.
    fn device_ptr(&self) -> DevicePtr;

    /// Size of the region in bytes.
    fn size_bytes(&self) -> usize;
}

impl<M: DeviceMemory + ?Sized> DeviceMemory for &M {
    fn device_ptr(&self) -> DevicePtr {
        (**self).device_ptr()
    }

    fn size_bytes(&self) -> usize {
        (**self).size_bytes()
    }
}

/// Check that `mem` holds at least `required` bytes.
pub(crate) fn ensure_capacity(
    mem: &dyn DeviceMemory,
    required: usize,
    what: &str,
    op: &'static str,
) -> DnnResult<()> {
    if mem.size_bytes() < required {
        return Err(DnnError::invalid_value(
            op,
            format!(
                "{what} buffer holds {} bytes, {required} required",
                mem.size_bytes()
            ),
        ));
    }
    Ok(())
}

/// Pointer of an optional buffer, null when absent.
pub(crate) fn ptr_or_null(mem: Option<&dyn DeviceMemory>) -> DevicePtr {
    mem.map_or(DevicePtr::null(), DeviceMemory::device_ptr)
}

/// Element types a [`HostBuffer`] can hold.
///
/// # Safety
///
/// Implementors must be plain data: every bit pattern of the right size
/// (including all zeros) is a valid value.
pub unsafe trait Element: Copy + Send + Sync + 'static {
    /// Tensor data type with this element layout, if any.
    const DATA_TYPE: Option<DataType>;
}

unsafe impl Element for f32 {
    const DATA_TYPE: Option<DataType> = Some(DataType::Float32);
}

unsafe impl Element for half::f16 {
    const DATA_TYPE: Option<DataType> = Some(DataType::Float16);
}

unsafe impl Element for i32 {
    const DATA_TYPE: Option<DataType> = Some(DataType::Int32);
}

unsafe impl Element for i8 {
    const DATA_TYPE: Option<DataType> = Some(DataType::Int8);
}

unsafe impl Element for u8 {
    const DATA_TYPE: Option<DataType> = None;
}

/// A zero-initialised host allocation usable as [`DeviceMemory`].
///
/// Backends write through the raw pointer, so contents are only observed
/// through copies ([`HostBuffer::to_vec`]).
pub struct HostBuffer<T: Element> {
    ptr: *mut u8,
    len: usize,
    _marker: PhantomData<T>,
}

// Safety: the buffer exclusively owns its allocation and T is plain data.
unsafe impl<T: Element> Send for HostBuffer<T> {}
unsafe impl<T: Element> Sync for HostBuffer<T> {}

impl<T: Element> HostBuffer<T> {
    /// Allocate `len` zeroed elements.
    ///
    /// # Panics
    ///
    /// Panics if the host allocator fails.
    #[must_use]
    pub fn new(len: usize) -> Self {
        let size = len * std::mem::size_of::<T>();
        let ptr = if size == 0 {
            std::ptr::null_mut()
        } else {
            let layout = Self::layout(size);
            // Safety: layout has non-zero size.
            let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
            if ptr.is_null() {
                std::alloc::handle_alloc_error(layout);
            }
            ptr
        };
        Self {
            ptr,
            len,
            _marker: PhantomData,
        }
    }

    /// Allocate a buffer holding a copy of `data`.
    #[must_use]
    pub fn from_slice(data: &[T]) -> Self {
        let mut buf = Self::new(data.len());
        buf.copy_from_slice(data);
        buf
    }

    /// Allocate `len` elements set to `value`.
    #[must_use]
    pub fn filled(len: usize, value: T) -> Self {
        Self::from_slice(&vec![value; len])
    }

    /// Number of elements.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer has no elements.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Overwrite the contents.
    ///
    /// # Panics
    ///
    /// Panics if `data.len() != self.len()`.
    pub fn copy_from_slice(&mut self, data: &[T]) {
        assert_eq!(data.len(), self.len, "host buffer length mismatch");
        if self.len > 0 {
            // Safety: the allocation holds exactly len elements of T.
            unsafe {
                std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.cast::<T>(), self.len);
            }
        }
    }

    /// Copy the contents out.
    #[must_use]
    pub fn to_vec(&self) -> Vec<T> {
        if self.len == 0 {
            return Vec::new();
        }
        // Safety: the allocation holds len initialised elements of T.
        unsafe { std::slice::from_raw_parts(self.ptr.cast::<T>(), self.len).to_vec() }
    }

    fn layout(size: usize) -> Layout {
        Layout::from_size_align(size, HOST_BUFFER_ALIGN.max(std::mem::align_of::<T>()))
            .unwrap_or_else(|_| panic!("host buffer of {size} bytes exceeds the address space"))
    }
}

impl<T: Element> DeviceMemory for HostBuffer<T> {
    fn device_ptr(&self) -> DevicePtr {
        DevicePtr(self.ptr as usize as u64)
    }

    fn size_bytes(&self) -> usize {
        self.len * std::mem::size_of::<T>()
    }
}

impl<T: Element> Drop for HostBuffer<T> {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            let layout = Self::layout(self.len * std::mem::size_of::<T>());
            // Safety: ptr was allocated with this layout in `new`.
            unsafe { std::alloc::dealloc(self.ptr, layout) };
        }
    }
}

impl<T: Element + fmt::Debug> fmt::Debug for HostBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBuffer")
            .field("ptr", &self.device_ptr())
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_ptr() {
        let ptr = DevicePtr::null();
        assert!(ptr.is_null());
        let ptr = unsafe { DevicePtr::from_raw(0x1000) };
        assert_eq!(ptr.offset(0x100).as_raw(), 0x1100);
        assert_eq!(ptr.to_string(), "0x1000");
    }

    #[test]
    fn test_host_buffer_zeroed() {
        let buf: HostBuffer<f32> = HostBuffer::new(16);
        assert_eq!(buf.len(), 16);
        assert_eq!(buf.size_bytes(), 64);
        assert!(buf.to_vec().iter().all(|&v| v == 0.0));
        assert_eq!(buf.device_ptr().as_raw() % HOST_BUFFER_ALIGN as u64, 0);
    }

    #[test]
    fn test_host_buffer_copy() {
        let mut buf = HostBuffer::from_slice(&[1.0f32, 2.0, 3.0]);
        assert_eq!(buf.to_vec(), vec![1.0, 2.0, 3.0]);
        buf.copy_from_slice(&[4.0, 5.0, 6.0]);
        assert_eq!(buf.to_vec(), vec![4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_empty_buffer() {
        let buf: HostBuffer<u8> = HostBuffer::new(0);
        assert!(buf.is_empty());
        assert!(buf.device_ptr().is_null());
        assert!(buf.to_vec().is_empty());
    }

    #[test]
    fn test_ensure_capacity() {
        let buf: HostBuffer<f32> = HostBuffer::new(4);
        assert!(ensure_capacity(&buf, 16, "x", "test").is_ok());
        let err = ensure_capacity(&buf, 17, "x", "test").unwrap_err();
        assert!(matches!(err, DnnError::InvalidValue { .. }));
    }

    #[test]
    fn test_element_data_types() {
        assert_eq!(<f32 as Element>::DATA_TYPE, Some(DataType::Float32));
        assert_eq!(<half::f16 as Element>::DATA_TYPE, Some(DataType::Float16));
        assert_eq!(<u8 as Element>::DATA_TYPE, None);
    }
}

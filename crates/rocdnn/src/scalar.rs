//! Host scaling factors passed to backend operations.
//!
//! Every operation takes `alpha`/`beta` (and friends) as host values whose
//! native representation depends on the tensor data type. The library reads
//! them as 32-bit floats for all partially supported types, so this layer
//! narrows them the same way.
//!
//! # Type support matrix
//!
//! | Tensor type | Scalar representation | Notes                     |
//! |-------------|-----------------------|---------------------------|
//! | `Float32`   | `f32`                 | exact for `f32` inputs    |
//! | `Float16`   | `f32`                 | widened by the library    |
//! | `Int32`     | `f32`                 | narrowed, not bit-exact   |
//! | `Int8`      | `f32`                 | narrowed, not bit-exact   |
//! | `Int8x4`    | none                  | `NotImplemented`          |

use crate::types::DataType;
use crate::{DnnError, DnnResult};

/// A scaling factor in the representation the backend expects.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Scalar(f32);

impl Scalar {
    /// One.
    pub const ONE: Self = Self(1.0);
    /// Zero.
    pub const ZERO: Self = Self(0.0);

    /// Coerce a host value for use with tensors of `data_type`.
    ///
    /// # Errors
    ///
    /// Returns [`DnnError::NotImplemented`] for `Int8x4`, which has no
    /// scalar representation.
    #[allow(clippy::cast_possible_truncation)]
    pub fn for_data_type(data_type: DataType, value: f64) -> DnnResult<Self> {
        match data_type {
            DataType::Float32 => Ok(Self(value as f32)),
            DataType::Float16 | DataType::Int32 | DataType::Int8 => {
                tracing::trace!(%data_type, value, "narrowing scalar to f32");
                Ok(Self(value as f32))
            }
            DataType::Int8x4 => Err(DnnError::not_implemented(
                "Scalar::for_data_type",
                "int8x4 tensors have no scalar representation",
            )),
        }
    }

    /// The value as the backend reads it.
    #[must_use]
    pub const fn value(self) -> f32 {
        self.0
    }

    /// Whether the factor is exactly zero.
    ///
    /// A zero `beta` means the destination is write-only.
    #[must_use]
    pub fn is_zero(self) -> bool {
        self.0 == 0.0
    }

    /// Pointer to the value, for native calls taking `const void*`.
    #[must_use]
    pub fn as_ptr(&self) -> *const std::ffi::c_void {
        std::ptr::addr_of!(self.0).cast()
    }
}

impl From<f32> for Scalar {
    fn from(value: f32) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_types_coerce() {
        assert_eq!(
            Scalar::for_data_type(DataType::Float32, 0.5).unwrap().value(),
            0.5
        );
        assert_eq!(
            Scalar::for_data_type(DataType::Float16, 2.0).unwrap().value(),
            2.0
        );
    }

    #[test]
    fn test_integer_types_narrow() {
        let s = Scalar::for_data_type(DataType::Int32, 1.0e10).unwrap();
        assert_eq!(s.value(), 1.0e10_f32);
        assert!(Scalar::for_data_type(DataType::Int8, 3.0).is_ok());
    }

    #[test]
    fn test_int8x4_rejected() {
        let err = Scalar::for_data_type(DataType::Int8x4, 1.0).unwrap_err();
        assert!(matches!(err, DnnError::NotImplemented { .. }));
    }

    #[test]
    fn test_zero() {
        assert!(Scalar::ZERO.is_zero());
        assert!(!Scalar::ONE.is_zero());
    }
}

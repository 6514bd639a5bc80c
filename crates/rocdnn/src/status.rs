//! Backend status codes.
//!
//! Every native call returns a status code. [`Status::check`] converts it to
//! a [`DnnError`] tagged with the operation name right at the call site, so
//! no status is ever dropped on the floor.

use crate::{DnnError, DnnResult};
use std::fmt;

/// Native status codes, numbered as the vendor library numbers them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Status {
    /// Call completed.
    Success = 0,
    /// Library or handle not initialized.
    NotInitialized = 1,
    /// Invalid argument value.
    InvalidValue = 2,
    /// Inconsistent arguments.
    BadParam = 3,
    /// Allocation failed.
    AllocFailed = 4,
    /// Internal failure.
    InternalError = 5,
    /// Not implemented.
    NotImplemented = 6,
    /// Unknown failure.
    UnknownError = 7,
    /// Unsupported operation.
    UnsupportedOp = 8,
}

impl Status {
    /// Decode a raw status code.
    #[must_use]
    pub const fn from_raw(code: i32) -> Option<Self> {
        Some(match code {
            0 => Self::Success,
            1 => Self::NotInitialized,
            2 => Self::InvalidValue,
            3 => Self::BadParam,
            4 => Self::AllocFailed,
            5 => Self::InternalError,
            6 => Self::NotImplemented,
            7 => Self::UnknownError,
            8 => Self::UnsupportedOp,
            _ => return None,
        })
    }

    /// The native status name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Success => "miopenStatusSuccess",
            Self::NotInitialized => "miopenStatusNotInitialized",
            Self::InvalidValue => "miopenStatusInvalidValue",
            Self::BadParam => "miopenStatusBadParm",
            Self::AllocFailed => "miopenStatusAllocFailed",
            Self::InternalError => "miopenStatusInternalError",
            Self::NotImplemented => "miopenStatusNotImplemented",
            Self::UnknownError => "miopenStatusUnknownError",
            Self::UnsupportedOp => "miopenStatusUnsupportedOp",
        }
    }

    /// Convert a non-success status into an error for `op`.
    ///
    /// Returns `None` for [`Status::Success`].
    #[must_use]
    pub fn into_error(self, op: &'static str) -> Option<DnnError> {
        let reason = self.name().to_string();
        Some(match self {
            Self::Success => return None,
            Self::NotInitialized => DnnError::NotInitialized { op },
            Self::InvalidValue => DnnError::InvalidValue { op, reason },
            Self::BadParam => DnnError::BadParam { op, reason },
            Self::AllocFailed => DnnError::AllocationFailed { op },
            Self::InternalError => DnnError::InternalError { op, reason },
            Self::NotImplemented => DnnError::NotImplemented { op, reason },
            Self::UnknownError => DnnError::UnknownError {
                op,
                code: Self::UnknownError as i32,
            },
            Self::UnsupportedOp => DnnError::UnsupportedOp { op, reason },
        })
    }

    /// Check a raw status code returned by `op`.
    ///
    /// # Errors
    ///
    /// Returns the typed error for any non-success code. Codes outside the
    /// known range become [`DnnError::UnknownError`] carrying the raw value.
    pub fn check(code: i32, op: &'static str) -> DnnResult<()> {
        match Self::from_raw(code) {
            Some(status) => status.into_error(op).map_or(Ok(()), Err),
            None => Err(DnnError::UnknownError { op, code }),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for code in 0..=8 {
            let status = Status::from_raw(code).unwrap();
            assert_eq!(status as i32, code);
        }
        assert_eq!(Status::from_raw(9), None);
    }

    #[test]
    fn test_check_success() {
        assert!(Status::check(0, "miopenCreate").is_ok());
    }

    #[test]
    fn test_check_carries_operation() {
        let err = Status::check(3, "miopenConvolutionForward").unwrap_err();
        assert!(matches!(
            err,
            DnnError::BadParam { op: "miopenConvolutionForward", .. }
        ));
        assert!(err.to_string().contains("miopenStatusBadParm"));
    }

    #[test]
    fn test_check_unknown_code() {
        let err = Status::check(42, "miopenGetStream").unwrap_err();
        assert!(matches!(err, DnnError::UnknownError { code: 42, .. }));
    }
}

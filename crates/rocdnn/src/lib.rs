//! # rocdnn
//!
//! Typed descriptors, convolution algorithm planning and fusion plans over an
//! MIOpen-style library of GPU deep-learning primitives.
//!
//! ## Overview
//!
//! The crate owns the parts of a DNN binding that are protocols rather than
//! kernels:
//!
//! - **Descriptors**: tensor, convolution, activation, pooling, LRN, batch-norm
//!   and RNN descriptors with reference-counted lifetime
//! - **Handle**: the execution context bound to one device queue
//! - **Algorithm planning**: workspace query, benchmark search and binding of a
//!   convolution algorithm, one type-distinct protocol per direction
//! - **Convolution execution**: forward, backward-data, backward-weights and
//!   bias passes with `alpha`/`beta` accumulation
//! - **Fusion plans**: operator chains compiled once and executed many times
//!
//! Numerical kernels live behind the [`Backend`](backend::Backend) trait.
//!
//! ## Architecture
//!
//! ```text
//!     ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//!     │ Descriptors  │──▶│   Planner    │──▶│  Executor    │
//!     └──────┬───────┘   └──────┬───────┘   └──────┬───────┘
//!            │                  │                  │
//!            │           ┌──────┴───────┐          │
//!            └──────────▶│ Fusion plans │◀─────────┘
//!                        └──────┬───────┘
//!                               ▼
//!                  ┌─────────────────────────┐
//!                  │ Runtime (dyn Backend)   │
//!                  └────────────┬────────────┘
//!                 ┌─────────────┴─────────────┐
//!                 ▼                           ▼
//!       ┌──────────────────┐        ┌──────────────────┐
//!       │ ReferenceBackend │        │  MiopenBackend   │
//!       │  (host memory)   │        │ (libMIOpen.so)   │
//!       └──────────────────┘        └──────────────────┘
//! ```
//!
//! ## Features
//!
//! - `rocm`: load `libMIOpen` and `libamdhip64` at runtime and forward calls
//!   to them
//!
//! ## Usage
//!
//! ```rust,ignore
//! use rocdnn::{ConvolutionDescriptor, ConvolutionParams, DataType, Handle, Runtime, TensorDescriptor};
//!
//! let rt = Runtime::reference();
//! let handle = Handle::new(&rt);
//!
//! let x = TensorDescriptor::with_shape(&rt, DataType::Float32, &[1, 3, 8, 8])?;
//! let w = TensorDescriptor::with_shape(&rt, DataType::Float32, &[4, 3, 3, 3])?;
//! let conv = ConvolutionDescriptor::new(&rt, ConvolutionParams::new(&[1, 1], &[1, 1], &[1, 1]))?;
//!
//! assert_eq!(conv.forward_output_dim(&x, &w)?, vec![1, 4, 8, 8]);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod activation;
pub mod backend;
pub mod batchnorm;
pub mod config;
pub mod convolution;
pub mod fusion;
pub mod handle;
pub mod lrn;
pub mod memory;
pub mod pooling;
pub mod rnn;
pub mod runtime;
pub mod scalar;
pub mod softmax;
pub mod status;
pub mod stream;
pub mod tensor;
pub mod types;

use thiserror::Error;

pub use activation::{ActivationDescriptor, ActivationParams};
pub use batchnorm::{BatchNorm, TrainingOutputs};
pub use config::{BackendKind, Config, FindConfig, LibraryConfig};
pub use convolution::{
    BackwardData, BackwardWeights, BoundAlgorithm, ConvAlgorithm, ConvDirection,
    ConvolutionDescriptor, ConvolutionParams, Forward, PerformanceRecord, Planner, PlannerState,
};
pub use fusion::{
    ActivationCoefficients, ConvForwardOp, FusionOp, FusionOpKind, FusionPlan, OperatorArgs,
    PlanState,
};
pub use handle::Handle;
pub use lrn::{LrnDescriptor, LrnParams};
pub use memory::{DeviceMemory, DevicePtr, Element, HostBuffer};
pub use pooling::{PoolingDescriptor, PoolingParams};
pub use rnn::{RnnDescriptor, RnnParams};
pub use runtime::Runtime;
pub use scalar::Scalar;
pub use status::Status;
pub use stream::{HostStream, Streamer};
pub use tensor::{TensorDescriptor, TensorLayout, MAX_TENSOR_RANK};
pub use types::{
    ActivationMode, BatchNormMode, ConvBwdDataAlgorithm, ConvBwdWeightsAlgorithm,
    ConvFwdAlgorithm, ConvolutionMode, DataType, FusionDirection, IndexType, LrnMode, PoolingMode,
    RnnAlgorithm, RnnBiasMode, RnnDirection, RnnInputMode, RnnMode, TensorOp,
};

/// Errors raised by descriptor, planning, execution and fusion operations.
///
/// The first eight variants mirror the backend status codes (see
/// [`Status`]); every one names the operation that produced it.
#[derive(Debug, Error)]
pub enum DnnError {
    /// The backend (or a handle) was used before initialization.
    #[error("{op}: not initialized")]
    NotInitialized {
        /// Operation that failed.
        op: &'static str,
    },

    /// An argument value is outside what the operation accepts.
    #[error("{op}: invalid value: {reason}")]
    InvalidValue {
        /// Operation that failed.
        op: &'static str,
        /// What was wrong.
        reason: String,
    },

    /// Arguments are individually valid but inconsistent with each other.
    #[error("{op}: bad parameter: {reason}")]
    BadParam {
        /// Operation that failed.
        op: &'static str,
        /// What was wrong.
        reason: String,
    },

    /// The backend could not allocate an object or device resource.
    #[error("{op}: allocation failed")]
    AllocationFailed {
        /// Operation that failed.
        op: &'static str,
    },

    /// The backend reported an internal failure.
    #[error("{op}: internal error: {reason}")]
    InternalError {
        /// Operation that failed.
        op: &'static str,
        /// Backend detail.
        reason: String,
    },

    /// The requested feature exists in the API but is not implemented.
    #[error("{op}: not implemented: {reason}")]
    NotImplemented {
        /// Operation that failed.
        op: &'static str,
        /// Missing feature.
        reason: String,
    },

    /// The backend returned a status code outside the known set.
    #[error("{op}: unknown status code {code}")]
    UnknownError {
        /// Operation that failed.
        op: &'static str,
        /// Raw status code.
        code: i32,
    },

    /// The combination of operators or types is not supported.
    #[error("{op}: unsupported operation: {reason}")]
    UnsupportedOp {
        /// Operation that failed.
        op: &'static str,
        /// Unsupported combination.
        reason: String,
    },

    /// The call is not allowed in the object's current protocol state.
    #[error("{op}: invalid state: {reason}")]
    InvalidState {
        /// Operation that failed.
        op: &'static str,
        /// Current state.
        reason: String,
    },

    /// An algorithm search produced no usable candidate.
    #[error("{op}: no applicable algorithm: {reason}")]
    SearchFailed {
        /// Operation that failed.
        op: &'static str,
        /// Why nothing applied.
        reason: String,
    },

    /// The vendor runtime could not be loaded.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Configuration file could not be parsed.
    #[error("configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// I/O error while reading configuration.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DnnError {
    /// Build an [`DnnError::InvalidValue`].
    pub fn invalid_value(op: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            op,
            reason: reason.into(),
        }
    }

    /// Build a [`DnnError::BadParam`].
    pub fn bad_param(op: &'static str, reason: impl Into<String>) -> Self {
        Self::BadParam {
            op,
            reason: reason.into(),
        }
    }

    /// Build a [`DnnError::InvalidState`].
    pub fn invalid_state(op: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidState {
            op,
            reason: reason.into(),
        }
    }

    /// Build a [`DnnError::NotImplemented`].
    pub fn not_implemented(op: &'static str, reason: impl Into<String>) -> Self {
        Self::NotImplemented {
            op,
            reason: reason.into(),
        }
    }

    /// Build a [`DnnError::UnsupportedOp`].
    pub fn unsupported(op: &'static str, reason: impl Into<String>) -> Self {
        Self::UnsupportedOp {
            op,
            reason: reason.into(),
        }
    }

    /// Build a [`DnnError::InternalError`].
    pub fn internal(op: &'static str, reason: impl Into<String>) -> Self {
        Self::InternalError {
            op,
            reason: reason.into(),
        }
    }

    /// The backend status this error corresponds to, if any.
    #[must_use]
    pub const fn status(&self) -> Option<Status> {
        match self {
            Self::NotInitialized { .. } => Some(Status::NotInitialized),
            Self::InvalidValue { .. } => Some(Status::InvalidValue),
            Self::BadParam { .. } => Some(Status::BadParam),
            Self::AllocationFailed { .. } => Some(Status::AllocFailed),
            Self::InternalError { .. } => Some(Status::InternalError),
            Self::NotImplemented { .. } => Some(Status::NotImplemented),
            Self::UnknownError { .. } => Some(Status::UnknownError),
            Self::UnsupportedOp { .. } => Some(Status::UnsupportedOp),
            _ => None,
        }
    }

    /// Name of the operation that produced the error.
    #[must_use]
    pub const fn op(&self) -> Option<&'static str> {
        match self {
            Self::NotInitialized { op }
            | Self::AllocationFailed { op }
            | Self::UnknownError { op, .. }
            | Self::InvalidValue { op, .. }
            | Self::BadParam { op, .. }
            | Self::InternalError { op, .. }
            | Self::NotImplemented { op, .. }
            | Self::UnsupportedOp { op, .. }
            | Self::InvalidState { op, .. }
            | Self::SearchFailed { op, .. } => Some(*op),
            Self::BackendUnavailable(_) | Self::Config(_) | Self::Io(_) => None,
        }
    }
}

/// Result type for DNN operations.
pub type DnnResult<T> = Result<T, DnnError>;

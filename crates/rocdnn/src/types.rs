//! Closed enumerations for every flag family of the library.
//!
//! Each enum is `#[repr(i32)]` with the native value of its variant, so the
//! same value travels unchanged through the FFI boundary.

use std::fmt;

macro_rules! native_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $(
                $(#[$vmeta:meta])*
                $variant:ident = $value:literal => $label:literal
            ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        #[repr(i32)]
        pub enum $name {
            $(
                $(#[$vmeta])*
                $variant = $value,
            )+
        }

        impl $name {
            /// Every variant, in native order.
            pub const ALL: &'static [Self] = &[$(Self::$variant),+];

            /// Native value of this variant.
            #[must_use]
            pub const fn as_raw(self) -> i32 {
                self as i32
            }

            /// Decode a native value.
            #[must_use]
            pub const fn from_raw(raw: i32) -> Option<Self> {
                match raw {
                    $($value => Some(Self::$variant),)+
                    _ => None,
                }
            }

            /// Human-readable name.
            #[must_use]
            pub const fn name(self) -> &'static str {
                match self {
                    $(Self::$variant => $label,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.name())
            }
        }
    };
}

native_enum! {
    /// Element type of a tensor.
    pub enum DataType {
        /// 16-bit IEEE float.
        Float16 = 0 => "float16",
        /// 32-bit IEEE float.
        Float32 = 1 => "float32",
        /// 32-bit signed integer (partial backend support).
        Int32 = 2 => "int32",
        /// 8-bit signed integer (partial backend support).
        Int8 = 3 => "int8",
        /// Four packed 8-bit integers (partial backend support).
        Int8x4 = 4 => "int8x4",
    }
}

impl DataType {
    /// Size of one element in bytes.
    #[must_use]
    pub const fn size_bytes(self) -> usize {
        match self {
            Self::Float16 => 2,
            Self::Float32 | Self::Int32 | Self::Int8x4 => 4,
            Self::Int8 => 1,
        }
    }

    /// Whether the type is a floating point format.
    #[must_use]
    pub const fn is_floating_point(self) -> bool {
        matches!(self, Self::Float16 | Self::Float32)
    }
}

native_enum! {
    /// Convolution arithmetic.
    pub enum ConvolutionMode {
        /// Cross-correlation (the usual deep-learning convolution).
        CrossCorrelation = 0 => "cross-correlation",
        /// Transposed convolution.
        Transpose = 1 => "transpose",
    }
}

native_enum! {
    /// Forward convolution algorithms.
    pub enum ConvFwdAlgorithm {
        /// im2col followed by a matrix multiply.
        Gemm = 0 => "gemm",
        /// Direct sliding-window kernel.
        Direct = 1 => "direct",
        /// Frequency-domain convolution.
        Fft = 2 => "fft",
        /// Winograd minimal filtering.
        Winograd = 3 => "winograd",
        /// Implicit GEMM without an explicit im2col buffer.
        ImplicitGemm = 5 => "implicit-gemm",
    }
}

native_enum! {
    /// Backward-data convolution algorithms.
    pub enum ConvBwdDataAlgorithm {
        /// Matrix multiply followed by col2im.
        Gemm = 0 => "gemm",
        /// Direct kernel.
        Direct = 1 => "direct",
        /// Frequency-domain convolution.
        Fft = 2 => "fft",
        /// Winograd minimal filtering.
        Winograd = 3 => "winograd",
        /// GEMM on the transposed problem.
        TransposeGemm = 4 => "transpose-gemm",
        /// Implicit GEMM.
        ImplicitGemm = 5 => "implicit-gemm",
    }
}

native_enum! {
    /// Backward-weights convolution algorithms.
    pub enum ConvBwdWeightsAlgorithm {
        /// im2col followed by a matrix multiply.
        Gemm = 0 => "gemm",
        /// Direct kernel.
        Direct = 1 => "direct",
        /// Winograd minimal filtering.
        Winograd = 3 => "winograd",
        /// Implicit GEMM.
        ImplicitGemm = 5 => "implicit-gemm",
    }
}

native_enum! {
    /// Pooling reduction.
    pub enum PoolingMode {
        /// Window maximum.
        Max = 0 => "max",
        /// Window mean over in-bounds elements only.
        Average = 1 => "average",
        /// Window mean counting padding as zeros.
        AverageInclusive = 2 => "average-inclusive",
    }
}

native_enum! {
    /// Width of the indices a max-pooling forward pass records.
    pub enum IndexType {
        /// 8-bit indices.
        Uint8 = 0 => "uint8",
        /// 16-bit indices.
        Uint16 = 1 => "uint16",
        /// 32-bit indices.
        Uint32 = 2 => "uint32",
        /// 64-bit indices.
        Uint64 = 3 => "uint64",
    }
}

impl IndexType {
    /// Size of one index in bytes.
    #[must_use]
    pub const fn size_bytes(self) -> usize {
        match self {
            Self::Uint8 => 1,
            Self::Uint16 => 2,
            Self::Uint32 => 4,
            Self::Uint64 => 8,
        }
    }

    /// Largest index representable.
    #[must_use]
    pub const fn max_index(self) -> u64 {
        match self {
            Self::Uint8 => u8::MAX as u64,
            Self::Uint16 => u16::MAX as u64,
            Self::Uint32 => u32::MAX as u64,
            Self::Uint64 => u64::MAX,
        }
    }
}

impl Default for IndexType {
    fn default() -> Self {
        Self::Uint8
    }
}

native_enum! {
    /// Activation functions.
    ///
    /// `alpha`, `beta` and `gamma` are the descriptor's activation parameters.
    pub enum ActivationMode {
        /// `y = x`
        PassThrough = 0 => "pass-through",
        /// `y = 1 / (1 + e^-x)`
        Logistic = 1 => "logistic",
        /// `y = beta * tanh(alpha * x)`
        Tanh = 2 => "tanh",
        /// `y = max(0, x)`
        Relu = 3 => "relu",
        /// `y = ln(1 + e^x)`
        SoftRelu = 4 => "soft-relu",
        /// `y = |x|`
        Abs = 5 => "abs",
        /// `y = (alpha + beta * x)^gamma`
        Power = 6 => "power",
        /// `y = min(alpha, max(0, x))`
        ClippedRelu = 7 => "clipped-relu",
        /// `y = x > 0 ? x : alpha * x`
        LeakyRelu = 8 => "leaky-relu",
        /// `y = x > 0 ? x : alpha * (e^x - 1)`
        Elu = 9 => "elu",
    }
}

native_enum! {
    /// Batch-normalization statistics granularity.
    pub enum BatchNormMode {
        /// One statistic per activation (`1xCxHxW`).
        PerActivation = 0 => "per-activation",
        /// One statistic per channel (`1xCx1x1`).
        Spatial = 1 => "spatial",
    }
}

native_enum! {
    /// Local response normalization neighbourhood.
    pub enum LrnMode {
        /// `n x n` spatial window inside one channel.
        WithinChannel = 0 => "within-channel",
        /// `n` neighbouring channels at one position.
        CrossChannel = 1 => "cross-channel",
    }
}

native_enum! {
    /// Element-wise binary tensor operation.
    pub enum TensorOp {
        /// `a + b`
        Add = 0 => "add",
        /// `a * b`
        Mul = 1 => "mul",
        /// `min(a, b)`
        Min = 2 => "min",
        /// `max(a, b)`
        Max = 3 => "max",
    }
}

impl TensorOp {
    /// Apply the operation to two values.
    #[must_use]
    pub fn apply(self, a: f32, b: f32) -> f32 {
        match self {
            Self::Add => a + b,
            Self::Mul => a * b,
            Self::Min => a.min(b),
            Self::Max => a.max(b),
        }
    }
}

native_enum! {
    /// Fusion plan direction.
    pub enum FusionDirection {
        /// Operators chained output-to-input.
        Vertical = 0 => "vertical",
        /// Operators sharing one input (not implemented by the library).
        Horizontal = 1 => "horizontal",
    }
}

native_enum! {
    /// Recurrent cell type.
    pub enum RnnMode {
        /// Vanilla RNN with ReLU.
        Relu = 0 => "rnn-relu",
        /// Vanilla RNN with tanh.
        Tanh = 1 => "rnn-tanh",
        /// Long short-term memory.
        Lstm = 2 => "lstm",
        /// Gated recurrent unit.
        Gru = 3 => "gru",
    }
}

impl RnnMode {
    /// Number of gates (weight matrices per input) of the cell.
    #[must_use]
    pub const fn gate_count(self) -> usize {
        match self {
            Self::Relu | Self::Tanh => 1,
            Self::Lstm => 4,
            Self::Gru => 3,
        }
    }
}

native_enum! {
    /// How the first layer consumes its input.
    pub enum RnnInputMode {
        /// Input passes through a learned matrix.
        Linear = 0 => "linear",
        /// Input is added directly (requires input size == hidden size).
        Skip = 1 => "skip",
    }
}

native_enum! {
    /// RNN algorithm.
    pub enum RnnAlgorithm {
        /// Library default.
        Default = 0 => "default",
    }
}

native_enum! {
    /// RNN direction.
    pub enum RnnDirection {
        /// Forward in time only.
        Unidirectional = 0 => "unidirectional",
        /// Forward and backward in time.
        Bidirectional = 1 => "bidirectional",
    }
}

impl RnnDirection {
    /// Number of directions.
    #[must_use]
    pub const fn count(self) -> usize {
        match self {
            Self::Unidirectional => 1,
            Self::Bidirectional => 2,
        }
    }
}

native_enum! {
    /// Whether RNN layers carry bias vectors.
    pub enum RnnBiasMode {
        /// No bias.
        NoBias = 0 => "no-bias",
        /// Input and recurrent bias per gate.
        WithBias = 1 => "with-bias",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_values() {
        assert_eq!(DataType::Float16.as_raw(), 0);
        assert_eq!(DataType::Float32.as_raw(), 1);
        assert_eq!(ConvFwdAlgorithm::ImplicitGemm.as_raw(), 5);
        assert_eq!(ConvBwdWeightsAlgorithm::Winograd.as_raw(), 3);
        assert_eq!(ActivationMode::Elu.as_raw(), 9);
        assert_eq!(IndexType::Uint64.as_raw(), 3);
    }

    #[test]
    fn test_from_raw_roundtrip() {
        for &mode in ActivationMode::ALL {
            assert_eq!(ActivationMode::from_raw(mode.as_raw()), Some(mode));
        }
        assert_eq!(ConvBwdWeightsAlgorithm::from_raw(2), None);
        assert_eq!(ConvFwdAlgorithm::from_raw(4), None);
    }

    #[test]
    fn test_data_type_sizes() {
        assert_eq!(DataType::Float16.size_bytes(), 2);
        assert_eq!(DataType::Int8.size_bytes(), 1);
        assert_eq!(DataType::Int8x4.size_bytes(), 4);
        assert!(DataType::Float16.is_floating_point());
        assert!(!DataType::Int32.is_floating_point());
    }

    #[test]
    fn test_tensor_op_apply() {
        assert_eq!(TensorOp::Add.apply(2.0, 3.0), 5.0);
        assert_eq!(TensorOp::Mul.apply(2.0, 3.0), 6.0);
        assert_eq!(TensorOp::Min.apply(2.0, 3.0), 2.0);
        assert_eq!(TensorOp::Max.apply(2.0, 3.0), 3.0);
    }

    #[test]
    fn test_rnn_gate_counts() {
        assert_eq!(RnnMode::Lstm.gate_count(), 4);
        assert_eq!(RnnMode::Gru.gate_count(), 3);
        assert_eq!(RnnDirection::Bidirectional.count(), 2);
    }

    #[test]
    fn test_display() {
        assert_eq!(PoolingMode::AverageInclusive.to_string(), "average-inclusive");
        assert_eq!(IndexType::default(), IndexType::Uint8);
    }
}

//! Convolution descriptors.

use crate::backend::{DescriptorConfig, DescriptorKind, RawDescriptor};
use crate::runtime::{OwnedDescriptor, Runtime};
use crate::tensor::{Dims, TensorDescriptor};
use crate::types::ConvolutionMode;
use crate::{DnnError, DnnResult};
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;

/// Maximum number of spatial dimensions.
pub const MAX_SPATIAL_DIMS: usize = 3;

/// One value per spatial dimension.
pub type SpatialDims = SmallVec<[i32; MAX_SPATIAL_DIMS]>;

/// Geometry of a convolution.
///
/// Group count and output padding are part of the parameters, so a
/// descriptor is fully configured the moment it exists.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConvolutionParams {
    /// Zero padding per spatial dimension.
    pub pad: SpatialDims,
    /// Filter stride per spatial dimension.
    pub stride: SpatialDims,
    /// Filter dilation per spatial dimension.
    pub dilation: SpatialDims,
    /// Arithmetic.
    pub mode: ConvolutionMode,
    /// Number of channel groups (1 = ungrouped).
    pub group_count: i32,
    /// Extra output size per spatial dimension (transpose mode only).
    pub output_padding: Option<SpatialDims>,
}

impl ConvolutionParams {
    /// Ungrouped cross-correlation with the given geometry.
    #[must_use]
    pub fn new(pad: &[i32], stride: &[i32], dilation: &[i32]) -> Self {
        Self {
            pad: pad.iter().copied().collect(),
            stride: stride.iter().copied().collect(),
            dilation: dilation.iter().copied().collect(),
            mode: ConvolutionMode::CrossCorrelation,
            group_count: 1,
            output_padding: None,
        }
    }

    /// Set the arithmetic.
    #[must_use]
    pub fn with_mode(mut self, mode: ConvolutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the group count.
    #[must_use]
    pub fn with_groups(mut self, group_count: i32) -> Self {
        self.group_count = group_count;
        self
    }

    /// Set the transpose output padding.
    #[must_use]
    pub fn with_output_padding(mut self, output_padding: &[i32]) -> Self {
        self.output_padding = Some(output_padding.iter().copied().collect());
        self
    }

    /// Number of spatial dimensions.
    #[must_use]
    pub fn spatial_rank(&self) -> usize {
        self.pad.len()
    }

    /// Check the parameters are self-consistent.
    ///
    /// # Errors
    ///
    /// Returns [`DnnError::InvalidValue`] on mismatched lengths or
    /// out-of-range values.
    pub fn validate(&self) -> DnnResult<()> {
        const OP: &str = "ConvolutionParams::validate";
        let n = self.pad.len();
        if n == 0 || n > MAX_SPATIAL_DIMS {
            return Err(DnnError::invalid_value(
                OP,
                format!("{n} spatial dimensions, expected 1..={MAX_SPATIAL_DIMS}"),
            ));
        }
        if self.stride.len() != n || self.dilation.len() != n {
            return Err(DnnError::invalid_value(
                OP,
                format!(
                    "pad/stride/dilation lengths differ: {}/{}/{}",
                    n,
                    self.stride.len(),
                    self.dilation.len()
                ),
            ));
        }
        if self.pad.iter().any(|&p| p < 0) {
            return Err(DnnError::invalid_value(OP, "negative padding"));
        }
        if self.stride.iter().chain(&self.dilation).any(|&v| v < 1) {
            return Err(DnnError::invalid_value(OP, "stride and dilation must be >= 1"));
        }
        if self.group_count < 1 {
            return Err(DnnError::invalid_value(
                OP,
                format!("group count {} < 1", self.group_count),
            ));
        }
        if let Some(out_pad) = &self.output_padding {
            if self.mode != ConvolutionMode::Transpose {
                return Err(DnnError::invalid_value(
                    OP,
                    "output padding requires transpose mode",
                ));
            }
            if out_pad.len() != n {
                return Err(DnnError::invalid_value(
                    OP,
                    format!("{} output paddings for {n} spatial dimensions", out_pad.len()),
                ));
            }
            let out_of_range = out_pad
                .iter()
                .zip(&self.stride)
                .zip(&self.dilation)
                .any(|((&p, &s), &d)| p < 0 || (p >= s && p >= d));
            if out_of_range {
                return Err(DnnError::invalid_value(
                    OP,
                    "output padding must be smaller than stride or dilation",
                ));
            }
        }
        Ok(())
    }

    /// Output shape of a forward convolution of `x` with filter `w`.
    ///
    /// Cross-correlation filters are `[K, C / groups, spatial...]`; transpose
    /// filters are `[C, K / groups, spatial...]`.
    ///
    /// # Errors
    ///
    /// Returns [`DnnError::BadParam`] when ranks, channels or groups do not
    /// line up, or the output would be empty.
    pub fn output_dims(&self, x: &[i32], w: &[i32]) -> DnnResult<Dims> {
        const OP: &str = "ConvolutionParams::output_dims";
        let n = self.spatial_rank();
        if x.len() != n + 2 || w.len() != n + 2 {
            return Err(DnnError::bad_param(
                OP,
                format!(
                    "{n} spatial dimensions need rank-{} input and filter, got {} and {}",
                    n + 2,
                    x.len(),
                    w.len()
                ),
            ));
        }
        let groups = i64::from(self.group_count);
        let channels = i64::from(x[1]);
        let (filters, per_group) = (i64::from(w[0]), i64::from(w[1]));

        let out_channels = match self.mode {
            ConvolutionMode::CrossCorrelation => {
                if per_group * groups != channels {
                    return Err(DnnError::bad_param(
                        OP,
                        format!(
                            "input has {channels} channels, filter covers {per_group} x {groups} groups"
                        ),
                    ));
                }
                if filters % groups != 0 {
                    return Err(DnnError::bad_param(
                        OP,
                        format!("{filters} filters do not split into {groups} groups"),
                    ));
                }
                filters
            }
            ConvolutionMode::Transpose => {
                if filters != channels || channels % groups != 0 {
                    return Err(DnnError::bad_param(
                        OP,
                        format!(
                            "input has {channels} channels, transpose filter expects {filters} in {groups} groups"
                        ),
                    ));
                }
                per_group * groups
            }
        };

        let mut out: Dims = SmallVec::with_capacity(n + 2);
        out.push(x[0]);
        out.push(narrow(OP, "output channels", out_channels)?);
        for i in 0..n {
            let (input, kernel) = (i64::from(x[i + 2]), i64::from(w[i + 2]));
            let p = i64::from(self.pad[i]);
            let (s, d) = (i64::from(self.stride[i]), i64::from(self.dilation[i]));
            if s < 1 || d < 1 {
                return Err(DnnError::bad_param(OP, "stride and dilation must be >= 1"));
            }
            let extent = d * (kernel - 1) + 1;
            let size = match self.mode {
                ConvolutionMode::CrossCorrelation => (input + 2 * p - extent) / s + 1,
                ConvolutionMode::Transpose => {
                    let extra = self.output_padding.as_ref().map_or(0, |op| i64::from(op[i]));
                    s * (input - 1) + extent - 2 * p + extra
                }
            };
            let window_fits =
                self.mode == ConvolutionMode::Transpose || input + 2 * p >= extent;
            if size <= 0 || !window_fits {
                return Err(DnnError::bad_param(
                    OP,
                    format!("spatial dimension {i} produces an empty output"),
                ));
            }
            out.push(narrow(OP, "spatial output", size)?);
        }
        Ok(out)
    }
}

/// Shape arithmetic runs in `i64`; results must fit a dimension again.
fn narrow(op: &'static str, what: &str, value: i64) -> DnnResult<i32> {
    i32::try_from(value)
        .map_err(|_| DnnError::bad_param(op, format!("{what} extent {value} overflows a dimension")))
}

struct ConvInner {
    owned: OwnedDescriptor,
    params: ConvolutionParams,
}

/// A reference-counted, immutable convolution descriptor.
#[derive(Clone)]
pub struct ConvolutionDescriptor {
    inner: Arc<ConvInner>,
}

impl ConvolutionDescriptor {
    /// Create a descriptor with the given parameters.
    ///
    /// # Errors
    ///
    /// Returns [`DnnError::InvalidValue`] for inconsistent parameters,
    /// [`DnnError::AllocationFailed`] if the backend cannot create it.
    pub fn new(runtime: &Runtime, params: ConvolutionParams) -> DnnResult<Self> {
        params.validate()?;
        let owned = OwnedDescriptor::create(runtime, DescriptorKind::Convolution)?;
        owned
            .backend()
            .set_descriptor(owned.raw(), &DescriptorConfig::Convolution(params.clone()))?;
        Ok(Self {
            inner: Arc::new(ConvInner { owned, params }),
        })
    }

    /// Parameters the descriptor was created with.
    #[must_use]
    pub fn params(&self) -> &ConvolutionParams {
        &self.inner.params
    }

    /// Read the parameters back from the backend.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub fn get(&self) -> DnnResult<ConvolutionParams> {
        match self.inner.owned.backend().get_descriptor(
            self.raw(),
            DescriptorKind::Convolution,
            self.inner.params.spatial_rank(),
        )? {
            DescriptorConfig::Convolution(params) => Ok(params),
            other => Err(DnnError::internal(
                "ConvolutionDescriptor::get",
                format!("backend returned a {:?} descriptor", other.kind()),
            )),
        }
    }

    /// Group count.
    #[must_use]
    pub fn group_count(&self) -> i32 {
        self.inner.params.group_count
    }

    /// Arithmetic.
    #[must_use]
    pub fn mode(&self) -> ConvolutionMode {
        self.inner.params.mode
    }

    /// Output shape of a forward convolution, computed by the backend.
    ///
    /// # Errors
    ///
    /// Returns [`DnnError::BadParam`] if the descriptors do not line up.
    pub fn forward_output_dim(
        &self,
        x: &TensorDescriptor,
        w: &TensorDescriptor,
    ) -> DnnResult<Vec<i32>> {
        const OP: &str = "ConvolutionDescriptor::forward_output_dim";
        x.require_layout(OP)?;
        w.require_layout(OP)?;
        self.inner
            .owned
            .backend()
            .conv_output_dim(self.raw(), x.raw(), w.raw())
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
}

impl fmt::Debug for ConvolutionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConvolutionDescriptor")
            .field("raw", &self.raw())
            .field("params", &self.inner.params)
            .finish()
    }
}

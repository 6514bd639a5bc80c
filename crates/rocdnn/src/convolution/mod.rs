//! Convolution: descriptors, algorithm planning and execution.
//!
//! A convolution is configured once ([`ConvolutionDescriptor`]), planned once
//! per problem shape and direction ([`Planner`]) and then executed any
//! number of times with the [`BoundAlgorithm`] the planner produced.

mod descriptor;
mod executor;
mod planner;

pub use crate::backend::ConvPass;
pub use descriptor::{ConvolutionDescriptor, ConvolutionParams, SpatialDims, MAX_SPATIAL_DIMS};
pub use executor::{backward_bias, forward_bias};
pub use planner::{
    BackwardData, BackwardWeights, BoundAlgorithm, ConvAlgorithm, ConvDirection, Forward,
    PerformanceRecord, Planner, PlannerState,
};

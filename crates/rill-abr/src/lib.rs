//! Rendition selection for adaptive streaming.
//!
//! This crate is protocol-agnostic: the engine summarizes its renditions as
//! [`Candidate`] records and the selectors are pure functions over slices of
//! them. No selector keeps hidden state, so repeated calls with the same
//! inputs return the same rendition.

#![forbid(unsafe_code)]

mod estimator;
mod select;
mod types;

pub use estimator::BandwidthEstimator;
pub use select::{
    select_by_bandwidth, select_initial_lowest, select_minimizing_rebuffer, RebufferChoice,
};
pub use types::{AbrOptions, BandwidthSample, Candidate, PlayerDimensions, BANDWIDTH_FLOOR_BPS};

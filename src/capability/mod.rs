pub mod cache;
pub mod comparator;
pub mod probe;
pub mod types;

#[cfg(test)]
mod tests;

pub use cache::{CacheConfig, CapabilityCache};
pub use comparator::{
    CapabilityComparison, CapabilityDifference, ComparisonWeights, DifferenceCategory, Impact,
    compare,
};
pub use probe::{CapabilityProber, ConfidenceWeights, ProbeConfig};
pub use types::*;

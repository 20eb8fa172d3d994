//! Risk parameters
//!
//! - Parameter catalogue with admissible intervals
//! - Clamped settings that can never hold an out-of-range value
//! - Snapshot store with a single writer

pub mod params;
pub mod settings;
pub mod store;

pub use params::{default_specs, ParamKey, ParamSpec};
pub use settings::{ClampedWrite, RiskError, RiskParameter, RiskSettings};
pub use store::{RiskStore, RiskUpdate};

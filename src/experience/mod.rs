//! Experience Store & Similarity Matcher
//!
//! - Snapshot of indicator state at decision time
//! - Append-only decision log with outcome backfill per opening record
//! - Tolerance-banded similarity search
//! - Outcome summary used as advisor context

pub mod record;
pub mod snapshot;
pub mod store;

pub use record::ExperienceRecord;
pub use snapshot::{MacdCross, MarketStateSnapshot};
pub use store::{summarize_outcomes, ExperienceLog, ExperienceStore, OutcomeError};

//! Read-side interpretation of canonical rows: likely emission source and
//! health advice. Thresholds come from [`HeuristicSettings`](crate::settings::HeuristicSettings).

pub mod health;
pub mod source_fingerprint;

pub use health::{assess, AqiCategory, HealthAdvice};
pub use source_fingerprint::{classify, Fingerprint, LikelySource};

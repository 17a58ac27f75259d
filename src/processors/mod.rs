pub mod forecast;
pub mod fusion;
pub mod pipeline;
pub mod regression;
pub mod report;
pub mod resolver;
pub mod spatial_joiner;
pub mod task_runner;

pub use forecast::{ForecastEngine, RunLock};
pub use fusion::{CellOffers, FusionEngine};
pub use pipeline::FusionPipeline;
pub use regression::LinearModel;
pub use report::{ForecastReport, PassReport, Skip, SkipLog, SkipReason};
pub use resolver::{Candidate, FallbackGenerator, Origin, RangeFallback, Resolution, ResolutionStats, ValueResolver};
pub use spatial_joiner::{GridMatch, GridRejection, JoinOutcome, SpatialJoiner};
pub use task_runner::{TaskOutcome, TaskRunner};

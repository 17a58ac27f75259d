//! Upstream sources. Each adapter turns one feed into readings or grids with
//! null markers left as [`RawValue`](crate::models::RawValue)s for the resolver.

pub mod grid;
pub mod ground;
pub mod http;
pub mod weather;

pub use grid::GridFileAdapter;
pub use ground::GroundSensorAdapter;
pub use http::{HttpFetcher, RateLimiter};
pub use weather::WeatherModelAdapter;

use crate::error::Result;
use crate::models::{GridBatch, Reading, StationRegistry};
use crate::processors::report::SkipLog;

/// What one adapter delivers for a pass.
#[derive(Debug, Clone)]
pub enum AdapterOutput {
    /// Point readings keyed by station id or station name
    Readings(Vec<Reading>),
    /// A decoded grid, still to be joined onto stations
    Grid(GridBatch),
}

pub trait SourceAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Fetch everything the source currently offers.
    ///
    /// An `Err` means the whole source was unusable this pass; individual bad
    /// records are recorded in `skips` instead.
    fn collect(&self, registry: &StationRegistry, skips: &mut SkipLog) -> Result<Vec<AdapterOutput>>;
}

//! Nearest-cell assignment of gridded source data onto station coordinates.
//!
//! Cells are indexed in an R-tree keyed on `[latitude, longitude]`, so each
//! station lookup is logarithmic in the number of cells. Distances are planar
//! degrees, which is what the per-source cutoffs are expressed in.

use rstar::{PointDistance, RTree, RTreeObject, AABB};

use crate::error::{PipelineError, Result};
use crate::models::{GridBatch, GridCell, Station, StationRegistry};
use crate::settings::SpatialSettings;
use crate::utils::BoundingBox;

/// Grid cell as stored in the R-tree.
#[derive(Debug, Clone, Copy)]
struct IndexedCell(GridCell);

impl RTreeObject for IndexedCell {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point([self.0.latitude, self.0.longitude])
    }
}

impl PointDistance for IndexedCell {
    fn distance_2(&self, point: &[f64; 2]) -> f64 {
        let dlat = self.0.latitude - point[0];
        let dlon = self.0.longitude - point[1];
        dlat * dlat + dlon * dlon
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GridMatch {
    pub station_id: String,
    pub cell: GridCell,
    pub distance_deg: f64,
}

/// Result of joining one grid onto the registry.
#[derive(Debug, Clone, Default)]
pub struct JoinOutcome {
    pub matches: Vec<GridMatch>,
    /// Located stations whose nearest cell lies beyond the cutoff
    pub unmatched_stations: Vec<String>,
    pub cells_in_bbox: usize,
    pub cells_total: usize,
}

/// Why a whole grid was rejected before any join was attempted.
#[derive(Debug, Clone, PartialEq)]
pub enum GridRejection {
    /// Nothing left after bounding-box filtering
    EmptyGrid,
    /// Coordinates are not geographic degrees
    GeometryMismatch(String),
}

impl From<GridRejection> for PipelineError {
    fn from(rejection: GridRejection) -> Self {
        match rejection {
            GridRejection::EmptyGrid => {
                PipelineError::GeometryMismatch("no grid cells inside the area of interest".to_string())
            }
            GridRejection::GeometryMismatch(detail) => PipelineError::GeometryMismatch(detail),
        }
    }
}

pub struct SpatialJoiner {
    cutoff_deg: f64,
    bbox: Option<BoundingBox>,
    bbox_padding_deg: f64,
    min_plausible_max_latitude: f64,
}

impl SpatialJoiner {
    pub fn new(cutoff_deg: f64) -> Self {
        Self {
            cutoff_deg,
            bbox: None,
            bbox_padding_deg: crate::utils::constants::DEFAULT_BBOX_PADDING_DEG,
            min_plausible_max_latitude: crate::utils::constants::DEFAULT_MIN_PLAUSIBLE_MAX_LATITUDE,
        }
    }

    /// Joiner for one grid family, with the family's cutoff.
    pub fn from_settings(settings: &SpatialSettings, kind: crate::models::GridKind) -> Self {
        Self {
            cutoff_deg: settings.cutoff_for(kind),
            bbox: settings.bbox,
            bbox_padding_deg: settings.bbox_padding_deg,
            min_plausible_max_latitude: settings.min_plausible_max_latitude,
        }
    }

    pub fn with_bbox(mut self, bbox: BoundingBox) -> Self {
        self.bbox = Some(bbox);
        self
    }

    pub fn cutoff_deg(&self) -> f64 {
        self.cutoff_deg
    }

    /// Area of interest: the explicit box, or the padded station extent.
    fn area_of_interest(&self, registry: &StationRegistry) -> Option<BoundingBox> {
        self.bbox.or_else(|| {
            registry
                .extent()
                .map(|extent| BoundingBox::padded(extent, self.bbox_padding_deg))
        })
    }

    /// Reject grids whose coordinates cannot be geographic degrees.
    pub fn check_geometry(&self, cells: &[GridCell]) -> std::result::Result<(), GridRejection> {
        let finite: Vec<&GridCell> = cells
            .iter()
            .filter(|c| c.latitude.is_finite() && c.longitude.is_finite())
            .collect();

        if finite.is_empty() {
            return Err(GridRejection::EmptyGrid);
        }

        let max_lat = finite
            .iter()
            .map(|c| c.latitude)
            .fold(f64::NEG_INFINITY, f64::max);

        if max_lat < self.min_plausible_max_latitude {
            return Err(GridRejection::GeometryMismatch(format!(
                "max latitude {:.3} is below {:.1}; coordinates look like scan angles",
                max_lat, self.min_plausible_max_latitude
            )));
        }

        if let Some(bad) = finite.iter().find(|c| {
            !(-90.0..=90.0).contains(&c.latitude) || !(-180.0..=180.0).contains(&c.longitude)
        }) {
            return Err(GridRejection::GeometryMismatch(format!(
                "cell ({}, {}) is outside geographic range",
                bad.latitude, bad.longitude
            )));
        }

        Ok(())
    }

    /// Assign each located station its nearest cell within the cutoff.
    pub fn join(
        &self,
        registry: &StationRegistry,
        cells: &[GridCell],
    ) -> std::result::Result<JoinOutcome, GridRejection> {
        self.check_geometry(cells)?;

        let Some(area) = self.area_of_interest(registry) else {
            // no located stations, nothing can match
            return Ok(JoinOutcome {
                cells_total: cells.len(),
                ..JoinOutcome::default()
            });
        };

        let indexed: Vec<IndexedCell> = cells
            .iter()
            .filter(|c| c.value.is_finite() && area.contains(c.latitude, c.longitude))
            .map(|c| IndexedCell(*c))
            .collect();

        if indexed.is_empty() {
            return Err(GridRejection::EmptyGrid);
        }

        let cells_in_bbox = indexed.len();
        let tree = RTree::bulk_load(indexed);
        let cutoff_2 = self.cutoff_deg * self.cutoff_deg;

        let mut outcome = JoinOutcome {
            cells_in_bbox,
            cells_total: cells.len(),
            ..JoinOutcome::default()
        };

        for station in registry.located() {
            match self.nearest_within(&tree, station, cutoff_2) {
                Some(found) => outcome.matches.push(found),
                None => outcome.unmatched_stations.push(station.id.clone()),
            }
        }

        Ok(outcome)
    }

    fn nearest_within(
        &self,
        tree: &RTree<IndexedCell>,
        station: &Station,
        cutoff_2: f64,
    ) -> Option<GridMatch> {
        let point = [station.latitude, station.longitude];
        let nearest = tree.nearest_neighbor(&point)?;
        let distance_2 = nearest.distance_2(&point);

        if distance_2 > cutoff_2 {
            return None;
        }

        Some(GridMatch {
            station_id: station.id.clone(),
            cell: nearest.0,
            distance_deg: distance_2.sqrt(),
        })
    }

    /// Join a decoded batch, converting a rejection into the pipeline error.
    pub fn join_batch(&self, registry: &StationRegistry, batch: &GridBatch) -> Result<JoinOutcome> {
        self.join(registry, &batch.cells).map_err(|rejection| {
            tracing::warn!(grid = %batch.label, ?rejection, "Skipping grid");
            PipelineError::from(rejection)
        })
    }
}

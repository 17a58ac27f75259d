use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};

/// Axis-aligned box in geographic degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl BoundingBox {
    pub fn new(min_lat: f64, max_lat: f64, min_lon: f64, max_lon: f64) -> Result<Self> {
        validate_coordinates(min_lat, min_lon)?;
        validate_coordinates(max_lat, max_lon)?;

        if min_lat > max_lat || min_lon > max_lon {
            return Err(PipelineError::InvalidCoordinate(format!(
                "Bounding box is inverted: lat [{}, {}], lon [{}, {}]",
                min_lat, max_lat, min_lon, max_lon
            )));
        }

        Ok(Self {
            min_lat,
            max_lat,
            min_lon,
            max_lon,
        })
    }

    /// Box around an extent, grown by `padding` degrees and clamped to the globe.
    pub fn padded(extent: (f64, f64, f64, f64), padding: f64) -> Self {
        let (min_lat, max_lat, min_lon, max_lon) = extent;
        Self {
            min_lat: (min_lat - padding).max(-90.0),
            max_lat: (max_lat + padding).min(90.0),
            min_lon: (min_lon - padding).max(-180.0),
            max_lon: (max_lon + padding).min(180.0),
        }
    }

    pub fn contains(&self, latitude: f64, longitude: f64) -> bool {
        (self.min_lat..=self.max_lat).contains(&latitude)
            && (self.min_lon..=self.max_lon).contains(&longitude)
    }
}

/// Validate that a pair is a geographic coordinate
pub fn validate_coordinates(latitude: f64, longitude: f64) -> Result<()> {
    if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
        return Err(PipelineError::InvalidCoordinate(format!(
            "Latitude {} is outside [-90, 90]",
            latitude
        )));
    }

    if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
        return Err(PipelineError::InvalidCoordinate(format!(
            "Longitude {} is outside [-180, 180]",
            longitude
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounding_box() {
        let bbox = BoundingBox::new(28.4, 28.9, 76.8, 77.4).unwrap();
        assert!(bbox.contains(28.61, 77.21));
        assert!(!bbox.contains(19.07, 72.87));

        assert!(BoundingBox::new(29.0, 28.0, 76.0, 77.0).is_err());
        assert!(BoundingBox::new(28.0, 95.0, 76.0, 77.0).is_err());
    }

    #[test]
    fn test_padded_box_clamps() {
        let bbox = BoundingBox::padded((89.8, 89.9, 179.5, 179.9), 0.5);
        assert_eq!(bbox.max_lat, 90.0);
        assert_eq!(bbox.max_lon, 180.0);
        assert!((bbox.min_lat - 89.3).abs() < 1e-9);
    }

    #[test]
    fn test_coordinate_validation() {
        assert!(validate_coordinates(28.61, 77.21).is_ok());
        assert!(validate_coordinates(-91.0, 0.0).is_err());
        assert!(validate_coordinates(0.0, 181.0).is_err());
        assert!(validate_coordinates(f64::NAN, 0.0).is_err());
    }
}

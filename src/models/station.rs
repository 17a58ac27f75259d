use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use validator::Validate;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct Station {
    #[validate(length(min = 1, max = 50))]
    pub id: String,

    #[validate(length(min = 1))]
    pub name: String,

    #[validate(range(min = -90.0, max = 90.0))]
    pub latitude: f64,

    #[validate(range(min = -180.0, max = 180.0))]
    pub longitude: f64,

    pub city: Option<String>,
}

impl Station {
    pub fn new(id: impl Into<String>, name: impl Into<String>, latitude: f64, longitude: f64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            latitude,
            longitude,
            city: None,
        }
    }

    pub fn with_city(mut self, city: impl Into<String>) -> Self {
        self.city = Some(city.into());
        self
    }

    /// Whether the station can take part in spatial joins.
    ///
    /// Loaders that do not know a location write `(0, 0)`; that placeholder is
    /// treated the same as an out-of-range coordinate.
    pub fn has_valid_coordinates(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
            && !(self.latitude == 0.0 && self.longitude == 0.0)
    }
}

/// Read-only view over the station table with id and name lookups.
#[derive(Debug, Clone, Default)]
pub struct StationRegistry {
    stations: Vec<Station>,
    by_id: HashMap<String, usize>,
    by_name: HashMap<String, usize>,
}

impl StationRegistry {
    pub fn new(stations: Vec<Station>) -> Self {
        let mut registry = Self::default();
        for station in stations {
            if registry.by_id.contains_key(&station.id) {
                tracing::warn!(station_id = %station.id, "Duplicate station id ignored");
                continue;
            }
            let index = registry.stations.len();
            registry.by_id.insert(station.id.clone(), index);
            registry
                .by_name
                .entry(normalize_name(&station.name))
                .or_insert(index);
            registry.stations.push(station);
        }
        registry
    }

    pub fn len(&self) -> usize {
        self.stations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stations.is_empty()
    }

    pub fn all(&self) -> &[Station] {
        &self.stations
    }

    pub fn get(&self, id: &str) -> Option<&Station> {
        self.by_id.get(id).map(|&i| &self.stations[i])
    }

    /// Resolve an adapter's station key: registry id first, then station name.
    pub fn resolve(&self, key: &str) -> Option<&Station> {
        self.get(key).or_else(|| {
            self.by_name
                .get(&normalize_name(key))
                .map(|&i| &self.stations[i])
        })
    }

    /// Stations eligible for spatial joins.
    pub fn located(&self) -> impl Iterator<Item = &Station> {
        self.stations.iter().filter(|s| s.has_valid_coordinates())
    }

    /// Bounding box `(min_lat, max_lat, min_lon, max_lon)` of located stations.
    pub fn extent(&self) -> Option<(f64, f64, f64, f64)> {
        self.located().fold(None, |acc, s| {
            Some(match acc {
                None => (s.latitude, s.latitude, s.longitude, s.longitude),
                Some((min_lat, max_lat, min_lon, max_lon)) => (
                    min_lat.min(s.latitude),
                    max_lat.max(s.latitude),
                    min_lon.min(s.longitude),
                    max_lon.max(s.longitude),
                ),
            })
        })
    }
}

fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
}

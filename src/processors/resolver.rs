use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, BTreeSet};

use crate::models::{Field, MeasurementPatch, RawValue, SourceKind};
use crate::settings::{ResolverSettings, ValueRange};

/// One source's offer for a (station, time, field) cell.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub source: SourceKind,
    pub value: RawValue,
}

impl Candidate {
    pub fn new(source: SourceKind, value: impl Into<RawValue>) -> Self {
        Self {
            source,
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Observed(SourceKind),
    Generated,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Resolution {
    pub value: f64,
    pub origin: Origin,
}

impl Resolution {
    pub fn is_generated(&self) -> bool {
        self.origin == Origin::Generated
    }
}

/// Produces a synthetic but plausible value when no real source reports one.
pub trait FallbackGenerator: Send {
    fn generate(&mut self, field: Field) -> Option<f64>;
}

/// Uniform draw from a configured range per field.
pub struct RangeFallback {
    ranges: BTreeMap<Field, ValueRange>,
    rng: StdRng,
}

impl RangeFallback {
    pub fn new(ranges: BTreeMap<Field, ValueRange>, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { ranges, rng }
    }
}

impl FallbackGenerator for RangeFallback {
    fn generate(&mut self, field: Field) -> Option<f64> {
        let range = self.ranges.get(&field)?;
        if range.min == range.max {
            return Some(range.min);
        }
        let value = self.rng.gen_range(range.min..=range.max);
        // one decimal, like the upstream feeds
        Some(((value * 10.0).round() / 10.0).clamp(range.min, range.max))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolutionStats {
    pub observed: usize,
    pub generated: usize,
    pub absent: usize,
    pub by_source: BTreeMap<SourceKind, usize>,
}

/// Picks one value per cell: the most authoritative present candidate, else
/// the fallback generator when enabled for that field, else nothing.
pub struct ValueResolver {
    fallback: Option<Box<dyn FallbackGenerator>>,
    fallback_fields: BTreeSet<Field>,
    stats: ResolutionStats,
}

impl ValueResolver {
    pub fn new() -> Self {
        Self {
            fallback: None,
            fallback_fields: BTreeSet::new(),
            stats: ResolutionStats::default(),
        }
    }

    pub fn from_settings(settings: &ResolverSettings) -> Self {
        let resolver = Self::new();
        if settings.fallback_fields.is_empty() {
            return resolver;
        }
        resolver.with_fallback(
            Box::new(RangeFallback::new(
                settings.fallback_ranges.clone(),
                settings.fallback_seed,
            )),
            settings.fallback_fields.iter().copied(),
        )
    }

    pub fn with_fallback(
        mut self,
        generator: Box<dyn FallbackGenerator>,
        fields: impl IntoIterator<Item = Field>,
    ) -> Self {
        self.fallback = Some(generator);
        self.fallback_fields = fields.into_iter().collect();
        self
    }

    pub fn stats(&self) -> &ResolutionStats {
        &self.stats
    }

    pub fn take_stats(&mut self) -> ResolutionStats {
        std::mem::take(&mut self.stats)
    }

    /// Resolve one cell. Candidates may arrive in any order; they are tried by
    /// source precedence, and equal-precedence candidates keep arrival order.
    pub fn resolve(
        &mut self,
        station_id: &str,
        timestamp: DateTime<Utc>,
        field: Field,
        candidates: &[Candidate],
    ) -> Option<Resolution> {
        let mut ordered: Vec<&Candidate> = candidates.iter().collect();
        ordered.sort_by_key(|c| c.source.precedence());

        if let Some((source, value)) = ordered
            .iter()
            .find_map(|c| c.value.as_number().map(|v| (c.source, v)))
        {
            self.stats.observed += 1;
            *self.stats.by_source.entry(source).or_default() += 1;
            return Some(Resolution {
                value,
                origin: Origin::Observed(source),
            });
        }

        if self.fallback_fields.contains(&field) {
            if let Some(value) = self.fallback.as_mut().and_then(|g| g.generate(field)) {
                tracing::debug!(
                    station_id,
                    %timestamp,
                    %field,
                    value,
                    "No source reported a value, using generated fallback"
                );
                self.stats.generated += 1;
                return Some(Resolution {
                    value,
                    origin: Origin::Generated,
                });
            }
        }

        self.stats.absent += 1;
        None
    }

    /// Resolve every field offered for one (station, time) cell into a patch.
    ///
    /// Fallback-enabled fields are considered even when no source offered
    /// them, so a station that reported something still gets gap-filled.
    pub fn resolve_cell(
        &mut self,
        station_id: &str,
        timestamp: DateTime<Utc>,
        offers: &BTreeMap<Field, Vec<Candidate>>,
    ) -> MeasurementPatch {
        let mut patch = MeasurementPatch::new();

        let fields: BTreeSet<Field> = offers
            .keys()
            .copied()
            .chain(self.fallback_fields.iter().copied())
            .collect();

        for field in fields {
            let candidates = offers.get(&field).map(Vec::as_slice).unwrap_or(&[]);
            match self.resolve(station_id, timestamp, field, candidates) {
                Some(Resolution {
                    value,
                    origin: Origin::Observed(_),
                }) => {
                    patch.observed.insert(field, value);
                }
                Some(Resolution {
                    value,
                    origin: Origin::Generated,
                }) => {
                    patch.generated.insert(field, value);
                }
                None => {}
            }
        }

        patch
    }
}

impl Default for ValueResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    struct FixedFallback(f64);

    impl FallbackGenerator for FixedFallback {
        fn generate(&mut self, _field: Field) -> Option<f64> {
            Some(self.0)
        }
    }

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 11, 3, 10, 0, 0).unwrap()
    }

    #[test]
    fn test_first_present_candidate_wins() {
        let mut resolver = ValueResolver::new();
        let candidates = vec![
            Candidate::new(SourceKind::WeatherModel, 30.0),
            Candidate::new(SourceKind::GroundSensor, "NA"),
            Candidate::new(SourceKind::Satellite, "61.2"),
        ];

        let resolution = resolver
            .resolve("S1", ts(), Field::Pm25, &candidates)
            .unwrap();
        assert_eq!(resolution.value, 61.2);
        assert_eq!(resolution.origin, Origin::Observed(SourceKind::Satellite));
    }

    #[test]
    fn test_fallback_after_absent_sources() {
        let mut resolver =
            ValueResolver::new().with_fallback(Box::new(FixedFallback(42.5)), [Field::Pm25]);
        let candidates = vec![
            Candidate::new(SourceKind::GroundSensor, RawValue::Missing),
            Candidate::new(SourceKind::Satellite, "NA"),
        ];

        let resolution = resolver
            .resolve("S1", ts(), Field::Pm25, &candidates)
            .unwrap();
        assert_eq!(resolution.value, 42.5);
        assert!(resolution.is_generated());
        assert_eq!(resolver.stats().generated, 1);
    }

    #[test]
    fn test_weather_model_as_last_real_source() {
        let mut resolver = ValueResolver::new();
        let candidates = vec![
            Candidate::new(SourceKind::GroundSensor, RawValue::Missing),
            Candidate::new(SourceKind::Satellite, "NA"),
            Candidate::new(SourceKind::WeatherModel, 42.5),
        ];

        let resolution = resolver
            .resolve("S1", ts(), Field::Pm25, &candidates)
            .unwrap();
        assert_eq!(resolution.value, 42.5);
        assert_eq!(resolution.origin, Origin::Observed(SourceKind::WeatherModel));
    }

    #[test]
    fn test_no_value_is_not_zero() {
        let mut resolver = ValueResolver::new();
        let candidates = vec![
            Candidate::new(SourceKind::GroundSensor, ""),
            Candidate::new(SourceKind::Satellite, -999.0),
            Candidate::new(SourceKind::WeatherModel, "None"),
        ];

        assert_eq!(resolver.resolve("S1", ts(), Field::No2, &candidates), None);
        assert_eq!(resolver.stats().absent, 1);
    }

    #[test]
    fn test_fallback_not_used_when_real_value_exists() {
        let mut resolver =
            ValueResolver::new().with_fallback(Box::new(FixedFallback(1.0)), [Field::Pm25]);
        let candidates = vec![Candidate::new(SourceKind::GroundSensor, 88.0)];

        let resolution = resolver
            .resolve("S1", ts(), Field::Pm25, &candidates)
            .unwrap();
        assert_eq!(resolution.value, 88.0);
        assert_eq!(resolver.stats().generated, 0);
    }

    #[test]
    fn test_resolve_cell_splits_observed_and_generated() {
        let mut resolver =
            ValueResolver::new().with_fallback(Box::new(FixedFallback(75.0)), [Field::Pm10]);

        let mut offers = BTreeMap::new();
        offers.insert(
            Field::Pm25,
            vec![Candidate::new(SourceKind::GroundSensor, "112")],
        );
        offers.insert(Field::So2, vec![Candidate::new(SourceKind::GroundSensor, "NA")]);

        let patch = resolver.resolve_cell("S1", ts(), &offers);
        assert_eq!(patch.observed.get(&Field::Pm25), Some(&112.0));
        assert_eq!(patch.generated.get(&Field::Pm10), Some(&75.0));
        assert!(!patch.observed.contains_key(&Field::So2));
        assert!(!patch.generated.contains_key(&Field::So2));
    }

    #[test]
    fn test_range_fallback_stays_in_range() {
        let range = ValueRange::new(20.0, 180.0);
        let mut generator = RangeFallback::new([(Field::Pm25, range)].into_iter().collect(), Some(7));

        for _ in 0..200 {
            let value = generator.generate(Field::Pm25).unwrap();
            assert!(range.contains(value), "{} out of range", value);
        }
        assert_eq!(generator.generate(Field::TempC), None);
    }
}

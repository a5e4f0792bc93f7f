//! Capability catalogs
//!
//! Every sensor advertises what it can do as ordered lists of ranges:
//!
//! - available sampling intervals (`DataRangeList`, milliseconds)
//! - available data ranges (`DataRangeList`, sensor units)
//! - available buffer intervals and sizes (`IntegerRangeList`)
//!
//! Order is meaningful. Buffer catalogs are ordered by efficiency (cheapest
//! first) by the device adaptor, and that order is preserved verbatim through
//! serialization and through every query.
//!
//! The catalog is also where requested values are validated. A value outside
//! every advertised entry is rejected with `InvalidParameter`; a value that
//! falls between entries (or between resolution steps inside an entry) is
//! snapped to the nearest permitted value. Ties go to the earlier entry.

use serde::{Deserialize, Serialize};

use crate::error::{SensorError, SensorResult};

/// Closed numeric interval with a step resolution.
///
/// A `resolution` of `0.0` means the range is continuous.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DataRange {
    /// Lower bound
    pub min: f64,
    /// Upper bound
    pub max: f64,
    /// Step between values
    pub resolution: f64,
}

impl DataRange {
    /// Range from `min` to `max` in steps of `resolution`.
    pub fn new(min: f64, max: f64, resolution: f64) -> Self {
        Self {
            min,
            max,
            resolution,
        }
    }

    /// A single discrete value.
    pub fn point(value: f64) -> Self {
        Self::new(value, value, 0.0)
    }

    /// Whether `value` lies within the bounds.
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }

    /// Whether `other` lies entirely inside this range.
    pub fn covers(&self, other: &DataRange) -> bool {
        self.min <= other.min && other.max <= self.max
    }

    /// Nearest value inside this range that respects its resolution.
    pub fn nearest(&self, value: f64) -> f64 {
        let clamped = value.clamp(self.min, self.max);
        if self.resolution <= 0.0 {
            return clamped;
        }
        let steps = ((clamped - self.min) / self.resolution).round();
        (self.min + steps * self.resolution).min(self.max)
    }
}

/// Closed integer interval, used for buffer intervals and sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IntegerRange {
    /// Lower bound
    pub min: u32,
    /// Upper bound
    pub max: u32,
}

impl IntegerRange {
    /// Range from `min` to `max`, both included.
    pub fn new(min: u32, max: u32) -> Self {
        Self { min, max }
    }

    /// Whether `value` lies within the bounds.
    pub fn contains(&self, value: u32) -> bool {
        value >= self.min && value <= self.max
    }

    /// `value` clamped into the range.
    pub fn nearest(&self, value: u32) -> u32 {
        value.clamp(self.min, self.max)
    }
}

/// Ordered list of data ranges.
pub type DataRangeList = Vec<DataRange>;

/// Ordered list of integer ranges.
pub type IntegerRangeList = Vec<IntegerRange>;

/// Immutable per-sensor capability description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityCatalog {
    /// Available sampling intervals in milliseconds
    pub intervals: DataRangeList,
    /// Available measurement ranges
    pub data_ranges: DataRangeList,
    /// Available buffer intervals in milliseconds, cheapest first
    pub buffer_intervals: IntegerRangeList,
    /// Available buffer sizes in samples, cheapest first
    pub buffer_sizes: IntegerRangeList,
    /// Whether the driver buffers in hardware
    pub hw_buffering: bool,
    /// Interval used for sessions that never requested one
    pub default_interval: u32,
    /// Index into `data_ranges` used when nobody requests a range
    pub default_data_range: usize,
}

impl CapabilityCatalog {
    /// Check the catalog is usable before a sensor is registered.
    pub fn validate(&self) -> Result<(), String> {
        if self.intervals.is_empty() {
            return Err("catalog advertises no intervals".into());
        }
        if self.data_ranges.is_empty() {
            return Err("catalog advertises no data ranges".into());
        }
        if self.default_data_range >= self.data_ranges.len() {
            return Err(format!(
                "default data range index {} out of bounds ({} entries)",
                self.default_data_range,
                self.data_ranges.len()
            ));
        }
        for range in self.intervals.iter().chain(self.data_ranges.iter()) {
            if range.min > range.max || range.resolution < 0.0 {
                return Err(format!("malformed range {:?}", range));
            }
        }
        for range in self.buffer_intervals.iter().chain(self.buffer_sizes.iter()) {
            if range.min > range.max {
                return Err(format!("malformed integer range {:?}", range));
            }
        }
        if !self
            .intervals
            .iter()
            .any(|r| r.contains(f64::from(self.default_interval)))
        {
            return Err(format!(
                "default interval {} is not advertised",
                self.default_interval
            ));
        }
        Ok(())
    }

    /// Resolve a requested sampling interval to a permitted value.
    pub fn resolve_interval(&self, requested: u32) -> SensorResult<u32> {
        let value = f64::from(requested);
        let (lowest, highest) = span(self.intervals.iter().map(|r| (r.min, r.max)))
            .ok_or_else(|| SensorError::InvalidParameter("no intervals advertised".into()))?;
        if value < lowest || value > highest {
            return Err(SensorError::InvalidParameter(format!(
                "interval {} outside advertised [{}, {}]",
                requested, lowest, highest
            )));
        }

        let mut best: Option<(f64, f64)> = None;
        for range in &self.intervals {
            let candidate = range.nearest(value);
            let distance = (candidate - value).abs();
            if best.map_or(true, |(d, _)| distance < d) {
                best = Some((distance, candidate));
            }
        }
        let (_, resolved) = best.unwrap_or((0.0, value));
        Ok(resolved.round() as u32)
    }

    /// Buffer interval the catalog grants for `requested`.
    pub fn resolve_buffer_interval(&self, requested: u32) -> SensorResult<u32> {
        resolve_integer(&self.buffer_intervals, requested, "buffer interval")
    }

    /// Buffer size the catalog grants for `requested`.
    pub fn resolve_buffer_size(&self, requested: u32) -> SensorResult<u32> {
        resolve_integer(&self.buffer_sizes, requested, "buffer size")
    }

    /// Catalog entry at `index`.
    pub fn data_range(&self, index: usize) -> SensorResult<DataRange> {
        self.data_ranges.get(index).copied().ok_or_else(|| {
            SensorError::InvalidParameter(format!(
                "data range index {} out of bounds ({} entries)",
                index,
                self.data_ranges.len()
            ))
        })
    }

    /// Data range used when nobody requests one.
    pub fn default_range(&self) -> DataRange {
        self.data_ranges
            .get(self.default_data_range)
            .copied()
            .unwrap_or_else(|| DataRange::point(0.0))
    }

    /// Map a free-form range request onto a catalog index.
    ///
    /// An exact entry wins; otherwise the first (most efficient) entry that
    /// covers the whole request is chosen.
    pub fn match_data_range(&self, requested: &DataRange) -> SensorResult<usize> {
        if let Some(index) = self.data_ranges.iter().position(|r| r == requested) {
            return Ok(index);
        }
        self.data_ranges
            .iter()
            .position(|r| r.covers(requested))
            .ok_or_else(|| {
                SensorError::InvalidParameter(format!(
                    "data range [{}, {}] not covered by any advertised range",
                    requested.min, requested.max
                ))
            })
    }

    /// Remove every interval shorter than `min_interval` ms.
    ///
    /// Ranges straddling the limit are clipped. A default interval that is
    /// no longer advertised moves to the shortest remaining one.
    pub fn with_min_interval(mut self, min_interval: u32) -> Self {
        let limit = f64::from(min_interval);
        self.intervals.retain(|r| r.max >= limit);
        for range in &mut self.intervals {
            if range.min < limit {
                range.min = if range.resolution > 0.0 {
                    let steps = ((limit - range.min) / range.resolution).ceil();
                    (range.min + steps * range.resolution).min(range.max)
                } else {
                    limit
                };
            }
        }
        let default = f64::from(self.default_interval);
        if !self.intervals.iter().any(|r| r.contains(default)) {
            if let Some((lowest, _)) = span(self.intervals.iter().map(|r| (r.min, r.max))) {
                self.default_interval = lowest.ceil() as u32;
            }
        }
        self
    }
}

fn span(ranges: impl Iterator<Item = (f64, f64)>) -> Option<(f64, f64)> {
    ranges.fold(None, |acc, (min, max)| match acc {
        None => Some((min, max)),
        Some((lo, hi)) => Some((lo.min(min), hi.max(max))),
    })
}

fn resolve_integer(list: &[IntegerRange], requested: u32, what: &str) -> SensorResult<u32> {
    let lowest = list.iter().map(|r| r.min).min();
    let highest = list.iter().map(|r| r.max).max();
    let (Some(lowest), Some(highest)) = (lowest, highest) else {
        return Err(SensorError::InvalidParameter(format!(
            "{} not supported by this sensor",
            what
        )));
    };
    if requested < lowest || requested > highest {
        return Err(SensorError::InvalidParameter(format!(
            "{} {} outside advertised [{}, {}]",
            what, requested, lowest, highest
        )));
    }

    let mut best: Option<(u32, u32)> = None;
    for range in list {
        let candidate = range.nearest(requested);
        let distance = candidate.abs_diff(requested);
        if best.map_or(true, |(d, _)| distance < d) {
            best = Some((distance, candidate));
        }
    }
    Ok(best.map_or(requested, |(_, v)| v))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> CapabilityCatalog {
        CapabilityCatalog {
            intervals: vec![
                DataRange::point(10.0),
                DataRange::point(20.0),
                DataRange::new(50.0, 1000.0, 50.0),
            ],
            data_ranges: vec![
                DataRange::new(-2.0, 2.0, 0.001),
                DataRange::new(-8.0, 8.0, 0.004),
            ],
            buffer_intervals: vec![IntegerRange::new(0, 60_000)],
            buffer_sizes: vec![IntegerRange::new(1, 1), IntegerRange::new(16, 256)],
            hw_buffering: false,
            default_interval: 100,
            default_data_range: 0,
        }
    }

    #[test]
    fn exact_interval_is_kept() {
        let c = catalog();
        assert_eq!(c.resolve_interval(20).unwrap(), 20);
        assert_eq!(c.resolve_interval(250).unwrap(), 250);
    }

    #[test]
    fn interval_between_entries_snaps_to_nearest() {
        let c = catalog();
        assert_eq!(c.resolve_interval(14).unwrap(), 10);
        assert_eq!(c.resolve_interval(16).unwrap(), 20);
        // Equidistant: earlier entry wins.
        assert_eq!(c.resolve_interval(15).unwrap(), 10);
        // Inside a stepped range: nearest step.
        assert_eq!(c.resolve_interval(130).unwrap(), 150);
        assert_eq!(c.resolve_interval(120).unwrap(), 100);
    }

    #[test]
    fn interval_outside_everything_is_rejected() {
        let c = catalog();
        assert!(matches!(
            c.resolve_interval(5),
            Err(SensorError::InvalidParameter(_))
        ));
        assert!(matches!(
            c.resolve_interval(5000),
            Err(SensorError::InvalidParameter(_))
        ));
    }

    #[test]
    fn buffer_size_gap_rounds_to_nearest_endpoint() {
        let c = catalog();
        assert_eq!(c.resolve_buffer_size(1).unwrap(), 1);
        assert_eq!(c.resolve_buffer_size(6).unwrap(), 1);
        assert_eq!(c.resolve_buffer_size(12).unwrap(), 16);
        assert!(c.resolve_buffer_size(0).is_err());
        assert!(c.resolve_buffer_size(257).is_err());
    }

    #[test]
    fn empty_buffer_catalog_rejects_everything() {
        let mut c = catalog();
        c.buffer_sizes.clear();
        assert!(matches!(
            c.resolve_buffer_size(8),
            Err(SensorError::InvalidParameter(_))
        ));
    }

    #[test]
    fn data_range_matching() {
        let c = catalog();
        assert_eq!(c.match_data_range(&DataRange::new(-8.0, 8.0, 0.004)).unwrap(), 1);
        // Not an entry, but covered by the first one.
        assert_eq!(c.match_data_range(&DataRange::new(-1.0, 1.0, 0.01)).unwrap(), 0);
        assert_eq!(c.match_data_range(&DataRange::new(-4.0, 4.0, 0.0)).unwrap(), 1);
        assert!(c.match_data_range(&DataRange::new(-16.0, 16.0, 0.0)).is_err());
    }

    #[test]
    fn order_survives_serialization() {
        let c = catalog();
        let json = serde_json::to_string(&c).unwrap();
        let back: CapabilityCatalog = serde_json::from_str(&json).unwrap();
        assert_eq!(back.buffer_sizes, c.buffer_sizes);
        assert_eq!(back.intervals, c.intervals);
    }

    #[test]
    fn rate_limit_clips_intervals() {
        let c = catalog().with_min_interval(60);
        assert_eq!(c.intervals, vec![DataRange::new(100.0, 1000.0, 50.0)]);
        assert_eq!(c.default_interval, 100);
        assert!(c.validate().is_ok());

        let c = catalog().with_min_interval(200);
        assert_eq!(c.default_interval, 200);
        assert!(c.resolve_interval(10).is_err());
    }

    #[test]
    fn validate_rejects_bad_default() {
        let mut c = catalog();
        assert!(c.validate().is_ok());
        c.default_data_range = 7;
        assert!(c.validate().is_err());
        c.default_data_range = 0;
        c.default_interval = 3;
        assert!(c.validate().is_err());
    }
}

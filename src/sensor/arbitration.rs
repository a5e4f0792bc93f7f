//! Arbitration Engine
//!
//! Reduces the requests of every Running session on a sensor to the single
//! configuration the device actually runs at. This is a pure function: the
//! same set of requests always yields the same [`EffectiveConfiguration`],
//! and Created/Stopped sessions never contribute.
//!
//! # Rules
//!
//! | Property | Reduction |
//! |---|---|
//! | interval | minimum of requested (or default) intervals; `None` with no Running sessions |
//! | data range | top of the most recently touched request stack; sensor default otherwise |
//! | standby override | logical OR |
//!
//! Buffering knobs are per session and are not arbitrated.
//!
//! # Data range policy
//!
//! Each session keeps a stack of data-range requests. Every push *and* every
//! pop that leaves the stack non-empty stamps the session with a fresh
//! sensor-wide sequence number. The effective range is the stack top of the
//! Running session with the highest stamp. So popping reveals the caller's
//! own previous request first; once its stack is empty, the most recent
//! remaining request of any other Running session wins, then the default.

use serde::{Deserialize, Serialize};

use crate::sensor::catalog::{CapabilityCatalog, DataRange};
use crate::sensor::session::{Property, Session, SessionRequest};

/// Device configuration derived from the Running sessions of one sensor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EffectiveConfiguration {
    /// Sampling interval in ms; `None` when nothing is running
    pub interval: Option<u32>,
    /// Catalog index of `data_range`
    pub data_range_index: usize,
    /// Data range the device runs at
    pub data_range: DataRange,
    /// OR of the Running sessions' overrides
    pub standby_override: bool,
}

impl EffectiveConfiguration {
    /// Configuration of a sensor with no Running sessions.
    pub fn idle(catalog: &CapabilityCatalog) -> Self {
        Self {
            interval: None,
            data_range_index: catalog.default_data_range,
            data_range: catalog.default_range(),
            standby_override: false,
        }
    }

    /// Properties whose value differs between `self` and `next`.
    pub fn diff(&self, next: &EffectiveConfiguration) -> Vec<Property> {
        let mut changed = Vec::new();
        if self.interval != next.interval {
            changed.push(Property::Interval);
        }
        if self.data_range_index != next.data_range_index {
            changed.push(Property::DataRange);
        }
        if self.standby_override != next.standby_override {
            changed.push(Property::StandbyOverride);
        }
        changed
    }
}

/// Arbitrate over requests that are already known to be Running.
pub fn arbitrate<'a, I>(catalog: &CapabilityCatalog, running: I) -> EffectiveConfiguration
where
    I: IntoIterator<Item = &'a SessionRequest>,
{
    let mut interval: Option<u32> = None;
    let mut latest_range: Option<(u64, usize)> = None;
    let mut standby_override = false;

    for request in running {
        let wanted = request.interval.unwrap_or(catalog.default_interval);
        interval = Some(interval.map_or(wanted, |current| current.min(wanted)));

        if let Some(index) = request.active_range() {
            if latest_range.map_or(true, |(stamp, _)| request.range_stamp > stamp) {
                latest_range = Some((request.range_stamp, index));
            }
        }

        standby_override |= request.standby_override;
    }

    let data_range_index = latest_range.map_or(catalog.default_data_range, |(_, index)| index);
    let data_range = catalog
        .data_ranges
        .get(data_range_index)
        .copied()
        .unwrap_or_else(|| catalog.default_range());

    EffectiveConfiguration {
        interval,
        data_range_index,
        data_range,
        standby_override,
    }
}

/// Arbitrate over a set of sessions, ignoring any that are not Running.
pub fn arbitrate_sessions<'a, I>(catalog: &CapabilityCatalog, sessions: I) -> EffectiveConfiguration
where
    I: IntoIterator<Item = &'a Session>,
{
    arbitrate(
        catalog,
        sessions
            .into_iter()
            .filter(|s| s.is_running())
            .map(|s| &s.request),
    )
}

//! Per-sensor critical section
//!
//! A `SensorChannel` owns every open session of one sensor and the sensor's
//! current [`EffectiveConfiguration`]. All state-affecting calls go through
//! [`SensorChannel::apply`], which runs
//!
//! ```text
//! validate request → arbitrate → reconfigure device → commit → broadcast
//! ```
//!
//! under one async mutex, so concurrent setters on the same sensor can never
//! observe a torn intermediate state. Calls on different sensors use
//! different channels and proceed in parallel.
//!
//! The request is applied to a clone of the session first. If validation or
//! the device reconfiguration fails, the clone is discarded and only the
//! session's error slot changes.
//!
//! The sample path does not take the async mutex. Running sessions' buffers
//! are mirrored into a separate list that the producer reads under a short
//! read lock.

use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::data::session_buffer::{BufferPolicy, PushOutcome, SessionBuffer};
use crate::error::{ErrorState, SensorError, SensorResult};
use crate::hardware::adaptor::DeviceAdaptor;
use crate::sensor::arbitration::{arbitrate, EffectiveConfiguration};
use crate::sensor::catalog::{CapabilityCatalog, DataRange, DataRangeList, IntegerRangeList};
use crate::sensor::frame::SensorType;
use crate::sensor::session::{
    Property, PropertyChanged, Session, SessionId, SessionRequest, SessionState,
};

/// Where `propertyChanged` notifications for a session are delivered.
pub type Notifier = mpsc::UnboundedSender<PropertyChanged>;

struct SessionEntry {
    session: Session,
    buffer: Arc<SessionBuffer>,
    notifier: Option<Notifier>,
}

struct ChannelState {
    sessions: BTreeMap<SessionId, SessionEntry>,
    effective: EffectiveConfiguration,
    /// Sensor-wide sequence for data-range request recency
    stamp: u64,
    device_lost: bool,
}

/// Inputs available to a request while it is being applied.
pub struct ApplyContext<'a> {
    /// Catalog of the sensor
    pub catalog: &'a CapabilityCatalog,
    /// Sensor-wide data range recency counter
    pub stamp: &'a mut u64,
    /// Whether the device is currently lost
    pub device_lost: bool,
}

impl ApplyContext<'_> {
    fn next_stamp(&mut self) -> u64 {
        *self.stamp += 1;
        *self.stamp
    }
}

/// One sensor, its sessions and its effective configuration.
pub struct SensorChannel {
    id: String,
    description: String,
    sensor_type: SensorType,
    catalog: CapabilityCatalog,
    adaptor: Arc<dyn DeviceAdaptor>,
    default_buffer_size: u32,
    state: Mutex<ChannelState>,
    sinks: RwLock<Vec<Arc<SessionBuffer>>>,
}

impl std::fmt::Debug for SensorChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SensorChannel")
            .field("id", &self.id)
            .field("description", &self.description)
            .field("sensor_type", &self.sensor_type)
            .finish_non_exhaustive()
    }
}

impl SensorChannel {
    /// Channel for `adaptor`. Fails if its catalog is inconsistent.
    pub fn new(
        id: impl Into<String>,
        description: impl Into<String>,
        adaptor: Arc<dyn DeviceAdaptor>,
        default_buffer_size: u32,
    ) -> SensorResult<Self> {
        let catalog = adaptor.catalog();
        catalog
            .validate()
            .map_err(SensorError::InvalidParameter)?;
        let effective = EffectiveConfiguration::idle(&catalog);

        Ok(Self {
            id: id.into(),
            description: description.into(),
            sensor_type: adaptor.sensor_type(),
            catalog,
            adaptor,
            default_buffer_size: default_buffer_size.max(1),
            state: Mutex::new(ChannelState {
                sessions: BTreeMap::new(),
                effective,
                stamp: 0,
                device_lost: false,
            }),
            sinks: RwLock::new(Vec::new()),
        })
    }

    /// Sensor id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Human readable description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Type of the sensor.
    pub fn sensor_type(&self) -> SensorType {
        self.sensor_type
    }

    /// Capability catalog advertised by the adaptor.
    pub fn catalog(&self) -> &CapabilityCatalog {
        &self.catalog
    }

    /// Device behind this channel.
    pub fn adaptor(&self) -> &Arc<dyn DeviceAdaptor> {
        &self.adaptor
    }

    /// Whether the device buffers samples itself.
    pub fn hw_buffering(&self) -> bool {
        self.catalog.hw_buffering
    }

    /// Catalog intervals, in catalog order.
    pub fn available_intervals(&self) -> DataRangeList {
        self.catalog.intervals.clone()
    }

    /// Catalog data ranges, in catalog order.
    pub fn available_data_ranges(&self) -> DataRangeList {
        self.catalog.data_ranges.clone()
    }

    /// Catalog buffer intervals, in catalog order.
    pub fn available_buffer_intervals(&self) -> IntegerRangeList {
        self.catalog.buffer_intervals.clone()
    }

    /// Catalog buffer sizes, in catalog order.
    pub fn available_buffer_sizes(&self) -> IntegerRangeList {
        self.catalog.buffer_sizes.clone()
    }

    fn policy_for(&self, request: &SessionRequest) -> BufferPolicy {
        BufferPolicy::new(
            request.buffer_size.unwrap_or(self.default_buffer_size) as usize,
            request.downsampling,
            request.buffer_interval.unwrap_or(0),
        )
    }

    // =========================================================================
    // Session lifecycle
    // =========================================================================

    /// Register a freshly opened session. It starts out Created and does not
    /// take part in arbitration.
    pub async fn attach(&self, session: Session, notifier: Option<Notifier>) -> Arc<SessionBuffer> {
        let buffer = Arc::new(SessionBuffer::new(
            self.sensor_type.frame_size(),
            self.policy_for(&session.request),
        ));
        let mut state = self.state.lock().await;
        debug!(sensor = %self.id, session_id = session.id, "session attached");
        state.sessions.insert(
            session.id,
            SessionEntry {
                session,
                buffer: buffer.clone(),
                notifier,
            },
        );
        buffer
    }

    /// Remove a session. If it was Running the remaining sessions are
    /// re-arbitrated and notified.
    pub async fn detach(&self, id: SessionId) -> SensorResult<()> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let entry = state
            .sessions
            .remove(&id)
            .ok_or(SensorError::InvalidSession(id))?;
        entry.buffer.close();

        if entry.session.is_running() {
            let next = self.arbitrate_current(state);
            if next != state.effective {
                if let Err(e) = self.adaptor.configure(&next).await {
                    // The session is gone either way; keep the configuration
                    // consistent with the remaining sessions.
                    warn!(sensor = %self.id, error = %e, "device reconfiguration failed on release");
                }
                let changed = state.effective.diff(&next);
                state.effective = next;
                self.broadcast(state, &changed);
            }
        }
        self.refresh_sinks(state);
        debug!(sensor = %self.id, session_id = id, "session detached");
        Ok(())
    }

    /// Move a session to Running. Fails while the device is lost.
    pub async fn start(&self, id: SessionId) -> SensorResult<()> {
        self.apply(id, "start", |session, ctx| {
            if ctx.device_lost {
                return Err(SensorError::ChannelClosed(
                    "sensor device is not available".into(),
                ));
            }
            session.state = SessionState::Running;
            Ok(())
        })
        .await
    }

    /// Move a Running session to Stopped.
    pub async fn stop(&self, id: SessionId) -> SensorResult<()> {
        self.apply(id, "stop", |session, _| {
            if session.state == SessionState::Running {
                session.state = SessionState::Stopped;
            }
            Ok(())
        })
        .await
    }

    // =========================================================================
    // Setters
    // =========================================================================

    /// Request a sampling interval in ms. `0` clears the request.
    pub async fn set_interval(&self, id: SessionId, value: u32) -> SensorResult<()> {
        self.apply(id, "setInterval", |session, ctx| {
            session.request.interval = match value {
                0 => None,
                v => Some(ctx.catalog.resolve_interval(v)?),
            };
            Ok(())
        })
        .await
    }

    /// Returns whether the override is honoured.
    pub async fn set_standby_override(&self, id: SessionId, value: bool) -> SensorResult<bool> {
        self.apply(id, "setStandbyOverride", |session, _| {
            session.request.standby_override = value;
            Ok(true)
        })
        .await
    }

    /// Request a buffer interval in ms. `0` clears the request.
    pub async fn set_buffer_interval(&self, id: SessionId, value: u32) -> SensorResult<()> {
        self.apply(id, "setBufferInterval", |session, ctx| {
            session.request.buffer_interval = match value {
                0 => None,
                v => Some(ctx.catalog.resolve_buffer_interval(v)?),
            };
            Ok(())
        })
        .await
    }

    /// Request a buffer size in samples. `0` clears the request.
    pub async fn set_buffer_size(&self, id: SessionId, value: u32) -> SensorResult<()> {
        self.apply(id, "setBufferSize", |session, ctx| {
            session.request.buffer_size = match value {
                0 => None,
                v => Some(ctx.catalog.resolve_buffer_size(v)?),
            };
            Ok(())
        })
        .await
    }

    /// Choose decimation or overflow errors for a full queue.
    pub async fn set_downsampling(&self, id: SessionId, value: bool) -> SensorResult<()> {
        self.apply(id, "setDownsampling", |session, _| {
            session.request.downsampling = value;
            Ok(())
        })
        .await
    }

    /// Push the catalog entry at `index` onto the session's range stack.
    pub async fn set_data_range_index(&self, id: SessionId, index: usize) -> SensorResult<()> {
        self.apply(id, "setDataRangeIndex", |session, ctx| {
            ctx.catalog.data_range(index)?;
            session.request.data_ranges.push(index);
            session.request.range_stamp = ctx.next_stamp();
            Ok(())
        })
        .await
    }

    /// Push a free-form range request, mapped onto the catalog.
    pub async fn request_data_range(&self, id: SessionId, range: DataRange) -> SensorResult<()> {
        self.apply(id, "requestDataRange", |session, ctx| {
            let index = ctx.catalog.match_data_range(&range)?;
            session.request.data_ranges.push(index);
            session.request.range_stamp = ctx.next_stamp();
            Ok(())
        })
        .await
    }

    /// Pop the session's newest range request. A no-op on an empty stack.
    pub async fn remove_data_range_request(&self, id: SessionId) -> SensorResult<()> {
        self.apply(id, "removeDataRangeRequest", |session, ctx| {
            if session.request.data_ranges.pop().is_some()
                && !session.request.data_ranges.is_empty()
            {
                session.request.range_stamp = ctx.next_stamp();
            }
            Ok(())
        })
        .await
    }

    // =========================================================================
    // Getters
    // =========================================================================

    async fn read<R>(&self, id: SessionId, f: impl FnOnce(&SessionEntry, &ChannelState) -> R) -> SensorResult<R> {
        let state = self.state.lock().await;
        let entry = state
            .sessions
            .get(&id)
            .ok_or(SensorError::InvalidSession(id))?;
        Ok(f(entry, &*state))
    }

    /// Snapshot of a session.
    pub async fn session(&self, id: SessionId) -> SensorResult<Session> {
        self.read(id, |e, _| e.session.clone()).await
    }

    /// Lifecycle state of a session.
    pub async fn state_of(&self, id: SessionId) -> SensorResult<SessionState> {
        self.read(id, |e, _| e.session.state).await
    }

    /// Requested interval; `None` when the session uses the default.
    pub async fn interval(&self, id: SessionId) -> SensorResult<Option<u32>> {
        self.read(id, |e, _| e.session.request.interval).await
    }

    /// Requested standby override.
    pub async fn standby_override(&self, id: SessionId) -> SensorResult<bool> {
        self.read(id, |e, _| e.session.request.standby_override).await
    }

    /// Buffer interval in effect, 0 when unset.
    pub async fn buffer_interval(&self, id: SessionId) -> SensorResult<u32> {
        self.read(id, |e, _| e.session.request.buffer_interval.unwrap_or(0))
            .await
    }

    /// Queue capacity in effect for the session.
    pub async fn buffer_size(&self, id: SessionId) -> SensorResult<u32> {
        let default = self.default_buffer_size;
        self.read(id, |e, _| e.session.request.buffer_size.unwrap_or(default))
            .await
    }

    /// Downsampling flag.
    pub async fn downsampling(&self, id: SessionId) -> SensorResult<bool> {
        self.read(id, |e, _| e.session.request.downsampling).await
    }

    /// Data range the caller would observe right now: the effective range
    /// while anything is Running, otherwise the caller's own newest request
    /// or the sensor default.
    pub async fn current_data_range(&self, id: SessionId) -> SensorResult<DataRange> {
        let catalog = &self.catalog;
        self.read(id, |e, state| {
            let any_running = state.sessions.values().any(|s| s.session.is_running());
            if any_running {
                state.effective.data_range
            } else {
                e.session
                    .request
                    .active_range()
                    .and_then(|i| catalog.data_ranges.get(i).copied())
                    .unwrap_or_else(|| catalog.default_range())
            }
        })
        .await
    }

    /// Last error of the session, including unacknowledged overflow.
    pub async fn error(&self, id: SessionId) -> SensorResult<ErrorState> {
        self.read(id, |e, _| {
            let mut error = e.session.error.clone();
            if !error.is_set() {
                if let Some(dropped) = e.buffer.unacknowledged_overflow() {
                    error.set(&SensorError::Overflow { dropped });
                }
            }
            error
        })
        .await
    }

    /// Current effective configuration.
    pub async fn effective(&self) -> EffectiveConfiguration {
        self.state.lock().await.effective
    }

    /// Ids of every attached session.
    pub async fn session_ids(&self) -> Vec<SessionId> {
        self.state.lock().await.sessions.keys().copied().collect()
    }

    /// Number of Running sessions.
    pub async fn running_count(&self) -> usize {
        self.state
            .lock()
            .await
            .sessions
            .values()
            .filter(|e| e.session.is_running())
            .count()
    }

    /// Whether the device is currently lost.
    pub async fn is_device_lost(&self) -> bool {
        self.state.lock().await.device_lost
    }

    // =========================================================================
    // Critical section
    // =========================================================================

    /// Apply a request to one session and re-arbitrate, atomically.
    pub async fn apply<R, F>(&self, id: SessionId, op: &'static str, f: F) -> SensorResult<R>
    where
        F: FnOnce(&mut Session, &mut ApplyContext<'_>) -> SensorResult<R>,
    {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let mut candidate = match state.sessions.get(&id) {
            Some(entry) => entry.session.clone(),
            None => return Err(SensorError::InvalidSession(id)),
        };

        let mut stamp = state.stamp;
        let mut ctx = ApplyContext {
            catalog: &self.catalog,
            stamp: &mut stamp,
            device_lost: state.device_lost,
        };
        let value = match f(&mut candidate, &mut ctx) {
            Ok(value) => value,
            Err(err) => {
                Self::record_error(state, id, &err, op);
                return Err(err);
            }
        };

        let next = arbitrate(
            &self.catalog,
            state
                .sessions
                .values()
                .map(|e| {
                    if e.session.id == id {
                        &candidate
                    } else {
                        &e.session
                    }
                })
                .filter(|s| s.is_running())
                .map(|s| &s.request),
        );

        if next != state.effective {
            if let Err(e) = self.adaptor.configure(&next).await {
                let err = SensorError::ChannelClosed(format!("device rejected configuration: {e}"));
                warn!(sensor = %self.id, session_id = id, op, error = %e, "reconfiguration failed, request rolled back");
                Self::record_error(state, id, &err, op);
                return Err(err);
            }
            info!(
                sensor = %self.id,
                interval = ?next.interval,
                data_range = next.data_range_index,
                standby_override = next.standby_override,
                "effective configuration changed"
            );
        }

        candidate.error.clear();
        let changed = state.effective.diff(&next);
        state.effective = next;
        state.stamp = stamp;
        if let Some(entry) = state.sessions.get_mut(&id) {
            entry.buffer.acknowledge_overflow();
            entry.buffer.set_policy(self.policy_for(&candidate.request));
            entry.session = candidate;
        }
        self.refresh_sinks(state);
        self.broadcast(state, &changed);

        debug!(sensor = %self.id, session_id = id, op, "request applied");
        Ok(value)
    }

    fn arbitrate_current(&self, state: &ChannelState) -> EffectiveConfiguration {
        arbitrate(
            &self.catalog,
            state
                .sessions
                .values()
                .filter(|e| e.session.is_running())
                .map(|e| &e.session.request),
        )
    }

    fn record_error(state: &mut ChannelState, id: SessionId, err: &SensorError, op: &str) {
        if let Some(entry) = state.sessions.get_mut(&id) {
            entry.session.error.set(err);
        }
        debug!(session_id = id, op, error = %err, "request failed");
    }

    /// Deliver `propertyChanged` to every Running session.
    fn broadcast(&self, state: &ChannelState, changed: &[Property]) {
        if changed.is_empty() {
            return;
        }
        for entry in state.sessions.values() {
            if !entry.session.is_running() {
                continue;
            }
            let Some(notifier) = &entry.notifier else {
                continue;
            };
            for property in changed {
                let event = PropertyChanged {
                    session_id: entry.session.id,
                    property: *property,
                };
                if notifier.send(event).is_err() {
                    debug!(session_id = entry.session.id, "notification receiver gone");
                }
            }
        }
    }

    fn refresh_sinks(&self, state: &ChannelState) {
        let running: Vec<Arc<SessionBuffer>> = state
            .sessions
            .values()
            .filter(|e| e.session.is_running())
            .map(|e| e.buffer.clone())
            .collect();
        *self.sinks.write().unwrap_or_else(PoisonError::into_inner) = running;
    }

    // =========================================================================
    // Sample path and device health
    // =========================================================================

    /// Fan one encoded sample out to every Running session.
    pub fn push_frame(&self, frame: Bytes) {
        if frame.len() != self.sensor_type.frame_size() {
            warn!(
                sensor = %self.id,
                len = frame.len(),
                expected = self.sensor_type.frame_size(),
                "dropping malformed sample from adaptor"
            );
            return;
        }
        let sinks = self.sinks.read().unwrap_or_else(PoisonError::into_inner);
        for buffer in sinks.iter() {
            if let PushOutcome::Overflow = buffer.push(frame.clone()) {
                debug!(sensor = %self.id, "session queue overflow");
            }
        }
    }

    /// Mark every Running session `ChannelClosed` and refuse data until the
    /// device is restored.
    pub async fn device_lost(&self) {
        let mut state = self.state.lock().await;
        if state.device_lost {
            return;
        }
        state.device_lost = true;
        let err = SensorError::ChannelClosed(format!("sensor '{}' device lost", self.id));
        for entry in state.sessions.values_mut() {
            if entry.session.is_running() {
                entry.session.error.set(&err);
            }
            entry.buffer.suspend();
        }
        warn!(sensor = %self.id, "device lost");
    }

    /// Device is back: resume buffers and re-apply the configuration.
    pub async fn device_restored(&self) {
        let mut state = self.state.lock().await;
        if !state.device_lost {
            return;
        }
        state.device_lost = false;
        for entry in state.sessions.values() {
            entry.buffer.resume();
        }
        let effective = state.effective;
        if let Err(e) = self.adaptor.configure(&effective).await {
            warn!(sensor = %self.id, error = %e, "reconfiguration after restore failed");
        }
        info!(sensor = %self.id, "device restored");
    }
}

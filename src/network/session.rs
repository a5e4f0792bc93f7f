//! Session Manager
//!
//! Registry of every sensor the daemon serves and every open session. The
//! manager hands session ids out, enforces the session cap and routes each
//! session id to the [`SensorChannel`] that owns it. Everything that touches
//! arbitration happens inside the channel; the manager only keeps the
//! id → sensor map consistent.
//!
//! # Example
//!
//! ```rust,ignore
//! let manager = SessionManager::new(64, 256);
//! manager.register_sensor("accel", None, Arc::new(MockSensor::accelerometer())).await?;
//!
//! let (id, _buffer) = manager.open("accel", "client-1", None).await?;
//! manager.channel(id).await?.set_interval(id, 50).await?;
//! manager.release(id).await?;
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::data::session_buffer::SessionBuffer;
use crate::error::{SensorError, SensorResult};
use crate::hardware::adaptor::{DeviceAdaptor, SampleSink};
use crate::network::protocol::SensorInfo;
use crate::sensor::channel::{Notifier, SensorChannel};
use crate::sensor::session::{Session, SessionId};

/// Default daemon-wide session cap.
pub const DEFAULT_MAX_SESSIONS: usize = 64;

/// Default per-session queue capacity in samples.
pub const DEFAULT_BUFFER_SIZE: u32 = 256;

#[derive(Clone)]
struct OpenSession {
    channel: Arc<SensorChannel>,
    client_id: String,
}

struct Registry {
    sessions: HashMap<SessionId, OpenSession>,
    next_id: SessionId,
}

impl Registry {
    /// Next positive id not held by an open session.
    fn allocate(&mut self) -> SessionId {
        loop {
            let candidate = self.next_id;
            self.next_id = if self.next_id == SessionId::MAX {
                1
            } else {
                self.next_id + 1
            };
            if !self.sessions.contains_key(&candidate) {
                return candidate;
            }
        }
    }
}

/// Sensor registry and open-session table shared by every connection.
#[derive(Clone)]
pub struct SessionManager {
    sensors: Arc<RwLock<BTreeMap<String, Arc<SensorChannel>>>>,
    registry: Arc<RwLock<Registry>>,
    max_sessions: usize,
    default_buffer_size: u32,
}

impl SessionManager {
    /// Empty manager. Both limits are raised to at least 1.
    pub fn new(max_sessions: usize, default_buffer_size: u32) -> Self {
        Self {
            sensors: Arc::new(RwLock::new(BTreeMap::new())),
            registry: Arc::new(RwLock::new(Registry {
                sessions: HashMap::new(),
                next_id: 1,
            })),
            max_sessions: max_sessions.max(1),
            default_buffer_size: default_buffer_size.max(1),
        }
    }

    /// Daemon-wide session cap.
    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    // =========================================================================
    // Sensors
    // =========================================================================

    /// Register a device under `id` and attach its sample sink.
    pub async fn register_sensor(
        &self,
        id: &str,
        description: Option<String>,
        adaptor: Arc<dyn DeviceAdaptor>,
    ) -> SensorResult<Arc<SensorChannel>> {
        if self.sensors.read().await.contains_key(id) {
            return Err(duplicate_sensor(id));
        }

        let description = description.unwrap_or_else(|| adaptor.description());
        let channel = Arc::new(SensorChannel::new(
            id,
            description,
            adaptor.clone(),
            self.default_buffer_size,
        )?);
        adaptor
            .attach(SampleSink::new(&channel))
            .await
            .map_err(|e| SensorError::ChannelClosed(format!("attaching '{id}' failed: {e}")))?;

        let mut sensors = self.sensors.write().await;
        if sensors.contains_key(id) {
            drop(sensors);
            if let Err(e) = adaptor.detach().await {
                warn!(sensor = id, error = %e, "adaptor detach failed");
            }
            return Err(duplicate_sensor(id));
        }
        sensors.insert(id.to_string(), channel.clone());
        info!(sensor = id, sensor_type = %channel.sensor_type(), "sensor registered");
        Ok(channel)
    }

    /// Channel serving sensor `id`.
    pub async fn sensor(&self, id: &str) -> Option<Arc<SensorChannel>> {
        self.sensors.read().await.get(id).cloned()
    }

    /// All registered channels, ordered by sensor id.
    pub async fn sensors(&self) -> Vec<Arc<SensorChannel>> {
        self.sensors.read().await.values().cloned().collect()
    }

    /// Wire descriptions of all registered sensors.
    pub async fn sensor_infos(&self) -> Vec<SensorInfo> {
        self.sensors
            .read()
            .await
            .values()
            .map(|channel| sensor_info(channel))
            .collect()
    }

    /// Release every session and detach every adaptor.
    pub async fn shutdown(&self) {
        let ids: Vec<SessionId> = self.registry.read().await.sessions.keys().copied().collect();
        for id in ids {
            if let Err(e) = self.release(id).await {
                debug!(session_id = id, error = %e, "release during shutdown");
            }
        }
        let sensors: Vec<_> = std::mem::take(&mut *self.sensors.write().await)
            .into_values()
            .collect();
        for channel in sensors {
            if let Err(e) = channel.adaptor().detach().await {
                warn!(sensor = channel.id(), error = %e, "adaptor detach failed");
            }
        }
        info!("session manager shut down");
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    /// Open a session on `sensor` for `client_id`.
    pub async fn open(
        &self,
        sensor: &str,
        client_id: &str,
        notifier: Option<Notifier>,
    ) -> SensorResult<(SessionId, Arc<SessionBuffer>)> {
        let channel = self
            .sensor(sensor)
            .await
            .ok_or_else(|| SensorError::NotFound(sensor.to_string()))?;

        // The slot is reserved under the registry lock; the channel is
        // attached with no registry lock held.
        let id = {
            let mut registry = self.registry.write().await;
            if registry.sessions.len() >= self.max_sessions {
                warn!(sensor, client = client_id, "session cap reached");
                return Err(SensorError::ResourceExhausted(format!(
                    "{} sessions open (limit {})",
                    registry.sessions.len(),
                    self.max_sessions
                )));
            }
            let id = registry.allocate();
            registry.sessions.insert(
                id,
                OpenSession {
                    channel: channel.clone(),
                    client_id: client_id.to_string(),
                },
            );
            id
        };

        let buffer = channel
            .attach(Session::new(id, sensor, client_id), notifier)
            .await;
        if !self.is_open(id).await {
            // Released by shutdown or a disconnect while attaching.
            if let Err(e) = channel.detach(id).await {
                debug!(session_id = id, error = %e, "detach after concurrent release");
            }
            return Err(SensorError::InvalidSession(id));
        }
        info!(session_id = id, sensor, client = client_id, "session opened");
        Ok((id, buffer))
    }

    /// Release a session. A second release of the same id fails with
    /// `InvalidSession`.
    pub async fn release(&self, id: SessionId) -> SensorResult<()> {
        let open = self
            .registry
            .write()
            .await
            .sessions
            .remove(&id)
            .ok_or(SensorError::InvalidSession(id))?;
        open.channel.detach(id).await?;
        info!(session_id = id, sensor = open.channel.id(), "session released");
        Ok(())
    }

    /// Release a session on behalf of `client_id`, which must own it.
    pub async fn release_owned(&self, id: SessionId, client_id: &str) -> SensorResult<()> {
        self.channel_for(id, client_id).await?;
        self.release(id).await
    }

    /// Release everything a client holds. Returns the released ids.
    pub async fn release_client(&self, client_id: &str) -> Vec<SessionId> {
        let owned: Vec<SessionId> = self
            .registry
            .read()
            .await
            .sessions
            .iter()
            .filter(|(_, open)| open.client_id == client_id)
            .map(|(id, _)| *id)
            .collect();

        let mut released = Vec::with_capacity(owned.len());
        for id in owned {
            match self.release(id).await {
                Ok(()) => released.push(id),
                Err(e) => debug!(session_id = id, error = %e, "already released"),
            }
        }
        if !released.is_empty() {
            info!(client = client_id, count = released.len(), "released sessions of disconnected client");
        }
        released
    }

    /// Channel owning session `id`.
    pub async fn channel(&self, id: SessionId) -> SensorResult<Arc<SensorChannel>> {
        self.registry
            .read()
            .await
            .sessions
            .get(&id)
            .map(|open| open.channel.clone())
            .ok_or(SensorError::InvalidSession(id))
    }

    /// Channel owning session `id`, provided `client_id` opened it. Sessions
    /// of other clients are reported as invalid.
    pub async fn channel_for(&self, id: SessionId, client_id: &str) -> SensorResult<Arc<SensorChannel>> {
        match self.registry.read().await.sessions.get(&id) {
            Some(open) if open.client_id == client_id => Ok(open.channel.clone()),
            _ => Err(SensorError::InvalidSession(id)),
        }
    }

    /// Number of open sessions across all sensors.
    pub async fn session_count(&self) -> usize {
        self.registry.read().await.sessions.len()
    }

    /// Whether `id` names an open session.
    pub async fn is_open(&self, id: SessionId) -> bool {
        self.registry.read().await.sessions.contains_key(&id)
    }

    // =========================================================================
    // Device health
    // =========================================================================

    /// Mark the device behind `sensor` as lost.
    pub async fn device_lost(&self, sensor: &str) -> SensorResult<()> {
        let channel = self
            .sensor(sensor)
            .await
            .ok_or_else(|| SensorError::NotFound(sensor.to_string()))?;
        channel.device_lost().await;
        Ok(())
    }

    /// Mark the device behind `sensor` as available again.
    pub async fn device_restored(&self, sensor: &str) -> SensorResult<()> {
        let channel = self
            .sensor(sensor)
            .await
            .ok_or_else(|| SensorError::NotFound(sensor.to_string()))?;
        channel.device_restored().await;
        Ok(())
    }
}

fn duplicate_sensor(id: &str) -> SensorError {
    SensorError::InvalidParameter(format!("sensor '{id}' is already registered"))
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SESSIONS, DEFAULT_BUFFER_SIZE)
    }
}

/// Wire description of a registered sensor.
pub fn sensor_info(channel: &SensorChannel) -> SensorInfo {
    SensorInfo {
        id: channel.id().to_string(),
        sensor_type: channel.sensor_type(),
        description: channel.description().to_string(),
        hw_buffering: channel.hw_buffering(),
        frame_size: channel.sensor_type().frame_size(),
    }
}

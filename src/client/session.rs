//! Client-side session proxy

use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::net::UnixStream;
use tokio::sync::broadcast;

use super::{lock, DataReader, SensorClient};
use crate::error::{ErrorCode, ErrorState, SensorError, SensorResult};
use crate::network::protocol::{ControlCall, OpenReply, SensorInfo, SessionInfo};
use crate::sensor::arbitration::EffectiveConfiguration;
use crate::sensor::catalog::{DataRange, DataRangeList, IntegerRangeList};
use crate::sensor::frame::{Frame, SensorType};
use crate::sensor::session::{Property, SessionId};

/// One open session, as seen by the client.
///
/// Every failing call records its error locally, readable through
/// [`error_code`](Self::error_code) and [`error_string`](Self::error_string);
/// a successful mutating call clears it.
pub struct SensorSession {
    client: SensorClient,
    session_id: SessionId,
    info: SensorInfo,
    data_socket: PathBuf,
    error: Mutex<ErrorState>,
    released: AtomicBool,
    events: broadcast::Sender<Property>,
}

impl SensorSession {
    pub(crate) fn new(client: SensorClient, reply: OpenReply, events: broadcast::Sender<Property>) -> Self {
        Self {
            client,
            session_id: reply.session_id,
            info: reply.sensor,
            data_socket: reply.data_socket,
            error: Mutex::new(ErrorState::default()),
            released: AtomicBool::new(false),
            events,
        }
    }

    // =========================================================================
    // Identity
    // =========================================================================

    /// Daemon-assigned session id.
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Sensor id this session was opened on.
    pub fn id(&self) -> &str {
        &self.info.id
    }

    /// Type of the sensor.
    pub fn sensor_type(&self) -> SensorType {
        self.info.sensor_type
    }

    /// Sensor description.
    pub fn description(&self) -> &str {
        &self.info.description
    }

    /// Whether the device buffers samples itself.
    pub fn hw_buffering(&self) -> bool {
        self.info.hw_buffering
    }

    /// Unix socket carrying this session's samples.
    pub fn data_socket(&self) -> &Path {
        &self.data_socket
    }

    /// True from `open()` until `release()` or loss of the control
    /// connection. Never becomes true again.
    pub fn is_valid(&self) -> bool {
        !self.released.load(Ordering::SeqCst) && !self.client.is_closed()
    }

    /// `propertyChanged` events for this session.
    pub fn subscribe(&self) -> broadcast::Receiver<Property> {
        self.events.subscribe()
    }

    // =========================================================================
    // Error state
    // =========================================================================

    /// Code of the last failed call, `None` after a successful mutation.
    pub fn error_code(&self) -> ErrorCode {
        lock(&self.error).code
    }

    /// Numeric form of `error_code`.
    pub fn error_code_int(&self) -> i32 {
        self.error_code() as i32
    }

    /// Message of the last failed call.
    pub fn error_string(&self) -> String {
        lock(&self.error).message.clone()
    }

    /// Error state held by the daemon, which also reports overflow seen on
    /// the data channel.
    pub async fn daemon_error(&self) -> SensorResult<ErrorState> {
        self.query(ControlCall::Error {
            session_id: self.session_id,
        })
        .await
    }

    async fn query<T: DeserializeOwned>(&self, call: ControlCall) -> SensorResult<T> {
        self.client.call(&call).await.map_err(|e| self.record(e))
    }

    async fn mutate<T: DeserializeOwned>(&self, call: ControlCall) -> SensorResult<T> {
        let value = self.query(call).await?;
        lock(&self.error).clear();
        Ok(value)
    }

    fn record(&self, err: SensorError) -> SensorError {
        lock(&self.error).set(&err);
        err
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start sampling; the session joins arbitration.
    pub async fn start(&self) -> SensorResult<()> {
        self.mutate(ControlCall::Start {
            session_id: self.session_id,
        })
        .await
    }

    /// Stop sampling; requests are kept.
    pub async fn stop(&self) -> SensorResult<()> {
        self.mutate(ControlCall::Stop {
            session_id: self.session_id,
        })
        .await
    }

    /// Release the session. A second call fails with `InvalidSession`.
    pub async fn release(&self) -> SensorResult<()> {
        let result = self
            .mutate(ControlCall::Release {
                session_id: self.session_id,
            })
            .await;
        if result.is_ok() {
            self.released.store(true, Ordering::SeqCst);
            self.client.unsubscribe(self.session_id);
        }
        result
    }

    /// Lifecycle state and sensor description.
    pub async fn describe(&self) -> SensorResult<SessionInfo> {
        self.query(ControlCall::Describe {
            session_id: self.session_id,
        })
        .await
    }

    // =========================================================================
    // Properties
    // =========================================================================

    /// Requested interval in ms, `None` when the sensor default applies.
    pub async fn interval(&self) -> SensorResult<Option<u32>> {
        self.query(ControlCall::Interval {
            session_id: self.session_id,
        })
        .await
    }

    /// Request a sampling interval; `0` clears the request.
    pub async fn set_interval(&self, value: u32) -> SensorResult<()> {
        self.mutate(ControlCall::SetInterval {
            session_id: self.session_id,
            value,
        })
        .await
    }

    /// Requested standby override.
    pub async fn standby_override(&self) -> SensorResult<bool> {
        self.query(ControlCall::StandbyOverride {
            session_id: self.session_id,
        })
        .await
    }

    /// Request standby override. Returns whether the device honours it.
    pub async fn set_standby_override(&self, value: bool) -> SensorResult<bool> {
        self.mutate(ControlCall::SetStandbyOverride {
            session_id: self.session_id,
            value,
        })
        .await
    }

    /// Buffer interval in ms, 0 when unset.
    pub async fn buffer_interval(&self) -> SensorResult<u32> {
        self.query(ControlCall::BufferInterval {
            session_id: self.session_id,
        })
        .await
    }

    /// Request a buffer interval; `0` clears the request.
    pub async fn set_buffer_interval(&self, value: u32) -> SensorResult<()> {
        self.mutate(ControlCall::SetBufferInterval {
            session_id: self.session_id,
            value,
        })
        .await
    }

    /// Queue capacity in samples.
    pub async fn buffer_size(&self) -> SensorResult<u32> {
        self.query(ControlCall::BufferSize {
            session_id: self.session_id,
        })
        .await
    }

    /// Request a queue capacity; `0` clears the request.
    pub async fn set_buffer_size(&self, value: u32) -> SensorResult<()> {
        self.mutate(ControlCall::SetBufferSize {
            session_id: self.session_id,
            value,
        })
        .await
    }

    /// Downsampling flag.
    pub async fn downsampling(&self) -> SensorResult<bool> {
        self.query(ControlCall::Downsampling {
            session_id: self.session_id,
        })
        .await
    }

    /// Decimate on a full queue instead of reporting overflow.
    pub async fn set_downsampling(&self, value: bool) -> SensorResult<()> {
        self.mutate(ControlCall::SetDownsampling {
            session_id: self.session_id,
            value,
        })
        .await
    }

    // =========================================================================
    // Data range
    // =========================================================================

    /// Request the catalog data range at `index`.
    pub async fn set_data_range_index(&self, index: usize) -> SensorResult<()> {
        self.mutate(ControlCall::SetDataRangeIndex {
            session_id: self.session_id,
            index,
        })
        .await
    }

    /// Push a data range request; it must match a catalog entry.
    pub async fn request_data_range(&self, range: DataRange) -> SensorResult<()> {
        self.mutate(ControlCall::RequestDataRange {
            session_id: self.session_id,
            range,
        })
        .await
    }

    /// Pop the newest data range request.
    pub async fn remove_data_range_request(&self) -> SensorResult<()> {
        self.mutate(ControlCall::RemoveDataRangeRequest {
            session_id: self.session_id,
        })
        .await
    }

    /// Data range in effect for this session.
    pub async fn current_data_range(&self) -> SensorResult<DataRange> {
        self.query(ControlCall::CurrentDataRange {
            session_id: self.session_id,
        })
        .await
    }

    /// Configuration the device currently runs at.
    pub async fn effective(&self) -> SensorResult<EffectiveConfiguration> {
        self.query(ControlCall::Effective {
            session_id: self.session_id,
        })
        .await
    }

    // =========================================================================
    // Capabilities
    // =========================================================================

    /// Supported intervals in ms.
    pub async fn available_intervals(&self) -> SensorResult<DataRangeList> {
        self.query(ControlCall::AvailableIntervals {
            session_id: self.session_id,
        })
        .await
    }

    /// Supported data ranges.
    pub async fn available_data_ranges(&self) -> SensorResult<DataRangeList> {
        self.query(ControlCall::AvailableDataRanges {
            session_id: self.session_id,
        })
        .await
    }

    /// Supported buffer intervals in ms.
    pub async fn available_buffer_intervals(&self) -> SensorResult<IntegerRangeList> {
        self.query(ControlCall::AvailableBufferIntervals {
            session_id: self.session_id,
        })
        .await
    }

    /// Supported queue capacities.
    pub async fn available_buffer_sizes(&self) -> SensorResult<IntegerRangeList> {
        self.query(ControlCall::AvailableBufferSizes {
            session_id: self.session_id,
        })
        .await
    }

    // =========================================================================
    // Data channel
    // =========================================================================

    /// Connect to this session's data socket.
    ///
    /// `T` must be the record type of the session's sensor.
    pub async fn connect_data<T: Frame>(&self) -> SensorResult<DataReader<T, UnixStream>> {
        if T::SIZE != self.info.frame_size {
            return Err(self.record(SensorError::InvalidParameter(format!(
                "{}-byte records requested from a {}-byte {} channel",
                T::SIZE,
                self.info.frame_size,
                self.info.sensor_type
            ))));
        }
        let stream = UnixStream::connect(&self.data_socket)
            .await
            .map_err(|e| self.record(e.into()))?;
        let mut reader = DataReader::new(stream);
        reader.handshake().await.map_err(|e| self.record(e))?;
        Ok(reader)
    }
}

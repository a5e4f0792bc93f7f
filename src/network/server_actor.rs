//! Control server
//!
//! Accepts control connections on a Unix socket and serves [`ControlCall`]s.
//! Each connection runs as its own task:
//!
//! ```text
//! socket reader task ──requests──▶ connection loop ──▶ SensorChannel
//!                                        ▲                  │
//!                                        └──notifications───┘
//! ```
//!
//! The connection loop owns the write half. After dispatching a call it
//! flushes every `propertyChanged` queued for its sessions before writing
//! the response, which is what gives clients notify-before-return.
//!
//! When the connection ends, for any reason, every session it opened is
//! released as if the client had called `release()` itself.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{SensorError, SensorResult};
use crate::network::data_endpoint::DataEndpoint;
use crate::network::protocol::{
    read_envelope, write_envelope, ControlCall, ControlReply, Envelope, MessageKind, OpenReply,
    SessionInfo,
};
use crate::network::session::{sensor_info, SessionManager};
use crate::sensor::session::{PropertyChanged, SessionId};

const REQUEST_QUEUE_DEPTH: usize = 32;

/// Control socket server over a [`SessionManager`].
pub struct ControlServer {
    listener: UnixListener,
    path: PathBuf,
    data_dir: PathBuf,
    manager: SessionManager,
    max_message_size: usize,
}

impl ControlServer {
    /// Bind the control socket, replacing a stale one.
    pub async fn bind(
        path: impl AsRef<Path>,
        data_dir: impl AsRef<Path>,
        manager: SessionManager,
        max_message_size: usize,
    ) -> SensorResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        let data_dir = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&data_dir)?;

        let listener = UnixListener::bind(&path)?;
        info!(path = %path.display(), "control server listening");

        Ok(Self {
            listener,
            path,
            data_dir,
            manager,
            max_message_size,
        })
    }

    /// Control socket path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Session manager behind the server.
    pub fn manager(&self) -> &SessionManager {
        &self.manager
    }

    /// Serve until `shutdown` resolves, then release everything.
    pub async fn run_until<F>(self, shutdown: F) -> SensorResult<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((socket, _)) => {
                            let connection = Connection::new(
                                self.manager.clone(),
                                self.data_dir.clone(),
                                self.max_message_size,
                            );
                            tokio::spawn(connection.run(socket));
                        }
                        Err(e) => error!(error = %e, "accept error"),
                    }
                }
                _ = &mut shutdown => {
                    info!("control server shutting down");
                    break;
                }
            }
        }

        self.manager.shutdown().await;
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!(error = %e, "control socket already removed");
        }
        Ok(())
    }

    /// Serve forever.
    pub async fn run(self) -> SensorResult<()> {
        self.run_until(std::future::pending()).await
    }
}

// =============================================================================
// Connection
// =============================================================================

struct Connection {
    client_id: String,
    manager: SessionManager,
    data_dir: PathBuf,
    max_message_size: usize,
    endpoints: HashMap<SessionId, DataEndpoint>,
    notifier: mpsc::UnboundedSender<PropertyChanged>,
    notifications: mpsc::UnboundedReceiver<PropertyChanged>,
}

impl Connection {
    fn new(manager: SessionManager, data_dir: PathBuf, max_message_size: usize) -> Self {
        let (notifier, notifications) = mpsc::unbounded_channel();
        Self {
            client_id: format!("client-{}", Uuid::new_v4()),
            manager,
            data_dir,
            max_message_size,
            endpoints: HashMap::new(),
            notifier,
            notifications,
        }
    }

    async fn run(mut self, socket: UnixStream) {
        info!(client = %self.client_id, "client connected");
        let (mut read_half, mut writer) = socket.into_split();

        let (request_tx, mut requests) = mpsc::channel(REQUEST_QUEUE_DEPTH);
        let max = self.max_message_size;
        let reader = tokio::spawn(async move {
            loop {
                let next = read_envelope(&mut read_half, max).await;
                let done = !matches!(next, Ok(Some(_)));
                if request_tx.send(next).await.is_err() || done {
                    break;
                }
            }
        });

        if let Err(e) = self.serve(&mut writer, &mut requests).await {
            info!(client = %self.client_id, error = %e, "connection ended");
        }

        reader.abort();
        let released = self.manager.release_client(&self.client_id).await;
        self.endpoints.clear();
        info!(client = %self.client_id, released = released.len(), "client disconnected");
    }

    async fn serve(
        &mut self,
        writer: &mut OwnedWriteHalf,
        requests: &mut mpsc::Receiver<SensorResult<Option<Envelope>>>,
    ) -> SensorResult<()> {
        loop {
            tokio::select! {
                biased;

                Some(event) = self.notifications.recv() => {
                    write_envelope(writer, &Envelope::notification(&event)?).await?;
                }

                next = requests.recv() => {
                    let envelope = match next {
                        Some(Ok(Some(envelope))) => envelope,
                        Some(Ok(None)) | None => return Ok(()),
                        Some(Err(e)) => {
                            warn!(client = %self.client_id, error = %e, "unreadable request");
                            let reply = ControlReply::from_result::<()>(Err(e));
                            let _ = write_envelope(writer, &Envelope::response(0, &reply)?).await;
                            return Ok(());
                        }
                    };

                    let reply = self.handle(&envelope).await;
                    while let Ok(event) = self.notifications.try_recv() {
                        write_envelope(writer, &Envelope::notification(&event)?).await?;
                    }
                    write_envelope(writer, &Envelope::response(envelope.request_id, &reply)?).await?;
                }
            }
        }
    }

    async fn handle(&mut self, envelope: &Envelope) -> ControlReply {
        if envelope.kind != MessageKind::Request {
            return ControlReply::from_result::<()>(Err(SensorError::Protocol(format!(
                "expected a request, got {:?}",
                envelope.kind
            ))));
        }
        let call: ControlCall = match envelope.body() {
            Ok(call) => call,
            Err(e) => return ControlReply::from_result::<()>(Err(e)),
        };
        debug!(client = %self.client_id, request_id = envelope.request_id, ?call, "dispatch");
        self.dispatch(call).await
    }

    async fn dispatch(&mut self, call: ControlCall) -> ControlReply {
        let id = match &call {
            ControlCall::ListSensors => {
                return ControlReply::from_result(Ok(self.manager.sensor_infos().await));
            }
            ControlCall::Open { sensor } => return ControlReply::from_result(self.open(sensor).await),
            ControlCall::Release { session_id } => {
                let result = self.manager.release_owned(*session_id, &self.client_id).await;
                if result.is_ok() {
                    self.endpoints.remove(session_id);
                }
                return ControlReply::from_result(result);
            }
            other => match other.session_id() {
                Some(id) => id,
                None => {
                    return ControlReply::from_result::<()>(Err(SensorError::Protocol(
                        "call does not name a session".into(),
                    )))
                }
            },
        };

        let channel = match self.manager.channel_for(id, &self.client_id).await {
            Ok(channel) => channel,
            Err(e) => return ControlReply::from_result::<()>(Err(e)),
        };

        match call {
            ControlCall::Start { .. } => ControlReply::from_result(channel.start(id).await),
            ControlCall::Stop { .. } => ControlReply::from_result(channel.stop(id).await),
            ControlCall::Describe { .. } => ControlReply::from_result(
                channel.state_of(id).await.map(|state| SessionInfo {
                    session_id: id,
                    sensor: sensor_info(&channel),
                    state,
                }),
            ),

            ControlCall::Interval { .. } => ControlReply::from_result(channel.interval(id).await),
            ControlCall::SetInterval { value, .. } => {
                ControlReply::from_result(channel.set_interval(id, value).await)
            }
            ControlCall::StandbyOverride { .. } => {
                ControlReply::from_result(channel.standby_override(id).await)
            }
            ControlCall::SetStandbyOverride { value, .. } => {
                ControlReply::from_result(channel.set_standby_override(id, value).await)
            }
            ControlCall::BufferInterval { .. } => {
                ControlReply::from_result(channel.buffer_interval(id).await)
            }
            ControlCall::SetBufferInterval { value, .. } => {
                ControlReply::from_result(channel.set_buffer_interval(id, value).await)
            }
            ControlCall::BufferSize { .. } => ControlReply::from_result(channel.buffer_size(id).await),
            ControlCall::SetBufferSize { value, .. } => {
                ControlReply::from_result(channel.set_buffer_size(id, value).await)
            }
            ControlCall::Downsampling { .. } => {
                ControlReply::from_result(channel.downsampling(id).await)
            }
            ControlCall::SetDownsampling { value, .. } => {
                ControlReply::from_result(channel.set_downsampling(id, value).await)
            }

            ControlCall::SetDataRangeIndex { index, .. } => {
                ControlReply::from_result(channel.set_data_range_index(id, index).await)
            }
            ControlCall::RequestDataRange { range, .. } => {
                ControlReply::from_result(channel.request_data_range(id, range).await)
            }
            ControlCall::RemoveDataRangeRequest { .. } => {
                ControlReply::from_result(channel.remove_data_range_request(id).await)
            }
            ControlCall::CurrentDataRange { .. } => {
                ControlReply::from_result(channel.current_data_range(id).await)
            }

            ControlCall::AvailableIntervals { .. } => {
                ControlReply::from_result(Ok(channel.available_intervals()))
            }
            ControlCall::AvailableDataRanges { .. } => {
                ControlReply::from_result(Ok(channel.available_data_ranges()))
            }
            ControlCall::AvailableBufferIntervals { .. } => {
                ControlReply::from_result(Ok(channel.available_buffer_intervals()))
            }
            ControlCall::AvailableBufferSizes { .. } => {
                ControlReply::from_result(Ok(channel.available_buffer_sizes()))
            }

            ControlCall::Error { .. } => ControlReply::from_result(channel.error(id).await),
            ControlCall::Effective { .. } => ControlReply::from_result(Ok(channel.effective().await)),

            ControlCall::ListSensors | ControlCall::Open { .. } | ControlCall::Release { .. } => {
                ControlReply::from_result::<()>(Err(SensorError::Protocol("unreachable call".into())))
            }
        }
    }

    async fn open(&mut self, sensor: &str) -> SensorResult<OpenReply> {
        let (session_id, buffer) = self
            .manager
            .open(sensor, &self.client_id, Some(self.notifier.clone()))
            .await?;

        let endpoint = match DataEndpoint::bind(&self.data_dir, session_id, buffer) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                warn!(session_id, error = %e, "data endpoint failed, rolling back open");
                if let Err(release_err) = self.manager.release(session_id).await {
                    warn!(session_id, error = %release_err, "rollback release failed");
                }
                return Err(e);
            }
        };

        let channel = self.manager.channel(session_id).await?;
        let reply = OpenReply {
            session_id,
            sensor: sensor_info(&channel),
            data_socket: endpoint.path().to_path_buf(),
        };
        self.endpoints.insert(session_id, endpoint);
        Ok(reply)
    }
}

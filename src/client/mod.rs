//! Client library
//!
//! [`SensorClient`] is one control connection to the daemon. It multiplexes
//! calls from any number of tasks over the socket, matching responses to
//! callers by request id, and routes `propertyChanged` notifications to the
//! [`SensorSession`] they are addressed to.
//!
//! A background reader task handles every incoming envelope in order. The
//! daemon writes a call's notifications before its response, so by the time
//! a setter returns, every notification it caused has already been published
//! to the session's subscribers.
//!
//! # Example
//!
//! ```rust,ignore
//! use sensord::client::SensorClient;
//! use sensord::sensor::frame::XyzSample;
//!
//! let client = SensorClient::connect("/run/sensord/control.sock").await?;
//! let session = client.open("accel").await?;
//! session.set_interval(50).await?;
//! session.start().await?;
//!
//! let mut reader = session.connect_data::<XyzSample>().await?;
//! for sample in reader.data_received().await? {
//!     println!("{:?}", sample);
//! }
//! ```

mod reader;
mod session;

pub use reader::DataReader;
pub use session::SensorSession;

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{SensorError, SensorResult};
use crate::network::protocol::{
    read_envelope, write_envelope, ControlCall, ControlReply, Envelope, MessageKind, OpenReply,
    SensorInfo, DEFAULT_MAX_MESSAGE_SIZE,
};
use crate::sensor::session::{Property, PropertyChanged, SessionId};

/// Capacity of each session's notification channel.
const EVENT_CAPACITY: usize = 64;

type Pending = Arc<Mutex<HashMap<u32, oneshot::Sender<ControlReply>>>>;
type Subscribers = Arc<Mutex<HashMap<SessionId, broadcast::Sender<Property>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct ClientInner {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    next_request_id: AtomicU32,
    pending: Pending,
    subscribers: Subscribers,
    closed: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Control connection to the daemon. Cheap to clone.
#[derive(Clone)]
pub struct SensorClient {
    inner: Arc<ClientInner>,
}

impl SensorClient {
    /// Connect to the daemon's control socket.
    pub async fn connect(path: impl AsRef<Path>) -> SensorResult<Self> {
        let stream = UnixStream::connect(path.as_ref()).await?;
        let (read_half, write_half) = stream.into_split();

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let subscribers: Subscribers = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let reader = tokio::spawn(read_loop(
            read_half,
            pending.clone(),
            subscribers.clone(),
            closed.clone(),
        ));

        debug!(path = %path.as_ref().display(), "connected to daemon");
        Ok(Self {
            inner: Arc::new(ClientInner {
                writer: tokio::sync::Mutex::new(write_half),
                next_request_id: AtomicU32::new(1),
                pending,
                subscribers,
                closed,
                reader,
            }),
        })
    }

    /// Whether the control connection is gone.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Issue one call and wait for its reply.
    pub async fn call<T>(&self, call: &ControlCall) -> SensorResult<T>
    where
        T: serde::de::DeserializeOwned,
    {
        if self.is_closed() {
            return Err(SensorError::ChannelClosed("control connection lost".into()));
        }

        let request_id = self.inner.next_request_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        lock(&self.inner.pending).insert(request_id, tx);

        let envelope = Envelope::request(request_id, call)?;
        let written = {
            let mut writer = self.inner.writer.lock().await;
            write_envelope(&mut *writer, &envelope).await
        };
        if let Err(e) = written {
            lock(&self.inner.pending).remove(&request_id);
            return Err(e);
        }

        match rx.await {
            Ok(reply) => reply.into_result(),
            Err(_) => Err(SensorError::ChannelClosed("control connection lost".into())),
        }
    }

    /// Sensors the daemon serves.
    pub async fn list_sensors(&self) -> SensorResult<Vec<SensorInfo>> {
        self.call(&ControlCall::ListSensors).await
    }

    /// Open a session on `sensor`.
    pub async fn open(&self, sensor: &str) -> SensorResult<SensorSession> {
        let reply: OpenReply = self
            .call(&ControlCall::Open {
                sensor: sensor.to_string(),
            })
            .await?;
        let events = self.subscribe(reply.session_id);
        Ok(SensorSession::new(self.clone(), reply, events))
    }

    fn subscribe(&self, id: SessionId) -> broadcast::Sender<Property> {
        lock(&self.inner.subscribers)
            .entry(id)
            .or_insert_with(|| broadcast::channel(EVENT_CAPACITY).0)
            .clone()
    }

    pub(crate) fn unsubscribe(&self, id: SessionId) {
        lock(&self.inner.subscribers).remove(&id);
    }
}

async fn read_loop(
    mut read_half: tokio::net::unix::OwnedReadHalf,
    pending: Pending,
    subscribers: Subscribers,
    closed: Arc<AtomicBool>,
) {
    loop {
        let envelope = match read_envelope(&mut read_half, DEFAULT_MAX_MESSAGE_SIZE).await {
            Ok(Some(envelope)) => envelope,
            Ok(None) => {
                debug!("daemon closed the control connection");
                break;
            }
            Err(e) => {
                warn!(error = %e, "control connection failed");
                break;
            }
        };

        match envelope.kind {
            MessageKind::Response => {
                let reply = match envelope.body::<ControlReply>() {
                    Ok(reply) => reply,
                    Err(e) => ControlReply::from_result::<()>(Err(e)),
                };
                if let Some(tx) = lock(&pending).remove(&envelope.request_id) {
                    let _ = tx.send(reply);
                } else {
                    debug!(request_id = envelope.request_id, "response without a caller");
                }
            }
            MessageKind::Notification => match envelope.body::<PropertyChanged>() {
                Ok(event) => {
                    if let Some(tx) = lock(&subscribers).get(&event.session_id) {
                        // No receivers is fine: nobody is listening yet.
                        let _ = tx.send(event.property);
                    }
                }
                Err(e) => warn!(error = %e, "malformed notification"),
            },
            MessageKind::Request => warn!("daemon sent a request, ignoring"),
        }
    }

    closed.store(true, Ordering::SeqCst);
    // Dropping the senders fails every in-flight call with ChannelClosed.
    lock(&pending).clear();
}

//! Per-session data socket
//!
//! Each open session gets its own Unix stream socket whose path is derived
//! from the session id, so a client can find it without asking. A pump task
//! moves samples from the session's [`SessionBuffer`] onto the socket:
//!
//! 1. accept a connection and write the ack byte
//! 2. wait until the buffer has something to say
//! 3. write device-lost, then the queued batch, then any overflow count
//! 4. sleep for the session's buffer interval, if it has one
//!
//! Only one client is served at a time. If it disconnects the pump goes
//! back to accepting; samples queued meanwhile are kept (or counted as
//! overflow) by the buffer's own policy.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::data::framing::FrameWriter;
use crate::data::session_buffer::SessionBuffer;
use crate::error::SensorResult;
use crate::sensor::session::SessionId;

/// Socket path of session `id` under `dir`.
pub fn data_socket_path(dir: &Path, id: SessionId) -> PathBuf {
    dir.join(format!("session-{id}.sock"))
}

/// Listening data socket of one session. Dropping it stops the pump and
/// removes the socket file.
pub struct DataEndpoint {
    session_id: SessionId,
    path: PathBuf,
    task: JoinHandle<()>,
}

impl DataEndpoint {
    /// Bind `<dir>/session-<id>.sock` and start delivering `buffer`.
    pub fn bind(dir: &Path, session_id: SessionId, buffer: Arc<SessionBuffer>) -> SensorResult<Self> {
        std::fs::create_dir_all(dir)?;
        let path = data_socket_path(dir, session_id);
        if path.exists() {
            // Left over from a previous daemon run.
            std::fs::remove_file(&path)?;
        }
        let listener = UnixListener::bind(&path)?;
        debug!(session_id, path = %path.display(), "data endpoint bound");

        let task = tokio::spawn(serve(listener, buffer, session_id));
        Ok(Self {
            session_id,
            path,
            task,
        })
    }

    /// Session served by this endpoint.
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Socket path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DataEndpoint {
    fn drop(&mut self) {
        self.task.abort();
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!(session_id = self.session_id, error = %e, "data socket already gone");
        }
    }
}

async fn serve(listener: UnixListener, buffer: Arc<SessionBuffer>, session_id: SessionId) {
    loop {
        let stream = match listener.accept().await {
            Ok((stream, _)) => stream,
            Err(e) => {
                warn!(session_id, error = %e, "data socket accept failed");
                return;
            }
        };
        info!(session_id, "data client connected");

        match pump(stream, &buffer).await {
            Ok(()) => {
                debug!(session_id, "session closed, data pump finished");
                return;
            }
            Err(e) => info!(session_id, error = %e, "data client disconnected"),
        }
    }
}

/// Stream the buffer to one client. Returns `Ok` once the buffer is closed.
async fn pump(stream: UnixStream, buffer: &SessionBuffer) -> std::io::Result<()> {
    let mut writer = FrameWriter::new(stream, buffer.frame_size());
    writer.write_ack().await?;

    loop {
        let drained = buffer.drain();
        if drained.is_empty() {
            buffer.ready().await;
            continue;
        }

        if drained.device_lost {
            writer.write_device_lost().await?;
        }
        writer.write_batch(&drained.frames).await?;
        if let Some(rejected) = drained.overflow {
            writer.write_overflow(rejected).await?;
        }
        if drained.closed {
            return Ok(());
        }

        let pacing = buffer.policy().interval;
        if !pacing.is_zero() {
            tokio::time::sleep(pacing).await;
        }
    }
}

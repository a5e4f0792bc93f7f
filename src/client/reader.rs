//! Typed reader for a session's data channel

use std::marker::PhantomData;
use std::time::Duration;
use tokio::io::AsyncRead;

use crate::data::framing::FrameReader;
use crate::error::SensorResult;
use crate::sensor::frame::Frame;

/// Decodes records of type `T` and caches the newest one.
///
/// All methods take `&mut self`, so a second `data_received` can never
/// start while one is still decoding.
pub struct DataReader<T, R> {
    reader: FrameReader<R>,
    latest: Option<T>,
    received: u64,
    _frame: PhantomData<T>,
}

impl<T: Frame, R: AsyncRead + Unpin> DataReader<T, R> {
    /// Reader over a connected data stream.
    pub fn new(stream: R) -> Self {
        Self {
            reader: FrameReader::new(stream, T::SIZE),
            latest: None,
            received: 0,
            _frame: PhantomData,
        }
    }

    /// Consume the daemon's ack byte.
    pub async fn handshake(&mut self) -> SensorResult<()> {
        self.reader.read_ack().await
    }

    /// Wait until at least one record is available, then decode every
    /// complete record buffered.
    ///
    /// Overflow and device loss are reported as errors, once each.
    pub async fn data_received(&mut self) -> SensorResult<Vec<T>> {
        let mut out = Vec::new();
        self.reader.read_available(&mut out).await?;
        self.track(&out);
        Ok(out)
    }

    /// Like [`data_received`](Self::data_received) but returns an empty
    /// batch instead of waiting.
    pub async fn try_data_received(&mut self) -> SensorResult<Vec<T>> {
        let mut out = Vec::new();
        self.reader.try_read_available(&mut out).await?;
        self.track(&out);
        Ok(out)
    }

    /// Like [`data_received`](Self::data_received) but gives up after
    /// `timeout`, returning `None`.
    pub async fn data_received_timeout(&mut self, timeout: Duration) -> SensorResult<Option<Vec<T>>> {
        let mut out = Vec::new();
        match tokio::time::timeout(timeout, self.reader.read_available(&mut out)).await {
            Ok(result) => {
                result?;
                self.track(&out);
                Ok(Some(out))
            }
            Err(_) => Ok(None),
        }
    }

    /// Append exactly `count` records to `out`, leaving it untouched on
    /// failure.
    pub async fn read_frames(&mut self, out: &mut Vec<T>, count: usize) -> SensorResult<()> {
        let start = out.len();
        self.reader.read_frames(out, count).await?;
        let fresh = out[start..].to_vec();
        self.track(&fresh);
        Ok(())
    }

    /// Fill `out` with raw records. `out.len()` must be a multiple of the
    /// record size.
    pub async fn read_raw(&mut self, out: &mut [u8]) -> SensorResult<()> {
        self.reader.read_raw(out).await?;
        if let Some(last) = out.chunks_exact(T::SIZE).last() {
            self.latest = Some(T::decode(last));
        }
        self.received += (out.len() / T::SIZE) as u64;
        Ok(())
    }

    /// Newest record decoded so far.
    pub fn latest(&self) -> Option<&T> {
        self.latest.as_ref()
    }

    /// Records decoded since the reader was created.
    pub fn received(&self) -> u64 {
        self.received
    }

    fn track(&mut self, batch: &[T]) {
        if let Some(last) = batch.last() {
            self.latest = Some(last.clone());
        }
        self.received += batch.len() as u64;
    }
}

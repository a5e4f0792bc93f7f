//! Data channel framing
//!
//! The data channel carries batches of fixed-size records:
//!
//! ```text
//! [u32 count LE][count × frame_size bytes]
//! ```
//!
//! `frame_size` is fixed by the sensor type and known to both ends before the
//! stream opens, so individual records carry no length. Two count values are
//! reserved as in-band signals:
//!
//! | count | meaning | trailing payload |
//! |---|---|---|
//! | `0xFFFF_FFFF` | samples were rejected (overflow) | `u32` rejected count |
//! | `0xFFFF_FFFE` | the physical device was lost | none |
//!
//! The daemon writes a single [`ACK_BYTE`] right after accepting a
//! connection so the client knows the endpoint is live.
//!
//! [`FrameReader`] buffers raw bytes internally and only hands out complete
//! records. Every read primitive either succeeds completely or leaves the
//! caller's buffer untouched, and reads are cancel-safe, so they can be
//! wrapped in a timeout to poll several sessions from one task.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{SensorError, SensorResult};
use crate::sensor::frame::Frame;

/// Sent by the daemon once per accepted data connection.
pub const ACK_BYTE: u8 = 0x0A;

/// Batch header announcing rejected samples.
pub const OVERFLOW_MARKER: u32 = 0xFFFF_FFFF;

/// Batch header announcing device loss.
pub const DEVICE_LOST_MARKER: u32 = 0xFFFF_FFFE;

/// Largest record count accepted in a single batch.
pub const MAX_BATCH: u32 = 1 << 20;

const HEADER_SIZE: usize = 4;

// =============================================================================
// Writer
// =============================================================================

/// Writes batches of records to a byte stream.
pub struct FrameWriter<W> {
    inner: W,
    frame_size: usize,
    scratch: BytesMut,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Writer for records of `frame_size` bytes.
    pub fn new(inner: W, frame_size: usize) -> Self {
        Self {
            inner,
            frame_size,
            scratch: BytesMut::new(),
        }
    }

    /// Write the connection ack byte.
    pub async fn write_ack(&mut self) -> std::io::Result<()> {
        self.inner.write_all(&[ACK_BYTE]).await?;
        self.inner.flush().await
    }

    /// Write one batch. Every frame must be exactly `frame_size` bytes.
    pub async fn write_batch(&mut self, frames: &[Bytes]) -> std::io::Result<()> {
        if frames.is_empty() {
            return Ok(());
        }
        for chunk in frames.chunks(MAX_BATCH as usize) {
            self.scratch.clear();
            self.scratch.reserve(HEADER_SIZE + chunk.len() * self.frame_size);
            self.scratch.put_u32_le(chunk.len() as u32);
            for frame in chunk {
                if frame.len() != self.frame_size {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        format!(
                            "frame of {} bytes on a {}-byte channel",
                            frame.len(),
                            self.frame_size
                        ),
                    ));
                }
                self.scratch.put_slice(frame);
            }
            self.inner.write_all(&self.scratch).await?;
        }
        self.inner.flush().await
    }

    /// Write an overflow marker with the rejected count.
    pub async fn write_overflow(&mut self, rejected: u32) -> std::io::Result<()> {
        let mut header = [0u8; 8];
        header[0..4].copy_from_slice(&OVERFLOW_MARKER.to_le_bytes());
        header[4..8].copy_from_slice(&rejected.to_le_bytes());
        self.inner.write_all(&header).await?;
        self.inner.flush().await
    }

    /// Write a device-lost marker.
    pub async fn write_device_lost(&mut self) -> std::io::Result<()> {
        self.inner
            .write_all(&DEVICE_LOST_MARKER.to_le_bytes())
            .await?;
        self.inner.flush().await
    }

    /// Underlying stream.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

// =============================================================================
// Reader
// =============================================================================

#[derive(Debug)]
enum Item {
    Frame(Bytes),
    Overflow(u32),
    DeviceLost,
}

/// Reads records from a byte stream, never exposing partial records.
pub struct FrameReader<R> {
    inner: R,
    frame_size: usize,
    raw: BytesMut,
    items: VecDeque<Item>,
    frames_ready: usize,
    eof: bool,
    poisoned: Option<String>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Reader for records of `frame_size` bytes.
    pub fn new(inner: R, frame_size: usize) -> Self {
        Self {
            inner,
            frame_size,
            raw: BytesMut::with_capacity(4096),
            items: VecDeque::new(),
            frames_ready: 0,
            eof: false,
            poisoned: None,
        }
    }

    /// Record size in bytes.
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Complete records buffered and ready to decode.
    pub fn available(&self) -> usize {
        self.frames_ready
    }

    /// Consume the handshake byte written by the daemon. Must be called
    /// before any record is read.
    pub async fn read_ack(&mut self) -> SensorResult<()> {
        let byte = if self.raw.is_empty() {
            self.inner.read_u8().await?
        } else {
            self.raw.get_u8()
        };
        if byte != ACK_BYTE {
            return Err(self.poison("bad handshake byte".into()));
        }
        Ok(())
    }

    /// Read `out.len()` raw bytes, which must be a whole number of records.
    pub async fn read_raw(&mut self, out: &mut [u8]) -> SensorResult<()> {
        if out.is_empty() || out.len() % self.frame_size != 0 {
            return Err(SensorError::InvalidParameter(format!(
                "read of {} bytes is not a multiple of the {}-byte record size",
                out.len(),
                self.frame_size
            )));
        }
        let wanted = out.len() / self.frame_size;
        self.wait_for(wanted).await?;
        for chunk in out.chunks_mut(self.frame_size) {
            if let Some(frame) = self.pop_frame() {
                chunk.copy_from_slice(&frame);
            }
        }
        Ok(())
    }

    /// Append exactly `count` decoded records to `out`.
    ///
    /// On failure `out` is left exactly as it was.
    pub async fn read_frames<T: Frame>(&mut self, out: &mut Vec<T>, count: usize) -> SensorResult<()> {
        self.check_size::<T>()?;
        self.wait_for(count).await?;
        out.reserve(count);
        for _ in 0..count {
            if let Some(frame) = self.pop_frame() {
                out.push(T::decode(&frame));
            }
        }
        Ok(())
    }

    /// Wait for at least one record and append every record buffered.
    pub async fn read_available<T: Frame>(&mut self, out: &mut Vec<T>) -> SensorResult<usize> {
        self.check_size::<T>()?;
        self.wait_for(1).await?;
        let count = self.frames_ready_before_signal();
        out.reserve(count);
        for _ in 0..count {
            if let Some(frame) = self.pop_frame() {
                out.push(T::decode(&frame));
            }
        }
        Ok(count)
    }

    /// Like [`read_frames`](Self::read_frames) but gives up after `timeout`.
    ///
    /// Returns `Ok(false)` on timeout; `out` is untouched and no stream data
    /// is lost.
    pub async fn read_frames_timeout<T: Frame>(
        &mut self,
        out: &mut Vec<T>,
        count: usize,
        timeout: Duration,
    ) -> SensorResult<bool> {
        self.check_size::<T>()?;
        match tokio::time::timeout(timeout, self.wait_for(count)).await {
            Ok(result) => result?,
            Err(_) => return Ok(false),
        }
        self.read_frames(out, count).await?;
        Ok(true)
    }

    /// Non-blocking variant of [`read_available`](Self::read_available).
    ///
    /// Returns `Ok(0)` when nothing is ready.
    pub async fn try_read_available<T: Frame>(&mut self, out: &mut Vec<T>) -> SensorResult<usize> {
        self.check_size::<T>()?;
        let open = !self.eof && self.poisoned.is_none();
        if self.items.is_empty() && open {
            if let Ok(result) = tokio::time::timeout(Duration::ZERO, self.fill()).await {
                result?;
            }
        }
        if self.items.is_empty() && !self.eof && self.poisoned.is_none() {
            return Ok(0);
        }
        self.read_available(out).await
    }

    fn check_size<T: Frame>(&self) -> SensorResult<()> {
        if T::SIZE != self.frame_size {
            return Err(SensorError::InvalidParameter(format!(
                "record type of {} bytes on a {}-byte channel",
                T::SIZE,
                self.frame_size
            )));
        }
        Ok(())
    }

    /// Block until `count` records precede any pending signal.
    ///
    /// A pending signal within reach is reported (and consumed) instead, so
    /// it is raised exactly once and the records ahead of it stay readable.
    async fn wait_for(&mut self, count: usize) -> SensorResult<()> {
        loop {
            if let Some(err) = self.take_signal_within(count) {
                return Err(err);
            }
            if self.frames_ready_before_signal() >= count {
                return Ok(());
            }
            if let Some(reason) = &self.poisoned {
                return Err(SensorError::ChannelClosed(reason.clone()));
            }
            if self.eof {
                return Err(SensorError::ChannelClosed(format!(
                    "data channel closed with {} of {} records available",
                    self.frames_ready, count
                )));
            }
            self.fill().await?;
        }
    }

    fn frames_ready_before_signal(&self) -> usize {
        self.items
            .iter()
            .take_while(|item| matches!(item, Item::Frame(_)))
            .count()
    }

    fn take_signal_within(&mut self, count: usize) -> Option<SensorError> {
        let position = self
            .items
            .iter()
            .take(count.max(1) + 1)
            .position(|item| !matches!(item, Item::Frame(_)))?;
        if position >= count.max(1) && self.frames_ready_before_signal() >= count {
            return None;
        }
        match self.items.remove(position)? {
            Item::Overflow(rejected) => Some(SensorError::Overflow { dropped: rejected }),
            Item::DeviceLost => Some(SensorError::ChannelClosed("sensor device lost".into())),
            Item::Frame(_) => None,
        }
    }

    fn pop_frame(&mut self) -> Option<Bytes> {
        match self.items.front() {
            Some(Item::Frame(_)) => {}
            _ => return None,
        }
        match self.items.pop_front() {
            Some(Item::Frame(frame)) => {
                self.frames_ready -= 1;
                Some(frame)
            }
            _ => None,
        }
    }

    /// One cancel-safe read from the stream, then parse complete batches.
    async fn fill(&mut self) -> SensorResult<()> {
        if let Some(reason) = &self.poisoned {
            return Err(SensorError::ChannelClosed(reason.clone()));
        }
        let n = self.inner.read_buf(&mut self.raw).await?;
        if n == 0 {
            self.eof = true;
            if !self.raw.is_empty() {
                let leftover = self.raw.len();
                return Err(self.poison(format!(
                    "data channel closed inside a batch ({} bytes pending)",
                    leftover
                )));
            }
            return Ok(());
        }
        self.parse()
    }

    fn parse(&mut self) -> SensorResult<()> {
        while self.raw.len() >= HEADER_SIZE {
            let count = u32::from_le_bytes([self.raw[0], self.raw[1], self.raw[2], self.raw[3]]);
            match count {
                OVERFLOW_MARKER => {
                    if self.raw.len() < HEADER_SIZE + 4 {
                        break;
                    }
                    self.raw.advance(HEADER_SIZE);
                    let rejected = self.raw.get_u32_le();
                    self.items.push_back(Item::Overflow(rejected));
                }
                DEVICE_LOST_MARKER => {
                    self.raw.advance(HEADER_SIZE);
                    self.items.push_back(Item::DeviceLost);
                }
                n if n > MAX_BATCH => {
                    return Err(self.poison(format!("malformed batch header ({} records)", n)));
                }
                n => {
                    let body = n as usize * self.frame_size;
                    if self.raw.len() < HEADER_SIZE + body {
                        break;
                    }
                    self.raw.advance(HEADER_SIZE);
                    let mut batch = self.raw.split_to(body).freeze();
                    for _ in 0..n {
                        self.items
                            .push_back(Item::Frame(batch.split_to(self.frame_size)));
                    }
                    self.frames_ready += n as usize;
                }
            }
        }
        Ok(())
    }

    fn poison(&mut self, reason: String) -> SensorError {
        tracing::warn!(reason = %reason, "data channel poisoned");
        self.poisoned = Some(reason.clone());
        SensorError::Protocol(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::frame::{TimedUnsigned, XyzSample};
    use tokio::io::duplex;

    fn sample(ts: u64, value: u32) -> Bytes {
        Bytes::from(TimedUnsigned { timestamp_us: ts, value }.to_bytes())
    }

    #[tokio::test]
    async fn batches_round_trip_through_duplex() {
        let (client, server) = duplex(1024);
        let mut writer = FrameWriter::new(server, TimedUnsigned::SIZE);
        let mut reader = FrameReader::new(client, TimedUnsigned::SIZE);

        writer.write_ack().await.unwrap();
        writer
            .write_batch(&[sample(1, 10), sample(2, 20), sample(3, 30)])
            .await
            .unwrap();

        reader.read_ack().await.unwrap();
        let mut out: Vec<TimedUnsigned> = Vec::new();
        reader.read_frames(&mut out, 2).await.unwrap();
        assert_eq!(out.iter().map(|s| s.value).collect::<Vec<_>>(), vec![10, 20]);
        assert_eq!(reader.available(), 1);

        let mut raw = [0u8; TimedUnsigned::SIZE];
        reader.read_raw(&mut raw).await.unwrap();
        assert_eq!(TimedUnsigned::decode(&raw).value, 30);
    }

    #[tokio::test]
    async fn short_stream_leaves_output_untouched() {
        let mut data = Vec::new();
        data.extend_from_slice(&2u32.to_le_bytes());
        data.extend_from_slice(&sample(1, 1));
        // Second record truncated.
        data.extend_from_slice(&sample(2, 2)[..5]);

        let mock = tokio_test::io::Builder::new().read(&data).build();
        let mut reader = FrameReader::new(mock, TimedUnsigned::SIZE);

        let mut out = vec![TimedUnsigned { timestamp_us: 99, value: 99 }];
        let err = reader.read_frames(&mut out, 2).await.unwrap_err();
        assert!(matches!(err, SensorError::Protocol(_)));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].value, 99);

        // Reader stays closed afterwards.
        let err = reader.read_frames(&mut out, 1).await.unwrap_err();
        assert!(matches!(err, SensorError::ChannelClosed(_)));
        assert_eq!(out.len(), 1);
    }

    #[tokio::test]
    async fn raw_read_is_atomic_on_disconnect() {
        let mut data = Vec::new();
        data.extend_from_slice(&1u32.to_le_bytes());
        data.extend_from_slice(&sample(1, 7));
        let mock = tokio_test::io::Builder::new().read(&data).build();
        let mut reader = FrameReader::new(mock, TimedUnsigned::SIZE);

        let mut buf = [0xAAu8; TimedUnsigned::SIZE * 2];
        let err = reader.read_raw(&mut buf).await.unwrap_err();
        assert!(matches!(err, SensorError::ChannelClosed(_)));
        assert!(buf.iter().all(|b| *b == 0xAA));
    }

    #[tokio::test]
    async fn overflow_marker_is_reported_once_after_nothing_is_lost() {
        let (client, server) = duplex(1024);
        let mut writer = FrameWriter::new(server, TimedUnsigned::SIZE);
        let mut reader = FrameReader::new(client, TimedUnsigned::SIZE);

        writer.write_batch(&[sample(1, 1), sample(2, 2)]).await.unwrap();
        writer.write_overflow(5).await.unwrap();
        writer.write_batch(&[sample(3, 3)]).await.unwrap();

        let mut out: Vec<TimedUnsigned> = Vec::new();
        // Wait until everything is parsed.
        while reader.items.len() < 4 {
            reader.fill().await.unwrap();
        }
        let err = reader.read_frames(&mut out, 3).await.unwrap_err();
        assert!(matches!(err, SensorError::Overflow { dropped: 5 }));
        assert!(out.is_empty());

        reader.read_frames(&mut out, 3).await.unwrap();
        assert_eq!(out.iter().map(|s| s.value).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn records_ahead_of_a_signal_are_readable_first() {
        let (client, server) = duplex(1024);
        let mut writer = FrameWriter::new(server, TimedUnsigned::SIZE);
        let mut reader = FrameReader::new(client, TimedUnsigned::SIZE);

        writer.write_batch(&[sample(1, 1)]).await.unwrap();
        writer.write_device_lost().await.unwrap();

        let mut out: Vec<TimedUnsigned> = Vec::new();
        reader.read_frames(&mut out, 1).await.unwrap();
        assert_eq!(out.len(), 1);
        let err = reader.read_available(&mut out).await.unwrap_err();
        assert!(matches!(err, SensorError::ChannelClosed(_)));
    }

    #[tokio::test]
    async fn timeout_returns_false_without_losing_data() {
        let (client, server) = duplex(1024);
        let mut writer = FrameWriter::new(server, TimedUnsigned::SIZE);
        let mut reader = FrameReader::new(client, TimedUnsigned::SIZE);

        let mut out: Vec<TimedUnsigned> = Vec::new();
        let got = reader
            .read_frames_timeout(&mut out, 1, Duration::from_millis(20))
            .await
            .unwrap();
        assert!(!got);
        assert_eq!(reader.try_read_available(&mut out).await.unwrap(), 0);

        writer.write_batch(&[sample(5, 50)]).await.unwrap();
        let got = reader
            .read_frames_timeout(&mut out, 1, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(got);
        assert_eq!(out[0].value, 50);
    }

    #[tokio::test]
    async fn wrong_record_type_is_rejected() {
        let (client, _server) = duplex(64);
        let mut reader = FrameReader::new(client, TimedUnsigned::SIZE);
        let mut out: Vec<XyzSample> = Vec::new();
        let err = reader.read_frames(&mut out, 1).await.unwrap_err();
        assert!(matches!(err, SensorError::InvalidParameter(_)));
    }

    #[tokio::test]
    async fn oversized_batch_header_poisons_reader() {
        let mock = tokio_test::io::Builder::new()
            .read(&(MAX_BATCH + 1).to_le_bytes())
            .build();
        let mut reader = FrameReader::new(mock, TimedUnsigned::SIZE);
        let mut out: Vec<TimedUnsigned> = Vec::new();
        assert!(matches!(
            reader.read_frames(&mut out, 1).await,
            Err(SensorError::Protocol(_))
        ));
    }
}

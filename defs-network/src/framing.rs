//! Length-prefixed message framing with deadlines
//!
//! Every message is `u32_be(len) | body`. Oversized frames are rejected on
//! both ends with `MessageTooLarge`; nothing is ever truncated.
//!
//! Reads use an adaptive deadline: the first wait is `read_timeout`, each
//! retry doubles it, and only transient failures (`StreamTimeout`,
//! `StreamReset`) are retried. A clean close by the peer ends the read at
//! once. Writes use one absolute deadline.

use crate::host::BoxStream;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use defs_core::error::{DefsError, Result};
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tokio_util::codec::{Decoder, Encoder, Framed};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Cap for control messages (handshake, upload replies)
pub const MAX_CONTROL_MESSAGE: usize = 1024 * 1024;

/// Cap for a serialized shard object
pub const MAX_SHARD_MESSAGE: usize = 32 * 1024 * 1024;

pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(33);
pub const DEFAULT_READ_ATTEMPTS: u32 = 3;
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(30);

const LEN_PREFIX: usize = 4;

/// Stream deadlines
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamPolicy {
    pub read_timeout: Duration,
    pub read_attempts: u32,
    pub write_timeout: Duration,
}

impl Default for StreamPolicy {
    fn default() -> Self {
        Self {
            read_timeout: DEFAULT_READ_TIMEOUT,
            read_attempts: DEFAULT_READ_ATTEMPTS,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

impl StreamPolicy {
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_read_attempts(mut self, attempts: u32) -> Self {
        self.read_attempts = attempts;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Deadline for read attempt `attempt` (0-indexed)
    pub fn read_deadline(&self, attempt: u32) -> Duration {
        self.read_timeout
            .saturating_mul(2u32.saturating_pow(attempt))
    }
}

/// `u32_be` length-prefixed codec with a size cap
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_len: usize,
}

impl FrameCodec {
    pub fn new(max_len: usize) -> Self {
        Self { max_len }
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = DefsError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>> {
        if src.len() < LEN_PREFIX {
            return Ok(None);
        }
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > self.max_len {
            return Err(DefsError::MessageTooLarge {
                size: len,
                max: self.max_len,
            });
        }
        if src.len() < LEN_PREFIX + len {
            src.reserve(LEN_PREFIX + len - src.len());
            return Ok(None);
        }
        src.advance(LEN_PREFIX);
        Ok(Some(src.split_to(len)))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = DefsError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<()> {
        if item.len() > self.max_len {
            return Err(DefsError::MessageTooLarge {
                size: item.len(),
                max: self.max_len,
            });
        }
        dst.reserve(LEN_PREFIX + item.len());
        dst.put_u32(item.len() as u32);
        dst.extend_from_slice(&item);
        Ok(())
    }
}

fn map_stream_error(err: DefsError) -> DefsError {
    match err {
        DefsError::Io(e) => DefsError::from_stream_io(e),
        other => other,
    }
}

/// A protocol stream speaking framed messages
pub struct FramedStream {
    framed: Framed<BoxStream, FrameCodec>,
    policy: StreamPolicy,
    cancel: Option<CancellationToken>,
}

impl FramedStream {
    pub fn new(io: BoxStream, max_len: usize, policy: StreamPolicy) -> Self {
        Self {
            framed: Framed::new(io, FrameCodec::new(max_len)),
            policy,
            cancel: None,
        }
    }

    /// Abort pending reads with `Cancelled` once `token` fires
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn policy(&self) -> &StreamPolicy {
        &self.policy
    }

    /// Read one frame, retrying transient failures with doubling deadlines
    pub async fn read_frame(&mut self) -> Result<Bytes> {
        let attempts = self.policy.read_attempts.max(1);
        let mut last = DefsError::StreamTimeout;
        for attempt in 0..attempts {
            match self.read_once(self.policy.read_deadline(attempt)).await {
                Ok(Some(frame)) => return Ok(frame),
                // A closed stream stays closed
                Ok(None) => {
                    return Err(DefsError::StreamReset("stream closed by peer".to_string()))
                }
                Err(e) if e.is_transient() => {
                    debug!(attempt = attempt + 1, error = %e, "Transient read failure");
                    last = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }

    /// `Ok(None)` once the peer has closed its write half
    async fn read_once(&mut self, deadline: Duration) -> Result<Option<Bytes>> {
        let cancel = self.cancel.clone();
        let next = tokio::time::timeout(deadline, self.framed.next());
        let result = match cancel {
            Some(token) => tokio::select! {
                _ = token.cancelled() => return Err(DefsError::Cancelled),
                r = next => r,
            },
            None => next.await,
        };
        match result {
            Err(_) => Err(DefsError::StreamTimeout),
            Ok(None) => Ok(None),
            Ok(Some(Ok(frame))) => Ok(Some(frame.freeze())),
            Ok(Some(Err(e))) => Err(map_stream_error(e)),
        }
    }

    /// Write one frame within the write deadline
    pub async fn write_frame(&mut self, frame: Bytes) -> Result<()> {
        match tokio::time::timeout(self.policy.write_timeout, self.framed.send(frame)).await {
            Err(_) => Err(DefsError::StreamTimeout),
            Ok(result) => result.map_err(map_stream_error),
        }
    }

    pub async fn read_json<T: DeserializeOwned>(&mut self) -> Result<T> {
        let frame = self.read_frame().await?;
        Ok(serde_json::from_slice(&frame)?)
    }

    pub async fn write_json<T: Serialize>(&mut self, value: &T) -> Result<()> {
        let body = serde_json::to_vec(value)?;
        self.write_frame(Bytes::from(body)).await
    }

    /// Flush and shut down the write half
    pub async fn close(&mut self) -> Result<()> {
        match tokio::time::timeout(self.policy.write_timeout, self.framed.close()).await {
            Err(_) => Err(DefsError::StreamTimeout),
            Ok(result) => result.map_err(map_stream_error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn pair(max_len: usize, policy: StreamPolicy) -> (FramedStream, FramedStream) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (
            FramedStream::new(Box::new(a), max_len, policy.clone()),
            FramedStream::new(Box::new(b), max_len, policy),
        )
    }

    #[test]
    fn test_read_deadline_doubles() {
        let policy = StreamPolicy::default();
        assert_eq!(policy.read_deadline(0), Duration::from_secs(33));
        assert_eq!(policy.read_deadline(1), Duration::from_secs(66));
        assert_eq!(policy.read_deadline(2), Duration::from_secs(132));
    }

    #[test]
    fn test_codec_partial_frames() {
        let mut codec = FrameCodec::new(16);
        let mut buf = BytesMut::new();
        codec.encode(Bytes::from_static(b"hello"), &mut buf).unwrap();
        assert_eq!(&buf[..4], &[0, 0, 0, 5]);

        let mut partial = buf.split_to(6);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.unsplit(buf);
        assert_eq!(&codec.decode(&mut partial).unwrap().unwrap()[..], b"hello");
    }

    #[test]
    fn test_codec_rejects_oversized() {
        let mut codec = FrameCodec::new(4);
        let mut buf = BytesMut::new();
        assert!(matches!(
            codec.encode(Bytes::from_static(b"hello"), &mut buf),
            Err(DefsError::MessageTooLarge { size: 5, max: 4 })
        ));

        let mut incoming = BytesMut::from(&[0u8, 0, 0, 9][..]);
        assert!(matches!(
            codec.decode(&mut incoming),
            Err(DefsError::MessageTooLarge { size: 9, max: 4 })
        ));
    }

    #[tokio::test]
    async fn test_frames_roundtrip_over_duplex() {
        let (mut a, mut b) = pair(1024, StreamPolicy::default());
        a.write_frame(Bytes::from_static(b"one")).await.unwrap();
        a.write_json(&vec![1u32, 2, 3]).await.unwrap();

        assert_eq!(&b.read_frame().await.unwrap()[..], b"one");
        let values: Vec<u32> = b.read_json().await.unwrap();
        assert_eq!(values, vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_times_out_after_all_attempts() {
        let policy = StreamPolicy::default().with_read_timeout(Duration::from_secs(1));
        let (_a, mut b) = pair(1024, policy);

        let start = tokio::time::Instant::now();
        let err = b.read_frame().await.unwrap_err();
        assert!(matches!(err, DefsError::StreamTimeout));
        // 1 + 2 + 4 seconds
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(7));
        assert!(elapsed < Duration::from_secs(8));
    }

    #[tokio::test]
    async fn test_oversized_frame_is_not_retried() {
        let (a, b) = tokio::io::duplex(1024);
        let mut reader = FramedStream::new(Box::new(b), 8, StreamPolicy::default());
        let mut raw = a;
        raw.write_all(&[0, 0, 1, 0]).await.unwrap();

        assert!(matches!(
            reader.read_frame().await,
            Err(DefsError::MessageTooLarge { size: 256, max: 8 })
        ));
    }

    #[tokio::test]
    async fn test_peer_close_is_reset() {
        let policy = StreamPolicy::default().with_read_attempts(1);
        let (a, mut b) = pair(1024, policy);
        drop(a);
        assert!(matches!(b.read_frame().await, Err(DefsError::StreamReset(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_close_is_not_retried() {
        let policy = StreamPolicy::default()
            .with_read_timeout(Duration::from_secs(5))
            .with_read_attempts(3);
        let (mut a, mut b) = pair(1024, policy);
        a.write_frame(Bytes::from_static(b"last")).await.unwrap();
        a.close().await.unwrap();
        drop(a);

        assert_eq!(&b.read_frame().await.unwrap()[..], b"last");
        let start = tokio::time::Instant::now();
        match b.read_frame().await {
            Err(DefsError::StreamReset(reason)) => assert!(reason.contains("closed")),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_cancelled_read() {
        let token = CancellationToken::new();
        let (_a, b) = pair(1024, StreamPolicy::default());
        let mut b = b.with_cancel(token.clone());
        token.cancel();
        assert!(matches!(b.read_frame().await, Err(DefsError::Cancelled)));
    }
}

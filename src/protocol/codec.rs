//! Newline-delimited JSON framing over any async byte stream.

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::{FloodgateError, Result};

/// Largest frame accepted from a peer, in bytes.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024;

/// Reads one frame per line.
///
/// At most `max_frame_bytes + 1` bytes of a frame are ever buffered; a longer
/// line is rejected as soon as it crosses the limit and its remainder is
/// skipped without being stored. Partial frames live in the reader, so
/// `next_frame` can sit in a `select!` next to timers and shutdown signals.
pub struct FrameReader<R> {
    inner: BufReader<R>,
    buf: Vec<u8>,
    max_frame_bytes: usize,
    discarding: bool,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, max_frame_bytes: usize) -> Self {
        Self {
            inner: BufReader::new(inner),
            buf: Vec::new(),
            max_frame_bytes,
            discarding: false,
        }
    }

    /// Next non-empty frame, or `None` once the peer closed the stream.
    pub async fn next_frame(&mut self) -> Result<Option<String>> {
        loop {
            if self.discarding && !self.skip_rest_of_line().await? {
                return Ok(None);
            }

            let room = (self.max_frame_bytes + 1).saturating_sub(self.buf.len()) as u64;
            let read = (&mut self.inner)
                .take(room)
                .read_until(b'\n', &mut self.buf)
                .await?;

            if self.buf.last() != Some(&b'\n') {
                if self.buf.len() > self.max_frame_bytes {
                    self.buf.clear();
                    self.discarding = true;
                    return Err(FloodgateError::Protocol(format!(
                        "frame exceeds the {} byte limit",
                        self.max_frame_bytes
                    )));
                }
                if read == 0 && self.buf.is_empty() {
                    return Ok(None);
                }
                // The peer closed mid-line; hand back what arrived.
            }

            let bytes = std::mem::take(&mut self.buf);
            let line = String::from_utf8(bytes)
                .map_err(|_| FloodgateError::Protocol("frame is not valid UTF-8".to_string()))?;
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                return Ok(Some(trimmed.to_string()));
            }
        }
    }

    /// Drop input up to and including the next newline. Returns `false` if
    /// the stream ended first.
    async fn skip_rest_of_line(&mut self) -> Result<bool> {
        loop {
            let (used, found) = {
                let chunk = self.inner.fill_buf().await?;
                if chunk.is_empty() {
                    return Ok(false);
                }
                match chunk.iter().position(|b| *b == b'\n') {
                    Some(at) => (at + 1, true),
                    None => (chunk.len(), false),
                }
            };
            self.inner.consume(used);
            if found {
                self.discarding = false;
                return Ok(true);
            }
        }
    }
}

/// Writes one frame per line and flushes after each.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn send<T: Serialize>(&mut self, frame: &T) -> Result<()> {
        let mut bytes = serde_json::to_vec(frame)?;
        bytes.push(b'\n');
        self.inner.write_all(&bytes).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Flush and close the write side.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{decode_server_frame, ServerFrame};
    use tokio::io::{duplex, split};

    #[tokio::test]
    async fn test_frames_cross_a_stream() {
        let (a, b) = duplex(1024);
        let (_, write) = split(a);
        let (read, _) = split(b);
        let mut writer = FrameWriter::new(write);
        let mut reader = FrameReader::new(read, DEFAULT_MAX_FRAME_BYTES);

        writer.send(&ServerFrame::Welcome).await.unwrap();
        writer.send(&ServerFrame::Pong { nonce: 3 }).await.unwrap();
        writer.shutdown().await.unwrap();

        let first = reader.next_frame().await.unwrap().unwrap();
        assert_eq!(decode_server_frame(&first).unwrap(), ServerFrame::Welcome);
        let second = reader.next_frame().await.unwrap().unwrap();
        assert_eq!(
            decode_server_frame(&second).unwrap(),
            ServerFrame::Pong { nonce: 3 }
        );
        assert!(reader.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_blank_lines_skipped() {
        let (mut a, b) = duplex(1024);
        a.write_all(b"\n\n{\"type\":\"welcome\"}\n").await.unwrap();
        drop(a);

        let mut reader = FrameReader::new(b, DEFAULT_MAX_FRAME_BYTES);
        assert_eq!(
            reader.next_frame().await.unwrap().as_deref(),
            Some("{\"type\":\"welcome\"}")
        );
        assert!(reader.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, b) = duplex(4096);
        let big = format!("{}\n", "x".repeat(200));
        a.write_all(big.as_bytes()).await.unwrap();

        let mut reader = FrameReader::new(b, 100);
        assert!(matches!(
            reader.next_frame().await,
            Err(FloodgateError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_before_it_is_fully_sent() {
        // A tiny pipe keeps the writer blocked until the reader drains it.
        let (mut a, b) = duplex(64);
        let writer = tokio::spawn(async move {
            a.write_all(&vec![b'x'; 4 * 1024 * 1024]).await.unwrap();
            a.write_all(b"\n{\"type\":\"welcome\"}\n").await.unwrap();
        });

        let mut reader = FrameReader::new(b, 100);
        assert!(matches!(
            reader.next_frame().await,
            Err(FloodgateError::Protocol(_))
        ));
        assert!(reader.buf.capacity() <= 4 * 1024);
        assert!(!writer.is_finished());

        // The rest of the long line is skipped and the stream stays usable.
        assert_eq!(
            reader.next_frame().await.unwrap().as_deref(),
            Some("{\"type\":\"welcome\"}")
        );
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_frame_at_the_limit_accepted() {
        let (mut a, b) = duplex(1024);
        let frame = "y".repeat(100);
        a.write_all(format!("{}\n", frame).as_bytes()).await.unwrap();
        drop(a);

        let mut reader = FrameReader::new(b, 100);
        assert_eq!(reader.next_frame().await.unwrap(), Some(frame));
        assert!(reader.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_a_protocol_error() {
        let (mut a, b) = duplex(1024);
        a.write_all(b"\xff\xfe\n{\"type\":\"welcome\"}\n").await.unwrap();
        drop(a);

        let mut reader = FrameReader::new(b, 100);
        assert!(matches!(
            reader.next_frame().await,
            Err(FloodgateError::Protocol(_))
        ));
        assert!(reader.next_frame().await.unwrap().is_some());
    }
}

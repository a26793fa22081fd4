//! Length-prefixed frame codec for the ingester link.
//!
//! Wire format: 4-byte unsigned big-endian payload length, then exactly
//! that many payload bytes. Payloads are UTF-8 JSON objects but the codec
//! does not care.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum accepted payload length (1 MiB).
pub const MAX_FRAME: usize = 1 << 20;

/// Errors during frame decode/encode.
#[derive(Debug)]
pub enum FrameError {
    /// Stream ended inside the 4-byte length header.
    ShortHeader,
    /// Stream ended inside the payload body.
    ShortBody { expected: usize, got: usize },
    /// Declared length exceeds the configured maximum.
    LengthTooLarge(u32),
    Io(io::Error),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ShortHeader => write!(f, "stream ended mid-header"),
            Self::ShortBody { expected, got } => {
                write!(f, "stream ended mid-body: got {} of {} bytes", got, expected)
            }
            Self::LengthTooLarge(n) => {
                write!(f, "frame length too large: {} > {}", n, MAX_FRAME)
            }
            Self::Io(e) => write!(f, "frame io error: {}", e),
        }
    }
}

impl std::error::Error for FrameError {}

impl From<io::Error> for FrameError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

enum ReadState {
    Header { buf: [u8; 4], filled: usize },
    Body { payload: Vec<u8>, got: usize },
}

impl ReadState {
    fn header() -> Self {
        Self::Header {
            buf: [0; 4],
            filled: 0,
        }
    }
}

/// Lazy frame decoder over any async byte stream.
///
/// Decode progress lives in the reader, not in the `next()` future, so a
/// call cancelled mid-frame (e.g. by a `select!` racing shutdown) resumes
/// where it left off instead of desyncing the stream.
pub struct FrameReader<R> {
    inner: R,
    max_frame: usize,
    state: ReadState,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_max_frame(inner, MAX_FRAME)
    }

    pub fn with_max_frame(inner: R, max_frame: usize) -> Self {
        Self {
            inner,
            max_frame,
            state: ReadState::header(),
        }
    }

    /// Read the next frame payload. `Ok(None)` on clean EOF between frames.
    pub async fn next(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        loop {
            match &mut self.state {
                ReadState::Header { buf, filled } => {
                    let n = self.inner.read(&mut buf[*filled..]).await?;
                    if n == 0 {
                        if *filled == 0 {
                            return Ok(None);
                        }
                        return Err(FrameError::ShortHeader);
                    }
                    *filled += n;
                    if *filled == buf.len() {
                        let len = u32::from_be_bytes(*buf);
                        if len as usize > self.max_frame {
                            self.state = ReadState::header();
                            return Err(FrameError::LengthTooLarge(len));
                        }
                        self.state = ReadState::Body {
                            payload: vec![0u8; len as usize],
                            got: 0,
                        };
                    }
                }
                ReadState::Body { payload, got } => {
                    if *got == payload.len() {
                        let done = std::mem::take(payload);
                        self.state = ReadState::header();
                        return Ok(Some(done));
                    }
                    let n = self.inner.read(&mut payload[*got..]).await?;
                    if n == 0 {
                        return Err(FrameError::ShortBody {
                            expected: payload.len(),
                            got: *got,
                        });
                    }
                    *got += n;
                }
            }
        }
    }
}

/// Encode one frame. The length check happens before any byte is written,
/// and header + payload go out in a single write, so a failed call never
/// leaves a partial frame on the stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    w: &mut W,
    payload: &[u8],
) -> Result<(), FrameError> {
    if payload.len() > MAX_FRAME {
        return Err(FrameError::LengthTooLarge(payload.len() as u32));
    }
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    w.write_all(&buf).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    async fn encode_all(payloads: &[&[u8]]) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        for p in payloads {
            write_frame(&mut buf, p).await.unwrap();
        }
        buf.into_inner()
    }

    #[tokio::test]
    async fn test_roundtrip_single() {
        let wire = encode_all(&[b"{\"price\":\"1.0\"}"]).await;
        let mut reader = FrameReader::new(Cursor::new(wire));
        assert_eq!(reader.next().await.unwrap().unwrap(), b"{\"price\":\"1.0\"}");
        assert!(reader.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_roundtrip_concatenated() {
        let payloads: Vec<Vec<u8>> = (0..10).map(|i| vec![i as u8; i * 7 + 1]).collect();
        let refs: Vec<&[u8]> = payloads.iter().map(|p| p.as_slice()).collect();
        let wire = encode_all(&refs).await;

        let mut reader = FrameReader::new(Cursor::new(wire));
        for expected in &payloads {
            assert_eq!(&reader.next().await.unwrap().unwrap(), expected);
        }
        assert!(reader.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_payload() {
        let wire = encode_all(&[b""]).await;
        let mut reader = FrameReader::new(Cursor::new(wire));
        assert_eq!(reader.next().await.unwrap().unwrap(), Vec::<u8>::new());
        assert!(reader.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_short_header() {
        let mut reader = FrameReader::new(Cursor::new(vec![0u8, 0, 1]));
        assert!(matches!(reader.next().await, Err(FrameError::ShortHeader)));
    }

    #[tokio::test]
    async fn test_short_body() {
        let mut wire = 8u32.to_be_bytes().to_vec();
        wire.extend_from_slice(b"abc");
        let mut reader = FrameReader::new(Cursor::new(wire));
        assert!(matches!(
            reader.next().await,
            Err(FrameError::ShortBody { expected: 8, got: 3 })
        ));
    }

    #[tokio::test]
    async fn test_length_too_large() {
        let wire = ((MAX_FRAME as u32) + 1).to_be_bytes().to_vec();
        let mut reader = FrameReader::new(Cursor::new(wire));
        assert!(matches!(
            reader.next().await,
            Err(FrameError::LengthTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn test_oversize_encode_writes_nothing() {
        let payload = vec![0u8; MAX_FRAME + 1];
        let mut out = Cursor::new(Vec::new());
        assert!(write_frame(&mut out, &payload).await.is_err());
        assert!(out.into_inner().is_empty());
    }
}

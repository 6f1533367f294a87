//! Stream framing
//!
//! Signaling and tracker streams carry length-prefixed JSON messages:
//! `[len: u32 BE][json bytes]`. Data channels add a one-byte kind tag in
//! front (`[kind: u8][len: u32 BE][body]`) so control messages and binary
//! chunks are distinguishable at the framing layer.

use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Upper bound for a single frame. Control messages are tiny and chunks are
/// capped well below this; anything larger is a protocol violation.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

const KIND_CONTROL: u8 = 0;
const KIND_BINARY: u8 = 1;

#[derive(Error, Debug)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("unknown frame kind {0}")]
    UnknownFrameKind(u8),

    #[error("stream closed mid-frame")]
    TruncatedFrame,
}

/// A frame received on a data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Structured control message (JSON bytes)
    Control(Vec<u8>),

    /// Raw file chunk
    Binary(Vec<u8>),
}

/// Write one JSON message with a length prefix.
pub async fn write_json<W, T>(io: &mut W, value: &T) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
    T: Serialize + ?Sized,
{
    let body = serde_json::to_vec(value)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge {
            len: body.len(),
            max: MAX_FRAME_LEN,
        });
    }
    io.write_all(&(body.len() as u32).to_be_bytes()).await?;
    io.write_all(&body).await?;
    io.flush().await?;
    Ok(())
}

/// Read one JSON message. Returns `None` on a clean end of stream (EOF
/// before the first length byte).
pub async fn read_json_opt<R, T>(io: &mut R) -> Result<Option<T>, WireError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = match read_len(io).await? {
        Some(len) => len,
        None => return Ok(None),
    };
    let body = read_body(io, len).await?;
    Ok(Some(serde_json::from_slice(&body)?))
}

/// Read one JSON message, treating end of stream as an error.
pub async fn read_json<R, T>(io: &mut R) -> Result<T, WireError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    read_json_opt(io).await?.ok_or(WireError::TruncatedFrame)
}

/// Write one control frame onto a data channel.
pub async fn write_control<W, T>(io: &mut W, value: &T) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
    T: Serialize + ?Sized,
{
    let body = serde_json::to_vec(value)?;
    write_tagged(io, KIND_CONTROL, &body).await
}

/// Write one binary chunk frame onto a data channel.
pub async fn write_binary<W: AsyncWrite + Unpin>(io: &mut W, data: &[u8]) -> Result<(), WireError> {
    write_tagged(io, KIND_BINARY, data).await
}

/// Read the next data-channel frame. Returns `None` on a clean end of
/// stream.
pub async fn read_frame<R: AsyncRead + Unpin>(io: &mut R) -> Result<Option<Frame>, WireError> {
    let mut kind = [0u8; 1];
    match io.read(&mut kind).await? {
        0 => return Ok(None),
        _ => {}
    }

    let len = match read_len(io).await? {
        Some(len) => len,
        None => return Err(WireError::TruncatedFrame),
    };
    let body = read_body(io, len).await?;

    match kind[0] {
        KIND_CONTROL => Ok(Some(Frame::Control(body))),
        KIND_BINARY => Ok(Some(Frame::Binary(body))),
        other => Err(WireError::UnknownFrameKind(other)),
    }
}

async fn write_tagged<W: AsyncWrite + Unpin>(
    io: &mut W,
    kind: u8,
    body: &[u8],
) -> Result<(), WireError> {
    if body.len() > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge {
            len: body.len(),
            max: MAX_FRAME_LEN,
        });
    }
    io.write_all(&[kind]).await?;
    io.write_all(&(body.len() as u32).to_be_bytes()).await?;
    io.write_all(body).await?;
    io.flush().await?;
    Ok(())
}

async fn read_len<R: AsyncRead + Unpin>(io: &mut R) -> Result<Option<usize>, WireError> {
    let mut buf = [0u8; 4];
    let mut filled = 0;
    while filled < buf.len() {
        let n = io.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(WireError::TruncatedFrame);
        }
        filled += n;
    }

    let len = u32::from_be_bytes(buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }
    Ok(Some(len))
}

async fn read_body<R: AsyncRead + Unpin>(io: &mut R, len: usize) -> Result<Vec<u8>, WireError> {
    let mut body = vec![0u8; len];
    io.read_exact(&mut body)
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => WireError::TruncatedFrame,
            _ => WireError::Io(e),
        })?;
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::io::Cursor;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Probe {
        name: String,
        count: u32,
    }

    #[tokio::test]
    async fn test_json_roundtrip() {
        let mut buf = Vec::new();
        let value = Probe {
            name: "hello".into(),
            count: 7,
        };
        write_json(&mut buf, &value).await.unwrap();

        let mut cursor = Cursor::new(buf);
        let back: Probe = read_json(&mut cursor).await.unwrap();
        assert_eq!(back, value);
    }

    #[tokio::test]
    async fn test_clean_eof_is_none() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        let got: Option<Probe> = read_json_opt(&mut cursor).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_truncated_frame_is_error() {
        let mut buf = Vec::new();
        write_json(&mut buf, &Probe { name: "x".into(), count: 1 })
            .await
            .unwrap();
        buf.truncate(buf.len() - 3);

        let mut cursor = Cursor::new(buf);
        let got: Result<Option<Probe>, _> = read_json_opt(&mut cursor).await;
        assert!(matches!(got, Err(WireError::TruncatedFrame)));
    }

    #[tokio::test]
    async fn test_frame_kinds_roundtrip() {
        let mut buf = Vec::new();
        write_control(&mut buf, &Probe { name: "ctl".into(), count: 2 })
            .await
            .unwrap();
        write_binary(&mut buf, b"chunk bytes").await.unwrap();

        let mut cursor = Cursor::new(buf);
        match read_frame(&mut cursor).await.unwrap().unwrap() {
            Frame::Control(body) => {
                let probe: Probe = serde_json::from_slice(&body).unwrap();
                assert_eq!(probe.count, 2);
            }
            other => panic!("expected control frame, got {other:?}"),
        }
        assert_eq!(
            read_frame(&mut cursor).await.unwrap().unwrap(),
            Frame::Binary(b"chunk bytes".to_vec())
        );
        assert!(read_frame(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        // A forged length prefix larger than the limit must fail before any
        // allocation of that size.
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME_LEN as u32 + 1).to_be_bytes());

        let mut cursor = Cursor::new(buf);
        let got: Result<Option<Probe>, _> = read_json_opt(&mut cursor).await;
        assert!(matches!(got, Err(WireError::FrameTooLarge { .. })));
    }
}

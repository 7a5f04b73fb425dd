//! Wire protocol for the action-cache IPC endpoint
//!
//! Messages are framed as length-prefixed JSON:
//! - 4 bytes: big-endian frame length
//! - N bytes: JSON payload

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame size (1MB). Artifact bytes travel via disk paths, so frames
/// stay small.
const MAX_FRAME_SIZE: u32 = 1024 * 1024;

/// Client request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    /// Look up an action fingerprint.
    Get {
        /// Action fingerprint
        action: String,
    },
    /// Record an action result whose artifact is already on disk.
    Put {
        /// Action fingerprint
        action: String,
        /// Output fingerprint
        output: String,
        /// Path of the artifact bytes on the shared filesystem
        body_path: PathBuf,
        /// Artifact size in bytes
        size: u64,
    },
    /// Flush and close this session.
    Close,
}

/// Server response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    /// The action was found; the artifact is available on disk.
    Hit {
        /// Output fingerprint
        output: String,
        /// Local path of the artifact
        disk_path: PathBuf,
        /// Artifact size in bytes
        size: u64,
    },
    /// The action is not cached.
    Miss,
    /// A `Put` or `Close` completed.
    Ack,
    /// The request failed; the connection stays usable.
    Error {
        /// Human-readable failure description
        message: String,
    },
}

/// Failure reading a frame.
#[derive(Debug)]
pub enum FrameError {
    /// The declared frame length exceeds [`MAX_FRAME_SIZE`]; the stream is
    /// no longer synchronized and must be closed.
    TooLarge(u32),
    /// The payload was consumed but is not a valid message; the stream is
    /// still framed and the connection may continue.
    Decode(serde_json::Error),
    /// Transport failure (includes clean EOF as `UnexpectedEof`).
    Io(io::Error),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooLarge(len) => write!(f, "frame of {len} bytes exceeds limit"),
            Self::Decode(e) => write!(f, "malformed frame: {e}"),
            Self::Io(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for FrameError {}

impl FrameError {
    /// Whether this is a clean end-of-stream.
    #[must_use]
    pub fn is_eof(&self) -> bool {
        matches!(self, Self::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
    }
}

/// Write one frame to `writer`.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let json =
        serde_json::to_vec(message).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let len = json.len() as u32;
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "frame too large"));
    }

    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&json).await?;
    writer.flush().await?;

    Ok(())
}

/// Read one frame from `reader`.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T, FrameError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await.map_err(FrameError::Io)?;
    let len = u32::from_be_bytes(len_buf);

    if len > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(len));
    }

    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await.map_err(FrameError::Io)?;

    serde_json::from_slice(&buf).map_err(FrameError::Decode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn test_request_roundtrip() {
        let req = Request::Put {
            action: "a".repeat(64),
            output: "b".repeat(64),
            body_path: PathBuf::from("/tmp/out.bin"),
            size: 5,
        };

        let mut buf = Vec::new();
        write_frame(&mut buf, &req).await.unwrap();

        let mut reader = BufReader::new(Cursor::new(buf));
        let read: Request = read_frame(&mut reader).await.unwrap();
        assert_eq!(read, req);
    }

    #[tokio::test]
    async fn test_response_roundtrip() {
        for resp in [
            Response::Hit {
                output: "b".repeat(64),
                disk_path: PathBuf::from("/cache/out"),
                size: 9,
            },
            Response::Miss,
            Response::Ack,
            Response::Error {
                message: "nope".into(),
            },
        ] {
            let mut buf = Vec::new();
            write_frame(&mut buf, &resp).await.unwrap();
            let mut reader = BufReader::new(Cursor::new(buf));
            let read: Response = read_frame(&mut reader).await.unwrap();
            assert_eq!(read, resp);
        }
    }

    #[tokio::test]
    async fn test_frame_too_large() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME_SIZE + 1).to_be_bytes());
        buf.extend_from_slice(&[0u8; 16]);

        let mut reader = BufReader::new(Cursor::new(buf));
        let err = read_frame::<_, Request>(&mut reader).await.unwrap_err();
        assert!(matches!(err, FrameError::TooLarge(_)));
    }

    #[tokio::test]
    async fn test_invalid_json_is_recoverable() {
        let payload = b"not valid json";
        let mut buf = Vec::new();
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(payload);
        // A valid frame right behind the bad one.
        write_frame(&mut buf, &Request::Get { action: "abcd".into() })
            .await
            .unwrap();

        let mut reader = BufReader::new(Cursor::new(buf));
        let err = read_frame::<_, Request>(&mut reader).await.unwrap_err();
        assert!(matches!(err, FrameError::Decode(_)));

        // The stream is still framed.
        let next: Request = read_frame(&mut reader).await.unwrap();
        assert_eq!(next, Request::Get { action: "abcd".into() });
    }

    #[tokio::test]
    async fn test_eof_detection() {
        let mut reader = BufReader::new(Cursor::new(Vec::new()));
        let err = read_frame::<_, Request>(&mut reader).await.unwrap_err();
        assert!(err.is_eof());
    }
}

//! IPC (Inter-Process Communication) via Unix sockets
//!
//! Provides message-based communication between clients and the profile daemon.
//! Uses big-endian u32 length-prefixed JSON over Unix domain sockets.

use anyhow::{anyhow, bail, Context, Result};
use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

mod client;
mod messages;
pub use client::ProfileClient;
pub use messages::{Message, Request, Value};

use crate::constants::wire::{MAX_MESSAGE_SIZE, PREFIX_SIZE, SOCKET_MODE};

/// Listening socket of the profile daemon, unlinked again on drop
pub struct ProfileServer {
    listener: UnixListener,
    socket_path: PathBuf,
}

impl ProfileServer {
    /// Bind `socket_path`, owner-only access
    ///
    /// A leftover socket from a daemon that died is replaced. Binding fails if
    /// another daemon still answers on the path or if something other than a
    /// socket is in the way.
    pub fn bind_to(socket_path: PathBuf) -> Result<Self> {
        if let Some(dir) = socket_path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create socket directory {}", dir.display()))?;
        }
        clear_stale_socket(&socket_path)?;

        let listener = UnixListener::bind(&socket_path)
            .with_context(|| format!("Failed to bind socket at {}", socket_path.display()))?;
        fs::set_permissions(&socket_path, fs::Permissions::from_mode(SOCKET_MODE))
            .with_context(|| format!("Failed to restrict access to {}", socket_path.display()))?;

        Ok(Self {
            listener,
            socket_path,
        })
    }

    pub fn accept(&self) -> Result<UnixStream> {
        let (stream, _) = self
            .listener
            .accept()
            .context("Failed to accept client connection")?;
        Ok(stream)
    }

    pub fn listener(&self) -> &UnixListener {
        &self.listener
    }

    pub fn path(&self) -> &Path {
        &self.socket_path
    }
}

impl Drop for ProfileServer {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.socket_path) {
            debug!(socket = %self.socket_path.display(), error = %e, "Socket already gone");
        }
    }
}

fn clear_stale_socket(path: &Path) -> Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("Failed to inspect {}", path.display())),
    };
    if !meta.file_type().is_socket() {
        bail!("{} exists and is not a socket", path.display());
    }
    if UnixStream::connect(path).is_ok() {
        bail!("Another daemon is already listening on {}", path.display());
    }
    warn!(socket = %path.display(), "Removing stale socket");
    fs::remove_file(path).with_context(|| format!("Failed to remove stale socket {}", path.display()))
}

/// Serialize and length-prefix a message
pub fn encode_message(msg: &Message) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(msg).context("Failed to serialize message to JSON")?;
    if json.len() > MAX_MESSAGE_SIZE {
        bail!("Message too large: {} bytes (max: {})", json.len(), MAX_MESSAGE_SIZE);
    }
    let len = u32::try_from(json.len()).context("Message length exceeds u32")?;

    let mut frame = Vec::with_capacity(PREFIX_SIZE + json.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&json);
    Ok(frame)
}

/// Write length-prefixed message to stream
pub fn write_message<W: Write>(stream: &mut W, msg: &Message) -> Result<()> {
    let frame = encode_message(msg)?;
    stream
        .write_all(&frame)
        .context("Failed to write message")?;
    stream.flush().context("Failed to flush stream")?;
    Ok(())
}

/// Read length-prefixed message from stream (blocking)
///
/// A short read on either the prefix or the body is an error.
pub fn read_message<R: Read>(stream: &mut R) -> Result<Message> {
    let mut len_buf = [0u8; PREFIX_SIZE];
    stream
        .read_exact(&mut len_buf)
        .context("Failed to read message length")?;
    let len = checked_len(len_buf)?;

    let mut json_buf = vec![0u8; len];
    stream
        .read_exact(&mut json_buf)
        .context("Failed to read message payload")?;

    decode_body(&json_buf)
}

fn checked_len(prefix: [u8; PREFIX_SIZE]) -> Result<usize> {
    let len = u32::from_be_bytes(prefix) as usize;
    // Sanity check (prevent DoS via huge allocation)
    if len > MAX_MESSAGE_SIZE {
        return Err(anyhow!("Message too large: {} bytes (max: {})", len, MAX_MESSAGE_SIZE));
    }
    Ok(len)
}

fn decode_body(body: &[u8]) -> Result<Message> {
    serde_json::from_slice(body).context("Failed to deserialize message from JSON")
}

/// Where a connection is within the current frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePhase {
    AwaitingPrefix,
    AwaitingBody(usize),
}

/// Incremental decoder for bytes arriving on a non-blocking read path
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    phase: FramePhase,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self {
            buf: Vec::new(),
            phase: FramePhase::AwaitingPrefix,
        }
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> FramePhase {
        self.phase
    }

    /// True when no partial frame is buffered
    pub fn is_idle(&self) -> bool {
        self.phase == FramePhase::AwaitingPrefix && self.buf.is_empty()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Next complete message, `Ok(None)` when more bytes are needed
    pub fn next_message(&mut self) -> Result<Option<Message>> {
        if self.phase == FramePhase::AwaitingPrefix {
            if self.buf.len() < PREFIX_SIZE {
                return Ok(None);
            }
            let mut prefix = [0u8; PREFIX_SIZE];
            prefix.copy_from_slice(&self.buf[..PREFIX_SIZE]);
            let len = checked_len(prefix)?;
            self.buf.drain(..PREFIX_SIZE);
            self.phase = FramePhase::AwaitingBody(len);
        }

        let FramePhase::AwaitingBody(len) = self.phase else {
            return Ok(None);
        };
        if self.buf.len() < len {
            return Ok(None);
        }
        let body: Vec<u8> = self.buf.drain(..len).collect();
        self.phase = FramePhase::AwaitingPrefix;
        decode_body(&body).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn ping() -> Message {
        Message::request("get_profile", vec![])
    }

    #[test]
    fn test_bind_replaces_stale_socket() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("tmp").join("profiled.socket");

        // A listener closed without unlinking leaves a dead socket behind
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        drop(UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let server = ProfileServer::bind_to(path.clone()).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, SOCKET_MODE);
        drop(server);
        assert!(!path.exists());
    }

    #[test]
    fn test_bind_refuses_live_socket() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("profiled.socket");

        let _running = ProfileServer::bind_to(path.clone()).unwrap();
        let err = ProfileServer::bind_to(path.clone()).err().unwrap();
        assert!(err.to_string().contains("already listening"));
        assert!(path.exists());
    }

    #[test]
    fn test_bind_refuses_regular_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("profiled.socket");
        fs::write(&path, "keep me").unwrap();

        assert!(ProfileServer::bind_to(path.clone()).is_err());
        assert_eq!(fs::read_to_string(&path).unwrap(), "keep me");
    }

    #[test]
    fn test_frame_prefix_is_big_endian() {
        let frame = encode_message(&ping()).unwrap();
        let body_len = frame.len() - PREFIX_SIZE;
        assert_eq!(&frame[..PREFIX_SIZE], &(body_len as u32).to_be_bytes());
    }

    #[test]
    fn test_read_message_from_stream() {
        let frame = encode_message(&ping()).unwrap();
        let msg = read_message(&mut Cursor::new(frame)).unwrap();
        assert_eq!(msg, ping());
    }

    #[test]
    fn test_short_body_is_error() {
        let mut frame = encode_message(&ping()).unwrap();
        frame.truncate(frame.len() - 1);
        assert!(read_message(&mut Cursor::new(frame)).is_err());
    }

    #[test]
    fn test_short_prefix_is_error() {
        assert!(read_message(&mut Cursor::new(vec![0u8, 0])).is_err());
    }

    #[test]
    fn test_oversized_prefix_rejected() {
        let prefix = ((MAX_MESSAGE_SIZE + 1) as u32).to_be_bytes();
        assert!(read_message(&mut Cursor::new(prefix.to_vec())).is_err());

        let mut decoder = FrameDecoder::new();
        decoder.extend(&prefix);
        assert!(decoder.next_message().is_err());
    }

    #[test]
    fn test_decoder_byte_by_byte() {
        let frame = encode_message(&ping()).unwrap();
        let mut decoder = FrameDecoder::new();

        for (i, byte) in frame.iter().enumerate() {
            assert!(decoder.next_message().unwrap().is_none());
            decoder.extend(&[*byte]);
            if i == PREFIX_SIZE - 1 {
                assert!(decoder.next_message().unwrap().is_none());
                assert!(matches!(decoder.phase(), FramePhase::AwaitingBody(_)));
            }
        }
        assert_eq!(decoder.next_message().unwrap(), Some(ping()));
        assert!(decoder.is_idle());
    }

    #[test]
    fn test_decoder_two_frames_in_one_chunk() {
        let other = Message::request("get_keys", vec![]);
        let mut bytes = encode_message(&ping()).unwrap();
        bytes.extend(encode_message(&other).unwrap());

        let mut decoder = FrameDecoder::new();
        decoder.extend(&bytes);
        assert_eq!(decoder.next_message().unwrap(), Some(ping()));
        assert_eq!(decoder.next_message().unwrap(), Some(other));
        assert_eq!(decoder.next_message().unwrap(), None);
    }

    #[test]
    fn test_decoder_bad_json() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&3u32.to_be_bytes());
        decoder.extend(b"{{{");
        assert!(decoder.next_message().is_err());
    }
}

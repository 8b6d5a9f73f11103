//! Discord Rich Presence over the local IPC socket
//!
//! The Discord desktop client listens on a Unix socket named
//! `discord-ipc-N` (N = 0..9) in the user's runtime or temp directory.
//!
//! ## Protocol
//!
//! Every message is a frame:
//!
//! ```text
//! +-----------------+-----------------+------------------------+
//! | opcode (u32 LE) | length (u32 LE) | JSON payload (length)  |
//! +-----------------+-----------------+------------------------+
//! ```
//!
//! 1. Client sends a HANDSHAKE frame `{"v":1,"client_id":".."}`
//! 2. Discord answers with a `READY` dispatch
//! 3. Client sends `SET_ACTIVITY` commands, each with a unique nonce
//! 4. Discord answers each command asynchronously, `evt: "ERROR"` on failure
//!
//! The socket is blocking only during the handshake. Afterwards responses
//! are picked up by `run_callbacks` without ever waiting.

use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, error, info, trace, warn};

use super::provider::{Activity, PresenceError, PresenceProvider};

const OP_HANDSHAKE: u32 = 0;
const OP_FRAME: u32 = 1;
const OP_CLOSE: u32 = 2;
const OP_PING: u32 = 3;
const OP_PONG: u32 = 4;

/// Size of the opcode + length header
const HEADER_LEN: usize = 8;

/// Frames larger than this are treated as a corrupt stream
const MAX_FRAME_LEN: usize = 64 * 1024;

/// How long the handshake may take before giving up
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Number of `discord-ipc-N` sockets Discord may use
const SOCKET_SLOTS: usize = 10;

/// Directories Discord may put its socket in, most specific first
fn candidate_paths() -> Vec<PathBuf> {
    let mut bases: Vec<PathBuf> = ["XDG_RUNTIME_DIR", "TMPDIR", "TMP", "TEMP"]
        .iter()
        .filter_map(|var| std::env::var_os(var))
        .map(PathBuf::from)
        .collect();
    bases.push(PathBuf::from("/tmp"));

    candidate_dirs(bases)
        .iter()
        .flat_map(|dir| (0..SOCKET_SLOTS).map(move |i| dir.join(format!("discord-ipc-{}", i))))
        .collect()
}

/// Expand each base directory into its socket directories, each at most once
fn candidate_dirs(bases: Vec<PathBuf>) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = Vec::new();
    for base in bases {
        // Flatpak and Snap builds nest the socket one level down
        let nested = [
            base.join("app/com.discordapp.Discord"),
            base.join("snap.discord"),
            base,
        ];
        for dir in nested {
            if !dirs.contains(&dir) {
                dirs.push(dir);
            }
        }
    }
    dirs
}

/// Serialize one frame
fn encode_frame(opcode: u32, payload: &Value) -> Result<Vec<u8>, PresenceError> {
    let body = serde_json::to_vec(payload)?;
    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.extend_from_slice(&opcode.to_le_bytes());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// A frame split off the read buffer
///
/// `len` covers header and body and is known even when the body is not
/// valid JSON, so the caller can always drain the frame.
#[derive(Debug)]
struct RawFrame {
    opcode: u32,
    payload: Result<Value, serde_json::Error>,
    len: usize,
}

/// Split the first complete frame off the front of `buf`
///
/// Returns `None` if more bytes are needed. An oversized length is an error
/// because the stream can no longer be resynchronized.
fn decode_frame(buf: &[u8]) -> Result<Option<RawFrame>, PresenceError> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }

    let opcode = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let len = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(PresenceError::Handshake {
            message: format!("frame of {} bytes exceeds limit", len),
        });
    }
    if buf.len() < HEADER_LEN + len {
        return Ok(None);
    }

    let payload = if len == 0 {
        Ok(Value::Null)
    } else {
        serde_json::from_slice(&buf[HEADER_LEN..HEADER_LEN + len])
    };
    Ok(Some(RawFrame {
        opcode,
        payload,
        len: HEADER_LEN + len,
    }))
}

/// Build the `SET_ACTIVITY` args object; `None` clears the activity
fn activity_args(pid: u32, activity: Option<&Activity>) -> Value {
    match activity {
        Some(activity) => json!({
            "pid": pid,
            "activity": {
                "details": activity.details,
                "state": activity.state,
                "timestamps": { "start": activity.start_timestamp },
                "assets": { "large_image": activity.large_image },
            }
        }),
        None => json!({ "pid": pid }),
    }
}

/// Discord Rich Presence session
#[derive(Debug)]
pub struct DiscordIpc {
    socket: UnixStream,
    /// Bytes received but not yet forming a complete frame
    read_buf: Vec<u8>,
    next_nonce: u64,
    closed: bool,
}

impl DiscordIpc {
    /// Find a Discord socket and complete the handshake
    ///
    /// # Errors
    ///
    /// Returns `PresenceError::SocketNotFound` if no candidate socket accepts
    /// a connection, or any error from the handshake itself.
    pub fn connect(client_id: &str) -> Result<Self, PresenceError> {
        let candidates = candidate_paths();

        for path in &candidates {
            if !path.exists() {
                continue;
            }
            match Self::connect_at(path, client_id) {
                Ok(ipc) => return Ok(ipc),
                Err(PresenceError::ConnectionFailed { path, source }) => {
                    debug!(path = %path.display(), error = %source, "Discord socket not usable");
                }
                Err(e) => return Err(e),
            }
        }

        Err(PresenceError::SocketNotFound {
            tried: candidates.len(),
        })
    }

    /// Connect to a specific socket path and complete the handshake
    pub fn connect_at(path: &Path, client_id: &str) -> Result<Self, PresenceError> {
        let socket = UnixStream::connect(path).map_err(|source| PresenceError::ConnectionFailed {
            path: path.to_path_buf(),
            source,
        })?;
        socket.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;

        let mut ipc = Self {
            socket,
            read_buf: Vec::new(),
            next_nonce: 1,
            closed: false,
        };

        ipc.write_frame(OP_HANDSHAKE, &json!({ "v": 1, "client_id": client_id }))?;

        let (opcode, payload) = ipc.read_frame_blocking()?;
        match (opcode, payload.get("evt").and_then(Value::as_str)) {
            (OP_FRAME, Some("READY")) => {}
            (OP_CLOSE, _) => {
                return Err(PresenceError::Handshake {
                    message: payload
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("closed by Discord")
                        .to_string(),
                });
            }
            (opcode, evt) => {
                return Err(PresenceError::Handshake {
                    message: format!("expected READY, got opcode {} evt {:?}", opcode, evt),
                });
            }
        }

        ipc.socket.set_read_timeout(None)?;
        ipc.socket.set_nonblocking(true)?;

        info!(path = %path.display(), "Connected to Discord");
        Ok(ipc)
    }

    fn write_frame(&mut self, opcode: u32, payload: &Value) -> Result<(), PresenceError> {
        if self.closed {
            return Err(PresenceError::Closed);
        }
        let frame = encode_frame(opcode, payload)?;
        self.socket.write_all(&frame)?;
        Ok(())
    }

    fn read_frame_blocking(&mut self) -> Result<(u32, Value), PresenceError> {
        loop {
            if let Some(frame) = decode_frame(&self.read_buf)? {
                self.read_buf.drain(..frame.len);
                return Ok((frame.opcode, frame.payload?));
            }
            let mut chunk = [0u8; 4096];
            let len = self.socket.read(&mut chunk)?;
            if len == 0 {
                return Err(PresenceError::Closed);
            }
            self.read_buf.extend_from_slice(&chunk[..len]);
        }
    }

    /// Pull everything currently readable into the frame buffer
    fn fill_nonblocking(&mut self) -> Result<(), PresenceError> {
        let mut chunk = [0u8; 4096];
        loop {
            match self.socket.read(&mut chunk) {
                Ok(0) => {
                    self.closed = true;
                    return Ok(());
                }
                Ok(len) => self.read_buf.extend_from_slice(&chunk[..len]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn send_command(&mut self, args: Value) -> Result<(), PresenceError> {
        let nonce = self.next_nonce.to_string();
        self.next_nonce += 1;

        trace!(nonce = %nonce, "Sending SET_ACTIVITY");
        self.write_frame(
            OP_FRAME,
            &json!({ "cmd": "SET_ACTIVITY", "args": args, "nonce": nonce }),
        )
    }

    fn handle_frame(&mut self, opcode: u32, payload: Value) -> Result<(), PresenceError> {
        match opcode {
            OP_FRAME => {
                let cmd = payload.get("cmd").and_then(Value::as_str).unwrap_or("?");
                if payload.get("evt").and_then(Value::as_str) == Some("ERROR") {
                    let message = payload
                        .pointer("/data/message")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown error");
                    error!(cmd, message, "update_activity: failure");
                } else {
                    debug!(cmd, "update_activity: success");
                }
            }
            OP_PING => self.write_frame(OP_PONG, &payload)?,
            OP_CLOSE => {
                warn!(payload = %payload, "Discord closed the IPC session");
                self.closed = true;
            }
            other => trace!(opcode = other, "Ignoring Discord frame"),
        }
        Ok(())
    }
}

impl PresenceProvider for DiscordIpc {
    fn name(&self) -> &'static str {
        "discord"
    }

    fn publish(&mut self, activity: &Activity) -> Result<(), PresenceError> {
        let args = activity_args(std::process::id(), Some(activity));
        self.send_command(args)
    }

    fn clear(&mut self) -> Result<(), PresenceError> {
        let args = activity_args(std::process::id(), None);
        self.send_command(args)
    }

    fn run_callbacks(&mut self) -> Result<(), PresenceError> {
        if self.closed {
            return Err(PresenceError::Closed);
        }

        self.fill_nonblocking()?;
        loop {
            let frame = match decode_frame(&self.read_buf) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Discord stream unreadable, closing session");
                    self.read_buf.clear();
                    self.closed = true;
                    break;
                }
            };
            self.read_buf.drain(..frame.len);

            match frame.payload {
                Ok(payload) => self.handle_frame(frame.opcode, payload)?,
                Err(e) => warn!(opcode = frame.opcode, error = %e, "Dropping malformed Discord frame"),
            }
        }

        if self.closed {
            return Err(PresenceError::Closed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;
    use std::thread;
    use tempfile::TempDir;

    /// Fake Discord: reads a frame, returns (opcode, payload)
    fn read_frame(stream: &mut UnixStream) -> (u32, Value) {
        let mut header = [0u8; HEADER_LEN];
        stream.read_exact(&mut header).unwrap();
        let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).unwrap();
        (
            u32::from_le_bytes([header[0], header[1], header[2], header[3]]),
            serde_json::from_slice(&body).unwrap(),
        )
    }

    fn write_frame(stream: &mut UnixStream, opcode: u32, payload: Value) {
        stream.write_all(&encode_frame(opcode, &payload).unwrap()).unwrap();
    }

    fn sample_activity() -> Activity {
        Activity {
            details: "Hagen Hbf".to_string(),
            state: "Online, 13:07".to_string(),
            start_timestamp: 1_700_000_000,
            large_image: "signale".to_string(),
        }
    }

    #[test]
    fn test_frame_layout() {
        let frame = encode_frame(OP_FRAME, &json!({"a": 1})).unwrap();

        assert_eq!(&frame[..4], &1u32.to_le_bytes());
        assert_eq!(&frame[4..8], &7u32.to_le_bytes());
        assert_eq!(&frame[8..], br#"{"a":1}"#);
    }

    #[test]
    fn test_decode_frame_waits_for_complete_payload() {
        let frame = encode_frame(OP_FRAME, &json!({"evt": "READY"})).unwrap();

        assert!(decode_frame(&frame[..5]).unwrap().is_none());
        assert!(decode_frame(&frame[..frame.len() - 1]).unwrap().is_none());

        let mut two = frame.clone();
        two.extend_from_slice(&frame);
        let decoded = decode_frame(&two).unwrap().unwrap();
        assert_eq!(decoded.opcode, OP_FRAME);
        assert_eq!(decoded.payload.unwrap()["evt"], "READY");
        assert_eq!(decoded.len, frame.len());
    }

    #[test]
    fn test_decode_frame_reports_length_of_malformed_body() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&OP_FRAME.to_le_bytes());
        frame.extend_from_slice(&9u32.to_le_bytes());
        frame.extend_from_slice(b"{not json");

        let decoded = decode_frame(&frame).unwrap().unwrap();
        assert!(decoded.payload.is_err());
        assert_eq!(decoded.len, frame.len());
    }

    #[test]
    fn test_candidate_dirs_are_unique() {
        let bases = vec![
            PathBuf::from("/tmp"),
            PathBuf::from("/run/user/1000"),
            PathBuf::from("/tmp"),
        ];

        let dirs = candidate_dirs(bases);
        assert_eq!(dirs.len(), 6);
        assert_eq!(dirs.iter().filter(|d| *d == Path::new("/tmp")).count(), 1);
        assert_eq!(dirs[0], PathBuf::from("/tmp/app/com.discordapp.Discord"));
        assert_eq!(dirs[3], PathBuf::from("/run/user/1000/app/com.discordapp.Discord"));
    }

    #[test]
    fn test_decode_frame_rejects_oversized_length() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&OP_FRAME.to_le_bytes());
        frame.extend_from_slice(&(MAX_FRAME_LEN as u32 + 1).to_le_bytes());

        assert!(decode_frame(&frame).is_err());
    }

    #[test]
    fn test_activity_args_shape() {
        let args = activity_args(42, Some(&sample_activity()));

        assert_eq!(args["pid"], 42);
        assert_eq!(args["activity"]["details"], "Hagen Hbf");
        assert_eq!(args["activity"]["state"], "Online, 13:07");
        assert_eq!(args["activity"]["timestamps"]["start"], 1_700_000_000u64);
        assert_eq!(args["activity"]["assets"]["large_image"], "signale");

        let cleared = activity_args(42, None);
        assert!(cleared.get("activity").is_none());
    }

    #[test]
    fn test_handshake_publish_and_error_callback() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("discord-ipc-0");
        let listener = UnixListener::bind(&path).unwrap();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();

            let (opcode, handshake) = read_frame(&mut stream);
            assert_eq!(opcode, OP_HANDSHAKE);
            assert_eq!(handshake["client_id"], "1234");
            write_frame(&mut stream, OP_FRAME, json!({"cmd": "DISPATCH", "evt": "READY"}));

            let (opcode, command) = read_frame(&mut stream);
            assert_eq!(opcode, OP_FRAME);
            assert_eq!(command["cmd"], "SET_ACTIVITY");
            assert_eq!(command["nonce"], "1");
            write_frame(
                &mut stream,
                OP_FRAME,
                json!({"cmd": "SET_ACTIVITY", "evt": "ERROR", "data": {"message": "rate limited"}}),
            );
            command
        });

        let mut ipc = DiscordIpc::connect_at(&path, "1234").unwrap();
        ipc.publish(&sample_activity()).unwrap();

        let command = server.join().unwrap();
        assert_eq!(command["args"]["activity"]["details"], "Hagen Hbf");

        // The error response is only logged; the session stays usable
        let mut result = Ok(());
        for _ in 0..50 {
            result = ipc.run_callbacks();
            if ipc.read_buf.is_empty() && result.is_err() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        // The fake server hung up after its last frame
        assert!(matches!(result, Err(PresenceError::Closed)));
    }

    #[test]
    fn test_malformed_frame_is_dropped_once() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("discord-ipc-0");
        let listener = UnixListener::bind(&path).unwrap();
        let (pong_tx, pong_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            read_frame(&mut stream);
            write_frame(&mut stream, OP_FRAME, json!({"cmd": "DISPATCH", "evt": "READY"}));

            let mut corrupt = Vec::new();
            corrupt.extend_from_slice(&OP_FRAME.to_le_bytes());
            corrupt.extend_from_slice(&9u32.to_le_bytes());
            corrupt.extend_from_slice(b"{not json");
            stream.write_all(&corrupt).unwrap();
            write_frame(&mut stream, OP_PING, json!({"n": 7}));

            pong_tx.send(read_frame(&mut stream)).unwrap();
            // Keep the stream open until the client is done pumping
            release_rx.recv().unwrap();
        });

        let mut ipc = DiscordIpc::connect_at(&path, "1234").unwrap();

        // The corrupt frame is skipped and the ping behind it answered
        let mut pong = None;
        for _ in 0..200 {
            ipc.run_callbacks().unwrap();
            if let Ok(frame) = pong_rx.try_recv() {
                pong = Some(frame);
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        let (opcode, payload) = pong.expect("no PONG received");
        assert_eq!(opcode, OP_PONG);
        assert_eq!(payload["n"], 7);

        // Later pumps see nothing left over
        assert!(ipc.read_buf.is_empty());
        ipc.run_callbacks().unwrap();
        ipc.run_callbacks().unwrap();

        release_tx.send(()).unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_oversized_frame_closes_session() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("discord-ipc-0");
        let listener = UnixListener::bind(&path).unwrap();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            read_frame(&mut stream);
            write_frame(&mut stream, OP_FRAME, json!({"cmd": "DISPATCH", "evt": "READY"}));

            let mut header = Vec::new();
            header.extend_from_slice(&OP_FRAME.to_le_bytes());
            header.extend_from_slice(&(MAX_FRAME_LEN as u32 + 1).to_le_bytes());
            stream.write_all(&header).unwrap();
            release_rx.recv().unwrap();
        });

        let mut ipc = DiscordIpc::connect_at(&path, "1234").unwrap();

        let mut result = Ok(());
        for _ in 0..50 {
            result = ipc.run_callbacks();
            if result.is_err() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert!(matches!(result, Err(PresenceError::Closed)));
        assert!(ipc.read_buf.is_empty());

        release_tx.send(()).unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_handshake_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("discord-ipc-0");
        let listener = UnixListener::bind(&path).unwrap();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            read_frame(&mut stream);
            write_frame(&mut stream, OP_CLOSE, json!({"code": 4000, "message": "Invalid Client ID"}));
        });

        let result = DiscordIpc::connect_at(&path, "nope");
        server.join().unwrap();

        match result {
            Err(PresenceError::Handshake { message }) => assert_eq!(message, "Invalid Client ID"),
            other => panic!("Expected Handshake error, got: {:?}", other),
        }
    }

    #[test]
    fn test_connect_at_missing_socket() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("discord-ipc-0");

        assert!(matches!(
            DiscordIpc::connect_at(&path, "1234"),
            Err(PresenceError::ConnectionFailed { .. })
        ));
    }
}

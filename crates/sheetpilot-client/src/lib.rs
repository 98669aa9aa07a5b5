//! Blocking client for the sheetpilot daemon.
//!
//! The CLI is a short-lived synchronous process, so this client is plain
//! blocking I/O over a `UnixStream`: write one envelope line, read one
//! response line. Remote failures travel inside the [`Response`]; errors
//! here mean the transport itself failed.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use sheetpilot_protocol::envelope::{Request, Response};
use thiserror::Error;

/// Transport-level client failures.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Daemon not reachable at {socket}: {source}. Is sheetpilotd running?")]
    ServiceUnavailable {
        socket: PathBuf,
        source: std::io::Error,
    },

    #[error("I/O error talking to daemon: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// A connection to the daemon. One client may issue any number of
/// request/response cycles; responses come back in request order.
#[derive(Debug)]
pub struct Client {
    reader: BufReader<UnixStream>,
    writer: UnixStream,
}

impl Client {
    /// Connect to the daemon's socket. A refused or missing socket maps to
    /// [`ClientError::ServiceUnavailable`]; starting the daemon is the
    /// caller's decision, not this crate's.
    pub fn connect(socket: &Path) -> Result<Self> {
        let stream = UnixStream::connect(socket).map_err(|source| {
            ClientError::ServiceUnavailable {
                socket: socket.to_path_buf(),
                source,
            }
        })?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self {
            reader,
            writer: stream,
        })
    }

    /// Send one request and wait for its response.
    pub fn call(&mut self, request: &Request) -> Result<Response> {
        let json = serde_json::to_string(request)
            .map_err(|e| ClientError::Protocol(format!("encode request: {e}")))?;
        writeln!(self.writer, "{json}")?;
        self.writer.flush()?;

        let mut line = String::new();
        self.reader.read_line(&mut line)?;
        if line.is_empty() {
            return Err(ClientError::Protocol(
                "daemon closed the connection".to_string(),
            ));
        }
        serde_json::from_str(&line)
            .map_err(|e| ClientError::Protocol(format!("malformed response: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;

    #[test]
    fn connect_without_daemon_is_service_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let err = Client::connect(&dir.path().join("absent.sock")).unwrap_err();
        assert!(matches!(err, ClientError::ServiceUnavailable { .. }));
    }

    #[test]
    fn call_roundtrips_one_envelope() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("test.sock");
        let listener = UnixListener::bind(&socket).unwrap();

        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            let request: Request = serde_json::from_str(&line).unwrap();
            assert_eq!(request.command, "daemon.ping");
            let mut writer = stream;
            writeln!(
                writer,
                "{}",
                serde_json::to_string(&Response::ok(serde_json::json!({"version": "test"})))
                    .unwrap()
            )
            .unwrap();
        });

        let mut client = Client::connect(&socket).unwrap();
        let response = client.call(&Request::bare("daemon.ping")).unwrap();
        assert!(response.success);
        assert_eq!(response.result.unwrap()["version"], "test");
        server.join().unwrap();
    }

    #[test]
    fn truncated_response_is_a_protocol_error() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("test.sock");
        let listener = UnixListener::bind(&socket).unwrap();

        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            // Read the request, then hang up without replying.
            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
        });

        let mut client = Client::connect(&socket).unwrap();
        let err = client.call(&Request::bare("daemon.ping")).unwrap_err();
        assert!(matches!(err, ClientError::Protocol(_)));
        server.join().unwrap();
    }
}

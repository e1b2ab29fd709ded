//! Signature Engine Client
//! =======================
//! Wire client for the external signature engine: a local stream socket
//! speaking newline-terminated JSON, one request and one response per
//! line. Any deviation poisons the connection; the next call reconnects.
//!
//! Copyright © 2025 Stephen Bilodeau. All rights reserved.
//! Licensed under GPL-3.0.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Short engine responses are assumed; reads beyond this are malformed.
const MAX_RESPONSE_BYTES: u64 = 4096;

const ACTION_SCAN: &str = "scan_content";
const STATUS_SUCCESS: &str = "success";
const RESULT_CLEAN: &str = "clean";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine connect to {path} failed: {source}")]
    Connect { path: PathBuf, source: io::Error },

    #[error("engine write failed: {0}")]
    Write(#[source] io::Error),

    #[error("engine read failed: {0}")]
    Read(#[source] io::Error),

    #[error("engine response malformed: {0}")]
    Malformed(String),

    #[error("engine reported status {status:?}: {message}")]
    Failure { status: String, message: String },
}

/// Outcome of one engine request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineVerdict {
    Clean,
    /// The opaque alert JSON, round-tripped verbatim.
    Threat(String),
}

#[derive(Serialize)]
struct ScanFrame<'a> {
    action: &'static str,
    request_id: &'a str,
    content: String,
}

#[derive(Deserialize)]
struct ResponseFrame {
    status: String,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Owns the (lazily established) engine connection. One in-flight request
/// at a time; the caller serialises access.
pub struct EngineClient {
    socket_path: PathBuf,
    stream: Option<UnixStream>,
}

impl EngineClient {
    pub fn new(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            stream: None,
        }
    }

    /// Drop any existing connection and dial the engine now.
    pub fn reconnect(&mut self) -> Result<(), EngineError> {
        self.stream = None;
        self.ensure_connected()?;
        Ok(())
    }

    /// Submit one payload and parse the verdict. On any failure the
    /// connection is poisoned so the next call re-establishes it.
    pub fn scan(&mut self, request_id: &str, content: &[u8]) -> Result<EngineVerdict, EngineError> {
        match self.scan_inner(request_id, content) {
            Ok(verdict) => Ok(verdict),
            Err(err) => {
                self.stream = None;
                Err(err)
            }
        }
    }

    fn scan_inner(
        &mut self,
        request_id: &str,
        content: &[u8],
    ) -> Result<EngineVerdict, EngineError> {
        let stream = self.ensure_connected()?;

        let frame = ScanFrame {
            action: ACTION_SCAN,
            request_id,
            content: BASE64.encode(content),
        };
        let mut line = serde_json::to_string(&frame)
            .map_err(|err| EngineError::Malformed(format!("request serialisation: {err}")))?;
        line.push('\n');
        stream
            .write_all(line.as_bytes())
            .map_err(EngineError::Write)?;

        let mut response = String::new();
        let mut reader = BufReader::new((&*stream).take(MAX_RESPONSE_BYTES));
        reader
            .read_line(&mut response)
            .map_err(EngineError::Read)?;
        if response.is_empty() {
            return Err(EngineError::Read(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "engine closed the connection",
            )));
        }
        if !response.ends_with('\n') {
            return Err(EngineError::Malformed(format!(
                "response not newline-terminated within {MAX_RESPONSE_BYTES} bytes"
            )));
        }

        let parsed: ResponseFrame = serde_json::from_str(response.trim_end())
            .map_err(|err| EngineError::Malformed(err.to_string()))?;
        if parsed.status != STATUS_SUCCESS {
            return Err(EngineError::Failure {
                status: parsed.status,
                message: parsed.error.unwrap_or_default(),
            });
        }
        match parsed.result {
            Some(result) if result == RESULT_CLEAN => Ok(EngineVerdict::Clean),
            Some(alert) => {
                warn!(request_id, "Security: signature engine reported a threat");
                Ok(EngineVerdict::Threat(alert))
            }
            None => Err(EngineError::Malformed(
                "success response missing result field".to_string(),
            )),
        }
    }

    fn ensure_connected(&mut self) -> Result<&mut UnixStream, EngineError> {
        if self.stream.is_none() {
            let stream =
                UnixStream::connect(&self.socket_path).map_err(|source| EngineError::Connect {
                    path: self.socket_path.clone(),
                    source,
                })?;
            debug!(path = %self.socket_path.display(), "connected to signature engine");
            self.stream = Some(stream);
        }
        Ok(self.stream.as_mut().expect("connection established above"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Write};
    use std::os::unix::net::UnixListener;

    /// Serve `responses` (one per request line) on a fresh socket; returns
    /// the socket path and the listener thread handle.
    fn serve_script(
        responses: Vec<String>,
    ) -> (tempfile::TempDir, PathBuf, std::thread::JoinHandle<Vec<String>>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let handle = std::thread::spawn(move || {
            let mut seen = Vec::new();
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut stream = stream;
            for response in responses {
                let mut request = String::new();
                if reader.read_line(&mut request).unwrap() == 0 {
                    break;
                }
                seen.push(request);
                stream.write_all(response.as_bytes()).unwrap();
                stream.write_all(b"\n").unwrap();
            }
            seen
        });
        (dir, path, handle)
    }

    #[test]
    fn clean_verdict_parses() {
        let (_dir, path, handle) =
            serve_script(vec![r#"{"status":"success","result":"clean"}"#.to_string()]);
        let mut client = EngineClient::new(path);
        let verdict = client.scan("req-1", b"hello").unwrap();
        assert_eq!(verdict, EngineVerdict::Clean);

        let requests = handle.join().unwrap();
        let frame: serde_json::Value = serde_json::from_str(&requests[0]).unwrap();
        assert_eq!(frame["action"], "scan_content");
        assert_eq!(frame["request_id"], "req-1");
        assert_eq!(frame["content"], BASE64.encode(b"hello"));
    }

    #[test]
    fn alert_json_round_trips() {
        let alert = r#"{"rule":"X","severity":0.9}"#;
        let (_dir, path, handle) = serve_script(vec![format!(
            r#"{{"status":"success","result":"{}"}}"#,
            alert.replace('"', "\\\"")
        )]);
        let mut client = EngineClient::new(path);
        match client.scan("req-2", b"payload").unwrap() {
            EngineVerdict::Threat(found) => assert_eq!(found, alert),
            other => panic!("expected threat, got {other:?}"),
        }
        handle.join().unwrap();
    }

    #[test]
    fn non_success_status_is_an_error() {
        let (_dir, path, handle) = serve_script(vec![
            r#"{"status":"overloaded","error":"busy"}"#.to_string(),
        ]);
        let mut client = EngineClient::new(path);
        match client.scan("req-3", b"x") {
            Err(EngineError::Failure { status, message }) => {
                assert_eq!(status, "overloaded");
                assert_eq!(message, "busy");
            }
            other => panic!("expected failure, got {other:?}"),
        }
        handle.join().unwrap();
    }

    #[test]
    fn garbage_response_is_malformed() {
        let (_dir, path, handle) = serve_script(vec!["not json at all".to_string()]);
        let mut client = EngineClient::new(path);
        assert!(matches!(
            client.scan("req-4", b"x"),
            Err(EngineError::Malformed(_))
        ));
        handle.join().unwrap();
    }

    #[test]
    fn missing_socket_is_a_connect_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = EngineClient::new(dir.path().join("absent.sock"));
        assert!(matches!(
            client.scan("req-5", b"x"),
            Err(EngineError::Connect { .. })
        ));
    }
}

//! Docker Engine API client over the unix socket.
//!
//! The sensor resolves container ids recovered from cgroup paths into
//! container metadata (name, image, root pid) and follows the engine's
//! event stream to learn about containers starting and stopping. Only the
//! tiny API subset needed for that lives here, spoken directly over
//! `/var/run/docker.sock`.

pub mod dto;

use std::os::unix::prelude::FileTypeExt;

use hyper::{body::HttpBody, Body, StatusCode, Uri};
use hyperlocal::{UnixClientExt, UnixConnector};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

pub use dto::{ContainerEvent, ContainerInfo, DockerInfo};

/// Engine API version every request is pinned to.
const API_PREFIX: &str = "/v1.24";

pub const DEFAULT_SOCKET: &str = "/var/run/docker.sock";

#[derive(Error, Debug)]
pub enum DockerError {
    #[error("'{0}' not found; is the docker daemon running?")]
    SocketNotFound(String),

    #[error("'{0}' is not a unix socket")]
    NotASocket(String),

    #[error("request failed: {0}")]
    Http(#[from] hyper::Error),

    #[error("docker daemon answered {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("malformed response: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct DockerClient {
    socket: String,
    client: hyper::Client<UnixConnector, Body>,
}

impl DockerClient {
    pub fn new() -> Result<Self, DockerError> {
        Self::unix(DEFAULT_SOCKET.to_owned())
    }

    pub fn unix(socket: String) -> Result<Self, DockerError> {
        match std::fs::metadata(&socket) {
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(DockerError::SocketNotFound(socket));
            }
            Err(_) => {}
            Ok(metadata) => {
                if !metadata.file_type().is_socket() {
                    return Err(DockerError::NotASocket(socket));
                }
            }
        }
        Ok(Self {
            socket,
            client: hyper::Client::unix(),
        })
    }

    fn uri(&self, path: &str) -> Uri {
        hyperlocal::Uri::new(&self.socket, &format!("{API_PREFIX}{path}")).into()
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, DockerError> {
        let response = self.client.get(self.uri(path)).await?;
        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body()).await?;
        if !status.is_success() {
            return Err(DockerError::Status {
                status,
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Engine version, OS and counts.
    pub async fn info(&self) -> Result<DockerInfo, DockerError> {
        self.get("/info").await
    }

    /// Resolves a container id (as recovered from a cgroup path) into its
    /// metadata.
    pub async fn inspect_container(&self, id: &str) -> Result<ContainerInfo, DockerError> {
        self.get(&format!("/containers/{id}/json")).await
    }

    /// Follows the engine's event stream. Events arrive on the returned
    /// stream until [`EventStream::cancel`] is called or the stream is
    /// dropped.
    pub async fn events(&self, buffer: usize) -> Result<EventStream, DockerError> {
        let response = self.client.get(self.uri("/events")).await?;
        let status = response.status();
        if !status.is_success() {
            let bytes = hyper::body::to_bytes(response.into_body()).await?;
            return Err(DockerError::Status {
                status,
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }

        let mut body = response.into_body();
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let (cancel, mut cancelled) = watch::channel(());
        tokio::spawn(async move {
            let mut pending = Vec::new();
            loop {
                tokio::select! {
                    _ = cancelled.changed() => break,
                    chunk = body.data() => match chunk {
                        Some(Ok(bytes)) => {
                            pending.extend_from_slice(&bytes);
                            for line in take_lines(&mut pending) {
                                match serde_json::from_str::<ContainerEvent>(&line) {
                                    Ok(event) => {
                                        if tx.send(event).await.is_err() {
                                            return;
                                        }
                                    }
                                    Err(err) => log::warn!("skipping event line: {err}"),
                                }
                            }
                        }
                        Some(Err(err)) => {
                            log::warn!("docker event stream failed: {err}");
                            break;
                        }
                        None => break,
                    },
                }
            }
        });
        Ok(EventStream { rx, cancel })
    }
}

/// A live `/events` subscription. Dropping it (or calling
/// [`cancel`](Self::cancel)) tears the underlying request down.
pub struct EventStream {
    rx: mpsc::Receiver<ContainerEvent>,
    cancel: watch::Sender<()>,
}

impl EventStream {
    /// The next event, or `None` once the stream has ended.
    pub async fn next(&mut self) -> Option<ContainerEvent> {
        self.rx.recv().await
    }

    pub fn cancel(self) {
        let _ = self.cancel.send(());
    }
}

/// Splits complete newline-terminated lines off the front of `pending`,
/// leaving any partial trailing line in place.
fn take_lines(pending: &mut Vec<u8>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
        let rest = pending.split_off(pos + 1);
        let mut line = std::mem::replace(pending, rest);
        line.pop(); // the newline
        if !line.is_empty() {
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_lines_handles_partial_chunks() {
        let mut pending = Vec::new();
        pending.extend_from_slice(b"{\"Type\":\"container\"}\n{\"Type\":\"net");
        let lines = take_lines(&mut pending);
        assert_eq!(lines, vec!["{\"Type\":\"container\"}"]);
        assert_eq!(pending, b"{\"Type\":\"net");

        pending.extend_from_slice(b"work\"}\n");
        let lines = take_lines(&mut pending);
        assert_eq!(lines, vec!["{\"Type\":\"network\"}"]);
        assert!(pending.is_empty());
    }

    #[test]
    fn take_lines_skips_keepalive_blank_lines() {
        let mut pending = b"\n\n{\"Type\":\"container\"}\n".to_vec();
        let lines = take_lines(&mut pending);
        assert_eq!(lines.len(), 1);
    }

    #[test]
    fn missing_socket_is_reported() {
        match DockerClient::unix("/nonexistent/docker.sock".to_string()) {
            Err(DockerError::SocketNotFound(path)) => {
                assert_eq!(path, "/nonexistent/docker.sock")
            }
            other => panic!("expected SocketNotFound, got {other:?}"),
        }
    }

    #[test]
    fn non_socket_path_is_rejected() {
        let path = std::env::temp_dir().join(format!("argus-docker-{}", std::process::id()));
        std::fs::write(&path, b"").unwrap();
        let result = DockerClient::unix(path.display().to_string());
        std::fs::remove_file(&path).unwrap();
        match result {
            Err(DockerError::NotASocket(_)) => {}
            other => panic!("expected NotASocket, got {other:?}"),
        }
    }
}

//! Local control plane: a UNIX stream socket speaking newline-delimited
//! JSON, one request per connection. Mutating commands serialise on the
//! supervisor through the command channel.

use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use vigil_protocol::control::{ControlRequest, ControlResponse};

/// A connection has this long to deliver its request and read the reply.
const CONNECTION_DEADLINE: Duration = Duration::from_secs(30);

pub type CommandSender = mpsc::Sender<(ControlRequest, oneshot::Sender<ControlResponse>)>;
pub type CommandReceiver = mpsc::Receiver<(ControlRequest, oneshot::Sender<ControlResponse>)>;

pub struct ControlServer {
    path: PathBuf,
    task: Option<JoinHandle<()>>,
}

impl ControlServer {
    /// Bind the socket, replacing a stale file from a previous run.
    pub fn bind(path: PathBuf, commands: CommandSender) -> std::io::Result<Self> {
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(&path)?;
        info!(path = %path.display(), "control socket bound");
        let task = tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(error) => {
                        warn!(%error, "control accept failed");
                        continue;
                    }
                };
                let commands = commands.clone();
                tokio::spawn(async move {
                    if tokio::time::timeout(
                        CONNECTION_DEADLINE,
                        serve_connection(stream, commands),
                    )
                    .await
                    .is_err()
                    {
                        debug!("control connection timed out");
                    }
                });
            }
        });
        Ok(Self {
            path,
            task: Some(task),
        })
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        let _ = std::fs::remove_file(&self.path);
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn serve_connection(stream: UnixStream, commands: CommandSender) {
    let (read_half, mut write_half) = stream.into_split();
    let mut line = String::new();
    if BufReader::new(read_half).read_line(&mut line).await.is_err() {
        return;
    }

    let response = match serde_json::from_str::<ControlRequest>(line.trim()) {
        Ok(request) => {
            let (reply_tx, reply_rx) = oneshot::channel();
            if commands.send((request, reply_tx)).await.is_err() {
                ControlResponse::err("daemon is shutting down")
            } else {
                match reply_rx.await {
                    Ok(response) => response,
                    Err(_) => ControlResponse::err("daemon dropped the request"),
                }
            }
        }
        Err(error) => ControlResponse::err(format!("unrecognised command: {error}")),
    };

    let mut payload = match serde_json::to_vec(&response) {
        Ok(payload) => payload,
        Err(_) => return,
    };
    payload.push(b'\n');
    let _ = write_half.write_all(&payload).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn roundtrip(path: &std::path::Path, line: &str) -> ControlResponse {
        let stream = UnixStream::connect(path).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        write_half.write_all(line.as_bytes()).await.unwrap();
        write_half.write_all(b"\n").await.unwrap();
        let mut reply = String::new();
        BufReader::new(read_half).read_line(&mut reply).await.unwrap();
        serde_json::from_str(&reply).unwrap()
    }

    #[tokio::test]
    async fn requests_are_relayed_and_answered() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.sock");
        let (tx, mut rx) = mpsc::channel(8);
        let mut server = ControlServer::bind(path.clone(), tx).unwrap();

        tokio::spawn(async move {
            while let Some((request, reply)) = rx.recv().await {
                assert_eq!(request, ControlRequest::Status);
                let _ = reply.send(ControlResponse::ok_with_message("alive"));
            }
        });

        let response = roundtrip(&path, r#"{"command":"status"}"#).await;
        assert!(response.success);
        assert_eq!(response.message.as_deref(), Some("alive"));
        server.stop();
    }

    #[tokio::test]
    async fn malformed_request_yields_an_error_response() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.sock");
        let (tx, _rx) = mpsc::channel(8);
        let mut server = ControlServer::bind(path.clone(), tx).unwrap();

        let response = roundtrip(&path, r#"{"command":"self-destruct"}"#).await;
        assert!(!response.success);
        assert!(response.error.unwrap().contains("unrecognised"));
        server.stop();
    }

    #[tokio::test]
    async fn socket_file_is_removed_on_stop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.sock");
        let (tx, _rx) = mpsc::channel(8);
        let mut server = ControlServer::bind(path.clone(), tx).unwrap();
        assert!(path.exists());
        server.stop();
        assert!(!path.exists());
    }
}

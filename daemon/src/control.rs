//! Local control socket.
//!
//! Menus, tray renderers and the CLI talk to the daemon over a Unix socket with
//! one JSON request per line and one JSON response per line. Requests are
//! forwarded to the control loop as [`DaemonEvent::Control`] so every state
//! change stays serialized there.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::checker::{CheckHandle, CheckResult, CheckStatus};
use crate::event::DaemonEvent;
use crate::status::DaemonStatus;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
    /// Check now and wait for the outcome.
    Check,
    /// Open the upgrade terminal.
    Upgrade,
    /// Dismiss the updates-available alert.
    Clear,
    SetInterval { secs: u64 },
    Status,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Response {
    Ok { message: String },
    Status { status: DaemonStatus },
    Error { message: String },
}

impl Response {
    pub fn ok(message: impl Into<String>) -> Self {
        Self::Ok {
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

/// What the control loop hands back for a request.
pub enum ControlReply {
    Ready(Response),
    /// The request joined or started a check; the connection waits for it off
    /// the control loop.
    Checking(CheckHandle),
}

/// Turns a finished check into the reply sent to the client.
pub fn describe_check(result: &CheckResult) -> Response {
    match &result.status {
        CheckStatus::Success(updates) if updates.is_empty() => {
            Response::ok("No updates available")
        }
        CheckStatus::Success(updates) => {
            let mut message = match updates.len() {
                1 => "1 update available".to_string(),
                n => format!("{n} updates available"),
            };
            for update in updates {
                message.push_str(&format!("\n  {update}"));
            }
            Response::Ok { message }
        }
        CheckStatus::Failure(reason) => Response::error(format!("Check failed: {reason}")),
    }
}

/// Binds the control socket at `path`, replacing a stale socket file.
/// Only called while holding the instance lock, so any existing file is stale.
pub fn bind(path: &Path) -> Result<UnixListener> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    remove_socket(path);
    UnixListener::bind(path)
        .with_context(|| format!("Failed to bind control socket {}", path.display()))
}

pub fn remove_socket(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove control socket {}: {e}", path.display());
        }
    }
}

/// Accepts connections until the task is dropped.
pub async fn serve(listener: UnixListener, events: mpsc::Sender<DaemonEvent>) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let events = events.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, events).await {
                        debug!("Control connection ended: {e:#}");
                    }
                });
            }
            Err(e) => {
                warn!("Failed to accept control connection: {e}");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}

async fn handle_connection(stream: UnixStream, events: mpsc::Sender<DaemonEvent>) -> Result<()> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => {
                debug!("Control request: {request:?}");
                dispatch(request, &events).await
            }
            Err(e) => Response::error(format!("Invalid request: {e}")),
        };
        let mut out = serde_json::to_string(&response)?;
        out.push('\n');
        write.write_all(out.as_bytes()).await?;
    }
    Ok(())
}

async fn dispatch(request: Request, events: &mpsc::Sender<DaemonEvent>) -> Response {
    let (reply_tx, reply_rx) = oneshot::channel();
    if events
        .send(DaemonEvent::Control(request, reply_tx))
        .await
        .is_err()
    {
        return Response::error("Daemon is shutting down");
    }
    match reply_rx.await {
        Ok(ControlReply::Ready(response)) => response,
        Ok(ControlReply::Checking(handle)) => describe_check(&handle.wait().await),
        Err(_) => Response::error("Daemon is shutting down"),
    }
}

/// Sends one request to a running daemon and returns its response.
pub async fn send(path: &Path, request: &Request) -> Result<Response> {
    let stream = UnixStream::connect(path).await.with_context(|| {
        format!(
            "Failed to connect to {}; is the daemon running?",
            path.display()
        )
    })?;
    let (read, mut write) = stream.into_split();

    let mut line = serde_json::to_string(request)?;
    line.push('\n');
    write.write_all(line.as_bytes()).await?;

    let mut lines = BufReader::new(read).lines();
    match lines.next_line().await? {
        Some(reply) => serde_json::from_str(&reply)
            .with_context(|| format!("Unexpected reply from daemon: {reply}")),
        None => bail!("Daemon closed the connection without replying"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checker::{CheckerConfig, CommandSpec, UpdateChecker};
    use std::sync::Arc;
    use std::time::Duration;

    /// Stands in for the control loop: answers every request except `check`
    /// with an echo of the request, and runs checks on `checker`.
    fn fake_loop(checker: Arc<UpdateChecker>) -> mpsc::Sender<DaemonEvent> {
        let (tx, mut rx) = mpsc::channel(8);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let DaemonEvent::Control(request, reply) = event {
                    let answer = match request {
                        Request::Check => ControlReply::Checking(checker.check()),
                        other => ControlReply::Ready(Response::ok(format!("{other:?}"))),
                    };
                    let _ = reply.send(answer);
                }
            }
        });
        tx
    }

    fn checker(query: &str) -> Arc<UpdateChecker> {
        Arc::new(UpdateChecker::new(CheckerConfig {
            sync: None,
            query: CommandSpec::new("sh", &["-c", query]),
            sync_timeout: Duration::from_secs(5),
            query_timeout: Duration::from_secs(5),
        }))
    }

    fn serve_fake(dir: &Path, query: &str) -> std::path::PathBuf {
        let path = dir.join("run").join("control.sock");
        let listener = bind(&path).unwrap();
        tokio::spawn(serve(listener, fake_loop(checker(query))));
        path
    }

    // ── wire format ───────────────────────────────────────────────────────────

    #[test]
    fn requests_are_tagged_json() {
        assert_eq!(serde_json::to_string(&Request::Check).unwrap(), r#"{"cmd":"check"}"#);
        assert_eq!(
            serde_json::to_string(&Request::SetInterval { secs: 1_800 }).unwrap(),
            r#"{"cmd":"set_interval","secs":1800}"#
        );
        let parsed: Request = serde_json::from_str(r#"{"cmd":"clear"}"#).unwrap();
        assert_eq!(parsed, Request::Clear);
    }

    #[test]
    fn describe_check_outcomes() {
        use crate::checker::{CheckFailure, PendingUpdate};

        let none = CheckResult {
            status: CheckStatus::Success(Vec::new()),
            observed_at: chrono::Utc::now(),
        };
        assert_eq!(describe_check(&none), Response::ok("No updates available"));

        let some = CheckResult {
            status: CheckStatus::Success(vec![PendingUpdate {
                name: "vim".into(),
                current: "9.0-1".into(),
                available: "9.1-1".into(),
            }]),
            observed_at: chrono::Utc::now(),
        };
        assert_eq!(
            describe_check(&some),
            Response::ok("1 update available\n  vim 9.0-1 -> 9.1-1")
        );

        let failed = CheckResult::failure(CheckFailure::Cancelled);
        assert!(matches!(describe_check(&failed), Response::Error { .. }));
    }

    // ── socket ────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn client_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = serve_fake(dir.path(), "true");

        let reply = send(&path, &Request::SetInterval { secs: 7_200 }).await.unwrap();
        assert_eq!(reply, Response::ok("SetInterval { secs: 7200 }"));
    }

    #[tokio::test]
    async fn check_request_waits_for_result() {
        let dir = tempfile::tempdir().unwrap();
        let path = serve_fake(dir.path(), "sleep 0.2; echo 'git 2.42-1 -> 2.43-1'");

        let reply = send(&path, &Request::Check).await.unwrap();
        assert_eq!(
            reply,
            Response::ok("1 update available\n  git 2.42-1 -> 2.43-1")
        );
    }

    #[tokio::test]
    async fn malformed_line_gets_error_and_connection_stays_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = serve_fake(dir.path(), "true");

        let stream = UnixStream::connect(&path).await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        write.write_all(b"not json\n").await.unwrap();
        let first: Response = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert!(matches!(first, Response::Error { .. }));

        write.write_all(b"{\"cmd\":\"status\"}\n").await.unwrap();
        let second: Response =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(second, Response::ok("Status"));
    }

    #[tokio::test]
    async fn stopped_loop_reports_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.sock");
        let listener = bind(&path).unwrap();
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        tokio::spawn(serve(listener, tx));

        let reply = send(&path, &Request::Clear).await.unwrap();
        assert_eq!(reply, Response::error("Daemon is shutting down"));
    }

    #[tokio::test]
    async fn bind_replaces_stale_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.sock");
        std::fs::write(&path, "stale").unwrap();
        assert!(bind(&path).is_ok());
    }

    #[tokio::test]
    async fn send_without_daemon_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = send(&dir.path().join("missing.sock"), &Request::Status)
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("is the daemon running"));
    }
}

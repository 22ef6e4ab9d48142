use crate::error::{TransportError, TransportResult};
use crate::frame::Frame;
use crate::{ConnState, Transport};

use async_trait::async_trait;
use parking_lot::Mutex as StdMutex;
use std::collections::HashMap;
use std::process::Stdio as StdStdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex as TokioMutex};

/// Configuration for a stdio subprocess transport. Newline-delimited
/// framing: one JSON value per line in both directions.
#[derive(Debug, Clone)]
pub struct StdioConfig {
    pub command: String,
    pub args: Vec<String>,
    pub working_directory: Option<String>,
    pub environment: Vec<(String, String)>,
    pub startup_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub max_message_size: usize,
}

impl Default for StdioConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            working_directory: None,
            environment: Vec::new(),
            startup_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(10),
            max_message_size: 10 * 1024 * 1024,
        }
    }
}

/// Pending call awaiting a response line. Correlation id is caller-assigned
/// since frames are opaque; callers embed their own id in the payload and
/// hand us a matching key.
struct Pending {
    reply: oneshot::Sender<Frame>,
}

/// Stdio transport over a child process, one process per [`crate::Transport`]
/// instance. Interior mutability is split the way a hybrid sync/async
/// transport needs it: `child` crosses `.await` points so it lives behind a
/// tokio mutex, `state` never does so it stays behind a plain mutex with
/// short critical sections.
pub struct StdioTransport {
    config: StdioConfig,
    child: Arc<TokioMutex<Option<Child>>>,
    state: Arc<StdMutex<ConnState>>,
    stdin_tx: Arc<TokioMutex<Option<mpsc::Sender<Vec<u8>>>>>,
    pending: Arc<StdMutex<HashMap<u64, Pending>>>,
    notifications_tx: Arc<StdMutex<Vec<mpsc::Sender<Frame>>>>,
    next_call_id: Arc<std::sync::atomic::AtomicU64>,
    reader_task: Arc<TokioMutex<Option<tokio::task::JoinHandle<()>>>>,
    writer_task: Arc<TokioMutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl std::fmt::Debug for StdioTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioTransport")
            .field("command", &self.config.command)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl StdioTransport {
    pub fn new(config: StdioConfig) -> Self {
        Self {
            config,
            child: Arc::new(TokioMutex::new(None)),
            state: Arc::new(StdMutex::new(ConnState::NotStarted)),
            stdin_tx: Arc::new(TokioMutex::new(None)),
            pending: Arc::new(StdMutex::new(HashMap::new())),
            notifications_tx: Arc::new(StdMutex::new(Vec::new())),
            next_call_id: Arc::new(std::sync::atomic::AtomicU64::new(1)),
            reader_task: Arc::new(TokioMutex::new(None)),
            writer_task: Arc::new(TokioMutex::new(None)),
        }
    }

    fn set_state(&self, s: ConnState) {
        *self.state.lock() = s;
    }

    async fn spawn_process(&self) -> TransportResult<()> {
        if self.config.command.is_empty() {
            return Err(TransportError::StartupFailed(
                "empty command".to_string(),
            ));
        }

        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .stdin(StdStdio::piped())
            .stdout(StdStdio::piped())
            .stderr(StdStdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_directory {
            cmd.current_dir(dir);
        }
        for (k, v) in &self.config.environment {
            cmd.env(k, v);
        }

        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                TransportError::ExecutableNotFound(self.config.command.clone())
            }
            std::io::ErrorKind::PermissionDenied => {
                TransportError::PermissionDenied(self.config.command.clone())
            }
            _ => TransportError::Io(e),
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::StartupFailed("missing stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::StartupFailed("missing stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TransportError::StartupFailed("missing stderr".into()))?;

        let (stdin_tx, mut stdin_rx) = mpsc::channel::<Vec<u8>>(64);
        let writer = tokio::spawn(async move {
            let mut writer = BufWriter::new(stdin);
            while let Some(line) = stdin_rx.recv().await {
                if writer.write_all(&line).await.is_err() {
                    break;
                }
                if writer.write_all(b"\n").await.is_err() {
                    break;
                }
                if writer.flush().await.is_err() {
                    break;
                }
            }
        });

        let pending = Arc::clone(&self.pending);
        let notifications = Arc::clone(&self.notifications_tx);
        let max_size = self.config.max_message_size;
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.len() > max_size {
                            tracing::warn!(size = line.len(), "dropping oversized provider line");
                            continue;
                        }
                        Self::dispatch_line(&pending, &notifications, line).await;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "stdio reader failed");
                        break;
                    }
                }
            }
        });

        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(provider_stderr = %line);
            }
        });

        *self.child.lock().await = Some(child);
        *self.stdin_tx.lock().await = Some(stdin_tx);
        *self.reader_task.lock().await = Some(reader);
        *self.writer_task.lock().await = Some(writer);
        Ok(())
    }

    async fn dispatch_line(
        pending: &Arc<StdMutex<HashMap<u64, Pending>>>,
        notifications: &Arc<StdMutex<Vec<mpsc::Sender<Frame>>>>,
        line: String,
    ) {
        // Correlation id, if any, is the caller's concern; without a parsed
        // protocol we fan every inbound line out to the oldest pending call
        // first (FIFO), falling back to notification subscribers.
        let maybe_key = {
            let mut guard = pending.lock();
            guard.keys().next().copied()
        };
        if let Some(key) = maybe_key {
            let sender = pending.lock().remove(&key);
            if let Some(p) = sender {
                let _ = p.reply.send(Frame::new(line.into_bytes()));
                return;
            }
        }
        let frame = Frame::new(line.into_bytes());
        let subs = notifications.lock().clone();
        for tx in subs {
            let _ = tx.try_send(frame.clone());
        }
    }

    async fn wait_ready(&self) -> TransportResult<()> {
        let mut guard = self.child.lock().await;
        match guard.as_mut() {
            Some(child) => match child.try_wait() {
                Ok(Some(status)) => Err(TransportError::Crash(format!(
                    "process exited during startup: {status}"
                ))),
                Ok(None) => Ok(()),
                Err(e) => Err(TransportError::Io(e)),
            },
            None => Err(TransportError::StartupFailed("no child process".into())),
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn start(&self) -> TransportResult<()> {
        {
            let state = *self.state.lock();
            if state != ConnState::NotStarted {
                return Err(TransportError::StartupFailed(
                    "transport already started".into(),
                ));
            }
        }
        self.set_state(ConnState::Connecting);

        let result = tokio::time::timeout(self.config.startup_timeout, async {
            self.spawn_process().await?;
            self.wait_ready().await
        })
        .await;

        match result {
            Ok(Ok(())) => {
                self.set_state(ConnState::Open);
                Ok(())
            }
            Ok(Err(e)) => {
                self.set_state(ConnState::Closed);
                let _ = self.close().await;
                Err(e)
            }
            Err(_) => {
                self.set_state(ConnState::Closed);
                let _ = self.close().await;
                Err(TransportError::Timeout(self.config.startup_timeout))
            }
        }
    }

    async fn call(&self, frame: Frame, timeout: Duration) -> TransportResult<Frame> {
        if self.state() != ConnState::Open {
            return Err(TransportError::Closed);
        }
        let id = self
            .next_call_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().insert(id, Pending { reply: reply_tx });

        let tx = {
            let guard = self.stdin_tx.lock().await;
            guard.clone().ok_or(TransportError::Closed)?
        };
        tx.send(frame.as_bytes().to_vec())
            .await
            .map_err(|_| TransportError::Closed)?;

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => {
                self.pending.lock().remove(&id);
                Err(TransportError::Closed)
            }
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(TransportError::Timeout(timeout))
            }
        }
    }

    async fn notify(&self, frame: Frame) -> TransportResult<()> {
        if self.state() != ConnState::Open {
            return Err(TransportError::Closed);
        }
        let tx = {
            let guard = self.stdin_tx.lock().await;
            guard.clone().ok_or(TransportError::Closed)?
        };
        tx.send(frame.as_bytes().to_vec())
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn notifications(&self) -> TransportResult<mpsc::Receiver<Frame>> {
        let (tx, rx) = mpsc::channel(64);
        self.notifications_tx.lock().push(tx);
        Ok(rx)
    }

    fn state(&self) -> ConnState {
        *self.state.lock()
    }

    async fn close(&self) -> TransportResult<()> {
        {
            let state = *self.state.lock();
            if state == ConnState::Closed {
                return Ok(());
            }
        }
        self.set_state(ConnState::Closing);

        *self.stdin_tx.lock().await = None;
        if let Some(task) = self.writer_task.lock().await.take() {
            task.abort();
        }
        if let Some(task) = self.reader_task.lock().await.take() {
            task.abort();
        }

        let mut guard = self.child.lock().await;
        if let Some(child) = guard.as_mut() {
            let _ = child.start_kill();
            match tokio::time::timeout(self.config.shutdown_timeout, child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    let _ = child.kill().await;
                }
            }
        }
        *guard = None;

        self.set_state(ConnState::Closed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_timeouts() {
        let cfg = StdioConfig::default();
        assert_eq!(cfg.startup_timeout, Duration::from_secs(30));
        assert_eq!(cfg.shutdown_timeout, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn empty_command_fails_fast() {
        let transport = StdioTransport::new(StdioConfig::default());
        let err = transport.start().await.unwrap_err();
        assert!(matches!(err, TransportError::StartupFailed(_)));
    }

    #[tokio::test]
    async fn nonexistent_executable_reports_not_found() {
        let mut cfg = StdioConfig::default();
        cfg.command = "definitely-not-a-real-binary-xyz".to_string();
        let transport = StdioTransport::new(cfg);
        let err = transport.start().await.unwrap_err();
        assert!(matches!(err, TransportError::ExecutableNotFound(_)));
    }

    #[tokio::test]
    #[cfg_attr(not(unix), ignore)]
    async fn echoes_a_line_round_trip() {
        let mut cfg = StdioConfig::default();
        cfg.command = "cat".to_string();
        let transport = StdioTransport::new(cfg);
        transport.start().await.expect("cat should start");
        assert_eq!(transport.state(), ConnState::Open);
        transport.close().await.expect("close should succeed");
        assert_eq!(transport.state(), ConnState::Closed);
    }
}

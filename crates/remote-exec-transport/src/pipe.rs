//! NDJSON transport over a subprocess's standard streams.

use std::{
    collections::HashMap,
    process::Stdio,
    sync::{
        Arc, Mutex as StdMutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use command_group::{AsyncCommandGroup, AsyncGroupChild};
use futures::{SinkExt, StreamExt};
use remote_exec_core::{CommandBuilder, Inbound, Message, Transport, TransportError};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader},
    process::{ChildStderr, Command},
    sync::{Mutex, mpsc, watch},
    task::JoinHandle,
};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::NdjsonCodec;

/// How long a spawned peer gets to announce itself before writes proceed anyway.
pub const READY_GRACE: Duration = Duration::from_millis(200);

type Writer = FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, NdjsonCodec>;

/// Transport speaking NDJSON over a byte stream pair.
///
/// Spawned peers run in their own process group, which [`Transport::close`]
/// kills. Writes to a freshly spawned peer wait until it has sent its first
/// frame or [`READY_GRACE`] has passed.
pub struct PipeTransport {
    writer: Mutex<Option<Writer>>,
    inbound: StdMutex<Option<Inbound>>,
    ready: watch::Receiver<bool>,
    child: Mutex<Option<AsyncGroupChild>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl PipeTransport {
    /// Spawn `command` (shell-style, split into program and arguments) with
    /// extra `args` appended and `env` added to the inherited environment.
    ///
    /// # Errors
    /// Returns error if the command cannot be parsed, resolved, or started.
    pub async fn spawn(command: &str, args: &[String], env: &HashMap<String, String>) -> Result<Self, TransportError> {
        let parts = CommandBuilder::new(command)
            .params(args.iter().cloned())
            .build()
            .map_err(|e| TransportError::Spawn(e.to_string()))?;
        let (program, args) = parts
            .into_resolved()
            .await
            .map_err(|e| TransportError::Spawn(e.to_string()))?;

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .group_spawn()
            .map_err(|e| TransportError::Spawn(format!("{}: {e}", program.display())))?;

        let inner = child.inner();
        let (Some(stdin), Some(stdout), stderr) = (inner.stdin.take(), inner.stdout.take(), inner.stderr.take())
        else {
            if let Err(e) = child.kill().await {
                tracing::debug!("Failed to kill peer after stdio setup failure: {e}");
            }
            return Err(TransportError::Spawn("peer stdio unavailable".to_owned()));
        };

        tracing::info!(program = %program.display(), pid = ?child.id(), "Spawned peer process");
        Ok(Self::start(stdout, stdin, Some(child), stderr, false))
    }

    /// Wrap an existing reader/writer pair, such as the process's own stdio.
    ///
    /// The peer is assumed ready immediately.
    #[must_use]
    pub fn from_streams<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::start(reader, writer, None, None, true)
    }

    fn start<R, W>(
        reader: R,
        writer: W,
        child: Option<AsyncGroupChild>,
        stderr: Option<ChildStderr>,
        ready_now: bool,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (ready_tx, ready_rx) = watch::channel(ready_now);
        let ready_tx = Arc::new(ready_tx);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let mut tasks = Vec::with_capacity(3);

        tasks.push(tokio::spawn(read_frames(reader, inbound_tx, Arc::clone(&ready_tx))));

        if !ready_now {
            tasks.push(tokio::spawn(async move {
                tokio::time::sleep(READY_GRACE).await;
                if !ready_tx.send_replace(true) {
                    tracing::debug!("Peer silent during grace period, proceeding");
                }
            }));
        }

        if let Some(stderr) = stderr {
            tasks.push(tokio::spawn(forward_stderr(stderr)));
        }

        let writer: Box<dyn AsyncWrite + Send + Unpin> = Box::new(writer);
        Self {
            writer: Mutex::new(Some(FramedWrite::new(writer, NdjsonCodec::new()))),
            inbound: StdMutex::new(Some(inbound_rx)),
            ready: ready_rx,
            child: Mutex::new(child),
            tasks: StdMutex::new(tasks),
            closed: AtomicBool::new(false),
        }
    }

    /// Whether the peer has sent a frame or its grace period has passed.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }
}

async fn read_frames<R>(reader: R, tx: mpsc::UnboundedSender<Message>, ready: Arc<watch::Sender<bool>>)
where
    R: AsyncRead + Unpin,
{
    let mut frames = FramedRead::new(reader, NdjsonCodec::new());
    while let Some(frame) = frames.next().await {
        match frame {
            Ok(message) => {
                ready.send_replace(true);
                if tx.send(message).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!("Peer stream read failed: {e}");
                break;
            }
        }
    }
    tracing::debug!("Peer stream ended");
}

async fn forward_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => tracing::debug!(target: "remote_exec_transport::peer", "{line}"),
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("Peer stderr read failed: {e}");
                break;
            }
        }
    }
}

#[async_trait]
impl Transport for PipeTransport {
    async fn send(&self, message: Message) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let mut ready = self.ready.clone();
        ready.wait_for(|ready| *ready).await.map_err(|_| TransportError::Closed)?;

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::Closed)?;
        writer.send(message).await
    }

    fn subscribe(&self) -> Result<Inbound, TransportError> {
        self.inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(TransportError::AlreadySubscribed)
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        // A send blocked on a full pipe holds the writer; killing the peer
        // fails that write, so the writer is only dropped when it is free.
        match self.writer.try_lock() {
            Ok(mut writer) => drop(writer.take()),
            Err(_) => tracing::debug!("Peer input busy, closing it by killing the peer"),
        }

        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                tracing::debug!("Failed to kill peer process group: {e}");
            }
            match child.wait().await {
                Ok(status) => tracing::debug!(%status, "Peer process exited"),
                Err(e) => tracing::debug!("Failed to reap peer process: {e}"),
            }
        }

        for task in self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
        Ok(())
    }
}

impl Drop for PipeTransport {
    fn drop(&mut self) {
        if let Some(child) = self.child.get_mut().as_mut() {
            if let Err(e) = child.start_kill() {
                tracing::trace!("Peer already gone on drop: {e}");
            }
        }
        for task in self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner).drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use remote_exec_core::Response;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn test_streams_round_trip() {
        let (local, remote) = tokio::io::duplex(4096);
        let (local_read, local_write) = tokio::io::split(local);
        let transport = PipeTransport::from_streams(local_read, local_write);
        let mut inbound = transport.subscribe().unwrap();
        let (mut remote_read, mut remote_write) = tokio::io::split(remote);

        transport.send(Message::request(1_i64, "ping", None)).await.unwrap();
        let mut buf = vec![0u8; 256];
        let n = remote_read.read(&mut buf).await.unwrap();
        let line = std::str::from_utf8(&buf[..n]).unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(serde_json::from_str::<Message>(line).unwrap().method(), Some("ping"));

        remote_write
            .write_all(b"garbage\n{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}\n")
            .await
            .unwrap();
        let Some(Message::Response(response)) = inbound.recv().await else {
            panic!("expected response");
        };
        assert_eq!(response, Response::success(1_i64.into(), json!({})));
    }

    #[tokio::test]
    async fn test_frames_split_across_reads() {
        let reader = tokio_test::io::Builder::new()
            .read(b"{\"jsonrpc\":\"2.0\",\"met")
            .read(b"hod\":\"first\"}\n\n")
            .read(b"{\"jsonrpc\":\"2.0\",\"method\":\"second\"}\n")
            .build();
        let (_sink, writer) = tokio::io::duplex(64);
        let transport = PipeTransport::from_streams(reader, writer);
        let mut inbound = transport.subscribe().unwrap();

        assert_eq!(inbound.recv().await.unwrap().method(), Some("first"));
        assert_eq!(inbound.recv().await.unwrap().method(), Some("second"));
        assert!(inbound.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_close_ends_inbound() {
        let (local, _remote) = tokio::io::duplex(64);
        let (r, w) = tokio::io::split(local);
        let transport = PipeTransport::from_streams(r, w);
        let mut inbound = transport.subscribe().unwrap();

        transport.close().await.unwrap();
        transport.close().await.unwrap();
        assert!(inbound.recv().await.is_none());
        assert!(matches!(
            transport.send(Message::notification("late", None)).await,
            Err(TransportError::Closed)
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawned_peer_echoes() {
        let transport = PipeTransport::spawn("cat", &[], &HashMap::new()).await.unwrap();
        let mut inbound = transport.subscribe().unwrap();
        assert!(!transport.is_ready());

        let started = Instant::now();
        transport
            .send(Message::notification("hello", Some(json!({"n": 1}))))
            .await
            .unwrap();
        assert!(started.elapsed() >= READY_GRACE / 2);

        let echoed = inbound.recv().await.unwrap();
        assert_eq!(echoed.method(), Some("hello"));
        assert!(transport.is_ready());

        transport.close().await.unwrap();
        assert!(inbound.recv().await.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_first_frame_signals_ready() {
        let args = vec!["-c".to_owned(), r#"echo '{"jsonrpc":"2.0","method":"ready"}'; cat"#.to_owned()];
        let transport = PipeTransport::spawn("sh", &args, &HashMap::new()).await.unwrap();
        let mut inbound = transport.subscribe().unwrap();

        assert_eq!(inbound.recv().await.unwrap().method(), Some("ready"));
        assert!(transport.is_ready());

        let started = Instant::now();
        transport.send(Message::notification("fast", None)).await.unwrap();
        assert!(started.elapsed() < READY_GRACE);
        transport.close().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_env_passed_to_peer() {
        let args = vec![
            "-c".to_owned(),
            r#"printf '{"jsonrpc":"2.0","method":"%s"}\n' "$PEER_METHOD""#.to_owned(),
        ];
        let env = HashMap::from([("PEER_METHOD".to_owned(), "from-env".to_owned())]);
        let transport = PipeTransport::spawn("sh", &args, &env).await.unwrap();
        let mut inbound = transport.subscribe().unwrap();
        assert_eq!(inbound.recv().await.unwrap().method(), Some("from-env"));
    }

    #[tokio::test]
    async fn test_spawn_missing_program() {
        let result = PipeTransport::spawn("definitely-not-a-real-program-xyz", &[], &HashMap::new()).await;
        assert!(matches!(result, Err(TransportError::Spawn(_))));
    }
}

//! Execution engine: gate, run, and bound shell commands.

use std::{process::Stdio, sync::Arc, time::Duration};

use command_group::{AsyncCommandGroup, AsyncGroupChild};
use serde_json::json;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::Command,
};
use tokio_util::sync::CancellationToken;

use crate::{
    policy::{Decision, DenyReason, PolicyStore, decide_with_approval},
    shell::get_shell_command,
    types::{CommandOutcome, CommandRequest, OutcomeErrorKind},
};

/// Default foreground time limit.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default capture cap per output stream (2 MiB).
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 2 * 1024 * 1024;

const READ_CHUNK_BYTES: usize = 64 * 1024;

/// Bounds applied to foreground runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionLimits {
    /// Wall-clock limit before the process group is killed.
    pub timeout: Duration,
    /// Bytes kept per stream; the process is stopped once one stream exceeds it.
    pub max_output_bytes: usize,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

/// Runs [`CommandRequest`]s under the policy held in a [`PolicyStore`].
///
/// Every path returns a [`CommandOutcome`]; failures of the command are data,
/// never errors of the engine.
pub struct ExecutionEngine {
    policy: Arc<PolicyStore>,
    limits: ExecutionLimits,
    shell: (String, &'static str),
}

impl ExecutionEngine {
    /// Create an engine with default limits and the platform shell.
    #[must_use]
    pub fn new(policy: Arc<PolicyStore>) -> Self {
        Self::with_limits(policy, ExecutionLimits::default())
    }

    /// Create an engine with custom limits.
    #[must_use]
    pub fn with_limits(policy: Arc<PolicyStore>, limits: ExecutionLimits) -> Self {
        Self {
            policy,
            limits,
            shell: get_shell_command(),
        }
    }

    /// Gate and run one request.
    pub async fn execute(&self, request: CommandRequest) -> CommandOutcome {
        if let Err(reason) = request.validate() {
            return CommandOutcome::error(
                OutcomeErrorKind::ExecError,
                reason,
                json!({ "command": request.command }),
            );
        }

        let snapshot = self.policy.snapshot();
        match decide_with_approval(&request.command, &snapshot, request.require_approval) {
            Decision::Admit => {}
            Decision::Deny(reason) => {
                tracing::warn!(command = %request.command, ?reason, "Command denied by policy");
                let details = match reason {
                    DenyReason::Denylisted { pattern } => {
                        json!({ "reason": "denylisted", "pattern": pattern })
                    }
                    DenyReason::NotAllowlisted => json!({ "reason": "not_allowlisted" }),
                };
                return CommandOutcome::error(
                    OutcomeErrorKind::SecurityViolation,
                    format!("Command not permitted by policy: {}", request.command),
                    details,
                );
            }
            Decision::RequireApproval => {
                tracing::info!(command = %request.command, "Command awaiting approval");
                return CommandOutcome::Waiting {
                    message: format!(
                        "Command requires approval: {}. Resubmit with requireApproval set to false once approved.",
                        request.command
                    ),
                };
            }
        }

        if request.background {
            self.launch_background(&request.command);
            return CommandOutcome::Success {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: 0,
                truncated: false,
            };
        }

        self.run_foreground(&request.command).await
    }

    fn shell_command(&self, command: &str) -> Command {
        let (program, flag) = &self.shell;
        let mut cmd = Command::new(program);
        cmd.arg(flag).arg(command).stdin(Stdio::null());
        cmd
    }

    fn launch_background(&self, command: &str) {
        let mut cmd = self.shell_command(command);
        cmd.stdout(Stdio::null()).stderr(Stdio::null());

        match cmd.group_spawn() {
            Ok(mut child) => {
                tracing::info!(command, pid = ?child.id(), "Background command launched");
                let command = command.to_owned();
                tokio::spawn(async move {
                    match child.wait().await {
                        Ok(status) => tracing::debug!(%command, %status, "Background command exited"),
                        Err(e) => tracing::warn!(%command, "Failed to reap background command: {e}"),
                    }
                });
            }
            Err(e) => tracing::error!(command, "Failed to launch background command: {e}"),
        }
    }

    async fn run_foreground(&self, command: &str) -> CommandOutcome {
        let mut cmd = self.shell_command(command);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        let mut child = match cmd.group_spawn() {
            Ok(child) => child,
            Err(e) => {
                return CommandOutcome::error(
                    OutcomeErrorKind::ExecError,
                    format!("Failed to spawn command: {e}"),
                    json!({ "error": e.to_string() }),
                );
            }
        };

        let (Some(stdout), Some(stderr)) = (child.inner().stdout.take(), child.inner().stderr.take())
        else {
            terminate(&mut child).await;
            return CommandOutcome::error(
                OutcomeErrorKind::ExecError,
                "Failed to capture command output",
                json!({}),
            );
        };

        let cap = self.limits.max_output_bytes;
        let overflow = CancellationToken::new();

        let run = async {
            let readers = async {
                tokio::join!(
                    read_capped(stdout, cap, &overflow),
                    read_capped(stderr, cap, &overflow)
                )
            };
            tokio::pin!(readers);

            let captured = tokio::select! {
                captured = &mut readers => captured,
                () = overflow.cancelled() => {
                    tracing::debug!(command, cap, "Output cap reached, stopping command");
                    if let Err(e) = child.start_kill() {
                        tracing::debug!("Failed to stop command after output cap: {e}");
                    }
                    readers.await
                }
            };
            (captured, child.wait().await)
        };

        let finished = tokio::time::timeout(self.limits.timeout, run).await;
        let Ok((((stdout, out_truncated), (stderr, err_truncated)), waited)) = finished else {
            terminate(&mut child).await;
            tracing::warn!(command, timeout = ?self.limits.timeout, "Command timed out");
            return CommandOutcome::error(
                OutcomeErrorKind::Timeout,
                format!("Command timed out after {}s", self.limits.timeout.as_secs_f64()),
                json!({ "timeoutMs": duration_ms(self.limits.timeout) }),
            );
        };

        let stdout = capped_text(stdout, out_truncated, cap);
        let stderr = capped_text(stderr, err_truncated, cap);

        let status = match waited {
            Ok(status) => status,
            Err(e) => {
                return CommandOutcome::error(
                    OutcomeErrorKind::ExecError,
                    format!("Failed to wait for command: {e}"),
                    json!({ "error": e.to_string(), "stdout": stdout, "stderr": stderr }),
                );
            }
        };

        if out_truncated || err_truncated {
            return CommandOutcome::Success {
                stdout,
                stderr,
                exit_code: exit_code(status),
                truncated: true,
            };
        }

        if status.success() {
            return CommandOutcome::Success {
                stdout,
                stderr,
                exit_code: 0,
                truncated: false,
            };
        }

        tracing::debug!(command, %status, "Command failed");
        CommandOutcome::error(
            OutcomeErrorKind::ExecError,
            format!("Command failed: {status}"),
            json!({
                "exitCode": status.code(),
                "signal": signal(status),
                "stdout": stdout,
                "stderr": stderr,
            }),
        )
    }
}

/// Read until EOF keeping at most `cap` bytes.
///
/// On overflow the prefix is kept, `overflow` is cancelled, and reading stops.
async fn read_capped<R>(mut reader: R, cap: usize, overflow: &CancellationToken) -> (Vec<u8>, bool)
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let mut chunk = vec![0u8; READ_CHUNK_BYTES];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                if buf.len() + n > cap {
                    let remaining = cap.saturating_sub(buf.len());
                    buf.extend_from_slice(&chunk[..remaining]);
                    overflow.cancel();
                    return (buf, true);
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            Err(e) => {
                tracing::debug!("Command output read failed: {e}");
                break;
            }
        }
    }
    (buf, false)
}

/// Captured bytes as text of at most `cap` bytes.
///
/// A truncated capture drops a character split by the cut instead of
/// replacing it.
fn capped_text(mut bytes: Vec<u8>, truncated: bool, cap: usize) -> String {
    if truncated {
        let tail = bytes.len().saturating_sub(3);
        if let Some(start) = (tail..bytes.len()).rev().find(|&i| bytes[i] & 0xC0 != 0x80) {
            if matches!(std::str::from_utf8(&bytes[start..]), Err(e) if e.error_len().is_none()) {
                bytes.truncate(start);
            }
        }
    }

    let mut text = String::from_utf8_lossy(&bytes).into_owned();
    if text.len() > cap {
        let mut end = cap;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }
    text
}

async fn terminate(child: &mut AsyncGroupChild) {
    if let Err(e) = child.kill().await {
        tracing::debug!("Failed to kill command process group: {e}");
    }
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| signal(status).map(|sig| 128 + sig))
        .unwrap_or(-1)
}

#[cfg(unix)]
fn signal(status: std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
const fn signal(_status: std::process::ExitStatus) -> Option<i32> {
    None
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::policy::PolicyConfig;

    fn open_engine() -> ExecutionEngine {
        ExecutionEngine::new(Arc::new(PolicyStore::default()))
    }

    fn engine_with(config: PolicyConfig, limits: ExecutionLimits) -> ExecutionEngine {
        ExecutionEngine::with_limits(Arc::new(PolicyStore::new(config)), limits)
    }

    #[tokio::test]
    async fn test_captures_stdout_and_stderr() {
        let outcome = open_engine()
            .execute(CommandRequest::new("echo hello; echo oops 1>&2"))
            .await;
        assert_eq!(
            outcome,
            CommandOutcome::Success {
                stdout: "hello\n".into(),
                stderr: "oops\n".into(),
                exit_code: 0,
                truncated: false,
            }
        );
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_exec_error() {
        let outcome = open_engine().execute(CommandRequest::new("echo partial; exit 3")).await;
        let CommandOutcome::Error { kind, details, .. } = outcome else {
            panic!("expected error, got {outcome:?}");
        };
        assert_eq!(kind, OutcomeErrorKind::ExecError);
        assert_eq!(details["exitCode"], 3);
        assert_eq!(details["stdout"], "partial\n");
    }

    #[tokio::test]
    async fn test_truncates_at_cap() {
        let outcome = open_engine()
            .execute(CommandRequest::new("head -c 3000000 /dev/zero"))
            .await;
        let CommandOutcome::Success { stdout, truncated, .. } = outcome else {
            panic!("expected success, got {outcome:?}");
        };
        assert!(truncated);
        assert_eq!(stdout.len(), DEFAULT_MAX_OUTPUT_BYTES);
    }

    #[tokio::test]
    async fn test_cap_stops_endless_output() {
        let limits = ExecutionLimits {
            timeout: Duration::from_secs(10),
            max_output_bytes: 1024,
        };
        let started = Instant::now();
        let outcome = engine_with(PolicyConfig::default(), limits)
            .execute(CommandRequest::new("yes"))
            .await;
        let CommandOutcome::Success { stdout, truncated, .. } = outcome else {
            panic!("expected success, got {outcome:?}");
        };
        assert!(truncated);
        assert_eq!(stdout.len(), 1024);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_truncation_never_splits_a_character() {
        let limits = ExecutionLimits {
            timeout: Duration::from_secs(10),
            max_output_bytes: 1024,
        };
        // Two ASCII bytes put the cut inside a three-byte euro sign.
        let outcome = engine_with(PolicyConfig::default(), limits)
            .execute(CommandRequest::new("printf ab; yes '€'"))
            .await;
        let CommandOutcome::Success { stdout, truncated, .. } = outcome else {
            panic!("expected success, got {outcome:?}");
        };
        assert!(truncated);
        assert_eq!(stdout.len(), 1022);
        assert!(stdout.ends_with("€\n"));
        assert!(!stdout.contains('\u{FFFD}'));
    }

    #[test]
    fn test_capped_text_bounds_replacements() {
        assert_eq!(capped_text(b"ok\xe2\x82".to_vec(), true, 4), "ok");
        assert_eq!(capped_text(b"\xff\xff".to_vec(), false, 4), "\u{FFFD}");
        assert_eq!(capped_text(b"plain".to_vec(), false, 8), "plain");
    }

    #[tokio::test]
    async fn test_timeout() {
        let limits = ExecutionLimits {
            timeout: Duration::from_millis(200),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        };
        let started = Instant::now();
        let outcome = engine_with(PolicyConfig::default(), limits)
            .execute(CommandRequest::new("sleep 5"))
            .await;
        assert!(matches!(
            outcome,
            CommandOutcome::Error { kind: OutcomeErrorKind::Timeout, .. }
        ));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_background_returns_immediately() {
        let started = Instant::now();
        let outcome = open_engine()
            .execute(CommandRequest::new("sleep 5").background(true))
            .await;
        assert_eq!(
            outcome,
            CommandOutcome::Success {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: 0,
                truncated: false,
            }
        );
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_denied_command_never_runs() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        let config = PolicyConfig {
            enabled: true,
            denylist: vec!["touch".into()],
            allow_all_others: true,
            ..PolicyConfig::default()
        };
        let outcome = engine_with(config, ExecutionLimits::default())
            .execute(CommandRequest::new(format!("touch {}", marker.display())))
            .await;

        let CommandOutcome::Error { kind, details, .. } = outcome else {
            panic!("expected error, got {outcome:?}");
        };
        assert_eq!(kind, OutcomeErrorKind::SecurityViolation);
        assert_eq!(details["pattern"], "touch");
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_approval_request_waits_without_running() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        let config = PolicyConfig {
            enabled: true,
            allowlist: vec!["echo".into()],
            ..PolicyConfig::default()
        };
        let engine = engine_with(config, ExecutionLimits::default());

        let outcome = engine
            .execute(CommandRequest::new(format!("touch {}", marker.display())).require_approval(true))
            .await;
        assert!(matches!(outcome, CommandOutcome::Waiting { .. }));
        assert!(!marker.exists());

        let outcome = engine
            .execute(CommandRequest::new("echo approved").require_approval(true))
            .await;
        assert!(matches!(outcome, CommandOutcome::Success { .. }));
    }

    #[tokio::test]
    async fn test_policy_reload_applies_to_next_request() {
        let store = Arc::new(PolicyStore::default());
        let engine = ExecutionEngine::new(Arc::clone(&store));
        assert!(!engine.execute(CommandRequest::new("echo one")).await.is_error());

        store.replace(PolicyConfig {
            enabled: true,
            denylist: vec!["echo".into()],
            ..PolicyConfig::default()
        });
        assert!(engine.execute(CommandRequest::new("echo two")).await.is_error());
    }

    #[tokio::test]
    async fn test_multiline_command_rejected() {
        let outcome = open_engine().execute(CommandRequest::new("echo a\necho b")).await;
        assert!(matches!(
            outcome,
            CommandOutcome::Error { kind: OutcomeErrorKind::ExecError, .. }
        ));
    }
}

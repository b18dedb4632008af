use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

use super::{Action, ActionOutput};
use crate::{Error, Result};

/// Default bound on captured output per execution.
pub const DEFAULT_OUTPUT_LIMIT: usize = 16 * 1024;

/// How long output readers may keep going after the process is gone.
/// A grandchild that inherited the pipes can hold them open indefinitely.
const READER_GRACE: Duration = Duration::from_secs(2);

const READ_CHUNK: usize = 8 * 1024;

/// Runs an external program directly (no shell) with a fixed argument list.
#[derive(Debug, Clone)]
pub struct CommandAction {
    program: String,
    output_limit: usize,
}

impl CommandAction {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            output_limit: DEFAULT_OUTPUT_LIMIT,
        }
    }

    pub fn with_output_limit(mut self, limit: usize) -> Self {
        self.output_limit = limit;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

#[async_trait]
impl Action for CommandAction {
    async fn execute(&self, args: &[String], limit: Duration) -> Result<ActionOutput> {
        let started = Instant::now();

        let mut command = Command::new(&self.program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // own process group, so that a timeout takes down everything the action started
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .map_err(|e| Error::Execution(format!("Failed to start {}: {}", self.program, e)))?;
        let mut group = ProcessGroup::new(child.id());

        debug!(program = %self.program, pid = ?child.id(), "Spawned remediation process");

        let stdout = tokio::spawn(read_bounded(child.stdout.take(), self.output_limit));
        let stderr = tokio::spawn(read_bounded(child.stderr.take(), self.output_limit));

        let waited = timeout(limit, child.wait()).await;
        let (exit_code, timed_out) = match waited {
            Ok(Ok(status)) => {
                group.disarm();
                (status.code(), false)
            }
            Ok(Err(e)) => {
                return Err(Error::Execution(format!(
                    "Failed to wait for {}: {}",
                    self.program, e
                )))
            }
            Err(_) => {
                warn!(program = %self.program, "Timeout reached, killing remediation process group");
                group.kill();
                // reap the direct child
                if let Err(e) = child.kill().await {
                    warn!(program = %self.program, "Failed to kill remediation process: {}", e);
                }
                (None, true)
            }
        };
        let duration = started.elapsed();

        let stdout = collect(stdout).await;
        let stderr = collect(stderr).await;

        Ok(ActionOutput {
            exit_code,
            output: combine(stdout, stderr, self.output_limit),
            duration,
            timed_out,
        })
    }

    fn describe(&self) -> String {
        self.program.clone()
    }
}

/// Process group led by a spawned action. Killed when dropped while armed,
/// which covers both the timeout path and a cancelled execution.
struct ProcessGroup {
    leader: Option<u32>,
}

impl ProcessGroup {
    fn new(leader: Option<u32>) -> Self {
        Self { leader }
    }

    /// The leader exited on its own; leave whatever it left behind alone.
    fn disarm(&mut self) {
        self.leader = None;
    }

    fn kill(&mut self) {
        if let Some(leader) = self.leader.take() {
            if let Err(e) = kill_group(leader) {
                debug!(pgid = leader, "Failed to kill process group: {}", e);
            }
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(unix)]
fn kill_group(leader: u32) -> std::io::Result<()> {
    let pgid = libc::pid_t::try_from(leader)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    // SAFETY: kill(2) has no memory-safety preconditions; a negative pid
    // addresses every process in the group.
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn kill_group(_leader: u32) -> std::io::Result<()> {
    Ok(())
}

/// Output captured from one stream. Bytes past the limit are counted, not kept.
#[derive(Debug, Default)]
struct BoundedOutput {
    data: Vec<u8>,
    dropped: usize,
}

async fn read_bounded<R>(reader: Option<R>, limit: usize) -> BoundedOutput
where
    R: AsyncRead + Unpin,
{
    let mut captured = BoundedOutput::default();
    let Some(mut reader) = reader else {
        return captured;
    };

    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                let room = limit.saturating_sub(captured.data.len());
                let kept = room.min(n);
                captured.data.extend_from_slice(&chunk[..kept]);
                captured.dropped += n - kept;
            }
            Err(e) => {
                debug!("Stopped reading process output: {}", e);
                break;
            }
        }
    }
    captured
}

async fn collect(mut handle: JoinHandle<BoundedOutput>) -> BoundedOutput {
    match timeout(READER_GRACE, &mut handle).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            warn!("Output reader task failed: {}", e);
            BoundedOutput::default()
        }
        Err(_) => {
            handle.abort();
            warn!("Output still open after process exit, abandoning reader");
            BoundedOutput::default()
        }
    }
}

fn combine(stdout: BoundedOutput, stderr: BoundedOutput, limit: usize) -> String {
    let mut data = stdout.data;
    data.extend_from_slice(&stderr.data);
    let mut dropped = stdout.dropped + stderr.dropped;

    if data.len() > limit {
        dropped += data.len() - limit;
        data.truncate(limit);
    }

    let mut output = String::from_utf8_lossy(&data).into_owned();
    if dropped > 0 {
        output.push_str(&format!("…[truncated {} bytes]", dropped));
    }
    output
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn test_successful_command_captures_both_streams() {
        let action = CommandAction::new("/bin/sh");
        let output = action
            .execute(&sh("echo cleaned; echo warning >&2"), Duration::from_secs(10))
            .await
            .unwrap();

        assert_eq!(output.exit_code, Some(0));
        assert!(!output.timed_out);
        assert!(output.output.contains("cleaned"));
        assert!(output.output.contains("warning"));
    }

    #[tokio::test]
    async fn test_non_zero_exit_code() {
        let action = CommandAction::new("/bin/sh");
        let output = action
            .execute(&sh("exit 3"), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(output.exit_code, Some(3));
        assert!(!output.timed_out);
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let action = CommandAction::new("/bin/sh");
        let started = std::time::Instant::now();
        let output = action
            .execute(&sh("exec sleep 30"), Duration::from_millis(200))
            .await
            .unwrap();

        assert!(output.timed_out);
        assert_eq!(output.exit_code, None);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_timeout_kills_nested_processes() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("finished");
        let script = format!("sh -c 'sleep 1; touch {}'; true", marker.display());

        let action = CommandAction::new("/bin/sh");
        let output = action
            .execute(&sh(&script), Duration::from_millis(200))
            .await
            .unwrap();
        assert!(output.timed_out);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists(), "nested process outlived the timeout");
    }

    #[tokio::test]
    async fn test_cancelled_execution_kills_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("finished");
        let script = format!("sh -c 'sleep 1; touch {}'; true", marker.display());

        let action = CommandAction::new("/bin/sh");
        let cancelled = tokio::time::timeout(
            Duration::from_millis(200),
            action.execute(&sh(&script), Duration::from_secs(30)),
        )
        .await;
        assert!(cancelled.is_err());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_output_is_truncated() {
        let action = CommandAction::new("/bin/sh").with_output_limit(64);
        let output = action
            .execute(
                &sh("i=0; while [ $i -lt 200 ]; do echo 0123456789; i=$((i+1)); done"),
                Duration::from_secs(10),
            )
            .await
            .unwrap();

        assert_eq!(output.exit_code, Some(0));
        assert!(output.output.starts_with("0123456789"));
        assert!(output.output.contains("…[truncated 2136 bytes]"));
    }

    #[tokio::test]
    async fn test_missing_program_fails_to_start() {
        let action = CommandAction::new("/nonexistent/remediate.sh");
        let err = action.execute(&[], Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, Error::Execution(_)));
    }

    #[test]
    fn test_combine_respects_limit() {
        let stdout = BoundedOutput {
            data: b"abcdef".to_vec(),
            dropped: 0,
        };
        let stderr = BoundedOutput {
            data: b"ghij".to_vec(),
            dropped: 5,
        };
        assert_eq!(combine(stdout, stderr, 8), "abcdefgh…[truncated 7 bytes]");
    }
}

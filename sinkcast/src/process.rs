//! Long-running subprocess handles
//!
//! A [`ProcessHandle`] owns one child process. It is terminated at most once
//! through [`ProcessHandle::terminate`], which asks the child to exit with
//! SIGTERM and kills it if it is still running after [`TERMINATE_GRACE`]. A
//! handle dropped while still running kills its child, so no exit path leaves
//! a stray process behind.

use std::fmt;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio_stream::wrappers::SplitStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// How long a terminated child may take to exit before it is killed
pub const TERMINATE_GRACE: Duration = Duration::from_secs(3);

/// Lines of text read from a subprocess
pub type OutputLines = Pin<Box<dyn Stream<Item = std::io::Result<String>> + Send>>;

/// Wrap any async reader as a stream of lines
///
/// Bytes that are not valid UTF-8 are replaced rather than rejected, so only
/// end of input or a real read error ends the stream. A trailing `\r` is
/// stripped like `\n`.
pub fn line_stream<R>(reader: R) -> OutputLines
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let segments = SplitStream::new(BufReader::new(reader).split(b'\n'));
    Box::pin(segments.map(|segment| segment.map(decode_line)))
}

fn decode_line(mut bytes: Vec<u8>) -> String {
    if bytes.last() == Some(&b'\r') {
        bytes.pop();
    }
    match String::from_utf8(bytes) {
        Ok(line) => line,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    }
}

/// What to do with a child's stdout/stderr
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputCapture {
    /// Pipe stdout and stderr, merged into one line stream
    Merged,
    /// Send both to /dev/null
    Discard,
}

/// Description of a process to launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    /// Short name used in logs
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    pub capture: OutputCapture,
}

impl fmt::Display for ProcessSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Lifecycle of a [`ProcessHandle`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Terminated,
}

type StopHook = Box<dyn FnOnce() + Send>;

/// An owned, running subprocess
pub struct ProcessHandle {
    name: String,
    pid: Option<u32>,
    child: Option<Child>,
    output: Option<OutputLines>,
    on_terminate: Option<StopHook>,
    state: ProcessState,
}

impl ProcessHandle {
    /// Take ownership of a spawned child and its piped output
    pub fn from_child(name: impl Into<String>, mut child: Child) -> Self {
        let stdout = child.stdout.take().map(line_stream);
        let stderr = child.stderr.take().map(line_stream);

        let output = match (stdout, stderr) {
            (Some(out), Some(err)) => Some(Box::pin(out.merge(err)) as OutputLines),
            (Some(out), None) => Some(out),
            // Without stdout the transcoder has nothing for the pump to read
            (None, _) => None,
        };

        Self {
            name: name.into(),
            pid: child.id(),
            child: Some(child),
            output,
            on_terminate: None,
            state: ProcessState::Running,
        }
    }

    /// A handle with no OS process behind it, only an output stream
    ///
    /// `on_terminate` runs on the first (and only effective) terminate call.
    /// Used by launchers that stand in for real programs.
    pub fn detached<F>(name: impl Into<String>, output: Option<OutputLines>, on_terminate: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            name: name.into(),
            pid: None,
            child: None,
            output,
            on_terminate: Some(Box::new(on_terminate)),
            state: ProcessState::Running,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Whether the handle still has an output stream to hand out
    pub fn has_output(&self) -> bool {
        self.output.is_some()
    }

    /// Hand the output stream to a reader; subsequent calls return `None`
    pub fn take_output(&mut self) -> Option<OutputLines> {
        self.output.take()
    }

    /// Request termination without waiting for the process to exit
    ///
    /// Returns `Ok(true)` if this call sent the request and `Ok(false)` if the
    /// handle was already terminated.
    pub fn terminate(&mut self) -> Result<bool> {
        if self.state == ProcessState::Terminated {
            return Ok(false);
        }
        self.state = ProcessState::Terminated;

        if let Some(hook) = self.on_terminate.take() {
            hook();
        }

        let Some(mut child) = self.child.take() else {
            return Ok(true);
        };

        if send_sigterm(&self.name, &child) {
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(reap(self.name.clone(), child, TERMINATE_GRACE));
                }
                // No runtime to wait on: keep the child so dropping the
                // handle still kills it
                Err(_) => self.child = Some(child),
            }
            return Ok(true);
        }

        match child.start_kill() {
            Ok(()) => debug!(name = %self.name, pid = ?self.pid, "Kill signal sent"),
            // Already reaped: the process exited on its own
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => {
                debug!(name = %self.name, "Process had already exited");
            }
            Err(source) => {
                return Err(Error::Terminate {
                    name: self.name.clone(),
                    source,
                })
            }
        }
        Ok(true)
    }
}

/// Ask the child to exit; `false` means the caller should kill it instead
#[cfg(unix)]
fn send_sigterm(name: &str, child: &Child) -> bool {
    // `id()` is None once the child has been reaped
    let Some(pid) = child.id() else {
        return false;
    };
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };

    // SAFETY: kill(2) takes plain integers. The pid belongs to a child we
    // have not reaped yet, so it cannot have been reused.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc == 0 {
        debug!(name = %name, pid, "SIGTERM sent");
        true
    } else {
        warn!(
            name = %name,
            pid,
            "SIGTERM failed, killing instead: {}",
            std::io::Error::last_os_error()
        );
        false
    }
}

#[cfg(not(unix))]
fn send_sigterm(_name: &str, _child: &Child) -> bool {
    false
}

/// Wait for a signalled child to exit, killing it after `grace`
///
/// Returns `true` if the child had to be killed.
async fn reap(name: String, mut child: Child, grace: Duration) -> bool {
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(name = %name, %status, "Process exited");
            false
        }
        Ok(Err(e)) => {
            warn!(name = %name, "Failed to wait for process: {}", e);
            false
        }
        Err(_) => {
            warn!(name = %name, "Still running {:?} after SIGTERM, killing it", grace);
            if let Err(e) = child.kill().await {
                warn!(name = %name, "Failed to kill process: {}", e);
            }
            true
        }
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("name", &self.name)
            .field("pid", &self.pid)
            .field("has_output", &self.output.is_some())
            .field("state", &self.state)
            .finish()
    }
}

/// Starts long-running processes
pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, spec: &ProcessSpec) -> Result<ProcessHandle>;
}

/// Launches real processes via `tokio::process`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemLauncher;

impl ProcessLauncher for SystemLauncher {
    fn launch(&self, spec: &ProcessSpec) -> Result<ProcessHandle> {
        let mut command = tokio::process::Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        match spec.capture {
            OutputCapture::Merged => {
                command.stdout(Stdio::piped()).stderr(Stdio::piped());
            }
            OutputCapture::Discard => {
                command.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }

        let child = command.spawn().map_err(|source| Error::Spawn {
            name: spec.name.clone(),
            source,
        })?;

        debug!(name = %spec.name, pid = ?child.id(), command = %spec, "Spawned process");
        Ok(ProcessHandle::from_child(spec.name.clone(), child))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn spec(program: &str, args: &[&str], capture: OutputCapture) -> ProcessSpec {
        ProcessSpec {
            name: "test".to_string(),
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            capture,
        }
    }

    #[test]
    fn test_detached_terminates_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let hook_calls = calls.clone();
        let mut handle = ProcessHandle::detached("fake", None, move || {
            hook_calls.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(handle.state(), ProcessState::Running);
        assert!(handle.terminate().unwrap());
        assert!(!handle.terminate().unwrap());
        assert_eq!(handle.state(), ProcessState::Terminated);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_launch_missing_program_is_spawn_error() {
        let result = SystemLauncher.launch(&spec(
            "/nonexistent/sinkcast-test-binary",
            &[],
            OutputCapture::Discard,
        ));
        assert!(matches!(result, Err(Error::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_discarded_output_has_no_stream() {
        let mut handle = SystemLauncher
            .launch(&spec("true", &[], OutputCapture::Discard))
            .unwrap();
        assert!(!handle.has_output());
        assert!(handle.take_output().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_merged_output_collects_stdout_and_stderr() {
        let mut handle = SystemLauncher
            .launch(&spec(
                "sh",
                &["-c", "echo out; echo err >&2"],
                OutputCapture::Merged,
            ))
            .unwrap();

        let mut output = handle.take_output().expect("merged output");
        let mut lines = Vec::new();
        while let Some(line) = output.next().await {
            lines.push(line.unwrap());
        }
        lines.sort();
        assert_eq!(lines, vec!["err".to_string(), "out".to_string()]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminated_process_output_ends() {
        let mut handle = SystemLauncher
            .launch(&spec("sleep", &["30"], OutputCapture::Merged))
            .unwrap();
        let mut output = handle.take_output().unwrap();

        assert!(handle.terminate().unwrap());

        // Exited child closes its pipes: end of stream, not an error
        let next = tokio::time::timeout(Duration::from_secs(5), output.next())
            .await
            .expect("stream should end after kill");
        assert!(next.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_lets_child_handle_sigterm() {
        let script = "trap 'echo got-term; exit 0' TERM; echo ready; while :; do sleep 0.05; done";
        let mut handle = SystemLauncher
            .launch(&spec("sh", &["-c", script], OutputCapture::Merged))
            .unwrap();
        let mut output = handle.take_output().unwrap();

        let first = output.next().await.unwrap().unwrap();
        assert_eq!(first, "ready");

        assert!(handle.terminate().unwrap());

        let rest = tokio::time::timeout(Duration::from_secs(5), async {
            let mut lines = Vec::new();
            while let Some(line) = output.next().await {
                lines.push(line.unwrap());
            }
            lines
        })
        .await
        .expect("child should exit after SIGTERM");
        assert_eq!(rest, vec!["got-term".to_string()]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_reap_kills_child_after_grace() {
        let child = tokio::process::Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap();

        let killed = tokio::time::timeout(
            Duration::from_secs(5),
            reap("sleep".to_string(), child, Duration::from_millis(50)),
        )
        .await
        .unwrap();
        assert!(killed);
    }

    #[tokio::test]
    async fn test_line_stream_replaces_invalid_utf8() {
        let bytes = b"ok\n\xe9t\xe9\r\nlast".to_vec();
        let mut lines = line_stream(std::io::Cursor::new(bytes));

        assert_eq!(lines.next().await.unwrap().unwrap(), "ok");
        assert_eq!(lines.next().await.unwrap().unwrap(), "\u{FFFD}t\u{FFFD}");
        assert_eq!(lines.next().await.unwrap().unwrap(), "last");
        assert!(lines.next().await.is_none());
    }
}

//! Subprocess spawning
//!
//! Every external operation runs in its own process group so it can be
//! signalled as a whole (compose spawns helpers of its own). Output is read
//! in chunks, split into lines and sent to the event loop, followed by one
//! exit event once both pipes are drained.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;

use recomposable_core::logs::LineSplitter;

/// Grace period between SIGTERM and SIGKILL
pub const KILL_GRACE: Duration = Duration::from_millis(500);

pub type OpId = u64;

/// A program with its arguments, ready to spawn
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl Invocation {
    pub fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            cwd: None,
        }
    }

    pub fn in_dir(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Human-readable form for logs
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProcessEvent {
    Lines { id: OpId, lines: Vec<String> },
    /// `code` is `None` when the process was killed by a signal
    Exited { id: OpId, code: Option<i32> },
}

impl ProcessEvent {
    pub fn id(&self) -> OpId {
        match self {
            ProcessEvent::Lines { id, .. } | ProcessEvent::Exited { id, .. } => *id,
        }
    }
}

/// Cancelable handle to a spawned process group
#[derive(Debug, PartialEq, Eq)]
pub struct ProcessHandle {
    pub id: OpId,
    pgid: i32,
}

impl ProcessHandle {
    /// Send `signal` to the whole process group
    pub fn kill(&self, signal: i32) {
        if self.pgid <= 0 {
            return;
        }
        #[cfg(unix)]
        unsafe {
            libc::killpg(self.pgid, signal);
        }
    }

    /// SIGTERM now, SIGKILL after [`KILL_GRACE`] if anything is left
    pub fn terminate(self) {
        self.kill(libc::SIGTERM);
        let pgid = self.pgid;
        if pgid > 0 {
            tokio::spawn(async move {
                tokio::time::sleep(KILL_GRACE).await;
                #[cfg(unix)]
                unsafe {
                    // ESRCH when the group is already gone; nothing to do then
                    libc::killpg(pgid, libc::SIGKILL);
                }
            });
        }
    }
}

/// Spawns processes and numbers them; all events share one channel
pub struct Spawner {
    next_id: OpId,
    tx: mpsc::UnboundedSender<ProcessEvent>,
}

impl Spawner {
    pub fn new(tx: mpsc::UnboundedSender<ProcessEvent>) -> Self {
        Self { next_id: 1, tx }
    }

    pub fn spawn(&mut self, invocation: &Invocation) -> std::io::Result<ProcessHandle> {
        let id = self.next_id;
        self.next_id += 1;

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args);
        if let Some(cwd) = &invocation.cwd {
            cmd.current_dir(cwd);
        }

        // New process group for reliable cleanup
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }

        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.stdin(Stdio::null());

        let mut child = cmd.spawn()?;
        let pgid = child.id().map(|pid| pid as i32).unwrap_or(-1);
        tracing::debug!(id, pgid, command = %invocation.display(), "spawned");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let tx = self.tx.clone();

        tokio::spawn(async move {
            let out = forward_lines(id, stdout, tx.clone());
            let err = forward_lines(id, stderr, tx.clone());
            let (_, _, status) = tokio::join!(out, err, child.wait());
            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    tracing::warn!(id, error = %e, "wait failed");
                    Some(-1)
                }
            };
            tracing::debug!(id, ?code, "exited");
            let _ = tx.send(ProcessEvent::Exited { id, code });
        });

        Ok(ProcessHandle { id, pgid })
    }
}

async fn forward_lines<R>(id: OpId, reader: Option<R>, tx: mpsc::UnboundedSender<ProcessEvent>)
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else { return };
    let mut splitter = LineSplitter::new();
    let mut buf = vec![0u8; 8192];
    // bytes of a UTF-8 sequence cut by the chunk boundary
    let mut carry: Vec<u8> = Vec::new();

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        carry.extend_from_slice(&buf[..n]);
        let text = decode_available(&mut carry);
        let lines = splitter.push(&text);
        if !lines.is_empty() && tx.send(ProcessEvent::Lines { id, lines }).is_err() {
            return;
        }
    }

    if !carry.is_empty() {
        let rest = String::from_utf8_lossy(&carry).into_owned();
        let mut lines = splitter.push(&rest);
        lines.extend(splitter.finish());
        if !lines.is_empty() {
            let _ = tx.send(ProcessEvent::Lines { id, lines });
        }
    } else if let Some(last) = splitter.finish() {
        let _ = tx.send(ProcessEvent::Lines {
            id,
            lines: vec![last],
        });
    }
}

/// Decode as much of `bytes` as possible, leaving an incomplete trailing
/// sequence in place. Invalid bytes become U+FFFD.
fn decode_available(bytes: &mut Vec<u8>) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => {
            let out = s.to_string();
            bytes.clear();
            out
        }
        Err(e) if e.error_len().is_none() => {
            let valid = e.valid_up_to();
            let rest = bytes.split_off(valid);
            let out = String::from_utf8_lossy(bytes).into_owned();
            *bytes = rest;
            out
        }
        Err(_) => {
            let out = String::from_utf8_lossy(bytes).into_owned();
            bytes.clear();
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(rx: &mut mpsc::UnboundedReceiver<ProcessEvent>) -> (Vec<String>, Option<i32>) {
        let mut lines = Vec::new();
        loop {
            match rx.recv().await {
                Some(ProcessEvent::Lines { lines: l, .. }) => lines.extend(l),
                Some(ProcessEvent::Exited { code, .. }) => return (lines, code),
                None => return (lines, None),
            }
        }
    }

    #[test]
    fn test_decode_keeps_partial_sequence() {
        let mut bytes = "ok ✓".as_bytes().to_vec();
        let last = bytes.pop().unwrap();
        assert_eq!(decode_available(&mut bytes), "ok ");
        assert_eq!(bytes.len(), 2);
        bytes.push(last);
        assert_eq!(decode_available(&mut bytes), "✓");
        assert!(bytes.is_empty());
    }

    #[test]
    fn test_invocation_display() {
        let inv = Invocation::new("docker", ["compose", "ps"]).in_dir("/tmp");
        assert_eq!(inv.display(), "docker compose ps");
        assert_eq!(inv.cwd, Some(PathBuf::from("/tmp")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_streams_lines_then_exit() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut spawner = Spawner::new(tx);
        let handle = spawner
            .spawn(&Invocation::new(
                "sh",
                ["-c", "printf 'one\\r\\ntwo\\n'; printf '\\033[31mred\\033[0m' >&2; exit 3"],
            ))
            .unwrap();
        assert_eq!(handle.id, 1);

        let (mut lines, code) = collect(&mut rx).await;
        lines.sort();
        assert_eq!(lines, vec!["one", "red", "two"]);
        assert_eq!(code, Some(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_kill_reports_signal_exit() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut spawner = Spawner::new(tx);
        let handle = spawner
            .spawn(&Invocation::new("sh", ["-c", "sleep 30"]))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.kill(libc::SIGKILL);

        let (_, code) = tokio::time::timeout(Duration::from_secs(5), collect(&mut rx))
            .await
            .unwrap();
        assert_eq!(code, None);
    }

    #[test]
    fn test_spawn_failure() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let (tx, _rx) = mpsc::unbounded_channel();
            let mut spawner = Spawner::new(tx);
            assert!(spawner
                .spawn(&Invocation::new("definitely-not-a-real-binary-xyz", Vec::<String>::new()))
                .is_err());
        });
    }
}

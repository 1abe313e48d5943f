use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use super::job::{Job, JobId, JobSpec, OutputEvent, StreamTag};
use super::state::{JobSlot, Stop};

const READ_BUF: usize = 8 * 1024;

/// How long the output relays may keep reading once the worker has exited.
/// Grandchildren that inherited the pipes would otherwise hold them open.
const STREAM_GRACE: Duration = Duration::from_secs(2);

pub fn build_command(spec: &JobSpec, env: &BTreeMap<String, String>) -> Command {
    let mut cmd = Command::new(&spec.executable);
    cmd.arg(&spec.script)
        .args(&spec.args)
        .current_dir(spec.working_dir())
        .envs(env)
        .stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

/// Decodes a byte stream into UTF-8 text without splitting characters that
/// straddle two reads.
#[derive(Debug, Default)]
pub struct Utf8Chunker {
    pending: Vec<u8>,
}

impl Utf8Chunker {
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        // Incomplete sequence at the end: wait for the next read.
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }

        out
    }

    /// Flushes a truncated trailing sequence, if any.
    pub fn finish(self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&self.pending).into_owned())
        }
    }
}

async fn relay<R>(mut reader: R, job: JobId, stream: StreamTag, tx: mpsc::UnboundedSender<OutputEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUF];
    let mut decoder = Utf8Chunker::default();

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let text = decoder.push(&buf[..n]);
                if !text.is_empty() {
                    // Keep draining even with no listener so the worker never blocks on a full pipe.
                    let _ = tx.send(OutputEvent::Output { job, stream, text });
                }
            }
            Err(e) => {
                warn!(job = %job, %stream, error = %e, "worker stream read failed");
                break;
            }
        }
    }

    if let Some(text) = decoder.finish() {
        let _ = tx.send(OutputEvent::Output { job, stream, text });
    }
}

#[cfg(unix)]
fn terminate(child: &mut Child) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    match child.id() {
        Some(pid) => {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                warn!(pid, error = %e, "SIGTERM failed");
            }
        }
        None => debug!("process already reaped"),
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        warn!(error = %e, "kill failed");
    }
}

fn deliver(child: &mut Child, how: Stop) {
    match how {
        Stop::Terminate => terminate(child),
        Stop::Kill => {
            if let Err(e) = child.start_kill() {
                warn!(error = %e, "kill failed");
            }
        }
    }
}

/// Owns the worker process until it exits: relays both streams, feeds the
/// stdin payload, applies stop requests and the runner-wide kill switch,
/// then releases the slot and emits the single terminal event.
pub async fn supervise(
    mut job: Job,
    mut child: Child,
    mut stop: oneshot::Receiver<Stop>,
    mut kill_all: watch::Receiver<bool>,
    slot: JobSlot,
    tx: mpsc::UnboundedSender<OutputEvent>,
) {
    let id = job.id;

    let mut relays: Vec<_> = [
        child
            .stdout
            .take()
            .map(|out| tokio::spawn(relay(out, id, StreamTag::Stdout, tx.clone()))),
        child
            .stderr
            .take()
            .map(|err| tokio::spawn(relay(err, id, StreamTag::Stderr, tx.clone()))),
    ]
    .into_iter()
    .flatten()
    .collect();

    if let (Some(mut stdin), Some(payload)) = (child.stdin.take(), job.spec.stdin.clone()) {
        tokio::spawn(async move {
            let line = format!("{payload}\n");
            if let Err(e) = stdin.write_all(line.as_bytes()).await {
                warn!(job = %id, error = %e, "failed to write worker input");
            }
            // Dropping stdin closes the pipe.
        });
    }

    let mut stop_seen = false;
    let mut killed = *kill_all.borrow_and_update();
    if killed {
        deliver(&mut child, Stop::Kill);
    }

    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            how = &mut stop, if !stop_seen => {
                stop_seen = true;
                if let Ok(how) = how {
                    debug!(job = %id, ?how, "stopping worker");
                    deliver(&mut child, how);
                }
            }
            changed = kill_all.changed(), if !killed => {
                killed = true;
                if changed.is_ok() && *kill_all.borrow() {
                    debug!(job = %id, "runner shutting down, killing worker");
                    deliver(&mut child, Stop::Kill);
                }
            }
        }
    };

    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            warn!(job = %id, error = %e, "failed to wait on worker");
            None
        }
    };

    let drained = tokio::time::timeout(STREAM_GRACE, async {
        for relay in relays.iter_mut() {
            let _ = relay.await;
        }
    })
    .await;
    if drained.is_err() {
        warn!(job = %id, "worker streams still open after exit, closing them");
        for relay in &relays {
            relay.abort();
        }
    }

    job.terminate(code);
    slot.release(id);
    info!(job = %id, code = ?code, duration_ms = job.duration_ms(), "job exited");
    let _ = tx.send(OutputEvent::Exited { job: id, code });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunker_passes_ascii_through() {
        let mut c = Utf8Chunker::default();
        assert_eq!(c.push(b"step 1/40\n"), "step 1/40\n");
        assert!(c.finish().is_none());
    }

    #[test]
    fn chunker_joins_split_multibyte() {
        let bytes = "진행률 50%".as_bytes();
        let mut c = Utf8Chunker::default();
        // Split inside the first three-byte character.
        let first = c.push(&bytes[..2]);
        let second = c.push(&bytes[2..]);
        assert_eq!(first, "");
        assert_eq!(second, "진행률 50%");
        assert!(c.finish().is_none());
    }

    #[test]
    fn chunker_replaces_invalid_bytes() {
        let mut c = Utf8Chunker::default();
        assert_eq!(c.push(b"ok\xffok"), "ok\u{FFFD}ok");
    }

    #[test]
    fn chunker_flushes_truncated_tail() {
        let mut c = Utf8Chunker::default();
        assert_eq!(c.push(b"abc\xe2\x82"), "abc");
        assert_eq!(c.finish().as_deref(), Some("\u{FFFD}"));
    }

    #[test]
    fn command_uses_script_dir_and_env() {
        let spec = JobSpec::new("python", "/w/Wan2.2/generate.py").with_args(["--task", "t2v-A14B"]);
        let env = BTreeMap::from([("PYTHONUTF8".to_string(), "1".to_string())]);
        let cmd = build_command(&spec, &env);
        let std_cmd = cmd.as_std();

        assert_eq!(std_cmd.get_program(), "python");
        let args: Vec<_> = std_cmd.get_args().collect();
        assert_eq!(args, ["/w/Wan2.2/generate.py", "--task", "t2v-A14B"]);
        assert_eq!(std_cmd.get_current_dir(), Some(std::path::Path::new("/w/Wan2.2")));
        let envs: Vec<_> = std_cmd.get_envs().collect();
        assert!(envs.contains(&(std::ffi::OsStr::new("PYTHONUTF8"), Some(std::ffi::OsStr::new("1")))));
    }
}

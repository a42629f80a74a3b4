use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

pub(crate) const MAX_CHILD_STDIN_BYTES: usize = 256 * 1_048_576;
pub(crate) const MAX_CHILD_STDOUT_BYTES: usize = 256 * 1_048_576;
pub(crate) const MAX_CHILD_STDERR_BYTES: usize = 262_144;
const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(2);
const READER_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Captured result of one child process run to completion.
#[derive(Debug)]
pub(crate) struct ChildOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub duration_ms: u128,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ChildError {
    Spawn { reason: String },
    TimedOut { after_millis: u64 },
    Io { reason: String },
}

impl ChildError {
    pub fn describe(&self, label: &str) -> String {
        match self {
            Self::Spawn { reason } => format!("failed to spawn {label}: {reason}"),
            Self::TimedOut { after_millis } => {
                format!("{label} timed out after {after_millis}ms")
            }
            Self::Io { reason } => format!("{label} io failure: {reason}"),
        }
    }
}

/// Runs `command` to completion with captured, capped output streams.
///
/// `stdin` is written from a separate thread so a child that interleaves
/// reads and writes cannot deadlock against the pipe buffers. With a
/// `timeout_millis` the child is killed and reaped once the deadline passes;
/// without one the call blocks until the child exits.
///
/// On unix the child leads its own process group and every kill targets the
/// whole group, so descendants of a wrapper script die with it. Output
/// readers still blocked on pipes held by escaped descendants are detached
/// after a short grace period.
pub(crate) fn run_child(
    mut command: Command,
    stdin: Option<Vec<u8>>,
    timeout_millis: Option<u64>,
    label: &str,
) -> Result<ChildOutput, ChildError> {
    if let Some(body) = stdin.as_ref()
        && body.len() > MAX_CHILD_STDIN_BYTES
    {
        return Err(ChildError::Io {
            reason: format!(
                "{label} stdin exceeds max bytes: actual={} max={MAX_CHILD_STDIN_BYTES}",
                body.len()
            ),
        });
    }

    #[cfg(unix)]
    std::os::unix::process::CommandExt::process_group(&mut command, 0);

    let started_at = Instant::now();
    let mut child = command
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|error| ChildError::Spawn {
            reason: error.to_string(),
        })?;

    let stdin_writer = match (stdin, child.stdin.take()) {
        (Some(body), Some(mut pipe)) => Some(std::thread::spawn(move || {
            // A child that exits without draining stdin yields a broken pipe,
            // which surfaces through its exit status instead.
            let _ = pipe.write_all(body.as_slice());
        })),
        (Some(_), None) => {
            terminate_and_reap_child(&mut child);
            return Err(ChildError::Io {
                reason: format!("{label} stdin stream unavailable"),
            });
        }
        (None, _) => None,
    };

    let Some(stdout) = child.stdout.take() else {
        terminate_and_reap_child(&mut child);
        return Err(ChildError::Io {
            reason: format!("{label} stdout stream unavailable"),
        });
    };
    let Some(stderr) = child.stderr.take() else {
        terminate_and_reap_child(&mut child);
        return Err(ChildError::Io {
            reason: format!("{label} stderr stream unavailable"),
        });
    };

    let overflow_flag = Arc::new(AtomicBool::new(false));
    let stdout_overflow = Arc::clone(&overflow_flag);
    let stdout_reader = std::thread::spawn(move || {
        read_stream_capped(stdout, MAX_CHILD_STDOUT_BYTES, stdout_overflow.as_ref())
    });
    let stderr_overflow = Arc::clone(&overflow_flag);
    let stderr_reader = std::thread::spawn(move || {
        read_stream_capped(stderr, MAX_CHILD_STDERR_BYTES, stderr_overflow.as_ref())
    });

    let mut wait_result =
        wait_for_child_exit(&mut child, overflow_flag.as_ref(), timeout_millis);
    let drain_deadline = match (&wait_result, timeout_millis) {
        (Err(_), _) => Some(Instant::now() + READER_DRAIN_GRACE),
        (Ok(_), Some(limit)) => {
            Some(started_at + Duration::from_millis(limit) + READER_DRAIN_GRACE)
        }
        (Ok(_), None) => None,
    };
    if !streams_finished(&stdout_reader, &stderr_reader, stdin_writer.as_ref(), drain_deadline) {
        // Descendants outlived the child and still hold its pipes.
        kill_process_group(child.id());
        if wait_result.is_ok() {
            wait_result = Err(ChildError::TimedOut {
                after_millis: timeout_millis.unwrap_or_default(),
            });
        }
        let grace = Some(Instant::now() + READER_DRAIN_GRACE);
        if !streams_finished(&stdout_reader, &stderr_reader, stdin_writer.as_ref(), grace) {
            return Err(wait_result.err().unwrap_or(ChildError::Io {
                reason: format!("{label} output streams did not close"),
            }));
        }
    }
    let stdout_capture = join_reader(stdout_reader, label, "stdout")?;
    let stderr_capture = join_reader(stderr_reader, label, "stderr")?;
    if let Some(writer) = stdin_writer {
        writer.join().map_err(|_| ChildError::Io {
            reason: format!("{label} stdin writer thread panicked"),
        })?;
    }
    let status = wait_result?;

    if stdout_capture.total_bytes > MAX_CHILD_STDOUT_BYTES {
        return Err(ChildError::Io {
            reason: format!(
                "{label} stdout exceeds max bytes: actual={} max={MAX_CHILD_STDOUT_BYTES}",
                stdout_capture.total_bytes
            ),
        });
    }

    Ok(ChildOutput {
        status,
        stdout: stdout_capture.bytes,
        stderr: stderr_capture.bytes,
        duration_ms: started_at.elapsed().as_millis(),
    })
}

/// Last non-empty line of `stdout`, bounded in length.
pub(crate) fn last_output_line(stdout: &str, max_line_bytes: usize) -> Result<&str, String> {
    let line = stdout
        .lines()
        .rev()
        .find(|candidate| !candidate.trim().is_empty())
        .ok_or_else(|| "child produced empty stdout".to_string())?;
    if line.len() > max_line_bytes {
        return Err(format!(
            "child output line exceeds max bytes: actual={} max={max_line_bytes}",
            line.len()
        ));
    }
    Ok(line)
}

/// Trailing `max_len` bytes of a captured stream, lossily decoded.
pub(crate) fn stream_tail(bytes: &[u8], max_len: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim_end();
    if text.len() <= max_len {
        return text.to_string();
    }
    let mut boundary = text.len() - max_len;
    while boundary < text.len() && !text.is_char_boundary(boundary) {
        boundary += 1;
    }
    format!("...{}", &text[boundary..])
}

pub(crate) fn bounded_diagnostic(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        return input.to_string();
    }

    let mut boundary = max_len.min(input.len());
    while boundary > 0 && !input.is_char_boundary(boundary) {
        boundary -= 1;
    }
    format!("{}...", &input[..boundary])
}

fn wait_for_child_exit(
    child: &mut Child,
    overflow_flag: &AtomicBool,
    timeout_millis: Option<u64>,
) -> Result<ExitStatus, ChildError> {
    let started_at = Instant::now();
    let mut killed_for_overflow = false;
    loop {
        if overflow_flag.load(Ordering::Relaxed) && !killed_for_overflow {
            terminate_and_reap_child(child);
            killed_for_overflow = true;
        }

        match child.try_wait() {
            Ok(Some(status)) => return Ok(status),
            Ok(None) => {}
            Err(error) => {
                terminate_and_reap_child(child);
                return Err(ChildError::Io {
                    reason: format!("process wait failed: {error}"),
                });
            }
        }

        if let Some(limit) = timeout_millis
            && started_at.elapsed().as_millis() > u128::from(limit)
        {
            terminate_and_reap_child(child);
            return Err(ChildError::TimedOut {
                after_millis: limit,
            });
        }
        std::thread::sleep(CHILD_POLL_INTERVAL);
    }
}

fn terminate_and_reap_child(child: &mut Child) {
    kill_process_group(child.id());
    let _ = child.kill();
    let _ = child.wait();
}

/// SIGKILL to the process group led by `pid`. The group id stays reserved
/// while any member is alive, so a reaped leader cannot alias another group.
#[cfg(unix)]
fn kill_process_group(pid: u32) {
    let _ = Command::new("kill")
        .arg("-KILL")
        .arg("--")
        .arg(format!("-{pid}"))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}

/// Polls the stream threads until all finish or `deadline` passes. With no
/// deadline the caller joins and blocks.
fn streams_finished<A, B>(
    stdout_reader: &JoinHandle<A>,
    stderr_reader: &JoinHandle<B>,
    stdin_writer: Option<&JoinHandle<()>>,
    deadline: Option<Instant>,
) -> bool {
    let Some(deadline) = deadline else {
        return true;
    };
    loop {
        if stdout_reader.is_finished()
            && stderr_reader.is_finished()
            && stdin_writer.is_none_or(JoinHandle::is_finished)
        {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(CHILD_POLL_INTERVAL);
    }
}

#[derive(Debug)]
struct CappedStreamCapture {
    bytes: Vec<u8>,
    total_bytes: usize,
}

fn join_reader(
    handle: JoinHandle<Result<CappedStreamCapture, String>>,
    label: &str,
    stream: &str,
) -> Result<CappedStreamCapture, ChildError> {
    handle
        .join()
        .map_err(|_| ChildError::Io {
            reason: format!("{label} {stream} reader thread panicked"),
        })?
        .map_err(|reason| ChildError::Io {
            reason: format!("{label} {stream} {reason}"),
        })
}

fn read_stream_capped<R: Read>(
    mut reader: R,
    max_bytes: usize,
    overflow_flag: &AtomicBool,
) -> Result<CappedStreamCapture, String> {
    let mut bytes = Vec::with_capacity(max_bytes.min(8192));
    let mut total_bytes = 0usize;
    let mut chunk = [0_u8; 8192];

    loop {
        let read_len = reader
            .read(&mut chunk)
            .map_err(|error| format!("read failed: {error}"))?;
        if read_len == 0 {
            break;
        }

        total_bytes = total_bytes.saturating_add(read_len);
        if bytes.len() < max_bytes {
            let remaining = max_bytes - bytes.len();
            let copy_len = read_len.min(remaining);
            bytes.extend_from_slice(&chunk[..copy_len]);
        }
        if total_bytes > max_bytes {
            overflow_flag.store(true, Ordering::Relaxed);
        }
    }

    Ok(CappedStreamCapture { bytes, total_bytes })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use super::{bounded_diagnostic, last_output_line, read_stream_capped, stream_tail};

    #[cfg(unix)]
    fn shell(script: &str) -> std::process::Command {
        let mut command = std::process::Command::new("sh");
        command.arg("-c").arg(script);
        command
    }

    #[cfg(unix)]
    #[test]
    fn timeout_kills_forked_descendants() {
        let started = std::time::Instant::now();
        let err = super::run_child(shell("sleep 30; exit 0"), None, Some(200), "wrapper")
            .expect_err("wrapper must time out");
        assert_eq!(err, super::ChildError::TimedOut { after_millis: 200 });
        assert!(started.elapsed().as_secs() < 5, "{:?}", started.elapsed());
    }

    #[cfg(unix)]
    #[test]
    fn background_pipe_holder_cannot_outlast_deadline() {
        let started = std::time::Instant::now();
        let err = super::run_child(shell("sleep 30 & echo started"), None, Some(300), "launcher")
            .expect_err("held pipes must time out");
        assert_eq!(err, super::ChildError::TimedOut { after_millis: 300 });
        assert!(started.elapsed().as_secs() < 5, "{:?}", started.elapsed());
    }

    #[cfg(unix)]
    #[test]
    fn stdin_round_trips_without_timeout() {
        let output = super::run_child(shell("cat"), Some(b"ping".to_vec()), None, "echo")
            .expect("cat exits cleanly");
        assert!(output.status.success());
        assert_eq!(output.stdout, b"ping");
    }

    #[test]
    fn capped_reader_flags_overflow() {
        let flag = AtomicBool::new(false);
        let capture = read_stream_capped(&b"abcdefgh"[..], 4, &flag).expect("read");
        assert_eq!(capture.bytes, b"abcd");
        assert_eq!(capture.total_bytes, 8);
        assert!(flag.load(std::sync::atomic::Ordering::Relaxed));
    }

    #[test]
    fn last_line_skips_trailing_blank_lines() {
        let out = "progress 1\n{\"outputs\":[]}\n\n  \n";
        assert_eq!(last_output_line(out, 64), Ok("{\"outputs\":[]}"));
        assert!(last_output_line("\n\n", 64).is_err());
        assert!(last_output_line("0123456789", 4).is_err());
    }

    #[test]
    fn tails_and_heads_respect_char_boundaries() {
        assert_eq!(stream_tail(b"short\n", 16), "short");
        assert_eq!(stream_tail("xxxxé".as_bytes(), 1), "...");
        assert_eq!(stream_tail(b"0123456789", 3), "...789");
        assert_eq!(bounded_diagnostic("0123456789", 4), "0123...");
        assert_eq!(bounded_diagnostic("éé", 1), "...");
    }
}

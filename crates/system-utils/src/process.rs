use std::io;
use std::process::Output;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout};

const TERMINATE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Waits for `child` while draining its piped stdout and stderr.
///
/// Both pipes are read concurrently with the wait so a chatty child cannot
/// block on a full pipe. When `command_timeout` elapses the child is killed
/// and an error of kind [`io::ErrorKind::TimedOut`] is returned.
pub async fn collect_output_with_timeout(
    mut child: Child,
    command_timeout: Duration,
) -> io::Result<Output> {
    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();
    let waited = timeout(command_timeout, async {
        let ((stdout, stderr), status) = tokio::join!(
            async { tokio::join!(read_pipe(stdout_pipe), read_pipe(stderr_pipe)) },
            child.wait()
        );
        status.map(|status| Output {
            status,
            stdout,
            stderr,
        })
    })
    .await;
    match waited {
        Ok(result) => result,
        Err(_) => {
            let _ = child.kill().await;
            let _ = child.wait().await;
            Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("timed out after {}s", command_timeout.as_secs()),
            ))
        }
    }
}

async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>) -> Vec<u8> {
    let mut buffer = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buffer).await;
    }
    buffer
}

/// Makes the spawned child the leader of a new process group so the whole
/// tree started through `sh -c` can be signalled at once.
#[cfg(unix)]
pub fn isolate_process_group(cmd: &mut Command) {
    unsafe {
        cmd.pre_exec(|| {
            if libc::setpgid(0, 0) == 0 {
                Ok(())
            } else {
                Err(io::Error::last_os_error())
            }
        });
    }
}

#[cfg(not(unix))]
pub fn isolate_process_group(_cmd: &mut Command) {}

#[cfg(unix)]
pub fn kill_process_group(pgid: i32, signal: i32) -> io::Result<()> {
    let rc = unsafe { libc::killpg(pgid as libc::pid_t, signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// SIGTERM to the group, a grace period for it to exit, then SIGKILL.
/// The child is always reaped before returning.
pub async fn terminate_process_group(
    child: &mut Child,
    pgid: Option<i32>,
    grace: Duration,
) -> io::Result<()> {
    if child.try_wait()?.is_some() {
        return Ok(());
    }
    send_term(child, pgid);

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if child.try_wait()?.is_some() {
            return Ok(());
        }
        sleep(TERMINATE_POLL_INTERVAL).await;
    }

    start_kill_process_group(child, pgid);
    child.wait().await?;
    Ok(())
}

/// Synchronous SIGKILL for drop paths; does not reap.
pub fn start_kill_process_group(child: &mut Child, pgid: Option<i32>) {
    #[cfg(unix)]
    if let Some(pgid) = pgid {
        let _ = kill_process_group(pgid, libc::SIGKILL);
    }
    #[cfg(not(unix))]
    let _ = pgid;
    let _ = child.start_kill();
}

fn send_term(child: &mut Child, pgid: Option<i32>) {
    #[cfg(unix)]
    if let Some(pgid) = pgid {
        if kill_process_group(pgid, libc::SIGTERM).is_ok() {
            return;
        }
    }
    #[cfg(not(unix))]
    let _ = pgid;
    let _ = child.start_kill();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;

    #[tokio::test]
    async fn collects_both_streams() {
        let child = Command::new("sh")
            .arg("-c")
            .arg("echo out; echo err >&2")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();
        let output = collect_output_with_timeout(child, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(output.status.success());
        assert_eq!(String::from_utf8_lossy(&output.stdout), "out\n");
        assert_eq!(String::from_utf8_lossy(&output.stderr), "err\n");
    }

    #[tokio::test]
    async fn times_out_and_kills() {
        let child = Command::new("sh")
            .arg("-c")
            .arg("sleep 5")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();
        let err = collect_output_with_timeout(child, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminates_whole_group() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg("sleep 30 & wait")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        isolate_process_group(&mut cmd);
        let mut child = cmd.spawn().unwrap();
        let pgid = child.id().map(|pid| pid as i32);
        terminate_process_group(&mut child, pgid, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(child.try_wait().unwrap().is_some());
    }
}

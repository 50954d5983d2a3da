use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use system_utils::path::expand_tilde;
use system_utils::process::{
    collect_output_with_timeout, isolate_process_group, start_kill_process_group,
    terminate_process_group,
};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::error::{LaunchError, Result};

const TERMINATE_GRACE: Duration = Duration::from_secs(1);

/// Words `sh` handles itself; a command starting with one of these is
/// never looked up on `$PATH`.
const SHELL_WORDS: &[&str] = &[
    "!", ".", ":", "[", "[[", "{", "}", "alias", "bg", "break", "case", "cd", "command",
    "continue", "do", "done", "echo", "elif", "else", "esac", "eval", "exec", "exit", "export",
    "false", "fc", "fg", "fi", "for", "function", "getopts", "hash", "if", "in", "jobs", "kill",
    "let", "local", "printf", "pwd", "read", "readonly", "return", "select", "set", "shift",
    "source", "test", "then", "times", "trap", "true", "type", "ulimit", "umask", "unalias",
    "unset", "until", "wait", "while",
];

/// How a process exited. `code` is `None` when it was killed by a signal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Exit {
    pub code: Option<i32>,
}

impl Exit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::ExitStatus> for Exit {
    fn from(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
        }
    }
}

impl fmt::Display for Exit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {code}"),
            None => f.write_str("signal"),
        }
    }
}

/// Standard input attached to a launched process.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum InputSource {
    #[default]
    Null,
    /// The caller's own stdin.
    Inherit,
    Bytes(Vec<u8>),
    File(PathBuf),
}

impl InputSource {
    /// `-` inherits, an empty string or `null` detaches, anything else is a file.
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "" | "null" => InputSource::Null,
            "-" => InputSource::Inherit,
            path => InputSource::File(PathBuf::from(path)),
        }
    }

    fn stdio(&self) -> std::io::Result<Stdio> {
        Ok(match self {
            InputSource::Null => Stdio::null(),
            InputSource::Inherit => Stdio::inherit(),
            InputSource::Bytes(_) => Stdio::piped(),
            InputSource::File(path) => Stdio::from(std::fs::File::open(path)?),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit: Exit,
    pub stdout: String,
    pub stderr: String,
}

/// Runs assembled command lines. Spawn failures are reported as
/// [`LaunchError::Spawn`] and are distinct from a non-zero exit, which is
/// returned as a normal [`CommandOutput`].
#[async_trait]
pub trait ProcessExecutor: Send + Sync {
    async fn run(
        &self,
        command: &str,
        input: &InputSource,
        timeout: Duration,
    ) -> Result<CommandOutput>;

    async fn spawn(&self, command: &str, input: &InputSource) -> Result<Box<dyn BackgroundProcess>>;
}

/// A detached process owned by whoever holds the handle.
#[async_trait]
pub trait BackgroundProcess: Send + Sync {
    fn id(&self) -> Option<u32>;

    /// `Some` once the process has exited; never blocks.
    fn try_exit(&mut self) -> Result<Option<Exit>>;

    /// Terminates the process and reaps it.
    async fn terminate(&mut self) -> Result<()>;

    /// Fire-and-forget kill for drop paths.
    fn start_kill(&mut self);
}

/// Runs commands through `sh -c`, the way a shell-out would.
#[derive(Clone, Debug)]
pub struct ShellExecutor {
    shell: String,
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }
}

impl ShellExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn command(&self, command: &str, input: &InputSource) -> Result<Command> {
        ensure_program(command)?;
        let stdin = input.stdio().map_err(|source| LaunchError::Spawn {
            command: command.to_string(),
            source,
        })?;
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c").arg(command).stdin(stdin);
        Ok(cmd)
    }
}

#[async_trait]
impl ProcessExecutor for ShellExecutor {
    async fn run(
        &self,
        command: &str,
        input: &InputSource,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let mut cmd = self.command(command, input)?;
        cmd.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = cmd.spawn().map_err(|source| LaunchError::Spawn {
            command: command.to_string(),
            source,
        })?;
        debug!(event = "exec.run", pid = ?child.id(), command, "spawned foreground command");
        if let InputSource::Bytes(bytes) = input {
            feed_stdin(&mut child, bytes.clone());
        }
        let output = collect_output_with_timeout(child, timeout)
            .await
            .map_err(|err| {
                if err.kind() == std::io::ErrorKind::TimedOut {
                    LaunchError::Timeout {
                        command: command.to_string(),
                        after: timeout,
                    }
                } else {
                    LaunchError::Io(err)
                }
            })?;
        Ok(CommandOutput {
            exit: output.status.into(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    async fn spawn(&self, command: &str, input: &InputSource) -> Result<Box<dyn BackgroundProcess>> {
        let mut cmd = self.command(command, input)?;
        cmd.stdout(Stdio::null()).stderr(Stdio::null());
        isolate_process_group(&mut cmd);
        let mut child = cmd.spawn().map_err(|source| LaunchError::Spawn {
            command: command.to_string(),
            source,
        })?;
        if let InputSource::Bytes(bytes) = input {
            feed_stdin(&mut child, bytes.clone());
        }
        let pgid = child.id().map(|pid| pid as i32);
        debug!(event = "exec.spawn", pid = ?pgid, command, "spawned background command");
        Ok(Box::new(ChildProcess {
            child,
            pgid,
            exit: None,
        }))
    }
}

fn feed_stdin(child: &mut Child, bytes: Vec<u8>) {
    if let Some(mut stdin) = child.stdin.take() {
        tokio::spawn(async move {
            if let Err(err) = stdin.write_all(&bytes).await {
                warn!(error = %err, "failed to write process stdin");
            }
        });
    }
}

/// Reports a missing local program as a spawn failure instead of letting
/// `sh` turn it into exit code 127. Anything the shell may resolve on its
/// own (keywords, builtins, expansions, assignments) is left to the shell.
fn ensure_program(command: &str) -> Result<()> {
    let Some(program) = leading_program(command) else {
        return Ok(());
    };
    let resolved = if program.starts_with("~/") {
        which::which(expand_tilde(&program))
    } else {
        which::which(&program)
    };
    if resolved.is_ok() {
        return Ok(());
    }
    Err(LaunchError::Spawn {
        command: command.to_string(),
        source: std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{program} not found"),
        ),
    })
}

/// The program `sh` would exec for `command`, if it is a plain name or path.
fn leading_program(command: &str) -> Option<String> {
    let words = shell_words::split(command).ok()?;
    let first = words.first()?;
    let program = first
        .split(|c| matches!(c, ';' | '&' | '|' | '<' | '>' | '(' | ')'))
        .next()
        .unwrap_or_default();
    if program.is_empty()
        || program.contains(['=', '$', '`', '*', '?'])
        || (program.starts_with('~') && !program.starts_with("~/"))
        || SHELL_WORDS.contains(&program)
    {
        return None;
    }
    Some(program.to_string())
}

struct ChildProcess {
    child: Child,
    pgid: Option<i32>,
    exit: Option<Exit>,
}

#[async_trait]
impl BackgroundProcess for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.pgid.map(|pid| pid as u32)
    }

    fn try_exit(&mut self) -> Result<Option<Exit>> {
        if self.exit.is_none() {
            self.exit = self.child.try_wait()?.map(Exit::from);
        }
        Ok(self.exit)
    }

    async fn terminate(&mut self) -> Result<()> {
        terminate_process_group(&mut self.child, self.pgid, TERMINATE_GRACE).await?;
        Ok(())
    }

    fn start_kill(&mut self) {
        if self.exit.is_none() {
            start_kill_process_group(&mut self.child, self.pgid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_captures_stdout_and_exit() {
        let output = ShellExecutor::new()
            .run("echo hi; exit 3", &InputSource::Null, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(output.stdout, "hi\n");
        assert_eq!(output.exit, Exit { code: Some(3) });
        assert!(!output.exit.success());
    }

    #[tokio::test]
    async fn run_feeds_bytes_to_stdin() {
        let output = ShellExecutor::new()
            .run(
                "cat",
                &InputSource::Bytes(b"piped".to_vec()),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(output.stdout, "piped");
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let err = ShellExecutor::new()
            .run(
                "definitely-not-a-real-binary-4821 -q host",
                &InputSource::Null,
                Duration::from_secs(5),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LaunchError::Spawn { .. }));
    }

    #[tokio::test]
    async fn shell_keywords_and_builtins_reach_the_shell() {
        let executor = ShellExecutor::new();
        for command in [
            "if true; then echo hi; fi",
            "for word in hi; do echo $word; done",
            "{ echo hi; }",
            "(echo hi)",
            "umask 022; echo hi",
            "GREETING=hi; echo $GREETING",
        ] {
            let output = executor
                .run(command, &InputSource::Null, Duration::from_secs(5))
                .await
                .unwrap();
            assert_eq!(output.stdout, "hi\n", "{command}");
        }
    }

    #[test]
    fn leading_program_skips_what_the_shell_resolves() {
        assert_eq!(leading_program("ssh -q host"), Some("ssh".to_string()));
        assert_eq!(leading_program("ls;echo x"), Some("ls".to_string()));
        assert_eq!(leading_program("~/bin/tool -p 1"), Some("~/bin/tool".to_string()));
        assert_eq!(leading_program("while true; do :; done"), None);
        assert_eq!(leading_program("ulimit -n 1024"), None);
        assert_eq!(leading_program("$HOME/bin/tool"), None);
        assert_eq!(leading_program("~other/bin/tool"), None);
        assert_eq!(leading_program("(cd /tmp)"), None);
    }

    #[tokio::test]
    async fn missing_tilde_program_is_a_spawn_error() {
        let err = ShellExecutor::new()
            .run(
                "~/definitely-not-here-4821/tool",
                &InputSource::Null,
                Duration::from_secs(5),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LaunchError::Spawn { .. }));
    }

    #[tokio::test]
    async fn timeout_is_reported() {
        let err = ShellExecutor::new()
            .run("sleep 5", &InputSource::Null, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, LaunchError::Timeout { .. }));
    }

    #[tokio::test]
    async fn background_process_can_be_terminated() {
        let mut process = ShellExecutor::new()
            .spawn("sleep 30", &InputSource::Null)
            .await
            .unwrap();
        assert!(process.id().is_some());
        assert_eq!(process.try_exit().unwrap(), None);
        process.terminate().await.unwrap();
        assert!(process.try_exit().unwrap().is_some());
    }

    #[test]
    fn input_source_parses_cli_values() {
        assert_eq!(InputSource::parse(""), InputSource::Null);
        assert_eq!(InputSource::parse("-"), InputSource::Inherit);
        assert_eq!(
            InputSource::parse("/tmp/in.txt"),
            InputSource::File(PathBuf::from("/tmp/in.txt"))
        );
    }
}

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::command::remote_command;
use crate::error::{LaunchError, Result};
use crate::exec::{BackgroundProcess, Exit, InputSource, ProcessExecutor};

pub(crate) const DEFAULT_BINARY: &str = "ssh";
pub(crate) const DEFAULT_HOST: &str = "localhost";
pub(crate) const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Overrides applied by [`Launcher::stage`]. Unset fields keep their value.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageOptions {
    pub host: Option<String>,
    pub command: Option<String>,
    #[serde(alias = "launcher")]
    pub binary: Option<String>,
    pub options: Option<String>,
    pub background: Option<bool>,
    #[serde(skip)]
    pub input: Option<InputSource>,
}

impl StageOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = Some(binary.into());
        self
    }

    pub fn options(mut self, options: impl Into<String>) -> Self {
        self.options = Some(options.into());
        self
    }

    pub fn background(mut self, background: bool) -> Self {
        self.background = Some(background);
        self
    }

    pub fn input(mut self, input: InputSource) -> Self {
        self.input = Some(input);
        self
    }

    /// Applies one textual `key=value` override. Unknown keys are rejected.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "host" => self.host = Some(value.to_string()),
            "command" => self.command = Some(value.to_string()),
            "binary" | "launcher" => self.binary = Some(value.to_string()),
            "options" => self.options = Some(value.to_string()),
            "background" => self.background = Some(parse_bool(key, value)?),
            "input" | "stdin" => self.input = Some(InputSource::parse(value)),
            other => return Err(LaunchError::UnknownOption(other.to_string())),
        }
        Ok(())
    }
}

pub(crate) fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" | "on" | "bg" | "background" => Ok(true),
        "false" | "no" | "0" | "off" | "fg" | "foreground" => Ok(false),
        _ => Err(LaunchError::InvalidOption {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

/// The resolved state of a launcher after staging.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LaunchConfig {
    pub name: String,
    pub host: String,
    pub binary: String,
    pub options: String,
    pub payload: String,
    pub background: bool,
    pub input: InputSource,
    pub assembled: String,
}

/// What [`Launcher::launch`] did.
pub enum Launched {
    /// A foreground run finished; the launcher holds the captured response.
    Completed { exit: Exit, stderr: String },
    /// A background run is detached; the handle owns the process.
    Detached(Box<dyn BackgroundProcess>),
}

impl Launched {
    pub fn into_background(self) -> Option<Box<dyn BackgroundProcess>> {
        match self {
            Launched::Detached(process) => Some(process),
            Launched::Completed { .. } => None,
        }
    }

    /// Treats a non-zero foreground exit as [`LaunchError::CommandFailed`].
    pub(crate) fn ensure_success(&self, command: &str) -> Result<()> {
        match self {
            Launched::Completed { exit, stderr } if !exit.success() => {
                Err(LaunchError::CommandFailed {
                    command: command.to_string(),
                    exit: *exit,
                    detail: stderr.trim().to_string(),
                })
            }
            _ => Ok(()),
        }
    }
}

/// Stages and runs one command on a host through `binary` (`ssh` by default).
///
/// The payload is stored on its own and `assembled` is rebuilt from the
/// current fields on every [`stage`](Self::stage), so restaging with a new
/// host or options never wraps the previous invocation a second time.
pub struct Launcher {
    name: String,
    host: String,
    binary: String,
    options: String,
    payload: String,
    background: bool,
    input: InputSource,
    assembled: String,
    response: Option<String>,
    timeout: Duration,
    executor: Arc<dyn ProcessExecutor>,
}

impl Launcher {
    pub fn new(name: impl Into<String>, executor: Arc<dyn ProcessExecutor>) -> Self {
        let name = name.into();
        let payload = format!("echo {name}");
        let mut launcher = Self {
            name,
            host: DEFAULT_HOST.to_string(),
            binary: DEFAULT_BINARY.to_string(),
            options: String::new(),
            payload,
            background: false,
            input: InputSource::Null,
            assembled: String::new(),
            response: None,
            timeout: COMMAND_TIMEOUT,
            executor,
        };
        launcher.rebuild();
        launcher
    }

    /// Upper bound for a foreground run.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn stage(&mut self, options: StageOptions) -> LaunchConfig {
        let StageOptions {
            host,
            command,
            binary,
            options,
            background,
            input,
        } = options;
        if let Some(host) = host {
            self.host = host;
        }
        if let Some(command) = command {
            self.payload = command;
        }
        if let Some(binary) = binary {
            self.binary = binary;
        }
        if let Some(options) = options {
            self.options = options;
        }
        if let Some(background) = background {
            self.background = background;
        }
        if let Some(input) = input {
            self.input = input;
        }
        self.response = None;
        self.rebuild();
        self.config()
    }

    pub fn config(&self) -> LaunchConfig {
        LaunchConfig {
            name: self.name.clone(),
            host: self.host.clone(),
            binary: self.binary.clone(),
            options: self.options.clone(),
            payload: self.payload.clone(),
            background: self.background,
            input: self.input.clone(),
            assembled: self.assembled.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn assembled(&self) -> &str {
        &self.assembled
    }

    /// Output of the last completed foreground run.
    pub fn response(&self) -> Option<&str> {
        self.response.as_deref()
    }

    pub async fn launch(&mut self) -> Result<Launched> {
        self.response = None;
        let (launched, response) = execute(
            self.executor.as_ref(),
            &self.name,
            &self.assembled,
            self.background,
            &self.input,
            self.timeout,
        )
        .await?;
        self.response = response;
        Ok(launched)
    }

    fn rebuild(&mut self) {
        self.assembled = remote_command(&self.binary, &self.options, &self.host, &self.payload);
    }
}

/// Shared launch path of [`Launcher`] and [`CopyLauncher`](crate::CopyLauncher).
pub(crate) async fn execute(
    executor: &dyn ProcessExecutor,
    name: &str,
    assembled: &str,
    background: bool,
    input: &InputSource,
    timeout: Duration,
) -> Result<(Launched, Option<String>)> {
    if background {
        let process = executor.spawn(assembled, input).await?;
        info!(
            event = "launch.background",
            launcher = name,
            pid = ?process.id(),
            command = assembled,
            "launched in background"
        );
        return Ok((Launched::Detached(process), None));
    }

    info!(event = "launch.foreground", launcher = name, command = assembled, "launching");
    let output = executor.run(assembled, input, timeout).await?;
    if !output.exit.success() {
        warn!(
            event = "launch.exit_nonzero",
            launcher = name,
            exit = %output.exit,
            stderr = output.stderr.trim(),
            "command exited unsuccessfully"
        );
    }
    let response = output.stdout.trim_end().to_string();
    Ok((
        Launched::Completed {
            exit: output.exit,
            stderr: output.stderr,
        },
        Some(response),
    ))
}

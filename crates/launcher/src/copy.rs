use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::command::copy_command;
use crate::error::Result;
use crate::exec::{InputSource, ProcessExecutor};
use crate::launch::{execute, Launched};

pub(crate) const DEFAULT_COPY_BINARY: &str = "scp";
pub(crate) const COPY_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CopyStageOptions {
    pub source: Option<String>,
    pub destination: Option<String>,
    #[serde(alias = "launcher")]
    pub binary: Option<String>,
    pub options: Option<String>,
    pub background: Option<bool>,
    #[serde(skip)]
    pub input: Option<InputSource>,
}

impl CopyStageOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Usually `host:path`.
    pub fn destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
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
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CopyConfig {
    pub name: String,
    pub source: String,
    pub destination: String,
    pub binary: String,
    pub options: String,
    pub background: bool,
    pub input: InputSource,
    pub assembled: String,
}

/// A launcher whose payload is a `source destination` pair handed to `scp`.
pub struct CopyLauncher {
    name: String,
    source: String,
    destination: String,
    binary: String,
    options: String,
    background: bool,
    input: InputSource,
    assembled: String,
    response: Option<String>,
    timeout: Duration,
    executor: Arc<dyn ProcessExecutor>,
}

impl CopyLauncher {
    pub fn new(name: impl Into<String>, executor: Arc<dyn ProcessExecutor>) -> Self {
        let mut launcher = Self {
            name: name.into(),
            source: String::new(),
            destination: String::new(),
            binary: DEFAULT_COPY_BINARY.to_string(),
            options: String::new(),
            background: false,
            input: InputSource::Null,
            assembled: String::new(),
            response: None,
            timeout: COPY_TIMEOUT,
            executor,
        };
        launcher.rebuild();
        launcher
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn stage(&mut self, options: CopyStageOptions) -> CopyConfig {
        if let Some(source) = options.source {
            self.source = source;
        }
        if let Some(destination) = options.destination {
            self.destination = destination;
        }
        if let Some(binary) = options.binary {
            self.binary = binary;
        }
        if let Some(flags) = options.options {
            self.options = flags;
        }
        if let Some(background) = options.background {
            self.background = background;
        }
        if let Some(input) = options.input {
            self.input = input;
        }
        self.response = None;
        self.rebuild();
        self.config()
    }

    pub fn config(&self) -> CopyConfig {
        CopyConfig {
            name: self.name.clone(),
            source: self.source.clone(),
            destination: self.destination.clone(),
            binary: self.binary.clone(),
            options: self.options.clone(),
            background: self.background,
            input: self.input.clone(),
            assembled: self.assembled.clone(),
        }
    }

    pub fn assembled(&self) -> &str {
        &self.assembled
    }

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

    /// Foreground copy that fails on a non-zero exit.
    pub async fn copy(&mut self) -> Result<()> {
        self.stage(CopyStageOptions::new().background(false));
        let launched = self.launch().await?;
        launched.ensure_success(&self.assembled)
    }

    fn rebuild(&mut self) {
        self.assembled = copy_command(&self.binary, &self.options, &self.source, &self.destination);
    }
}

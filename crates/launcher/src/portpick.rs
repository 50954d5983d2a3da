use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use uuid::Uuid;

use crate::artifact::ArtifactResolver;
use crate::command::join_remote;
use crate::copy::{CopyLauncher, CopyStageOptions, COPY_TIMEOUT, DEFAULT_COPY_BINARY};
use crate::error::{LaunchError, Result, Stage};
use crate::exec::ProcessExecutor;
use crate::launch::{Launcher, StageOptions, COMMAND_TIMEOUT, DEFAULT_BINARY};

#[derive(Clone, Debug)]
pub struct PortPickConfig {
    /// Logical name handed to the artifact resolver.
    pub helper: String,
    /// Program that runs the staged helper; empty runs it directly.
    pub interpreter: String,
    pub staging_dir: String,
    pub binary: String,
    pub options: String,
    pub copy_binary: String,
    pub copy_options: String,
    pub command_timeout: Duration,
    pub copy_timeout: Duration,
}

impl Default for PortPickConfig {
    fn default() -> Self {
        Self {
            helper: "port-probe".to_string(),
            interpreter: String::new(),
            staging_dir: "~".to_string(),
            binary: DEFAULT_BINARY.to_string(),
            options: "-q".to_string(),
            copy_binary: DEFAULT_COPY_BINARY.to_string(),
            copy_options: "-q -p".to_string(),
            command_timeout: COMMAND_TIMEOUT,
            copy_timeout: COPY_TIMEOUT,
        }
    }
}

/// Finds a free TCP port on a remote host by staging a probe there,
/// running it and reading back the number it prints.
///
/// The steps run strictly in order: copy, execute, parse, clean up. A copy
/// or execute failure aborts immediately. Cleanup runs once the output has
/// been parsed, whatever the parse result, and its failure is only logged.
pub struct PortPicker {
    executor: Arc<dyn ProcessExecutor>,
    resolver: Arc<dyn ArtifactResolver>,
    config: PortPickConfig,
}

impl PortPicker {
    pub fn new(
        executor: Arc<dyn ProcessExecutor>,
        resolver: Arc<dyn ArtifactResolver>,
        config: PortPickConfig,
    ) -> Self {
        Self {
            executor,
            resolver,
            config,
        }
    }

    pub async fn pick(&self, host: &str) -> Result<u16> {
        let artifact = self.resolver.resolve(&self.config.helper)?;
        let file_name = artifact.file_name();
        let remote_path = join_remote(
            &self.config.staging_dir,
            &format!("{file_name}.{}", Uuid::new_v4().simple()),
        );

        info!(event = "portpick.copy", host, helper = %artifact.path.display(), "staging port probe");
        let mut copier = CopyLauncher::new(format!("copy_{file_name}"), Arc::clone(&self.executor))
            .with_timeout(self.config.copy_timeout);
        copier.stage(
            CopyStageOptions::new()
                .binary(&self.config.copy_binary)
                .options(&self.config.copy_options)
                .source(artifact.path.to_string_lossy())
                .destination(format!("{host}:{remote_path}")),
        );
        copier.copy().await.map_err(|err| err.at(Stage::Copy, host))?;

        let probe = if self.config.interpreter.trim().is_empty() {
            remote_path.clone()
        } else {
            format!("{} {}", self.config.interpreter.trim(), remote_path)
        };
        info!(event = "portpick.execute", host, command = %probe, "running port probe");
        let mut launcher = Launcher::new("portpick", Arc::clone(&self.executor))
            .with_timeout(self.config.command_timeout);
        launcher.stage(
            StageOptions::new()
                .binary(&self.config.binary)
                .options(&self.config.options)
                .host(host)
                .command(probe)
                .background(false),
        );
        launcher
            .launch()
            .await
            .map_err(|err| err.at(Stage::Execute, host))?;
        let output = launcher.response().unwrap_or_default().to_string();
        let picked = parse_port(&output);

        let cleanup = format!("rm -f {remote_path}");
        launcher.stage(StageOptions::new().command(&cleanup));
        match launcher.launch().await {
            Ok(launched) => {
                if let Err(err) = launched.ensure_success(launcher.assembled()) {
                    warn!(event = "portpick.cleanup.failed", host, error = %err, "failed to remove port probe");
                }
            }
            Err(err) => {
                warn!(event = "portpick.cleanup.failed", host, error = %err, "failed to remove port probe");
            }
        }

        let port = picked.ok_or_else(|| LaunchError::PortPick {
            host: host.to_string(),
            output,
        })?;
        info!(event = "portpick.done", host, port, "picked remote port");
        Ok(port)
    }
}

/// The probe must print exactly one base-10 port number.
pub fn parse_port(output: &str) -> Option<u16> {
    output.trim().parse::<u16>().ok().filter(|port| *port != 0)
}

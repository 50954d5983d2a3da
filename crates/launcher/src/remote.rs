use std::sync::Arc;
use std::time::Duration;

use system_utils::path::expand_tilde;
use tracing::info;

use crate::artifact::ArtifactResolver;
use crate::bootstrap::{BootstrapConfig, ServerBootstrap};
use crate::copy::{CopyLauncher, CopyStageOptions, COPY_TIMEOUT, DEFAULT_COPY_BINARY};
use crate::error::Result;
use crate::exec::{BackgroundProcess, ProcessExecutor};
use crate::launch::{Launcher, StageOptions, COMMAND_TIMEOUT, DEFAULT_BINARY};
use crate::portpick::{PortPickConfig, PortPicker};
use crate::tunnel::{Tunnel, TunnelConfig, TunnelHandle};

#[derive(Clone, Debug)]
pub struct RemoteDefaults {
    pub binary: String,
    pub copy_binary: String,
    pub options: String,
    pub copy_options: String,
    pub command_timeout: Duration,
    pub copy_timeout: Duration,
}

impl Default for RemoteDefaults {
    fn default() -> Self {
        Self {
            binary: DEFAULT_BINARY.to_string(),
            copy_binary: DEFAULT_COPY_BINARY.to_string(),
            options: "-q".to_string(),
            copy_options: "-q".to_string(),
            command_timeout: COMMAND_TIMEOUT,
            copy_timeout: COPY_TIMEOUT,
        }
    }
}

/// One-call helpers over the launchers for a single host/command pair.
pub struct Remote {
    executor: Arc<dyn ProcessExecutor>,
    resolver: Arc<dyn ArtifactResolver>,
    defaults: RemoteDefaults,
    portpick: PortPickConfig,
    tunnel: TunnelConfig,
    bootstrap: BootstrapConfig,
}

impl Remote {
    pub fn new(executor: Arc<dyn ProcessExecutor>, resolver: Arc<dyn ArtifactResolver>) -> Self {
        Self {
            executor,
            resolver,
            defaults: RemoteDefaults::default(),
            portpick: PortPickConfig::default(),
            tunnel: TunnelConfig::default(),
            bootstrap: BootstrapConfig::default(),
        }
    }

    pub fn with_defaults(mut self, defaults: RemoteDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_portpick(mut self, config: PortPickConfig) -> Self {
        self.portpick = config;
        self
    }

    pub fn with_tunnel(mut self, config: TunnelConfig) -> Self {
        self.tunnel = config;
        self
    }

    pub fn with_bootstrap(mut self, config: BootstrapConfig) -> Self {
        self.bootstrap = config;
        self
    }

    /// A launcher pre-staged with the default binary and options.
    pub fn launcher(&self, name: &str, host: &str) -> Launcher {
        let mut launcher = Launcher::new(name, Arc::clone(&self.executor))
            .with_timeout(self.defaults.command_timeout);
        launcher.stage(
            StageOptions::new()
                .binary(&self.defaults.binary)
                .options(&self.defaults.options)
                .host(host),
        );
        launcher
    }

    /// Copies a local file to `host:dest`.
    pub async fn copy(&self, file: &str, host: &str, dest: &str) -> Result<()> {
        let source = expand_tilde(file);
        let mut copier = CopyLauncher::new(format!("copy_{file}"), Arc::clone(&self.executor))
            .with_timeout(self.defaults.copy_timeout);
        copier.stage(
            CopyStageOptions::new()
                .binary(&self.defaults.copy_binary)
                .options(&self.defaults.copy_options)
                .source(source.to_string_lossy())
                .destination(format!("{host}:{dest}")),
        );
        copier.copy().await
    }

    /// Runs `command` on `host` and returns what it printed.
    pub async fn run(&self, command: &str, host: &str) -> Result<String> {
        let mut launcher = self.launcher(command, host);
        launcher.stage(StageOptions::new().command(command).background(false));
        launcher.launch().await?;
        Ok(launcher.response().unwrap_or_default().to_string())
    }

    /// Starts `command` on `host` without waiting for it.
    pub async fn spawn(&self, command: &str, host: &str) -> Result<Box<dyn BackgroundProcess>> {
        let mut launcher = self.launcher(command, host);
        launcher.stage(StageOptions::new().command(command).background(true));
        let launched = launcher.launch().await?;
        Ok(launched
            .into_background()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "launch did not detach"))?)
    }

    pub async fn kill(&self, pid: u32, host: &str) -> Result<String> {
        info!(event = "remote.kill", host, pid, "terminating remote process");
        self.run(&format!("kill -n TERM {pid}"), host).await
    }

    /// Best-effort pid lookup through `ps ax | grep`; see [`parse_pid`].
    pub async fn getpid(&self, target: &str, host: &str) -> Result<Option<u32>> {
        let pattern = shell_words::quote(target);
        let output = self.run(&format!("ps ax | grep {pattern}"), host).await?;
        Ok(parse_pid(&output))
    }

    pub fn port_picker(&self) -> PortPicker {
        PortPicker::new(
            Arc::clone(&self.executor),
            Arc::clone(&self.resolver),
            self.portpick.clone(),
        )
    }

    pub fn tunnel(&self) -> Tunnel {
        Tunnel::with_config("Tunnel", Arc::clone(&self.executor), self.tunnel.clone())
    }

    pub fn server_bootstrap(&self) -> ServerBootstrap {
        ServerBootstrap::new(
            Arc::clone(&self.executor),
            self.port_picker(),
            self.tunnel(),
            self.bootstrap.clone(),
        )
    }

    pub async fn pickport(&self, host: &str) -> Result<u16> {
        self.port_picker().pick(host).await
    }

    pub async fn connect(&self, host: &str, port: u16) -> Result<(TunnelHandle, u16)> {
        let handle = self.tunnel().connect(host, port).await?;
        let local_port = handle.local_port();
        Ok((handle, local_port))
    }

    pub async fn serve(
        &self,
        server: &str,
        host: &str,
        port: u16,
    ) -> Result<Box<dyn BackgroundProcess>> {
        self.server_bootstrap().serve(server, host, port).await
    }

    pub async fn bootstrap(&self, server: &str, host: &str) -> Result<(TunnelHandle, u16)> {
        self.server_bootstrap().start(server, host).await
    }
}

/// Pid from `ps ax | grep` output: the first line that is not the grep
/// itself, first token that parses. BSD and GNU `ps` both lead with the pid
/// but other layouts are not handled.
pub fn parse_pid(output: &str) -> Option<u32> {
    output
        .lines()
        .filter(|line| !line.contains("grep"))
        .find_map(|line| line.split_whitespace().find_map(|word| word.parse().ok()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeExecutor, FixedResolver};

    fn remote(executor: Arc<FakeExecutor>) -> Remote {
        Remote::new(executor, Arc::new(FixedResolver))
    }

    #[test]
    fn parse_pid_skips_the_grep_line() {
        let output = "  812 ?  S  0:00 bash -c ps ax | grep 'echo-server'\n  \
                      733 ?  Sl 0:02 python ~/bin/echo-server -p 8000\n";
        assert_eq!(parse_pid(output), Some(733));
        assert_eq!(parse_pid("814 pts/0 S+ 0:00 grep x"), None);
        assert_eq!(parse_pid(""), None);
    }

    #[tokio::test]
    async fn run_and_kill_use_the_expected_templates() {
        let executor = Arc::new(FakeExecutor::new());
        executor.reply("hostname", 0, "node7\n");
        let remote = remote(executor.clone());
        assert_eq!(remote.run("hostname", "node7").await.unwrap(), "node7");
        remote.kill(733, "node7").await.unwrap();
        assert_eq!(
            executor.commands(),
            vec![
                "ssh -q node7 \"hostname\"".to_string(),
                "ssh -q node7 \"kill -n TERM 733\"".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn getpid_reads_ps_output() {
        let executor = Arc::new(FakeExecutor::new());
        executor.reply("ps ax", 0, " 733 ? Sl 0:02 ~/bin/srv -p 8000\n");
        let pid = remote(executor.clone()).getpid("srv", "n").await.unwrap();
        assert_eq!(pid, Some(733));
        assert_eq!(executor.commands()[0], "ssh -q n \"ps ax | grep srv\"");
    }

    #[tokio::test]
    async fn getpid_quotes_the_target() {
        let executor = Arc::new(FakeExecutor::new());
        remote(executor.clone()).getpid("it's up", "n").await.unwrap();
        let command = &executor.commands()[0];
        assert!(command.contains("grep 'it'"), "{command}");
        assert!(!command.contains("grep 'it's up'"), "{command}");
        let words = shell_words::split(command).unwrap();
        let remote_side = shell_words::split(&words[3]).unwrap();
        assert_eq!(remote_side.last().map(String::as_str), Some("it's up"));
    }

    #[tokio::test]
    async fn copy_targets_host_and_dest() {
        let executor = Arc::new(FakeExecutor::new());
        remote(executor.clone())
            .copy("/etc/hosts", "user@n", "/tmp")
            .await
            .unwrap();
        assert_eq!(executor.commands(), vec!["scp -q /etc/hosts user@n:/tmp".to_string()]);
    }

    #[tokio::test]
    async fn copy_uses_copy_options() {
        let executor = Arc::new(FakeExecutor::new());
        let defaults = RemoteDefaults {
            options: "-q -o BatchMode=yes".to_string(),
            copy_options: "-q -p".to_string(),
            ..RemoteDefaults::default()
        };
        remote(executor.clone())
            .with_defaults(defaults)
            .copy("/etc/hosts", "n", "/tmp")
            .await
            .unwrap();
        assert_eq!(executor.commands(), vec!["scp -q -p /etc/hosts n:/tmp".to_string()]);
    }

    #[tokio::test]
    async fn spawn_detaches() {
        let executor = Arc::new(FakeExecutor::new());
        let mut process = remote(executor.clone()).spawn("sleep 60", "n").await.unwrap();
        assert!(process.try_exit().unwrap().is_none());
        assert!(executor.calls()[0].background);
        process.terminate().await.unwrap();
    }
}

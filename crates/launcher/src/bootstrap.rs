use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::command::join_remote;
use crate::error::{LaunchError, Result, Stage};
use crate::exec::{BackgroundProcess, ProcessExecutor};
use crate::launch::{Launcher, StageOptions, DEFAULT_BINARY};
use crate::portpick::PortPicker;
use crate::tunnel::{Tunnel, TunnelHandle};

#[derive(Clone, Debug)]
pub struct BootstrapConfig {
    pub binary: String,
    pub options: String,
    /// Login profile sourced before the server starts.
    pub profile: String,
    pub server_dir: String,
    /// How long the freshly started server is watched before the tunnel.
    pub settle: Duration,
    pub settle_interval: Duration,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            binary: DEFAULT_BINARY.to_string(),
            options: "-q".to_string(),
            profile: ".bash_profile".to_string(),
            server_dir: "~/bin".to_string(),
            settle: Duration::from_secs(2),
            settle_interval: Duration::from_millis(100),
        }
    }
}

/// Starts a remote server on a negotiated port and makes it reachable
/// through a local forward.
pub struct ServerBootstrap {
    executor: Arc<dyn ProcessExecutor>,
    picker: PortPicker,
    tunnel: Tunnel,
    config: BootstrapConfig,
}

impl ServerBootstrap {
    pub fn new(
        executor: Arc<dyn ProcessExecutor>,
        picker: PortPicker,
        tunnel: Tunnel,
        config: BootstrapConfig,
    ) -> Self {
        Self {
            executor,
            picker,
            tunnel,
            config,
        }
    }

    /// `source <profile>; <server_dir>/<server> -p <port>`
    pub fn server_command(&self, server: &str, port: u16) -> String {
        format!(
            "source {}; {} -p {}",
            self.config.profile,
            join_remote(&self.config.server_dir, server),
            port
        )
    }

    /// Launches `server` on `host` in the background, bound to `port`.
    pub async fn serve(
        &self,
        server: &str,
        host: &str,
        port: u16,
    ) -> Result<Box<dyn BackgroundProcess>> {
        let command = self.server_command(server, port);
        let mut launcher = Launcher::new(command.clone(), Arc::clone(&self.executor));
        launcher.stage(
            StageOptions::new()
                .binary(&self.config.binary)
                .options(&self.config.options)
                .host(host)
                .command(command)
                .background(true),
        );
        launcher
            .launch()
            .await
            .map_err(|err| err.at(Stage::Serve, host))?
            .into_background()
            .ok_or_else(|| {
                LaunchError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "server launch did not detach",
                ))
            })
    }

    /// Port pick, server start, settle, tunnel; strictly in that order.
    ///
    /// Nothing is rolled back: when the tunnel fails the remote server keeps
    /// running and must be stopped by the caller.
    pub async fn start(&self, server: &str, host: &str) -> Result<(TunnelHandle, u16)> {
        info!(event = "bootstrap.start", host, server, "bootstrapping remote server");
        let step = BootstrapStep { host, server };
        let port = step.run("pick_port", None, || self.picker.pick(host)).await?;
        let mut process = step
            .run("start_server", Some(port), || self.serve(server, host, port))
            .await?;
        step.run("settle", Some(port), || self.settle(process.as_mut(), host))
            .await?;
        let tunnel = step
            .run("connect_tunnel", Some(port), || self.tunnel.connect(host, port))
            .await?;
        let local_port = tunnel.local_port();
        info!(
            event = "bootstrap.ready",
            host,
            server,
            remote_port = port,
            local_port,
            server_pid = ?process.id(),
            "remote server reachable"
        );
        Ok((tunnel, local_port))
    }

    /// Watches the server launch for the settle window. An early exit is
    /// worth a warning but is not fatal: the server may have daemonized.
    async fn settle(&self, process: &mut dyn BackgroundProcess, host: &str) -> Result<()> {
        let deadline = Instant::now() + self.config.settle;
        loop {
            if let Some(exit) = process.try_exit()? {
                warn!(
                    event = "bootstrap.serve.exited",
                    host,
                    exit = %exit,
                    "server launch exited during settle"
                );
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Ok(());
            }
            sleep(self.config.settle_interval).await;
        }
    }
}

/// Which server on which host a step belongs to; stamped on every step event.
struct BootstrapStep<'a> {
    host: &'a str,
    server: &'a str,
}

impl BootstrapStep<'_> {
    async fn run<T, F, Fut>(&self, step: &'static str, remote_port: Option<u16>, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        debug!(
            event = "bootstrap.step.start",
            host = self.host,
            server = self.server,
            step,
            remote_port,
            "bootstrap step start"
        );
        let start = Instant::now();
        let result = f().await;
        let elapsed_ms = start.elapsed().as_millis();
        match &result {
            Ok(_) => info!(
                event = "bootstrap.step.done",
                host = self.host,
                server = self.server,
                step,
                remote_port,
                elapsed_ms,
                "bootstrap step done"
            ),
            Err(err) => warn!(
                event = "bootstrap.step.failed",
                host = self.host,
                server = self.server,
                step,
                remote_port,
                elapsed_ms,
                error = %err,
                "bootstrap step failed"
            ),
        }
        result
    }
}

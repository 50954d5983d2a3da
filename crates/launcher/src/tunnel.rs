use std::net::{Ipv4Addr, TcpListener};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::{LaunchError, Result};
use crate::exec::{BackgroundProcess, Exit, ProcessExecutor};
use crate::launch::{Launcher, StageOptions, DEFAULT_BINARY};

#[derive(Clone, Debug)]
pub struct TunnelConfig {
    pub binary: String,
    pub options: String,
    /// Destination host of the forward as seen from the remote end;
    /// `None` forwards to the remote host's own name.
    pub forward_host: Option<String>,
    pub ready_attempts: u32,
    pub ready_interval: Duration,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            binary: DEFAULT_BINARY.to_string(),
            options: "-q".to_string(),
            forward_host: None,
            ready_attempts: 20,
            ready_interval: Duration::from_millis(100),
        }
    }
}

/// Opens SSH local forwards: `127.0.0.1:<local>` to `<remote_host>:<port>`.
pub struct Tunnel {
    name: String,
    executor: Arc<dyn ProcessExecutor>,
    config: TunnelConfig,
}

impl Tunnel {
    pub fn new(name: impl Into<String>, executor: Arc<dyn ProcessExecutor>) -> Self {
        Self::with_config(name, executor, TunnelConfig::default())
    }

    pub fn with_config(
        name: impl Into<String>,
        executor: Arc<dyn ProcessExecutor>,
        config: TunnelConfig,
    ) -> Self {
        Self {
            name: name.into(),
            executor,
            config,
        }
    }

    /// Picks a free local port, starts the forward in the background and
    /// returns once the forwarding process is confirmed running.
    ///
    /// Readiness is polled: each attempt fails fast if the process has
    /// exited and succeeds as soon as the local end accepts a connection.
    /// When attempts run out with the process still alive the tunnel is
    /// handed out anyway; it is the remote service that is slow, not SSH.
    pub async fn connect(&self, remote_host: &str, remote_port: u16) -> Result<TunnelHandle> {
        let local_port = pick_local_port()?;
        let forward_host = self.config.forward_host.as_deref().unwrap_or(remote_host);
        let options = format!(
            "{} -N -o ExitOnForwardFailure=yes -L {local_port}:{forward_host}:{remote_port}",
            self.config.options
        );
        let mut launcher = Launcher::new(self.name.clone(), Arc::clone(&self.executor));
        launcher.stage(
            StageOptions::new()
                .binary(&self.config.binary)
                .options(options)
                .host(remote_host)
                .command("")
                .background(true),
        );
        let process = launcher
            .launch()
            .await?
            .into_background()
            .ok_or_else(|| tunnel_error(remote_host, remote_port, "forward did not detach"))?;

        let mut handle = TunnelHandle {
            remote_host: remote_host.to_string(),
            remote_port,
            local_port,
            process: Some(process),
        };
        self.wait_ready(&mut handle).await?;
        info!(
            event = "tunnel.ready",
            tunnel = %self.name,
            local_port,
            remote_host,
            remote_port,
            "tunnel established"
        );
        Ok(handle)
    }

    async fn wait_ready(&self, handle: &mut TunnelHandle) -> Result<()> {
        let mut accepting = false;
        for attempt in 0..self.config.ready_attempts.max(1) {
            self.ensure_running(handle, "forward process exited immediately")?;
            if TcpStream::connect((Ipv4Addr::LOCALHOST, handle.local_port))
                .await
                .is_ok()
            {
                debug!(attempt, local_port = handle.local_port, "tunnel accepting");
                accepting = true;
                break;
            }
            sleep(self.config.ready_interval).await;
        }
        // Something else may own the local port; ssh then fails the forward
        // and exits shortly after.
        if accepting {
            sleep(self.config.ready_interval).await;
        }
        self.ensure_running(handle, "forward process exited")?;
        if !accepting {
            warn!(
                event = "tunnel.unconfirmed",
                local_port = handle.local_port,
                "forward running but local port not accepting yet"
            );
        }
        Ok(())
    }

    fn ensure_running(&self, handle: &mut TunnelHandle, reason: &str) -> Result<()> {
        match handle.exit_status()? {
            Some(exit) => Err(tunnel_error(
                &handle.remote_host,
                handle.remote_port,
                &format!("{reason} with {exit}"),
            )),
            None => Ok(()),
        }
    }
}

fn tunnel_error(host: &str, remote_port: u16, reason: &str) -> LaunchError {
    LaunchError::Tunnel {
        host: host.to_string(),
        remote_port,
        reason: reason.to_string(),
    }
}

/// Asks the OS for a free ephemeral port on the loopback interface.
pub fn pick_local_port() -> Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    Ok(listener.local_addr()?.port())
}

/// An open forward. [`close`](Self::close) it on every exit path; dropping
/// an open handle only sends a kill without waiting for it.
pub struct TunnelHandle {
    remote_host: String,
    remote_port: u16,
    local_port: u16,
    process: Option<Box<dyn BackgroundProcess>>,
}

impl TunnelHandle {
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn remote_host(&self) -> &str {
        &self.remote_host
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(|process| process.id())
    }

    pub fn is_alive(&mut self) -> bool {
        matches!(self.exit_status(), Ok(None))
    }

    fn exit_status(&mut self) -> Result<Option<Exit>> {
        match self.process.as_mut() {
            Some(process) => process.try_exit(),
            None => Ok(Some(Exit { code: None })),
        }
    }

    pub async fn close(mut self) -> Result<()> {
        if let Some(mut process) = self.process.take() {
            process.terminate().await?;
            info!(
                event = "tunnel.closed",
                local_port = self.local_port,
                remote_host = %self.remote_host,
                remote_port = self.remote_port,
                "tunnel closed"
            );
        }
        Ok(())
    }
}

impl Drop for TunnelHandle {
    fn drop(&mut self) {
        if let Some(mut process) = self.process.take() {
            warn!(
                event = "tunnel.dropped",
                local_port = self.local_port,
                "tunnel dropped without close, killing forward"
            );
            process.start_kill();
        }
    }
}

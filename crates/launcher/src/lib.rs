//! Launch commands on remote hosts over `ssh`, copy files with `scp`,
//! negotiate a free port on a remote machine and reach a remote server
//! through an SSH local forward.
//!
//! The building blocks are layered: [`Launcher`] and [`CopyLauncher`] stage
//! and run one command through a [`ProcessExecutor`]; [`PortPicker`],
//! [`Tunnel`] and [`ServerBootstrap`] compose them into the port
//! negotiation protocol; [`Remote`] bundles everything behind host/command
//! conveniences.

mod artifact;
mod bootstrap;
mod command;
mod copy;
mod error;
mod exec;
mod launch;
mod portpick;
mod remote;
mod tunnel;

#[cfg(test)]
mod testing;

pub use artifact::{ArtifactResolver, ResolvedArtifact, SearchPathResolver};
pub use bootstrap::{BootstrapConfig, ServerBootstrap};
pub use command::{join_remote, CommandBuilder};
pub use copy::{CopyConfig, CopyLauncher, CopyStageOptions};
pub use error::{LaunchError, Result, Stage};
pub use exec::{BackgroundProcess, CommandOutput, Exit, InputSource, ProcessExecutor, ShellExecutor};
pub use launch::{LaunchConfig, Launched, Launcher, StageOptions};
pub use portpick::{parse_port, PortPickConfig, PortPicker};
pub use remote::{parse_pid, Remote, RemoteDefaults};
pub use tunnel::{pick_local_port, Tunnel, TunnelConfig, TunnelHandle};

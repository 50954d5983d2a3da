use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::exec::Exit;

/// Steps of a composed remote operation, used to say where it failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Copy,
    Execute,
    Serve,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Stage::Copy => "copy",
            Stage::Execute => "execute",
            Stage::Serve => "serve",
        };
        f.write_str(label)
    }
}

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` timed out after {}s", .after.as_secs())]
    Timeout { command: String, after: Duration },

    #[error("`{command}` exited with {exit}{}", detail_suffix(.detail))]
    CommandFailed {
        command: String,
        exit: Exit,
        detail: String,
    },

    #[error("failure to pick remote port on {host}: probe printed {output:?}")]
    PortPick { host: String, output: String },

    #[error("tunnel to {host}:{remote_port} failed: {reason}")]
    Tunnel {
        host: String,
        remote_port: u16,
        reason: String,
    },

    #[error("{stage} step on {host} failed: {source}")]
    Stage {
        stage: Stage,
        host: String,
        #[source]
        source: Box<LaunchError>,
    },

    #[error("unknown launcher option `{0}`")]
    UnknownOption(String),

    #[error("invalid value {value:?} for option `{key}`")]
    InvalidOption { key: String, value: String },

    #[error("artifact `{name}` not found in {searched} location(s)")]
    ArtifactNotFound { name: String, searched: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LaunchError {
    pub(crate) fn at(self, stage: Stage, host: &str) -> Self {
        LaunchError::Stage {
            stage,
            host: host.to_string(),
            source: Box::new(self),
        }
    }
}

fn detail_suffix(detail: &str) -> String {
    if detail.is_empty() {
        String::new()
    } else {
        format!(": {detail}")
    }
}

pub type Result<T> = std::result::Result<T, LaunchError>;

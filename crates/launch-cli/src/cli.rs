use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "rlaunch",
    version,
    about = "Run commands, pick ports and open tunnels on remote hosts over SSH"
)]
pub(crate) struct Args {
    /// Defaults to ~/.config/rlaunch/config.toml; a missing default file is fine.
    #[arg(long, global = true)]
    pub(crate) config: Option<PathBuf>,
    /// Also write JSON logs to this file.
    #[arg(long, global = true)]
    pub(crate) log_file: Option<PathBuf>,
    #[arg(long, global = true, default_value_t = false)]
    pub(crate) log_to_stderr: bool,
    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Run a command on a remote host.
    Run(RunArgs),
    /// Copy a local file to a remote host.
    Copy {
        file: String,
        host: String,
        #[arg(default_value = "~")]
        dest: String,
    },
    /// Send SIGTERM to a remote pid.
    Kill { pid: u32, host: String },
    /// Look up the pid of a remote process by pattern.
    Getpid { target: String, host: String },
    /// Print a free TCP port on a remote host.
    Pickport { host: String },
    /// Forward a local port to a remote one until Ctrl-C.
    Tunnel { host: String, port: u16 },
    /// Start a server on a remote host and tunnel to it until Ctrl-C.
    Serve {
        server: String,
        host: String,
        /// Only start the server on this port; no port pick and no tunnel.
        #[arg(long)]
        port: Option<u16>,
    },
}

#[derive(ClapArgs, Debug)]
pub(crate) struct RunArgs {
    #[arg(long, default_value = "rlaunch")]
    pub(crate) name: String,
    #[arg(long)]
    pub(crate) host: Option<String>,
    #[arg(long, default_value_t = false)]
    pub(crate) background: bool,
    /// `-` for the terminal, a file path, or `null`.
    #[arg(long)]
    pub(crate) input: Option<String>,
    /// Staging override, repeatable: `--set options=-v --set binary=rsh`.
    #[arg(long = "set", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    pub(crate) set: Vec<(String, String)>,
    /// Print the staged configuration as JSON and exit.
    #[arg(long, default_value_t = false)]
    pub(crate) print_config: bool,
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub(crate) command: Vec<String>,
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got {raw:?}"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in {raw:?}"));
    }
    Ok((key.to_string(), value.to_string()))
}

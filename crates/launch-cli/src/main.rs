mod cli;
mod config;
mod logging;

use crate::cli::{Args, Command, RunArgs};
use crate::config::load_cli_config;
use crate::logging::init_tracing;
use anyhow::Context;
use clap::Parser;
use launcher::{InputSource, Launched, Remote, ShellExecutor, StageOptions, TunnelHandle};
use std::process::ExitCode;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();
    let _log_guard = init_tracing(args.log_file.as_deref(), args.log_to_stderr)?;

    let config = load_cli_config(args.config.as_deref())?;
    let defaults = config.remote_defaults()?;
    let remote = Remote::new(Arc::new(ShellExecutor::new()), Arc::new(config.resolver()))
        .with_portpick(config.portpick(&defaults))
        .with_bootstrap(config.bootstrap(&defaults)?)
        .with_tunnel(config.tunnel(&defaults)?)
        .with_defaults(defaults);

    match args.command {
        Command::Run(run) => return run_command(&remote, run).await,
        Command::Copy { file, host, dest } => {
            remote
                .copy(&file, &host, &dest)
                .await
                .with_context(|| format!("failed to copy {file} to {host}:{dest}"))?;
        }
        Command::Kill { pid, host } => {
            let output = remote
                .kill(pid, &host)
                .await
                .with_context(|| format!("failed to kill {pid} on {host}"))?;
            print_nonempty(&output);
        }
        Command::Getpid { target, host } => {
            let pid = remote
                .getpid(&target, &host)
                .await
                .with_context(|| format!("failed to look up {target} on {host}"))?;
            match pid {
                Some(pid) => println!("{pid}"),
                None => {
                    tracing::warn!(target_pattern = %target, host = %host, "no matching process");
                    return Ok(ExitCode::FAILURE);
                }
            }
        }
        Command::Pickport { host } => {
            let port = remote
                .pickport(&host)
                .await
                .with_context(|| format!("failed to pick a port on {host}"))?;
            println!("{port}");
        }
        Command::Tunnel { host, port } => {
            let (tunnel, local_port) = remote
                .connect(&host, port)
                .await
                .with_context(|| format!("failed to open tunnel to {host}:{port}"))?;
            println!("{local_port}");
            hold_open(tunnel).await?;
        }
        Command::Serve { server, host, port: Some(port) } => {
            let process = remote
                .serve(&server, &host, port)
                .await
                .with_context(|| format!("failed to start {server} on {host}"))?;
            if let Some(pid) = process.id() {
                println!("{pid}");
            }
        }
        Command::Serve { server, host, port: None } => {
            let (tunnel, local_port) = remote
                .bootstrap(&server, &host)
                .await
                .with_context(|| format!("failed to bootstrap {server} on {host}"))?;
            println!("{local_port}");
            hold_open(tunnel).await?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn run_command(remote: &Remote, run: RunArgs) -> anyhow::Result<ExitCode> {
    let host = run.host.as_deref().unwrap_or("localhost");
    let mut launcher = remote.launcher(&run.name, host);
    let mut options = StageOptions::new().background(run.background);
    if !run.command.is_empty() {
        options = options.command(run.command.join(" "));
    }
    if let Some(input) = &run.input {
        options = options.input(InputSource::parse(input));
    }
    for (key, value) in &run.set {
        options
            .set(key, value)
            .with_context(|| format!("invalid --set {key}={value}"))?;
    }
    let config = launcher.stage(options);
    if run.print_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(ExitCode::SUCCESS);
    }

    match launcher.launch().await.context("launch failed")? {
        Launched::Completed { exit, .. } => {
            if let Some(response) = launcher.response() {
                print_nonempty(response);
            }
            Ok(match exit.code {
                Some(0) => ExitCode::SUCCESS,
                Some(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
                None => ExitCode::FAILURE,
            })
        }
        Launched::Detached(process) => {
            if let Some(pid) = process.id() {
                println!("{pid}");
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn hold_open(tunnel: TunnelHandle) -> anyhow::Result<()> {
    tracing::info!(
        local_port = tunnel.local_port(),
        remote_host = %tunnel.remote_host(),
        remote_port = tunnel.remote_port(),
        "tunnel open, press Ctrl-C to close"
    );
    let _ = tokio::signal::ctrl_c().await;
    tunnel.close().await.context("failed to close tunnel")?;
    Ok(())
}

fn print_nonempty(output: &str) {
    if !output.is_empty() {
        println!("{output}");
    }
}

use anyhow::Context;
use launcher::{BootstrapConfig, PortPickConfig, RemoteDefaults, SearchPathResolver, TunnelConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use system_utils::path::expand_tilde;

pub(crate) const DEFAULT_CONFIG_PATH: &str = "~/.config/rlaunch/config.toml";

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct CliConfig {
    #[serde(default)]
    pub(crate) defaults: DefaultsSection,
    #[serde(default)]
    pub(crate) portpick: PortPickSection,
    #[serde(default)]
    pub(crate) bootstrap: BootstrapSection,
    #[serde(default)]
    pub(crate) tunnel: TunnelSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct DefaultsSection {
    pub(crate) binary: Option<String>,
    pub(crate) options: Option<String>,
    pub(crate) copy_binary: Option<String>,
    pub(crate) copy_options: Option<String>,
    pub(crate) command_timeout: Option<String>,
    pub(crate) copy_timeout: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct PortPickSection {
    pub(crate) helper: Option<String>,
    pub(crate) interpreter: Option<String>,
    pub(crate) staging_dir: Option<String>,
    pub(crate) search_dirs: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct BootstrapSection {
    pub(crate) profile: Option<String>,
    pub(crate) server_dir: Option<String>,
    pub(crate) settle: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct TunnelSection {
    pub(crate) forward_host: Option<String>,
    pub(crate) ready_attempts: Option<u32>,
    pub(crate) ready_interval: Option<String>,
}

impl CliConfig {
    pub(crate) fn remote_defaults(&self) -> anyhow::Result<RemoteDefaults> {
        let mut defaults = RemoteDefaults::default();
        let section = &self.defaults;
        if let Some(binary) = &section.binary {
            defaults.binary = binary.clone();
        }
        if let Some(options) = &section.options {
            defaults.options = options.clone();
        }
        if let Some(copy_binary) = &section.copy_binary {
            defaults.copy_binary = copy_binary.clone();
        }
        if let Some(copy_options) = &section.copy_options {
            defaults.copy_options = copy_options.clone();
        }
        if let Some(timeout) = parse_duration("defaults.command_timeout", &section.command_timeout)? {
            defaults.command_timeout = timeout;
        }
        if let Some(timeout) = parse_duration("defaults.copy_timeout", &section.copy_timeout)? {
            defaults.copy_timeout = timeout;
        }
        Ok(defaults)
    }

    /// The probe inherits binaries, options and timeouts from `[defaults]`.
    pub(crate) fn portpick(&self, defaults: &RemoteDefaults) -> PortPickConfig {
        let mut config = PortPickConfig {
            binary: defaults.binary.clone(),
            options: defaults.options.clone(),
            copy_binary: defaults.copy_binary.clone(),
            command_timeout: defaults.command_timeout,
            copy_timeout: defaults.copy_timeout,
            ..PortPickConfig::default()
        };
        if let Some(copy_options) = &self.defaults.copy_options {
            config.copy_options = copy_options.clone();
        }
        let section = &self.portpick;
        if let Some(helper) = &section.helper {
            config.helper = helper.clone();
        }
        if let Some(interpreter) = &section.interpreter {
            config.interpreter = interpreter.clone();
        }
        if let Some(staging_dir) = &section.staging_dir {
            config.staging_dir = staging_dir.clone();
        }
        config
    }

    pub(crate) fn resolver(&self) -> SearchPathResolver {
        let dirs = self.portpick.search_dirs.iter().flatten();
        SearchPathResolver::new().with_dirs(dirs.map(|dir| expand_tilde(dir)))
    }

    pub(crate) fn bootstrap(&self, defaults: &RemoteDefaults) -> anyhow::Result<BootstrapConfig> {
        let mut config = BootstrapConfig {
            binary: defaults.binary.clone(),
            options: defaults.options.clone(),
            ..BootstrapConfig::default()
        };
        let section = &self.bootstrap;
        if let Some(profile) = &section.profile {
            config.profile = profile.clone();
        }
        if let Some(server_dir) = &section.server_dir {
            config.server_dir = server_dir.clone();
        }
        if let Some(settle) = parse_duration("bootstrap.settle", &section.settle)? {
            config.settle = settle;
        }
        Ok(config)
    }

    pub(crate) fn tunnel(&self, defaults: &RemoteDefaults) -> anyhow::Result<TunnelConfig> {
        let mut config = TunnelConfig {
            binary: defaults.binary.clone(),
            options: defaults.options.clone(),
            ..TunnelConfig::default()
        };
        let section = &self.tunnel;
        config.forward_host = section
            .forward_host
            .as_deref()
            .map(str::trim)
            .filter(|host| !host.is_empty())
            .map(str::to_string);
        if let Some(attempts) = section.ready_attempts {
            if attempts == 0 {
                anyhow::bail!("tunnel.ready_attempts must be at least 1");
            }
            config.ready_attempts = attempts;
        }
        if let Some(interval) = parse_duration("tunnel.ready_interval", &section.ready_interval)? {
            config.ready_interval = interval;
        }
        Ok(config)
    }
}

fn parse_duration(key: &str, raw: &Option<String>) -> anyhow::Result<Option<Duration>> {
    raw.as_deref()
        .map(|value| {
            humantime::parse_duration(value.trim())
                .with_context(|| format!("invalid duration for {key}: {value:?}"))
        })
        .transpose()
}

/// Reads the config at `path`, or the default location when `None`. Only
/// the default location may be missing.
pub(crate) fn load_cli_config(path: Option<&Path>) -> anyhow::Result<CliConfig> {
    let (path, explicit) = match path {
        Some(path) => (path.to_path_buf(), true),
        None => (expand_tilde(DEFAULT_CONFIG_PATH), false),
    };
    if !explicit && !path.exists() {
        return Ok(CliConfig::default());
    }
    read_config(&path)
}

fn read_config(path: &PathBuf) -> anyhow::Result<CliConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config: CliConfig = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config {}", path.display()))?;
    Ok(config)
}

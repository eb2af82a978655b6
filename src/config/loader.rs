use std::path::{Path, PathBuf};

use config::{Config, File, FileFormat};
use eyre::{Context, Result};

use crate::config::{models::GatewayConfig, service::ServiceDefinitionFile};

/// Pick the `config` crate format from a file extension (YAML when unknown).
pub fn file_format(path: &Path) -> FileFormat {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => FileFormat::Yaml,
        Some("json") => FileFormat::Json,
        Some("toml") => FileFormat::Toml,
        Some("ini") => FileFormat::Ini,
        _ => FileFormat::Yaml,
    }
}

fn build(path: &Path) -> Result<Config> {
    let name = path
        .to_str()
        .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", path.display()))?;

    Config::builder()
        .add_source(File::new(name, file_format(path)))
        .build()
        .with_context(|| format!("Failed to build config from {}", path.display()))
}

/// Load the gateway configuration.
///
/// A relative `services_path` is rewritten against the directory of the
/// configuration file so the gateway can be started from any working directory.
pub fn load_config(config_path: &str) -> Result<GatewayConfig> {
    let path = Path::new(config_path);
    let mut gateway_config: GatewayConfig = build(path)?
        .try_deserialize()
        .with_context(|| format!("Failed to deserialize config from {}", path.display()))?;

    gateway_config.services_path = resolve_relative(path, &gateway_config.services_path)
        .to_string_lossy()
        .into_owned();

    Ok(gateway_config)
}

/// Load a service definition file.
pub fn load_service_file(path: &Path) -> Result<ServiceDefinitionFile> {
    build(path)?
        .try_deserialize()
        .with_context(|| format!("Failed to deserialize services from {}", path.display()))
}

fn resolve_relative(config_path: &Path, target: &str) -> PathBuf {
    let target = Path::new(target);
    if target.is_absolute() {
        return target.to_path_buf();
    }
    match config_path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.join(target),
        _ => target.to_path_buf(),
    }
}

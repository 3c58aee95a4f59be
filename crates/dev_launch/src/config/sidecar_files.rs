//! Emulator configuration files
//!
//! The emulator CLI refuses to start without a config file and a project alias file.
//! Both are written with fixed defaults when missing and never overwritten.

use super::EmulatorConfig;
use serde_json::json;
use std::path::{Path, PathBuf};

/// Outcome for a single sidecar file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SidecarFile {
    Created(PathBuf),
    Existing(PathBuf),
}

/// Default emulator config: service and admin UI port declarations
pub fn emulator_config_json(config: &EmulatorConfig) -> serde_json::Value {
    let mut emulators = serde_json::Map::new();
    emulators.insert(config.service.clone(), json!({ "port": config.data_port }));
    emulators.insert("ui".to_string(), json!({ "enabled": true, "port": config.ui_port }));
    json!({ "emulators": emulators })
}

/// Default project alias file
pub fn project_alias_json(config: &EmulatorConfig) -> serde_json::Value {
    json!({ "projects": { "default": config.project } })
}

/// Create the emulator config and project alias files under `root` if absent
pub fn ensure_sidecar_files(
    root: &Path,
    config: &EmulatorConfig,
) -> std::io::Result<[SidecarFile; 2]> {
    Ok([
        write_if_missing(
            &root.join(&config.config_file),
            &emulator_config_json(config),
        )?,
        write_if_missing(&root.join(&config.alias_file), &project_alias_json(config))?,
    ])
}

fn write_if_missing(path: &Path, value: &serde_json::Value) -> std::io::Result<SidecarFile> {
    if path.exists() {
        return Ok(SidecarFile::Existing(path.to_path_buf()));
    }
    let mut content = serde_json::to_string_pretty(value).map_err(std::io::Error::other)?;
    content.push('\n');
    std::fs::write(path, content)?;
    log::info!("Created {}", path.display());
    Ok(SidecarFile::Created(path.to_path_buf()))
}

// Migration settings
//
// Layering (later wins): struct defaults → TOML file → ATTACH_* environment variables.
// A session receives a validated copy; nothing here is global.

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::MigrationError;

/// Default settings file looked up in the working directory.
pub const DEFAULT_SETTINGS_FILE: &str = "attach-migrator.toml";

/// What the transfer stage does before attaching.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    /// Attach whatever is already in the destination.
    #[default]
    None,
    /// Copy data files from the source into the destination, never overwriting.
    Copy,
    /// Zip the source tree into the destination and mirror the companies folder layout.
    Archive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationSettings {
    /// `host`, `host\INSTANCE` or `host,port`.
    pub instance: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub encrypt: bool,
    pub trust_server_certificate: bool,

    pub source_dir: Option<PathBuf>,
    /// Instance data folder. Detected from the engine when unset.
    pub destination_dir: Option<PathBuf>,
    /// Companies folder whose directory layout is mirrored in archive mode.
    pub companies_dir: Option<PathBuf>,
    pub transfer_mode: TransferMode,

    /// Stop/start the engine service around the transfer stage.
    pub manage_service: bool,
    /// Explicit service name; derived from `instance` when unset.
    pub service_name: Option<String>,
    pub service_timeout_secs: u64,
    pub service_poll_interval_ms: u64,

    /// Overrides the built-in catalog list (names only, attach order preserved).
    pub catalogs: Option<Vec<String>>,

    pub run_integrity_check: bool,
    pub verify_after: bool,
    /// Read the engine error log after a failed attach and echo the relevant lines.
    pub inspect_error_log_on_failure: bool,
    pub connect_timeout_secs: u64,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            instance: "localhost\\COMPAC".to_string(),
            user: None,
            password: None,
            encrypt: false,
            trust_server_certificate: true,
            source_dir: None,
            destination_dir: None,
            companies_dir: None,
            transfer_mode: TransferMode::None,
            manage_service: true,
            service_name: None,
            service_timeout_secs: 240,
            service_poll_interval_ms: 1000,
            catalogs: None,
            run_integrity_check: true,
            verify_after: true,
            inspect_error_log_on_failure: false,
            connect_timeout_secs: 20,
        }
    }
}

impl MigrationSettings {
    pub fn for_instance(instance: &str) -> Self {
        Self {
            instance: instance.to_string(),
            ..Self::default()
        }
    }

    pub fn service_timeout(&self) -> Duration {
        Duration::from_secs(self.service_timeout_secs)
    }

    pub fn service_poll_interval(&self) -> Duration {
        Duration::from_millis(self.service_poll_interval_ms)
    }

    pub fn validate(&self) -> Result<(), MigrationError> {
        if self.instance.trim().is_empty() {
            return Err(MigrationError::Config("instance is required".to_string()));
        }
        if self.service_timeout_secs == 0 || self.service_poll_interval_ms == 0 {
            return Err(MigrationError::Config(
                "service timeout and poll interval must be positive".to_string(),
            ));
        }
        if self.service_poll_interval() >= self.service_timeout() {
            return Err(MigrationError::Config(
                "service poll interval must be shorter than the timeout".to_string(),
            ));
        }
        if self.transfer_mode != TransferMode::None && self.source_dir.is_none() {
            return Err(MigrationError::Config(
                "a source directory is required when a transfer mode is set".to_string(),
            ));
        }
        if let Some(catalogs) = &self.catalogs {
            if catalogs.iter().any(|c| c.trim().is_empty()) {
                return Err(MigrationError::Config(
                    "catalog names must not be blank".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Load settings from an optional TOML file and the process environment.
///
/// An explicit `path` must exist; otherwise `attach-migrator.toml` in the working directory is
/// used when present.
pub fn load(path: Option<&Path>) -> Result<MigrationSettings> {
    load_from(path, None)
}

fn load_from(path: Option<&Path>, env: Option<HashMap<String, String>>) -> Result<MigrationSettings> {
    let file_source = match path {
        Some(p) => File::from(p.to_path_buf())
            .format(FileFormat::Toml)
            .required(true),
        None => File::from(PathBuf::from(DEFAULT_SETTINGS_FILE))
            .format(FileFormat::Toml)
            .required(false),
    };

    let env_source = Environment::with_prefix("ATTACH")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("catalogs")
        .source(env);

    let settings: MigrationSettings = Config::builder()
        .add_source(file_source)
        .add_source(env_source)
        .build()
        .context("Failed to read settings")?
        .try_deserialize()
        .context("Failed to parse settings")?;

    settings.validate()?;
    Ok(settings)
}

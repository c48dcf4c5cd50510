//! User settings (`settings.json`).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::Registry;

/// Official public registry, suggested by default.
pub const OFFICIAL_REGISTRY_URL: &str = "https://registry.modelcontextprotocol.io";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub discovery_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Sent as the `limit` query parameter when set.
    pub page_limit: Option<u32>,
    pub max_pages: usize,
    pub npm_runner: String,
    pub pypi_runner: String,
    pub suggested_registries: Vec<Registry>,
    pub reconcile_on_startup: bool,
}

impl Default for Settings {
    fn default() -> Self {
        let mut official = Registry::new(OFFICIAL_REGISTRY_URL, "MCP Registry");
        official.suggested = true;
        Self {
            discovery_timeout_secs: 30,
            connect_timeout_secs: 15,
            page_limit: None,
            max_pages: 100,
            npm_runner: "npx".to_string(),
            pypi_runner: "uvx".to_string(),
            suggested_registries: vec![official],
            reconcile_on_startup: true,
        }
    }
}

impl Settings {
    /// Load settings, using defaults when the file does not exist.
    pub async fn load(path: &Path) -> Result<Self, SettingsError> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(SettingsError::ReadFailed {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        serde_json::from_str(&content).map_err(|source| SettingsError::ParseFailed {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Failed to read settings {}: {}", .path.display(), .source)]
    ReadFailed {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse settings {}: {}", .path.display(), .source)]
    ParseFailed {
        path: std::path::PathBuf,
        source: serde_json::Error,
    },
}

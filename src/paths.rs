//! Path resolution for configuration and data files.
//!
//! Uses env vars when set, otherwise XDG defaults.

use std::path::{Path, PathBuf};

/// Resolved paths for mcpreg directories.
#[derive(Debug, Clone)]
pub struct Paths {
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
}

impl Paths {
    /// Resolve paths from environment, falling back to XDG/defaults.
    pub fn resolve() -> Self {
        let config_dir = resolve_path(
            "MCPREG_CONFIG_DIR",
            dirs::config_dir().map(|p| p.join("mcpreg")),
            "~/.config/mcpreg",
        );
        let data_dir = resolve_path(
            "MCPREG_DATA_DIR",
            dirs::data_local_dir().map(|p| p.join("mcpreg")),
            "~/.local/share/mcpreg",
        );

        Self { config_dir, data_dir }
    }

    /// Paths rooted at a single directory (tests, portable installs).
    pub fn with_root(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            config_dir: root.join("config"),
            data_dir: root.join("data"),
        }
    }

    /// JSON array of persisted registries.
    pub fn registries_path(&self) -> PathBuf {
        self.config_dir.join("registries.json")
    }

    /// Optional settings file.
    pub fn settings_path(&self) -> PathBuf {
        self.config_dir.join("settings.json")
    }

    /// Encrypted key-value store.
    pub fn secrets_path(&self) -> PathBuf {
        self.data_dir.join("secrets.json")
    }
}

fn resolve_path(env_var: &str, xdg_default: Option<PathBuf>, fallback: &str) -> PathBuf {
    if let Ok(val) = std::env::var(env_var) {
        let trimmed = val.trim();
        if !trimmed.is_empty() {
            return expand_tilde(trimmed);
        }
    }
    xdg_default.unwrap_or_else(|| expand_tilde(fallback))
}

fn expand_tilde(path: &str) -> PathBuf {
    let expanded = shellexpand::tilde(path);
    PathBuf::from(expanded.as_ref())
}

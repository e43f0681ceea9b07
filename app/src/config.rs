use anyhow::{Context, Result};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Preferences of the terminal client, kept next to `finchat.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TerminalSettings {
    #[serde(default = "TerminalSettings::default_show_tool_results")]
    pub show_tool_results: bool,
    /// Session continued by `--resume`.
    #[serde(default)]
    pub last_session: Option<String>,
}

impl Default for TerminalSettings {
    fn default() -> Self {
        Self {
            show_tool_results: TerminalSettings::default_show_tool_results(),
            last_session: None,
        }
    }
}

impl TerminalSettings {
    fn default_show_tool_results() -> bool {
        true
    }
}

pub fn terminal_settings_path() -> PathBuf {
    config_dir().join("terminal.json")
}

pub async fn load_terminal_settings(path: &Path) -> Result<TerminalSettings> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => match serde_json::from_str(&contents) {
            Ok(settings) => Ok(settings),
            Err(err) => {
                let defaults = TerminalSettings::default();
                save_terminal_settings(path, &defaults).await?;
                warn!(
                    error = ?err,
                    "failed to parse terminal.json, resetting to defaults"
                );
                Ok(defaults)
            }
        },
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(TerminalSettings::default()),
        Err(err) => Err(err).context("failed to read terminal.json"),
    }
}

pub async fn save_terminal_settings(path: &Path, settings: &TerminalSettings) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    let serialized = serde_json::to_string_pretty(settings)?;
    tokio::fs::write(path, serialized)
        .await
        .with_context(|| format!("failed to write terminal.json at {}", path.display()))
}

fn config_dir() -> PathBuf {
    if let Some(base) = BaseDirs::new() {
        base.config_dir().join("finchat")
    } else {
        PathBuf::from(".finchat")
    }
}

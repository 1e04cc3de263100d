// Host settings
// Loaded from ~/.config/sqlbridge/settings.toml

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("invalid settings in {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write { path: PathBuf, source: io::Error },

    #[error("failed to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Chat completion provider selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatProvider {
    /// Chat disabled (default)
    #[default]
    None,
    /// OpenAI-compatible chat completions API
    #[serde(rename = "openai")]
    OpenAI,
}

impl ChatProvider {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, ChatProvider::None)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChatProvider::None => "none",
            ChatProvider::OpenAI => "openai",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            ChatProvider::None => "",
            ChatProvider::OpenAI => "gpt-4o",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Largest accepted message body, in bytes
    pub max_message_bytes: usize,

    /// `host:port` to listen on instead of stdio
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listen: Option<String>,

    /// Driver used when connection details name no provider
    pub default_provider: String,

    /// How long to wait for the client to answer a server → client request
    pub client_request_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            max_message_bytes: 64 * 1024 * 1024,
            listen: None,
            default_provider: "sqlite".to_string(),
            client_request_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// `error`, `warn`, `info`, `debug` or `trace`
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EditSettings {
    /// Rows fetched by `edit/initialize` when the client sets no limit
    pub row_limit: u64,
}

impl Default for EditSettings {
    fn default() -> Self {
        Self { row_limit: 200 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuerySettings {
    /// Rows buffered per result set; the rest are dropped with a message
    pub max_rows: usize,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self { max_rows: 100_000 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatSettings {
    pub provider: ChatProvider,

    /// Model identifier; empty = provider default
    pub model: String,

    /// Base URL override for OpenAI-compatible servers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    pub max_tokens: u32,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            provider: ChatProvider::None,
            model: String::new(),
            endpoint: None,
            max_tokens: 1024,
        }
    }
}

impl ChatSettings {
    pub fn effective_model(&self) -> &str {
        if self.model.is_empty() {
            self.provider.default_model()
        } else {
            &self.model
        }
    }

    pub fn effective_endpoint(&self) -> &str {
        self.endpoint.as_deref().unwrap_or("https://api.openai.com/v1")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub edit: EditSettings,
    pub query: QuerySettings,
    pub chat: ChatSettings,
}

impl Settings {
    /// Get the settings file path
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sqlbridge")
            .join("settings.toml")
    }

    /// Load from the default location. A missing file yields defaults.
    pub fn load() -> Result<Self, SettingsError> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self, SettingsError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn to_toml(&self) -> Result<String, SettingsError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), SettingsError> {
        let write_err = |source| SettingsError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
        fs::write(path, self.to_toml()?).map_err(write_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let settings = Settings::load_from(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.server.max_message_bytes, 64 * 1024 * 1024);
        assert_eq!(settings.edit.row_limit, 200);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.toml");
        fs::write(
            &path,
            "[logging]\nlevel = \"debug\"\n\n[chat]\nprovider = \"openai\"\n",
        )
        .unwrap();

        let settings = Settings::load_from(&path).unwrap();
        assert_eq!(settings.logging.level, "debug");
        assert_eq!(settings.chat.provider, ChatProvider::OpenAI);
        assert_eq!(settings.chat.effective_model(), "gpt-4o");
        assert_eq!(settings.server, ServerSettings::default());
    }

    #[test]
    fn test_parse_error_names_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.toml");
        fs::write(&path, "[server\nmax_message_bytes = ").unwrap();

        let err = Settings::load_from(&path).unwrap_err();
        assert!(matches!(err, SettingsError::Parse { .. }));
        assert!(err.to_string().contains("settings.toml"));
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("settings.toml");
        let mut settings = Settings::default();
        settings.server.listen = Some("127.0.0.1:7070".into());
        settings.query.max_rows = 10;
        settings.save_to(&path).unwrap();

        assert_eq!(Settings::load_from(&path).unwrap(), settings);
    }
}

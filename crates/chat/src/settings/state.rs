use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use gemchat_llm::{Backend, ClientConfig, DEFAULT_GEMINI_MODEL, DEFAULT_PROXY_ENDPOINT};
use gemchat_storage::DEFAULT_MAX_TURNS;
use gemchat_storage::sqlite::DEFAULT_DATABASE_FILE_NAME;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub const SETTINGS_DIRECTORY_NAME: &str = "gemchat";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const ENV_PREFIX: &str = "GEMCHAT_";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

/// User-level configuration: which backend to call, the credential, and where history lives.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSettings {
    #[serde(default)]
    pub backend: Backend,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Completion proxy URL, used by the `proxy` backend.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Base URL override for the `gemini` backend.
    #[serde(default)]
    pub gemini_base_url: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

/// The pair every exchange needs; absent until both are configured.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub api_key: String,
    pub model: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Credentials")
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .finish()
    }
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            api_key: String::new(),
            model: default_model(),
            endpoint: default_endpoint(),
            gemini_base_url: None,
            request_timeout_secs: default_request_timeout_secs(),
            max_turns: default_max_turns(),
            database_path: None,
        }
    }
}

impl fmt::Debug for ChatSettings {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("ChatSettings")
            .field("backend", &self.backend)
            .field("api_key", &redact(&self.api_key))
            .field("model", &self.model)
            .field("endpoint", &self.endpoint)
            .field("gemini_base_url", &self.gemini_base_url)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("max_turns", &self.max_turns)
            .field("database_path", &self.database_path)
            .finish()
    }
}

impl ChatSettings {
    pub fn normalized(mut self) -> Self {
        self.api_key = self.api_key.trim().to_string();
        self.model = if self.model.trim().is_empty() {
            default_model()
        } else {
            self.model.trim().to_string()
        };
        self.endpoint = if self.endpoint.trim().is_empty() {
            default_endpoint()
        } else {
            self.endpoint.trim().to_string()
        };
        self.gemini_base_url = self
            .gemini_base_url
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty());
        if self.request_timeout_secs == 0 {
            self.request_timeout_secs = default_request_timeout_secs();
        }
        if self.max_turns == 0 {
            self.max_turns = default_max_turns();
        }
        self.database_path = self
            .database_path
            .filter(|path| !path.as_os_str().is_empty());

        self
    }

    pub fn is_valid(&self) -> bool {
        self.credentials().is_some()
    }

    pub fn credentials(&self) -> Option<Credentials> {
        let api_key = self.api_key.trim();
        let model = self.model.trim();
        if api_key.is_empty() || model.is_empty() {
            return None;
        }

        Some(Credentials {
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }

    pub fn client_config(&self) -> ClientConfig {
        let endpoint = match self.backend {
            Backend::Proxy => self.endpoint.clone(),
            Backend::Gemini => self.gemini_base_url.clone().unwrap_or_default(),
        };

        ClientConfig::new(self.backend, endpoint)
            .with_request_timeout(Duration::from_secs(self.request_timeout_secs.max(1)))
    }

    /// Explicit `database_path`, otherwise `chat_history.db` under the platform data directory.
    pub fn database_location(&self) -> PathBuf {
        match &self.database_path {
            Some(path) => path.clone(),
            None => default_data_dir().join(DEFAULT_DATABASE_FILE_NAME),
        }
    }
}

pub struct SettingsStore {
    settings: ArcSwap<ChatSettings>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".gemchat"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_disk(&config_path);
        Self::from_settings(config_path, settings)
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    /// Wraps already-resolved settings without reading the file or the environment.
    pub fn from_settings(config_path: PathBuf, settings: ChatSettings) -> Self {
        Self {
            settings: ArcSwap::from_pointee(settings.normalized()),
            config_path,
        }
    }

    pub fn settings(&self) -> Arc<ChatSettings> {
        self.settings.load_full()
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    pub fn update(&self, settings: ChatSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    /// Applies `change` to a copy of the current settings and saves the result.
    pub fn modify(&self, change: impl FnOnce(&mut ChatSettings)) -> Result<(), SettingsError> {
        let mut settings = ChatSettings::clone(&self.settings());
        change(&mut settings);
        self.update(settings)
    }

    fn load_from_disk(path: &Path) -> ChatSettings {
        if !path.exists() {
            tracing::info!(path = ?path, "settings file not found, using defaults");
        }

        let figment = Figment::from(Serialized::defaults(ChatSettings::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(ENV_PREFIX));

        match figment.extract::<ChatSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(path = ?path, %error, "failed to parse settings, using defaults");
                ChatSettings::default()
            }
        }
    }

    fn persist(&self, settings: &ChatSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!(path = ?self.config_path, "saved settings");
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
        .unwrap_or_else(|| PathBuf::from(".gemchat"))
}

fn default_model() -> String {
    DEFAULT_GEMINI_MODEL.to_string()
}

fn default_endpoint() -> String {
    DEFAULT_PROXY_ENDPOINT.to_string()
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_max_turns() -> usize {
    DEFAULT_MAX_TURNS
}

fn redact(secret: &str) -> &'static str {
    if secret.is_empty() { "<unset>" } else { "<redacted>" }
}

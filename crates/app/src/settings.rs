use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use parlor_core::ModelSelection;
use parlor_llm::{DEFAULT_OPENAI_MODEL, ProviderConfig};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub const DEFAULT_PROVIDER_ID: &str = "openai";
pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1";
pub const SETTINGS_DIRECTORY_NAME: &str = "parlor";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const DATABASE_FILE_NAME: &str = "conversations.db";
pub const ENV_PREFIX: &str = "PARLOR_";

/// Provider connection plus the model and sampling limits used with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSettings {
    #[serde(default = "default_provider_id")]
    pub provider_id: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            provider_id: default_provider_id(),
            api_key: String::new(),
            endpoint: default_endpoint(),
            model: default_model(),
            temperature: None,
            max_tokens: None,
        }
    }
}

impl ModelSettings {
    pub fn has_credentials(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    pub fn to_provider_config(&self) -> ProviderConfig {
        ProviderConfig::new(
            &self.provider_id,
            &self.api_key,
            &self.endpoint,
            Some(self.model.clone()),
        )
    }

    pub fn model_selection(&self) -> ModelSelection {
        ModelSelection {
            model_id: self.model.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }

    fn normalized(mut self) -> Self {
        self.provider_id = non_blank_or(self.provider_id, default_provider_id);
        self.api_key = self.api_key.trim().to_string();
        self.endpoint = non_blank_or(self.endpoint, default_endpoint);
        self.model = non_blank_or(self.model, default_model);
        self.max_tokens = self.max_tokens.filter(|limit| *limit > 0);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Blank means `<data_dir>/parlor/conversations.db`.
    #[serde(default)]
    pub database_path: String,
}

impl StorageSettings {
    pub fn resolved_database_path(&self) -> PathBuf {
        let configured = self.database_path.trim();
        if !configured.is_empty() {
            return PathBuf::from(configured);
        }

        dirs::data_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".parlor"))
            .join(DATABASE_FILE_NAME)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub chat: ModelSettings,
    /// Model used for title generation.
    #[serde(default)]
    pub assistant: ModelSettings,
    #[serde(default)]
    pub storage: StorageSettings,
}

impl Settings {
    pub fn normalized(mut self) -> Self {
        self.chat = self.chat.normalized();
        self.assistant = self.assistant.normalized();
        self.storage.database_path = self.storage.database_path.trim().to_string();
        self
    }

    /// Fills an empty chat key from the conventional `OPENAI_*` variables.
    pub fn with_openai_fallback(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if self.chat.has_credentials() {
            return self;
        }

        let non_blank = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        if let Some(api_key) = non_blank("OPENAI_API_KEY") {
            self.chat.api_key = api_key;
            if let Some(model) = non_blank("OPENAI_MODEL") {
                self.chat.model = model;
            }
            if let Some(endpoint) = non_blank("OPENAI_BASE_URL") {
                self.chat.endpoint = endpoint;
            }
        }

        self.normalized()
    }

    /// Title generation settings. Without its own key the assistant shares
    /// the chat connection and model.
    pub fn assistant_settings(&self) -> ModelSettings {
        if self.assistant.has_credentials() {
            self.assistant.clone()
        } else {
            self.chat.clone()
        }
    }
}

pub struct SettingsStore {
    settings: ArcSwap<Settings>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".parlor"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn load(config_path: PathBuf) -> Result<Self, SettingsError> {
        let settings = Self::load_from_disk(&config_path)?;
        Ok(Self {
            settings: ArcSwap::from_pointee(settings),
            config_path,
        })
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<Settings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: Settings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    /// Settings ready for startup. Missing chat credentials leave a default
    /// file behind for the user to fill in and fail.
    pub fn resolve_for_startup(
        &self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Settings, SettingsError> {
        let settings = self.settings().as_ref().clone().with_openai_fallback(lookup);
        if settings.chat.has_credentials() {
            return Ok(settings);
        }

        if !self.config_path.exists() {
            self.update(Settings::default())?;
        }
        MissingCredentialsSnafu {
            stage: "resolve-startup-settings",
            path: self.config_path.clone(),
        }
        .fail()
    }

    fn load_from_disk(path: &Path) -> Result<Settings, SettingsError> {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        if path.exists() {
            figment = figment.merge(Json::file(path));
        } else {
            tracing::info!(path = %path.display(), "settings file not found, using defaults");
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let settings = figment
            .extract::<Settings>()
            .map_err(Box::new)
            .context(ParseSnafu {
                stage: "extract-settings",
                path: path.to_path_buf(),
            })?;
        Ok(settings.normalized())
    }

    fn persist(&self, settings: &Settings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent() {
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

        tracing::info!(path = %self.config_path.display(), "saved settings");
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display(
        "no API key configured; set chat.api_key in {path:?} or export OPENAI_API_KEY"
    ))]
    MissingCredentials { stage: &'static str, path: PathBuf },
    #[snafu(display("failed to read settings from {path:?} on `{stage}`: {source}"))]
    Parse {
        stage: &'static str,
        path: PathBuf,
        source: Box<figment::Error>,
    },
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

fn non_blank_or(value: String, fallback: fn() -> String) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback()
    } else {
        trimmed.to_string()
    }
}

fn default_provider_id() -> String {
    DEFAULT_PROVIDER_ID.to_string()
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_model() -> String {
    DEFAULT_OPENAI_MODEL.to_string()
}

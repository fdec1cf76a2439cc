use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use murmur_storage::GENERATION_POINTER_TTL;
use murmur_stream::{DEFAULT_CHAR_DELAY, DEFAULT_SKELETON_DELAY, RetryPolicy, StreamConfig};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8000/api";
pub const DEFAULT_MODEL: &str = "default";
pub const SETTINGS_DIRECTORY_NAME: &str = "murmur";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const DATABASE_FILE_NAME: &str = "murmur.db";
pub const ENV_PREFIX: &str = "MURMUR_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_retries: policy.max_retries,
            base_delay_ms: duration_millis(policy.base_delay),
            max_delay_ms: duration_millis(policy.max_delay),
        }
    }
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacingSettings {
    pub char_delay_ms: u64,
    pub skeleton_delay_ms: u64,
}

impl Default for PacingSettings {
    fn default() -> Self {
        Self {
            char_delay_ms: duration_millis(DEFAULT_CHAR_DELAY),
            skeleton_delay_ms: duration_millis(DEFAULT_SKELETON_DELAY),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// SQLite file; `None` means the platform data directory.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub pacing: PacingSettings,
    #[serde(default = "default_pointer_ttl_secs")]
    pub pointer_ttl_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            model: default_model(),
            database_path: None,
            retry: RetrySettings::default(),
            pacing: PacingSettings::default(),
            pointer_ttl_secs: default_pointer_ttl_secs(),
        }
    }
}

impl Settings {
    pub fn normalized(mut self) -> Self {
        self.api_base_url = non_blank_or(self.api_base_url, default_api_base_url);
        self.model = non_blank_or(self.model, default_model);
        self.database_path = self
            .database_path
            .filter(|path| !path.as_os_str().is_empty());
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            self.retry.max_delay_ms = self.retry.base_delay_ms;
        }
        if self.pointer_ttl_secs == 0 {
            self.pointer_ttl_secs = default_pointer_ttl_secs();
        }
        self
    }

    pub fn with_overrides(mut self, overrides: &SettingsOverrides) -> Self {
        if let Some(api_base_url) = &overrides.api_base_url {
            self.api_base_url = api_base_url.clone();
        }
        if let Some(model) = &overrides.model {
            self.model = model.clone();
        }
        if let Some(database_path) = &overrides.database_path {
            self.database_path = Some(database_path.clone());
        }
        self.normalized()
    }

    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            retry: self.retry.policy(),
            char_delay: Duration::from_millis(self.pacing.char_delay_ms),
            skeleton_delay: Duration::from_millis(self.pacing.skeleton_delay_ms),
        }
    }

    pub fn pointer_ttl(&self) -> Duration {
        Duration::from_secs(self.pointer_ttl_secs)
    }

    pub fn database_location(&self) -> PathBuf {
        match &self.database_path {
            Some(path) => path.clone(),
            None => dirs::data_dir()
                .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
                .unwrap_or_else(|| PathBuf::from(".murmur"))
                .join(DATABASE_FILE_NAME),
        }
    }
}

/// Command-line values layered over the loaded settings for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettingsOverrides {
    pub api_base_url: Option<String>,
    pub model: Option<String>,
    pub database_path: Option<PathBuf>,
}

pub struct SettingsStore {
    settings: ArcSwap<Settings>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".murmur"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from(&config_path);
        Self {
            settings: ArcSwap::from_pointee(settings),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn settings(&self) -> Arc<Settings> {
        self.settings.load_full()
    }

    /// Replaces the live value for this process without touching the file.
    pub fn apply_overrides(&self, overrides: &SettingsOverrides) -> Arc<Settings> {
        let settings = Arc::new(self.settings().as_ref().clone().with_overrides(overrides));
        self.settings.store(settings.clone());
        settings
    }

    pub fn update(&self, settings: Settings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    fn load_from(path: &Path) -> Settings {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        if path.exists() {
            figment = figment.merge(Json::file(path));
        } else {
            tracing::info!(path = ?path, "settings file not found, using defaults");
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        match figment.extract::<Settings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    path = ?path,
                    error = %error,
                    "failed to parse settings, using defaults"
                );
                Settings::default()
            }
        }
    }

    fn persist(&self, settings: &Settings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "settings-create-dir",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "settings-encode",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "settings-write-temp",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "settings-swap-temp",
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
    #[snafu(display("cannot create config directory {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("cannot encode settings as json on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("cannot write {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("cannot move {from:?} over {to:?} on `{stage}`: {source}"))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

fn default_api_base_url() -> String {
    DEFAULT_API_BASE_URL.to_string()
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_pointer_ttl_secs() -> u64 {
    GENERATION_POINTER_TTL.as_secs()
}

fn non_blank_or(value: String, fallback: fn() -> String) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback()
    } else {
        trimmed.to_string()
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use fold_llm::{DEFAULT_ENDPOINT, DEFAULT_OPENAI_MODEL, ProviderConfig};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::chat::DEFAULT_TURN_TIMEOUT;

pub const SETTINGS_DIRECTORY_NAME: &str = "fold";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
/// Environment variables with this prefix override the settings file.
pub const SETTINGS_ENV_PREFIX: &str = "FOLD_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSettings {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_model_name")]
    pub model_name: String,
    /// Idle seconds allowed between events of a turn. Zero disables the timeout.
    #[serde(default = "default_turn_timeout_secs")]
    pub turn_timeout_secs: u64,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            api_key: String::new(),
            model_name: default_model_name(),
            turn_timeout_secs: default_turn_timeout_secs(),
        }
    }
}

impl ServiceSettings {
    /// Blank fields are kept blank so the backend can report them as missing.
    pub fn to_provider_config(&self) -> ProviderConfig {
        ProviderConfig::new(&self.endpoint, &self.api_key, &self.model_name)
    }

    pub fn turn_timeout(&self) -> Option<Duration> {
        (self.turn_timeout_secs > 0).then(|| Duration::from_secs(self.turn_timeout_secs))
    }

    /// Sets one field by its file key. An empty value clears a text field.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), SettingsError> {
        match key {
            "endpoint" => self.endpoint = value.to_string(),
            "api_key" => self.api_key = value.to_string(),
            "model_name" => self.model_name = value.to_string(),
            "turn_timeout_secs" => {
                self.turn_timeout_secs = value.parse().context(InvalidValueSnafu {
                    stage: "parse-setting-value",
                    key,
                })?;
            }
            _ => {
                return UnknownKeySnafu {
                    stage: "set-setting",
                    key,
                }
                .fail();
            }
        }
        Ok(())
    }

    pub fn normalized(mut self) -> Self {
        self.endpoint = self.endpoint.trim().to_string();
        self.api_key = self.api_key.trim().to_string();
        self.model_name = self.model_name.trim().to_string();
        self
    }
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<ServiceSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".fold"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_disk(&config_path);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<ServiceSettings> {
        self.settings.load_full()
    }

    /// Re-reads the file and environment, replacing the current snapshot.
    pub fn reload(&self) -> Arc<ServiceSettings> {
        let settings = Arc::new(Self::load_from_disk(&self.config_path));
        self.settings.store(settings.clone());
        settings
    }

    pub fn update(&self, settings: ServiceSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    fn load_from_disk(path: &Path) -> ServiceSettings {
        if !path.exists() {
            tracing::info!("settings file not found at {:?}, using defaults", path);
        }

        // A missing file is an empty layer, so environment overrides still apply.
        let figment = Figment::from(Serialized::defaults(ServiceSettings::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(SETTINGS_ENV_PREFIX).split("__"));

        match figment.extract::<ServiceSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    "failed to parse settings from {:?}: {}. using defaults",
                    path,
                    error
                );
                ServiceSettings::default()
            }
        }
    }

    fn persist(&self, settings: &ServiceSettings) -> Result<(), SettingsError> {
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

        tracing::info!("saved settings to {:?}", self.config_path);
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display(
        "unknown setting `{key}` on `{stage}`, expected endpoint, api_key, model_name or turn_timeout_secs"
    ))]
    UnknownKey { stage: &'static str, key: String },
    #[snafu(display("invalid value for `{key}` on `{stage}`: {source}"))]
    InvalidValue {
        stage: &'static str,
        key: String,
        source: std::num::ParseIntError,
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

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_model_name() -> String {
    DEFAULT_OPENAI_MODEL.to_string()
}

fn default_turn_timeout_secs() -> u64 {
    DEFAULT_TURN_TIMEOUT.as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path().join(SETTINGS_FILE_NAME));

        let settings = store.settings();
        assert_eq!(settings.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(settings.model_name, DEFAULT_OPENAI_MODEL);
        assert_eq!(settings.turn_timeout(), Some(DEFAULT_TURN_TIMEOUT));
    }

    #[test]
    fn update_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(SETTINGS_FILE_NAME);
        let store = SettingsStore::new(path.clone());

        store
            .update(ServiceSettings {
                endpoint: " https://example.test/v1 ".to_string(),
                api_key: "sk-test\n".to_string(),
                model_name: "gpt-4o".to_string(),
                turn_timeout_secs: 0,
            })
            .unwrap();

        let reopened = SettingsStore::new(path);
        let settings = reopened.settings();
        assert_eq!(settings.endpoint, "https://example.test/v1");
        assert_eq!(settings.api_key, "sk-test");
        assert_eq!(settings.turn_timeout(), None);
        assert_eq!(
            settings.to_provider_config(),
            ProviderConfig::new("https://example.test/v1", "sk-test", "gpt-4o")
        );
        assert!(!dir.path().join("nested").join("settings.json.tmp").exists());
    }

    #[test]
    fn set_accepts_known_keys_only() {
        let mut settings = ServiceSettings::default();

        settings.set("model_name", "gpt-4.1").unwrap();
        settings.set("turn_timeout_secs", "45").unwrap();
        settings.set("api_key", "").unwrap();
        assert_eq!(settings.model_name, "gpt-4.1");
        assert_eq!(settings.turn_timeout(), Some(Duration::from_secs(45)));
        assert_eq!(settings.api_key, "");

        assert!(matches!(
            settings.set("turn_timeout_secs", "soon"),
            Err(SettingsError::InvalidValue { .. })
        ));
        assert!(matches!(
            settings.set("follow", "1"),
            Err(SettingsError::UnknownKey { key, .. }) if key == "follow"
        ));
        assert_eq!(settings.turn_timeout_secs, 45);
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE_NAME);
        std::fs::write(&path, r#"{ "api_key": "sk-file", "endpoint": "" }"#).unwrap();

        let settings = SettingsStore::new(path).settings();
        assert_eq!(settings.api_key, "sk-file");
        assert_eq!(settings.model_name, DEFAULT_OPENAI_MODEL);
        assert_eq!(
            settings.to_provider_config().missing_parameters(),
            vec![fold_llm::Parameter::Endpoint]
        );
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE_NAME);
        std::fs::write(&path, "{ not json").unwrap();

        let store = SettingsStore::new(path.clone());
        assert_eq!(store.settings().api_key, "");

        std::fs::write(&path, r#"{ "api_key": "sk-later" }"#).unwrap();
        assert_eq!(store.reload().api_key, "sk-later");
    }
}

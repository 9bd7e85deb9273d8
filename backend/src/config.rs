use crate::inference::preprocess::Normalization;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

const DEFAULT_CONFIG_PATH: &str = "config/server.yaml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid config file: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Invalid value {value:?} for {key}")]
    InvalidValue { key: &'static str, value: String },
}

/// How the classification head is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeadMode {
    /// A new randomly initialized head for every request.
    #[default]
    Ephemeral,
    /// One head built at startup and reused.
    Persistent,
}

impl FromStr for HeadMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ephemeral" => Ok(HeadMode::Ephemeral),
            "persistent" => Ok(HeadMode::Persistent),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub port: u16,
    pub bind_host: String,
    pub model_path: PathBuf,
    pub upload_folder: PathBuf,
    pub history_folder: PathBuf,
    pub allowed_origin: String,
    pub history_pagination: bool,
    /// Zero means no cap.
    pub max_upload_bytes: usize,
    pub head_mode: HeadMode,
    pub normalization: Normalization,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 5000,
            bind_host: "0.0.0.0".to_string(),
            model_path: PathBuf::from("model").join("protonet_medical_waste.pt"),
            upload_folder: PathBuf::from("uploads"),
            history_folder: PathBuf::from("history"),
            allowed_origin: "https://medical-waste-classify-p8s8.vercel.app".to_string(),
            history_pagination: false,
            max_upload_bytes: 0,
            head_mode: HeadMode::Ephemeral,
            normalization: Normalization::None,
        }
    }
}

impl AppConfig {
    /// Defaults, then the YAML file named by `APP_CONFIG` (or `config/server.yaml`
    /// when present), then environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("APP_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_PATH))?
            }
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let config_str = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&config_str)
    }

    pub fn from_yaml_str(config_str: &str) -> Result<Self, ConfigError> {
        if config_str.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: AppConfig = serde_yaml::from_str(config_str)?;
        Ok(config)
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("PORT") {
            self.port = parse_value("PORT", &value)?;
        }
        if let Some(value) = lookup("BIND_HOST") {
            self.bind_host = value;
        }
        if let Some(value) = lookup("MODEL_PATH") {
            self.model_path = PathBuf::from(value);
        }
        if let Some(value) = lookup("UPLOAD_FOLDER") {
            self.upload_folder = PathBuf::from(value);
        }
        if let Some(value) = lookup("HISTORY_FOLDER") {
            self.history_folder = PathBuf::from(value);
        }
        if let Some(value) = lookup("CORS_ORIGIN") {
            self.allowed_origin = value;
        }
        if let Some(value) = lookup("HISTORY_PAGINATION") {
            self.history_pagination = parse_flag("HISTORY_PAGINATION", &value)?;
        }
        if let Some(value) = lookup("MAX_UPLOAD_BYTES") {
            self.max_upload_bytes = parse_value("MAX_UPLOAD_BYTES", &value)?;
        }
        if let Some(value) = lookup("CLASSIFIER_HEAD") {
            self.head_mode = parse_value("CLASSIFIER_HEAD", &value)?;
        }
        if let Some(value) = lookup("INPUT_NORMALIZATION") {
            self.normalization = parse_value("INPUT_NORMALIZATION", &value)?;
        }
        Ok(())
    }

    pub fn bind_address(&self) -> (String, u16) {
        (self.bind_host.clone(), self.port)
    }
}

fn parse_value<T: FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
    })
}

fn parse_flag(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: value.to_string(),
        }),
    }
}

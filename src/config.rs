use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(deserialize_with = "deserialize_log_level")]
    pub log_level: LogLevel,
    pub artifact: ArtifactConfig,
    pub model: ModelConfig,
    #[serde(default)]
    pub labels: LabelsConfig,
}

fn deserialize_log_level<'de, D>(deserializer: D) -> Result<LogLevel, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.try_into().map_err(serde::de::Error::custom)
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub static_dir: PathBuf,
    pub index_file: PathBuf,
    #[serde(default = "default_body_limit_bytes")]
    pub body_limit_bytes: usize,
}

fn default_body_limit_bytes() -> usize {
    10 * 1024 * 1024
}

impl ServerConfig {
    pub fn get_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Where the model artifact comes from and where it is cached locally.
#[derive(Debug, Deserialize, Clone)]
pub struct ArtifactConfig {
    pub url: String,
    pub model_dir: PathBuf,
    pub file_name: String,
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
}

fn default_download_timeout_secs() -> u64 {
    3600
}

impl ArtifactConfig {
    pub fn get_path(&self) -> PathBuf {
        self.model_dir.join(&self.file_name)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    #[serde(default = "default_model_instances")]
    pub num_instances: usize,
    #[serde(default = "default_input_size")]
    pub input_size: u32,
    #[serde(default = "default_mean")]
    pub mean: [f32; 3],
    #[serde(default = "default_std")]
    pub std: [f32; 3],
}

fn default_model_instances() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_input_size() -> u32 {
    224
}

// ImageNet channel statistics
fn default_mean() -> [f32; 3] {
    [0.485, 0.456, 0.406]
}

fn default_std() -> [f32; 3] {
    [0.229, 0.224, 0.225]
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            num_instances: default_model_instances(),
            input_size: default_input_size(),
            mean: default_mean(),
            std: default_std(),
        }
    }
}

pub trait Validatable {
    fn validate(&self) -> Result<(), String>;
}

impl Validatable for ModelConfig {
    fn validate(&self) -> Result<(), String> {
        if self.num_instances == 0 {
            return Err("model.num_instances must be at least 1".to_string());
        }
        if self.input_size == 0 {
            return Err("model.input_size must be at least 1".to_string());
        }
        if self.std.iter().any(|s| *s == 0.0) {
            return Err(format!("model.std must not contain zeros: {:?}", self.std));
        }
        Ok(())
    }
}

impl Validatable for ArtifactConfig {
    fn validate(&self) -> Result<(), String> {
        if self.url.trim().is_empty() {
            return Err("artifact.url must not be empty".to_string());
        }
        if self.file_name.trim().is_empty() {
            return Err("artifact.file_name must not be empty".to_string());
        }
        Ok(())
    }
}

/// An optional file replacing the compiled class labels, one label per line.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct LabelsConfig {
    pub labels_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum LogLevel {
    Debug,
    Info,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            other => Err(format!(
                "{} is not a supported minimum log level. Use either `debug` or `info`.",
                other
            )),
        }
    }
}

pub fn get_configuration() -> Result<Config, config::ConfigError> {
    let base_path = std::env::current_dir()
        .map_err(|e| config::ConfigError::Message(format!("no current directory: {}", e)))?;
    let configuration_directory = base_path.join("configuration");

    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(config::ConfigError::Message)?;

    let config = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join("base.yaml"),
        ))
        .add_source(
            config::File::from(
                configuration_directory.join(format!("{}.yaml", environment.as_str())),
            )
            .required(false),
        )
        .add_source(
            config::Environment::with_prefix("APP")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    let config: Config = config.try_deserialize::<Config>()?;

    for result in [config.artifact.validate(), config.model.validate()] {
        if let Err(e) = result {
            tracing::error!("Configuration validation failed: {}", e);
            return Err(config::ConfigError::Message(e));
        }
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_parsing() {
        assert!(matches!(
            Environment::try_from("Production".to_string()),
            Ok(Environment::Production)
        ));
        assert!(Environment::try_from("staging".to_string()).is_err());
    }

    #[test]
    fn test_log_level_parsing() {
        assert_eq!(
            LogLevel::try_from("DEBUG".to_string()).unwrap().as_str(),
            "debug"
        );
        assert!(LogLevel::try_from("trace".to_string()).is_err());
    }

    #[test]
    fn test_artifact_path_joins_dir_and_file() {
        let artifact = ArtifactConfig {
            url: "http://localhost/model.onnx".to_string(),
            model_dir: PathBuf::from("models"),
            file_name: "export.onnx".to_string(),
            download_timeout_secs: 10,
        };

        assert_eq!(artifact.get_path(), PathBuf::from("models/export.onnx"));
        assert!(artifact.validate().is_ok());
    }

    #[test]
    fn test_model_config_rejects_zero_std() {
        let model = ModelConfig {
            std: [0.2, 0.0, 0.2],
            ..ModelConfig::default()
        };

        assert!(model.validate().is_err());
        assert!(ModelConfig::default().validate().is_ok());
    }

    #[test]
    fn test_deserialize_from_yaml() {
        let yaml = r#"
log_level: info
server:
  host: 0.0.0.0
  port: 5000
  static_dir: static
  index_file: view/index.html
artifact:
  url: https://example.com/export.onnx
  model_dir: models
  file_name: export.onnx
model:
  num_instances: 2
"#;
        let config = config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()
            .unwrap()
            .try_deserialize::<Config>()
            .unwrap();

        assert_eq!(config.server.get_address(), "0.0.0.0:5000");
        assert_eq!(config.server.body_limit_bytes, 10 * 1024 * 1024);
        assert_eq!(config.model.num_instances, 2);
        assert_eq!(config.model.input_size, 224);
        assert_eq!(config.artifact.download_timeout_secs, 3600);
        assert!(config.labels.labels_file.is_none());
    }
}

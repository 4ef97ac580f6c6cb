use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(String),
    #[error("parse config failed: {0}")]
    Parse(String),
    #[error("schema load failed: {0}")]
    SchemaLoad(String),
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: Server,
    #[serde(default)]
    pub logging: Logging,
    pub rate_limit: RateLimit,
    #[serde(default)]
    pub sanitizer: Sanitizer,
    pub cache: Cache,
    #[serde(default)]
    pub retrieval: Retrieval,
    pub providers: Providers,
    #[serde(default)]
    pub admin: Admin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub listen_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Logging {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryLimit {
    pub max_requests: usize,
    pub window_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimit {
    pub max_requests: usize,
    pub window_seconds: u64,
    pub burst_limit: usize,
    pub burst_window_seconds: u64,
    #[serde(default)]
    pub categories: BTreeMap<String, CategoryLimit>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sanitizer {
    #[serde(default = "default_max_length")]
    pub max_length: usize,
    #[serde(default = "default_min_length")]
    pub min_length: usize,
}

impl Default for Sanitizer {
    fn default() -> Self {
        Self {
            max_length: default_max_length(),
            min_length: default_min_length(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cache {
    pub enabled: bool,
    pub ttl_seconds: u64,
    pub max_entries: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Retrieval {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl Default for Retrieval {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            max_context_chars: default_max_context_chars(),
            system_prompt: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Providers {
    pub generation: RemoteProvider,
    pub embedding: RemoteProvider,
    pub vector_store: VectorStore,
    #[serde(default)]
    pub documents: Documents,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteProvider {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_provider_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: usize,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorStore {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "default_provider_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Documents {
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Admin {
    #[serde(default)]
    pub api_keys: Vec<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_max_length() -> usize {
    500
}

fn default_min_length() -> usize {
    1
}

fn default_top_k() -> usize {
    3
}

fn default_max_context_chars() -> usize {
    500
}

fn default_provider_timeout_ms() -> u64 {
    10_000
}

fn default_retry_max_attempts() -> usize {
    2
}

fn default_retry_backoff_ms() -> u64 {
    250
}

pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    let config_text =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
    let value: serde_yaml::Value =
        serde_yaml::from_str(&config_text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let instance = serde_json::to_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_against_schema(&instance)?;

    let cfg: Config =
        serde_json::from_value(instance).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_runtime_support(&cfg)?;
    Ok(cfg)
}

fn validate_against_schema(instance: &serde_json::Value) -> Result<(), ConfigError> {
    let schema_path = [
        std::path::PathBuf::from("config/config.schema.json"),
        std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("config/config.schema.json"),
    ]
    .into_iter()
    .find(|p| p.exists())
    .ok_or_else(|| {
        ConfigError::SchemaLoad(
            "config schema not found at config/config.schema.json or workspace config path"
                .to_string(),
        )
    })?;

    let schema_text =
        std::fs::read_to_string(schema_path).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    let schema: serde_json::Value =
        serde_json::from_str(&schema_text).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;

    let validator =
        jsonschema::validator_for(&schema).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    if let Err(first) = validator.validate(instance) {
        return Err(ConfigError::SchemaValidation(first.to_string()));
    }
    Ok(())
}

pub fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    if !matches!(cfg.logging.format.as_str(), "text" | "json") {
        return Err(ConfigError::UnsupportedConfig(format!(
            "logging.format={} is not implemented; supported: text, json",
            cfg.logging.format
        )));
    }
    if cfg.rate_limit.max_requests == 0 || cfg.rate_limit.burst_limit == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "rate_limit.max_requests and rate_limit.burst_limit must be >= 1".to_string(),
        ));
    }
    if cfg.rate_limit.window_seconds == 0 || cfg.rate_limit.burst_window_seconds == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "rate_limit windows must be >= 1 second".to_string(),
        ));
    }
    if cfg.rate_limit.burst_window_seconds > cfg.rate_limit.window_seconds {
        return Err(ConfigError::UnsupportedConfig(
            "rate_limit.burst_window_seconds must not exceed rate_limit.window_seconds"
                .to_string(),
        ));
    }
    for (name, limit) in &cfg.rate_limit.categories {
        if limit.max_requests == 0 || limit.window_seconds == 0 {
            return Err(ConfigError::UnsupportedConfig(format!(
                "rate_limit.categories.{name} needs max_requests >= 1 and window_seconds >= 1"
            )));
        }
    }
    if cfg.sanitizer.min_length == 0 || cfg.sanitizer.min_length > cfg.sanitizer.max_length {
        return Err(ConfigError::UnsupportedConfig(
            "sanitizer.min_length must be >= 1 and <= sanitizer.max_length".to_string(),
        ));
    }
    if cfg.cache.enabled && cfg.cache.max_entries == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "cache.max_entries must be >= 1 when cache.enabled=true".to_string(),
        ));
    }
    if cfg.retrieval.top_k == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "retrieval.top_k must be >= 1".to_string(),
        ));
    }
    validate_remote_provider("generation", &cfg.providers.generation)?;
    validate_remote_provider("embedding", &cfg.providers.embedding)?;
    if !matches!(cfg.providers.vector_store.kind.as_str(), "memory" | "disabled") {
        return Err(ConfigError::UnsupportedConfig(format!(
            "providers.vector_store.type={} is not implemented; supported: memory, disabled",
            cfg.providers.vector_store.kind
        )));
    }
    if cfg.admin.api_keys.iter().any(|k| k.trim().is_empty()) {
        return Err(ConfigError::UnsupportedConfig(
            "admin.api_keys must not contain empty keys".to_string(),
        ));
    }
    Ok(())
}

fn validate_remote_provider(name: &str, provider: &RemoteProvider) -> Result<(), ConfigError> {
    match provider.kind.as_str() {
        "http" => {
            if provider
                .endpoint
                .as_ref()
                .map(|v| v.trim().is_empty())
                .unwrap_or(true)
            {
                return Err(ConfigError::UnsupportedConfig(format!(
                    "providers.{name}.endpoint is required when providers.{name}.type=http"
                )));
            }
        }
        "disabled" => {
            if provider.endpoint.is_some() {
                return Err(ConfigError::UnsupportedConfig(format!(
                    "providers.{name}.endpoint is not supported when providers.{name}.type=disabled"
                )));
            }
            return Ok(());
        }
        other => {
            return Err(ConfigError::UnsupportedConfig(format!(
                "providers.{name}.type={other} is not implemented; supported: http, disabled"
            )));
        }
    }
    if provider.retry_max_attempts == 0 {
        return Err(ConfigError::UnsupportedConfig(format!(
            "providers.{name}.retry_max_attempts must be >= 1"
        )));
    }
    if provider.timeout_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(format!(
            "providers.{name}.timeout_ms must be >= 1"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn write_temp_config(contents: &str) -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before unix epoch")
            .as_nanos();
        let path = std::env::temp_dir().join(format!("concierge-config-test-{nanos}.yaml"));
        std::fs::write(&path, contents).expect("write temp config");
        path.to_string_lossy().to_string()
    }

    fn base_yaml() -> String {
        r#"
server:
  listen_addr: "127.0.0.1:0"

rate_limit:
  max_requests: 30
  window_seconds: 60
  burst_limit: 5
  burst_window_seconds: 10
  categories:
    admin:
      max_requests: 10
      window_seconds: 3600

cache:
  enabled: true
  ttl_seconds: 3600
  max_entries: 1000

providers:
  generation:
    type: "http"
    endpoint: "http://127.0.0.1:9000/generate"
    timeout_ms: 15000
  embedding:
    type: "disabled"
  vector_store:
    type: "memory"
"#
        .to_string()
    }

    #[test]
    fn applies_defaults_for_optional_sections() {
        let path = write_temp_config(&base_yaml());
        let cfg = load_and_validate(&path).expect("base config should be accepted");
        assert_eq!(cfg.sanitizer.max_length, 500);
        assert_eq!(cfg.retrieval.top_k, 3);
        assert_eq!(cfg.logging.format, "text");
        assert_eq!(cfg.providers.generation.retry_max_attempts, 2);
        assert_eq!(cfg.rate_limit.categories["admin"].max_requests, 10);
        assert!(cfg.admin.api_keys.is_empty());
    }

    #[test]
    fn rejects_http_provider_without_endpoint() {
        let path = write_temp_config(&base_yaml().replace(
            "    endpoint: \"http://127.0.0.1:9000/generate\"\n",
            "",
        ));
        let err = load_and_validate(&path).expect_err("expected unsupported config");
        assert!(matches!(
            err,
            ConfigError::SchemaValidation(_) | ConfigError::UnsupportedConfig(_)
        ));
    }

    #[test]
    fn rejects_burst_window_longer_than_primary_window() {
        let path = write_temp_config(
            &base_yaml().replace("burst_window_seconds: 10", "burst_window_seconds: 120"),
        );
        let err = load_and_validate(&path).expect_err("expected unsupported config");
        assert!(matches!(err, ConfigError::UnsupportedConfig(_)));
    }

    #[test]
    fn rejects_unknown_vector_store_type() {
        let path = write_temp_config(&base_yaml().replace("type: \"memory\"", "type: \"faiss\""));
        let err = load_and_validate(&path).expect_err("expected unsupported config");
        assert!(matches!(
            err,
            ConfigError::SchemaValidation(_) | ConfigError::UnsupportedConfig(_)
        ));
    }

    #[test]
    fn rejects_unsupported_log_format() {
        let path = write_temp_config(&format!(
            "{}\nlogging:\n  level: \"debug\"\n  format: \"logfmt\"\n",
            base_yaml()
        ));
        let err = load_and_validate(&path).expect_err("expected unsupported config");
        assert!(matches!(
            err,
            ConfigError::SchemaValidation(_) | ConfigError::UnsupportedConfig(_)
        ));
    }
}

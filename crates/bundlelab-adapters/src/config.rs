//! Run configuration for bundlelab
//!
//! Read from `bundlelab.toml` in the working directory, an explicit path, or
//! `~/.config/bundlelab/config.toml`. Model credentials are resolved once into
//! [`ResolvedModels`] before any model is called.

use crate::keyring;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

pub const LOCAL_CONFIG_FILE: &str = "bundlelab.toml";
const DEFAULT_DATASET: &str = "electronic";
const DEFAULT_FEEDBACK_ITERATIONS: usize = 3;
const DEFAULT_CONCURRENCY: usize = 4;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("no API key for the {provider} model: set it in the config, export {env_var}, or run `bundlelab credentials set --provider {provider}`")]
    MissingApiKey {
        provider: &'static str,
        env_var: &'static str,
    },
    #[error("invalid base URL '{url}': {source}")]
    InvalidBaseUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("{field} must be at least 1")]
    ZeroValue { field: &'static str },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    OpenAi,
    #[serde(alias = "claude")]
    Anthropic,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::Anthropic => "anthropic",
        }
    }

    /// Model used when a configuration names a provider but no model.
    pub fn default_model(&self) -> &'static str {
        match self {
            Provider::OpenAi => "gpt-3.5-turbo",
            Provider::Anthropic => "claude-3-5-haiku-latest",
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            Provider::OpenAi => "https://api.openai.com/v1/",
            Provider::Anthropic => "https://api.anthropic.com/v1/",
        }
    }

    pub fn env_var(&self) -> &'static str {
        match self {
            Provider::OpenAi => "OPENAI_API_KEY",
            Provider::Anthropic => "ANTHROPIC_API_KEY",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A model as written in the config file. Every field is optional and filled
/// in by [`RunConfig::resolve_models`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub provider: Option<Provider>,
    pub name: Option<String>,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub dataset: String,
    pub data_path: PathBuf,
    pub temp_path: PathBuf,
    pub log_path: Option<PathBuf>,
    pub feedback_iteration: usize,
    pub concurrency: usize,
    /// Enables placeholder score synthesis when rating replies are unreadable.
    pub permissive_parsing: bool,
    pub model: ModelConfig,
    pub intent_raters: Vec<ModelConfig>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            dataset: DEFAULT_DATASET.to_string(),
            data_path: PathBuf::from("data"),
            temp_path: PathBuf::from("temp"),
            log_path: None,
            feedback_iteration: DEFAULT_FEEDBACK_ITERATIONS,
            concurrency: DEFAULT_CONCURRENCY,
            permissive_parsing: false,
            model: ModelConfig::default(),
            intent_raters: Vec::new(),
        }
    }
}

impl RunConfig {
    fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("bundlelab").join("config.toml"))
    }

    /// Load an explicit config file, or the first of `./bundlelab.toml` and
    /// the user config file that exists. With neither, defaults are used.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => [Some(PathBuf::from(LOCAL_CONFIG_FILE)), Self::user_config_path()]
                .into_iter()
                .flatten()
                .find(|candidate| candidate.is_file()),
        };

        let Some(path) = path else {
            tracing::debug!("no config file found, using defaults");
            return Ok(Self::default());
        };

        let content = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let config = Self::from_toml_str(&content).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::ZeroValue {
                field: "concurrency",
            });
        }
        Ok(())
    }

    /// Directory holding the dataset's reference data.
    pub fn dataset_dir(&self) -> PathBuf {
        self.data_path.join(&self.dataset)
    }

    /// Directory holding the dataset's persisted stage artifacts.
    pub fn artifact_dir(&self) -> PathBuf {
        self.temp_path.join(&self.dataset)
    }

    pub fn resolve_models(&self) -> Result<ResolvedModels, ConfigError> {
        self.resolve_models_with(&SystemSecrets)
    }

    /// Resolve the primary model and every rater into complete descriptors.
    ///
    /// API keys come from the config value, then the provider's environment
    /// variable, then the credential store. Raters additionally fall back to
    /// the primary model's key. With no raters configured, the primary model
    /// rates its own intents.
    pub fn resolve_models_with(
        &self,
        secrets: &dyn SecretSource,
    ) -> Result<ResolvedModels, ConfigError> {
        let provider = self.model.provider.unwrap_or_default();
        let api_key = lookup_key(&self.model, provider, secrets).ok_or(
            ConfigError::MissingApiKey {
                provider: provider.as_str(),
                env_var: provider.env_var(),
            },
        )?;
        let primary = ResolvedModel::build(&self.model, provider, api_key, 0.0)?;

        let mut raters = Vec::with_capacity(self.intent_raters.len());
        for rater in &self.intent_raters {
            let rater_provider = rater.provider.unwrap_or(provider);
            if rater.name.is_none() {
                tracing::warn!(
                    provider = rater_provider.as_str(),
                    model = rater_provider.default_model(),
                    "intent rater has no model name, using provider default"
                );
            }
            let key = match lookup_key(rater, rater_provider, secrets) {
                Some(key) => key,
                None => {
                    tracing::warn!(
                        provider = rater_provider.as_str(),
                        "intent rater has no API key, using the primary model's key"
                    );
                    primary.api_key.clone()
                }
            };
            raters.push(ResolvedModel::build(rater, rater_provider, key, 0.0)?);
        }

        let raters_fell_back = raters.is_empty();
        if raters_fell_back {
            tracing::warn!("no intent raters configured, the primary model will rate intents");
            raters.push(primary.clone());
        }

        Ok(ResolvedModels {
            primary,
            raters,
            raters_fell_back,
        })
    }
}

fn lookup_key(model: &ModelConfig, provider: Provider, secrets: &dyn SecretSource) -> Option<String> {
    model
        .api_key
        .clone()
        .or_else(|| secrets.env_key(provider))
        .or_else(|| secrets.stored_key(provider))
        .map(|key| key.trim().to_string())
        .filter(|key| !key.is_empty())
}

/// Where API keys come from when the config file has none.
pub trait SecretSource {
    fn env_key(&self, provider: Provider) -> Option<String>;
    fn stored_key(&self, provider: Provider) -> Option<String>;
}

/// Process environment plus the credential store.
pub struct SystemSecrets;

impl SecretSource for SystemSecrets {
    fn env_key(&self, provider: Provider) -> Option<String> {
        std::env::var(provider.env_var()).ok()
    }

    fn stored_key(&self, provider: Provider) -> Option<String> {
        match keyring::get_provider_key(provider) {
            Ok(key) => key,
            Err(err) => {
                keyring::warn_keychain_error_once("API key", &err);
                None
            }
        }
    }
}

/// A fully specified model endpoint.
#[derive(Clone, PartialEq)]
pub struct ResolvedModel {
    pub provider: Provider,
    pub name: String,
    pub api_key: String,
    pub base_url: Url,
    pub temperature: f32,
}

impl ResolvedModel {
    fn build(
        config: &ModelConfig,
        provider: Provider,
        api_key: String,
        default_temperature: f32,
    ) -> Result<Self, ConfigError> {
        let raw_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| provider.default_base_url().to_string());
        // Url::join drops the last path segment unless the base ends in '/'.
        let normalized = if raw_url.ends_with('/') {
            raw_url.clone()
        } else {
            format!("{}/", raw_url)
        };
        let base_url = Url::parse(&normalized).map_err(|source| ConfigError::InvalidBaseUrl {
            url: raw_url,
            source,
        })?;
        Ok(Self {
            provider,
            name: config
                .name
                .clone()
                .filter(|name| !name.trim().is_empty())
                .unwrap_or_else(|| provider.default_model().to_string()),
            api_key,
            base_url,
            temperature: config.temperature.unwrap_or(default_temperature),
        })
    }

    pub fn endpoint(&self, path: &str) -> Result<Url, url::ParseError> {
        self.base_url.join(path)
    }
}

impl fmt::Debug for ResolvedModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedModel")
            .field("provider", &self.provider)
            .field("name", &self.name)
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url.as_str())
            .field("temperature", &self.temperature)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedModels {
    pub primary: ResolvedModel,
    pub raters: Vec<ResolvedModel>,
    /// True when no rater was configured and the primary model stands in.
    pub raters_fell_back: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct FakeSecrets {
        env: HashMap<Provider, String>,
        stored: HashMap<Provider, String>,
    }

    impl SecretSource for FakeSecrets {
        fn env_key(&self, provider: Provider) -> Option<String> {
            self.env.get(&provider).cloned()
        }

        fn stored_key(&self, provider: Provider) -> Option<String> {
            self.stored.get(&provider).cloned()
        }
    }

    #[test]
    fn defaults_apply_to_empty_file() {
        let config = RunConfig::from_toml_str("").unwrap();
        assert_eq!(config, RunConfig::default());
        assert_eq!(config.dataset_dir(), PathBuf::from("data/electronic"));
        assert_eq!(config.artifact_dir(), PathBuf::from("temp/electronic"));
    }

    #[test]
    fn parses_full_config() {
        let config = RunConfig::from_toml_str(
            r#"
            dataset = "clothing"
            data_path = "/srv/data"
            feedback_iteration = 5
            permissive_parsing = true

            [model]
            provider = "openai"
            name = "gpt-4o-mini"
            temperature = 0.2

            [[intent_raters]]
            provider = "claude"
            name = "claude-3-5-sonnet-latest"

            [[intent_raters]]
            provider = "openai"
            "#,
        )
        .unwrap();
        assert_eq!(config.dataset, "clothing");
        assert_eq!(config.feedback_iteration, 5);
        assert_eq!(config.concurrency, DEFAULT_CONCURRENCY);
        assert!(config.permissive_parsing);
        assert_eq!(config.intent_raters.len(), 2);
        assert_eq!(config.intent_raters[0].provider, Some(Provider::Anthropic));
        assert_eq!(config.model.temperature, Some(0.2));
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let config = RunConfig {
            concurrency: 0,
            ..RunConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroValue { field: "concurrency" })
        ));
    }

    #[test]
    fn missing_primary_key_is_an_error() {
        let err = RunConfig::default()
            .resolve_models_with(&FakeSecrets::default())
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingApiKey {
                env_var: "OPENAI_API_KEY",
                ..
            }
        ));
    }

    #[test]
    fn key_precedence_is_config_then_env_then_store() {
        let mut secrets = FakeSecrets::default();
        secrets.stored.insert(Provider::OpenAi, "stored".into());
        let mut config = RunConfig::default();
        let resolved = config.resolve_models_with(&secrets).unwrap();
        assert_eq!(resolved.primary.api_key, "stored");

        secrets.env.insert(Provider::OpenAi, "from-env".into());
        let resolved = config.resolve_models_with(&secrets).unwrap();
        assert_eq!(resolved.primary.api_key, "from-env");

        config.model.api_key = Some("explicit".into());
        let resolved = config.resolve_models_with(&secrets).unwrap();
        assert_eq!(resolved.primary.api_key, "explicit");
    }

    #[test]
    fn raters_fill_missing_name_and_key() {
        let mut secrets = FakeSecrets::default();
        secrets.env.insert(Provider::OpenAi, "sk-primary".into());
        let config = RunConfig {
            intent_raters: vec![
                ModelConfig {
                    provider: Some(Provider::Anthropic),
                    ..ModelConfig::default()
                },
                ModelConfig {
                    name: Some("gpt-4o".into()),
                    temperature: Some(0.5),
                    ..ModelConfig::default()
                },
            ],
            ..RunConfig::default()
        };
        let resolved = config.resolve_models_with(&secrets).unwrap();
        assert!(!resolved.raters_fell_back);

        let claude = &resolved.raters[0];
        assert_eq!(claude.provider, Provider::Anthropic);
        assert_eq!(claude.name, "claude-3-5-haiku-latest");
        assert_eq!(claude.api_key, "sk-primary");
        assert_eq!(claude.base_url.as_str(), "https://api.anthropic.com/v1/");

        let openai = &resolved.raters[1];
        assert_eq!(openai.provider, Provider::OpenAi);
        assert_eq!(openai.name, "gpt-4o");
        assert_eq!(openai.temperature, 0.5);
    }

    #[test]
    fn no_raters_falls_back_to_primary() {
        let mut config = RunConfig::default();
        config.model.api_key = Some("sk-x".into());
        config.model.name = Some("gpt-4o-mini".into());
        let resolved = config
            .resolve_models_with(&FakeSecrets::default())
            .unwrap();
        assert!(resolved.raters_fell_back);
        assert_eq!(resolved.raters, vec![resolved.primary.clone()]);
    }

    #[test]
    fn base_url_gets_trailing_slash_and_debug_redacts_key() {
        let mut config = RunConfig::default();
        config.model.api_key = Some("sk-secret-value".into());
        config.model.base_url = Some("http://localhost:8080/v1".into());
        let resolved = config
            .resolve_models_with(&FakeSecrets::default())
            .unwrap();
        assert_eq!(
            resolved.primary.endpoint("chat/completions").unwrap().as_str(),
            "http://localhost:8080/v1/chat/completions"
        );
        let debug = format!("{:?}", resolved.primary);
        assert!(!debug.contains("sk-secret-value"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn invalid_base_url_is_reported() {
        let mut config = RunConfig::default();
        config.model.api_key = Some("sk-x".into());
        config.model.base_url = Some("not a url".into());
        assert!(matches!(
            config.resolve_models_with(&FakeSecrets::default()),
            Err(ConfigError::InvalidBaseUrl { .. })
        ));
    }

    #[test]
    fn load_reads_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.toml");
        fs::write(&path, "dataset = \"food\"\nconcurrency = 2\n").unwrap();
        let config = RunConfig::load(Some(&path)).unwrap();
        assert_eq!(config.dataset, "food");
        assert_eq!(config.concurrency, 2);

        fs::write(&path, "dataset = [").unwrap();
        assert!(matches!(
            RunConfig::load(Some(&path)),
            Err(ConfigError::Parse { .. })
        ));
        assert!(matches!(
            RunConfig::load(Some(&dir.path().join("missing.toml"))),
            Err(ConfigError::Read { .. })
        ));
    }
}

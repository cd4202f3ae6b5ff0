//! Runtime configuration for the finalize pipeline.
//!
//! ## Precedence (highest to lowest)
//!
//! 1. `FINALIZE_*` environment variables
//! 2. TOML config file (`--config`), every section optional
//! 3. Built-in defaults
//!
//! ## Sections
//!
//! | Section         | Controls                                              |
//! |-----------------|-------------------------------------------------------|
//! | `model`         | provider, model name, endpoint, temperature, timeout  |
//! | `budget`        | per-call ceiling, daily quota, cost alerts, pricing   |
//! | `retry`         | attempts and backoff for transient upstream failures  |
//! | `assumptions`   | auto-assume switch and confidence threshold           |
//! | `contradiction` | semantic pass caps, similarity threshold, rule table  |
//! | `telemetry`     | sink selection, raw inclusion, field length, timeout  |

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use finalize_gates::{AutoAssumePolicy, BudgetConfig, RetryPolicy, RuleSet};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_MODEL: &str = "gpt-5-nano";
const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

const ENV_PROVIDER: &str = "FINALIZE_PROVIDER";
const ENV_MODEL: &str = "FINALIZE_MODEL";
const ENV_API_BASE: &str = "FINALIZE_API_BASE";
const ENV_API_KEY: &str = "FINALIZE_API_KEY";
const ENV_OPENAI_API_KEY: &str = "OPENAI_API_KEY";
const ENV_TEMPERATURE: &str = "FINALIZE_TEMPERATURE";
const ENV_MAX_OUTPUT_TOKENS: &str = "FINALIZE_MAX_OUTPUT_TOKENS";
const ENV_CALL_TIMEOUT_SECS: &str = "FINALIZE_CALL_TIMEOUT_SECS";
const ENV_MAX_INPUT_TOKENS: &str = "FINALIZE_MAX_INPUT_TOKENS";
const ENV_DAILY_TOKEN_QUOTA: &str = "FINALIZE_DAILY_TOKEN_QUOTA";
const ENV_COST_ALERT_USD: &str = "FINALIZE_COST_ALERT_USD";
const ENV_SINGLE_CALL_COST_ALERT_USD: &str = "FINALIZE_SINGLE_CALL_COST_ALERT_USD";
const ENV_INPUT_PRICE: &str = "FINALIZE_INPUT_PRICE_PER_MTOKENS";
const ENV_OUTPUT_PRICE: &str = "FINALIZE_OUTPUT_PRICE_PER_MTOKENS";
const ENV_AUTOASSUME_ENABLED: &str = "FINALIZE_AUTOASSUME_ENABLED";
const ENV_AUTOASSUME_THRESHOLD: &str = "FINALIZE_AUTOASSUME_CONFIDENCE_THRESHOLD";
const ENV_SEMANTIC_ENABLED: &str = "FINALIZE_SEMANTIC_CONTRADICTION_ENABLED";
const ENV_SEMANTIC_MAX_PAIRS: &str = "FINALIZE_SEMANTIC_CONTRADICTION_MAX_PAIRS";
const ENV_SEMANTIC_MAX_TOKENS: &str = "FINALIZE_SEMANTIC_CONTRADICTION_MAX_TOKENS";
const ENV_SIMILARITY_THRESHOLD: &str = "FINALIZE_SIMILARITY_THRESHOLD";
const ENV_MAX_RETRIES: &str = "FINALIZE_LLM_MAX_RETRIES";
const ENV_BACKOFF_BASE_MS: &str = "FINALIZE_LLM_BACKOFF_BASE_MS";
const ENV_BACKOFF_MAX_MS: &str = "FINALIZE_LLM_BACKOFF_MAX_MS";
const ENV_TELEMETRY_ENABLED: &str = "FINALIZE_TELEMETRY_ENABLED";
const ENV_TELEMETRY_INCLUDE_RAW: &str = "FINALIZE_TELEMETRY_INCLUDE_RAW";
const ENV_TELEMETRY_ENDPOINT: &str = "FINALIZE_TELEMETRY_ENDPOINT";
const ENV_TELEMETRY_PATH: &str = "FINALIZE_TELEMETRY_PATH";
const ENV_TELEMETRY_MAX_FIELD_LEN: &str = "FINALIZE_TELEMETRY_MAX_FIELD_LEN";
const ENV_TELEMETRY_TIMEOUT_MS: &str = "FINALIZE_TELEMETRY_TIMEOUT_MS";
const ENV_RUNS_DIR: &str = "FINALIZE_RUNS_DIR";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value for {name}: {value:?} ({reason})")]
    Env {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Model provider behind the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// OpenAI-compatible chat completions endpoint.
    Openai,
    /// Deterministic offline stub.
    Mock,
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Openai => write!(f, "openai"),
            Self::Mock => write!(f, "mock"),
        }
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::Openai),
            "mock" | "stub" | "offline" => Ok(Self::Mock),
            other => Err(format!("unsupported provider '{other}' (expected openai|mock)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub provider: Provider,
    pub model: String,
    pub api_base: String,
    /// Never serialized back out.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub call_timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: Provider::Openai,
            model: DEFAULT_MODEL.to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
            api_key: None,
            temperature: 0.2,
            max_output_tokens: 2_048,
            call_timeout_secs: 60,
        }
    }
}

impl ModelConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContradictionConfig {
    pub semantic_enabled: bool,
    /// Hard cap on pairs sent to the semantic pass.
    pub max_pairs: usize,
    /// Token budget for each requirement's text inside a pair prompt.
    pub max_tokens_per_pair: u64,
    pub similarity_threshold: f64,
    pub rules: RuleSet,
}

impl Default for ContradictionConfig {
    fn default() -> Self {
        Self {
            semantic_enabled: true,
            max_pairs: 5,
            max_tokens_per_pair: 256,
            similarity_threshold: 0.2,
            rules: RuleSet::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enabled: bool,
    /// Include the masked raw model excerpt in records.
    pub include_raw: bool,
    /// HTTP endpoint; takes priority over `path`.
    pub endpoint: Option<String>,
    /// JSONL file; defaults to `<runs_dir>/telemetry.jsonl` when enabled.
    pub path: Option<PathBuf>,
    pub max_field_len: usize,
    pub timeout_ms: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            include_raw: false,
            endpoint: None,
            path: None,
            max_field_len: 512,
            timeout_ms: 2_000,
        }
    }
}

impl TelemetryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FinalizeConfig {
    pub model: ModelConfig,
    pub budget: BudgetConfig,
    pub retry: RetryPolicy,
    pub assumptions: AutoAssumePolicy,
    pub contradiction: ContradictionConfig,
    pub telemetry: TelemetryConfig,
    /// Run artifacts, the usage ledger and the default telemetry file live here.
    pub runs_dir: PathBuf,
    pub persist_artifacts: bool,
}

impl Default for FinalizeConfig {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            budget: BudgetConfig::default(),
            retry: RetryPolicy::default(),
            assumptions: AutoAssumePolicy::default(),
            contradiction: ContradictionConfig::default(),
            telemetry: TelemetryConfig::default(),
            runs_dir: PathBuf::from("runs"),
            persist_artifacts: true,
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Environment reader over an injectable lookup so tests never touch the
/// process environment.
struct EnvSource<F: Fn(&str) -> Option<String>> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvSource<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T: FromStr>(&self, name: &'static str) -> Result<Option<T>, ConfigError>
    where
        T::Err: std::fmt::Display,
    {
        match self.string(name) {
            None => Ok(None),
            Some(value) => value.parse::<T>().map(Some).map_err(|e| ConfigError::Env {
                name,
                reason: e.to_string(),
                value,
            }),
        }
    }

    fn flag(&self, name: &'static str) -> Result<Option<bool>, ConfigError> {
        match self.string(name) {
            None => Ok(None),
            Some(value) => parse_bool(&value).map(Some).ok_or(ConfigError::Env {
                name,
                value,
                reason: "expected one of 1/0, true/false, yes/no, on/off".into(),
            }),
        }
    }
}

impl FinalizeConfig {
    /// Defaults overlaid with `FINALIZE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_with(|name| std::env::var(name).ok())?;
        config.sync_derived();
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file. Missing sections and keys keep their defaults.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Defaults, then the optional TOML file, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with(path, |name| std::env::var(name).ok())
    }

    pub fn load_with(
        path: Option<&Path>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_toml_file(p)?,
            None => Self::default(),
        };
        config.apply_env_with(lookup)?;
        config.sync_derived();
        config.validate()?;
        Ok(config)
    }

    /// Overlay environment values read through `lookup`.
    pub fn apply_env_with(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let env = EnvSource { lookup };

        if let Some(provider) = env.parse::<Provider>(ENV_PROVIDER)? {
            self.model.provider = provider;
        }
        if let Some(model) = env.string(ENV_MODEL) {
            self.model.model = model;
        }
        if let Some(base) = env.string(ENV_API_BASE) {
            self.model.api_base = base;
        }
        if let Some(key) = env.string(ENV_API_KEY).or_else(|| env.string(ENV_OPENAI_API_KEY)) {
            self.model.api_key = Some(key);
        }
        if let Some(v) = env.parse(ENV_TEMPERATURE)? {
            self.model.temperature = v;
        }
        if let Some(v) = env.parse(ENV_MAX_OUTPUT_TOKENS)? {
            self.model.max_output_tokens = v;
        }
        if let Some(v) = env.parse(ENV_CALL_TIMEOUT_SECS)? {
            self.model.call_timeout_secs = v;
        }

        if let Some(v) = env.parse(ENV_MAX_INPUT_TOKENS)? {
            self.budget.max_input_tokens = v;
        }
        if let Some(v) = env.parse(ENV_DAILY_TOKEN_QUOTA)? {
            self.budget.daily_token_quota = v;
        }
        if let Some(v) = env.parse(ENV_COST_ALERT_USD)? {
            self.budget.cost_alert_usd = Some(v);
        }
        if let Some(v) = env.parse(ENV_SINGLE_CALL_COST_ALERT_USD)? {
            self.budget.single_call_cost_alert_usd = Some(v);
        }
        if let Some(v) = env.parse(ENV_INPUT_PRICE)? {
            self.budget.pricing.input_per_mtokens = v;
        }
        if let Some(v) = env.parse(ENV_OUTPUT_PRICE)? {
            self.budget.pricing.output_per_mtokens = v;
        }

        if let Some(v) = env.flag(ENV_AUTOASSUME_ENABLED)? {
            self.assumptions.enabled = v;
        }
        if let Some(v) = env.parse(ENV_AUTOASSUME_THRESHOLD)? {
            self.assumptions.confidence_threshold = v;
        }

        if let Some(v) = env.flag(ENV_SEMANTIC_ENABLED)? {
            self.contradiction.semantic_enabled = v;
        }
        if let Some(v) = env.parse(ENV_SEMANTIC_MAX_PAIRS)? {
            self.contradiction.max_pairs = v;
        }
        if let Some(v) = env.parse(ENV_SEMANTIC_MAX_TOKENS)? {
            self.contradiction.max_tokens_per_pair = v;
        }
        if let Some(v) = env.parse(ENV_SIMILARITY_THRESHOLD)? {
            self.contradiction.similarity_threshold = v;
        }

        if let Some(v) = env.parse(ENV_MAX_RETRIES)? {
            self.retry.max_retries = v;
        }
        if let Some(v) = env.parse(ENV_BACKOFF_BASE_MS)? {
            self.retry.initial_backoff_ms = v;
        }
        if let Some(v) = env.parse(ENV_BACKOFF_MAX_MS)? {
            self.retry.max_backoff_ms = v;
        }

        if let Some(v) = env.flag(ENV_TELEMETRY_ENABLED)? {
            self.telemetry.enabled = v;
        }
        if let Some(v) = env.flag(ENV_TELEMETRY_INCLUDE_RAW)? {
            self.telemetry.include_raw = v;
        }
        if let Some(v) = env.string(ENV_TELEMETRY_ENDPOINT) {
            self.telemetry.endpoint = Some(v);
        }
        if let Some(v) = env.string(ENV_TELEMETRY_PATH) {
            self.telemetry.path = Some(PathBuf::from(v));
        }
        if let Some(v) = env.parse(ENV_TELEMETRY_MAX_FIELD_LEN)? {
            self.telemetry.max_field_len = v;
        }
        if let Some(v) = env.parse(ENV_TELEMETRY_TIMEOUT_MS)? {
            self.telemetry.timeout_ms = v;
        }

        if let Some(v) = env.string(ENV_RUNS_DIR) {
            self.runs_dir = PathBuf::from(v);
        }
        Ok(())
    }

    /// Keep values that live in two sections consistent.
    pub fn sync_derived(&mut self) {
        self.budget.max_output_tokens = u64::from(self.model.max_output_tokens);
    }

    /// Validate all sections.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_inner().map_err(ConfigError::Invalid)
    }

    fn validate_inner(&self) -> Result<(), String> {
        if !(0.0..=2.0).contains(&self.model.temperature) {
            return Err(format!(
                "model.temperature must be in [0, 2], got {}",
                self.model.temperature
            ));
        }
        if self.model.max_output_tokens == 0 {
            return Err("model.max_output_tokens must be > 0".to_string());
        }
        if self.model.call_timeout_secs == 0 {
            return Err("model.call_timeout_secs must be > 0".to_string());
        }
        self.budget.validate()?;
        self.retry.validate()?;
        self.assumptions.validate()?;
        self.contradiction.rules.validate()?;
        if !(0.0..=1.0).contains(&self.contradiction.similarity_threshold) {
            return Err(format!(
                "contradiction.similarity_threshold must be in [0, 1], got {}",
                self.contradiction.similarity_threshold
            ));
        }
        if self.contradiction.max_tokens_per_pair == 0 {
            return Err("contradiction.max_tokens_per_pair must be > 0".to_string());
        }
        if self.telemetry.max_field_len < 16 {
            return Err(format!(
                "telemetry.max_field_len must be >= 16, got {}",
                self.telemetry.max_field_len
            ));
        }
        if self.telemetry.timeout_ms == 0 {
            return Err("telemetry.timeout_ms must be > 0".to_string());
        }
        Ok(())
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.runs_dir.join("usage.json")
    }

    pub fn telemetry_path(&self) -> PathBuf {
        self.telemetry
            .path
            .clone()
            .unwrap_or_else(|| self.runs_dir.join("telemetry.jsonl"))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn default_config_validates() {
        let config = FinalizeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.model.model, "gpt-5-nano");
        assert_eq!(config.assumptions.confidence_threshold, 0.6);
        assert_eq!(config.contradiction.max_pairs, 5);
        assert_eq!(config.retry.max_retries, 2);
    }

    #[test]
    fn env_overrides_defaults() {
        let config = FinalizeConfig::load_with(
            None,
            lookup(&[
                ("FINALIZE_PROVIDER", "mock"),
                ("FINALIZE_MAX_OUTPUT_TOKENS", "512"),
                ("FINALIZE_DAILY_TOKEN_QUOTA", "1000"),
                ("FINALIZE_AUTOASSUME_ENABLED", "off"),
                ("FINALIZE_SEMANTIC_CONTRADICTION_MAX_PAIRS", "2"),
                ("FINALIZE_INPUT_PRICE_PER_MTOKENS", "0.05"),
                ("FINALIZE_RUNS_DIR", "/tmp/finalize-runs"),
            ]),
        )
        .unwrap();
        assert_eq!(config.model.provider, Provider::Mock);
        assert_eq!(config.budget.daily_token_quota, 1000);
        assert_eq!(config.budget.max_output_tokens, 512);
        assert!(!config.assumptions.enabled);
        assert_eq!(config.contradiction.max_pairs, 2);
        assert_eq!(config.budget.pricing.input_per_mtokens, 0.05);
        assert_eq!(config.ledger_path(), PathBuf::from("/tmp/finalize-runs/usage.json"));
    }

    #[test]
    fn api_key_falls_back_to_openai_var() {
        let config =
            FinalizeConfig::load_with(None, lookup(&[("OPENAI_API_KEY", "sk-test")])).unwrap();
        assert_eq!(config.model.api_key.as_deref(), Some("sk-test"));

        let config = FinalizeConfig::load_with(
            None,
            lookup(&[("OPENAI_API_KEY", "sk-a"), ("FINALIZE_API_KEY", "sk-b")]),
        )
        .unwrap();
        assert_eq!(config.model.api_key.as_deref(), Some("sk-b"));
    }

    #[test]
    fn bad_env_value_names_the_variable() {
        let err = FinalizeConfig::load_with(None, lookup(&[("FINALIZE_LLM_MAX_RETRIES", "lots")]))
            .unwrap_err();
        assert!(err.to_string().contains("FINALIZE_LLM_MAX_RETRIES"));

        let err = FinalizeConfig::load_with(None, lookup(&[("FINALIZE_TELEMETRY_ENABLED", "maybe")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { .. }));
    }

    #[test]
    fn out_of_range_threshold_rejected() {
        let err = FinalizeConfig::load_with(
            None,
            lookup(&[("FINALIZE_AUTOASSUME_CONFIDENCE_THRESHOLD", "1.5")]),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn backoff_cap_below_base_rejected() {
        let err = FinalizeConfig::load_with(
            None,
            lookup(&[
                ("FINALIZE_LLM_BACKOFF_BASE_MS", "5000"),
                ("FINALIZE_LLM_BACKOFF_MAX_MS", "100"),
            ]),
        )
        .unwrap_err();
        assert!(err.to_string().contains("max_backoff_ms"));
    }

    #[test]
    fn toml_then_env_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("finalize.toml");
        std::fs::write(
            &path,
            r#"
runs_dir = "from-toml"

[model]
provider = "mock"
model = "toml-model"

[budget]
daily_token_quota = 5000

[contradiction]
semantic_enabled = false
"#,
        )
        .unwrap();

        let config =
            FinalizeConfig::load_with(Some(&path), lookup(&[("FINALIZE_MODEL", "env-model")]))
                .unwrap();
        assert_eq!(config.model.provider, Provider::Mock);
        assert_eq!(config.model.model, "env-model");
        assert_eq!(config.budget.daily_token_quota, 5000);
        assert_eq!(config.budget.max_input_tokens, 8_000);
        assert!(!config.contradiction.semantic_enabled);
        assert_eq!(config.contradiction.max_pairs, 5);
        assert_eq!(config.runs_dir, PathBuf::from("from-toml"));
    }

    #[test]
    fn missing_toml_is_io_error() {
        let err = FinalizeConfig::from_toml_file(Path::new("/nonexistent/finalize.toml"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn telemetry_path_defaults_under_runs_dir() {
        let config = FinalizeConfig::default();
        assert_eq!(config.telemetry_path(), PathBuf::from("runs/telemetry.jsonl"));
    }

    #[test]
    fn provider_parse() {
        assert_eq!("OpenAI".parse::<Provider>().unwrap(), Provider::Openai);
        assert_eq!("offline".parse::<Provider>().unwrap(), Provider::Mock);
        assert!("anthropic".parse::<Provider>().is_err());
    }
}

use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::services::llm::ModelTable;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub analysis: AnalysisConfig,
    pub breaker: BreakerConfig,
    pub cache: CacheConfig,
    pub llm: LlmConfig,
    pub providers: ProviderKeys,
    pub models: ModelTable,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

/// Pipeline-level knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Outer deadline for one pipeline run (default: 300s)
    pub timeout_seconds: u64,
    /// Upstream bound on concurrent pipelines (default: 10)
    pub max_concurrent_analyses: usize,
    /// Run all six stages by default; false runs only 1, 3 and 6
    pub run_all_stages: bool,
    /// Interval for the confidence-learner background job (default: 6h)
    pub learner_interval_seconds: u64,
}

/// Circuit breaker thresholds, shared by every adapter breaker.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Hot tier TTL (default: 1h)
    pub hot_ttl_seconds: u64,
    /// Warm tier TTL (default: 30 days)
    pub warm_ttl_days: i64,
    /// Directory backing the cold object store; disabled when unset
    pub cold_dir: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub api_base: String,
    /// OPENROUTER_API_KEY
    pub api_key: Option<String>,
}

/// Per-provider API keys. A missing key turns the adapter into a
/// structured failure, never a crash.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProviderKeys {
    pub clearbit_api_key: Option<String>,
    pub google_places_api_key: Option<String>,
    pub proxycurl_api_key: Option<String>,
    pub groq_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    pub opencage_api_key: Option<String>,
    pub geoapify_api_key: Option<String>,
    pub perplexity_api_key: Option<String>,
    pub opencorporates_api_token: Option<String>,
}

/// Command line arguments: configuration overrides plus the submission to
/// analyse when running as a CLI.
#[derive(Parser, Debug, Clone)]
#[command(name = "bussola")]
#[command(version, about = "Bussola - Strategic Analysis Pipeline")]
pub struct CommandLineArgs {
    /// Path to configuration file
    #[arg(long, value_name = "PATH")]
    pub config: Option<String>,

    /// Database URL (overrides config file)
    #[arg(long, value_name = "URL")]
    pub database_url: Option<String>,

    /// Logging level (overrides config file, e.g., "info,bussola=debug")
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Analysis timeout in seconds (overrides config file)
    #[arg(long, value_name = "SECONDS")]
    pub analysis_timeout_seconds: Option<u64>,

    /// Maximum concurrent analyses (overrides config file)
    #[arg(long, value_name = "N")]
    pub max_concurrent_analyses: Option<usize>,

    /// Company name to analyse
    #[arg(long, value_name = "NAME")]
    pub company: Option<String>,

    /// Industry sector
    #[arg(long, value_name = "SECTOR")]
    pub industry: Option<String>,

    /// Company website
    #[arg(long, value_name = "URL")]
    pub website: Option<String>,

    /// Business challenge text
    #[arg(long, value_name = "TEXT")]
    pub challenge: Option<String>,

    /// Submission id for logging (default: 0)
    #[arg(long, value_name = "ID")]
    pub submission_id: Option<i64>,

    /// Run only the core stages (1, 3, 6)
    #[arg(long)]
    pub core_only: bool,
}

/// Environment variables recognised at startup. Unknown keys are ignored.
const RECOGNISED_ENV_KEYS: [&str; 16] = [
    "APP_DATABASE_URL",
    "APP_LOG_LEVEL",
    "APP_ANALYSIS_TIMEOUT_SECONDS",
    "APP_MAX_CONCURRENT_ANALYSES",
    "APP_LEARNER_INTERVAL_SECONDS",
    "APP_BREAKER_FAILURE_THRESHOLD",
    "APP_BREAKER_COOLDOWN_SECONDS",
    "OPENROUTER_API_KEY",
    "CLEARBIT_API_KEY",
    "GOOGLE_PLACES_API_KEY",
    "PROXYCURL_API_KEY",
    "GROQ_API_KEY",
    "OPENAI_API_KEY",
    "OPENCAGE_API_KEY",
    "GEOAPIFY_API_KEY",
    "PERPLEXITY_API_KEY",
];

impl Config {
    /// Load configuration with command line, environment variable, and
    /// file support.
    ///
    /// Loading order (priority from highest to lowest):
    /// 1. Command line arguments
    /// 2. Environment variables
    /// 3. Configuration file (config.toml)
    /// 4. Default values
    pub fn load() -> Result<(Self, CommandLineArgs), anyhow::Error> {
        let cli_args = CommandLineArgs::parse();
        let config = Self::load_from(&cli_args)?;
        Ok((config, cli_args))
    }

    pub fn load_from(cli_args: &CommandLineArgs) -> Result<Self, anyhow::Error> {
        let config_path = cli_args.config.clone().or_else(Self::find_config_file);
        let mut config = if let Some(config_path) = config_path {
            Self::from_toml(&config_path)?
        } else {
            tracing::warn!("Configuration file not found, using defaults");
            Config::default()
        };

        config.apply_env_overrides();
        config.apply_cli_overrides(cli_args);
        config.validate()?;

        tracing::debug!("Recognised environment keys: {:?}", RECOGNISED_ENV_KEYS);

        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(db_url) = std::env::var("APP_DATABASE_URL") {
            self.database.url = db_url;
            tracing::info!("Override database.url from env");
        }

        if let Ok(level) = std::env::var("APP_LOG_LEVEL") {
            self.logging.level = level;
            tracing::info!("Override logging.level from env: {}", self.logging.level);
        }

        if let Ok(timeout) = std::env::var("APP_ANALYSIS_TIMEOUT_SECONDS")
            && let Ok(timeout) = timeout.parse()
        {
            self.analysis.timeout_seconds = timeout;
            tracing::info!(
                "Override analysis.timeout_seconds from env: {}",
                self.analysis.timeout_seconds
            );
        }

        if let Ok(max) = std::env::var("APP_MAX_CONCURRENT_ANALYSES")
            && let Ok(max) = max.parse()
        {
            self.analysis.max_concurrent_analyses = max;
            tracing::info!(
                "Override analysis.max_concurrent_analyses from env: {}",
                self.analysis.max_concurrent_analyses
            );
        }

        if let Ok(interval) = std::env::var("APP_LEARNER_INTERVAL_SECONDS")
            && let Ok(interval) = interval.parse()
        {
            self.analysis.learner_interval_seconds = interval;
        }

        if let Ok(threshold) = std::env::var("APP_BREAKER_FAILURE_THRESHOLD")
            && let Ok(threshold) = threshold.parse()
        {
            self.breaker.failure_threshold = threshold;
        }

        if let Ok(cooldown) = std::env::var("APP_BREAKER_COOLDOWN_SECONDS")
            && let Ok(cooldown) = cooldown.parse()
        {
            self.breaker.cooldown_seconds = cooldown;
        }

        if let Ok(key) = std::env::var("OPENROUTER_API_KEY") {
            self.llm.api_key = Some(key);
        }

        let provider_keys = [
            ("CLEARBIT_API_KEY", &mut self.providers.clearbit_api_key),
            ("GOOGLE_PLACES_API_KEY", &mut self.providers.google_places_api_key),
            ("PROXYCURL_API_KEY", &mut self.providers.proxycurl_api_key),
            ("GROQ_API_KEY", &mut self.providers.groq_api_key),
            ("OPENAI_API_KEY", &mut self.providers.openai_api_key),
            ("OPENCAGE_API_KEY", &mut self.providers.opencage_api_key),
            ("GEOAPIFY_API_KEY", &mut self.providers.geoapify_api_key),
            ("PERPLEXITY_API_KEY", &mut self.providers.perplexity_api_key),
            ("OPENCORPORATES_API_TOKEN", &mut self.providers.opencorporates_api_token),
        ];
        for (env_key, slot) in provider_keys {
            if let Ok(value) = std::env::var(env_key)
                && !value.is_empty()
            {
                *slot = Some(value);
            }
        }
    }

    fn apply_cli_overrides(&mut self, args: &CommandLineArgs) {
        if let Some(db_url) = &args.database_url {
            self.database.url = db_url.clone();
            tracing::info!("Override database.url from CLI");
        }

        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
            tracing::info!("Override logging.level from CLI: {}", self.logging.level);
        }

        if let Some(timeout) = args.analysis_timeout_seconds {
            self.analysis.timeout_seconds = timeout;
            tracing::info!("Override analysis.timeout_seconds from CLI: {}", timeout);
        }

        if let Some(max) = args.max_concurrent_analyses {
            self.analysis.max_concurrent_analyses = max;
            tracing::info!("Override analysis.max_concurrent_analyses from CLI: {}", max);
        }
    }

    fn validate(&self) -> Result<(), anyhow::Error> {
        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }
        if self.analysis.timeout_seconds == 0 {
            anyhow::bail!("analysis.timeout_seconds must be > 0");
        }
        if self.analysis.max_concurrent_analyses == 0 {
            anyhow::bail!("analysis.max_concurrent_analyses must be > 0");
        }
        if self.breaker.failure_threshold == 0 {
            anyhow::bail!("breaker.failure_threshold must be > 0");
        }

        if self.llm.api_key.is_none() {
            tracing::warn!("OPENROUTER_API_KEY not set - LLM stages will fail at call time");
        }

        Ok(())
    }

    fn find_config_file() -> Option<String> {
        let possible_paths =
            ["conf/config.toml", "config.toml", "./conf/config.toml", "./config.toml"];

        for path in &possible_paths {
            if Path::new(path).exists() {
                return Some(path.to_string());
            }
        }
        None
    }

    fn from_toml(path: &str) -> Result<Self, anyhow::Error> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { url: "sqlite://data/bussola.db".to_string() }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info,bussola=debug".to_string(),
            file: Some("logs/bussola.log".to_string()),
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 300,
            max_concurrent_analyses: 10,
            run_all_stages: true,
            learner_interval_seconds: 6 * 60 * 60,
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, cooldown_seconds: 30 }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { hot_ttl_seconds: 3600, warm_ttl_days: 30, cold_dir: Some("data/cold".to_string()) }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self { api_base: "https://openrouter.ai/api/v1".to_string(), api_key: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.analysis.timeout_seconds, 300);
        assert_eq!(config.analysis.max_concurrent_analyses, 10);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.breaker.cooldown_seconds, 30);
    }

    #[test]
    fn test_toml_parsing_ignores_unknown_keys() {
        let toml = r#"
            [analysis]
            timeout_seconds = 120
            unknown_knob = "ignored"

            [breaker]
            failure_threshold = 3
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.analysis.timeout_seconds, 120);
        assert_eq!(config.breaker.failure_threshold, 3);
        // Untouched sections keep defaults.
        assert_eq!(config.cache.warm_ttl_days, 30);
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut config = Config::default();
        config.analysis.timeout_seconds = 0;
        assert!(config.validate().is_err());
    }
}

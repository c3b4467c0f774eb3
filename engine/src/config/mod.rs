//! Configuration management
//!
//! This module handles loading, validation, and management of the Waypoint configuration.
//! Configuration is stored in TOML format at ~/.waypoint/config.toml.
//!
//! # Configuration Sections
//!
//! - **core**: Log level, state directory for saved sessions
//! - **reasoner**: Reasoner provider settings and generation defaults
//! - **tool_runner**: Tool Runner endpoint
//! - **validator**: Resolution loop bound and placeholder heuristics
//! - **executor**: Retry policy, fan-out limit, recovery bound
//! - **assessor**: Quality thresholds
//! - **conductor**: Cycle bound for the full plan loop
//!
//! Every section is optional in the file; missing keys take their defaults.
//!
//! # Examples
//!
//! ```no_run
//! use waypoint_engine::config::Config;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load_or_create()?;
//! println!("Default provider: {}", config.reasoner.default_provider);
//! println!("Max parallel steps: {}", config.executor.max_parallel);
//! # Ok(())
//! # }
//! ```

use sdk::errors::EngineError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Core engine settings
    #[serde(default)]
    pub core: CoreConfig,

    /// Reasoner provider configuration
    #[serde(default)]
    pub reasoner: ReasonerConfig,

    /// Tool Runner endpoint
    #[serde(default)]
    pub tool_runner: ToolRunnerConfig,

    /// Parameter validator/resolver settings
    #[serde(default)]
    pub validator: ValidatorConfig,

    /// Dependency scheduler settings
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Quality assessor settings
    #[serde(default)]
    pub assessor: AssessorConfig,

    /// Plan cycle settings
    #[serde(default)]
    pub conductor: ConductorConfig,
}

/// Core engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory for saved sessions (supports ~ expansion)
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

/// Reasoner provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasonerConfig {
    /// Provider tried first (ollama, openai). Empty means no reasoner.
    #[serde(default = "default_provider")]
    pub default_provider: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,

    /// Per-attempt timeout for local providers
    #[serde(default = "default_local_timeout")]
    pub local_timeout_secs: u64,

    /// Per-attempt timeout for cloud providers
    #[serde(default = "default_cloud_timeout")]
    pub cloud_timeout_secs: u64,

    /// Ollama provider settings
    #[serde(default)]
    pub ollama: OllamaConfig,

    /// OpenAI-compatible provider settings
    #[serde(default)]
    pub openai: OpenAIConfig,
}

/// Ollama provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaConfig {
    /// Base URL for Ollama API
    #[serde(default = "default_ollama_base_url")]
    pub base_url: String,

    /// Model name
    #[serde(default = "default_ollama_model")]
    pub model: String,
}

/// OpenAI-compatible provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAIConfig {
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,

    #[serde(default = "default_openai_model")]
    pub model: String,

    /// Environment variable holding the API key
    #[serde(default = "default_openai_key_env")]
    pub api_key_env: String,
}

/// Tool Runner endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRunnerConfig {
    #[serde(default = "default_tool_runner_url")]
    pub base_url: String,

    #[serde(default = "default_tool_runner_timeout")]
    pub timeout_secs: u64,
}

/// Parameter validator/resolver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorConfig {
    /// Upper bound on validate/resolve passes
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    /// Dates older than `current year - window` count as placeholders
    #[serde(default = "default_stale_year_window")]
    pub stale_year_window: i32,

    /// Regexes (case-insensitive) matching generic filler values
    #[serde(default = "default_placeholder_patterns")]
    pub placeholder_patterns: Vec<String>,
}

/// Dependency scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Attempts per tool invocation
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Fixed delay between attempts
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Maximum steps of one wave running at once
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// Whether a skipped dependency unblocks its dependants
    #[serde(default)]
    pub skipped_satisfies_dependencies: bool,

    /// Reasoner-directed recovery rounds per step
    #[serde(default = "default_max_recovery_attempts")]
    pub max_recovery_attempts: u32,
}

/// Quality assessor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssessorConfig {
    /// Overall score below this forces a replan
    #[serde(default = "default_low_threshold")]
    pub low_score_threshold: f64,

    /// Any sub-score below this forces a replan
    #[serde(default = "default_replan_threshold")]
    pub replan_threshold: f64,

    /// Run the targeted re-validation pass when requested
    #[serde(default = "default_true")]
    pub second_pass: bool,
}

/// Plan cycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConductorConfig {
    /// Maximum critique/execute/assess/replan cycles per goal
    #[serde(default = "default_max_cycles")]
    pub max_cycles: u32,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("~/.waypoint/sessions")
}

fn default_provider() -> String {
    "ollama".to_string()
}

fn default_temperature() -> f32 {
    0.2
}

fn default_max_output_tokens() -> u32 {
    2048
}

fn default_local_timeout() -> u64 {
    120
}

fn default_cloud_timeout() -> u64 {
    30
}

fn default_ollama_base_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_ollama_model() -> String {
    "llama3.1:8b".to_string()
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_openai_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_openai_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_tool_runner_url() -> String {
    "http://localhost:8787".to_string()
}

fn default_tool_runner_timeout() -> u64 {
    60
}

fn default_max_iterations() -> usize {
    5
}

fn default_stale_year_window() -> i32 {
    2
}

fn default_placeholder_patterns() -> Vec<String> {
    [
        r"^(todo|tbd|n/?a|none|null|unknown|placeholder|example|sample|test|dummy|xxx+|\?+)$",
        r"^<[^>]+>$",
        r"^\[[^\]]+\]$",
        r"^(your|insert|enter)[_ -]",
        r"^(string|value|id|name)$",
        r"example\.(com|org)",
        r"^(123|1234|12345|abc|foo|bar|baz|lorem ipsum.*)$",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_max_parallel() -> usize {
    4
}

fn default_max_recovery_attempts() -> u32 {
    2
}

fn default_low_threshold() -> f64 {
    0.4
}

fn default_replan_threshold() -> f64 {
    0.6
}

fn default_max_cycles() -> u32 {
    3
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            state_dir: default_state_dir(),
        }
    }
}

impl Default for ReasonerConfig {
    fn default() -> Self {
        Self {
            default_provider: default_provider(),
            temperature: default_temperature(),
            max_output_tokens: default_max_output_tokens(),
            local_timeout_secs: default_local_timeout(),
            cloud_timeout_secs: default_cloud_timeout(),
            ollama: OllamaConfig::default(),
            openai: OpenAIConfig::default(),
        }
    }
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: default_ollama_base_url(),
            model: default_ollama_model(),
        }
    }
}

impl Default for OpenAIConfig {
    fn default() -> Self {
        Self {
            base_url: default_openai_base_url(),
            model: default_openai_model(),
            api_key_env: default_openai_key_env(),
        }
    }
}

impl Default for ToolRunnerConfig {
    fn default() -> Self {
        Self {
            base_url: default_tool_runner_url(),
            timeout_secs: default_tool_runner_timeout(),
        }
    }
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            stale_year_window: default_stale_year_window(),
            placeholder_patterns: default_placeholder_patterns(),
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            max_parallel: default_max_parallel(),
            skipped_satisfies_dependencies: false,
            max_recovery_attempts: default_max_recovery_attempts(),
        }
    }
}

impl Default for AssessorConfig {
    fn default() -> Self {
        Self {
            low_score_threshold: default_low_threshold(),
            replan_threshold: default_replan_threshold(),
            second_pass: true,
        }
    }
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            max_cycles: default_max_cycles(),
        }
    }
}

impl ReasonerConfig {
    /// Providers this build knows how to construct
    pub const PROVIDERS: &'static [&'static str] = &["ollama", "openai"];

    /// Model name configured for the default provider
    pub fn default_model(&self) -> &str {
        match self.default_provider.as_str() {
            "openai" => &self.openai.model,
            _ => &self.ollama.model,
        }
    }
}

impl Config {
    /// Load configuration from the default location (~/.waypoint/config.toml)
    ///
    /// If the configuration file doesn't exist, creates a default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Configuration file cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    pub fn load_or_create() -> Result<Self, EngineError> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load_from_path(&config_path)
        } else {
            Self::create_default(&config_path)
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self, EngineError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_toml_str(&contents)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self, EngineError> {
        let mut config: Config = toml::from_str(contents)
            .map_err(|e| EngineError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate_and_process()?;

        Ok(config)
    }

    /// Create default configuration and save to path
    fn create_default(path: &Path) -> Result<Self, EngineError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                EngineError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let mut config = Self::default();

        let toml_string = toml::to_string_pretty(&config)
            .map_err(|e| EngineError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, toml_string)
            .map_err(|e| EngineError::Config(format!("Failed to write config file: {}", e)))?;

        config.validate_and_process()?;

        Ok(config)
    }

    /// Get the default configuration file path (~/.waypoint/config.toml)
    fn default_config_path() -> Result<PathBuf, EngineError> {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(".waypoint").join("config.toml"))
    }

    /// Validate and process configuration
    ///
    /// Range-checks every numeric setting, compiles the placeholder patterns
    /// and expands `~` in the state directory. A blank provider or model is
    /// reported as `ReasonerNotConfigured`, which callers treat as fatal.
    pub fn validate_and_process(&mut self) -> Result<(), EngineError> {
        let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_log_levels.contains(&self.core.log_level.as_str()) {
            return Err(EngineError::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.core.log_level,
                valid_log_levels.join(", ")
            )));
        }

        let provider = self.reasoner.default_provider.trim();
        if provider.is_empty() || self.reasoner.default_model().trim().is_empty() {
            return Err(EngineError::ReasonerNotConfigured);
        }
        if !ReasonerConfig::PROVIDERS.contains(&provider) {
            return Err(EngineError::Config(format!(
                "Invalid default provider '{}'. Must be one of: {}",
                provider,
                ReasonerConfig::PROVIDERS.join(", ")
            )));
        }

        if !(0.0..=2.0).contains(&self.reasoner.temperature) {
            return Err(EngineError::Config(
                "reasoner.temperature must be between 0.0 and 2.0".to_string(),
            ));
        }

        if self.validator.max_iterations == 0 || self.validator.max_iterations > 5 {
            return Err(EngineError::Config(
                "validator.max_iterations must be between 1 and 5".to_string(),
            ));
        }
        for pattern in &self.validator.placeholder_patterns {
            regex::Regex::new(pattern).map_err(|e| {
                EngineError::Config(format!("Invalid placeholder pattern '{}': {}", pattern, e))
            })?;
        }

        if self.executor.max_retries == 0 {
            return Err(EngineError::Config(
                "executor.max_retries must be at least 1".to_string(),
            ));
        }
        if self.executor.max_parallel == 0 {
            return Err(EngineError::Config(
                "executor.max_parallel must be at least 1".to_string(),
            ));
        }

        for (name, value) in [
            ("assessor.low_score_threshold", self.assessor.low_score_threshold),
            ("assessor.replan_threshold", self.assessor.replan_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(EngineError::Config(format!(
                    "{} must be between 0.0 and 1.0",
                    name
                )));
            }
        }

        if self.conductor.max_cycles == 0 {
            return Err(EngineError::Config(
                "conductor.max_cycles must be at least 1".to_string(),
            ));
        }

        self.core.state_dir = expand_path(&self.core.state_dir)?;

        Ok(())
    }
}

/// Expand ~ in path to user's home directory
fn expand_path(path: &Path) -> Result<PathBuf, EngineError> {
    let path_str = path
        .to_str()
        .ok_or_else(|| EngineError::Config("Invalid UTF-8 in path".to_string()))?;

    if let Some(rest) = path_str.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(rest))
    } else if path_str == "~" {
        dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))
    } else {
        Ok(path.to_path_buf())
    }
}

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::auth::Token;
use crate::error::TriageError;
use crate::retry::RetryPolicy;

/// Configuration file structure for citriage.
///
/// Every section has defaults, so an empty file (or no file at all) yields a
/// usable configuration once a GitHub token is supplied.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// Source-control host used for job lookup, log download and publishing
    #[serde(default)]
    pub github: GitHubConfig,

    /// Generative model endpoint
    #[serde(default)]
    pub model: ModelConfig,

    /// Budgets and deadlines of one invocation
    #[serde(default)]
    pub triage: TriageConfig,

    /// Where the diagnosis goes
    #[serde(default)]
    pub publish: PublishConfig,

    /// Repository files sent along with the log
    #[serde(default)]
    pub context: ContextConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GitHubConfig {
    /// GitHub personal access token
    pub token: Option<String>,

    /// GitHub API base URL
    #[serde(default = "default_github_base_url")]
    pub base_url: String,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ModelConfig {
    /// Base URL of an OpenAI-compatible chat completions API
    #[serde(default = "default_model_endpoint")]
    pub endpoint: String,

    /// Stable model identifier
    #[serde(default = "default_model_id")]
    pub id: String,

    /// API key for the model endpoint
    pub api_key: Option<String>,

    #[serde(default = "default_max_response_tokens")]
    pub max_response_tokens: u32,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_top_p")]
    pub top_p: f32,

    /// Hard timeout of a single model call in seconds
    #[serde(default = "default_model_timeout_secs")]
    pub timeout_secs: u64,

    /// Ask the endpoint for a JSON object response
    #[serde(default = "default_true")]
    pub json_mode: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TriageConfig {
    /// Maximum log characters handed to the model
    #[serde(default = "default_budget_chars")]
    pub budget_chars: usize,

    /// Characters kept from the start of the log when truncating
    #[serde(default = "default_head_chars")]
    pub head_chars: usize,

    /// Maximum bytes kept from a log download (the tail wins)
    #[serde(default = "default_max_log_bytes")]
    pub max_log_bytes: usize,

    /// Deadline for the whole invocation in seconds
    #[serde(default = "default_global_timeout_secs")]
    pub global_timeout_secs: u64,

    /// Retries after the first attempt of each remote call
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PublishConfig {
    /// Write the diagnosis back to GitHub
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Render the comment but do not send it
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ContextConfig {
    /// Read matching files from the repository root at the run's branch
    #[serde(default)]
    pub enabled: bool,

    /// File name suffixes to include
    #[serde(default = "default_context_extensions")]
    pub extensions: Vec<String>,

    /// Characters of file content the request may carry
    #[serde(default = "default_context_max_chars")]
    pub max_chars: usize,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            token: None,
            base_url: default_github_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            endpoint: default_model_endpoint(),
            id: default_model_id(),
            api_key: None,
            max_response_tokens: default_max_response_tokens(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            timeout_secs: default_model_timeout_secs(),
            json_mode: true,
        }
    }
}

impl Default for TriageConfig {
    fn default() -> Self {
        Self {
            budget_chars: default_budget_chars(),
            head_chars: default_head_chars(),
            max_log_bytes: default_max_log_bytes(),
            global_timeout_secs: default_global_timeout_secs(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dry_run: false,
        }
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            extensions: default_context_extensions(),
            max_chars: default_context_max_chars(),
        }
    }
}

fn default_github_base_url() -> String {
    "https://api.github.com".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_model_endpoint() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model_id() -> String {
    "gpt-4o-mini".to_string()
}

fn default_max_response_tokens() -> u32 {
    3072
}

fn default_temperature() -> f32 {
    0.7
}

fn default_top_p() -> f32 {
    0.9
}

fn default_model_timeout_secs() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

fn default_budget_chars() -> usize {
    50_000
}

fn default_head_chars() -> usize {
    2_000
}

fn default_max_log_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_global_timeout_secs() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    2
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    8_000
}

fn default_context_extensions() -> Vec<String> {
    vec![".tf".to_string(), ".tfvars".to_string()]
}

fn default_context_max_chars() -> usize {
    20_000
}

const MAX_RETRIES_LIMIT: u32 = 10;

impl Config {
    /// Load configuration from a file.
    ///
    /// Searches for configuration files in this order:
    /// 1. Specified path
    /// 2. ./citriage.toml
    /// 3. ./citriage.json
    /// 4. ./citriage.yaml
    /// 5. ./citriage.yml
    /// 6. `<config dir>/citriage/config.toml`
    ///
    /// Returns default configuration if no file is found.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load_from_path(path);
        }

        let mut candidates: Vec<PathBuf> = [
            "citriage.toml",
            "citriage.json",
            "citriage.yaml",
            "citriage.yml",
        ]
        .iter()
        .map(PathBuf::from)
        .collect();
        if let Some(dir) = dirs::config_dir() {
            candidates.push(dir.join("citriage").join("config.toml"));
        }

        for candidate in &candidates {
            if candidate.exists() {
                log::debug!("Using config file: {}", candidate.display());
                return Self::load_from_path(candidate);
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file path.
    fn load_from_path(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let extension = path.extension().and_then(|ext| ext.to_str()).unwrap_or("");

        match extension {
            "toml" => toml::from_str(&contents)
                .with_context(|| format!("Failed to parse TOML config: {}", path.display())),
            "json" => serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse JSON config: {}", path.display())),
            "yaml" | "yml" => serde_yaml::from_str(&contents)
                .with_context(|| format!("Failed to parse YAML config: {}", path.display())),
            _ => toml::from_str(&contents)
                .or_else(|_| serde_json::from_str(&contents))
                .or_else(|_| serde_yaml::from_str(&contents))
                .with_context(|| format!("Failed to parse config file: {}", path.display())),
        }
    }

    /// Save configuration to a file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::to_string_pretty(self)?,
            Some("yaml") | Some("yml") => serde_yaml::to_string(self)?,
            _ => toml::to_string_pretty(self)?,
        };

        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Copy with credentials masked, for printing.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.github.token.is_some() {
            copy.github.token = Some("***".to_string());
        }
        if copy.model.api_key.is_some() {
            copy.model.api_key = Some("***".to_string());
        }
        copy
    }

    /// Checks the cross-field rules every stage relies on.
    pub fn validate(&self) -> crate::error::Result<()> {
        let invalid = |msg: String| Err(TriageError::Config(msg));

        if self.github_token().is_none() {
            return invalid("a GitHub token is required (--token or GITHUB_PAT)".to_string());
        }
        if self.model.id.trim().is_empty() {
            return invalid("model id must not be empty".to_string());
        }
        if self.triage.budget_chars == 0 {
            return invalid("budget-chars must be greater than zero".to_string());
        }
        if self.triage.head_chars >= self.triage.budget_chars {
            return invalid(format!(
                "head-chars ({}) must be smaller than budget-chars ({})",
                self.triage.head_chars, self.triage.budget_chars
            ));
        }
        if self.triage.max_log_bytes == 0 {
            return invalid("max-log-bytes must be greater than zero".to_string());
        }
        if self.context.enabled && self.context.extensions.iter().all(|e| e.trim().is_empty()) {
            return invalid("context.extensions must name at least one suffix".to_string());
        }
        if self.triage.max_retries > MAX_RETRIES_LIMIT {
            return invalid(format!(
                "max-retries must be at most {MAX_RETRIES_LIMIT}, got {}",
                self.triage.max_retries
            ));
        }

        let global = self.global_timeout();
        if self.request_timeout() >= global {
            return invalid(format!(
                "GitHub request timeout ({}s) must be below the global timeout ({}s)",
                self.github.request_timeout_secs, self.triage.global_timeout_secs
            ));
        }
        // A model call that runs to its limit must still leave time to publish
        if self.model_timeout() + self.request_timeout() > global {
            return invalid(format!(
                "model timeout ({}s) plus one GitHub request ({}s) must fit in the global timeout ({}s)",
                self.model.timeout_secs,
                self.github.request_timeout_secs,
                self.triage.global_timeout_secs
            ));
        }

        Ok(())
    }

    pub fn github_token(&self) -> Option<Token> {
        self.github
            .token
            .as_deref()
            .map(Token::from)
            .filter(|t| !t.is_empty())
    }

    pub fn model_api_key(&self) -> Option<Token> {
        self.model
            .api_key
            .as_deref()
            .map(Token::from)
            .filter(|t| !t.is_empty())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.triage.max_retries,
            base_delay: Duration::from_millis(self.triage.backoff_base_ms),
            factor: 2,
            max_delay: Duration::from_millis(self.triage.backoff_max_ms),
        }
    }

    pub fn global_timeout(&self) -> Duration {
        Duration::from_secs(self.triage.global_timeout_secs)
    }

    pub fn model_timeout(&self) -> Duration {
        Duration::from_secs(self.model.timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.github.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.github.token = Some("ghp_test".to_string());
        config
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.github.base_url, "https://api.github.com");
        assert_eq!(config.triage.budget_chars, 50_000);
        assert_eq!(config.triage.max_retries, 2);
        assert_eq!(config.model.max_response_tokens, 3072);
        assert!(config.publish.enabled);
        assert!(!config.publish.dry_run);
        assert!(!config.context.enabled);
        assert_eq!(config.context.extensions, vec![".tf", ".tfvars"]);
    }

    #[test]
    fn test_default_retry_policy_matches_backoff_schedule() {
        let policy = Config::default().retry_policy();
        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(8));
    }

    #[test]
    fn test_load_toml_config() {
        let mut temp_file = NamedTempFile::with_suffix(".toml").unwrap();
        let toml_content = r#"
[github]
token = "ghp-test-token"
base-url = "https://github.example.com/api/v3"

[model]
id = "llama3:70b"
endpoint = "http://localhost:11434/v1"
json-mode = false

[triage]
budget-chars = 20000
max-retries = 4
"#;
        write!(temp_file, "{}", toml_content).unwrap();

        let config = Config::load_from_path(temp_file.path()).unwrap();
        assert_eq!(config.github.token, Some("ghp-test-token".to_string()));
        assert_eq!(config.github.base_url, "https://github.example.com/api/v3");
        assert_eq!(config.model.id, "llama3:70b");
        assert!(!config.model.json_mode);
        assert_eq!(config.triage.budget_chars, 20_000);
        assert_eq!(config.triage.max_retries, 4);
        assert_eq!(config.triage.head_chars, 2_000);
    }

    #[test]
    fn test_load_json_config() {
        let mut temp_file = NamedTempFile::with_suffix(".json").unwrap();
        let json_content = r#"{
  "publish": {
    "dry-run": true
  },
  "triage": {
    "global-timeout-secs": 120
  }
}"#;
        write!(temp_file, "{}", json_content).unwrap();

        let config = Config::load_from_path(temp_file.path()).unwrap();
        assert!(config.publish.dry_run);
        assert!(config.publish.enabled);
        assert_eq!(config.global_timeout(), Duration::from_secs(120));
    }

    #[test]
    fn test_load_yaml_config() {
        let mut temp_file = NamedTempFile::with_suffix(".yaml").unwrap();
        write!(temp_file, "model:\n  id: mistral-large\n  timeout-secs: 30\n").unwrap();

        let config = Config::load_from_path(temp_file.path()).unwrap();
        assert_eq!(config.model.id, "mistral-large");
        assert_eq!(config.model_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_load_context_section() {
        let mut temp_file = NamedTempFile::with_suffix(".toml").unwrap();
        write!(
            temp_file,
            "[context]\nenabled = true\nextensions = [\".hcl\"]\nmax-chars = 5000\n"
        )
        .unwrap();

        let config = Config::load_from_path(temp_file.path()).unwrap();
        assert!(config.context.enabled);
        assert_eq!(config.context.extensions, vec![".hcl"]);
        assert_eq!(config.context.max_chars, 5_000);
    }

    #[test]
    fn test_validate_rejects_context_without_extensions() {
        let mut config = valid_config();
        config.context.enabled = true;
        config.context.extensions = vec![String::new()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_explicit_path_fails() {
        let result = Config::load(Some(Path::new("does-not-exist.toml")));
        assert!(result.is_err());
    }

    #[test]
    fn test_save_and_reload_round_trip() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("citriage.toml");
        let mut config = valid_config();
        config.triage.budget_chars = 12_345;

        config.save(&path).unwrap();
        let loaded = Config::load(Some(&path)).unwrap();

        assert_eq!(loaded.triage.budget_chars, 12_345);
        assert_eq!(loaded.github.token, Some("ghp_test".to_string()));
    }

    #[test]
    fn test_redacted_hides_credentials() {
        let mut config = valid_config();
        config.model.api_key = Some("sk-secret".to_string());

        let redacted = config.redacted();
        assert_eq!(redacted.github.token.as_deref(), Some("***"));
        assert_eq!(redacted.model.api_key.as_deref(), Some("***"));
    }

    #[test]
    fn test_validate_accepts_defaults_with_token() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_validate_requires_token() {
        let err = Config::default().validate().unwrap_err();
        assert!(err.to_string().contains("GitHub token"));

        let mut blank = Config::default();
        blank.github.token = Some("   ".to_string());
        assert!(blank.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_head_slice_not_below_budget() {
        let mut config = valid_config();
        config.triage.budget_chars = 1_000;
        config.triage.head_chars = 1_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_call_timeouts_beyond_deadline() {
        let mut config = valid_config();
        config.triage.global_timeout_secs = 60;
        config.model.timeout_secs = 60;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("model timeout"));

        config.model.timeout_secs = 30;
        config.github.request_timeout_secs = 90;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("GitHub request timeout"));
    }

    #[test]
    fn test_validate_requires_headroom_after_model_call() {
        let mut config = valid_config();
        config.triage.global_timeout_secs = 300;
        config.github.request_timeout_secs = 30;
        config.model.timeout_secs = 299;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("must fit in the global timeout"));

        config.model.timeout_secs = 270;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_caps_retries() {
        let mut config = valid_config();
        config.triage.max_retries = 11;
        assert!(config.validate().is_err());
    }
}

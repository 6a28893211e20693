// Configuration File Support
//
// This module provides configuration file parsing for the buildguard CLI.
// Supports TOML format with environment variable overrides.
// Configuration files are loaded from XDG config directory: ~/.config/buildguard/config.toml

use crate::exec::{
    validate_env_var_name, validate_working_dir, CommandValidator, EnvWhitelist, ExecutorConfig,
    RetryPolicy,
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// Secure executor settings
    pub executor: ExecutorSettings,

    /// Backoff settings for retried commands
    pub retry: RetrySettings,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

/// Secure executor settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecutorSettings {
    /// Timeout for a single command in seconds
    pub timeout_secs: u64,

    /// Report commands instead of running them
    pub dry_run: bool,

    /// Command allowlist (empty allows any validated name)
    pub allowed_commands: Vec<String>,

    /// Working directory for child processes
    pub working_dir: Option<PathBuf>,

    /// Maximum captured output size in bytes
    pub max_output_size: usize,

    /// Command name -> sensitive variables it may still receive
    pub env_whitelist: BTreeMap<String, Vec<String>>,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        let mut env_whitelist = BTreeMap::new();
        env_whitelist.insert(
            "goreleaser".to_string(),
            vec![
                "GITHUB_TOKEN".to_string(),
                "GITLAB_TOKEN".to_string(),
                "GITEA_TOKEN".to_string(),
            ],
        );

        Self {
            timeout_secs: 300,
            dry_run: false,
            allowed_commands: Vec::new(),
            working_dir: None,
            max_output_size: 1024 * 1024,
            env_whitelist,
        }
    }
}

/// Retry settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrySettings {
    /// Total attempts including the first
    pub max_attempts: usize,

    /// Delay before the first retry in milliseconds
    pub initial_delay_ms: u64,

    /// Upper bound for a single delay in milliseconds
    pub max_delay_ms: u64,

    /// Extra random delay as a fraction of the computed delay
    pub jitter: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            jitter: 0.0,
        }
    }
}

impl Config {
    /// Load configuration from the default XDG config directory
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    /// If the config file does not exist, returns default configuration.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed or
    /// fails validation.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            let config = Self::default().apply_env_overrides();
            config.validate()?;
            return Ok(config);
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file from {:?}", path))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file from {:?}", path))?;

        // Apply environment variable overrides
        let config = config.apply_env_overrides();

        config.validate()?;

        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Get the default configuration file path
    ///
    /// Returns `~/.config/buildguard/config.toml` on Linux
    pub fn config_path() -> PathBuf {
        if let Some(proj_dirs) = directories::ProjectDirs::from("dev", "buildguard", "buildguard") {
            proj_dirs.config_dir().join("config.toml")
        } else {
            // Fallback if XDG dirs cannot be determined
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(".config").join("buildguard").join("config.toml")
        }
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Environment variables take precedence over config file values:
    /// - BUILDGUARD_LOG_LEVEL
    /// - BUILDGUARD_LOG_FORMAT
    /// - BUILDGUARD_TIMEOUT_SECS
    /// - BUILDGUARD_DRY_RUN
    /// - BUILDGUARD_MAX_ATTEMPTS
    /// - BUILDGUARD_RETRY_DELAY_MS
    fn apply_env_overrides(self) -> Self {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    fn apply_overrides_from<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        // Logging overrides
        if let Some(level) = lookup("BUILDGUARD_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("BUILDGUARD_LOG_FORMAT") {
            self.logging.format = format;
        }

        // Executor overrides
        if let Some(timeout) = lookup("BUILDGUARD_TIMEOUT_SECS") {
            if let Ok(timeout) = timeout.parse::<u64>() {
                if timeout > 0 {
                    self.executor.timeout_secs = timeout;
                }
            }
        }
        if let Some(dry_run) = lookup("BUILDGUARD_DRY_RUN") {
            self.executor.dry_run = match dry_run.to_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                _ => self.executor.dry_run,
            };
        }

        // Retry overrides
        if let Some(attempts) = lookup("BUILDGUARD_MAX_ATTEMPTS") {
            if let Ok(attempts) = attempts.parse::<usize>() {
                if attempts > 0 {
                    self.retry.max_attempts = attempts;
                }
            }
        }
        if let Some(delay) = lookup("BUILDGUARD_RETRY_DELAY_MS") {
            if let Ok(delay) = delay.parse::<u64>() {
                self.retry.initial_delay_ms = delay;
            }
        }

        self
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        // Validate logging level
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                self.logging.level
            ),
        }

        // Validate logging format
        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" | "compact" => {}
            _ => anyhow::bail!(
                "Invalid log format: {}. Must be one of: json, pretty, compact",
                self.logging.format
            ),
        }

        // Validate executor configuration
        if self.executor.timeout_secs == 0 {
            anyhow::bail!("Executor timeout must be > 0");
        }
        if self.executor.max_output_size == 0 {
            anyhow::bail!("Executor max output size must be > 0");
        }
        let names = CommandValidator::new();
        for command in &self.executor.allowed_commands {
            names
                .validate_name(command)
                .with_context(|| format!("Invalid allowed command '{}'", command))?;
        }
        if let Some(ref dir) = self.executor.working_dir {
            validate_working_dir(dir)
                .with_context(|| format!("Invalid working directory {:?}", dir))?;
        }
        for (command, vars) in &self.executor.env_whitelist {
            for var in vars {
                validate_env_var_name(var).with_context(|| {
                    format!("Invalid whitelisted variable '{}' for '{}'", var, command)
                })?;
            }
        }

        // Validate retry configuration
        if self.retry.max_attempts == 0 {
            anyhow::bail!("Retry max attempts must be > 0");
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            anyhow::bail!("Retry jitter must be between 0.0 and 1.0");
        }
        if self.retry.max_delay_ms < self.retry.initial_delay_ms {
            anyhow::bail!("Retry max delay must be >= initial delay");
        }

        Ok(())
    }

    /// Convert log level string to tracing::Level
    pub fn log_level(&self) -> Result<tracing::Level> {
        self.logging
            .level
            .to_lowercase()
            .parse()
            .map_err(|e| anyhow::anyhow!("Failed to parse log level: {}", e))
    }

    /// Backoff policy for retried commands
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new()
            .max_attempts(self.retry.max_attempts)
            .base_delay(Duration::from_millis(self.retry.initial_delay_ms))
            .max_delay(Duration::from_millis(self.retry.max_delay_ms))
            .jitter(self.retry.jitter)
    }

    /// Executor configuration built from these settings
    pub fn executor_config(&self) -> ExecutorConfig {
        let whitelist: EnvWhitelist = self
            .executor
            .env_whitelist
            .iter()
            .map(|(command, vars)| (command.clone(), vars.clone()))
            .collect();

        let config = ExecutorConfig::new()
            .allowed_commands(self.executor.allowed_commands.iter().cloned())
            .env_whitelist(whitelist)
            .timeout(Duration::from_secs(self.executor.timeout_secs))
            .dry_run(self.executor.dry_run)
            .max_output_size(self.executor.max_output_size)
            .backoff(self.retry_policy());

        match self.executor.working_dir {
            Some(ref dir) => config.working_dir(dir.clone()),
            None => config,
        }
    }
}

use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::command::QuotingMode;
use crate::distro::DistributionDetector;

pub const TARGET_OVERRIDE_ENV: &str = "WSL_DISTRIBUTION";

/// Contents of the JSON (or TOML) configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileConfig {
    #[serde(default, alias = "wslDistribution")]
    pub target_environment: Option<String>,
    #[serde(default = "default_timeout_ms", alias = "defaultTimeout")]
    pub default_timeout_ms: u64,
    #[serde(default = "default_script_timeout_ms", alias = "scriptTimeout")]
    pub script_timeout_ms: u64,
    #[serde(default = "default_max_output_bytes", alias = "maxBufferSize")]
    pub max_output_bytes: usize,
    #[serde(default)]
    pub debug_mode: bool,
    #[serde(default = "default_max_concurrent_processes")]
    pub max_concurrent_processes: usize,
    #[serde(default)]
    pub quoting_mode: QuotingMode,
    #[serde(default = "default_fallback_environment")]
    pub fallback_environment: Option<String>,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            target_environment: None,
            default_timeout_ms: default_timeout_ms(),
            script_timeout_ms: default_script_timeout_ms(),
            max_output_bytes: default_max_output_bytes(),
            debug_mode: false,
            max_concurrent_processes: default_max_concurrent_processes(),
            quoting_mode: QuotingMode::default(),
            fallback_environment: default_fallback_environment(),
        }
    }
}

impl FileConfig {
    /// Reads the file. A missing file is `Ok(None)`; unreadable or invalid
    /// content is an error for the caller to recover from.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading config file {}", path.display()))?;
        let is_toml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
        let cfg = if is_toml {
            toml::from_str::<FileConfig>(&text)
                .with_context(|| format!("failed parsing TOML config {}", path.display()))?
        } else {
            serde_json::from_str::<FileConfig>(&text)
                .with_context(|| format!("failed parsing JSON config {}", path.display()))?
        };
        cfg.validate()?;
        Ok(Some(cfg))
    }

    /// Zero or malformed values are ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("LINUX_BASH_DEFAULT_TIMEOUT_MS") {
            if let Some(n) = v.trim().parse::<u64>().ok().filter(|n| *n > 0) {
                self.default_timeout_ms = n;
            }
        }
        if let Ok(v) = env::var("LINUX_BASH_SCRIPT_TIMEOUT_MS") {
            if let Some(n) = v.trim().parse::<u64>().ok().filter(|n| *n > 0) {
                self.script_timeout_ms = n;
            }
        }
        if let Ok(v) = env::var("LINUX_BASH_MAX_OUTPUT_BYTES") {
            if let Some(n) = v.trim().parse::<usize>().ok().filter(|n| *n > 0) {
                self.max_output_bytes = n;
            }
        }
        if let Ok(v) = env::var("LINUX_BASH_MAX_CONCURRENT") {
            if let Ok(n) = v.trim().parse::<usize>() {
                self.max_concurrent_processes = n.max(1);
            }
        }
        if let Ok(v) = env::var("LINUX_BASH_QUOTING_MODE") {
            if let Some(mode) = QuotingMode::parse(&v) {
                self.quoting_mode = mode;
            }
        }
        if let Ok(v) = env::var("LINUX_BASH_DEBUG") {
            self.debug_mode = parse_bool(&v);
        }
    }

    fn validate(&self) -> Result<()> {
        if self.default_timeout_ms == 0 {
            anyhow::bail!("defaultTimeoutMs must be > 0");
        }
        if self.script_timeout_ms == 0 {
            anyhow::bail!("scriptTimeoutMs must be > 0");
        }
        if self.max_output_bytes == 0 {
            anyhow::bail!("maxOutputBytes must be > 0");
        }
        if self.max_concurrent_processes == 0 {
            anyhow::bail!("maxConcurrentProcesses must be > 0");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetSource {
    Override,
    File,
    Detected,
    Fallback,
}

impl TargetSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Override => "override",
            Self::File => "file",
            Self::Detected => "detected",
            Self::Fallback => "fallback",
        }
    }
}

/// Effective configuration, resolved once at startup and never mutated.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeConfig {
    pub target_environment: String,
    pub target_source: TargetSource,
    pub configured_target: Option<String>,
    pub default_timeout_ms: u64,
    pub script_timeout_ms: u64,
    pub max_output_bytes: usize,
    pub debug_mode: bool,
    pub max_concurrent_processes: usize,
    pub quoting_mode: QuotingMode,
    pub bridge_program: String,
}

impl RuntimeConfig {
    pub fn from_file_config(
        file: &FileConfig,
        target_environment: String,
        target_source: TargetSource,
        bridge_program: String,
    ) -> Self {
        Self {
            target_environment,
            target_source,
            configured_target: file.target_environment.clone(),
            default_timeout_ms: file.default_timeout_ms,
            script_timeout_ms: file.script_timeout_ms,
            max_output_bytes: file.max_output_bytes,
            debug_mode: file.debug_mode,
            max_concurrent_processes: file.max_concurrent_processes,
            quoting_mode: file.quoting_mode,
            bridge_program,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(
        "no Linux environment configured: set WSL_DISTRIBUTION, targetEnvironment in the config file, or install a WSL distribution"
    )]
    NoTargetEnvironment,
}

pub struct ConfigResolver {
    path: PathBuf,
    target_override: Option<String>,
    bridge_program: String,
}

impl ConfigResolver {
    pub fn new(path: impl Into<PathBuf>, bridge_program: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            target_override: None,
            bridge_program: bridge_program.into(),
        }
    }

    /// Picks up the target override from the process environment.
    pub fn with_process_env(self) -> Self {
        let target_override = env::var(TARGET_OVERRIDE_ENV).ok();
        self.with_target_override(target_override)
    }

    pub fn with_target_override(mut self, value: Option<String>) -> Self {
        self.target_override = value;
        self
    }

    pub async fn resolve(
        &self,
        detector: &DistributionDetector,
    ) -> Result<RuntimeConfig, ConfigError> {
        let mut file = match FileConfig::load(&self.path) {
            Ok(Some(cfg)) => {
                info!("config loaded from {}", self.path.display());
                cfg
            }
            Ok(None) => {
                info!(
                    "config file {} not found, using defaults",
                    self.path.display()
                );
                FileConfig::default()
            }
            Err(err) => {
                warn!("config unreadable, using defaults: {err:#}");
                FileConfig {
                    debug_mode: true,
                    ..FileConfig::default()
                }
            }
        };
        file.apply_env_overrides();

        let (target, source) = self.resolve_target(&file, detector).await?;
        info!(
            "using Linux environment {target} (source={})",
            source.as_str()
        );
        Ok(RuntimeConfig::from_file_config(
            &file,
            target,
            source,
            self.bridge_program.clone(),
        ))
    }

    async fn resolve_target(
        &self,
        file: &FileConfig,
        detector: &DistributionDetector,
    ) -> Result<(String, TargetSource), ConfigError> {
        if let Some(name) = explicit_target(self.target_override.as_deref()) {
            return Ok((name, TargetSource::Override));
        }
        if let Some(name) = explicit_target(file.target_environment.as_deref()) {
            return Ok((name, TargetSource::File));
        }
        match detector.detect_default().await {
            Ok(name) => return Ok((name, TargetSource::Detected)),
            Err(err) => warn!("auto-detection failed: {err}"),
        }
        match explicit_target(file.fallback_environment.as_deref()) {
            Some(name) => {
                warn!("falling back to default environment name {name}");
                Ok((name, TargetSource::Fallback))
            }
            None => Err(ConfigError::NoTargetEnvironment),
        }
    }
}

/// A configured name counts only when it is non-empty and not an
/// auto-detect placeholder.
fn explicit_target(value: Option<&str>) -> Option<String> {
    let trimmed = value?.trim();
    if trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case("auto")
        || trimmed.eq_ignore_ascii_case("auto-detect")
    {
        return None;
    }
    Some(trimmed.to_owned())
}

fn parse_bool(s: &str) -> bool {
    matches!(
        s.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_script_timeout_ms() -> u64 {
    60_000
}

fn default_max_output_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_max_concurrent_processes() -> usize {
    8
}

fn default_fallback_environment() -> Option<String> {
    Some("Ubuntu".to_owned())
}

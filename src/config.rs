// src/config.rs
//! Per-provider quotas, retry, breaker and cache settings.
//!
//! Loaded from TOML or JSON. Lookup order for [`load_default`]:
//! 1) `$INGEST_CONFIG_PATH`
//! 2) `config/ingest.toml`
//! 3) `config/ingest.json`
//! 4) built-in defaults (no providers)

use anyhow::{anyhow, bail, Context, Result};
use chrono::NaiveDate;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_PATH: &str = "INGEST_CONFIG_PATH";

#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Concurrent entity workers per run.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Seconds between scheduled runs.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Work list processed on every run.
    #[serde(default)]
    pub entities: Vec<String>,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            interval_secs: default_interval_secs(),
            entities: Vec::new(),
            bind_addr: default_bind_addr(),
            providers: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub short_window_calls: u32,
    pub short_window_seconds: u64,
    /// `None` means no long-window quota.
    #[serde(default)]
    pub daily_calls: Option<u32>,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_failure_threshold")]
    pub circuit_failure_threshold: u32,
    #[serde(default = "default_cooldown_secs")]
    pub circuit_cooldown_seconds: u64,
    #[serde(default = "default_evaluation_window_secs")]
    pub circuit_evaluation_window_seconds: u64,
    /// Data types missing here are never cached.
    #[serde(default)]
    pub cache_ttl_seconds_by_data_type: HashMap<String, u64>,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_seconds: u64,
    /// Dates older than this are rejected by the validator.
    #[serde(default = "default_epoch")]
    pub epoch: NaiveDate,
    #[serde(default = "default_min_quality")]
    pub min_quality: f64,
    #[serde(default)]
    pub adaptive: AdaptiveConfig,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Name of the env var holding the API key (never the key itself).
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub api_key_header: Option<String>,
    /// Data types fetched from this provider on every run.
    #[serde(default)]
    pub data_types: Vec<String>,
}

impl ProviderConfig {
    /// Minimal config with the given short-window quota and defaults elsewhere.
    pub fn with_quota(calls: u32, window_secs: u64) -> Self {
        Self {
            short_window_calls: calls,
            short_window_seconds: window_secs,
            daily_calls: None,
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
            circuit_failure_threshold: default_failure_threshold(),
            circuit_cooldown_seconds: default_cooldown_secs(),
            circuit_evaluation_window_seconds: default_evaluation_window_secs(),
            cache_ttl_seconds_by_data_type: HashMap::new(),
            max_in_flight: default_max_in_flight(),
            call_timeout_seconds: default_call_timeout_secs(),
            epoch: default_epoch(),
            min_quality: default_min_quality(),
            adaptive: AdaptiveConfig::default(),
            base_url: None,
            api_key_env: None,
            api_key_header: None,
            data_types: Vec::new(),
        }
    }

    pub fn short_window(&self) -> Duration {
        Duration::from_secs(self.short_window_seconds)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_seconds)
    }

    pub fn cache_ttl(&self, data_type: &str) -> Option<Duration> {
        self.cache_ttl_seconds_by_data_type
            .get(data_type)
            .copied()
            .filter(|s| *s > 0)
            .map(Duration::from_secs)
    }

    fn validate(&self, name: &str) -> Result<()> {
        if self.short_window_calls == 0 || self.short_window_seconds == 0 {
            bail!("provider '{name}': short window quota must be non-zero");
        }
        if self.daily_calls == Some(0) {
            bail!("provider '{name}': daily_calls must be non-zero when set");
        }
        if self.max_attempts == 0 {
            bail!("provider '{name}': max_attempts must be at least 1");
        }
        if self.base_delay_ms > self.max_delay_ms {
            bail!("provider '{name}': base_delay_ms exceeds max_delay_ms");
        }
        if self.circuit_failure_threshold == 0 {
            bail!("provider '{name}': circuit_failure_threshold must be at least 1");
        }
        if self.max_in_flight == 0 {
            bail!("provider '{name}': max_in_flight must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.min_quality) {
            bail!("provider '{name}': min_quality must be within [0, 1]");
        }
        if self.adaptive.multiplier < 1.0 || self.adaptive.max_factor < 1.0 {
            bail!("provider '{name}': adaptive multiplier and max_factor must be >= 1");
        }
        Ok(())
    }
}

/// Window widening applied after the provider answers 429 despite local budget.
#[derive(Debug, Clone, Deserialize)]
pub struct AdaptiveConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_factor")]
    pub max_factor: f64,
    #[serde(default = "default_restore_after")]
    pub restore_after_successes: u32,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            multiplier: default_multiplier(),
            max_factor: default_max_factor(),
            restore_after_successes: default_restore_after(),
        }
    }
}

fn default_workers() -> usize {
    4
}
fn default_interval_secs() -> u64 {
    3600
}
fn default_bind_addr() -> String {
    "127.0.0.1:8000".to_string()
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_max_attempts() -> u32 {
    3
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_cooldown_secs() -> u64 {
    60
}
fn default_evaluation_window_secs() -> u64 {
    300
}
fn default_max_in_flight() -> usize {
    1
}
fn default_call_timeout_secs() -> u64 {
    30
}
fn default_epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1990, 1, 1).unwrap_or_default()
}
fn default_min_quality() -> f64 {
    0.6
}
fn default_true() -> bool {
    true
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_max_factor() -> f64 {
    8.0
}
fn default_restore_after() -> u32 {
    5
}

impl IngestConfig {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            bail!("workers must be at least 1");
        }
        for (name, p) in &self.providers {
            p.validate(name)?;
        }
        Ok(())
    }
}

/// Load config from an explicit path. Supports TOML or JSON formats.
pub fn load_from(path: &Path) -> Result<IngestConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading ingest config from {}", path.display()))?;
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let cfg = parse_config(&content, ext.as_str())
        .with_context(|| format!("parsing ingest config {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Load config using env var + fallbacks (see module docs).
pub fn load_default() -> Result<IngestConfig> {
    if let Ok(p) = std::env::var(ENV_PATH) {
        let pb = PathBuf::from(p);
        if pb.exists() {
            return load_from(&pb);
        } else {
            return Err(anyhow!("{ENV_PATH} points to non-existent path"));
        }
    }
    let toml_p = PathBuf::from("config/ingest.toml");
    if toml_p.exists() {
        return load_from(&toml_p);
    }
    let json_p = PathBuf::from("config/ingest.json");
    if json_p.exists() {
        return load_from(&json_p);
    }
    Ok(IngestConfig::default())
}

fn parse_config(s: &str, hint_ext: &str) -> Result<IngestConfig> {
    match hint_ext {
        "toml" => Ok(toml::from_str(s)?),
        "json" => Ok(serde_json::from_str(s)?),
        _ => {
            // No usable extension: JSON first, then TOML.
            if let Ok(v) = serde_json::from_str(s) {
                return Ok(v);
            }
            toml::from_str(s).map_err(|e| anyhow!("unsupported config format: {e}"))
        }
    }
}

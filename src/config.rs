use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const DEFAULT_ENV_PREFIX: &str = "REELFEED";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub visibility: VisibilityConfig,
    #[serde(default)]
    pub playback: PlaybackConfig,
    #[serde(default)]
    pub media: MediaConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedConfig {
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_resource")]
    pub resource: String,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            resource: default_resource(),
            retry: RetryPolicy::default(),
        }
    }
}

fn default_page_size() -> usize {
    3
}

fn default_resource() -> String {
    "videos".into()
}

/// Backoff schedule for page fetches: `base_delay * 2^attempt`, capped at
/// `max_delay`, with up to 25% random jitter added.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay", with = "humantime_serde")]
    pub base_delay: Duration,
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> Duration {
    Duration::from_millis(250)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(4)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VisibilityConfig {
    #[serde(default = "default_thresholds")]
    pub thresholds: Vec<f64>,
    #[serde(default = "default_visible_ratio")]
    pub visible_ratio: f64,
    #[serde(default = "default_preload_margin")]
    pub preload_margin: f64,
}

impl Default for VisibilityConfig {
    fn default() -> Self {
        Self {
            thresholds: default_thresholds(),
            visible_ratio: default_visible_ratio(),
            preload_margin: default_preload_margin(),
        }
    }
}

fn default_thresholds() -> Vec<f64> {
    vec![0.0, 0.5, 1.0]
}

fn default_visible_ratio() -> f64 {
    0.5
}

fn default_preload_margin() -> f64 {
    0.25
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlaybackConfig {
    #[serde(default = "default_unload_debounce", with = "humantime_serde")]
    pub unload_debounce: Duration,
    #[serde(default = "default_max_auto_retries")]
    pub max_auto_retries: u8,
    #[serde(default = "default_preload")]
    pub preload: bool,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            unload_debounce: default_unload_debounce(),
            max_auto_retries: default_max_auto_retries(),
            preload: default_preload(),
        }
    }
}

fn default_unload_debounce() -> Duration {
    Duration::from_millis(200)
}

fn default_max_auto_retries() -> u8 {
    1
}

fn default_preload() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_media_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default = "default_max_size_bytes")]
    pub max_size_bytes: u64,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            timeout: default_media_timeout(),
            max_size_bytes: default_max_size_bytes(),
        }
    }
}

fn default_workers() -> usize {
    2
}

fn default_media_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_size_bytes() -> u64 {
    64 * 1024 * 1024
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub config_file: Option<PathBuf>,
    pub env_prefix: Option<String>,
}

pub fn load(options: LoadOptions) -> Result<Config> {
    let mut cfg = Config::default();

    if let Some(path) = options.config_file.as_ref() {
        if path.exists() {
            let from_file = read_config_file(path)?;
            cfg = merge_config(cfg, from_file);
        }
    } else if let Some(default_path) = default_config_path() {
        if default_path.exists() {
            let from_file = read_config_file(&default_path)?;
            cfg = merge_config(cfg, from_file);
        }
    }

    let prefix = options.env_prefix.as_deref().unwrap_or(DEFAULT_ENV_PREFIX);
    apply_env(&mut cfg, prefix);

    Ok(cfg)
}

fn read_config_file(path: &Path) -> Result<Config> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&data)
        .with_context(|| format!("Failed to parse config file at {}", path.display()))?;
    Ok(config)
}

fn merge_config(mut base: Config, other: Config) -> Config {
    if other.feed.page_size != 0 {
        base.feed.page_size = other.feed.page_size;
    }
    if !other.feed.resource.trim().is_empty() {
        base.feed.resource = other.feed.resource;
    }
    if other.feed.retry.max_attempts != 0 {
        base.feed.retry.max_attempts = other.feed.retry.max_attempts;
    }
    base.feed.retry.base_delay = other.feed.retry.base_delay;
    base.feed.retry.max_delay = other.feed.retry.max_delay;

    if !other.visibility.thresholds.is_empty() {
        base.visibility.thresholds = other.visibility.thresholds;
    }
    if other.visibility.visible_ratio > 0.0 {
        base.visibility.visible_ratio = other.visibility.visible_ratio.min(1.0);
    }
    base.visibility.preload_margin = other.visibility.preload_margin.max(0.0);

    base.playback.unload_debounce = other.playback.unload_debounce;
    base.playback.max_auto_retries = other.playback.max_auto_retries;
    base.playback.preload = other.playback.preload;

    if other.media.workers != 0 {
        base.media.workers = other.media.workers;
    }
    base.media.timeout = other.media.timeout;
    if other.media.max_size_bytes != 0 {
        base.media.max_size_bytes = other.media.max_size_bytes;
    }

    base
}

fn apply_env(cfg: &mut Config, prefix: &str) {
    let mut map: HashMap<String, String> = HashMap::new();
    let upper_prefix = format!("{}_", prefix.to_uppercase());

    for (key, value) in env::vars() {
        if let Some(stripped) = key.strip_prefix(&upper_prefix) {
            let normalized = stripped.to_ascii_lowercase().replace("__", ".");
            map.insert(normalized, value);
        }
    }

    for (key, value) in map {
        apply_env_value(cfg, &key, value);
    }
}

fn apply_env_value(cfg: &mut Config, key: &str, value: String) {
    match key {
        "feed.page_size" => {
            if let Ok(parsed) = value.parse::<usize>() {
                if parsed > 0 {
                    cfg.feed.page_size = parsed;
                }
            }
        }
        "feed.resource" => cfg.feed.resource = value,
        "feed.retry.max_attempts" => {
            if let Ok(parsed) = value.parse::<u32>() {
                cfg.feed.retry.max_attempts = parsed.max(1);
            }
        }
        "feed.retry.base_delay" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.feed.retry.base_delay = duration;
            }
        }
        "feed.retry.max_delay" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.feed.retry.max_delay = duration;
            }
        }
        "visibility.thresholds" => {
            let parsed: Vec<f64> = value
                .split(',')
                .filter_map(|s| s.trim().parse::<f64>().ok())
                .filter(|t| (0.0..=1.0).contains(t))
                .collect();
            if !parsed.is_empty() {
                cfg.visibility.thresholds = parsed;
            }
        }
        "visibility.visible_ratio" => {
            if let Ok(parsed) = value.parse::<f64>() {
                if parsed > 0.0 && parsed <= 1.0 {
                    cfg.visibility.visible_ratio = parsed;
                }
            }
        }
        "visibility.preload_margin" => {
            if let Ok(parsed) = value.parse::<f64>() {
                cfg.visibility.preload_margin = parsed.max(0.0);
            }
        }
        "playback.unload_debounce" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.playback.unload_debounce = duration;
            }
        }
        "playback.max_auto_retries" => {
            if let Ok(parsed) = value.parse::<u8>() {
                cfg.playback.max_auto_retries = parsed;
            }
        }
        "playback.preload" => {
            cfg.playback.preload = matches!(value.as_str(), "1" | "true" | "TRUE" | "True");
        }
        "media.workers" => {
            if let Ok(parsed) = value.parse::<usize>() {
                cfg.media.workers = parsed;
            }
        }
        "media.timeout" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.media.timeout = duration;
            }
        }
        "media.max_size_bytes" => {
            if let Ok(parsed) = value.parse::<u64>() {
                cfg.media.max_size_bytes = parsed;
            }
        }
        _ => {}
    }
}

pub fn default_path() -> Option<PathBuf> {
    default_config_path()
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("reelfeed").join("config.yaml"))
}

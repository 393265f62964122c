use crate::paths::AppPaths;
use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Whole-app configuration, loaded once at startup and handed to component
/// constructors. Presentation layers address fields through the dotted-key
/// helpers (`get_value` / `set_value`) so they never depend on the struct
/// layout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub download: DownloadConfig,
    pub history: HistoryConfig,
    pub conversion: ConversionConfig,
    pub sites: SitesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Root directory galleries land in. `None` falls back to
    /// `AppPaths::default_download_dir`.
    pub base_path: Option<PathBuf>,
    pub max_parallel_galleries: usize,
    /// Passed through to the extraction tool's own retry setting.
    pub retry_attempts: u32,
    pub use_aria2: bool,
    pub aria2_path: String,
    pub gallery_dl_path: String,
    pub job_timeout_secs: u64,
    /// Adds `--verbose` to the tool invocation.
    pub verbose: bool,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            base_path: None,
            max_parallel_galleries: 3,
            retry_attempts: 3,
            use_aria2: true,
            aria2_path: "aria2c".to_string(),
            gallery_dl_path: "gallery-dl".to_string(),
            job_timeout_secs: 3600,
            verbose: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub enable_history: bool,
    pub max_history_entries: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            enable_history: true,
            max_history_entries: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionConfig {
    pub auto_convert: bool,
    /// "none", "pdf" or "cbz"; consulted only when `auto_convert` is set.
    pub default_format: String,
    pub delete_source_after_conversion: bool,
    pub pdf_quality: u8,
    pub cbz_quality: u8,
    pub max_image_width: u32,
    pub cbz_compression: u32,
    pub optimize_cbz_images: bool,
    pub max_cbz_width: u32,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            auto_convert: false,
            default_format: "none".to_string(),
            delete_source_after_conversion: false,
            pdf_quality: 100,
            cbz_quality: 100,
            max_image_width: 2048,
            cbz_compression: 6,
            optimize_cbz_images: false,
            max_cbz_width: 1920,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SitesConfig {
    pub hentaifox: SiteConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    pub enabled: bool,
    pub base_url: String,
    pub rate_limit_secs: f64,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "https://hentaifox.com".to_string(),
            rate_limit_secs: 1.0,
        }
    }
}

pub fn load_config(paths: &AppPaths) -> Result<AppConfig> {
    let path = paths.config_file_path();
    if !path.exists() {
        return Ok(AppConfig::default());
    }
    let bytes = std::fs::read(&path)?;
    let parsed: AppConfig = serde_json::from_slice(&bytes).map_err(|e| {
        EngineError::Config(format!(
            "failed to parse config at {}: {e}",
            path.to_string_lossy()
        ))
    })?;
    Ok(parsed)
}

pub fn save_config(paths: &AppPaths, config: &AppConfig) -> Result<()> {
    let path = paths.config_file_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(config)?;
    std::fs::write(&path, format!("{json}\n"))?;
    Ok(())
}

/// Reads one value by dotted key, e.g. `download.max_parallel_galleries`.
pub fn get_value(config: &AppConfig, key: &str) -> Option<serde_json::Value> {
    let root = serde_json::to_value(config).ok()?;
    let mut current = &root;
    for part in key.split('.') {
        current = current.as_object()?.get(part)?;
    }
    Some(current.clone())
}

/// Writes one value by dotted key. Unknown keys and type mismatches are
/// rejected; the typed config is only replaced when the whole tree still
/// deserializes.
pub fn set_value(config: &mut AppConfig, key: &str, value: serde_json::Value) -> Result<()> {
    let parts: Vec<&str> = key.split('.').collect();
    let (last, parents) = match parts.split_last() {
        Some(split) if !key.is_empty() => split,
        _ => return Err(EngineError::Config(format!("unknown config key: {key}"))),
    };

    let mut root = serde_json::to_value(&*config)?;
    let mut current = &mut root;
    for part in parents {
        current = current
            .as_object_mut()
            .and_then(|obj| obj.get_mut(*part))
            .ok_or_else(|| EngineError::Config(format!("unknown config key: {key}")))?;
    }
    let obj = current
        .as_object_mut()
        .ok_or_else(|| EngineError::Config(format!("unknown config key: {key}")))?;
    if !obj.contains_key(*last) {
        return Err(EngineError::Config(format!("unknown config key: {key}")));
    }
    obj.insert((*last).to_string(), value);

    *config = serde_json::from_value(root)
        .map_err(|e| EngineError::Config(format!("invalid value for {key}: {e}")))?;
    Ok(())
}

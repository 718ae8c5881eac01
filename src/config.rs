use std::path::PathBuf;
use std::time::Duration;

use rocket::figment::providers::{Env, Format, Serialized, Toml};
use rocket::figment::Figment;
use serde::{Deserialize, Serialize};

use crate::models::device::DevicePreference;

/// Application configuration, built once at startup and handed to every
/// component that needs a directory, a URL or a limit.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// Root of all runtime directories (logs, tmp, embeddings)
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,

    /// Where downloaded ONNX weights are kept
    #[serde(default)]
    pub model_cache_dir: Option<PathBuf>,

    /// Where image embeddings are written
    #[serde(default)]
    pub embeddings_dir: Option<PathBuf>,

    /// Where GeoJSON results are written
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,

    /// Data directory of the desktop user, echoed by /ping
    #[serde(default)]
    pub user_base_dir: Option<String>,

    /// "docker" or "local", echoed by /ping
    #[serde(default)]
    pub run_mode: Option<String>,

    /// Pin a compute device instead of probing
    #[serde(default)]
    pub device: DevicePreference,

    /// Host serving `<repo>/resolve/main/<file>` weight downloads
    #[serde(default = "default_weights_base_url")]
    pub weights_base_url: String,

    /// Timeout for image and weight downloads in seconds
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,

    /// Write every prediction as a GeoJSON file into `temp_dir`
    #[serde(default = "default_true")]
    pub save_geojson: bool,

    /// tracing filter used when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON log lines instead of the human format
    #[serde(default)]
    pub log_json: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            model_cache_dir: None,
            embeddings_dir: None,
            temp_dir: None,
            user_base_dir: None,
            run_mode: None,
            device: DevicePreference::default(),
            weights_base_url: default_weights_base_url(),
            http_timeout_secs: default_http_timeout_secs(),
            save_geojson: default_true(),
            log_level: default_log_level(),
            log_json: false,
        }
    }
}

impl AppConfig {
    /// Defaults, then `EasyEarth.toml`, then `EASYEARTH_*` variables.
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file("EasyEarth.toml"))
            .merge(Env::prefixed("EASYEARTH_"))
    }

    pub fn load() -> Result<Self, rocket::figment::Error> {
        Self::figment().extract()
    }

    /// Config rooted at `base_dir`, every other field at its default.
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            ..Self::default()
        }
    }

    pub fn model_cache_dir(&self) -> PathBuf {
        self.model_cache_dir
            .clone()
            .unwrap_or_else(|| self.base_dir.join("models"))
    }

    pub fn embeddings_dir(&self) -> PathBuf {
        self.embeddings_dir
            .clone()
            .unwrap_or_else(|| self.base_dir.join("embeddings"))
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.temp_dir
            .clone()
            .unwrap_or_else(|| self.base_dir.join("tmp"))
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

fn default_base_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
        .join(".cache")
        .join("easyearth")
}

fn default_weights_base_url() -> String {
    "https://huggingface.co".to_string()
}

// Inference on large rasters can take minutes; downloads share this budget.
fn default_http_timeout_secs() -> u64 {
    3600
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_dirs_follow_base_dir() {
        let config = AppConfig::with_base_dir("/data/easyearth");
        assert_eq!(config.model_cache_dir(), PathBuf::from("/data/easyearth/models"));
        assert_eq!(config.embeddings_dir(), PathBuf::from("/data/easyearth/embeddings"));
        assert_eq!(config.temp_dir(), PathBuf::from("/data/easyearth/tmp"));
    }

    #[test]
    fn explicit_dirs_win() {
        let mut config = AppConfig::with_base_dir("/data/easyearth");
        config.model_cache_dir = Some(PathBuf::from("/weights"));
        assert_eq!(config.model_cache_dir(), PathBuf::from("/weights"));
    }

    #[test]
    fn merged_values_override_defaults() {
        let config: AppConfig = AppConfig::figment()
            .merge(("run_mode", "docker"))
            .merge(("http_timeout_secs", 5))
            .merge(("device", "cpu"))
            .extract()
            .unwrap();
        assert_eq!(config.run_mode.as_deref(), Some("docker"));
        assert_eq!(config.http_timeout(), Duration::from_secs(5));
        assert_eq!(config.device, DevicePreference::Cpu);
        assert!(config.save_geojson);
    }
}

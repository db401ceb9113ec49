//! # Configuration Management
//!
//! Loads application configuration from multiple sources, in priority
//! order (highest wins):
//! 1. Environment variables with the `APP_` prefix (plus bare `HOST`/`PORT`
//!    for deployment platforms)
//! 2. An optional `config.toml` next to the binary
//! 3. Built-in defaults
//!
//! Every tunable of the orchestration core lives here: the rate-limit
//! window, the debounce interval, the backend endpoint and timeout, and
//! the playback queue capacity.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub limits: LimitsConfig,
    pub analysis: AnalysisConfig,
    pub audio: AudioConfig,
}

/// Bind address for the HTTP/WebSocket server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Sliding-window rate limiter settings (see `limiter.rs`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Trailing window in which per-client requests are counted
    pub window_ms: u64,

    /// Admissions allowed per window per client
    pub max_requests: usize,

    /// Distinct client buckets tracked before LRU eviction kicks in
    pub max_keys: usize,

    /// Bucket lifetime without activity, independent of the window
    pub idle_ttl_secs: u64,
}

/// Analysis scheduling and reasoning-backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Silence required before a debounced analysis fires
    pub debounce_ms: u64,

    /// Pending debounce timers older than this are swept
    pub sweep_max_age_ms: u64,

    /// Base URL of the OpenAI-compatible reasoning backend
    pub backend_url: String,

    /// Model name passed to the backend
    pub backend_model: String,

    /// Hard bound on a single backend call
    pub backend_timeout_secs: u64,

    /// Minimum trimmed code length the analyze endpoint accepts
    pub min_code_len: usize,
}

/// Playback queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Pending spoken-feedback items kept before head eviction
    pub queue_capacity: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            limits: LimitsConfig {
                window_ms: 60_000,
                max_requests: 30,
                max_keys: 1000,
                idle_ttl_secs: 900,
            },
            analysis: AnalysisConfig {
                debounce_ms: 3000,
                sweep_max_age_ms: 300_000,
                backend_url: "http://localhost:11434".to_string(),
                backend_model: "llama3.1:8b".to_string(),
                backend_timeout_secs: 20,
                min_code_len: 10,
            },
            audio: AudioConfig { queue_capacity: 5 },
        }
    }
}

impl AppConfig {
    /// Load configuration: defaults, then `config.toml` if present, then
    /// `APP_*` environment variables, then the `HOST`/`PORT` special cases
    /// used by deployment platforms.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("_"));

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject configurations that cannot work at runtime.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.limits.window_ms == 0 {
            return Err(anyhow::anyhow!("Rate limit window must be greater than 0"));
        }

        if self.limits.max_keys == 0 {
            return Err(anyhow::anyhow!("Rate limiter must track at least one client"));
        }

        if self.analysis.debounce_ms == 0 {
            return Err(anyhow::anyhow!("Debounce interval must be greater than 0"));
        }

        if self.analysis.backend_url.trim().is_empty() {
            return Err(anyhow::anyhow!("Backend URL cannot be empty"));
        }

        if self.audio.queue_capacity == 0 {
            return Err(anyhow::anyhow!("Audio queue capacity must be greater than 0"));
        }

        Ok(())
    }

    /// Apply a partial update from a JSON document, field by field, then
    /// re-validate. Sending `{"analysis": {"debounce_ms": 5000}}` changes
    /// only that value.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = port as u16;
            }
        }

        if let Some(limits) = partial.get("limits") {
            if let Some(v) = limits.get("window_ms").and_then(|v| v.as_u64()) {
                self.limits.window_ms = v;
            }
            if let Some(v) = limits.get("max_requests").and_then(|v| v.as_u64()) {
                self.limits.max_requests = v as usize;
            }
            if let Some(v) = limits.get("max_keys").and_then(|v| v.as_u64()) {
                self.limits.max_keys = v as usize;
            }
            if let Some(v) = limits.get("idle_ttl_secs").and_then(|v| v.as_u64()) {
                self.limits.idle_ttl_secs = v;
            }
        }

        if let Some(analysis) = partial.get("analysis") {
            if let Some(v) = analysis.get("debounce_ms").and_then(|v| v.as_u64()) {
                self.analysis.debounce_ms = v;
            }
            if let Some(v) = analysis.get("sweep_max_age_ms").and_then(|v| v.as_u64()) {
                self.analysis.sweep_max_age_ms = v;
            }
            if let Some(v) = analysis.get("backend_url").and_then(|v| v.as_str()) {
                self.analysis.backend_url = v.to_string();
            }
            if let Some(v) = analysis.get("backend_model").and_then(|v| v.as_str()) {
                self.analysis.backend_model = v.to_string();
            }
            if let Some(v) = analysis.get("backend_timeout_secs").and_then(|v| v.as_u64()) {
                self.analysis.backend_timeout_secs = v;
            }
            if let Some(v) = analysis.get("min_code_len").and_then(|v| v.as_u64()) {
                self.analysis.min_code_len = v as usize;
            }
        }

        if let Some(audio) = partial.get("audio") {
            if let Some(v) = audio.get("queue_capacity").and_then(|v| v.as_u64()) {
                self.audio.queue_capacity = v as usize;
            }
        }

        self.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.limits.max_requests, 30);
        assert_eq!(config.limits.window_ms, 60_000);
        assert_eq!(config.analysis.debounce_ms, 3000);
        assert_eq!(config.audio.queue_capacity, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.analysis.debounce_ms = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.queue_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"analysis": {"debounce_ms": 5000}, "limits": {"max_requests": 10}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.analysis.debounce_ms, 5000);
        assert_eq!(config.limits.max_requests, 10);
        // Untouched fields keep their values.
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn test_config_update_rejects_invalid_values() {
        let mut config = AppConfig::default();
        let json = r#"{"audio": {"queue_capacity": 0}}"#;
        assert!(config.update_from_json(json).is_err());
    }
}

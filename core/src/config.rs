use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default number of attempts for mutating registry calls.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

/// Default name of the per-source ignore file.
pub const DEFAULT_IGNORE_FILE: &str = ".hoistignore";

/// Registry connection configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Talk plain HTTP instead of HTTPS
    pub insecure: bool,

    /// Accept invalid TLS certificates
    pub skip_tls_verify: bool,

    /// Upload chunk size in bytes (0 = single PUT)
    pub chunk_size: usize,
}

impl RegistryConfig {
    /// URL scheme used for registry requests.
    pub fn scheme(&self) -> &'static str {
        if self.insecure {
            "http"
        } else {
            "https"
        }
    }
}

/// Push/sync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushConfig {
    /// Compute the plan without mutating the destination
    pub dry_run: bool,

    /// Attempts per mutating call (uploads, mounts, manifest)
    pub retry_attempts: u32,

    /// Download the blob from the source and retry once when a mount is rejected
    pub mount_fallback: bool,

    /// Write the final manifest digest to this file
    pub digest_file: Option<PathBuf>,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            mount_fallback: false,
            digest_file: None,
        }
    }
}

/// Layer building configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerConfig {
    /// Force every entry's mtime to a fixed timestamp
    pub reproducible: bool,

    /// Name of the ignore file looked up in each source root
    pub ignore_file: String,

    /// Absolute paths that are never added to a layer
    pub exclude: Vec<PathBuf>,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            reproducible: true,
            ignore_file: DEFAULT_IGNORE_FILE.to_string(),
            exclude: Vec::new(),
        }
    }
}

/// Log level
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Map a `-v` repetition count onto a level.
    pub fn from_verbosity(count: u8) -> Self {
        match count {
            0 => LogLevel::Warn,
            1 => LogLevel::Info,
            _ => LogLevel::Debug,
        }
    }

    /// Directive string understood by `EnvFilter`.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_config_scheme() {
        let mut config = RegistryConfig::default();
        assert_eq!(config.scheme(), "https");
        config.insecure = true;
        assert_eq!(config.scheme(), "http");
        assert_eq!(config.chunk_size, 0);
    }

    #[test]
    fn test_push_config_defaults() {
        let config = PushConfig::default();
        assert!(!config.dry_run);
        assert!(!config.mount_fallback);
        assert_eq!(config.retry_attempts, 3);
        assert!(config.digest_file.is_none());
    }

    #[test]
    fn test_layer_config_defaults() {
        let config = LayerConfig::default();
        assert!(config.reproducible);
        assert_eq!(config.ignore_file, ".hoistignore");
        assert!(config.exclude.is_empty());
    }

    #[test]
    fn test_log_level_from_verbosity() {
        assert_eq!(LogLevel::from_verbosity(0).as_filter(), "warn");
        assert_eq!(LogLevel::from_verbosity(1).as_filter(), "info");
        assert_eq!(LogLevel::from_verbosity(5).as_filter(), "debug");
        assert_eq!(tracing::Level::from(LogLevel::Error), tracing::Level::ERROR);
    }

    #[test]
    fn test_push_config_serde_roundtrip() {
        let config = PushConfig {
            digest_file: Some(PathBuf::from("/tmp/digest")),
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let parsed: PushConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.digest_file, config.digest_file);
        assert_eq!(parsed.retry_attempts, 3);
    }
}

//! Hoist Core - Foundational Types
//!
//! Error taxonomy and configuration shared by the image engine and the CLI.

pub mod config;
pub mod error;

// Re-export commonly used types
pub use config::{LayerConfig, LogLevel, PushConfig, RegistryConfig};
pub use error::{HoistError, Result};

/// Hoist version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Hoist image engine.
//!
//! Registry client with token authentication, reproducible layer builder,
//! image aggregate and push/sync engine.

#![allow(clippy::result_large_err)]

pub mod oci;

pub use oci::{
    AddSpec, CredentialChain, CredentialProvider, CredentialStore, Credentials, Endpoint,
    FolderSpec, Image, ImageReference, Layer, LayerAction, LayerBuilder, PushReport, Pusher,
    SourceFilter,
};

/// Hoist image engine version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

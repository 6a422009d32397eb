//! OCI image building and distribution.
//!
//! Loads a base image from a registry or folder, appends layers built from
//! local directories, edits the config, and pushes the result while moving
//! as few bytes as possible.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────┐   ┌──────────────┐   ┌──────────────────────────┐
//! │ LayerBuilder  │──▶│    Image     │──▶│         Pusher           │
//! │ tar→gz→sha256 │   │ manifest +   │   │ plan: upload / present / │
//! │ ignore rules  │   │ config       │   │       mount / copy       │
//! └───────────────┘   └──────▲───────┘   └────────────┬─────────────┘
//!                            │                        │
//!                     ┌──────┴────────────────────────▼─────┐
//!                     │ Endpoint { Registry | Folder }      │
//!                     │   RegistryClient ─▶ AuthTransport   │
//!                     └─────────────────────────────────────┘
//! ```

pub mod auth;
pub mod client;
pub mod credentials;
pub mod digest;
pub mod endpoint;
pub mod ignore;
pub mod image;
pub mod layer;
pub mod manifest;
pub mod push;
pub mod reference;

pub use auth::{AuthTransport, Challenge, Scope};
pub use client::{BlobSource, BlobStream, RegistryClient};
pub use credentials::{
    Anonymous, CredentialChain, CredentialProvider, CredentialStore, Credentials,
    EnvCredentials, StaticCredentials,
};
pub use digest::Digest;
pub use endpoint::{Endpoint, FolderEndpoint, RegistryEndpoint};
pub use ignore::{GitIgnoreRules, IgnoreRules, SourceFilter};
pub use image::{history_timestamp, ConfigEditor, Image};
pub use layer::{AddSpec, FolderSpec, Layer, LayerBuilder, Ownership};
pub use manifest::{Descriptor, ImageConfig, Manifest};
pub use push::{LayerAction, PushReport, Pusher};
pub use reference::ImageReference;

//! The image aggregate.
//!
//! An [`Image`] owns a manifest, its config and the layers added during this
//! session. The config is only reachable mutably through
//! [`Image::edit_config`], so the manifest's config descriptor can never go
//! stale.

use std::future::Future;

use chrono::{SecondsFormat, TimeZone, Utc};
use hoist_core::error::{HoistError, Result};

use super::digest::{canonical_json, sha256_bytes, Digest};
use super::layer::{Layer, REPRODUCIBLE_MTIME};
use super::manifest::{
    is_supported_config_media_type, Descriptor, History, ImageConfig, Manifest, RuntimeConfig,
    LAYER_MEDIA_TYPE,
};

/// RFC 3339 timestamp for new history entries.
///
/// Reproducible builds use the same fixed instant as layer entries.
pub fn history_timestamp(reproducible: bool) -> String {
    let time = if reproducible {
        Utc.timestamp_opt(REPRODUCIBLE_MTIME as i64, 0).single()
    } else {
        None
    };
    time.unwrap_or_else(Utc::now)
        .to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Manifest, config and session layers, kept mutually consistent.
#[derive(Debug, Clone)]
pub struct Image {
    manifest: Manifest,
    config: ImageConfig,
    manifest_bytes: Vec<u8>,
    config_bytes: Vec<u8>,
    manifest_digest: Digest,
    added_layers: Vec<Layer>,
    history_time: Option<String>,
    updated: bool,
}

impl Image {
    /// Build an image from manifest bytes, fetching the config by digest.
    ///
    /// The bytes are kept as-is: an image that is never edited is pushed
    /// with its original digests.
    pub async fn load_metadata<F, Fut>(manifest_bytes: Vec<u8>, fetch_config: F) -> Result<Self>
    where
        F: FnOnce(Digest) -> Fut,
        Fut: Future<Output = Result<Vec<u8>>>,
    {
        let manifest: Manifest = serde_json::from_slice(&manifest_bytes)?;
        if !is_supported_config_media_type(&manifest.config.media_type) {
            return Err(HoistError::Parse(format!(
                "unsupported config media type '{}'",
                manifest.config.media_type
            )));
        }

        let config_bytes = fetch_config(manifest.config.digest.clone()).await?;
        let actual = sha256_bytes(&config_bytes);
        if actual != manifest.config.digest {
            return Err(HoistError::Consistency(format!(
                "config blob hashes to {}, manifest expects {}",
                actual, manifest.config.digest
            )));
        }
        let config: ImageConfig = serde_json::from_slice(&config_bytes)?;
        if manifest.layers.len() != config.rootfs.diff_ids.len() {
            return Err(HoistError::Consistency(format!(
                "manifest lists {} layers but config has {} diff_ids",
                manifest.layers.len(),
                config.rootfs.diff_ids.len()
            )));
        }

        tracing::debug!(
            config = %manifest.config.digest,
            layers = manifest.layers.len(),
            "Loaded image metadata"
        );

        Ok(Self {
            manifest_digest: sha256_bytes(&manifest_bytes),
            manifest,
            config,
            manifest_bytes,
            config_bytes,
            added_layers: Vec::new(),
            history_time: None,
            updated: false,
        })
    }

    /// Timestamp stamped on history entries added from now on.
    pub fn set_history_time(&mut self, time: Option<String>) {
        self.history_time = time;
    }

    /// Mutate the config. The manifest is recomputed when `edit` returns.
    pub fn edit_config<F, T>(&mut self, edit: F) -> Result<T>
    where
        F: FnOnce(&mut ConfigEditor<'_>) -> T,
    {
        let mut editor = ConfigEditor {
            config: &mut self.config,
            history_time: self.history_time.as_deref(),
        };
        let out = edit(&mut editor);
        self.config_updated()?;
        Ok(out)
    }

    /// Append a freshly built layer on top of the image.
    pub fn add_layer(&mut self, layer: Layer, created_by: &str) -> Result<()> {
        tracing::debug!(layer = %layer.name, digest = %layer.digest, "Adding layer");
        self.config.rootfs.diff_ids.push(layer.diff_id.clone());
        self.config.history.push(History {
            created: self.history_time.clone(),
            created_by: Some(created_by.to_string()),
            ..Default::default()
        });
        self.manifest
            .layers
            .push(Descriptor::new(LAYER_MEDIA_TYPE, layer.digest.clone(), layer.size));
        self.added_layers.push(layer);
        self.config_updated()
    }

    fn config_updated(&mut self) -> Result<()> {
        self.config_bytes = canonical_json(&self.config)?;
        self.manifest.config.digest = sha256_bytes(&self.config_bytes);
        self.manifest.config.size = self.config_bytes.len() as u64;
        self.manifest_bytes = canonical_json(&self.manifest)?;
        self.manifest_digest = sha256_bytes(&self.manifest_bytes);
        self.updated = true;
        Ok(())
    }

    /// Check that the manifest describes exactly the config and layers held.
    pub fn verify(&self) -> Result<()> {
        if self.manifest.layers.len() != self.config.rootfs.diff_ids.len() {
            return Err(HoistError::Consistency(format!(
                "manifest lists {} layers but config has {} diff_ids",
                self.manifest.layers.len(),
                self.config.rootfs.diff_ids.len()
            )));
        }
        let config_digest = sha256_bytes(&self.config_bytes);
        if config_digest != self.manifest.config.digest
            || self.config_bytes.len() as u64 != self.manifest.config.size
        {
            return Err(HoistError::Consistency(format!(
                "config descriptor {} ({} bytes) does not match config {} ({} bytes)",
                self.manifest.config.digest,
                self.manifest.config.size,
                config_digest,
                self.config_bytes.len()
            )));
        }
        if sha256_bytes(&self.manifest_bytes) != self.manifest_digest {
            return Err(HoistError::Consistency(
                "manifest digest does not match manifest bytes".to_string(),
            ));
        }
        Ok(())
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn config(&self) -> &ImageConfig {
        &self.config
    }

    /// Exact bytes that are pushed as the manifest.
    pub fn manifest_bytes(&self) -> &[u8] {
        &self.manifest_bytes
    }

    /// Exact bytes that are pushed as the config blob.
    pub fn config_bytes(&self) -> &[u8] {
        &self.config_bytes
    }

    pub fn manifest_digest(&self) -> &Digest {
        &self.manifest_digest
    }

    pub fn config_digest(&self) -> &Digest {
        &self.manifest.config.digest
    }

    pub fn manifest_media_type(&self) -> &str {
        &self.manifest.media_type
    }

    /// Layers added during this session, in order.
    pub fn added_layers(&self) -> &[Layer] {
        &self.added_layers
    }

    /// The session layer with this blob digest, if any.
    pub fn added_layer(&self, digest: &Digest) -> Option<&Layer> {
        self.added_layers.iter().find(|l| &l.digest == digest)
    }

    /// Whether the config or manifest changed since loading.
    pub fn is_updated(&self) -> bool {
        self.updated
    }
}

/// Mutable view of an image config handed out by [`Image::edit_config`].
pub struct ConfigEditor<'a> {
    config: &'a mut ImageConfig,
    history_time: Option<&'a str>,
}

impl ConfigEditor<'_> {
    fn runtime(&mut self) -> &mut RuntimeConfig {
        self.config.config.get_or_insert_with(RuntimeConfig::default)
    }

    pub fn set_label(&mut self, key: &str, value: &str) {
        self.runtime()
            .labels
            .get_or_insert_with(Default::default)
            .insert(key.to_string(), value.to_string());
    }

    /// Set `key=value`, replacing an existing definition of `key` in place.
    pub fn set_env(&mut self, key: &str, value: &str) {
        let entry = format!("{}={}", key, value);
        let env = self.runtime().env.get_or_insert_with(Vec::new);
        let prefix = format!("{}=", key);
        match env.iter_mut().find(|e| e.starts_with(&prefix) || e.as_str() == key) {
            Some(existing) => *existing = entry,
            None => env.push(entry),
        }
    }

    pub fn set_entrypoint(&mut self, entrypoint: Vec<String>) {
        self.runtime().entrypoint = Some(entrypoint);
    }

    pub fn set_cmd(&mut self, cmd: Vec<String>) {
        self.runtime().cmd = Some(cmd);
    }

    pub fn set_user(&mut self, user: &str) {
        self.runtime().user = Some(user.to_string());
    }

    pub fn set_working_dir(&mut self, dir: &str) {
        self.runtime().working_dir = Some(dir.to_string());
    }

    /// Record an operation in the history.
    pub fn add_history(&mut self, created_by: &str, empty_layer: bool) {
        let created = self.history_time.map(str::to_string);
        self.config.history.push(History {
            created,
            created_by: Some(created_by.to_string()),
            empty_layer,
            ..Default::default()
        });
    }

    /// Read-only view of the config being edited.
    pub fn config(&self) -> &ImageConfig {
        &*self.config
    }
}

//! Push/sync engine.
//!
//! Moves an [`Image`] from its source endpoint to a destination, transferring
//! only what the destination lacks. Blobs already present are left alone.
//! Missing layers built this session are uploaded from local files; missing
//! base layers are mounted when both ends share a registry host, and copied
//! otherwise.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;

use bytes::Bytes;
use futures::TryStreamExt;
use hoist_core::config::PushConfig;
use hoist_core::error::{HoistError, Result};
use tokio_util::sync::CancellationToken;

use super::client::BlobSource;
use super::digest::Digest;
use super::endpoint::Endpoint;
use super::image::Image;
use super::manifest::Descriptor;

/// Run `op` up to `attempts` times, building a fresh future each time.
///
/// Cancellation, rejected credentials and rejected mounts are final and never
/// retried.
pub async fn retry<F, Fut, T>(attempts: u32, operation: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(
                e @ (HoistError::Cancelled
                | HoistError::Auth { .. }
                | HoistError::MountFailed { .. }),
            ) => return Err(e),
            Err(e) if attempt < attempts => {
                tracing::warn!(operation, attempt, error = %e, "Attempt failed, retrying");
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// What happens to one manifest layer during a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerAction {
    /// Built this session and missing; uploaded from the local file.
    Upload,
    /// Already in the destination.
    Present,
    /// Linked from the source repository on the same registry.
    Mount,
    /// Streamed from the source to the destination.
    Copy,
}

impl fmt::Display for LayerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LayerAction::Upload => "upload",
            LayerAction::Present => "present",
            LayerAction::Mount => "mount",
            LayerAction::Copy => "copy",
        };
        f.write_str(s)
    }
}

/// Outcome of a push.
#[derive(Debug, Clone, PartialEq)]
pub struct PushReport {
    /// Where the image went, with the tag actually used.
    pub destination: String,
    pub manifest_digest: Digest,
    /// Whether the config blob was (or, in a dry run, would be) uploaded
    pub config_uploaded: bool,
    /// One entry per manifest layer, in order
    pub layers: Vec<(Digest, LayerAction)>,
    pub dry_run: bool,
}

impl PushReport {
    pub fn count(&self, action: LayerAction) -> usize {
        self.layers.iter().filter(|(_, a)| *a == action).count()
    }
}

/// Pushes images from one endpoint to another.
pub struct Pusher<'a> {
    source: &'a Endpoint,
    destination: &'a Endpoint,
    config: PushConfig,
    cancel: CancellationToken,
}

impl<'a> Pusher<'a> {
    pub fn new(source: &'a Endpoint, destination: &'a Endpoint, config: PushConfig) -> Self {
        Self {
            source,
            destination,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Abort the push when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Push `image`, which must have been loaded from this pusher's source.
    pub async fn push(&self, image: &Image) -> Result<PushReport> {
        image.verify()?;
        self.check_cancelled()?;

        let destination = self.destination_name();
        tracing::info!(
            source = %self.source,
            destination = %destination,
            dry_run = self.config.dry_run,
            "Pushing image"
        );

        let config_digest = image.config_digest();
        let config_uploaded = self.destination.blob_exists(config_digest).await?.is_none();
        let plan = self.plan(image).await?;

        if self.config.dry_run {
            for (descriptor, action) in &plan {
                tracing::info!(digest = %descriptor.digest, %action, "Layer (dry run)");
            }
            return Ok(PushReport {
                destination,
                manifest_digest: image.manifest_digest().clone(),
                config_uploaded,
                layers: summarize(&plan),
                dry_run: true,
            });
        }

        if config_uploaded {
            tracing::info!(digest = %config_digest, "Uploading config");
            let source = BlobSource::Bytes(Bytes::copy_from_slice(image.config_bytes()));
            let size = image.config_bytes().len() as u64;
            self.cancellable(retry(self.config.retry_attempts, "upload config", || {
                self.destination.push_blob(config_digest, size, &source)
            }))
            .await?;
        }

        for (descriptor, action) in &plan {
            self.check_cancelled()?;
            match action {
                LayerAction::Upload => self.upload_layer(image, descriptor).await?,
                LayerAction::Copy => self.copy_layer(descriptor).await?,
                LayerAction::Present | LayerAction::Mount => {}
            }
        }

        self.check_cancelled()?;
        let media_type = image.manifest_media_type();
        let manifest = image.manifest_bytes();
        let manifest_digest = self
            .cancellable(retry(self.config.retry_attempts, "upload manifest", || {
                self.destination.push_manifest(media_type, manifest)
            }))
            .await?;
        tracing::info!(destination = %destination, digest = %manifest_digest, "Pushed manifest");

        if let Some(ref path) = self.config.digest_file {
            tokio::fs::write(path, format!("{}\n", manifest_digest)).await?;
            tracing::debug!(path = %path.display(), "Wrote digest file");
        }

        Ok(PushReport {
            destination,
            manifest_digest,
            config_uploaded,
            layers: summarize(&plan),
            dry_run: false,
        })
    }

    /// Decide an action for every manifest layer. Mounts happen here.
    async fn plan(&self, image: &Image) -> Result<Vec<(Descriptor, LayerAction)>> {
        let mut seen = HashSet::new();
        let mut plan = Vec::with_capacity(image.manifest().layers.len());

        for descriptor in &image.manifest().layers {
            self.check_cancelled()?;
            let digest = &descriptor.digest;

            let action = if !seen.insert(digest.clone()) {
                // Repeated blob, handled by its first occurrence
                LayerAction::Present
            } else if self.destination.blob_exists(digest).await?.is_some() {
                LayerAction::Present
            } else if image.added_layer(digest).is_some() {
                // Local file is the only source; never mounted
                LayerAction::Upload
            } else if self.can_mount() {
                self.mount(digest).await?
            } else {
                LayerAction::Copy
            };

            tracing::debug!(%digest, %action, "Planned layer");
            plan.push((descriptor.clone(), action));
        }
        Ok(plan)
    }

    /// Both ends are repositories on the same registry host.
    fn can_mount(&self) -> bool {
        match (self.source.registry_host(), self.destination.registry_host()) {
            (Some(source), Some(destination)) => source == destination,
            _ => false,
        }
    }

    /// Mount a blob, falling back to a copy when the registry refuses.
    async fn mount(&self, digest: &Digest) -> Result<LayerAction> {
        let (Endpoint::Registry(source), Endpoint::Registry(destination)) =
            (self.source, self.destination)
        else {
            return Ok(LayerAction::Copy);
        };
        if self.config.dry_run {
            return Ok(LayerAction::Mount);
        }

        let from = source.repository();
        let attempt = || destination.client().mount_blob(destination.repository(), digest, from);

        match self
            .cancellable(retry(self.config.retry_attempts, "mount blob", attempt))
            .await
        {
            Ok(()) => return Ok(LayerAction::Mount),
            Err(HoistError::MountFailed { message, .. }) => {
                tracing::warn!(%digest, from, reason = %message, "Mount rejected");
            }
            Err(e) => return Err(e),
        }

        if !self.config.mount_fallback {
            return Ok(LayerAction::Copy);
        }

        // Reading the blob through the source repository makes some
        // registries materialize it, after which a mount can succeed.
        match self.drain(digest).await {
            Ok(bytes) => tracing::info!(%digest, bytes, "Pulled blob from source, retrying mount"),
            Err(HoistError::Cancelled) => return Err(HoistError::Cancelled),
            Err(e) => {
                tracing::warn!(%digest, error = %e, "Pull before remount failed, copying instead");
                return Ok(LayerAction::Copy);
            }
        }

        match self.cancellable(attempt()).await {
            Ok(()) => Ok(LayerAction::Mount),
            Err(HoistError::MountFailed { message, .. }) => {
                tracing::warn!(%digest, from, reason = %message, "Mount rejected again, copying instead");
                Ok(LayerAction::Copy)
            }
            Err(e) => Err(e),
        }
    }

    /// Download a blob from the source and discard it.
    async fn drain(&self, digest: &Digest) -> Result<u64> {
        self.cancellable(async {
            let mut stream = self.source.fetch_blob(digest).await?;
            let mut total = 0u64;
            while let Some(chunk) = stream.try_next().await? {
                total += chunk.len() as u64;
            }
            Ok(total)
        })
        .await
    }

    async fn upload_layer(&self, image: &Image, descriptor: &Descriptor) -> Result<()> {
        let layer = image.added_layer(&descriptor.digest).ok_or_else(|| {
            HoistError::Consistency(format!("no local file for layer {}", descriptor.digest))
        })?;
        tracing::info!(layer = %layer.name, digest = %layer.digest, size = layer.size, "Uploading layer");

        let source = BlobSource::File(layer.path.clone());
        self.cancellable(retry(self.config.retry_attempts, "upload layer", || {
            self.destination
                .push_blob(&descriptor.digest, descriptor.size, &source)
        }))
        .await
    }

    async fn copy_layer(&self, descriptor: &Descriptor) -> Result<()> {
        tracing::info!(digest = %descriptor.digest, size = descriptor.size, "Copying layer");
        let (source, destination) = (self.source, self.destination);
        let (digest, size) = (&descriptor.digest, descriptor.size);

        self.cancellable(retry(self.config.retry_attempts, "copy layer", move || async move {
            let blob = BlobSource::stream(source.fetch_blob(digest).await?);
            destination.push_blob(digest, size, &blob).await
        }))
        .await
    }

    fn destination_name(&self) -> String {
        match self.destination {
            Endpoint::Registry(r) => {
                let reference = r.reference();
                if reference.is_untagged() {
                    tracing::warn!(destination = %reference, "No tag given, pushing as 'latest'");
                }
                format!(
                    "{}/{}:{}",
                    reference.registry,
                    reference.repository,
                    reference.manifest_reference()
                )
            }
            Endpoint::Folder(_) => self.destination.to_string(),
        }
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(HoistError::Cancelled);
        }
        Ok(())
    }

    async fn cancellable<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(HoistError::Cancelled),
            result = fut => result,
        }
    }
}

fn summarize(plan: &[(Descriptor, LayerAction)]) -> Vec<(Digest, LayerAction)> {
    plan.iter()
        .map(|(d, action)| (d.digest.clone(), *action))
        .collect()
}

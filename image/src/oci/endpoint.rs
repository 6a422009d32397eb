//! Image sources and destinations.
//!
//! A registry repository and a local folder expose the same operations, so
//! the push engine can move an image between any pair of them.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::{StreamExt, TryStreamExt};
use hoist_core::config::RegistryConfig;
use hoist_core::error::{HoistError, Result};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

use super::client::{BlobSource, BlobStream, RegistryClient};
use super::credentials::CredentialProvider;
use super::digest::{sha256_bytes, Digest};
use super::image::Image;
use super::reference::ImageReference;

/// Prefix that selects a folder endpoint on the command line.
pub const FOLDER_PREFIX: &str = "file:";

/// Manifest file name inside a folder endpoint.
pub const FOLDER_MANIFEST: &str = "manifest.json";

/// A repository on a registry, addressed by an image reference.
pub struct RegistryEndpoint {
    client: RegistryClient,
    reference: ImageReference,
}

impl RegistryEndpoint {
    pub fn new(
        reference: ImageReference,
        config: &RegistryConfig,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self> {
        let client = RegistryClient::new(reference.api_host(), config, credentials)?;
        Ok(Self { client, reference })
    }

    pub fn client(&self) -> &RegistryClient {
        &self.client
    }

    pub fn reference(&self) -> &ImageReference {
        &self.reference
    }

    pub fn repository(&self) -> &str {
        &self.reference.repository
    }
}

/// A directory holding `manifest.json` and blobs named `sha256_<hex>`.
pub struct FolderEndpoint {
    root: PathBuf,
}

impl FolderEndpoint {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root.join(digest.file_name())
    }

    fn manifest_path(&self) -> PathBuf {
        self.root.join(FOLDER_MANIFEST)
    }

    /// Write through a temporary name so readers never see partial files.
    async fn write_atomic(&self, target: &Path, data: &[u8]) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        let tmp = target.with_extension("partial");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, target).await?;
        Ok(())
    }
}

/// Where an image is loaded from or pushed to.
pub enum Endpoint {
    Registry(RegistryEndpoint),
    Folder(FolderEndpoint),
}

impl Endpoint {
    /// `file:<dir>` selects a folder, anything else is an image reference.
    pub fn parse(
        location: &str,
        config: &RegistryConfig,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self> {
        match location.strip_prefix(FOLDER_PREFIX) {
            Some(dir) if dir.is_empty() => Err(HoistError::Config(format!(
                "Folder endpoint '{}' has no path",
                location
            ))),
            Some(dir) => Ok(Endpoint::Folder(FolderEndpoint::new(dir))),
            None => {
                let reference = ImageReference::parse(location)?;
                Ok(Endpoint::Registry(RegistryEndpoint::new(
                    reference,
                    config,
                    credentials,
                )?))
            }
        }
    }

    /// Registry host, for registry endpoints.
    pub fn registry_host(&self) -> Option<&str> {
        match self {
            Endpoint::Registry(r) => Some(r.client.host()),
            Endpoint::Folder(_) => None,
        }
    }

    /// Raw manifest bytes.
    pub async fn load_manifest(&self) -> Result<Vec<u8>> {
        match self {
            Endpoint::Registry(r) => {
                if r.reference.is_untagged() {
                    tracing::warn!(reference = %r.reference, "No tag given, using 'latest'");
                }
                let reference = r.reference.manifest_reference();
                let (bytes, _) = r.client.get_manifest(r.repository(), reference).await?;
                Ok(bytes)
            }
            Endpoint::Folder(f) => {
                let path = f.manifest_path();
                match tokio::fs::read(&path).await {
                    Ok(bytes) => Ok(bytes),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        Err(HoistError::NotFound(path.display().to_string()))
                    }
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    /// Load the manifest and config as an [`Image`].
    pub async fn load_image(&self) -> Result<Image> {
        tracing::info!(source = %self, "Loading image metadata");
        let manifest = self.load_manifest().await?;
        Image::load_metadata(manifest, |digest| async move {
            self.fetch_blob_bytes(&digest).await
        })
        .await
    }

    pub async fn fetch_blob(&self, digest: &Digest) -> Result<BlobStream> {
        match self {
            Endpoint::Registry(r) => r.client.get_blob(r.repository(), digest).await,
            Endpoint::Folder(f) => {
                let path = f.blob_path(digest);
                let file = match tokio::fs::File::open(&path).await {
                    Ok(file) => file,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        return Err(HoistError::NotFound(path.display().to_string()))
                    }
                    Err(e) => return Err(e.into()),
                };
                Ok(ReaderStream::new(file).map_err(HoistError::from).boxed())
            }
        }
    }

    /// Fetch a small blob (a config) fully into memory.
    pub async fn fetch_blob_bytes(&self, digest: &Digest) -> Result<Vec<u8>> {
        let mut stream = self.fetch_blob(digest).await?;
        let mut out = Vec::new();
        while let Some(chunk) = stream.try_next().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    pub async fn blob_exists(&self, digest: &Digest) -> Result<Option<u64>> {
        match self {
            Endpoint::Registry(r) => r.client.blob_exists(r.repository(), digest).await,
            Endpoint::Folder(f) => match tokio::fs::metadata(f.blob_path(digest)).await {
                Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
                _ => Ok(None),
            },
        }
    }

    pub async fn push_blob(&self, digest: &Digest, size: u64, source: &BlobSource) -> Result<()> {
        match self {
            Endpoint::Registry(r) => {
                r.client
                    .push_blob(r.repository(), digest, size, source)
                    .await
            }
            Endpoint::Folder(f) => {
                tokio::fs::create_dir_all(&f.root).await?;
                let target = f.blob_path(digest);
                let tmp = target.with_extension("partial");

                let mut reader = source.reader().await?;
                let mut file = tokio::fs::File::create(&tmp).await?;
                let written = tokio::io::copy(&mut reader, &mut file).await?;
                file.flush().await?;
                drop(file);

                if written != size {
                    let _ = tokio::fs::remove_file(&tmp).await;
                    return Err(HoistError::Consistency(format!(
                        "blob {} is {} bytes, expected {}",
                        digest, written, size
                    )));
                }
                tokio::fs::rename(&tmp, &target).await?;
                Ok(())
            }
        }
    }

    /// Store the manifest and return its digest.
    pub async fn push_manifest(&self, media_type: &str, manifest: &[u8]) -> Result<Digest> {
        match self {
            Endpoint::Registry(r) => {
                r.client
                    .upload_manifest(
                        r.repository(),
                        r.reference.manifest_reference(),
                        media_type,
                        manifest,
                    )
                    .await
            }
            Endpoint::Folder(f) => {
                f.write_atomic(&f.manifest_path(), manifest).await?;
                Ok(sha256_bytes(manifest))
            }
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Registry(r) => write!(f, "{}", r.reference),
            Endpoint::Folder(folder) => write!(f, "{}{}", FOLDER_PREFIX, folder.root.display()),
        }
    }
}

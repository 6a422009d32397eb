//! OCI Distribution API client.
//!
//! One [`RegistryClient`] talks to one registry host. Every request goes
//! through the host's [`AuthTransport`].

use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt, TryStreamExt};
use hoist_core::config::RegistryConfig;
use hoist_core::error::{HoistError, Result};
use reqwest::header::{ACCEPT, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, LOCATION};
use reqwest::{Body, Client, Response, StatusCode, Url};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio_util::io::{ReaderStream, StreamReader};

use super::auth::AuthTransport;
use super::credentials::CredentialProvider;
use super::digest::{sha256_bytes, Digest};
use super::manifest::{Manifest, MANIFEST_MEDIA_TYPE};

/// Lazily-read blob content. Dropping it releases the connection or file.
pub type BlobStream = BoxStream<'static, Result<Bytes>>;

const OCTET_STREAM: &str = "application/octet-stream";

/// Where blob bytes come from when uploading.
///
/// Bytes and files can be read any number of times; a stream only once.
pub enum BlobSource {
    Bytes(Bytes),
    File(PathBuf),
    Stream(Mutex<Option<BlobStream>>),
}

impl BlobSource {
    pub fn stream(stream: BlobStream) -> Self {
        BlobSource::Stream(Mutex::new(Some(stream)))
    }

    fn take_stream(slot: &Mutex<Option<BlobStream>>) -> Result<BlobStream> {
        slot.lock()
            .map_err(|_| HoistError::Other("blob stream lock poisoned".to_string()))?
            .take()
            .ok_or_else(|| HoistError::Other("blob stream already consumed".to_string()))
    }

    /// Request body over the whole blob.
    pub fn body(&self) -> Result<Body> {
        match self {
            BlobSource::Bytes(bytes) => Ok(Body::from(bytes.clone())),
            BlobSource::File(path) => {
                let file = std::fs::File::open(path)?;
                Ok(Body::wrap_stream(ReaderStream::new(
                    tokio::fs::File::from_std(file),
                )))
            }
            BlobSource::Stream(slot) => Ok(channel_body(Self::take_stream(slot)?)),
        }
    }

    /// Sequential reader over the whole blob, for chunked uploads.
    pub async fn reader(&self) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        match self {
            BlobSource::Bytes(bytes) => Ok(Box::new(std::io::Cursor::new(bytes.clone()))),
            BlobSource::File(path) => Ok(Box::new(tokio::fs::File::open(path).await?)),
            BlobSource::Stream(slot) => {
                let stream = Self::take_stream(slot)?
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
                Ok(Box::new(StreamReader::new(stream)))
            }
        }
    }
}

/// Client for the `/v2/` API of a single registry host.
pub struct RegistryClient {
    transport: AuthTransport,
    base: Url,
    chunk_size: usize,
}

impl RegistryClient {
    /// Create a client for `host` (e.g. `ghcr.io`, `localhost:5000`).
    pub fn new(
        host: &str,
        config: &RegistryConfig,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self> {
        let base = Url::parse(&format!("{}://{}/", config.scheme(), host)).map_err(|e| {
            HoistError::Config(format!("Invalid registry host '{}': {}", host, e))
        })?;
        let client = Client::builder()
            .danger_accept_invalid_certs(config.skip_tls_verify)
            .user_agent(concat!("hoist/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            transport: AuthTransport::new(client, host, credentials),
            base,
            chunk_size: config.chunk_size,
        })
    }

    /// Registry host this client talks to.
    pub fn host(&self) -> &str {
        self.transport.registry()
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    pub fn transport(&self) -> &AuthTransport {
        &self.transport
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|e| HoistError::Parse(format!("Invalid registry path '{}': {}", path, e)))
    }

    /// Fetch a manifest, returning its exact bytes and the parsed document.
    pub async fn get_manifest(&self, name: &str, reference: &str) -> Result<(Vec<u8>, Manifest)> {
        let url = self.url(&format!("v2/{}/manifests/{}", name, reference))?;
        tracing::debug!(%url, "Fetching manifest");

        let response = self
            .transport
            .send(|c| Ok(c.get(url.clone()).header(ACCEPT, MANIFEST_MEDIA_TYPE)))
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(HoistError::NotFound(format!(
                "{}/{}:{}",
                self.host(),
                name,
                reference
            )));
        }
        let response = self.ensure_success(response).await?;

        let bytes = response.bytes().await?.to_vec();
        let manifest: Manifest = serde_json::from_slice(&bytes)?;
        Ok((bytes, manifest))
    }

    /// Open a blob for streaming.
    pub async fn get_blob(&self, name: &str, digest: &Digest) -> Result<BlobStream> {
        let url = self.url(&format!("v2/{}/blobs/{}", name, digest))?;
        tracing::debug!(%url, "Fetching blob");

        let response = self.transport.send(|c| Ok(c.get(url.clone()))).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(HoistError::NotFound(format!(
                "{}/{}@{}",
                self.host(),
                name,
                digest
            )));
        }
        let response = self.ensure_success(response).await?;
        Ok(response.bytes_stream().map_err(HoistError::from).boxed())
    }

    /// Size of the blob if the registry has it. Non-2xx answers mean absent.
    pub async fn blob_exists(&self, name: &str, digest: &Digest) -> Result<Option<u64>> {
        let url = self.url(&format!("v2/{}/blobs/{}", name, digest))?;
        let response = self.transport.send(|c| Ok(c.head(url.clone()))).await?;
        if !response.status().is_success() {
            tracing::debug!(%digest, status = %response.status(), "Blob not present");
            return Ok(None);
        }
        let size = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        Ok(Some(size))
    }

    /// Open an upload session and return its location.
    pub async fn start_upload(&self, name: &str) -> Result<Url> {
        let url = self.url(&format!("v2/{}/blobs/uploads/", name))?;
        let response = self
            .transport
            .send(|c| Ok(c.post(url.clone()).header(CONTENT_LENGTH, 0)))
            .await?;
        let response = self.ensure_success(response).await?;
        self.location(&response)
    }

    /// Upload a whole blob with a single PUT.
    ///
    /// `body` is invoked for every attempt the transport makes.
    pub async fn upload_blob<F>(&self, location: &Url, digest: &Digest, size: u64, body: F) -> Result<()>
    where
        F: Fn() -> Result<Body>,
    {
        let url = with_digest(location, digest);
        tracing::debug!(%digest, size, "Uploading blob");

        let response = self
            .transport
            .send(|c| {
                Ok(c.put(url.clone())
                    .header(CONTENT_TYPE, OCTET_STREAM)
                    .header(CONTENT_LENGTH, size)
                    .body(body()?))
            })
            .await?;
        self.ensure_success(response).await?;
        Ok(())
    }

    /// Upload a blob as a series of PATCH requests followed by a closing PUT.
    pub async fn upload_blob_chunked<R>(
        &self,
        location: Url,
        digest: &Digest,
        mut reader: R,
        chunk_size: usize,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let chunk_size = chunk_size.max(1);
        let mut buf = vec![0u8; chunk_size];
        let mut location = location;
        let mut offset: u64 = 0;

        loop {
            let filled = read_full(&mut reader, &mut buf).await?;
            if filled == 0 {
                break;
            }
            let chunk = Bytes::copy_from_slice(&buf[..filled]);
            let end = offset + filled as u64 - 1;
            tracing::debug!(%digest, start = offset, end, "Uploading chunk");

            let url = location.clone();
            let response = self
                .transport
                .send(|c| {
                    Ok(c.patch(url.clone())
                        .header(CONTENT_TYPE, OCTET_STREAM)
                        .header(CONTENT_LENGTH, filled)
                        .header(CONTENT_RANGE, format!("{}-{}", offset, end))
                        .body(chunk.clone()))
                })
                .await?;
            let response = self.ensure_success(response).await?;
            // Servers may keep the session at the same location
            if response.headers().contains_key(LOCATION) {
                location = self.location(&response)?;
            }
            offset = end + 1;

            if filled < chunk_size {
                break;
            }
        }

        let url = with_digest(&location, digest);
        let response = self
            .transport
            .send(|c| Ok(c.put(url.clone()).header(CONTENT_LENGTH, 0)))
            .await?;
        self.ensure_success(response).await?;
        Ok(())
    }

    /// Ask the registry to link a blob from another repository on the same host.
    ///
    /// Only `201 Created` counts; a `202 Accepted` means the registry opened
    /// a plain upload session instead.
    pub async fn mount_blob(&self, name: &str, digest: &Digest, from: &str) -> Result<()> {
        let mut url = self.url(&format!("v2/{}/blobs/uploads/", name))?;
        url.query_pairs_mut()
            .append_pair("mount", &digest.to_string())
            .append_pair("from", from);

        let response = self
            .transport
            .send(|c| Ok(c.post(url.clone()).header(CONTENT_LENGTH, 0)))
            .await?;
        let status = response.status();
        if status == StatusCode::CREATED {
            tracing::debug!(%digest, from, "Blob mounted");
            return Ok(());
        }
        if status == StatusCode::UNAUTHORIZED {
            let body = response.text().await.unwrap_or_default();
            return Err(self.unauthorized(&body));
        }
        Err(HoistError::MountFailed {
            digest: digest.to_string(),
            from: from.to_string(),
            message: format!("registry answered {}", status),
        })
    }

    /// Upload a manifest and return its digest.
    ///
    /// The registry's `Docker-Content-Digest` wins over the local hash.
    pub async fn upload_manifest(
        &self,
        name: &str,
        reference: &str,
        media_type: &str,
        manifest: &[u8],
    ) -> Result<Digest> {
        let url = self.url(&format!("v2/{}/manifests/{}", name, reference))?;
        let body = Bytes::copy_from_slice(manifest);
        tracing::debug!(%url, "Uploading manifest");

        let response = self
            .transport
            .send(|c| {
                Ok(c.put(url.clone())
                    .header(CONTENT_TYPE, media_type)
                    .body(body.clone()))
            })
            .await?;
        let response = self.ensure_success(response).await?;

        let reported = response
            .headers()
            .get("Docker-Content-Digest")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<Digest>().ok());
        Ok(reported.unwrap_or_else(|| sha256_bytes(manifest)))
    }

    /// Upload a blob, chunked when the client is configured with a chunk size.
    pub async fn push_blob(
        &self,
        name: &str,
        digest: &Digest,
        size: u64,
        source: &BlobSource,
    ) -> Result<()> {
        let location = self.start_upload(name).await?;
        if self.chunk_size == 0 {
            self.upload_blob(&location, digest, size, || source.body())
                .await
        } else {
            let reader = source.reader().await?;
            self.upload_blob_chunked(location, digest, reader, self.chunk_size)
                .await
        }
    }

    /// Pass 2xx responses through. A `401` still standing after negotiation
    /// is an authentication failure; anything else is a protocol error.
    async fn ensure_success(&self, response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::UNAUTHORIZED {
            return Err(self.unauthorized(&body));
        }
        Err(HoistError::Protocol {
            status: status.as_u16(),
            body,
        })
    }

    fn unauthorized(&self, body: &str) -> HoistError {
        HoistError::Auth {
            registry: self.host().to_string(),
            message: format!("registry still answers 401 Unauthorized: {}", body),
        }
    }

    fn location(&self, response: &Response) -> Result<Url> {
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| HoistError::Protocol {
                status: response.status().as_u16(),
                body: "upload response has no Location header".to_string(),
            })?;
        // Relative locations resolve against the registry base
        self.base.join(location).map_err(|e| {
            HoistError::Parse(format!("Invalid upload location '{}': {}", location, e))
        })
    }
}

/// Request bodies must be `Sync`; pump the stream through a channel so any
/// `Send` stream qualifies.
fn channel_body(mut stream: BlobStream) -> Body {
    let (tx, rx) = mpsc::channel(4);
    tokio::spawn(async move {
        while let Some(item) = stream.next().await {
            let failed = item.is_err();
            if tx.send(item).await.is_err() || failed {
                break;
            }
        }
    });
    Body::wrap_stream(ChannelStream(rx))
}

struct ChannelStream(mpsc::Receiver<Result<Bytes>>);

impl Stream for ChannelStream {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.0.poll_recv(cx)
    }
}

fn with_digest(location: &Url, digest: &Digest) -> Url {
    let mut url = location.clone();
    url.query_pairs_mut()
        .append_pair("digest", &digest.to_string());
    url
}


/// Read until `buf` is full or the reader is exhausted.
async fn read_full<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::credentials::Anonymous;

    fn client(insecure: bool) -> RegistryClient {
        let config = RegistryConfig {
            insecure,
            ..Default::default()
        };
        RegistryClient::new("localhost:5000", &config, Arc::new(Anonymous)).unwrap()
    }

    #[test]
    fn test_base_url_scheme() {
        assert_eq!(client(true).base_url().as_str(), "http://localhost:5000/");
        assert_eq!(client(false).base_url().as_str(), "https://localhost:5000/");
    }

    #[test]
    fn test_with_digest_keeps_existing_query() {
        let location = Url::parse("https://r.example.com/v2/app/blobs/uploads/abc?_state=xyz").unwrap();
        let digest = sha256_bytes(b"x");
        let url = with_digest(&location, &digest);
        assert_eq!(
            url.as_str(),
            format!(
                "https://r.example.com/v2/app/blobs/uploads/abc?_state=xyz&digest=sha256%3A{}",
                digest.hex()
            )
        );
    }

    #[tokio::test]
    async fn test_read_full_across_short_reads() {
        let data = b"abcdefghij".to_vec();
        let mut reader = tokio::io::BufReader::with_capacity(3, &data[..]);
        let mut buf = [0u8; 4];
        assert_eq!(read_full(&mut reader, &mut buf).await.unwrap(), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(read_full(&mut reader, &mut buf).await.unwrap(), 4);
        assert_eq!(read_full(&mut reader, &mut buf).await.unwrap(), 2);
        assert_eq!(read_full(&mut reader, &mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stream_source_is_one_shot() {
        let stream = futures::stream::iter(vec![Ok(Bytes::from_static(b"abc"))]).boxed();
        let source = BlobSource::stream(stream);
        assert!(source.body().is_ok());
        assert!(source.body().is_err());
    }

    #[tokio::test]
    async fn test_stream_source_reader() {
        let stream = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"ab")),
            Ok(Bytes::from_static(b"cd")),
        ])
        .boxed();
        let source = BlobSource::stream(stream);
        let mut reader = source.reader().await.unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"abcd");
    }
}

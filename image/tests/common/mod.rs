//! Shared fixtures: a small base image served by a mock registry.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use hoist_core::config::RegistryConfig;
use hoist_image::oci::credentials::Anonymous;
use hoist_image::oci::digest::{sha256_bytes, Digest};
use hoist_image::oci::manifest::{DOCKER_CONFIG_MEDIA_TYPE, LAYER_MEDIA_TYPE, MANIFEST_MEDIA_TYPE};
use hoist_image::{Endpoint, Layer, LayerBuilder};
use serde_json::json;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

/// Manifest, config and one layer blob, possibly listed several times.
pub struct BaseImage {
    pub manifest: Vec<u8>,
    pub config: Vec<u8>,
    pub config_digest: Digest,
    pub layer: Vec<u8>,
    pub layer_digest: Digest,
}

impl BaseImage {
    pub fn new() -> Self {
        Self::with_repeated_layer(1)
    }

    pub fn with_repeated_layer(copies: usize) -> Self {
        let layer = b"base layer contents".to_vec();
        let layer_digest = sha256_bytes(&layer);
        let diff_id = sha256_bytes(b"base layer diff");

        let config = serde_json::to_vec(&json!({
            "architecture": "amd64",
            "os": "linux",
            "config": { "Cmd": ["/bin/sh"] },
            "rootfs": {
                "type": "layers",
                "diff_ids": vec![diff_id.to_string(); copies],
            },
            "history": [{ "created": "2024-01-01T00:00:00Z", "created_by": "ADD rootfs.tar /" }],
        }))
        .unwrap();
        let config_digest = sha256_bytes(&config);

        let layers: Vec<_> = (0..copies)
            .map(|_| {
                json!({
                    "mediaType": LAYER_MEDIA_TYPE,
                    "size": layer.len(),
                    "digest": layer_digest.to_string(),
                })
            })
            .collect();
        let manifest = serde_json::to_vec(&json!({
            "schemaVersion": 2,
            "mediaType": MANIFEST_MEDIA_TYPE,
            "config": {
                "mediaType": DOCKER_CONFIG_MEDIA_TYPE,
                "size": config.len(),
                "digest": config_digest.to_string(),
            },
            "layers": layers,
        }))
        .unwrap();

        Self {
            manifest,
            config,
            config_digest,
            layer,
            layer_digest,
        }
    }

    /// Serve manifest and blobs under `repo:tag`.
    pub async fn serve(&self, server: &MockServer, repo: &str, tag: &str) {
        Mock::given(method("GET"))
            .and(path(format!("/v2/{}/manifests/{}", repo, tag)))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(self.manifest.clone()))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/v2/{}/blobs/{}", repo, self.config_digest)))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(self.config.clone()))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/v2/{}/blobs/{}", repo, self.layer_digest)))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(self.layer.clone()))
            .mount(server)
            .await;
    }
}

/// Destination that has no blobs and accepts every upload and manifest.
pub async fn accept_uploads(server: &MockServer, repo: &str) {
    Mock::given(method("HEAD"))
        .and(path_regex(format!("^/v2/{}/blobs/", repo)))
        .respond_with(ResponseTemplate::new(404))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("/v2/{}/blobs/uploads/", repo)))
        .respond_with(
            ResponseTemplate::new(202)
                .insert_header("Location", format!("/v2/{}/blobs/uploads/session", repo)),
        )
        .mount(server)
        .await;
    Mock::given(method("PUT"))
        .and(path(format!("/v2/{}/blobs/uploads/session", repo)))
        .respond_with(ResponseTemplate::new(201))
        .mount(server)
        .await;
    Mock::given(method("PUT"))
        .and(path_regex(format!("^/v2/{}/manifests/", repo)))
        .respond_with(ResponseTemplate::new(201))
        .mount(server)
        .await;
}

pub fn host(server: &MockServer) -> String {
    server.address().to_string()
}

pub fn insecure() -> RegistryConfig {
    RegistryConfig {
        insecure: true,
        ..Default::default()
    }
}

/// Anonymous registry endpoint for `repo_ref` (e.g. `app:v1`) on `server`.
pub fn registry(server: &MockServer, repo_ref: &str) -> Endpoint {
    Endpoint::parse(
        &format!("{}/{}", host(server), repo_ref),
        &insecure(),
        Arc::new(Anonymous),
    )
    .unwrap()
}

/// A small real layer holding one empty directory.
pub fn build_layer(dir: &Path) -> Layer {
    let mut builder = LayerBuilder::new(dir, true).unwrap();
    builder.add_bare_folder("/data", None).unwrap();
    builder.finish("data").unwrap()
}

/// Number of received requests with this method whose path matches exactly.
pub fn count(requests: &[Request], method: &str, path: &str) -> usize {
    requests
        .iter()
        .filter(|r| r.method.as_str() == method && r.url.path() == path)
        .count()
}

/// Received uploads (closing PUTs) of `digest`.
pub fn uploads_of(requests: &[Request], digest: &Digest) -> usize {
    let digest = digest.to_string();
    requests
        .iter()
        .filter(|r| r.method.as_str() == "PUT")
        .filter(|r| r.url.query_pairs().any(|(k, v)| k == "digest" && v == digest))
        .count()
}

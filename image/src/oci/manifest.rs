//! Manifest and image configuration documents.
//!
//! Fields hoist does not model are kept in `extra` maps so a base image's
//! documents survive a parse/serialize cycle intact.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::digest::Digest;

/// Docker v2 schema 2 manifest.
pub const MANIFEST_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// OCI image config.
pub const OCI_CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";

/// Legacy Docker image config, accepted on load.
pub const DOCKER_CONFIG_MEDIA_TYPE: &str = "application/vnd.docker.container.image.v1+json";

/// Gzipped tar layer.
pub const LAYER_MEDIA_TYPE: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

/// Content descriptor: a typed, sized pointer to a blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub size: u64,
    pub digest: Digest,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Descriptor {
    pub fn new(media_type: impl Into<String>, digest: Digest, size: u64) -> Self {
        Self {
            media_type: media_type.into(),
            size,
            digest,
            extra: Map::new(),
        }
    }
}

/// Image manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: u32,
    #[serde(default = "default_manifest_media_type")]
    pub media_type: String,
    pub config: Descriptor,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_manifest_media_type() -> String {
    MANIFEST_MEDIA_TYPE.to_string()
}

/// Whether a config descriptor's media type is one hoist can edit.
pub fn is_supported_config_media_type(media_type: &str) -> bool {
    media_type == OCI_CONFIG_MEDIA_TYPE || media_type == DOCKER_CONFIG_MEDIA_TYPE
}

/// Image configuration document (the config blob).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    pub architecture: String,
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<RuntimeConfig>,
    pub rootfs: RootFs,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<History>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Runtime defaults of the container.
///
/// Every field is optional: `None` means unset, `Some(empty)` is an explicit
/// empty value and is serialized as such.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RuntimeConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exposed_ports: Option<BTreeMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Root filesystem: ordered uncompressed layer digests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub diff_ids: Vec<Digest>,
}

/// One entry of the image history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct History {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub empty_layer: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"{
        "schemaVersion": 2,
        "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
        "config": {
            "mediaType": "application/vnd.docker.container.image.v1+json",
            "size": 1469,
            "digest": "sha256:e4c58958181a5925816faa528ce959e487632f4cfd192f8132f71b32df2744b4"
        },
        "layers": [{
            "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
            "size": 2811478,
            "digest": "sha256:59bf1c3509f33515622619af21ed55bbe26d24913cedbca106468a5fb37a50c3",
            "urls": ["https://example.com/layer"]
        }]
    }"#;

    const CONFIG: &str = r#"{
        "architecture": "amd64",
        "os": "linux",
        "config": {
            "Env": ["PATH=/usr/bin"],
            "Cmd": ["/bin/sh"],
            "Labels": {},
            "OnBuild": null
        },
        "rootfs": {
            "type": "layers",
            "diff_ids": ["sha256:8d3ac3489996423f53d6087c81180006263b79f206d3fdec9e66f0e27ceb8759"]
        },
        "history": [{"created": "2024-01-01T00:00:00Z", "created_by": "ADD rootfs.tar /"}],
        "docker_version": "20.10.7"
    }"#;

    #[test]
    fn test_parse_manifest() {
        let manifest: Manifest = serde_json::from_str(MANIFEST).unwrap();
        assert_eq!(manifest.schema_version, 2);
        assert_eq!(manifest.media_type, MANIFEST_MEDIA_TYPE);
        assert_eq!(manifest.config.size, 1469);
        assert_eq!(manifest.layers.len(), 1);
        assert!(manifest.layers[0].extra.contains_key("urls"));
    }

    #[test]
    fn test_manifest_keeps_unknown_fields() {
        let manifest: Manifest = serde_json::from_str(MANIFEST).unwrap();
        let json = serde_json::to_string(&manifest).unwrap();
        assert!(json.contains("\"urls\":[\"https://example.com/layer\"]"));
    }

    #[test]
    fn test_parse_config() {
        let config: ImageConfig = serde_json::from_str(CONFIG).unwrap();
        assert_eq!(config.architecture, "amd64");
        let runtime = config.config.as_ref().unwrap();
        assert_eq!(runtime.cmd, Some(vec!["/bin/sh".to_string()]));
        assert_eq!(runtime.entrypoint, None);
        assert_eq!(runtime.labels, Some(BTreeMap::new()));
        assert_eq!(config.rootfs.diff_ids.len(), 1);
        assert_eq!(config.history.len(), 1);
        assert!(config.extra.contains_key("docker_version"));
    }

    #[test]
    fn test_config_unset_vs_empty() {
        let config: ImageConfig = serde_json::from_str(CONFIG).unwrap();
        let json = serde_json::to_string(&config).unwrap();
        // Explicit empty labels survive, unset entrypoint stays absent
        assert!(json.contains("\"Labels\":{}"));
        assert!(!json.contains("Entrypoint"));
        assert!(json.contains("\"OnBuild\":null"));
    }

    #[test]
    fn test_history_empty_layer_serialization() {
        let entry = History {
            created_by: Some("LABEL a=b".to_string()),
            empty_layer: true,
            ..Default::default()
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert_eq!(json, r#"{"created_by":"LABEL a=b","empty_layer":true}"#);

        let layer = History {
            created_by: Some("ADD . /app".to_string()),
            ..Default::default()
        };
        assert!(!serde_json::to_string(&layer).unwrap().contains("empty_layer"));
    }

    #[test]
    fn test_supported_config_media_types() {
        assert!(is_supported_config_media_type(OCI_CONFIG_MEDIA_TYPE));
        assert!(is_supported_config_media_type(DOCKER_CONFIG_MEDIA_TYPE));
        assert!(!is_supported_config_media_type("application/json"));
    }
}

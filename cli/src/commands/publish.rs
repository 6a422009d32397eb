//! `hoist publish` command: build layers on top of a base image and push it.
//!
//! Each `--add` becomes one layer; all `--add-folder` entries share one more.
//! Layers are written to a scratch directory that is itself never archived.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Args;
use hoist_core::config::{
    LayerConfig, PushConfig, RegistryConfig, DEFAULT_IGNORE_FILE, DEFAULT_RETRY_ATTEMPTS,
};
use hoist_image::oci::ignore::NoIgnore;
use hoist_image::oci::{history_timestamp, CredentialProvider};
use hoist_image::{
    AddSpec, CredentialChain, Endpoint, FolderSpec, Layer, LayerAction, LayerBuilder, Pusher,
    SourceFilter,
};
use tokio_util::sync::CancellationToken;

#[derive(Args)]
pub struct PublishArgs {
    /// Base image: a registry reference or `file:<dir>`
    #[arg(long)]
    pub from: String,

    /// Destination: a registry reference or `file:<dir>`
    #[arg(long)]
    pub to: String,

    /// Add files as a new layer (SRC:DEST[:UID:GID:MODE]), can be repeated
    #[arg(long = "add", value_name = "SRC:DEST[:UID:GID:MODE]")]
    pub add: Vec<String>,

    /// Create an empty directory (DEST[:UID:GID:MODE]), can be repeated
    #[arg(long = "add-folder", value_name = "DEST[:UID:GID:MODE]")]
    pub add_folder: Vec<String>,

    /// Set a label (KEY=VALUE), can be repeated
    #[arg(long = "label")]
    pub label: Vec<String>,

    /// Set an environment variable (KEY=VALUE), can be repeated
    #[arg(long = "env")]
    pub env: Vec<String>,

    /// Working directory of the container
    #[arg(long)]
    pub workdir: Option<String>,

    /// User the container runs as
    #[arg(long)]
    pub user: Option<String>,

    /// Default command
    #[arg(long, num_args = 1.., allow_hyphen_values = true)]
    pub cmd: Option<Vec<String>>,

    /// Entrypoint
    #[arg(long, num_args = 1.., allow_hyphen_values = true)]
    pub entrypoint: Option<Vec<String>>,

    /// Use plain HTTP for registries
    #[arg(long)]
    pub insecure: bool,

    /// Accept invalid TLS certificates
    #[arg(long)]
    pub skip_tls_verify: bool,

    /// Show what would be pushed without pushing
    #[arg(long)]
    pub dry_run: bool,

    /// Write the pushed manifest digest to this file
    #[arg(long)]
    pub digest_file: Option<PathBuf>,

    /// Ignore file looked up in each added directory
    #[arg(long, default_value = DEFAULT_IGNORE_FILE)]
    pub ignore_file: String,

    /// Keep real file timestamps instead of a fixed one
    #[arg(long)]
    pub no_reproducible: bool,

    /// Upload blobs in chunks of this many bytes (0 = single request)
    #[arg(long, default_value_t = 0)]
    pub chunk_size: usize,

    /// Pull a blob from the source and retry once when a mount is rejected
    #[arg(long)]
    pub mount_fallback: bool,

    /// Keep built layers in this directory instead of a temporary one
    #[arg(long)]
    pub layer_dir: Option<PathBuf>,

    /// Attempts per upload, mount and manifest push
    #[arg(long, default_value_t = DEFAULT_RETRY_ATTEMPTS)]
    pub retries: u32,
}

pub async fn execute(args: PublishArgs) -> Result<(), Box<dyn std::error::Error>> {
    let adds = args
        .add
        .iter()
        .map(|a| AddSpec::parse(a).map(|spec| (a.clone(), spec)))
        .collect::<Result<Vec<_>, _>>()?;
    let folders = args
        .add_folder
        .iter()
        .map(|a| FolderSpec::parse(a))
        .collect::<Result<Vec<_>, _>>()?;
    let labels = parse_pairs("label", &args.label)?;
    let env = parse_pairs("env", &args.env)?;

    let registry_config = RegistryConfig {
        insecure: args.insecure,
        skip_tls_verify: args.skip_tls_verify,
        chunk_size: args.chunk_size,
    };
    let push_config = PushConfig {
        dry_run: args.dry_run,
        retry_attempts: args.retries,
        mount_fallback: args.mount_fallback,
        digest_file: args.digest_file.clone(),
    };

    // The temporary directory is removed when this guard drops
    let (layer_dir, _scratch) = match args.layer_dir {
        Some(ref dir) => {
            std::fs::create_dir_all(dir)?;
            (std::fs::canonicalize(dir)?, None)
        }
        None => {
            let tmp = tempfile::Builder::new().prefix("hoist-layers-").tempdir()?;
            (tmp.path().to_path_buf(), Some(tmp))
        }
    };
    tracing::debug!(layer_dir = %layer_dir.display(), "Using layer directory");
    let layer_config = LayerConfig {
        reproducible: !args.no_reproducible,
        ignore_file: args.ignore_file.clone(),
        exclude: vec![layer_dir.clone()],
    };

    let credentials: Arc<dyn CredentialProvider> = Arc::new(CredentialChain::standard());
    let source = Endpoint::parse(&args.from, &registry_config, credentials.clone())?;
    let destination = Endpoint::parse(&args.to, &registry_config, credentials)?;

    let mut image = source.load_image().await?;
    image.set_history_time(Some(history_timestamp(layer_config.reproducible)));

    let output_dir = layer_dir.clone();
    let layers = tokio::task::spawn_blocking(move || {
        build_layers(&adds, &folders, &output_dir, &layer_config)
    })
    .await??;
    for (layer, created_by) in layers {
        tracing::info!(layer = %created_by, digest = %layer.digest, size = layer.size, "Adding layer");
        image.add_layer(layer, &created_by)?;
    }

    let has_config_changes = !labels.is_empty()
        || !env.is_empty()
        || args.workdir.is_some()
        || args.user.is_some()
        || args.cmd.is_some()
        || args.entrypoint.is_some();
    if has_config_changes {
        image.edit_config(|c| {
            for (key, value) in &labels {
                c.set_label(key, value);
                c.add_history(&format!("LABEL {}={}", key, value), true);
            }
            for (key, value) in &env {
                c.set_env(key, value);
                c.add_history(&format!("ENV {}={}", key, value), true);
            }
            if let Some(ref dir) = args.workdir {
                c.set_working_dir(dir);
                c.add_history(&format!("WORKDIR {}", dir), true);
            }
            if let Some(ref user) = args.user {
                c.set_user(user);
                c.add_history(&format!("USER {}", user), true);
            }
            if let Some(ref entrypoint) = args.entrypoint {
                c.set_entrypoint(entrypoint.clone());
                c.add_history(&format!("ENTRYPOINT {:?}", entrypoint), true);
            }
            if let Some(ref cmd) = args.cmd {
                c.set_cmd(cmd.clone());
                c.add_history(&format!("CMD {:?}", cmd), true);
            }
        })?;
    }

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let report = Pusher::new(&source, &destination, push_config)
        .with_cancellation(cancel)
        .push(&image)
        .await?;

    tracing::info!(
        destination = %report.destination,
        digest = %report.manifest_digest,
        dry_run = report.dry_run,
        "Publish finished"
    );
    if report.dry_run {
        println!("Dry run: {} would be pushed to {}", report.manifest_digest, report.destination);
        if report.config_uploaded {
            println!("  config  {}  upload", image.config_digest());
        }
        for (digest, action) in &report.layers {
            println!("  layer   {}  {}", digest, action);
        }
    } else {
        println!(
            "Pushed {}@{} ({} uploaded, {} mounted, {} copied, {} present)",
            report.destination,
            report.manifest_digest,
            report.count(LayerAction::Upload),
            report.count(LayerAction::Mount),
            report.count(LayerAction::Copy),
            report.count(LayerAction::Present),
        );
    }

    Ok(())
}

/// Build one layer per add operation and one for all bare folders.
///
/// Each add is paired with its argument as typed, which becomes the layer's
/// history entry.
fn build_layers(
    adds: &[(String, AddSpec)],
    folders: &[FolderSpec],
    output_dir: &Path,
    config: &LayerConfig,
) -> hoist_core::Result<Vec<(Layer, String)>> {
    let mut layers = Vec::with_capacity(adds.len() + 1);

    for (arg, spec) in adds {
        let filter = if spec.source.is_dir() {
            SourceFilter::load(&spec.source, &config.ignore_file, &config.exclude)?
        } else {
            SourceFilter::new(Box::new(NoIgnore), None, &config.exclude)
        };
        let mut builder = LayerBuilder::new(output_dir, config.reproducible)?;
        builder.add_tree(
            &spec.source,
            &spec.destination,
            spec.ownership.as_ref(),
            &filter,
        )?;
        let created_by = format!("hoist add {}", arg);
        layers.push((builder.finish(&created_by)?, created_by));
    }

    if !folders.is_empty() {
        let mut builder = LayerBuilder::new(output_dir, config.reproducible)?;
        for folder in folders {
            builder.add_bare_folder(&folder.destination, folder.ownership.as_ref())?;
        }
        let created_by = format!(
            "hoist add-folder {}",
            folders
                .iter()
                .map(|f| f.destination.as_str())
                .collect::<Vec<_>>()
                .join(" ")
        );
        layers.push((builder.finish(&created_by)?, created_by));
    }

    Ok(layers)
}

/// Parse KEY=VALUE pairs, keeping their order.
fn parse_pairs(kind: &str, args: &[String]) -> Result<Vec<(String, String)>, String> {
    args.iter()
        .map(|arg| {
            arg.split_once('=')
                .filter(|(key, _)| !key.is_empty())
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| format!("Invalid {} (expected KEY=VALUE): {}", kind, arg))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{Cli, Command};
    use clap::Parser;
    use std::fs;
    use tempfile::TempDir;

    fn add(arg: &str) -> (String, AddSpec) {
        (arg.to_string(), AddSpec::parse(arg).unwrap())
    }

    #[test]
    fn test_parse_pairs_valid() {
        let args = vec!["a=1".to_string(), "b=x=y".to_string(), "c=".to_string()];
        let pairs = parse_pairs("label", &args).unwrap();
        assert_eq!(
            pairs,
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "x=y".to_string()),
                ("c".to_string(), String::new()),
            ]
        );
    }

    #[test]
    fn test_parse_pairs_invalid() {
        assert!(parse_pairs("env", &["NOEQUALS".to_string()]).is_err());
        assert!(parse_pairs("env", &["=value".to_string()]).is_err());
    }

    #[test]
    fn test_publish_args() {
        let cli = Cli::try_parse_from([
            "hoist",
            "publish",
            "--from",
            "mcr.microsoft.com/dotnet/aspnet:8.0",
            "--to",
            "file:out",
            "--add",
            "./publish:/app:1001:0:755",
            "--add-folder",
            "/tmp",
            "--label",
            "a=b",
            "--dry-run",
            "--entrypoint",
            "dotnet",
            "app.dll",
        ])
        .unwrap();
        let Command::Publish(args) = cli.command else {
            panic!("expected publish");
        };
        assert_eq!(args.add, vec!["./publish:/app:1001:0:755"]);
        assert_eq!(
            args.entrypoint,
            Some(vec!["dotnet".to_string(), "app.dll".to_string()])
        );
        assert!(args.dry_run);
        assert_eq!(args.ignore_file, DEFAULT_IGNORE_FILE);
        assert_eq!(args.retries, DEFAULT_RETRY_ATTEMPTS);
        assert_eq!(args.chunk_size, 0);
    }

    #[test]
    fn test_build_layers_one_per_add_plus_folders() {
        let src = TempDir::new().unwrap();
        fs::write(src.path().join("app.dll"), b"binary").unwrap();
        fs::write(src.path().join("notes.md"), b"docs").unwrap();
        let out = TempDir::new().unwrap();

        let adds = vec![
            add(&format!("{}:/app", src.path().display())),
            add(&format!("{}:/docs/", src.path().join("notes.md").display())),
        ];
        let folders = vec![
            FolderSpec::parse("/data:1000:1000:700").unwrap(),
            FolderSpec::parse("/cache").unwrap(),
        ];
        let config = LayerConfig {
            exclude: vec![out.path().to_path_buf()],
            ..Default::default()
        };

        let layers = build_layers(&adds, &folders, out.path(), &config).unwrap();
        assert_eq!(layers.len(), 3);
        assert_eq!(layers[0].1, format!("hoist add {}:/app", src.path().display()));
        assert_eq!(layers[2].1, "hoist add-folder /data /cache");
        for (layer, _) in &layers {
            assert!(layer.path.starts_with(out.path()));
            assert!(layer.path.is_file());
        }
    }

    #[test]
    fn test_build_layers_is_reproducible() {
        let src = TempDir::new().unwrap();
        fs::create_dir(src.path().join("bin")).unwrap();
        fs::write(src.path().join("bin/run"), b"#!/bin/sh").unwrap();
        let config = LayerConfig::default();
        let adds = vec![add(&format!("{}:/app", src.path().display()))];

        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        let a = build_layers(&adds, &[], first.path(), &config).unwrap();
        let b = build_layers(&adds, &[], second.path(), &config).unwrap();
        assert_eq!(a[0].0.digest, b[0].0.digest);
        assert_eq!(a[0].0.diff_id, b[0].0.diff_id);
    }

    #[test]
    fn test_build_layers_skips_scratch_dir() {
        let src = TempDir::new().unwrap();
        fs::write(src.path().join("a.txt"), b"a").unwrap();
        let scratch = src.path().join(".hoist");
        fs::create_dir(&scratch).unwrap();

        let config = LayerConfig {
            exclude: vec![scratch.clone()],
            ..Default::default()
        };
        let adds = vec![add(&format!("{}:/app", src.path().display()))];
        let layers = build_layers(&adds, &[], &scratch, &config).unwrap();

        // Rebuilding with the first layer present in the scratch dir changes nothing
        let again = build_layers(&adds, &[], &scratch, &config).unwrap();
        assert_eq!(layers[0].0.digest, again[0].0.digest);
    }

    #[test]
    fn test_history_records_add_argument_as_typed() {
        // Relative to the package root, where tests run
        let out = TempDir::new().unwrap();
        let config = LayerConfig {
            exclude: vec![out.path().to_path_buf()],
            ..Default::default()
        };
        let adds = vec![add("src/commands:/app:1000:1000:644")];

        let layers = build_layers(&adds, &[], out.path(), &config).unwrap();
        assert_eq!(layers[0].1, "hoist add src/commands:/app:1000:1000:644");
        assert_eq!(layers[0].0.name, layers[0].1);
    }
}

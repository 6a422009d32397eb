//! Layer creation.
//!
//! Walks source trees into a tar stream, gzips it and writes it to disk in a
//! single pass. The tar bytes are hashed on their way into the compressor
//! (diffID) and the gzip bytes on their way to the file (blob digest), so
//! both digests are known without reading the tree or the archive twice.
//!
//! In reproducible mode every entry carries the same mtime and directory
//! entries are visited in name order, so identical inputs give identical bytes.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use hoist_core::error::{HoistError, Result};
use tempfile::NamedTempFile;

use super::digest::{Digest, HashingWriter};
use super::ignore::SourceFilter;

/// 2000-01-01T00:00:00Z, the mtime of every entry in reproducible mode.
pub const REPRODUCIBLE_MTIME: u64 = 946_684_800;

/// Mode used when the host cannot report POSIX permissions.
pub const DEFAULT_MODE: u32 = 0o755;

const S_IFREG: u32 = 0o100000;
const S_IFDIR: u32 = 0o040000;

/// A built layer file.
#[derive(Debug, Clone, PartialEq)]
pub struct Layer {
    /// Human-readable name (the operation that produced it)
    pub name: String,
    /// Digest of the compressed blob
    pub digest: Digest,
    /// Digest of the uncompressed tar
    pub diff_id: Digest,
    /// Size of the compressed blob in bytes
    pub size: u64,
    /// Path to the `.tar.gz` on disk
    pub path: PathBuf,
}

/// Owner, group and permission bits for entries of one add operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ownership {
    pub uid: u64,
    pub gid: u64,
    pub mode: u32,
}

impl Ownership {
    fn parse(uid: &str, gid: &str, mode: &str, arg: &str) -> Result<Self> {
        let bad = |what: &str| {
            HoistError::Archive(format!("Invalid {} in '{}': expected uid:gid:mode", what, arg))
        };
        Ok(Self {
            uid: uid.parse().map_err(|_| bad("owner"))?,
            gid: gid.parse().map_err(|_| bad("group"))?,
            mode: u32::from_str_radix(mode, 8).map_err(|_| bad("mode"))?,
        })
    }

    /// Mode bits for a regular file with this ownership.
    fn file_mode(&self) -> u32 {
        S_IFREG | (self.mode & 0o777)
    }

    fn dir_mode(&self) -> u32 {
        S_IFDIR | (self.mode & 0o777)
    }
}

/// `src:dest[:uid:gid:mode]`: copy a file tree into the image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddSpec {
    pub source: PathBuf,
    pub destination: String,
    pub ownership: Option<Ownership>,
}

impl AddSpec {
    pub fn parse(arg: &str) -> Result<Self> {
        let mut parts: Vec<String> = arg.split(':').map(str::to_string).collect();

        // Windows drive letter: `C:\src:/app`
        if (parts.len() == 3 || parts.len() == 6)
            && parts[0].len() == 1
            && parts[0].chars().all(|c| c.is_ascii_alphabetic())
            && parts[1].starts_with(['\\', '/'])
        {
            let drive = parts.remove(0);
            parts[0] = format!("{}:{}", drive, parts[0]);
        }

        let (source, destination, ownership) = match parts.as_slice() {
            [src, dest] => (src, dest, None),
            [src, dest, uid, gid, mode] => {
                (src, dest, Some(Ownership::parse(uid, gid, mode, arg)?))
            }
            _ => {
                return Err(HoistError::Archive(format!(
                    "Invalid add argument '{}': expected src:dest[:uid:gid:mode]",
                    arg
                )))
            }
        };
        if source.is_empty() || destination.is_empty() {
            return Err(HoistError::Archive(format!(
                "Invalid add argument '{}': source and destination are required",
                arg
            )));
        }

        Ok(Self {
            source: PathBuf::from(source),
            destination: destination.clone(),
            ownership,
        })
    }
}

/// `dest[:uid:gid:mode]`: create an empty directory in the image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderSpec {
    pub destination: String,
    pub ownership: Option<Ownership>,
}

impl FolderSpec {
    pub fn parse(arg: &str) -> Result<Self> {
        let parts: Vec<&str> = arg.split(':').collect();
        let (destination, ownership) = match parts.as_slice() {
            [dest] => (*dest, None),
            [dest, uid, gid, mode] => (*dest, Some(Ownership::parse(uid, gid, mode, arg)?)),
            _ => {
                return Err(HoistError::Archive(format!(
                    "Invalid folder argument '{}': expected dest[:uid:gid:mode]",
                    arg
                )))
            }
        };
        if destination.is_empty() {
            return Err(HoistError::Archive(format!(
                "Invalid folder argument '{}': destination is required",
                arg
            )));
        }
        Ok(Self {
            destination: destination.to_string(),
            ownership,
        })
    }
}

/// Ownership, permissions and mtime of a source entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryMetadata {
    pub uid: u64,
    pub gid: u64,
    pub mode: u32,
    pub mtime: u64,
}

/// Source of per-entry metadata; chosen once per process by platform.
pub trait FileMetadataProvider: Send + Sync {
    /// Metadata of `path` itself (symlinks are not followed).
    fn metadata(&self, path: &Path) -> Result<EntryMetadata>;
}

/// `lstat`-based metadata with real owner, group and mode.
#[cfg(unix)]
pub struct PosixMetadata;

#[cfg(unix)]
impl FileMetadataProvider for PosixMetadata {
    fn metadata(&self, path: &Path) -> Result<EntryMetadata> {
        use std::os::unix::fs::MetadataExt;

        let meta = std::fs::symlink_metadata(path).map_err(|e| read_error(path, e))?;
        Ok(EntryMetadata {
            uid: u64::from(meta.uid()),
            gid: u64::from(meta.gid()),
            mode: meta.mode(),
            mtime: meta.mtime().max(0) as u64,
        })
    }
}

/// Fallback for hosts without POSIX ownership: root-owned, mode 0755.
pub struct GenericMetadata;

impl FileMetadataProvider for GenericMetadata {
    fn metadata(&self, path: &Path) -> Result<EntryMetadata> {
        let meta = std::fs::symlink_metadata(path).map_err(|e| read_error(path, e))?;
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Ok(EntryMetadata {
            uid: 0,
            gid: 0,
            mode: DEFAULT_MODE,
            mtime,
        })
    }
}

/// Metadata provider for the current platform.
pub fn platform_metadata_provider() -> Box<dyn FileMetadataProvider> {
    #[cfg(unix)]
    {
        Box::new(PosixMetadata)
    }
    #[cfg(not(unix))]
    {
        Box::new(GenericMetadata)
    }
}

type LayerWriter = HashingWriter<GzEncoder<HashingWriter<BufWriter<NamedTempFile>>>>;

/// Streaming layer writer.
///
/// Entries are appended as they are discovered; [`LayerBuilder::finish`]
/// closes the archive and moves it to `<output_dir>/<hex>.tar.gz`.
pub struct LayerBuilder {
    output_dir: PathBuf,
    reproducible: bool,
    metadata: Box<dyn FileMetadataProvider>,
    archive: tar::Builder<LayerWriter>,
    entries: usize,
}

impl LayerBuilder {
    pub fn new(output_dir: &Path, reproducible: bool) -> Result<Self> {
        std::fs::create_dir_all(output_dir).map_err(|e| {
            HoistError::Archive(format!(
                "Failed to create layer directory {}: {}",
                output_dir.display(),
                e
            ))
        })?;
        let file = NamedTempFile::new_in(output_dir).map_err(|e| {
            HoistError::Archive(format!(
                "Failed to create layer file in {}: {}",
                output_dir.display(),
                e
            ))
        })?;

        let compressed = HashingWriter::new(BufWriter::new(file));
        let encoder = GzEncoder::new(compressed, Compression::default());
        let archive = tar::Builder::new(HashingWriter::new(encoder));

        Ok(Self {
            output_dir: output_dir.to_path_buf(),
            reproducible,
            metadata: platform_metadata_provider(),
            archive,
            entries: 0,
        })
    }

    /// Replace the platform metadata provider.
    pub fn with_metadata_provider(mut self, provider: Box<dyn FileMetadataProvider>) -> Self {
        self.metadata = provider;
        self
    }

    /// Number of entries written so far.
    pub fn entry_count(&self) -> usize {
        self.entries
    }

    /// Add the tree (or single file) at `source` under `destination`.
    ///
    /// Returns the number of entries added.
    pub fn add_tree(
        &mut self,
        source: &Path,
        destination: &str,
        ownership: Option<&Ownership>,
        filter: &SourceFilter,
    ) -> Result<usize> {
        let root = std::fs::canonicalize(source).map_err(|e| read_error(source, e))?;
        let before = self.entries;
        let meta = std::fs::symlink_metadata(&root).map_err(|e| read_error(&root, e))?;

        if meta.is_dir() {
            let dest_root = archive_path(destination);
            self.walk(&root, &root, &dest_root, ownership, filter)?;
        } else {
            let dest = if destination.ends_with('/') {
                let name = root.file_name().map(|n| n.to_string_lossy().to_string());
                format!("{}{}", destination, name.unwrap_or_default())
            } else {
                destination.to_string()
            };
            self.append_entry(&root, &archive_path(&dest), ownership)?;
        }

        tracing::debug!(
            source = %source.display(),
            destination,
            entries = self.entries - before,
            "Added tree to layer"
        );
        Ok(self.entries - before)
    }

    /// Add an empty directory entry not backed by any source file.
    pub fn add_bare_folder(&mut self, destination: &str, ownership: Option<&Ownership>) -> Result<()> {
        let path = archive_path(destination);
        if path.is_empty() {
            return Err(HoistError::Archive(format!(
                "Invalid folder destination '{}'",
                destination
            )));
        }

        let mode = ownership.map(Ownership::dir_mode).unwrap_or(S_IFDIR | DEFAULT_MODE);
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Directory);
        header.set_size(0);
        header.set_mode(mode);
        header.set_uid(ownership.map(|o| o.uid).unwrap_or(0));
        header.set_gid(ownership.map(|o| o.gid).unwrap_or(0));
        header.set_mtime(self.entry_mtime(chrono::Utc::now().timestamp().max(0) as u64));

        self.archive
            .append_data(&mut header, &path, std::io::empty())
            .map_err(|e| write_error(&path, e))?;
        self.entries += 1;
        Ok(())
    }

    /// Close the archive and move it to its content-addressed file name.
    pub fn finish(self, name: impl Into<String>) -> Result<Layer> {
        let uncompressed = self
            .archive
            .into_inner()
            .map_err(|e| HoistError::Archive(format!("Failed to finalize tar stream: {}", e)))?;
        let (encoder, diff_id, _) = uncompressed.finish();
        let compressed = encoder
            .finish()
            .map_err(|e| HoistError::Archive(format!("Failed to finalize gzip stream: {}", e)))?;
        let (buffered, digest, size) = compressed.finish();
        let mut file = buffered
            .into_inner()
            .map_err(|e| HoistError::Archive(format!("Failed to flush layer file: {}", e)))?;
        file.flush()?;

        let path = self.output_dir.join(format!("{}.tar.gz", digest.hex()));
        file.persist(&path).map_err(|e| {
            HoistError::Archive(format!(
                "Failed to store layer {}: {}",
                path.display(),
                e.error
            ))
        })?;

        let layer = Layer {
            name: name.into(),
            digest,
            diff_id,
            size,
            path,
        };
        tracing::info!(
            name = %layer.name,
            digest = %layer.digest,
            diff_id = %layer.diff_id,
            size = layer.size,
            "Layer created"
        );
        Ok(layer)
    }

    fn walk(
        &mut self,
        root: &Path,
        current: &Path,
        dest_root: &str,
        ownership: Option<&Ownership>,
        filter: &SourceFilter,
    ) -> Result<()> {
        let read_dir = std::fs::read_dir(current).map_err(|e| read_error(current, e))?;
        let mut children = Vec::new();
        for entry in read_dir {
            let entry = entry.map_err(|e| read_error(current, e))?;
            children.push(entry.path());
        }
        children.sort();

        for path in children {
            let relative = path.strip_prefix(root).map_err(|e| {
                HoistError::Archive(format!(
                    "Failed to compute relative path for {}: {}",
                    path.display(),
                    e
                ))
            })?;
            let file_type = std::fs::symlink_metadata(&path)
                .map_err(|e| read_error(&path, e))?
                .file_type();
            let is_dir = file_type.is_dir();

            if filter.excludes(&path, relative, is_dir) {
                tracing::trace!(path = %relative.display(), "Skipping ignored entry");
                continue;
            }

            let tar_path = join_archive_path(dest_root, relative);
            if is_dir {
                // Directories are implicit; only their contents are emitted
                self.walk(root, &path, dest_root, ownership, filter)?;
            } else if file_type.is_symlink() || file_type.is_file() {
                self.append_entry(&path, &tar_path, ownership)?;
            } else {
                tracing::debug!(path = %path.display(), "Skipping special file");
            }
        }
        Ok(())
    }

    fn append_entry(
        &mut self,
        path: &Path,
        tar_path: &str,
        ownership: Option<&Ownership>,
    ) -> Result<()> {
        let meta = self.metadata.metadata(path)?;
        let file_type = std::fs::symlink_metadata(path)
            .map_err(|e| read_error(path, e))?
            .file_type();

        let mut header = tar::Header::new_gnu();
        header.set_uid(ownership.map(|o| o.uid).unwrap_or(meta.uid));
        header.set_gid(ownership.map(|o| o.gid).unwrap_or(meta.gid));
        header.set_mode(ownership.map(Ownership::file_mode).unwrap_or(meta.mode));
        header.set_mtime(self.entry_mtime(meta.mtime));

        if file_type.is_symlink() {
            let target = std::fs::read_link(path).map_err(|e| read_error(path, e))?;
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            self.archive
                .append_link(&mut header, tar_path, &target)
                .map_err(|e| write_error(tar_path, e))?;
        } else {
            let file = File::open(path).map_err(|e| read_error(path, e))?;
            let len = file.metadata().map_err(|e| read_error(path, e))?.len();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(len);
            self.archive
                .append_data(&mut header, tar_path, file)
                .map_err(|e| write_error(tar_path, e))?;
        }
        self.entries += 1;
        Ok(())
    }

    fn entry_mtime(&self, actual: u64) -> u64 {
        if self.reproducible {
            REPRODUCIBLE_MTIME
        } else {
            actual
        }
    }
}

/// Turn an image path (`/app/bin`) into a tar entry path (`app/bin`).
fn archive_path(destination: &str) -> String {
    destination
        .replace('\\', "/")
        .split('/')
        .filter(|c| !c.is_empty() && *c != ".")
        .collect::<Vec<_>>()
        .join("/")
}

fn join_archive_path(dest_root: &str, relative: &Path) -> String {
    let relative: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    let relative = relative.join("/");
    if dest_root.is_empty() {
        relative
    } else {
        format!("{}/{}", dest_root, relative)
    }
}

fn read_error(path: &Path, e: std::io::Error) -> HoistError {
    HoistError::Archive(format!("Failed to read {}: {}", path.display(), e))
}

fn write_error(tar_path: &str, e: std::io::Error) -> HoistError {
    HoistError::Archive(format!("Failed to add {} to layer: {}", tar_path, e))
}

//! Backend trait and implementations
//!
//! A backend owns the actual bytes of the volumes of one storage. It knows
//! nothing about volume names: plugins translate names into backend handles
//! (a relative path for file storages, a dataset name for ZFS) and call into
//! the backend.

mod file;
mod local_zfs;
mod mock;

pub use file::FileBackend;
pub use local_zfs::{ZfsBackend, ZfsConfig, BASE_SNAPSHOT};
pub use mock::MockBackend;

use crate::error::{Error, Result};
use crate::stream::StreamFormat;
use crate::types::{ContentType, StorageStatus, VolumeFormat};
use serde::Serialize;
use std::io::{Read, Write};
use std::path::PathBuf;

/// A volume as seen by the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendVolume {
    pub handle: String,
    pub format: VolumeFormat,
    /// Virtual size in bytes
    pub size: u64,
    /// Allocated bytes, when known
    pub used: Option<u64>,
    /// Handle of the volume this one was cloned from
    pub parent: Option<String>,
    /// Creation time in seconds since the epoch
    pub ctime: Option<i64>,
}

/// A plain file below a content directory (backups, ISO images, ...)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendFile {
    pub name: String,
    pub size: u64,
    pub ctime: Option<i64>,
    /// A protection marker exists next to the file
    pub protected: bool,
}

/// Operations a storage backend provides for volumes
///
/// This trait abstracts over the tools that manage the bytes (`qemu-img`
/// and the filesystem, the `zfs` CLI, or memory in tests).
pub trait VolumeBackend: Send + Sync {
    // === Setup ===

    /// Make the storage usable, creating directories for `content`
    fn activate(&self, _content: &[ContentType]) -> Result<()> {
        Ok(())
    }

    fn status(&self) -> Result<StorageStatus>;

    // === Volumes ===

    /// Create an empty volume of `size` bytes
    fn allocate(&self, handle: &str, format: VolumeFormat, size: u64) -> Result<()>;

    /// Create a copy-on-write clone of `parent`, optionally of one of its
    /// snapshots
    fn allocate_linked(
        &self,
        handle: &str,
        format: VolumeFormat,
        parent: &str,
        snapshot: Option<&str>,
    ) -> Result<()>;

    fn delete(&self, handle: &str) -> Result<()>;

    fn rename(&self, from: &str, to: &str) -> Result<()>;

    fn exists(&self, handle: &str) -> Result<bool>;

    /// Set or lift the immutability guard of a base image
    fn protect(&self, handle: &str, protect: bool) -> Result<()>;

    /// Grow a volume to `size` bytes
    fn resize(&self, handle: &str, size: u64) -> Result<()>;

    fn volume_size(&self, handle: &str) -> Result<u64>;

    /// All volumes, unordered
    fn list(&self) -> Result<Vec<BackendVolume>>;

    /// Local path of a volume or one of its snapshots
    fn path(&self, handle: &str, snapshot: Option<&str>) -> Result<PathBuf>;

    // === Snapshots ===

    fn snapshot(&self, handle: &str, snapshot: &str) -> Result<()>;

    fn snapshot_rollback(&self, handle: &str, snapshot: &str) -> Result<()>;

    fn snapshot_delete(&self, handle: &str, snapshot: &str) -> Result<()>;

    /// Snapshot names, oldest first
    fn snapshots(&self, handle: &str) -> Result<Vec<String>>;

    /// Whether a rollback to a snapshot other than the latest is possible
    fn supports_arbitrary_rollback(&self) -> bool {
        false
    }

    // === Transfer ===

    /// Write the payload of `handle` in `format` to `out`
    ///
    /// With `base_snapshot` only the changes since that snapshot are
    /// written.
    fn export(
        &self,
        handle: &str,
        format: StreamFormat,
        snapshot: Option<&str>,
        base_snapshot: Option<&str>,
        out: &mut dyn Write,
    ) -> Result<()>;

    /// Create `handle` from a payload in `format`
    ///
    /// `size` is the value of the size header, 0 for native streams. An
    /// incremental import (`base_snapshot`) applies to an existing volume.
    fn import(
        &self,
        handle: &str,
        format: StreamFormat,
        size: u64,
        base_snapshot: Option<&str>,
        input: &mut dyn Read,
    ) -> Result<()>;

    // === Content files ===

    /// Files of a content type that is not an image, e.g. backups
    fn list_files(&self, _content: ContentType) -> Result<Vec<BackendFile>> {
        Ok(Vec::new())
    }

    /// Remove a content file together with its companion files
    fn remove_file(&self, content: ContentType, name: &str) -> Result<()> {
        Err(Error::UnsupportedOperation(format!(
            "removing {} file '{}'",
            content, name
        )))
    }
}

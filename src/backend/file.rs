//! Image files below a directory
//!
//! Handles are paths relative to the storage root, for example
//! `images/100/vm-100-disk-1.qcow2`. Raw images and subvolume directories
//! are managed directly, qcow2 and vmdk images through `qemu-img`.

use super::{BackendFile, BackendVolume, VolumeBackend};
use crate::command::{classify_failure, CommandRunner};
use crate::error::{Error, Result};
use crate::stream::{copy_exact, StreamFormat};
use crate::types::{ContentType, StorageStatus, VolumeFormat};
use serde::Deserialize;
use std::fs::{self, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, instrument, warn};

const BACKUP_EXTENSIONS: &[&str] = &[
    ".tar.gz", ".tar.lzo", ".tar.zst", ".vma.gz", ".vma.lzo", ".vma.zst", ".tgz", ".tar", ".vma",
];

/// Suffixes of companion files that are never listed on their own
const COMPANION_SUFFIXES: &[&str] = &[".protected", ".notes", ".log", ".tmp"];

#[derive(Debug, Deserialize)]
struct QemuImgInfo {
    #[serde(rename = "virtual-size")]
    virtual_size: u64,
    #[serde(rename = "actual-size", default)]
    actual_size: Option<u64>,
    #[serde(rename = "backing-filename", default)]
    backing_filename: Option<String>,
    #[serde(default)]
    snapshots: Vec<QemuImgSnapshot>,
}

#[derive(Debug, Deserialize)]
struct QemuImgSnapshot {
    name: String,
    #[serde(rename = "date-sec", default)]
    date_sec: i64,
}

/// Backend for directory-like storages
#[derive(Debug, Clone)]
pub struct FileBackend {
    root: PathBuf,
    /// Create missing directories on activation
    mkdir: bool,
    preallocation: Option<String>,
    qemu_img: String,
}

impl FileBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            mkdir: true,
            preallocation: None,
            qemu_img: "qemu-img".to_string(),
        }
    }

    pub fn with_mkdir(mut self, mkdir: bool) -> Self {
        self.mkdir = mkdir;
        self
    }

    /// Preallocation mode passed to `qemu-img create`
    pub fn with_preallocation(mut self, mode: Option<String>) -> Self {
        self.preallocation = mode;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn full_path(&self, handle: &str) -> Result<PathBuf> {
        let rel = Path::new(handle);
        if rel.is_absolute() || rel.components().any(|c| c == Component::ParentDir) {
            return Err(Error::parse("volume path", handle, "must stay below the storage root"));
        }
        Ok(self.root.join(rel))
    }

    fn format_of(handle: &str) -> Result<VolumeFormat> {
        let ext = Path::new(handle)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();
        ext.parse()
            .map_err(|e: String| Error::parse("volume path", handle, e))
    }

    fn qemu_img(&self, args: &[&str], subject: &str) -> Result<String> {
        CommandRunner::unbounded()
            .run(&self.qemu_img, args)
            .map_err(|e| classify_failure("qemu-img", subject, e))
    }

    fn qemu_img_info(&self, path: &Path, format: VolumeFormat) -> Result<QemuImgInfo> {
        let path_str = path.to_string_lossy();
        let output = CommandRunner::query()
            .run(
                &self.qemu_img,
                &["info", "--output=json", "-f", format.as_str(), &path_str],
            )
            .map_err(|e| classify_failure("qemu-img", &path_str, e))?;
        Ok(serde_json::from_str(&output)?)
    }

    fn describe(&self, handle: &str, path: &Path) -> Result<BackendVolume> {
        let format = Self::format_of(handle)?;
        let meta = fs::metadata(path)?;
        let mut volume = BackendVolume {
            handle: handle.to_string(),
            format,
            size: 0,
            used: None,
            parent: None,
            ctime: Some(meta.ctime()),
        };

        match format {
            VolumeFormat::Raw => {
                volume.size = meta.len();
                volume.used = Some(meta.blocks() * 512);
            }
            VolumeFormat::Qcow2 | VolumeFormat::Vmdk => {
                let info = self.qemu_img_info(path, format)?;
                volume.size = info.virtual_size;
                volume.used = info.actual_size;
                volume.parent = info
                    .backing_filename
                    .as_deref()
                    .map(|backing| resolve_backing(handle, backing));
            }
            VolumeFormat::Subvol => {}
        }

        Ok(volume)
    }

    fn set_immutable(&self, path: &Path, on: bool) {
        if !nix::unistd::geteuid().is_root() {
            return;
        }
        let flag = if on { "+i" } else { "-i" };
        if let Err(e) = CommandRunner::query().run("chattr", &[flag, &path.to_string_lossy()]) {
            warn!(path = %path.display(), error = %e, "unable to change immutable flag");
        }
    }
}

/// Handle of the backing file `backing`, given relative to the image's
/// directory
fn resolve_backing(handle: &str, backing: &str) -> String {
    let mut parts: Vec<&str> = handle.split('/').collect();
    parts.pop();
    for part in backing.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

/// Path of `target` relative to the directory containing `handle`
fn relative_backing(handle: &str, target: &str) -> String {
    let dir: Vec<&str> = handle.split('/').collect();
    let dir = &dir[..dir.len().saturating_sub(1)];
    let target: Vec<&str> = target.split('/').collect();
    let common = dir
        .iter()
        .zip(target.iter())
        .take_while(|(a, b)| a == b)
        .count();
    let mut parts: Vec<&str> = vec![".."; dir.len() - common];
    parts.extend(&target[common..]);
    parts.join("/")
}

fn strip_backup_extension(name: &str) -> Option<&str> {
    BACKUP_EXTENSIONS.iter().find_map(|ext| name.strip_suffix(ext))
}

impl VolumeBackend for FileBackend {
    fn activate(&self, content: &[ContentType]) -> Result<()> {
        if !self.root.is_dir() {
            if !self.mkdir {
                return Err(Error::Config(format!(
                    "storage path '{}' does not exist",
                    self.root.display()
                )));
            }
            fs::create_dir_all(&self.root)?;
        }
        if self.mkdir {
            for c in content.iter().filter(|c| **c != ContentType::None) {
                fs::create_dir_all(self.root.join(c.subdir()))?;
            }
        }
        Ok(())
    }

    fn status(&self) -> Result<StorageStatus> {
        if !self.root.is_dir() {
            return Ok(StorageStatus::default());
        }
        let st = nix::sys::statvfs::statvfs(self.root.as_path())?;
        let frsize = st.fragment_size() as u64;
        let total = st.blocks() as u64 * frsize;
        let free = st.blocks_free() as u64 * frsize;
        Ok(StorageStatus {
            total,
            avail: st.blocks_available() as u64 * frsize,
            used: total.saturating_sub(free),
            active: true,
        })
    }

    #[instrument(skip(self))]
    fn allocate(&self, handle: &str, format: VolumeFormat, size: u64) -> Result<()> {
        let path = self.full_path(handle)?;
        if path.exists() {
            return Err(Error::AlreadyExists(format!("disk image '{}'", path.display())));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        match format {
            VolumeFormat::Raw => {
                let file = OpenOptions::new().write(true).create_new(true).open(&path)?;
                file.set_len(size)?;
            }
            VolumeFormat::Qcow2 | VolumeFormat::Vmdk => {
                let path_str = path.to_string_lossy().to_string();
                let size_arg = format!("{}K", size / 1024);
                let mut args = vec!["create", "-f", format.as_str()];
                let prealloc;
                if let Some(mode) = &self.preallocation {
                    prealloc = format!("preallocation={}", mode);
                    args.extend(["-o", prealloc.as_str()]);
                }
                args.extend([path_str.as_str(), size_arg.as_str()]);
                self.qemu_img(&args, handle)?;
            }
            VolumeFormat::Subvol => {
                if size != 0 {
                    return Err(Error::UnsupportedOperation(
                        "storage does not support subvol quotas".to_string(),
                    ));
                }
                fs::create_dir(&path)?;
            }
        }

        debug!(path = %path.display(), "allocated image");
        Ok(())
    }

    #[instrument(skip(self))]
    fn allocate_linked(
        &self,
        handle: &str,
        format: VolumeFormat,
        parent: &str,
        snapshot: Option<&str>,
    ) -> Result<()> {
        if format != VolumeFormat::Qcow2 {
            return Err(Error::UnsupportedOperation(format!(
                "linked clone with format '{}'",
                format
            )));
        }
        if snapshot.is_some() {
            return Err(Error::UnsupportedOperation(
                "linked clone of a file snapshot".to_string(),
            ));
        }

        let path = self.full_path(handle)?;
        let parent_format = Self::format_of(parent)?;
        if !self.full_path(parent)?.exists() {
            return Err(Error::NotFound(format!("base image '{}'", parent)));
        }
        if path.exists() {
            return Err(Error::AlreadyExists(format!("disk image '{}'", path.display())));
        }
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        let backing = relative_backing(handle, parent);
        let path_str = path.to_string_lossy();
        self.qemu_img(
            &[
                "create",
                "-b",
                &backing,
                "-F",
                parent_format.as_str(),
                "-f",
                "qcow2",
                &path_str,
            ],
            handle,
        )?;
        Ok(())
    }

    #[instrument(skip(self))]
    fn delete(&self, handle: &str) -> Result<()> {
        let path = self.full_path(handle)?;
        let meta = fs::symlink_metadata(&path)
            .map_err(|_| Error::NotFound(format!("volume '{}'", handle)))?;
        if meta.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let src = self.full_path(from)?;
        let dst = self.full_path(to)?;
        if !src.exists() {
            return Err(Error::NotFound(format!("volume '{}'", from)));
        }
        if dst.exists() {
            return Err(Error::AlreadyExists(format!("volume '{}'", to)));
        }
        if let Some(dir) = dst.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::rename(&src, &dst)?;
        Ok(())
    }

    fn exists(&self, handle: &str) -> Result<bool> {
        Ok(self.full_path(handle)?.exists())
    }

    fn protect(&self, handle: &str, protect: bool) -> Result<()> {
        let path = self.full_path(handle)?;
        let meta = fs::metadata(&path)?;

        if !protect {
            self.set_immutable(&path, false);
        }
        if meta.is_file() {
            let mode = if protect { 0o444 } else { 0o644 };
            fs::set_permissions(&path, fs::Permissions::from_mode(mode))?;
        }
        if protect {
            self.set_immutable(&path, true);
        }
        Ok(())
    }

    fn resize(&self, handle: &str, size: u64) -> Result<()> {
        let path = self.full_path(handle)?;
        match Self::format_of(handle)? {
            VolumeFormat::Raw => {
                let file = OpenOptions::new().write(true).open(&path)?;
                file.set_len(size)?;
            }
            format @ (VolumeFormat::Qcow2 | VolumeFormat::Vmdk) => {
                let size_arg = size.to_string();
                self.qemu_img(
                    &["resize", "-f", format.as_str(), &path.to_string_lossy(), &size_arg],
                    handle,
                )?;
            }
            VolumeFormat::Subvol => {
                return Err(Error::UnsupportedOperation(
                    "resizing a subvolume directory".to_string(),
                ))
            }
        }
        Ok(())
    }

    fn volume_size(&self, handle: &str) -> Result<u64> {
        let path = self.full_path(handle)?;
        if !path.exists() {
            return Err(Error::NotFound(format!("volume '{}'", handle)));
        }
        Ok(self.describe(handle, &path)?.size)
    }

    fn list(&self) -> Result<Vec<BackendVolume>> {
        let images = self.root.join(ContentType::Images.subdir());
        if !images.is_dir() {
            return Ok(Vec::new());
        }

        let mut volumes = Vec::new();
        for owner_dir in fs::read_dir(&images)? {
            let owner_dir = owner_dir?;
            let owner = owner_dir.file_name().to_string_lossy().to_string();
            if !owner.chars().all(|c| c.is_ascii_digit()) || !owner_dir.path().is_dir() {
                continue;
            }
            for entry in fs::read_dir(owner_dir.path())? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().to_string();
                let handle = format!("images/{}/{}", owner, name);
                if Self::format_of(&handle).is_err() {
                    continue;
                }
                match self.describe(&handle, &entry.path()) {
                    Ok(volume) => volumes.push(volume),
                    Err(e) => warn!(handle = %handle, error = %e, "skipping unreadable image"),
                }
            }
        }
        Ok(volumes)
    }

    fn path(&self, handle: &str, snapshot: Option<&str>) -> Result<PathBuf> {
        if snapshot.is_some() {
            return Err(Error::UnsupportedOperation(
                "path of a file image snapshot".to_string(),
            ));
        }
        self.full_path(handle)
    }

    #[instrument(skip(self))]
    fn snapshot(&self, handle: &str, snapshot: &str) -> Result<()> {
        let path = self.full_path(handle)?;
        if Self::format_of(handle)? != VolumeFormat::Qcow2 {
            return Err(Error::UnsupportedOperation(format!("snapshot of '{}'", handle)));
        }
        self.qemu_img(&["snapshot", "-c", snapshot, &path.to_string_lossy()], handle)?;
        Ok(())
    }

    #[instrument(skip(self))]
    fn snapshot_rollback(&self, handle: &str, snapshot: &str) -> Result<()> {
        let path = self.full_path(handle)?;
        if Self::format_of(handle)? != VolumeFormat::Qcow2 {
            return Err(Error::UnsupportedOperation(format!("rollback of '{}'", handle)));
        }
        self.qemu_img(&["snapshot", "-a", snapshot, &path.to_string_lossy()], handle)?;
        Ok(())
    }

    #[instrument(skip(self))]
    fn snapshot_delete(&self, handle: &str, snapshot: &str) -> Result<()> {
        let path = self.full_path(handle)?;
        if Self::format_of(handle)? != VolumeFormat::Qcow2 {
            return Err(Error::UnsupportedOperation(format!(
                "snapshot deletion on '{}'",
                handle
            )));
        }
        self.qemu_img(&["snapshot", "-d", snapshot, &path.to_string_lossy()], handle)?;
        Ok(())
    }

    fn snapshots(&self, handle: &str) -> Result<Vec<String>> {
        if Self::format_of(handle)? != VolumeFormat::Qcow2 {
            return Ok(Vec::new());
        }
        let mut snaps = self.qemu_img_info(&self.full_path(handle)?, VolumeFormat::Qcow2)?.snapshots;
        snaps.sort_by_key(|s| s.date_sec);
        Ok(snaps.into_iter().map(|s| s.name).collect())
    }

    fn supports_arbitrary_rollback(&self) -> bool {
        true
    }

    #[instrument(skip(self, out))]
    fn export(
        &self,
        handle: &str,
        format: StreamFormat,
        snapshot: Option<&str>,
        base_snapshot: Option<&str>,
        out: &mut dyn Write,
    ) -> Result<()> {
        if base_snapshot.is_some() {
            return Err(Error::UnsupportedOperation(
                "incremental export of file images".to_string(),
            ));
        }
        let volume_format = Self::format_of(handle)?;
        if format.data_format() != Some(volume_format) {
            return Err(Error::UnsupportedOperation(format!(
                "exporting {} volume as '{}'",
                volume_format, format
            )));
        }
        // internal qcow2 snapshots travel inside the image file
        if let Some(snap) = snapshot {
            if volume_format != VolumeFormat::Qcow2 {
                return Err(Error::UnsupportedOperation(format!(
                    "exporting snapshot '{}' of {} volume",
                    snap, volume_format
                )));
            }
        }

        let path = self.full_path(handle)?;
        match format {
            StreamFormat::TarSize => {
                let mut builder = tar::Builder::new(out);
                builder.follow_symlinks(false);
                builder.append_dir_all(".", &path)?;
                builder.finish()?;
            }
            _ => {
                let mut file = fs::File::open(&path)?;
                io::copy(&mut file, out)?;
            }
        }
        Ok(())
    }

    #[instrument(skip(self, input))]
    fn import(
        &self,
        handle: &str,
        format: StreamFormat,
        size: u64,
        base_snapshot: Option<&str>,
        input: &mut dyn Read,
    ) -> Result<()> {
        if base_snapshot.is_some() {
            return Err(Error::UnsupportedOperation(
                "incremental import into file images".to_string(),
            ));
        }
        let volume_format = Self::format_of(handle)?;
        if format.data_format() != Some(volume_format) {
            return Err(Error::UnsupportedOperation(format!(
                "importing '{}' into {} volume",
                format, volume_format
            )));
        }

        let path = self.full_path(handle)?;
        if path.exists() {
            return Err(Error::AlreadyExists(format!("volume '{}'", handle)));
        }
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        match format {
            StreamFormat::TarSize => {
                fs::create_dir(&path)?;
                let mut archive = tar::Archive::new(input);
                archive.set_preserve_permissions(true);
                archive.unpack(&path)?;
            }
            StreamFormat::RawSize => {
                let mut file = OpenOptions::new().write(true).create_new(true).open(&path)?;
                copy_exact(input, &mut file, size)?;
            }
            _ => {
                let mut file = OpenOptions::new().write(true).create_new(true).open(&path)?;
                io::copy(input, &mut file)?;
            }
        }
        Ok(())
    }

    fn list_files(&self, content: ContentType) -> Result<Vec<BackendFile>> {
        let dir = self.root.join(content.subdir());
        if content == ContentType::None || !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if COMPANION_SUFFIXES.iter().any(|s| name.ends_with(s)) {
                continue;
            }
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            files.push(BackendFile {
                protected: dir.join(format!("{}.protected", name)).exists(),
                name,
                size: meta.len(),
                ctime: Some(meta.ctime()),
            });
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    fn remove_file(&self, content: ContentType, name: &str) -> Result<()> {
        if name.is_empty() || name.contains('/') {
            return Err(Error::parse("file name", name, "must be a plain file name"));
        }
        let dir = self.root.join(content.subdir());
        let path = dir.join(name);
        if dir.join(format!("{}.protected", name)).exists() {
            return Err(Error::UnsupportedOperation(format!(
                "removing protected file '{}'",
                name
            )));
        }
        fs::remove_file(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => Error::NotFound(format!("file '{}'", path.display())),
            _ => Error::Io(e),
        })?;

        let mut companions = vec![dir.join(format!("{}.notes", name))];
        if let Some(stem) = strip_backup_extension(name) {
            companions.push(dir.join(format!("{}.log", stem)));
        }
        for companion in companions {
            if let Err(e) = fs::remove_file(&companion) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %companion.display(), error = %e, "unable to remove file");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn backend() -> (TempDir, FileBackend) {
        let dir = TempDir::new().unwrap();
        let backend = FileBackend::new(dir.path());
        (dir, backend)
    }

    #[test]
    fn test_backing_paths() {
        let clone = "images/101/vm-101-disk-1.qcow2";
        let base = "images/100/base-100-disk-1.qcow2";
        let backing = relative_backing(clone, base);
        assert_eq!(backing, "../100/base-100-disk-1.qcow2");
        assert_eq!(resolve_backing(clone, &backing), base);
    }

    #[test]
    fn test_handle_must_stay_below_root() {
        let (_dir, backend) = backend();
        assert!(backend.exists("../etc/passwd").is_err());
        assert!(backend.exists("/etc/passwd").is_err());
    }

    #[test]
    fn test_raw_lifecycle() {
        let (dir, backend) = backend();
        let handle = "images/100/vm-100-disk-1.raw";

        backend.allocate(handle, VolumeFormat::Raw, 4 * 1024 * 1024).unwrap();
        assert!(dir.path().join(handle).is_file());
        assert!(matches!(
            backend.allocate(handle, VolumeFormat::Raw, 1024),
            Err(Error::AlreadyExists(_))
        ));
        assert_eq!(backend.volume_size(handle).unwrap(), 4 * 1024 * 1024);

        backend.resize(handle, 8 * 1024 * 1024).unwrap();
        assert_eq!(backend.volume_size(handle).unwrap(), 8 * 1024 * 1024);

        let listed = backend.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].handle, handle);
        assert_eq!(listed[0].format, VolumeFormat::Raw);

        backend.delete(handle).unwrap();
        assert!(!backend.exists(handle).unwrap());
        assert!(matches!(backend.delete(handle), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_raw_snapshot_unsupported() {
        let (_dir, backend) = backend();
        let handle = "images/100/vm-100-disk-1.raw";
        backend.allocate(handle, VolumeFormat::Raw, 1024).unwrap();
        assert!(matches!(
            backend.snapshot(handle, "s1"),
            Err(Error::UnsupportedOperation(_))
        ));
        assert!(backend.snapshots(handle).unwrap().is_empty());
    }

    #[test]
    fn test_subvol_requires_zero_size() {
        let (dir, backend) = backend();
        let handle = "images/100/subvol-100-disk-1.subvol";
        assert!(backend.allocate(handle, VolumeFormat::Subvol, 1024).is_err());
        backend.allocate(handle, VolumeFormat::Subvol, 0).unwrap();
        assert!(dir.path().join(handle).is_dir());
    }

    #[test]
    fn test_protect_and_rename() {
        let (dir, backend) = backend();
        backend
            .allocate("images/100/vm-100-disk-1.raw", VolumeFormat::Raw, 1024)
            .unwrap();
        backend
            .rename("images/100/vm-100-disk-1.raw", "images/100/base-100-disk-1.raw")
            .unwrap();
        let handle = "images/100/base-100-disk-1.raw";

        backend.protect(handle, true).unwrap();
        let mode = fs::metadata(dir.path().join(handle)).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o444);

        backend.protect(handle, false).unwrap();
        backend.delete(handle).unwrap();
    }

    #[test]
    fn test_raw_export_import() {
        let (_dir, backend) = backend();
        let handle = "images/100/vm-100-disk-1.raw";
        backend.allocate(handle, VolumeFormat::Raw, 2048).unwrap();

        let mut payload = Vec::new();
        backend
            .export(handle, StreamFormat::RawSize, None, None, &mut payload)
            .unwrap();
        assert_eq!(payload.len(), 2048);

        let target = "images/101/vm-101-disk-1.raw";
        backend
            .import(target, StreamFormat::RawSize, 2048, None, &mut Cursor::new(payload))
            .unwrap();
        assert_eq!(backend.volume_size(target).unwrap(), 2048);

        let short = "images/102/vm-102-disk-1.raw";
        let err = backend
            .import(short, StreamFormat::RawSize, 4096, None, &mut Cursor::new(vec![0u8; 10]))
            .unwrap_err();
        assert!(matches!(err, Error::StreamFormat(_)));
    }

    #[test]
    fn test_raw_snapshot_export_refused() {
        let (_dir, backend) = backend();
        let handle = "images/100/vm-100-disk-1.raw";
        backend.allocate(handle, VolumeFormat::Raw, 1024).unwrap();
        let err = backend
            .export(handle, StreamFormat::RawSize, Some("s1"), None, &mut Vec::new())
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedOperation(_)));
    }

    #[test]
    fn test_subvol_tar_transfer() {
        let (dir, backend) = backend();
        let handle = "images/100/subvol-100-disk-1.subvol";
        backend.allocate(handle, VolumeFormat::Subvol, 0).unwrap();
        fs::write(dir.path().join(handle).join("hello.txt"), "hi").unwrap();

        let mut payload = Vec::new();
        backend
            .export(handle, StreamFormat::TarSize, None, None, &mut payload)
            .unwrap();

        let target = "images/101/subvol-101-disk-1.subvol";
        backend
            .import(target, StreamFormat::TarSize, 0, None, &mut Cursor::new(payload))
            .unwrap();
        let copied = fs::read_to_string(dir.path().join(target).join("hello.txt")).unwrap();
        assert_eq!(copied, "hi");
    }

    #[test]
    fn test_backup_files() {
        let (dir, backend) = backend();
        backend.activate(&[ContentType::Backup]).unwrap();
        let dump = dir.path().join("dump");
        let archive = "vzdump-qemu-100-2024_01_01-00_00_00.vma.zst";
        fs::write(dump.join(archive), "x").unwrap();
        fs::write(dump.join("vzdump-qemu-100-2024_01_01-00_00_00.log"), "log").unwrap();
        fs::write(dump.join(format!("{}.notes", archive)), "notes").unwrap();
        fs::write(dump.join("vzdump-lxc-200-2024_01_01-00_00_00.tar.zst"), "y").unwrap();
        fs::write(dump.join("vzdump-lxc-200-2024_01_01-00_00_00.tar.zst.protected"), "").unwrap();

        let files = backend.list_files(ContentType::Backup).unwrap();
        assert_eq!(files.len(), 2);
        assert!(files.iter().any(|f| f.name.starts_with("vzdump-lxc") && f.protected));

        backend.remove_file(ContentType::Backup, archive).unwrap();
        assert!(!dump.join(archive).exists());
        assert!(!dump.join("vzdump-qemu-100-2024_01_01-00_00_00.log").exists());
        assert!(!dump.join(format!("{}.notes", archive)).exists());

        assert!(backend
            .remove_file(ContentType::Backup, "vzdump-lxc-200-2024_01_01-00_00_00.tar.zst")
            .is_err());
    }

    #[test]
    fn test_status_of_missing_root() {
        let backend = FileBackend::new("/nonexistent/volstore-test");
        assert!(!backend.status().unwrap().active);
    }
}

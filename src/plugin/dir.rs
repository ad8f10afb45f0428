//! Plugin for path-based storages
//!
//! Serves `dir`, `nfs`, `cifs`, `glusterfs`, `cephfs` and `btrfs` storages.
//! Volumes are files below the storage path, laid out as
//! `<content subdir>/<owner>/<file>`, and linked clones are qcow2 images
//! backed by their base image.

use super::{PluginContext, StoragePlugin};
use crate::backend::{FileBackend, VolumeBackend};
use crate::config::schema::parse_bool;
use crate::error::{Error, Result};
use crate::types::{StorageStatus, StorageType};
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

pub struct DirPlugin {
    context: PluginContext,
    backend: Arc<dyn VolumeBackend>,
}

impl DirPlugin {
    /// Plugin backed by the files below the configured path
    pub fn new(context: PluginContext) -> Result<Self> {
        let config = &context.config;
        let path = config.path.clone().ok_or_else(|| {
            Error::Config(format!("storage '{}' has no path", config.id))
        })?;
        let mkdir = match config.property("mkdir") {
            Some(raw) => parse_bool("mkdir", raw)?,
            None => true,
        };
        let backend = FileBackend::new(path)
            .with_mkdir(mkdir)
            .with_preallocation(config.property("preallocation").map(str::to_string));
        Ok(Self::with_backend(context, Arc::new(backend)))
    }

    pub fn with_backend(context: PluginContext, backend: Arc<dyn VolumeBackend>) -> Self {
        Self { context, backend }
    }

    /// Path that must be a mount point before the storage counts as active
    fn required_mountpoint(&self) -> Result<Option<PathBuf>> {
        let config = &self.context.config;
        if config.storage_type.is_network_mount() {
            return Ok(config.path.clone());
        }
        let Some(raw) = config.property("is_mountpoint") else {
            return Ok(None);
        };
        match parse_bool("is_mountpoint", raw) {
            Ok(true) => Ok(config.path.clone()),
            Ok(false) => Ok(None),
            Err(_) => Ok(Some(PathBuf::from(raw))),
        }
    }
}

/// A directory is a mount point when it lives on another device than its
/// parent
fn is_mounted(path: &Path) -> Result<bool> {
    let Ok(meta) = fs::metadata(path) else {
        return Ok(false);
    };
    let Some(parent) = path.parent() else {
        return Ok(true);
    };
    Ok(meta.dev() != fs::metadata(parent)?.dev())
}

impl StoragePlugin for DirPlugin {
    fn storage_type(&self) -> StorageType {
        self.context.config.storage_type
    }

    fn context(&self) -> &PluginContext {
        &self.context
    }

    fn backend(&self) -> &dyn VolumeBackend {
        self.backend.as_ref()
    }

    fn activate(&self) -> Result<()> {
        if let Some(mountpoint) = self.required_mountpoint()? {
            if !is_mounted(&mountpoint)? {
                return Err(Error::Config(format!(
                    "storage '{}' is not online, '{}' is not mounted",
                    self.storeid(),
                    mountpoint.display()
                )));
            }
        }
        let content: Vec<_> = self.config().content.iter().copied().collect();
        self.backend.activate(&content)
    }

    fn status(&self) -> Result<StorageStatus> {
        if let Some(mountpoint) = self.required_mountpoint()? {
            if !is_mounted(&mountpoint)? {
                debug!(path = %mountpoint.display(), "storage not mounted");
                return Ok(StorageStatus::default());
            }
        }
        self.backend.status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::ParseMode;
    use crate::config::StorageConfig;
    use crate::lock::MemoryLocker;
    use crate::config::schema::type_info;
    use crate::types::{Feature, VolumeFormat};
    use tempfile::TempDir;

    fn plugin(storage_type: StorageType, path: &Path, extra: &[(&str, &str)]) -> DirPlugin {
        let path = path.display().to_string();
        let mut props = vec![("path", path.as_str()), ("content", "images,iso,backup")];
        props.extend_from_slice(extra);
        let config =
            StorageConfig::from_properties("files", storage_type, props, ParseMode::Strict).unwrap();
        DirPlugin::new(PluginContext::new(config, Arc::new(MemoryLocker::new()))).unwrap()
    }

    #[test]
    fn test_alloc_and_free_raw_file() {
        let dir = TempDir::new().unwrap();
        let plugin = plugin(StorageType::Dir, dir.path(), &[]);
        plugin.activate().unwrap();
        assert!(dir.path().join("template/iso").is_dir());

        let volname = plugin.alloc_image(100, VolumeFormat::Raw, None, 64).unwrap();
        let path = plugin.path(&volname, None).unwrap();
        assert_eq!(path, dir.path().join("images/100/vm-100-disk-1.raw"));
        assert_eq!(fs::metadata(&path).unwrap().len(), 64 * 1024);

        plugin.free_image(&volname, false).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_status_of_unmounted_share() {
        let dir = TempDir::new().unwrap();
        let plugin = plugin(StorageType::Dir, dir.path(), &[("is_mountpoint", "yes")]);
        let status = plugin.status().unwrap();
        assert!(!status.active);
        assert!(plugin.activate().is_err());
    }

    #[test]
    fn test_iso_path() {
        let dir = TempDir::new().unwrap();
        let plugin = plugin(StorageType::Dir, dir.path(), &[]);
        assert_eq!(
            plugin.path("iso/debian.iso", None).unwrap(),
            dir.path().join("template/iso/debian.iso")
        );
    }

    /// Advertised snapshot and template support must hold on real files.
    /// Qcow2 and vmdk need qemu-img and are left out.
    #[test]
    fn test_advertised_features_work_on_local_storages() {
        for storage_type in [StorageType::Dir, StorageType::Btrfs] {
            let formats = type_info(storage_type).formats;
            for format in [VolumeFormat::Raw, VolumeFormat::Subvol] {
                if !formats.contains(&format) {
                    continue;
                }
                let dir = TempDir::new().unwrap();
                let plugin = plugin(storage_type, dir.path(), &[]);
                let size = if format == VolumeFormat::Subvol { 0 } else { 64 };
                let volname = plugin.alloc_image(100, format, None, size).unwrap();

                let snapshot = plugin.volume_snapshot(&volname, "s1");
                if plugin.volume_has_feature(Feature::Snapshot, &volname, None).unwrap() {
                    snapshot.unwrap();
                } else {
                    assert!(
                        matches!(snapshot, Err(Error::UnsupportedOperation(_))),
                        "{} {}",
                        storage_type,
                        format
                    );
                }

                let template = plugin.volume_has_feature(Feature::Template, &volname, None).unwrap();
                let base = plugin.create_base(&volname);
                assert_eq!(template, base.is_ok(), "{} {}", storage_type, format);
                let Ok(base) = base else {
                    continue;
                };

                if !plugin.volume_has_feature(Feature::Clone, &base, None).unwrap() {
                    assert!(matches!(
                        plugin.clone_image(&base, 101, None),
                        Err(Error::UnsupportedOperation(_))
                    ));
                }
                plugin.free_image(&base, true).unwrap();
            }
        }
    }
}

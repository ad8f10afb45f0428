//! Plugin for ZFS pools
//!
//! Images are zvols, container volumes are datasets, both directly below
//! the configured pool. Base images carry a `__base__` snapshot that linked
//! clones are created from.

use super::{PluginContext, StoragePlugin};
use crate::backend::{VolumeBackend, ZfsBackend, ZfsConfig, BASE_SNAPSHOT};
use crate::config::schema::parse_bool;
use crate::error::{Error, Result};
use crate::stream::StreamFormat;
use crate::types::{StorageType, VolumeFormat};
use crate::volname::{ImageVolume, NameGrammar};
use std::path::PathBuf;
use std::sync::Arc;

pub struct ZfsPoolPlugin {
    context: PluginContext,
    backend: Arc<dyn VolumeBackend>,
}

impl ZfsPoolPlugin {
    pub fn new(context: PluginContext) -> Result<Self> {
        let config = &context.config;
        let pool = config
            .pool
            .clone()
            .ok_or_else(|| Error::Config(format!("storage '{}' has no pool", config.id)))?;

        let mut zfs = ZfsConfig::new(pool);
        if let Some(raw) = config.property("sparse") {
            zfs.sparse = parse_bool("sparse", raw)?;
        }
        zfs.blocksize = config.property("blocksize").map(str::to_string);
        zfs.mountpoint = config.property("mountpoint").map(PathBuf::from);

        Ok(Self::with_backend(context, Arc::new(ZfsBackend::new(zfs))))
    }

    pub fn with_backend(context: PluginContext, backend: Arc<dyn VolumeBackend>) -> Self {
        Self { context, backend }
    }
}

impl StoragePlugin for ZfsPoolPlugin {
    fn storage_type(&self) -> StorageType {
        StorageType::ZfsPool
    }

    fn context(&self) -> &PluginContext {
        &self.context
    }

    fn backend(&self) -> &dyn VolumeBackend {
        self.backend.as_ref()
    }

    fn grammar(&self) -> NameGrammar {
        NameGrammar::flat()
    }

    fn image_handle(&self, img: &ImageVolume) -> String {
        img.name.clone()
    }

    fn image_from_handle(&self, handle: &str) -> Option<ImageVolume> {
        // flat names carry their owner
        self.grammar().parse_image_name(handle, 0).ok()
    }

    fn clone_format(&self, source: &ImageVolume) -> VolumeFormat {
        source.format
    }

    fn volume_snapshot_list(&self, volname: &str) -> Result<Vec<String>> {
        let img = self.parse_volname(volname)?.into_image("volume_snapshot_list")?;
        Ok(self
            .backend
            .snapshots(&self.image_handle(&img))?
            .into_iter()
            .filter(|s| s != BASE_SNAPSHOT)
            .collect())
    }

    fn volume_export_formats(
        &self,
        volname: &str,
        snapshot: Option<&str>,
        base_snapshot: Option<&str>,
        with_snapshots: bool,
    ) -> Result<Vec<StreamFormat>> {
        let img = self.parse_volname(volname)?.into_image("volume_export_formats")?;
        let mut formats = Vec::new();
        if snapshot.is_some() {
            formats.push(StreamFormat::Zfs);
        }
        if img.format == VolumeFormat::Raw && base_snapshot.is_none() && !with_snapshots {
            formats.push(StreamFormat::RawSize);
        }
        Ok(formats)
    }

    fn volume_import_formats(
        &self,
        volname: &str,
        base_snapshot: Option<&str>,
        with_snapshots: bool,
    ) -> Result<Vec<StreamFormat>> {
        let img = self.parse_volname(volname)?.into_image("volume_import_formats")?;
        let mut formats = vec![StreamFormat::Zfs];
        if img.format == VolumeFormat::Raw && base_snapshot.is_none() && !with_snapshots {
            formats.push(StreamFormat::RawSize);
        }
        Ok(formats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::config::schema::ParseMode;
    use crate::config::StorageConfig;
    use crate::lock::MemoryLocker;
    use crate::plugin::{ImageFilter, ListCache};
    use crate::types::ContentType;

    fn plugin() -> (Arc<MockBackend>, ZfsPoolPlugin) {
        let config = StorageConfig::from_properties(
            "tank",
            StorageType::ZfsPool,
            [("pool", "tank/data"), ("content", "images,rootdir")],
            ParseMode::Strict,
        )
        .unwrap();
        let backend = Arc::new(MockBackend::new());
        let ctx = PluginContext::new(config, Arc::new(MemoryLocker::new()));
        (backend.clone(), ZfsPoolPlugin::with_backend(ctx, backend))
    }

    #[test]
    fn test_flat_names() {
        let (backend, plugin) = plugin();
        let disk = plugin.alloc_image(100, VolumeFormat::Raw, None, 1024).unwrap();
        let subvol = plugin.alloc_image(100, VolumeFormat::Subvol, None, 1024).unwrap();
        assert_eq!(disk, "vm-100-disk-1");
        assert_eq!(subvol, "subvol-100-disk-2");
        assert!(backend.exists("vm-100-disk-1").unwrap());

        let images = plugin.list_images(ImageFilter::All, &mut ListCache::new()).unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!(images[1].volid, "tank:vm-100-disk-1");
        assert_eq!(images[0].content, ContentType::Rootdir);
    }

    #[test]
    fn test_clone_keeps_format() {
        let (_backend, plugin) = plugin();
        let subvol = plugin.alloc_image(100, VolumeFormat::Subvol, None, 1024).unwrap();
        let base = plugin.create_base(&subvol).unwrap();
        assert_eq!(base, "basevol-100-disk-1");

        let clone = plugin.clone_image(&base, 101, None).unwrap();
        assert_eq!(clone, "basevol-100-disk-1/subvol-101-disk-1");
    }

    #[test]
    fn test_export_formats() {
        let (_backend, plugin) = plugin();
        assert_eq!(
            plugin.volume_export_formats("vm-100-disk-1", None, None, false).unwrap(),
            vec![StreamFormat::RawSize]
        );
        assert_eq!(
            plugin
                .volume_export_formats("vm-100-disk-1", Some("s1"), Some("s0"), false)
                .unwrap(),
            vec![StreamFormat::Zfs]
        );
        assert!(plugin
            .volume_export_formats("subvol-100-disk-1", None, None, false)
            .unwrap()
            .is_empty());
        assert_eq!(
            plugin.volume_import_formats("subvol-100-disk-1", None, true).unwrap(),
            vec![StreamFormat::Zfs]
        );
    }
}

//! Storage manager
//!
//! Entry point for callers working with volume ids: resolves the storage of
//! a volume, instantiates its plugin and forwards the operation. Also owns
//! the storage configuration and applies edits to it.

use crate::config::schema::ParseMode;
use crate::config::{self, ConfigStore, Configuration, StorageConfig};
use crate::error::{Error, Result};
use crate::lock::{with_storage_lock, StorageLocker, DEFAULT_LOCK_TIMEOUT};
use crate::plugin::{
    BackupInfo, ExportOptions, ImageFilter, ImportOptions, ListCache, PluginContext,
    PluginRegistry, StoragePlugin,
};
use crate::prune::{PruneItem, PrunePolicy};
use crate::stream::tcp::{ImportListener, ACCEPT_TIMEOUT};
use crate::stream::{negotiate, StreamFormat};
use crate::types::{
    ContentType, Feature, GuestType, StorageStatus, StorageType, VolumeFormat, VolumeInfo,
};
use crate::volname::{parse_storage_id, parse_volume_id, volume_id, VolumeName};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Lock taken while the configuration file is rewritten, after the lock of
/// the edited storage
const CONFIG_LOCK_ID: &str = "_config";

/// State of a storage in status reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageState {
    Active,
    Inactive,
    Disabled,
}

impl StorageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageState::Active => "active",
            StorageState::Inactive => "inactive",
            StorageState::Disabled => "disabled",
        }
    }
}

/// One row of [`StorageManager::status`]
#[derive(Debug, Clone, Serialize)]
pub struct StorageStatusRow {
    pub id: String,
    pub storage_type: StorageType,
    pub state: StorageState,
    pub status: StorageStatus,
    pub shared: bool,
}

/// Facade over all configured storages of one node
pub struct StorageManager {
    config: Configuration,
    registry: PluginRegistry,
    locker: Arc<dyn StorageLocker>,
    store: Arc<dyn ConfigStore>,
    node: String,
    lock_timeout: Duration,
}

impl StorageManager {
    /// Load the configuration from `store`
    ///
    /// Invalid sections are skipped with a warning.
    pub fn new(
        store: Arc<dyn ConfigStore>,
        registry: PluginRegistry,
        locker: Arc<dyn StorageLocker>,
        node: impl Into<String>,
    ) -> Result<Self> {
        let parsed = config::parse(&store.read()?, ParseMode::Lenient);
        Ok(Self {
            config: parsed.config,
            registry,
            locker,
            store,
            node: node.into(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        })
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    /// Plugin of an enabled storage
    pub fn plugin(&self, storeid: &str) -> Result<Box<dyn StoragePlugin>> {
        let storage = self.config.enabled_on(storeid, &self.node)?;
        self.instantiate(storage)
    }

    fn instantiate(&self, storage: &StorageConfig) -> Result<Box<dyn StoragePlugin>> {
        let context = PluginContext::new(storage.clone(), Arc::clone(&self.locker))
            .with_lock_timeout(self.lock_timeout);
        self.registry.create(context)
    }

    /// Plugin and volume name of a volume id
    fn resolve(&self, volid: &str) -> Result<(Box<dyn StoragePlugin>, String)> {
        let (storeid, volname) = parse_volume_id(volid)?;
        Ok((self.plugin(&storeid)?, volname))
    }

    /// Decode a volume id
    pub fn parse_volume(&self, volid: &str) -> Result<(String, VolumeName)> {
        let (plugin, volname) = self.resolve(volid)?;
        let volume = plugin.parse_volname(&volname)?;
        Ok((plugin.storeid().to_string(), volume))
    }

    // === Volumes ===

    /// Allocate a new image of `size_kib` KiB on `storeid`
    #[instrument(skip(self))]
    pub fn vdisk_alloc(
        &self,
        storeid: &str,
        owner: u32,
        format: Option<VolumeFormat>,
        name: Option<&str>,
        size_kib: u64,
    ) -> Result<String> {
        let plugin = self.plugin(storeid)?;
        let format = format
            .or_else(|| plugin.config().default_format())
            .unwrap_or(VolumeFormat::Raw);
        let content = if format == VolumeFormat::Subvol {
            ContentType::Rootdir
        } else {
            ContentType::Images
        };
        if !plugin.config().has_content(content) {
            return Err(Error::UnsupportedOperation(format!(
                "storage '{}' does not support content type '{}'",
                storeid, content
            )));
        }

        plugin.activate()?;
        let volname = plugin.alloc_image(owner, format, name, size_kib)?;
        Ok(volume_id(storeid, &volname))
    }

    /// Remove a volume
    ///
    /// Images go with all of their snapshots, other content types are
    /// removed as files.
    #[instrument(skip(self))]
    pub fn vdisk_free(&self, volid: &str) -> Result<()> {
        let (plugin, volname) = self.resolve(volid)?;
        match plugin.parse_volname(&volname)? {
            VolumeName::Image(img) => plugin.free_image(&volname, img.is_base),
            _ => plugin.free_file(&volname),
        }
    }

    pub fn vdisk_create_base(&self, volid: &str) -> Result<String> {
        let (plugin, volname) = self.resolve(volid)?;
        let base = plugin.create_base(&volname)?;
        Ok(volume_id(plugin.storeid(), &base))
    }

    pub fn vdisk_clone(&self, volid: &str, new_owner: u32, snapshot: Option<&str>) -> Result<String> {
        let (plugin, volname) = self.resolve(volid)?;
        plugin.activate()?;
        let clone = plugin.clone_image(&volname, new_owner, snapshot)?;
        Ok(volume_id(plugin.storeid(), &clone))
    }

    pub fn volume_resize(&self, volid: &str, size: u64) -> Result<u64> {
        let (plugin, volname) = self.resolve(volid)?;
        plugin.volume_resize(&volname, size)
    }

    pub fn volume_snapshot(&self, volid: &str, snapshot: &str) -> Result<()> {
        let (plugin, volname) = self.resolve(volid)?;
        plugin.volume_snapshot(&volname, snapshot)
    }

    pub fn volume_snapshot_rollback(&self, volid: &str, snapshot: &str) -> Result<()> {
        let (plugin, volname) = self.resolve(volid)?;
        plugin.volume_snapshot_rollback(&volname, snapshot)
    }

    pub fn volume_snapshot_delete(&self, volid: &str, snapshot: &str) -> Result<()> {
        let (plugin, volname) = self.resolve(volid)?;
        plugin.volume_snapshot_delete(&volname, snapshot)
    }

    pub fn volume_snapshot_list(&self, volid: &str) -> Result<Vec<String>> {
        let (plugin, volname) = self.resolve(volid)?;
        plugin.volume_snapshot_list(&volname)
    }

    pub fn volume_has_feature(
        &self,
        feature: Feature,
        volid: &str,
        snapshot: Option<&str>,
    ) -> Result<bool> {
        let (plugin, volname) = self.resolve(volid)?;
        plugin.volume_has_feature(feature, &volname, snapshot)
    }

    pub fn path(&self, volid: &str, snapshot: Option<&str>) -> Result<PathBuf> {
        let (plugin, volname) = self.resolve(volid)?;
        plugin.path(&volname, snapshot)
    }

    // === Listing ===

    /// Status of every configured storage
    ///
    /// Storages that fail to report are listed as inactive.
    pub fn status(&self) -> Vec<StorageStatusRow> {
        self.config
            .storages
            .values()
            .map(|storage| {
                let mut row = StorageStatusRow {
                    id: storage.id.clone(),
                    storage_type: storage.storage_type,
                    state: StorageState::Disabled,
                    status: StorageStatus::default(),
                    shared: storage.shared,
                };
                if !storage.available_on(&self.node) {
                    return row;
                }
                match self.instantiate(storage).and_then(|p| p.status()) {
                    Ok(status) => {
                        row.state = if status.active {
                            StorageState::Active
                        } else {
                            StorageState::Inactive
                        };
                        row.status = status;
                    }
                    Err(e) => {
                        warn!(storage = %storage.id, error = %e, "unable to get storage status");
                        row.state = StorageState::Inactive;
                    }
                }
                row
            })
            .collect()
    }

    /// Images of one storage, or of all enabled storages
    pub fn list_images(
        &self,
        storeid: Option<&str>,
        owner: Option<u32>,
        cache: &mut ListCache,
    ) -> Result<Vec<VolumeInfo>> {
        let filter = match owner {
            Some(owner) => ImageFilter::Owner(owner),
            None => ImageFilter::All,
        };
        let ids: Vec<String> = match storeid {
            Some(id) => vec![id.to_string()],
            None => self
                .config
                .storages
                .values()
                .filter(|s| s.available_on(&self.node))
                .filter(|s| s.has_content(ContentType::Images) || s.has_content(ContentType::Rootdir))
                .filter(|s| self.registry.supports(s.storage_type))
                .map(|s| s.id.clone())
                .collect(),
        };

        let mut images = Vec::new();
        for id in ids {
            let plugin = self.plugin(&id)?;
            match plugin.list_images(filter, cache) {
                Ok(list) => images.extend(list),
                // one unreachable storage shouldn't hide the others
                Err(e) if storeid.is_none() => {
                    warn!(storage = %id, error = %e, "unable to list images")
                }
                Err(e) => return Err(e),
            }
        }
        Ok(images)
    }

    /// Images with the given volume ids, across storages
    pub fn list_volumes(&self, volids: &[String], cache: &mut ListCache) -> Result<Vec<VolumeInfo>> {
        let mut by_storage: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for volid in volids {
            let (storeid, _) = parse_volume_id(volid)?;
            by_storage.entry(storeid).or_default().push(volid.clone());
        }

        let mut images = Vec::new();
        for (storeid, ids) in by_storage {
            let plugin = self.plugin(&storeid)?;
            images.extend(plugin.list_images(ImageFilter::Volumes(&ids), cache)?);
        }
        Ok(images)
    }

    pub fn list_backups(&self, storeid: &str, owner: Option<u32>) -> Result<Vec<BackupInfo>> {
        self.plugin(storeid)?.list_backups(owner)
    }

    /// Apply a retention policy to the backups of `storeid`
    #[instrument(skip(self))]
    pub fn prune_backups(
        &self,
        storeid: &str,
        policy: Option<&PrunePolicy>,
        guest_type: Option<GuestType>,
        owner: Option<u32>,
        dry_run: bool,
    ) -> Result<Vec<PruneItem>> {
        let plugin = self.plugin(storeid)?;
        if !plugin.config().has_content(ContentType::Backup) {
            return Err(Error::UnsupportedOperation(format!(
                "storage '{}' does not support backups",
                storeid
            )));
        }
        plugin.prune_backups(policy, guest_type, owner, dry_run)
    }

    // === Transfer ===

    pub fn volume_export_formats(&self, volid: &str, options: &ExportOptions) -> Result<Vec<StreamFormat>> {
        let (plugin, volname) = self.resolve(volid)?;
        plugin.volume_export_formats(
            &volname,
            options.snapshot.as_deref(),
            options.base_snapshot.as_deref(),
            options.with_snapshots,
        )
    }

    pub fn volume_import_formats(&self, volid: &str, options: &ImportOptions) -> Result<Vec<StreamFormat>> {
        let (plugin, volname) = self.resolve(volid)?;
        plugin.volume_import_formats(
            &volname,
            options.base_snapshot.as_deref(),
            options.with_snapshots,
        )
    }

    /// Stream format for moving `source` to `target`
    pub fn transfer_format(
        &self,
        source: &str,
        target: &str,
        export: &ExportOptions,
        import: &ImportOptions,
    ) -> Result<StreamFormat> {
        let exportable = self.volume_export_formats(source, export)?;
        let importable = self.volume_import_formats(target, import)?;
        negotiate(&exportable, &importable).ok_or_else(|| {
            Error::StreamFormat(format!(
                "no common format to transfer '{}' to '{}'",
                source, target
            ))
        })
    }

    pub fn volume_export(
        &self,
        volid: &str,
        format: StreamFormat,
        options: &ExportOptions,
        out: &mut dyn Write,
    ) -> Result<()> {
        let (plugin, volname) = self.resolve(volid)?;
        plugin.volume_export(&volname, format, options, out)
    }

    /// Import a stream into `volid` and return the id of the new volume
    pub fn volume_import(
        &self,
        volid: &str,
        format: StreamFormat,
        input: &mut dyn Read,
        options: &ImportOptions,
    ) -> Result<String> {
        let (plugin, volname) = self.resolve(volid)?;
        plugin.activate()?;
        let imported = plugin.volume_import(&volname, format, input, options)?;
        Ok(volume_id(plugin.storeid(), &imported))
    }

    /// Receive an import stream over TCP
    ///
    /// The listening address is written to `announce` before waiting for
    /// the sender.
    pub fn volume_import_tcp(
        &self,
        volid: &str,
        format: StreamFormat,
        ip: IpAddr,
        options: &ImportOptions,
        announce: &mut dyn Write,
    ) -> Result<String> {
        let listener = ImportListener::bind(ip)?;
        listener.announce(announce)?;
        let mut stream = listener.accept(ACCEPT_TIMEOUT)?;
        self.volume_import(volid, format, &mut stream, options)
    }

    // === Configuration ===

    /// Re-read the configuration, apply `edit` and write it back
    ///
    /// Runs under the lock of `storeid`, so no volume operation on that
    /// storage overlaps the edit, and under the configuration lock.
    fn edit_config<T>(
        &mut self,
        storeid: &str,
        edit: impl FnOnce(&mut Configuration) -> Result<T>,
    ) -> Result<T> {
        let storeid = parse_storage_id(storeid)?;
        let store = Arc::clone(&self.store);
        let locker = Arc::clone(&self.locker);
        let timeout = self.lock_timeout;
        let (config, value) = with_storage_lock(locker.as_ref(), storeid, timeout, || {
            with_storage_lock(locker.as_ref(), CONFIG_LOCK_ID, timeout, || {
                let mut config = config::parse(&store.read()?, ParseMode::Lenient).config;
                let value = edit(&mut config)?;
                store.write(&config.write())?;
                Ok((config, value))
            })
        })?;
        self.config = config;
        Ok(value)
    }

    #[instrument(skip(self, props))]
    pub fn add_storage(
        &mut self,
        id: &str,
        storage_type: StorageType,
        props: &BTreeMap<String, String>,
    ) -> Result<StorageConfig> {
        let storage = self.edit_config(id, |config| config.add_storage(id, storage_type, props).cloned())?;
        info!(storage = id, "storage added");
        Ok(storage)
    }

    #[instrument(skip(self, changes))]
    pub fn update_storage(
        &mut self,
        id: &str,
        changes: &BTreeMap<String, String>,
        delete: &[String],
    ) -> Result<StorageConfig> {
        let storage = self.edit_config(id, |config| config.update_storage(id, changes, delete).cloned())?;
        info!(storage = id, "storage updated");
        Ok(storage)
    }

    #[instrument(skip(self))]
    pub fn remove_storage(&mut self, id: &str) -> Result<()> {
        self.edit_config(id, |config| config.remove_storage(id).map(|_| ()))?;
        info!(storage = id, "storage removed");
        Ok(())
    }
}

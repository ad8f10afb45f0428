//! Storage plugins
//!
//! A plugin ties a storage configuration to a [`VolumeBackend`] and
//! implements the volume lifecycle on top of it: allocation, base images,
//! linked clones, snapshots, listing, backups and volume transfer. The
//! default methods of [`StoragePlugin`] describe the generic behavior;
//! concrete plugins only override what their backend does differently.

pub mod dir;
pub mod zfspool;

pub use dir::DirPlugin;
pub use zfspool::ZfsPoolPlugin;

use crate::backend::{BackendVolume, VolumeBackend};
use crate::config::schema::type_info;
use crate::config::StorageConfig;
use crate::error::{Error, Result};
use crate::features;
use crate::lock::{with_storage_lock, StorageLocker, DEFAULT_LOCK_TIMEOUT};
use crate::prune::{prune_mark, PruneItem, PruneMark, PrunePolicy};
use crate::stream::{read_size_header, write_size_header, StreamFormat};
use crate::types::{
    ContentType, Feature, GuestType, StorageStatus, StorageType, VolumeFormat, VolumeInfo,
    VolumeRole,
};
use crate::volname::{
    find_free_disk_name, volume_id, BackupName, ImageVolume, NameGrammar, ParentRef, VolumeName,
};
use serde::Serialize;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// What a plugin needs besides its backend
#[derive(Clone)]
pub struct PluginContext {
    pub config: StorageConfig,
    pub locker: Arc<dyn StorageLocker>,
    pub lock_timeout: Duration,
}

impl PluginContext {
    pub fn new(config: StorageConfig, locker: Arc<dyn StorageLocker>) -> Self {
        Self {
            config,
            locker,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Run `f` while holding the lock of this storage
    pub fn with_lock<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        with_storage_lock(self.locker.as_ref(), &self.config.id, self.lock_timeout, f)
    }
}

/// Backend listings reused within one request
///
/// Create one per request and drop it afterwards, listings are never
/// refreshed.
#[derive(Debug, Default)]
pub struct ListCache {
    volumes: HashMap<String, Vec<BackendVolume>>,
}

impl ListCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn volumes(&mut self, storeid: &str, backend: &dyn VolumeBackend) -> Result<&[BackendVolume]> {
        let volumes = match self.volumes.entry(storeid.to_string()) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => e.insert(backend.list()?),
        };
        Ok(volumes.as_slice())
    }
}

/// Which images [`StoragePlugin::list_images`] returns
#[derive(Debug, Clone, Copy)]
pub enum ImageFilter<'a> {
    All,
    /// Images of one guest
    Owner(u32),
    /// Only the listed volume ids
    Volumes(&'a [String]),
}

/// A backup archive on a storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupInfo {
    pub volid: String,
    pub backup: BackupName,
    pub size: u64,
    pub ctime: Option<i64>,
    pub protected: bool,
}

/// Options of [`StoragePlugin::volume_export`]
#[derive(Debug, Clone, Default)]
pub struct ExportOptions {
    /// Export the state of this snapshot instead of the current data
    pub snapshot: Option<String>,
    /// Only send changes made after this snapshot
    pub base_snapshot: Option<String>,
    pub with_snapshots: bool,
}

/// Options of [`StoragePlugin::volume_import`]
#[derive(Debug, Clone, Default)]
pub struct ImportOptions {
    /// Apply an incremental stream on top of this existing snapshot
    pub base_snapshot: Option<String>,
    pub with_snapshots: bool,
    /// Snapshot to remove once the import succeeded
    pub delete_snapshot: Option<String>,
    /// Pick a free name instead of failing when the target exists
    pub allow_rename: bool,
}

fn unsupported(what: impl Into<String>) -> Error {
    Error::UnsupportedOperation(what.into())
}

/// Volume lifecycle of one storage
pub trait StoragePlugin: Send + Sync {
    fn storage_type(&self) -> StorageType;

    fn context(&self) -> &PluginContext;

    fn backend(&self) -> &dyn VolumeBackend;

    fn config(&self) -> &StorageConfig {
        &self.context().config
    }

    fn storeid(&self) -> &str {
        &self.context().config.id
    }

    // === Names ===

    fn grammar(&self) -> NameGrammar {
        NameGrammar::directory()
    }

    fn parse_volname(&self, volname: &str) -> Result<VolumeName> {
        self.grammar().parse(volname)
    }

    /// Backend handle of an image
    fn image_handle(&self, img: &ImageVolume) -> String {
        format!("{}/{}/{}", ContentType::Images.subdir(), img.owner, img.name)
    }

    /// Image stored under `handle`, without parent information; `None` for
    /// volumes this plugin does not manage
    fn image_from_handle(&self, handle: &str) -> Option<ImageVolume> {
        let rest = handle.strip_prefix(ContentType::Images.subdir())?.strip_prefix('/')?;
        let (owner, name) = rest.split_once('/')?;
        let owner = owner.parse().ok()?;
        self.grammar().parse_image_name(name, owner).ok()
    }

    /// Format of linked clones of `source`
    fn clone_format(&self, _source: &ImageVolume) -> VolumeFormat {
        VolumeFormat::Qcow2
    }

    // === Storage ===

    /// Prepare the storage for use
    fn activate(&self) -> Result<()> {
        let content: Vec<ContentType> = self.config().content.iter().copied().collect();
        self.backend().activate(&content)
    }

    fn status(&self) -> Result<StorageStatus> {
        self.backend().status()
    }

    // === Image lifecycle ===

    /// Create a new image of `size_kib` KiB and return its volume name
    ///
    /// Without `name` the lowest free disk index of `owner` is used.
    #[instrument(skip(self), fields(storage = %self.storeid()))]
    fn alloc_image(
        &self,
        owner: u32,
        format: VolumeFormat,
        name: Option<&str>,
        size_kib: u64,
    ) -> Result<String> {
        if !type_info(self.storage_type()).formats.contains(&format) {
            return Err(unsupported(format!(
                "format '{}' on storage type '{}'",
                format,
                self.storage_type()
            )));
        }

        let size = size_kib.checked_mul(1024).ok_or_else(|| {
            Error::parse("image size", &format!("{}K", size_kib), "too large")
        })?;

        let grammar = self.grammar();
        self.context().with_lock(|| {
            let name = match name {
                Some(name) => grammar.check_new_image_name(name, owner, format)?.name,
                None => {
                    let existing = self.backend().list()?;
                    find_free_disk_name(
                        existing.iter().map(|v| v.handle.as_str()),
                        owner,
                        format,
                        grammar,
                    )?
                }
            };

            let img = grammar.parse_image_name(&name, owner)?;
            let volname = grammar.encode_image(&img);
            let handle = self.image_handle(&img);
            if self.backend().exists(&handle)? {
                return Err(Error::AlreadyExists(format!(
                    "volume '{}'",
                    volume_id(self.storeid(), &volname)
                )));
            }

            if let Err(e) = self.backend().allocate(&handle, format, size) {
                let partial = !matches!(e, Error::AlreadyExists(_));
                if partial && self.backend().exists(&handle).unwrap_or(false) {
                    if let Err(err) = self.backend().delete(&handle) {
                        warn!(handle = %handle, error = %err, "unable to remove partial image");
                    }
                }
                return Err(e);
            }
            info!(volname = %volname, "allocated image");
            Ok(volname)
        })
    }

    /// Remove an image together with all of its snapshots
    #[instrument(skip(self), fields(storage = %self.storeid()))]
    fn free_image(&self, volname: &str, is_base: bool) -> Result<()> {
        let img = self.parse_volname(volname)?.into_image("free_image")?;
        let handle = self.image_handle(&img);

        self.context().with_lock(|| {
            if !self.backend().exists(&handle)? {
                return Err(Error::NotFound(format!("volume '{}'", volname)));
            }

            if img.is_base || is_base {
                let clones = self
                    .backend()
                    .list()?
                    .into_iter()
                    .filter(|v| v.parent.as_deref() == Some(handle.as_str()))
                    .count();
                if clones > 0 {
                    return Err(unsupported(format!(
                        "removing base volume '{}', it has {} linked clone(s)",
                        volname, clones
                    )));
                }
                self.backend().protect(&handle, false)?;
            }

            let snapshots = self.backend().snapshots(&handle)?;
            for snap in snapshots.iter().rev() {
                debug!(snapshot = %snap, "removing snapshot");
                self.backend().snapshot_delete(&handle, snap)?;
            }
            self.backend().delete(&handle)?;
            info!(volname = %volname, "removed image");
            Ok(())
        })
    }

    /// Turn an image into a read-only base image for linked clones
    #[instrument(skip(self), fields(storage = %self.storeid()))]
    fn create_base(&self, volname: &str) -> Result<String> {
        let img = self.parse_volname(volname)?.into_image("create_base")?;
        if img.is_base {
            return Err(Error::AlreadyBase(volname.to_string()));
        }

        let grammar = self.grammar();
        let mut base = grammar.parse_image_name(&img.base_name()?, img.owner)?;
        base.parent = img.parent.clone();

        self.context().with_lock(|| {
            let handle = self.image_handle(&img);
            if !self.backend().snapshots(&handle)?.is_empty() {
                return Err(unsupported(format!(
                    "converting volume '{}' with snapshots to a base image",
                    volname
                )));
            }

            let base_handle = self.image_handle(&base);
            self.backend().rename(&handle, &base_handle)?;
            if let Err(e) = self.backend().protect(&base_handle, true) {
                if let Err(err) = self.backend().rename(&base_handle, &handle) {
                    warn!(error = %err, "unable to restore volume name");
                }
                return Err(e);
            }

            let base_volname = grammar.encode_image(&base);
            info!(volname = %base_volname, "created base image");
            Ok(base_volname)
        })
    }

    /// Create a linked clone of a base image or snapshot for `new_owner`
    #[instrument(skip(self), fields(storage = %self.storeid()))]
    fn clone_image(&self, volname: &str, new_owner: u32, snapshot: Option<&str>) -> Result<String> {
        let img = self.parse_volname(volname)?.into_image("clone_image")?;
        let role = VolumeRole::of(img.is_base, snapshot);
        if !features::volume_has_feature(Feature::Clone, self.storage_type(), img.format, role) {
            return Err(if img.is_base || snapshot.is_some() {
                unsupported(format!("linked clone of '{}'", volname))
            } else {
                unsupported("clone_image only works on base images")
            });
        }

        let format = self.clone_format(&img);
        let grammar = self.grammar();
        self.context().with_lock(|| {
            let existing = self.backend().list()?;
            let name = find_free_disk_name(
                existing.iter().map(|v| v.handle.as_str()),
                new_owner,
                format,
                grammar,
            )?;
            let mut clone = grammar.parse_image_name(&name, new_owner)?;
            if img.is_base {
                clone.parent = Some(ParentRef {
                    owner: img.owner,
                    name: img.name.clone(),
                });
            }

            let handle = self.image_handle(&clone);
            let parent = self.image_handle(&img);
            if let Err(e) = self.backend().allocate_linked(&handle, format, &parent, snapshot) {
                if self.backend().exists(&handle).unwrap_or(false) {
                    if let Err(err) = self.backend().delete(&handle) {
                        warn!(handle = %handle, error = %err, "unable to remove partial clone");
                    }
                }
                return Err(e);
            }

            let clone_volname = grammar.encode_image(&clone);
            info!(volname = %clone_volname, parent = %volname, "created linked clone");
            Ok(clone_volname)
        })
    }

    /// Images on this storage, sorted by volume id
    fn list_images(&self, filter: ImageFilter<'_>, cache: &mut ListCache) -> Result<Vec<VolumeInfo>> {
        let grammar = self.grammar();
        let storeid = self.storeid().to_string();
        let volumes = cache.volumes(&storeid, self.backend())?;

        let mut images = Vec::new();
        for volume in volumes {
            let Some(mut img) = self.image_from_handle(&volume.handle) else {
                continue;
            };
            if let ImageFilter::Owner(owner) = filter {
                if img.owner != owner {
                    continue;
                }
            }

            let parent = volume
                .parent
                .as_deref()
                .and_then(|p| self.image_from_handle(p));
            img.parent = parent.as_ref().map(|p| ParentRef {
                owner: p.owner,
                name: p.name.clone(),
            });

            let volid = volume_id(&storeid, &grammar.encode_image(&img));
            if let ImageFilter::Volumes(allowed) = filter {
                if !allowed.contains(&volid) {
                    continue;
                }
            }

            images.push(VolumeInfo {
                volid,
                format: volume.format,
                content: img.content,
                size: volume.size,
                used: volume.used,
                owner: Some(img.owner),
                parent: parent.as_ref().map(|p| grammar.encode_image(p)),
                ctime: volume.ctime,
            });
        }

        images.sort_by(|a, b| a.volid.cmp(&b.volid));
        Ok(images)
    }

    /// Local path of a volume
    fn path(&self, volname: &str, snapshot: Option<&str>) -> Result<PathBuf> {
        match self.parse_volname(volname)? {
            VolumeName::Image(img) => self.backend().path(&self.image_handle(&img), snapshot),
            VolumeName::Rootdir { owner } => self
                .backend()
                .path(&format!("{}/{}", ContentType::Rootdir.subdir(), owner), None),
            VolumeName::Iso { file } => self.backend().path(&content_handle(ContentType::Iso, &file), None),
            VolumeName::Vztmpl { file } => {
                self.backend().path(&content_handle(ContentType::Vztmpl, &file), None)
            }
            VolumeName::Snippet { file } => {
                self.backend().path(&content_handle(ContentType::Snippets, &file), None)
            }
            VolumeName::Backup(b) => {
                self.backend().path(&content_handle(ContentType::Backup, &b.file), None)
            }
        }
    }

    // === Size and snapshots ===

    /// Grow an image to `size` bytes
    #[instrument(skip(self), fields(storage = %self.storeid()))]
    fn volume_resize(&self, volname: &str, size: u64) -> Result<u64> {
        let img = self.parse_volname(volname)?.into_image("volume_resize")?;
        if img.is_base {
            return Err(unsupported(format!("resizing base image '{}'", volname)));
        }
        let handle = self.image_handle(&img);
        let current = self.backend().volume_size(&handle)?;
        if size < current {
            return Err(unsupported(format!(
                "shrinking '{}' from {} to {} bytes",
                volname, current, size
            )));
        }
        self.backend().resize(&handle, size)?;
        Ok(size)
    }

    #[instrument(skip(self), fields(storage = %self.storeid()))]
    fn volume_snapshot(&self, volname: &str, snapshot: &str) -> Result<()> {
        let img = self.parse_volname(volname)?.into_image("volume_snapshot")?;
        self.require_feature(Feature::Snapshot, &img, None)?;
        self.backend().snapshot(&self.image_handle(&img), snapshot)
    }

    /// Roll back to `snapshot`
    ///
    /// Backends that can only roll back to their most recent snapshot fail
    /// with [`Error::NotLatestSnapshot`] for any older one.
    #[instrument(skip(self), fields(storage = %self.storeid()))]
    fn volume_snapshot_rollback(&self, volname: &str, snapshot: &str) -> Result<()> {
        let img = self.parse_volname(volname)?.into_image("volume_snapshot_rollback")?;
        self.require_feature(Feature::Snapshot, &img, Some(snapshot))?;

        let snapshots = self.volume_snapshot_list(volname)?;
        if !snapshots.iter().any(|s| s == snapshot) {
            return Err(Error::NotFound(format!("snapshot '{}' of '{}'", snapshot, volname)));
        }
        if !self.backend().supports_arbitrary_rollback() {
            if let Some(latest) = snapshots.last().filter(|latest| *latest != snapshot) {
                return Err(Error::NotLatestSnapshot {
                    requested: snapshot.to_string(),
                    latest: latest.clone(),
                });
            }
        }
        self.backend().snapshot_rollback(&self.image_handle(&img), snapshot)
    }

    #[instrument(skip(self), fields(storage = %self.storeid()))]
    fn volume_snapshot_delete(&self, volname: &str, snapshot: &str) -> Result<()> {
        let img = self.parse_volname(volname)?.into_image("volume_snapshot_delete")?;
        self.require_feature(Feature::Snapshot, &img, Some(snapshot))?;
        self.backend().snapshot_delete(&self.image_handle(&img), snapshot)
    }

    /// Snapshot names, oldest first
    fn volume_snapshot_list(&self, volname: &str) -> Result<Vec<String>> {
        let img = self.parse_volname(volname)?.into_image("volume_snapshot_list")?;
        self.backend().snapshots(&self.image_handle(&img))
    }

    // === Capabilities ===

    fn volume_has_feature(&self, feature: Feature, volname: &str, snapshot: Option<&str>) -> Result<bool> {
        Ok(match self.parse_volname(volname)? {
            VolumeName::Image(img) => features::volume_has_feature(
                feature,
                self.storage_type(),
                img.format,
                VolumeRole::of(img.is_base, snapshot),
            ),
            _ => false,
        })
    }

    /// Fail with [`Error::UnsupportedOperation`] unless the capability
    /// matrix allows `feature`
    fn require_feature(&self, feature: Feature, img: &ImageVolume, snapshot: Option<&str>) -> Result<()> {
        let role = VolumeRole::of(img.is_base, snapshot);
        if features::volume_has_feature(feature, self.storage_type(), img.format, role) {
            Ok(())
        } else {
            Err(unsupported(format!(
                "{} on {} volume '{}' of storage type '{}'",
                feature,
                img.format,
                img.name,
                self.storage_type()
            )))
        }
    }

    // === Transfer ===

    /// Stream formats `volname` can be exported in, preferred first
    fn volume_export_formats(
        &self,
        volname: &str,
        snapshot: Option<&str>,
        base_snapshot: Option<&str>,
        with_snapshots: bool,
    ) -> Result<Vec<StreamFormat>> {
        let img = self.parse_volname(volname)?.into_image("volume_export_formats")?;
        if base_snapshot.is_some() {
            return Ok(Vec::new());
        }
        // only qcow2 images carry their snapshots inside the image file
        if (snapshot.is_some() || with_snapshots) && img.format != VolumeFormat::Qcow2 {
            return Ok(Vec::new());
        }
        Ok(vec![StreamFormat::sized(img.format)])
    }

    /// Stream formats accepted for importing into `volname`
    fn volume_import_formats(
        &self,
        volname: &str,
        base_snapshot: Option<&str>,
        with_snapshots: bool,
    ) -> Result<Vec<StreamFormat>> {
        self.volume_export_formats(volname, None, base_snapshot, with_snapshots)
    }

    /// Write `volname` as a `format` stream to `out`
    #[instrument(skip(self, out), fields(storage = %self.storeid()))]
    fn volume_export(
        &self,
        volname: &str,
        format: StreamFormat,
        options: &ExportOptions,
        out: &mut dyn Write,
    ) -> Result<()> {
        let snapshot = options.snapshot.as_deref();
        let base_snapshot = options.base_snapshot.as_deref();
        let offered =
            self.volume_export_formats(volname, snapshot, base_snapshot, options.with_snapshots)?;
        if !offered.contains(&format) {
            return Err(Error::StreamFormat(format!(
                "unable to export '{}' as '{}'",
                volname, format
            )));
        }

        let img = self.parse_volname(volname)?.into_image("volume_export")?;
        let handle = self.image_handle(&img);
        if let Some(snap) = snapshot {
            if !self.backend().snapshots(&handle)?.iter().any(|s| s == snap) {
                return Err(Error::NotFound(format!("snapshot '{}' of '{}'", snap, volname)));
            }
        }
        if format.has_size_header() {
            let size = self.backend().volume_size(&handle)?;
            write_size_header(out, size)?;
        }
        self.backend()
            .export(&handle, format, snapshot, base_snapshot, out)?;
        out.flush()?;
        Ok(())
    }

    /// Create a volume from a `format` stream and return its final name
    ///
    /// A volume created by a failed import is removed again before the
    /// error is returned.
    #[instrument(skip(self, input), fields(storage = %self.storeid()))]
    fn volume_import(
        &self,
        volname: &str,
        format: StreamFormat,
        input: &mut dyn Read,
        options: &ImportOptions,
    ) -> Result<String> {
        let base_snapshot = options.base_snapshot.as_deref();
        let accepted = self.volume_import_formats(volname, base_snapshot, options.with_snapshots)?;
        if !accepted.contains(&format) {
            return Err(Error::StreamFormat(format!(
                "unable to import '{}' into '{}'",
                format, volname
            )));
        }

        let img = self.parse_volname(volname)?.into_image("volume_import")?;
        let size = if format.has_size_header() {
            read_size_header(input)?
        } else {
            0
        };

        let grammar = self.grammar();
        self.context().with_lock(|| {
            let mut target = img.clone();
            if base_snapshot.is_none() && self.backend().exists(&self.image_handle(&img))? {
                if !options.allow_rename {
                    return Err(Error::AlreadyExists(format!(
                        "volume '{}'",
                        volume_id(self.storeid(), volname)
                    )));
                }
                let existing = self.backend().list()?;
                let name = find_free_disk_name(
                    existing.iter().map(|v| v.handle.as_str()),
                    img.owner,
                    img.format,
                    grammar,
                )?;
                target = grammar.parse_image_name(&name, img.owner)?;
            }

            let handle = self.image_handle(&target);
            if let Err(e) = self
                .backend()
                .import(&handle, format, size, base_snapshot, input)
            {
                if base_snapshot.is_none() && self.backend().exists(&handle).unwrap_or(false) {
                    warn!(handle = %handle, "import failed, removing partial volume");
                    if let Err(err) = self.backend().delete(&handle) {
                        warn!(handle = %handle, error = %err, "unable to remove partial volume");
                    }
                }
                return Err(e);
            }

            if let Some(snap) = &options.delete_snapshot {
                self.backend().snapshot_delete(&handle, snap)?;
            }

            let target_volname = grammar.encode_image(&target);
            info!(volname = %target_volname, %format, "imported volume");
            Ok(target_volname)
        })
    }

    // === Backups ===

    /// Backup archives, optionally only those of `owner`
    fn list_backups(&self, owner: Option<u32>) -> Result<Vec<BackupInfo>> {
        if !self.config().has_content(ContentType::Backup) {
            return Ok(Vec::new());
        }

        let grammar = self.grammar();
        let mut backups = Vec::new();
        for file in self.backend().list_files(ContentType::Backup)? {
            let Ok(backup) = BackupName::parse(&file.name) else {
                continue;
            };
            if owner.is_some() && backup.owner != owner {
                continue;
            }
            let volname = grammar.encode(&VolumeName::Backup(backup.clone()));
            backups.push(BackupInfo {
                volid: volume_id(self.storeid(), &volname),
                backup,
                size: file.size,
                ctime: file.ctime,
                protected: file.protected,
            });
        }
        backups.sort_by(|a, b| a.volid.cmp(&b.volid));
        Ok(backups)
    }

    /// Apply a retention policy to the backups on this storage
    ///
    /// Without `policy` the storage's configured policy is used. With
    /// `dry_run` nothing is removed. Failing removals don't stop the run,
    /// but make the whole call fail at the end.
    #[instrument(skip(self), fields(storage = %self.storeid()))]
    fn prune_backups(
        &self,
        policy: Option<&PrunePolicy>,
        guest_type: Option<GuestType>,
        owner: Option<u32>,
        dry_run: bool,
    ) -> Result<Vec<PruneItem>> {
        let policy = policy.copied().unwrap_or_else(|| self.config().prune_policy());
        let backups = self.list_backups(owner)?;

        let mut files = HashMap::new();
        let mut items = Vec::new();
        for b in backups {
            if guest_type.is_some() && b.backup.guest_type != guest_type {
                continue;
            }
            items.push(PruneItem::new(b.volid.clone(), &b.backup, b.protected));
            files.insert(b.volid, b.backup.file);
        }

        prune_mark(&mut items, &policy);

        if dry_run {
            return Ok(items);
        }

        let mut failed = 0;
        for item in items.iter().filter(|i| i.mark == PruneMark::Remove) {
            let Some(file) = files.get(&item.volid) else {
                continue;
            };
            match self.backend().remove_file(ContentType::Backup, file) {
                Ok(()) => info!(volid = %item.volid, "removed backup"),
                Err(e) => {
                    warn!(volid = %item.volid, error = %e, "unable to remove backup");
                    failed += 1;
                }
            }
        }
        if failed > 0 {
            return Err(Error::Other("error pruning backups - check log".to_string()));
        }
        Ok(items)
    }

    /// Remove a non-image volume such as a backup archive or ISO image
    fn free_file(&self, volname: &str) -> Result<()> {
        let (content, file) = match self.parse_volname(volname)? {
            VolumeName::Image(_) => return Err(unsupported("free_file on an image volume")),
            VolumeName::Rootdir { .. } => {
                return Err(unsupported(format!("removing container directory '{}'", volname)))
            }
            VolumeName::Iso { file } => (ContentType::Iso, file),
            VolumeName::Vztmpl { file } => (ContentType::Vztmpl, file),
            VolumeName::Snippet { file } => (ContentType::Snippets, file),
            VolumeName::Backup(b) => (ContentType::Backup, b.file),
        };
        self.backend().remove_file(content, &file)?;
        info!(volname = %volname, "removed file");
        Ok(())
    }
}

fn content_handle(content: ContentType, file: &str) -> String {
    format!("{}/{}", content.subdir(), file)
}

/// Creates a plugin for a storage configuration
pub type PluginFactory = Box<dyn Fn(PluginContext) -> Result<Box<dyn StoragePlugin>> + Send + Sync>;

/// Plugin factories by storage type
#[derive(Default)]
pub struct PluginRegistry {
    factories: HashMap<StorageType, PluginFactory>,
}

impl PluginRegistry {
    /// Registry without any plugins
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the plugins shipped with this crate
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for storage_type in StorageType::ALL.iter().copied().filter(|t| t.is_path_based()) {
            registry.register(storage_type, |ctx| Ok(Box::new(DirPlugin::new(ctx)?)));
        }
        registry.register(StorageType::ZfsPool, |ctx| {
            Ok(Box::new(ZfsPoolPlugin::new(ctx)?))
        });
        registry
    }

    pub fn register<F>(&mut self, storage_type: StorageType, factory: F)
    where
        F: Fn(PluginContext) -> Result<Box<dyn StoragePlugin>> + Send + Sync + 'static,
    {
        self.factories.insert(storage_type, Box::new(factory));
    }

    pub fn supports(&self, storage_type: StorageType) -> bool {
        self.factories.contains_key(&storage_type)
    }

    pub fn create(&self, context: PluginContext) -> Result<Box<dyn StoragePlugin>> {
        let storage_type = context.config.storage_type;
        let factory = self.factories.get(&storage_type).ok_or_else(|| {
            unsupported(format!("storage type '{}' has no plugin", storage_type))
        })?;
        factory(context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::config::schema::ParseMode;
    use crate::lock::MemoryLocker;
    use std::io::Cursor;

    fn setup(storage_type: StorageType, props: &[(&str, &str)]) -> (Arc<MockBackend>, Box<dyn StoragePlugin>) {
        let config = StorageConfig::from_properties(
            "store",
            storage_type,
            props.iter().copied(),
            ParseMode::Strict,
        )
        .unwrap();
        let ctx = PluginContext::new(config, Arc::new(MemoryLocker::new()));
        let backend = Arc::new(MockBackend::new());
        let plugin: Box<dyn StoragePlugin> = match storage_type {
            StorageType::ZfsPool => Box::new(ZfsPoolPlugin::with_backend(ctx, backend.clone())),
            _ => Box::new(DirPlugin::with_backend(ctx, backend.clone())),
        };
        (backend, plugin)
    }

    fn dir() -> (Arc<MockBackend>, Box<dyn StoragePlugin>) {
        setup(StorageType::Dir, &[("path", "/srv/images"), ("content", "images,backup")])
    }

    #[test]
    fn test_alloc_picks_free_name() {
        let (backend, plugin) = dir();
        let first = plugin.alloc_image(100, VolumeFormat::Raw, None, 1024).unwrap();
        let second = plugin.alloc_image(100, VolumeFormat::Qcow2, None, 1024).unwrap();
        assert_eq!(first, "100/vm-100-disk-1.raw");
        assert_eq!(second, "100/vm-100-disk-2.qcow2");
        assert_eq!(
            backend.volume_size("images/100/vm-100-disk-1.raw").unwrap(),
            1024 * 1024
        );
    }

    #[test]
    fn test_alloc_named() {
        let (_backend, plugin) = dir();
        let volname = plugin
            .alloc_image(100, VolumeFormat::Raw, Some("vm-100-disk-7.raw"), 4)
            .unwrap();
        assert_eq!(volname, "100/vm-100-disk-7.raw");

        let err = plugin
            .alloc_image(100, VolumeFormat::Raw, Some("vm-100-disk-7.raw"), 4)
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));

        let err = plugin
            .alloc_image(100, VolumeFormat::Raw, Some("vm-101-disk-1.raw"), 4)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidName { .. }));
    }

    #[test]
    fn test_alloc_rejects_undeclared_format() {
        let (_backend, plugin) = setup(StorageType::ZfsPool, &[("pool", "tank")]);
        let err = plugin.alloc_image(100, VolumeFormat::Qcow2, None, 4).unwrap_err();
        assert!(matches!(err, Error::UnsupportedOperation(_)));
    }

    #[test]
    fn test_alloc_failure_removes_partial_image() {
        let (backend, plugin) = dir();
        backend.fail_on("allocate");
        let err = plugin.alloc_image(100, VolumeFormat::Raw, None, 4).unwrap_err();
        assert!(matches!(err, Error::BackendToolFailure { .. }));
        assert!(!backend.exists("images/100/vm-100-disk-1.raw").unwrap());
        assert_eq!(backend.log(), vec!["delete images/100/vm-100-disk-1.raw"]);
    }

    #[test]
    fn test_alloc_size_overflow() {
        let (backend, plugin) = dir();
        let err = plugin
            .alloc_image(100, VolumeFormat::Raw, None, u64::MAX / 512)
            .unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
        assert!(backend.log().is_empty());
    }

    #[test]
    fn test_create_base_and_clone() {
        let (backend, plugin) = dir();
        let volname = plugin.alloc_image(100, VolumeFormat::Raw, None, 4).unwrap();

        let err = plugin.clone_image(&volname, 101, None).unwrap_err();
        assert!(err.to_string().contains("only works on base images"));

        let base = plugin.create_base(&volname).unwrap();
        assert_eq!(base, "100/base-100-disk-1.raw");
        assert!(backend.is_protected("images/100/base-100-disk-1.raw"));

        let err = plugin.create_base(&base).unwrap_err();
        assert!(matches!(err, Error::AlreadyBase(_)));

        let clone = plugin.clone_image(&base, 101, None).unwrap();
        assert_eq!(clone, "100/base-100-disk-1.raw/101/vm-101-disk-1.qcow2");

        let err = plugin.free_image(&base, true).unwrap_err();
        assert!(matches!(err, Error::UnsupportedOperation(_)));

        let images = plugin.list_images(ImageFilter::Owner(101), &mut ListCache::new()).unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].volid, format!("store:{}", clone));
        assert_eq!(images[0].parent.as_deref(), Some("100/base-100-disk-1.raw"));
    }

    #[test]
    fn test_clone_failure_rolls_back() {
        let (backend, plugin) = dir();
        let volname = plugin.alloc_image(100, VolumeFormat::Raw, None, 4).unwrap();
        let base = plugin.create_base(&volname).unwrap();
        backend.fail_on("allocate_linked");
        assert!(plugin.clone_image(&base, 101, None).is_err());
        assert!(!backend.exists("images/101/vm-101-disk-1.qcow2").unwrap());
    }

    #[test]
    fn test_rollback_requires_latest_snapshot() {
        let (_backend, plugin) = setup(StorageType::ZfsPool, &[("pool", "tank")]);
        let volname = plugin.alloc_image(100, VolumeFormat::Raw, None, 4).unwrap();
        plugin.volume_snapshot(&volname, "first").unwrap();
        plugin.volume_snapshot(&volname, "second").unwrap();

        let err = plugin.volume_snapshot_rollback(&volname, "first").unwrap_err();
        match err {
            Error::NotLatestSnapshot { requested, latest } => {
                assert_eq!(requested, "first");
                assert_eq!(latest, "second");
            }
            other => panic!("unexpected error: {}", other),
        }
        plugin.volume_snapshot_rollback(&volname, "second").unwrap();

        let err = plugin.volume_snapshot_rollback(&volname, "third").unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_rollback_to_older_snapshot() {
        let config = StorageConfig::from_properties(
            "store",
            StorageType::Dir,
            [("path", "/srv/images"), ("content", "images")],
            ParseMode::Strict,
        )
        .unwrap();
        let backend = Arc::new(MockBackend::new().with_arbitrary_rollback(true));
        let ctx = PluginContext::new(config, Arc::new(MemoryLocker::new()));
        let plugin = DirPlugin::with_backend(ctx, backend.clone());

        let volname = plugin.alloc_image(100, VolumeFormat::Qcow2, None, 4).unwrap();
        plugin.volume_snapshot(&volname, "first").unwrap();
        plugin.volume_snapshot(&volname, "second").unwrap();
        plugin.volume_snapshot_rollback(&volname, "first").unwrap();
        assert_eq!(
            backend.log().last().map(String::as_str),
            Some("rollback images/100/vm-100-disk-1.qcow2@first")
        );
    }

    #[test]
    fn test_snapshot_gated_by_format() {
        let (_backend, plugin) = dir();
        let raw = plugin.alloc_image(100, VolumeFormat::Raw, None, 4).unwrap();
        let err = plugin.volume_snapshot(&raw, "s1").unwrap_err();
        assert!(matches!(err, Error::UnsupportedOperation(_)));

        let qcow2 = plugin.alloc_image(100, VolumeFormat::Qcow2, None, 4).unwrap();
        plugin.volume_snapshot(&qcow2, "s1").unwrap();
        assert_eq!(plugin.volume_snapshot_list(&qcow2).unwrap(), vec!["s1"]);
        assert!(plugin.volume_has_feature(Feature::Snapshot, &qcow2, None).unwrap());
        assert!(!plugin.volume_has_feature(Feature::Snapshot, &raw, None).unwrap());
    }

    #[test]
    fn test_resize_refuses_shrink() {
        let (backend, plugin) = dir();
        let volname = plugin.alloc_image(100, VolumeFormat::Raw, None, 4).unwrap();
        assert_eq!(plugin.volume_resize(&volname, 8192).unwrap(), 8192);
        assert_eq!(backend.volume_size("images/100/vm-100-disk-1.raw").unwrap(), 8192);
        assert!(plugin.volume_resize(&volname, 1024).is_err());
    }

    #[test]
    fn test_export_import() {
        let (source, plugin) = dir();
        let volname = plugin.alloc_image(100, VolumeFormat::Raw, None, 1).unwrap();
        source
            .write_data("images/100/vm-100-disk-1.raw", &[7u8; 1024])
            .unwrap();

        let mut stream = Vec::new();
        plugin
            .volume_export(&volname, StreamFormat::RawSize, &ExportOptions::default(), &mut stream)
            .unwrap();
        assert_eq!(stream.len(), 8 + 1024);

        let (target, other) = dir();
        let imported = other
            .volume_import(
                &volname,
                StreamFormat::RawSize,
                &mut Cursor::new(stream.clone()),
                &ImportOptions::default(),
            )
            .unwrap();
        assert_eq!(imported, volname);
        assert_eq!(target.data("images/100/vm-100-disk-1.raw").unwrap(), vec![7u8; 1024]);

        let err = other
            .volume_import(
                &volname,
                StreamFormat::RawSize,
                &mut Cursor::new(stream.clone()),
                &ImportOptions::default(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));

        let renamed = other
            .volume_import(
                &volname,
                StreamFormat::RawSize,
                &mut Cursor::new(stream),
                &ImportOptions {
                    allow_rename: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(renamed, "100/vm-100-disk-2.raw");
    }

    #[test]
    fn test_export_qcow2_with_snapshot() {
        let (backend, plugin) = dir();
        let qcow2 = plugin.alloc_image(100, VolumeFormat::Qcow2, None, 1).unwrap();
        backend
            .write_data("images/100/vm-100-disk-1.qcow2", b"QFI")
            .unwrap();
        plugin.volume_snapshot(&qcow2, "before").unwrap();

        let formats = plugin.volume_export_formats(&qcow2, Some("before"), None, false).unwrap();
        assert_eq!(formats, vec![StreamFormat::Qcow2Size]);

        let options = ExportOptions {
            snapshot: Some("before".to_string()),
            ..Default::default()
        };
        let mut stream = Vec::new();
        plugin
            .volume_export(&qcow2, StreamFormat::Qcow2Size, &options, &mut stream)
            .unwrap();
        assert_eq!(&stream[8..], b"QFI");

        let missing = ExportOptions {
            snapshot: Some("after".to_string()),
            ..Default::default()
        };
        let err = plugin
            .volume_export(&qcow2, StreamFormat::Qcow2Size, &missing, &mut Vec::new())
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        let raw = plugin.alloc_image(100, VolumeFormat::Raw, None, 1).unwrap();
        assert!(plugin
            .volume_export_formats(&raw, Some("before"), None, false)
            .unwrap()
            .is_empty());
        let base = ExportOptions {
            base_snapshot: Some("before".to_string()),
            ..Default::default()
        };
        let err = plugin
            .volume_export(&qcow2, StreamFormat::Qcow2Size, &base, &mut Vec::new())
            .unwrap_err();
        assert!(matches!(err, Error::StreamFormat(_)));
    }

    #[test]
    fn test_import_failure_removes_volume() {
        let (backend, plugin) = dir();
        let mut stream = Vec::new();
        write_size_header(&mut stream, 4096).unwrap();
        stream.extend_from_slice(&[1u8; 100]);

        let err = plugin
            .volume_import(
                "100/vm-100-disk-1.raw",
                StreamFormat::RawSize,
                &mut Cursor::new(stream),
                &ImportOptions::default(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::StreamFormat(_)));
        assert!(!backend.exists("images/100/vm-100-disk-1.raw").unwrap());
    }

    #[test]
    fn test_export_format_mismatch() {
        let (_backend, plugin) = dir();
        let volname = plugin.alloc_image(100, VolumeFormat::Raw, None, 1).unwrap();
        let err = plugin
            .volume_export(&volname, StreamFormat::Qcow2Size, &ExportOptions::default(), &mut Vec::new())
            .unwrap_err();
        assert!(matches!(err, Error::StreamFormat(_)));
    }

    #[test]
    fn test_prune_backups() {
        let (backend, plugin) = dir();
        for ts in ["2020_01_01-10_00_00", "2020_01_02-10_00_00", "2020_01_03-10_00_00"] {
            backend.add_file(ContentType::Backup, &format!("vzdump-qemu-100-{}.vma.zst", ts), 0, false);
        }
        backend.add_file(ContentType::Backup, "vzdump-lxc-200-2020_01_01-10_00_00.tar.zst", 0, false);

        let policy: PrunePolicy = "keep-last=1".parse().unwrap();
        let items = plugin
            .prune_backups(Some(&policy), Some(GuestType::Qemu), None, true)
            .unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items.iter().filter(|i| i.mark == PruneMark::Remove).count(), 2);
        assert!(backend.has_file(ContentType::Backup, "vzdump-qemu-100-2020_01_01-10_00_00.vma.zst"));

        plugin
            .prune_backups(Some(&policy), Some(GuestType::Qemu), None, false)
            .unwrap();
        assert!(!backend.has_file(ContentType::Backup, "vzdump-qemu-100-2020_01_01-10_00_00.vma.zst"));
        assert!(backend.has_file(ContentType::Backup, "vzdump-qemu-100-2020_01_03-10_00_00.vma.zst"));
        assert!(backend.has_file(ContentType::Backup, "vzdump-lxc-200-2020_01_01-10_00_00.tar.zst"));
    }

    #[test]
    fn test_prune_counts_failures() {
        let (backend, plugin) = dir();
        backend.add_file(ContentType::Backup, "vzdump-qemu-100-2020_01_01-10_00_00.vma", 0, false);
        backend.add_file(ContentType::Backup, "vzdump-qemu-100-2020_01_02-10_00_00.vma", 0, false);
        backend.fail_on("remove_file");

        let policy: PrunePolicy = "keep-last=1".parse().unwrap();
        let err = plugin.prune_backups(Some(&policy), None, None, false).unwrap_err();
        assert_eq!(err.to_string(), "error pruning backups - check log");
    }

    #[test]
    fn test_registry() {
        let registry = PluginRegistry::with_defaults();
        assert!(registry.supports(StorageType::Nfs));
        assert!(registry.supports(StorageType::ZfsPool));
        assert!(!registry.supports(StorageType::Rbd));

        let config = StorageConfig::from_properties(
            "ceph",
            StorageType::Rbd,
            [("pool", "rbd")],
            ParseMode::Lenient,
        )
        .unwrap();
        let ctx = PluginContext::new(config, Arc::new(MemoryLocker::new()));
        assert!(registry.create(ctx).is_err());
    }
}

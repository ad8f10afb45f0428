//! Volume identifiers and the volume name grammar
//!
//! A volume id has the form `<storage-id>:<volume-name>`. How the volume
//! name decodes depends on the layout of the backend:
//!
//! * [`Layout::Directory`] is used by path-based storages. Image volumes
//!   live below an owner directory (`100/vm-100-disk-1.qcow2`), linked
//!   clones carry their base as a path prefix
//!   (`100/base-100-disk-1.qcow2/101/vm-101-disk-1.qcow2`), and the other
//!   content types use a type prefix (`iso/`, `vztmpl/`, `backup/`, ...).
//! * [`Layout::Flat`] is used by block backends (ZFS, LVM, RBD). Volumes are
//!   plain names (`vm-100-disk-1`, `subvol-100-disk-0`) with an optional
//!   `<base-name>/` prefix for linked clones.

use crate::error::{Error, Result};
use crate::types::{ContentType, GuestType, VolumeFormat};
use chrono::{NaiveDate, NaiveDateTime};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::OnceLock;

/// Highest disk index handed out by [`find_free_disk_name`]
pub const MAX_DISKS_PER_GUEST: u32 = 99;

fn regex(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("Invalid regex pattern"))
}

fn storage_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"^[a-z][a-z0-9_.\-]*[a-z0-9]$")
}

fn dir_image_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"^((base-|basevol-)?[^/\s]+\.(raw|qcow2|vmdk|subvol))$")
}

fn flat_volname_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(
        &RE,
        r"^(?:((?:base|basevol)-(\d+)-[^/\s]+)/)?((base|basevol|vm|subvol)-(\d+)-[^/\s]+)$",
    )
}

fn backup_file_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"^[^/]+\.(?:tgz|(?:tar|vma)(?:\.(?:gz|lzo|zst))?)$")
}

fn backup_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(
        &RE,
        r"^vzdump-(openvz|lxc|qemu)-(\d+)-(?:(\d{4})_(\d{2})_(\d{2})-(\d{2})_(\d{2})_(\d{2})\.)?",
    )
}

fn disk_index_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"^(?:vm|base|subvol|basevol)-(\d+)-disk-(\d+)(?:\.|$)")
}

/// Validate a storage id
pub fn parse_storage_id(id: &str) -> Result<&str> {
    if storage_id_re().is_match(id) {
        Ok(id)
    } else {
        Err(Error::parse("storage ID", id, "invalid format"))
    }
}

/// Split a volume id into storage id and volume name
pub fn parse_volume_id(volid: &str) -> Result<(String, String)> {
    let (storeid, volname) = volid
        .split_once(':')
        .ok_or_else(|| Error::parse("volume ID", volid, "missing storage prefix"))?;
    parse_storage_id(storeid)
        .map_err(|_| Error::parse("volume ID", volid, "invalid storage ID"))?;
    if volname.is_empty() {
        return Err(Error::parse("volume ID", volid, "empty volume name"));
    }
    Ok((storeid.to_string(), volname.to_string()))
}

/// Join a storage id and a volume name
pub fn volume_id(storeid: &str, volname: &str) -> String {
    format!("{}:{}", storeid, volname)
}

/// Naming scheme used by a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layout {
    Directory,
    Flat,
}

/// Base image a linked clone was created from
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParentRef {
    pub owner: u32,
    pub name: String,
}

/// A disk image or container subvolume owned by a guest
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageVolume {
    pub owner: u32,
    /// Image name without any owner or parent prefix
    pub name: String,
    pub format: VolumeFormat,
    pub is_base: bool,
    pub parent: Option<ParentRef>,
    pub content: ContentType,
}

impl ImageVolume {
    /// Name this image gets once converted to a base image
    pub fn base_name(&self) -> Result<String> {
        if self.is_base {
            return Err(Error::AlreadyBase(self.name.clone()));
        }
        if let Some(rest) = self.name.strip_prefix("subvol-") {
            Ok(format!("basevol-{}", rest))
        } else if let Some(rest) = self.name.strip_prefix("vm-") {
            Ok(format!("base-{}", rest))
        } else {
            Err(Error::invalid_name(&self.name, "expected 'vm-' or 'subvol-' prefix"))
        }
    }
}

/// File name of a guest backup archive
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackupName {
    pub file: String,
    pub guest_type: Option<GuestType>,
    pub owner: Option<u32>,
    /// Timestamp embedded in standard names, in the backup host's local time
    pub ctime: Option<NaiveDateTime>,
}

impl BackupName {
    /// Decode a backup archive file name
    ///
    /// Names that do not follow `vzdump-<type>-<id>-YYYY_MM_DD-hh_mm_ss.<ext>`
    /// are still valid backups, they just carry less information.
    pub fn parse(file: &str) -> Result<Self> {
        if !backup_file_re().is_match(file) {
            return Err(Error::parse("backup file name", file, "unknown archive extension"));
        }

        let mut backup = BackupName {
            file: file.to_string(),
            guest_type: None,
            owner: None,
            ctime: None,
        };

        if let Some(caps) = backup_name_re().captures(file) {
            backup.guest_type = caps[1].parse().ok();
            backup.owner = caps[2].parse().ok();
            if caps.get(3).is_some() {
                let num = |i: usize| caps[i].parse::<u32>().unwrap_or(u32::MAX);
                backup.ctime = NaiveDate::from_ymd_opt(num(3) as i32, num(4), num(5))
                    .and_then(|d| d.and_hms_opt(num(6), num(7), num(8)));
            }
        }

        Ok(backup)
    }

    /// Whether the name follows the standard timestamped scheme
    pub fn is_standard(&self) -> bool {
        self.guest_type.is_some() && self.owner.is_some() && self.ctime.is_some()
    }
}

/// Decoded volume name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "vtype", rename_all = "lowercase")]
pub enum VolumeName {
    Image(ImageVolume),
    Rootdir { owner: u32 },
    Iso { file: String },
    Vztmpl { file: String },
    Snippet { file: String },
    Backup(BackupName),
}

impl VolumeName {
    pub fn content(&self) -> ContentType {
        match self {
            VolumeName::Image(img) => img.content,
            VolumeName::Rootdir { .. } => ContentType::Rootdir,
            VolumeName::Iso { .. } => ContentType::Iso,
            VolumeName::Vztmpl { .. } => ContentType::Vztmpl,
            VolumeName::Snippet { .. } => ContentType::Snippets,
            VolumeName::Backup(_) => ContentType::Backup,
        }
    }

    pub fn owner(&self) -> Option<u32> {
        match self {
            VolumeName::Image(img) => Some(img.owner),
            VolumeName::Rootdir { owner } => Some(*owner),
            VolumeName::Backup(b) => b.owner,
            _ => None,
        }
    }

    pub fn format(&self) -> Option<VolumeFormat> {
        self.as_image().map(|img| img.format)
    }

    pub fn is_base(&self) -> bool {
        self.as_image().map(|img| img.is_base).unwrap_or(false)
    }

    pub fn as_image(&self) -> Option<&ImageVolume> {
        match self {
            VolumeName::Image(img) => Some(img),
            _ => None,
        }
    }

    /// Return the image, or an error naming the operation
    pub fn into_image(self, operation: &str) -> Result<ImageVolume> {
        match self {
            VolumeName::Image(img) => Ok(img),
            other => Err(Error::UnsupportedOperation(format!(
                "{} on wrong content type '{}'",
                operation,
                other.content()
            ))),
        }
    }
}

/// Backend-specific volume name parser and encoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NameGrammar {
    layout: Layout,
}

impl NameGrammar {
    pub fn new(layout: Layout) -> Self {
        Self { layout }
    }

    pub fn directory() -> Self {
        Self::new(Layout::Directory)
    }

    pub fn flat() -> Self {
        Self::new(Layout::Flat)
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// Parse a volume name
    pub fn parse(&self, volname: &str) -> Result<VolumeName> {
        match self.layout {
            Layout::Directory => parse_directory(volname),
            Layout::Flat => parse_flat(volname).map(VolumeName::Image),
        }
    }

    /// Encode a volume name, the inverse of [`NameGrammar::parse`]
    ///
    /// Non-image variants always use the directory form since only
    /// path-based storages hold them.
    pub fn encode(&self, volume: &VolumeName) -> String {
        match volume {
            VolumeName::Image(img) => self.encode_image(img),
            VolumeName::Rootdir { owner } => format!("rootdir/{}", owner),
            VolumeName::Iso { file } => format!("iso/{}", file),
            VolumeName::Vztmpl { file } => format!("vztmpl/{}", file),
            VolumeName::Snippet { file } => format!("snippets/{}", file),
            VolumeName::Backup(b) => format!("backup/{}", b.file),
        }
    }

    pub fn encode_image(&self, img: &ImageVolume) -> String {
        match (self.layout, &img.parent) {
            (Layout::Directory, Some(p)) => {
                format!("{}/{}/{}/{}", p.owner, p.name, img.owner, img.name)
            }
            (Layout::Directory, None) => format!("{}/{}", img.owner, img.name),
            (Layout::Flat, Some(p)) => format!("{}/{}", p.name, img.name),
            (Layout::Flat, None) => img.name.clone(),
        }
    }

    /// Decode a bare image name (no owner or parent prefix) owned by `owner`
    pub fn parse_image_name(&self, name: &str, owner: u32) -> Result<ImageVolume> {
        match self.layout {
            Layout::Directory => {
                let (format, is_base) = parse_dir_image_name(name)?;
                Ok(ImageVolume {
                    owner,
                    name: name.to_string(),
                    format,
                    is_base,
                    parent: None,
                    content: ContentType::Images,
                })
            }
            Layout::Flat => {
                let img = parse_flat(name)?;
                if img.parent.is_some() {
                    return Err(Error::parse("volume name", name, "unexpected parent prefix"));
                }
                Ok(img)
            }
        }
    }

    /// Validate a caller-supplied name for a new image
    pub fn check_new_image_name(
        &self,
        name: &str,
        owner: u32,
        format: VolumeFormat,
    ) -> Result<ImageVolume> {
        let img = self
            .parse_image_name(name, owner)
            .map_err(|e| Error::invalid_name(name, e.to_string()))?;

        if img.format != format {
            return Err(Error::invalid_name(
                name,
                format!("wrong extension for format ('{}' != '{}')", img.format, format),
            ));
        }

        let vm_prefix = format!("vm-{}-", owner);
        let subvol_prefix = format!("subvol-{}-", owner);
        if !name.starts_with(&vm_prefix) && !name.starts_with(&subvol_prefix) {
            return Err(Error::invalid_name(name, format!("should be '{}*'", vm_prefix)));
        }

        Ok(img)
    }

    /// Name for disk `index` of `owner`
    pub fn disk_name(&self, owner: u32, index: u32, format: VolumeFormat) -> String {
        match (self.layout, format) {
            (Layout::Directory, VolumeFormat::Subvol) => {
                format!("subvol-{}-disk-{}.subvol", owner, index)
            }
            (Layout::Directory, _) => format!("vm-{}-disk-{}.{}", owner, index, format),
            (Layout::Flat, VolumeFormat::Subvol) => format!("subvol-{}-disk-{}", owner, index),
            (Layout::Flat, _) => format!("vm-{}-disk-{}", owner, index),
        }
    }
}

fn parse_dir_image_name(name: &str) -> Result<(VolumeFormat, bool)> {
    let caps = dir_image_name_re()
        .captures(name)
        .ok_or_else(|| Error::parse("volume filename", name, "unknown image name"))?;
    let format = caps[3]
        .parse::<VolumeFormat>()
        .map_err(|e| Error::parse("volume filename", name, e))?;
    Ok((format, caps.get(2).is_some()))
}

fn parse_owner(input: &str, digits: &str) -> Result<u32> {
    digits
        .parse()
        .map_err(|_| Error::parse("volume name", input, "guest ID out of range"))
}

fn parse_directory(volname: &str) -> Result<VolumeName> {
    let parts: Vec<&str> = volname.split('/').collect();

    if let Some((prefix, file)) = volname.split_once('/') {
        match prefix {
            "iso" if !file.contains('/') && (file.ends_with(".iso") || file.ends_with(".img")) => {
                return Ok(VolumeName::Iso { file: file.to_string() });
            }
            "vztmpl"
                if !file.contains('/')
                    && [".tar.gz", ".tar.xz", ".tar.zst"].iter().any(|e| file.ends_with(e)) =>
            {
                return Ok(VolumeName::Vztmpl { file: file.to_string() });
            }
            "snippets" if !file.is_empty() && !file.contains('/') => {
                return Ok(VolumeName::Snippet { file: file.to_string() });
            }
            "backup" if !file.contains('/') => {
                return BackupName::parse(file).map(VolumeName::Backup);
            }
            "rootdir" if !file.is_empty() && file.chars().all(|c| c.is_ascii_digit()) => {
                return Ok(VolumeName::Rootdir {
                    owner: parse_owner(volname, file)?,
                });
            }
            _ => {}
        }
    }

    let is_owner = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit());

    match parts.as_slice() {
        [owner, name] if is_owner(owner) => {
            let (format, is_base) = parse_dir_image_name(name)?;
            Ok(VolumeName::Image(ImageVolume {
                owner: parse_owner(volname, owner)?,
                name: name.to_string(),
                format,
                is_base,
                parent: None,
                content: ContentType::Images,
            }))
        }
        [parent_owner, parent_name, owner, name] if is_owner(parent_owner) && is_owner(owner) => {
            parse_dir_image_name(parent_name)?;
            let (format, is_base) = parse_dir_image_name(name)?;
            Ok(VolumeName::Image(ImageVolume {
                owner: parse_owner(volname, owner)?,
                name: name.to_string(),
                format,
                is_base,
                parent: Some(ParentRef {
                    owner: parse_owner(volname, parent_owner)?,
                    name: parent_name.to_string(),
                }),
                content: ContentType::Images,
            }))
        }
        _ => Err(Error::parse("directory volume name", volname, "unknown layout")),
    }
}

fn parse_flat(volname: &str) -> Result<ImageVolume> {
    let caps = flat_volname_re()
        .captures(volname)
        .ok_or_else(|| Error::parse("volume name", volname, "unknown layout"))?;

    let parent = match (caps.get(1), caps.get(2)) {
        (Some(name), Some(owner)) => Some(ParentRef {
            owner: parse_owner(volname, owner.as_str())?,
            name: name.as_str().to_string(),
        }),
        _ => None,
    };

    let kind = &caps[4];
    let (format, content) = if kind == "subvol" || kind == "basevol" {
        (VolumeFormat::Subvol, ContentType::Rootdir)
    } else {
        (VolumeFormat::Raw, ContentType::Images)
    };

    Ok(ImageVolume {
        owner: parse_owner(volname, &caps[5])?,
        name: caps[3].to_string(),
        format,
        is_base: kind == "base" || kind == "basevol",
        parent,
        content,
    })
}

/// Pick the lowest free disk index for `owner`
///
/// `existing` may contain bare image names or full volume names; only the
/// last path component is inspected. The result depends only on the set of
/// indices in use, never on iteration order.
pub fn find_free_disk_name<'a, I>(
    existing: I,
    owner: u32,
    format: VolumeFormat,
    grammar: NameGrammar,
) -> Result<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let used: BTreeSet<u32> = existing
        .into_iter()
        .filter_map(|name| {
            let name = name.rsplit('/').next().unwrap_or(name);
            let caps = disk_index_re().captures(name)?;
            let disk_owner: u32 = caps[1].parse().ok()?;
            if disk_owner != owner {
                return None;
            }
            caps[2].parse().ok()
        })
        .collect();

    (1..=MAX_DISKS_PER_GUEST)
        .find(|n| !used.contains(n))
        .map(|n| grammar.disk_name(owner, n, format))
        .ok_or(Error::NoFreeSlot(owner))
}

impl fmt::Display for ImageVolume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dir() -> NameGrammar {
        NameGrammar::directory()
    }

    #[test]
    fn test_parse_volume_id() {
        let (store, vol) = parse_volume_id("local:100/vm-100-disk-1.qcow2").unwrap();
        assert_eq!(store, "local");
        assert_eq!(vol, "100/vm-100-disk-1.qcow2");

        assert!(parse_volume_id("100/vm-100-disk-1.qcow2").is_err());
        assert!(parse_volume_id("Local:foo").is_err());
        assert!(parse_volume_id("local-:foo").is_err());
        assert!(parse_volume_id("local:").is_err());
    }

    #[test]
    fn test_storage_id_rules() {
        assert!(parse_storage_id("local").is_ok());
        assert!(parse_storage_id("nfs-store.1").is_ok());
        assert!(parse_storage_id("a").is_err());
        assert!(parse_storage_id("1abc").is_err());
        assert!(parse_storage_id("abc_").is_err());
    }

    #[test]
    fn test_parse_directory_image() {
        let vol = dir().parse("100/vm-100-disk-1.qcow2").unwrap();
        let img = vol.as_image().unwrap();
        assert_eq!(img.owner, 100);
        assert_eq!(img.name, "vm-100-disk-1.qcow2");
        assert_eq!(img.format, VolumeFormat::Qcow2);
        assert!(!img.is_base);
        assert!(img.parent.is_none());
    }

    #[test]
    fn test_parse_linked_clone() {
        let vol = dir()
            .parse("100/base-100-disk-1.raw/101/vm-101-disk-1.qcow2")
            .unwrap();
        let img = vol.as_image().unwrap();
        assert_eq!(img.owner, 101);
        assert_eq!(
            img.parent,
            Some(ParentRef {
                owner: 100,
                name: "base-100-disk-1.raw".to_string()
            })
        );
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for name in [
            "100/vm-100-disk-1.qcow3",
            "100/vm 100.raw",
            "abc/vm-100-disk-1.raw",
            "100/base-100-disk-1.raw/101",
            "iso/foo.txt",
            "vztmpl/debian.tar.bz2",
            "backup/vzdump-qemu-100.log",
            "",
        ] {
            assert!(dir().parse(name).is_err(), "'{}' should be rejected", name);
        }
    }

    #[test]
    fn test_parse_other_content() {
        assert_eq!(
            dir().parse("iso/debian.iso").unwrap(),
            VolumeName::Iso { file: "debian.iso".into() }
        );
        assert_eq!(
            dir().parse("vztmpl/debian-12.tar.zst").unwrap(),
            VolumeName::Vztmpl { file: "debian-12.tar.zst".into() }
        );
        assert_eq!(
            dir().parse("snippets/user.yaml").unwrap(),
            VolumeName::Snippet { file: "user.yaml".into() }
        );
        assert_eq!(dir().parse("rootdir/105").unwrap(), VolumeName::Rootdir { owner: 105 });

        let backup = dir()
            .parse("backup/vzdump-lxc-105-2020_01_01-11_18_00.tar.zst")
            .unwrap();
        assert_eq!(backup.owner(), Some(105));
        assert_eq!(backup.content(), ContentType::Backup);
    }

    #[test]
    fn test_parse_flat() {
        let g = NameGrammar::flat();
        let img = g.parse("vm-100-disk-0").unwrap().into_image("test").unwrap();
        assert_eq!(img.format, VolumeFormat::Raw);
        assert_eq!(img.content, ContentType::Images);

        let img = g.parse("subvol-101-disk-1").unwrap().into_image("test").unwrap();
        assert_eq!(img.format, VolumeFormat::Subvol);
        assert_eq!(img.content, ContentType::Rootdir);

        let img = g
            .parse("base-100-disk-0/vm-102-disk-0")
            .unwrap()
            .into_image("test")
            .unwrap();
        assert_eq!(img.owner, 102);
        assert_eq!(img.parent.unwrap().owner, 100);

        assert!(g.parse("vm-100-disk-0/vm-101-disk-0").is_err());
        assert!(g.parse("disk-100").is_err());
    }

    #[test]
    fn test_round_trip() {
        let dir_names = [
            "100/vm-100-disk-1.qcow2",
            "100/base-100-disk-2.raw",
            "100/base-100-disk-1.raw/101/vm-101-disk-1.qcow2",
            "200/subvol-200-disk-0.subvol",
            "iso/debian.iso",
            "vztmpl/alpine.tar.xz",
            "snippets/hook.pl",
            "rootdir/300",
            "backup/vzdump-qemu-100-2019_12_31-11_18_00.vma.zst",
            "backup/custom-name.tar",
        ];
        for name in dir_names {
            let parsed = dir().parse(name).unwrap();
            let encoded = dir().encode(&parsed);
            assert_eq!(encoded, name);
            assert_eq!(dir().parse(&encoded).unwrap(), parsed);
        }

        let g = NameGrammar::flat();
        for name in [
            "vm-100-disk-0",
            "base-100-disk-0",
            "basevol-100-disk-1/subvol-101-disk-0",
            "base-100-disk-0/vm-101-disk-3",
        ] {
            let parsed = g.parse(name).unwrap();
            assert_eq!(g.encode(&parsed), name);
        }
    }

    #[test]
    fn test_check_new_image_name() {
        let g = dir();
        assert!(g
            .check_new_image_name("vm-100-disk-5.raw", 100, VolumeFormat::Raw)
            .is_ok());

        let err = g
            .check_new_image_name("vm-100-disk-5.raw", 100, VolumeFormat::Qcow2)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidName { .. }));
        assert!(err.to_string().contains("wrong extension"));

        let err = g
            .check_new_image_name("vm-101-disk-5.raw", 100, VolumeFormat::Raw)
            .unwrap_err();
        assert!(err.to_string().contains("should be 'vm-100-*'"));

        assert!(g
            .check_new_image_name("base-100-disk-1.raw", 100, VolumeFormat::Raw)
            .is_err());
    }

    #[test]
    fn test_find_free_disk_name_lowest() {
        let g = dir();
        let existing = [
            "vm-100-disk-1.raw",
            "vm-100-disk-2.qcow2",
            "base-100-disk-4.raw",
            "vm-101-disk-3.raw",
        ];
        let name = find_free_disk_name(existing, 100, VolumeFormat::Qcow2, g).unwrap();
        assert_eq!(name, "vm-100-disk-3.qcow2");

        let name = find_free_disk_name(existing, 101, VolumeFormat::Raw, g).unwrap();
        assert_eq!(name, "vm-101-disk-1.raw");
    }

    #[test]
    fn test_find_free_disk_name_order_independent() {
        let g = NameGrammar::flat();
        let mut names = vec![
            "vm-100-disk-1".to_string(),
            "vm-100-disk-3".to_string(),
            "subvol-100-disk-2".to_string(),
            "base-100-disk-0/vm-100-disk-5".to_string(),
        ];
        let first = find_free_disk_name(names.iter().map(String::as_str), 100, VolumeFormat::Raw, g)
            .unwrap();
        names.reverse();
        let second = find_free_disk_name(names.iter().map(String::as_str), 100, VolumeFormat::Raw, g)
            .unwrap();
        names.swap(0, 2);
        let third = find_free_disk_name(names.iter().map(String::as_str), 100, VolumeFormat::Raw, g)
            .unwrap();
        assert_eq!(first, "vm-100-disk-4");
        assert_eq!(first, second);
        assert_eq!(first, third);
    }

    #[test]
    fn test_find_free_disk_name_exhausted() {
        let names: Vec<String> = (1..=MAX_DISKS_PER_GUEST)
            .map(|n| format!("vm-7-disk-{}.raw", n))
            .collect();
        let err = find_free_disk_name(
            names.iter().map(String::as_str),
            7,
            VolumeFormat::Raw,
            dir(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::NoFreeSlot(7)));
    }

    #[test]
    fn test_backup_name() {
        let b = BackupName::parse("vzdump-qemu-100-2019_12_31-11_18_00.vma.zst").unwrap();
        assert!(b.is_standard());
        assert_eq!(b.guest_type, Some(GuestType::Qemu));
        assert_eq!(b.owner, Some(100));
        assert_eq!(
            b.ctime.unwrap().to_string(),
            "2019-12-31 11:18:00"
        );

        let b = BackupName::parse("vzdump-openvz-200-renamed.tgz").unwrap();
        assert_eq!(b.guest_type, Some(GuestType::Lxc));
        assert_eq!(b.owner, Some(200));
        assert!(!b.is_standard());

        let b = BackupName::parse("my-backup.vma").unwrap();
        assert!(b.owner.is_none());

        assert!(BackupName::parse("notes.txt").is_err());
    }

    #[test]
    fn test_base_name() {
        let g = NameGrammar::flat();
        let img = g.parse("subvol-100-disk-0").unwrap().into_image("t").unwrap();
        assert_eq!(img.base_name().unwrap(), "basevol-100-disk-0");
        let img = g.parse("base-100-disk-0").unwrap().into_image("t").unwrap();
        assert!(matches!(img.base_name(), Err(Error::AlreadyBase(_))));
    }
}

//! Core types shared by the storage layer

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of backing store behind a storage id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Dir,
    Nfs,
    Cifs,
    Glusterfs,
    Cephfs,
    Btrfs,
    ZfsPool,
    Lvm,
    LvmThin,
    Rbd,
    Iscsi,
    Pbs,
}

impl StorageType {
    /// All supported storage types
    pub const ALL: [StorageType; 12] = [
        StorageType::Dir,
        StorageType::Nfs,
        StorageType::Cifs,
        StorageType::Glusterfs,
        StorageType::Cephfs,
        StorageType::Btrfs,
        StorageType::ZfsPool,
        StorageType::Lvm,
        StorageType::LvmThin,
        StorageType::Rbd,
        StorageType::Iscsi,
        StorageType::Pbs,
    ];

    /// Name used in the section file header
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageType::Dir => "dir",
            StorageType::Nfs => "nfs",
            StorageType::Cifs => "cifs",
            StorageType::Glusterfs => "glusterfs",
            StorageType::Cephfs => "cephfs",
            StorageType::Btrfs => "btrfs",
            StorageType::ZfsPool => "zfspool",
            StorageType::Lvm => "lvm",
            StorageType::LvmThin => "lvmthin",
            StorageType::Rbd => "rbd",
            StorageType::Iscsi => "iscsi",
            StorageType::Pbs => "pbs",
        }
    }

    /// Whether every node sees the same backing store
    pub fn is_shared_by_default(&self) -> bool {
        matches!(
            self,
            StorageType::Nfs
                | StorageType::Cifs
                | StorageType::Glusterfs
                | StorageType::Cephfs
                | StorageType::Rbd
                | StorageType::Iscsi
                | StorageType::Pbs
        )
    }

    /// Whether volumes are files below a mounted directory
    pub fn is_path_based(&self) -> bool {
        matches!(
            self,
            StorageType::Dir
                | StorageType::Nfs
                | StorageType::Cifs
                | StorageType::Glusterfs
                | StorageType::Cephfs
                | StorageType::Btrfs
        )
    }

    /// Whether the type mounts a remote filesystem below `/mnt/pve/<id>`
    pub fn is_network_mount(&self) -> bool {
        matches!(
            self,
            StorageType::Nfs | StorageType::Cifs | StorageType::Glusterfs | StorageType::Cephfs
        )
    }
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for StorageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StorageType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown storage type '{}'", s))
    }
}

/// Semantic class of data a storage may hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Images,
    Rootdir,
    Vztmpl,
    Iso,
    Backup,
    Snippets,
    None,
}

impl ContentType {
    pub const ALL: [ContentType; 7] = [
        ContentType::Images,
        ContentType::Rootdir,
        ContentType::Vztmpl,
        ContentType::Iso,
        ContentType::Backup,
        ContentType::Snippets,
        ContentType::None,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Images => "images",
            ContentType::Rootdir => "rootdir",
            ContentType::Vztmpl => "vztmpl",
            ContentType::Iso => "iso",
            ContentType::Backup => "backup",
            ContentType::Snippets => "snippets",
            ContentType::None => "none",
        }
    }

    /// Subdirectory used by path-based storages
    pub fn subdir(&self) -> &'static str {
        match self {
            ContentType::Images => "images",
            ContentType::Rootdir => "private",
            ContentType::Vztmpl => "template/cache",
            ContentType::Iso => "template/iso",
            ContentType::Backup => "dump",
            ContentType::Snippets => "snippets",
            ContentType::None => "",
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ContentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ContentType::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown content type '{}'", s))
    }
}

/// On-disk format of an image volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeFormat {
    Raw,
    Qcow2,
    Vmdk,
    Subvol,
}

impl VolumeFormat {
    pub const ALL: [VolumeFormat; 4] = [
        VolumeFormat::Raw,
        VolumeFormat::Qcow2,
        VolumeFormat::Vmdk,
        VolumeFormat::Subvol,
    ];

    /// File extension, identical to the format name
    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeFormat::Raw => "raw",
            VolumeFormat::Qcow2 => "qcow2",
            VolumeFormat::Vmdk => "vmdk",
            VolumeFormat::Subvol => "subvol",
        }
    }
}

impl fmt::Display for VolumeFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for VolumeFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        VolumeFormat::ALL
            .iter()
            .copied()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| format!("unknown volume format '{}'", s))
    }
}

/// Kind of guest that owns a backup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuestType {
    Qemu,
    Lxc,
}

impl GuestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GuestType::Qemu => "qemu",
            GuestType::Lxc => "lxc",
        }
    }
}

impl fmt::Display for GuestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for GuestType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "qemu" => Ok(GuestType::Qemu),
            // openvz backups are restored as containers
            "lxc" | "openvz" => Ok(GuestType::Lxc),
            _ => Err(format!("unknown guest type '{}'", s)),
        }
    }
}

/// Operation class consulted in the capability matrix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Feature {
    Snapshot,
    Clone,
    Copy,
    Template,
    SparseInit,
    Replicate,
    Rename,
}

impl Feature {
    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::Snapshot => "snapshot",
            Feature::Clone => "clone",
            Feature::Copy => "copy",
            Feature::Template => "template",
            Feature::SparseInit => "sparseinit",
            Feature::Replicate => "replicate",
            Feature::Rename => "rename",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Feature {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "snapshot" => Ok(Feature::Snapshot),
            "clone" => Ok(Feature::Clone),
            "copy" => Ok(Feature::Copy),
            "template" => Ok(Feature::Template),
            "sparseinit" => Ok(Feature::SparseInit),
            "replicate" => Ok(Feature::Replicate),
            "rename" => Ok(Feature::Rename),
            _ => Err(format!("unknown feature '{}'", s)),
        }
    }
}

/// Role of a volume when asking the capability matrix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeRole {
    Base,
    Current,
    Snap,
}

impl VolumeRole {
    /// Role of a volume, given whether it is a base image and whether a snapshot is addressed
    pub fn of(is_base: bool, snapshot: Option<&str>) -> Self {
        match (snapshot, is_base) {
            (Some(_), _) => VolumeRole::Snap,
            (None, true) => VolumeRole::Base,
            (None, false) => VolumeRole::Current,
        }
    }
}

/// Information about an image volume returned by listings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub volid: String,
    pub format: VolumeFormat,
    pub content: ContentType,
    /// Virtual size in bytes
    pub size: u64,
    /// Allocated bytes, when the backend reports it
    pub used: Option<u64>,
    pub owner: Option<u32>,
    /// Volume name of the parent base image for linked clones
    pub parent: Option<String>,
    /// Creation time in seconds since the epoch
    pub ctime: Option<i64>,
}

/// Capacity report of a storage, in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StorageStatus {
    pub total: u64,
    pub avail: u64,
    pub used: u64,
    /// false when the backend is reachable but not initialized
    pub active: bool,
}

impl StorageStatus {
    /// Percentage of used space, 0 for empty storages
    pub fn used_fraction(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.used as f64 / self.total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_type_names() {
        for t in StorageType::ALL {
            assert_eq!(t.as_str().parse::<StorageType>().unwrap(), t);
        }
        assert!("sheepdog".parse::<StorageType>().is_err());
    }

    #[test]
    fn test_openvz_maps_to_lxc() {
        assert_eq!("openvz".parse::<GuestType>().unwrap(), GuestType::Lxc);
    }

    #[test]
    fn test_volume_role() {
        assert_eq!(VolumeRole::of(true, None), VolumeRole::Base);
        assert_eq!(VolumeRole::of(false, None), VolumeRole::Current);
        assert_eq!(VolumeRole::of(true, Some("s1")), VolumeRole::Snap);
    }
}

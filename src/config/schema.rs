//! Per-backend property declarations and value decoding

use crate::error::{Error, Result};
use crate::prune::PrunePolicy;
use crate::types::{ContentType, StorageType, VolumeFormat};
use crate::volname::parse_storage_id;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::warn;

/// Value type of a storage property
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropKind {
    String,
    Bool,
    Integer,
    Content,
    Nodes,
    Format,
    Path,
    Prune,
}

/// Declaration of a storage property
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropDecl {
    pub key: &'static str,
    pub kind: PropKind,
    /// Can only be set when the storage is created
    pub fixed: bool,
    /// Must be set when the storage is created
    pub required: bool,
}

const fn opt(key: &'static str, kind: PropKind) -> PropDecl {
    PropDecl {
        key,
        kind,
        fixed: false,
        required: false,
    }
}

const fn fixed(key: &'static str, kind: PropKind) -> PropDecl {
    PropDecl {
        key,
        kind,
        fixed: true,
        required: false,
    }
}

const fn required(key: &'static str, kind: PropKind) -> PropDecl {
    PropDecl {
        key,
        kind,
        fixed: true,
        required: true,
    }
}

static COMMON: &[PropDecl] = &[
    opt("content", PropKind::Content),
    opt("nodes", PropKind::Nodes),
    opt("disable", PropKind::Bool),
    opt("shared", PropKind::Bool),
    opt("format", PropKind::Format),
    opt("prune-backups", PropKind::Prune),
    opt("maxfiles", PropKind::Integer),
];

static DIR: &[PropDecl] = &[
    required("path", PropKind::Path),
    opt("mkdir", PropKind::Bool),
    opt("is_mountpoint", PropKind::String),
    opt("preallocation", PropKind::String),
];

static NFS: &[PropDecl] = &[
    fixed("path", PropKind::Path),
    required("server", PropKind::String),
    required("export", PropKind::String),
    opt("options", PropKind::String),
    opt("mkdir", PropKind::Bool),
    opt("preallocation", PropKind::String),
];

static CIFS: &[PropDecl] = &[
    fixed("path", PropKind::Path),
    required("server", PropKind::String),
    required("share", PropKind::String),
    opt("username", PropKind::String),
    opt("domain", PropKind::String),
    opt("smbversion", PropKind::String),
    opt("subdir", PropKind::String),
    opt("options", PropKind::String),
    opt("mkdir", PropKind::Bool),
];

static GLUSTERFS: &[PropDecl] = &[
    fixed("path", PropKind::Path),
    PropDecl {
        key: "server",
        kind: PropKind::String,
        fixed: false,
        required: true,
    },
    opt("server2", PropKind::String),
    required("volume", PropKind::String),
    opt("transport", PropKind::String),
];

static CEPHFS: &[PropDecl] = &[
    fixed("path", PropKind::Path),
    opt("monhost", PropKind::String),
    opt("subdir", PropKind::String),
    opt("username", PropKind::String),
    opt("fuse", PropKind::Bool),
    opt("fs-name", PropKind::String),
];

static BTRFS: &[PropDecl] = &[required("path", PropKind::Path)];

static ZFSPOOL: &[PropDecl] = &[
    required("pool", PropKind::String),
    opt("blocksize", PropKind::String),
    opt("sparse", PropKind::Bool),
    opt("mountpoint", PropKind::String),
];

static LVM: &[PropDecl] = &[
    required("vgname", PropKind::String),
    fixed("base", PropKind::String),
    opt("saferemove", PropKind::Bool),
    opt("tagged_only", PropKind::Bool),
];

static LVMTHIN: &[PropDecl] = &[
    required("vgname", PropKind::String),
    required("thinpool", PropKind::String),
];

static RBD: &[PropDecl] = &[
    opt("pool", PropKind::String),
    opt("monhost", PropKind::String),
    opt("username", PropKind::String),
    opt("krbd", PropKind::Bool),
    opt("namespace", PropKind::String),
    opt("data-pool", PropKind::String),
];

static ISCSI: &[PropDecl] = &[
    required("portal", PropKind::String),
    required("target", PropKind::String),
];

static PBS: &[PropDecl] = &[
    required("server", PropKind::String),
    required("datastore", PropKind::String),
    opt("username", PropKind::String),
    opt("fingerprint", PropKind::String),
    opt("namespace", PropKind::String),
    opt("port", PropKind::Integer),
];

fn type_properties(storage_type: StorageType) -> &'static [PropDecl] {
    match storage_type {
        StorageType::Dir => DIR,
        StorageType::Nfs => NFS,
        StorageType::Cifs => CIFS,
        StorageType::Glusterfs => GLUSTERFS,
        StorageType::Cephfs => CEPHFS,
        StorageType::Btrfs => BTRFS,
        StorageType::ZfsPool => ZFSPOOL,
        StorageType::Lvm => LVM,
        StorageType::LvmThin => LVMTHIN,
        StorageType::Rbd => RBD,
        StorageType::Iscsi => ISCSI,
        StorageType::Pbs => PBS,
    }
}

/// All properties a storage type accepts
pub fn properties(storage_type: StorageType) -> impl Iterator<Item = &'static PropDecl> {
    let has_formats = !type_info(storage_type).formats.is_empty();
    COMMON
        .iter()
        .filter(move |d| d.key != "format" || has_formats)
        .chain(type_properties(storage_type).iter())
}

/// Declaration of `key` for `storage_type`
pub fn lookup(storage_type: StorageType, key: &str) -> Option<&'static PropDecl> {
    properties(storage_type).find(|d| d.key == key)
}

/// Content types and image formats a storage type can hold
#[derive(Debug, Clone, Copy)]
pub struct TypeInfo {
    pub content: &'static [ContentType],
    pub default_content: &'static [ContentType],
    pub formats: &'static [VolumeFormat],
    pub default_format: Option<VolumeFormat>,
}

/// Static description of a storage type
pub fn type_info(storage_type: StorageType) -> TypeInfo {
    use ContentType::*;
    use VolumeFormat::{Qcow2, Raw, Subvol, Vmdk};

    const FILE_CONTENT: &[ContentType] = &[Images, Rootdir, Vztmpl, Iso, Backup, Snippets, None];
    const FILE_FORMATS: &[VolumeFormat] = &[Raw, Qcow2, Vmdk, Subvol];

    match storage_type {
        StorageType::Dir => TypeInfo {
            content: FILE_CONTENT,
            default_content: &[Images, Rootdir],
            formats: FILE_FORMATS,
            default_format: Some(Raw),
        },
        StorageType::Nfs | StorageType::Cifs => TypeInfo {
            content: FILE_CONTENT,
            default_content: &[Images],
            formats: FILE_FORMATS,
            default_format: Some(Raw),
        },
        StorageType::Glusterfs => TypeInfo {
            content: &[Images, Vztmpl, Iso, Backup, Snippets],
            default_content: &[Images],
            formats: &[Raw, Qcow2, Vmdk],
            default_format: Some(Raw),
        },
        StorageType::Cephfs => TypeInfo {
            content: &[Vztmpl, Iso, Backup, Snippets],
            default_content: &[Backup],
            formats: &[],
            default_format: Option::None,
        },
        StorageType::Btrfs => TypeInfo {
            content: FILE_CONTENT,
            default_content: &[Images, Rootdir],
            formats: &[Raw, Subvol],
            default_format: Some(Raw),
        },
        StorageType::ZfsPool => TypeInfo {
            content: &[Images, Rootdir],
            default_content: &[Images, Rootdir],
            formats: &[Raw, Subvol],
            default_format: Some(Raw),
        },
        StorageType::Lvm => TypeInfo {
            content: &[Images, Rootdir],
            default_content: &[Images],
            formats: &[Raw],
            default_format: Some(Raw),
        },
        StorageType::LvmThin => TypeInfo {
            content: &[Images, Rootdir],
            default_content: &[Images, Rootdir],
            formats: &[Raw],
            default_format: Some(Raw),
        },
        StorageType::Rbd => TypeInfo {
            content: &[Images, Rootdir],
            default_content: &[Images],
            formats: &[Raw],
            default_format: Some(Raw),
        },
        StorageType::Iscsi => TypeInfo {
            content: &[Images, None],
            default_content: &[Images],
            formats: &[Raw],
            default_format: Some(Raw),
        },
        StorageType::Pbs => TypeInfo {
            content: &[Backup, None],
            default_content: &[Backup],
            formats: &[],
            default_format: Option::None,
        },
    }
}

/// How strictly values are checked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMode {
    /// Drop invalid list entries with a warning, used when reading the file
    Lenient,
    /// Reject invalid values, used for API and CLI input
    Strict,
}

/// A decoded property value
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    String(String),
    Bool(bool),
    Integer(u64),
    Content(BTreeSet<ContentType>),
    Nodes(BTreeSet<String>),
    Format(VolumeFormat),
    Path(PathBuf),
    Prune(PrunePolicy),
}

fn node_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[a-zA-Z0-9]([a-zA-Z0-9\-]*[a-zA-Z0-9])?$").expect("Invalid regex pattern")
    })
}

fn storage_path_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^/[-_./+@0-9A-Za-z]*$").expect("Invalid regex pattern"))
}

pub fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw {
        "1" | "yes" | "on" | "true" => Ok(true),
        "0" | "no" | "off" | "false" => Ok(false),
        _ => Err(Error::Config(format!(
            "property '{}': invalid boolean value '{}'",
            key, raw
        ))),
    }
}

fn decode_content(
    storage_type: StorageType,
    raw: &str,
    mode: ParseMode,
) -> Result<BTreeSet<ContentType>> {
    let allowed = type_info(storage_type).content;
    let mut content = BTreeSet::new();

    for token in raw.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        let parsed = token
            .parse::<ContentType>()
            .ok()
            .filter(|c| allowed.contains(c));
        match (parsed, mode) {
            (Some(c), _) => {
                content.insert(c);
            }
            (None, ParseMode::Lenient) => {
                warn!(
                    storage_type = %storage_type,
                    content = token,
                    "ignoring unsupported content type"
                );
            }
            (None, ParseMode::Strict) => {
                return Err(Error::Config(format!(
                    "storage type '{}' does not support content type '{}'",
                    storage_type, token
                )));
            }
        }
    }

    if content.contains(&ContentType::None) {
        if content.len() > 1 {
            return Err(Error::Config(
                "unable to combine 'none' with other content types".to_string(),
            ));
        }
        content.clear();
    }

    Ok(content)
}

fn decode_nodes(raw: &str, mode: ParseMode) -> Result<BTreeSet<String>> {
    let mut nodes = BTreeSet::new();
    for token in raw.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        if node_name_re().is_match(token) {
            nodes.insert(token.to_string());
        } else if mode == ParseMode::Lenient {
            warn!(node = token, "ignoring invalid node name");
        } else {
            return Err(Error::Config(format!("invalid node name '{}'", token)));
        }
    }
    Ok(nodes)
}

/// Decode the raw value of `key` for `storage_type`
pub fn decode_value(
    storage_type: StorageType,
    key: &str,
    raw: &str,
    mode: ParseMode,
) -> Result<PropertyValue> {
    let decl = lookup(storage_type, key).ok_or_else(|| {
        Error::Config(format!(
            "property '{}' is not defined for storage type '{}'",
            key, storage_type
        ))
    })?;

    let value = match decl.kind {
        PropKind::String => {
            if raw.is_empty() {
                return Err(Error::Config(format!("property '{}' must not be empty", key)));
            }
            PropertyValue::String(raw.to_string())
        }
        PropKind::Bool => PropertyValue::Bool(parse_bool(key, raw)?),
        PropKind::Integer => PropertyValue::Integer(raw.parse().map_err(|_| {
            Error::Config(format!("property '{}': invalid integer '{}'", key, raw))
        })?),
        PropKind::Content => PropertyValue::Content(decode_content(storage_type, raw, mode)?),
        PropKind::Nodes => PropertyValue::Nodes(decode_nodes(raw, mode)?),
        PropKind::Format => {
            let format: VolumeFormat = raw
                .parse()
                .map_err(|e: String| Error::Config(format!("property '{}': {}", key, e)))?;
            if !type_info(storage_type).formats.contains(&format) {
                return Err(Error::Config(format!(
                    "storage type '{}' does not support format '{}'",
                    storage_type, format
                )));
            }
            PropertyValue::Format(format)
        }
        PropKind::Path => {
            if !raw.starts_with('/') {
                return Err(Error::Config(format!(
                    "property '{}': '{}' is not an absolute path",
                    key, raw
                )));
            }
            PropertyValue::Path(PathBuf::from(raw))
        }
        PropKind::Prune => PropertyValue::Prune(
            raw.parse()
                .map_err(|e: Error| Error::Config(format!("property '{}': {}", key, e)))?,
        ),
    };

    Ok(value)
}

/// Default mount point for network storages without an explicit path
pub fn default_mountpoint(id: &str) -> PathBuf {
    PathBuf::from("/mnt/pve").join(id)
}

/// Validate properties for a new storage (`is_create`) or an update
///
/// On create `props` is the full property set, on update only the changed
/// properties. Returns the normalized property map.
pub fn check_config(
    id: &str,
    storage_type: StorageType,
    props: &BTreeMap<String, String>,
    is_create: bool,
) -> Result<BTreeMap<String, String>> {
    parse_storage_id(id).map_err(|e| Error::Config(e.to_string()))?;

    for (key, raw) in props {
        let decl = lookup(storage_type, key).ok_or_else(|| {
            Error::Config(format!(
                "property '{}' is not defined for storage type '{}'",
                key, storage_type
            ))
        })?;
        if !is_create && decl.fixed {
            return Err(Error::Config(format!("can't change fixed property '{}'", key)));
        }
        decode_value(storage_type, key, raw, ParseMode::Strict)?;
    }

    let mut props = props.clone();

    if is_create {
        if storage_type.is_network_mount() && !props.contains_key("path") {
            props.insert(
                "path".to_string(),
                default_mountpoint(id).display().to_string(),
            );
        }

        if let Some(missing) = properties(storage_type)
            .find(|d| d.required && !props.contains_key(d.key))
        {
            return Err(Error::Config(format!(
                "missing required property '{}'",
                missing.key
            )));
        }
    }

    if storage_type.is_path_based() {
        if let Some(path) = props.get("path") {
            if !storage_path_re().is_match(path) || path.contains("..") {
                return Err(Error::Config(format!(
                    "path '{}' contains unsupported characters",
                    path
                )));
            }
        }
    }

    Ok(props)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_decode_content_lenient_drops_unknown() {
        let value =
            decode_value(StorageType::ZfsPool, "content", "images,iso,bogus", ParseMode::Lenient)
                .unwrap();
        let expected: BTreeSet<ContentType> = [ContentType::Images].into_iter().collect();
        assert_eq!(value, PropertyValue::Content(expected));
    }

    #[test]
    fn test_decode_content_strict_rejects_unknown() {
        assert!(
            decode_value(StorageType::ZfsPool, "content", "images,iso", ParseMode::Strict).is_err()
        );
    }

    #[test]
    fn test_content_none_cannot_combine() {
        assert!(
            decode_value(StorageType::Dir, "content", "none,images", ParseMode::Lenient).is_err()
        );
        let value = decode_value(StorageType::Dir, "content", "none", ParseMode::Strict).unwrap();
        assert_eq!(value, PropertyValue::Content(BTreeSet::new()));
    }

    #[test]
    fn test_decode_nodes() {
        let value =
            decode_value(StorageType::Dir, "nodes", "node1,node-2", ParseMode::Strict).unwrap();
        match value {
            PropertyValue::Nodes(n) => assert_eq!(n.len(), 2),
            other => panic!("unexpected {:?}", other),
        }
        assert!(decode_value(StorageType::Dir, "nodes", "-bad", ParseMode::Strict).is_err());
    }

    #[test]
    fn test_format_not_declared_for_pbs() {
        assert!(lookup(StorageType::Pbs, "format").is_none());
        assert!(lookup(StorageType::Dir, "format").is_some());
        assert!(decode_value(StorageType::Lvm, "format", "qcow2", ParseMode::Strict).is_err());
    }

    #[test]
    fn test_check_config_dir_path_charset() {
        let ok = check_config("store1", StorageType::Dir, &props(&[("path", "/srv/images")]), true);
        assert!(ok.is_ok());

        let bad = check_config("store1", StorageType::Dir, &props(&[("path", "/srv/a;b")]), true);
        assert!(bad.is_err());

        let missing = check_config("store1", StorageType::Dir, &props(&[]), true);
        assert!(missing.unwrap_err().to_string().contains("path"));
    }

    #[test]
    fn test_check_config_network_default_mountpoint() {
        let result = check_config(
            "backup-nfs",
            StorageType::Nfs,
            &props(&[("server", "10.0.0.5"), ("export", "/export/pve")]),
            true,
        )
        .unwrap();
        assert_eq!(result.get("path").map(String::as_str), Some("/mnt/pve/backup-nfs"));
    }

    #[test]
    fn test_check_config_update_rejects_fixed() {
        let err = check_config("tank", StorageType::ZfsPool, &props(&[("pool", "other")]), false)
            .unwrap_err();
        assert!(err.to_string().contains("fixed property"));

        assert!(
            check_config("tank", StorageType::ZfsPool, &props(&[("sparse", "1")]), false).is_ok()
        );
    }

    #[test]
    fn test_check_config_rejects_unknown_key() {
        let err = check_config(
            "store1",
            StorageType::Dir,
            &props(&[("path", "/srv"), ("pool", "x")]),
            true,
        )
        .unwrap_err();
        assert!(err.to_string().contains("not defined"));
    }
}

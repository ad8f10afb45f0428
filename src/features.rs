//! Capability matrix
//!
//! Every storage type declares which operations it supports for a volume in
//! a given role (base image, current volume, snapshot), optionally
//! restricted to certain image formats. Combinations that are not listed are
//! unsupported.

use crate::types::{Feature, StorageType, VolumeFormat, VolumeRole};

use Feature as F;
use VolumeFormat::{Qcow2, Raw, Subvol, Vmdk};
use VolumeRole as R;

/// Formats an entry applies to; `None` matches every format
type Formats = Option<&'static [VolumeFormat]>;

struct Entry(Feature, VolumeRole, Formats);

const IMAGE_FILES: &[VolumeFormat] = &[Qcow2, Raw, Vmdk];
const ALL_FILES: &[VolumeFormat] = &[Qcow2, Raw, Vmdk, Subvol];
const QCOW2: &[VolumeFormat] = &[Qcow2];

/// Directory-style storages keeping images as files, btrfs included
static FILE_FEATURES: &[Entry] = &[
    Entry(F::Snapshot, R::Current, Some(QCOW2)),
    Entry(F::Snapshot, R::Snap, Some(QCOW2)),
    Entry(F::Clone, R::Base, Some(IMAGE_FILES)),
    Entry(F::Template, R::Current, Some(ALL_FILES)),
    Entry(F::Copy, R::Base, Some(IMAGE_FILES)),
    Entry(F::Copy, R::Current, Some(IMAGE_FILES)),
    Entry(F::Copy, R::Snap, Some(QCOW2)),
    Entry(F::SparseInit, R::Base, Some(IMAGE_FILES)),
    Entry(F::SparseInit, R::Current, Some(IMAGE_FILES)),
    Entry(F::Rename, R::Current, Some(ALL_FILES)),
];

static ZFS_FEATURES: &[Entry] = &[
    Entry(F::Snapshot, R::Current, None),
    Entry(F::Snapshot, R::Snap, None),
    Entry(F::Clone, R::Base, None),
    Entry(F::Template, R::Current, None),
    Entry(F::Copy, R::Base, None),
    Entry(F::Copy, R::Current, None),
    Entry(F::SparseInit, R::Base, None),
    Entry(F::SparseInit, R::Current, None),
    Entry(F::Replicate, R::Base, None),
    Entry(F::Replicate, R::Current, None),
    Entry(F::Rename, R::Current, None),
];

static LVM_FEATURES: &[Entry] = &[
    Entry(F::Copy, R::Base, None),
    Entry(F::Copy, R::Current, None),
    Entry(F::Rename, R::Current, None),
];

static LVMTHIN_FEATURES: &[Entry] = &[
    Entry(F::Snapshot, R::Current, None),
    Entry(F::Snapshot, R::Snap, None),
    Entry(F::Clone, R::Base, None),
    Entry(F::Clone, R::Snap, None),
    Entry(F::Template, R::Current, None),
    Entry(F::Copy, R::Base, None),
    Entry(F::Copy, R::Current, None),
    Entry(F::Copy, R::Snap, None),
    Entry(F::Rename, R::Current, None),
];

static RBD_FEATURES: &[Entry] = &[
    Entry(F::Snapshot, R::Current, None),
    Entry(F::Snapshot, R::Snap, None),
    Entry(F::Clone, R::Base, None),
    Entry(F::Clone, R::Snap, None),
    Entry(F::Template, R::Current, None),
    Entry(F::Copy, R::Base, None),
    Entry(F::Copy, R::Current, None),
    Entry(F::Copy, R::Snap, None),
    Entry(F::SparseInit, R::Base, None),
    Entry(F::SparseInit, R::Current, None),
    Entry(F::Rename, R::Current, None),
];

static ISCSI_FEATURES: &[Entry] = &[Entry(F::Copy, R::Current, None), Entry(F::Copy, R::Snap, None)];

static NO_FEATURES: &[Entry] = &[];

fn table(storage_type: StorageType) -> &'static [Entry] {
    match storage_type {
        StorageType::Dir
        | StorageType::Nfs
        | StorageType::Cifs
        | StorageType::Glusterfs
        | StorageType::Btrfs => FILE_FEATURES,
        StorageType::ZfsPool => ZFS_FEATURES,
        StorageType::Lvm => LVM_FEATURES,
        StorageType::LvmThin => LVMTHIN_FEATURES,
        StorageType::Rbd => RBD_FEATURES,
        StorageType::Iscsi => ISCSI_FEATURES,
        // CephFS and backup servers hold no images
        StorageType::Cephfs | StorageType::Pbs => NO_FEATURES,
    }
}

/// Look up whether `storage_type` supports `feature` for a volume of
/// `format` in `role`
pub fn volume_has_feature(
    feature: Feature,
    storage_type: StorageType,
    format: VolumeFormat,
    role: VolumeRole,
) -> bool {
    table(storage_type).iter().any(|Entry(f, r, formats)| {
        *f == feature && *r == role && formats.map_or(true, |list| list.contains(&format))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_FEATURES: [Feature; 7] = [
        Feature::Snapshot,
        Feature::Clone,
        Feature::Copy,
        Feature::Template,
        Feature::SparseInit,
        Feature::Replicate,
        Feature::Rename,
    ];
    const ALL_ROLES: [VolumeRole; 3] = [VolumeRole::Base, VolumeRole::Current, VolumeRole::Snap];

    #[test]
    fn test_dir_matrix() {
        let t = StorageType::Dir;
        assert!(volume_has_feature(Feature::Snapshot, t, VolumeFormat::Qcow2, VolumeRole::Current));
        assert!(!volume_has_feature(Feature::Snapshot, t, VolumeFormat::Raw, VolumeRole::Current));
        assert!(volume_has_feature(Feature::Clone, t, VolumeFormat::Raw, VolumeRole::Base));
        assert!(!volume_has_feature(Feature::Clone, t, VolumeFormat::Raw, VolumeRole::Current));
        assert!(!volume_has_feature(Feature::Clone, t, VolumeFormat::Qcow2, VolumeRole::Snap));
        assert!(!volume_has_feature(Feature::Clone, t, VolumeFormat::Subvol, VolumeRole::Base));
        assert!(!volume_has_feature(Feature::Replicate, t, VolumeFormat::Raw, VolumeRole::Current));
    }

    #[test]
    fn test_btrfs_matches_directory_storage() {
        for f in ALL_FEATURES {
            for fmt in VolumeFormat::ALL {
                for r in ALL_ROLES {
                    assert_eq!(
                        volume_has_feature(f, StorageType::Btrfs, fmt, r),
                        volume_has_feature(f, StorageType::Dir, fmt, r)
                    );
                }
            }
        }
        let raw = VolumeFormat::Raw;
        assert!(!volume_has_feature(Feature::Snapshot, StorageType::Btrfs, raw, VolumeRole::Current));
    }

    #[test]
    fn test_zfs_matrix_is_format_independent() {
        let t = StorageType::ZfsPool;
        for fmt in [VolumeFormat::Raw, VolumeFormat::Subvol] {
            assert!(volume_has_feature(Feature::Replicate, t, fmt, VolumeRole::Current));
            assert!(volume_has_feature(Feature::Clone, t, fmt, VolumeRole::Base));
            assert!(!volume_has_feature(Feature::Clone, t, fmt, VolumeRole::Snap));
        }
    }

    #[test]
    fn test_lookup_is_pure() {
        for t in StorageType::ALL {
            for f in ALL_FEATURES {
                for fmt in VolumeFormat::ALL {
                    for r in ALL_ROLES {
                        let first = volume_has_feature(f, t, fmt, r);
                        let second = volume_has_feature(f, t, fmt, r);
                        assert_eq!(first, second);
                    }
                }
            }
        }
    }

    #[test]
    fn test_never_true_for_unlisted_pairs() {
        for t in StorageType::ALL {
            for f in ALL_FEATURES {
                for r in ALL_ROLES {
                    let listed = table(t).iter().any(|Entry(ef, er, _)| *ef == f && *er == r);
                    if !listed {
                        for fmt in VolumeFormat::ALL {
                            assert!(!volume_has_feature(f, t, fmt, r));
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_backup_only_storages_have_no_features() {
        for fmt in VolumeFormat::ALL {
            assert!(!volume_has_feature(Feature::Copy, StorageType::Pbs, fmt, VolumeRole::Current));
        }
    }
}

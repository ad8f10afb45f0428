//! volstore: Pluggable storage for virtual machine and container volumes
//!
//! Storages are configured in a section file and served by plugins, one per
//! storage type. Volumes are addressed by `<storage>:<volume name>` ids; the
//! [`StorageManager`] resolves an id to its plugin and forwards operations.
//! Plugins share the image lifecycle (allocation, base images, linked
//! clones, snapshots, export and import) and reach the underlying tools
//! through a [`VolumeBackend`].

pub mod backend;
pub mod command;
pub mod config;
pub mod error;
pub mod features;
pub mod lock;
pub mod manager;
pub mod plugin;
pub mod prune;
pub mod stream;
pub mod types;
pub mod volname;

pub use backend::VolumeBackend;
pub use config::{Configuration, StorageConfig};
pub use error::{Error, Result};
pub use features::volume_has_feature;
pub use lock::{FileLocker, MemoryLocker, StorageLocker};
pub use manager::{StorageManager, StorageState, StorageStatusRow};
pub use plugin::{PluginRegistry, StoragePlugin};
pub use prune::{prune_mark, PruneItem, PruneMark, PrunePolicy};
pub use stream::StreamFormat;
pub use types::{
    ContentType, Feature, GuestType, StorageStatus, StorageType, VolumeFormat, VolumeInfo,
};
pub use volname::{parse_volume_id, volume_id, VolumeName};

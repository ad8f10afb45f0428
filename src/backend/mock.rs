//! In-memory backend for tests
//!
//! Keeps volumes, snapshots and content files in memory and records every
//! mutating call so tests can check the order of operations.

use super::{BackendFile, BackendVolume, VolumeBackend};
use crate::error::{Error, Result};
use crate::stream::{copy_exact, StreamFormat};
use crate::types::{ContentType, StorageStatus, VolumeFormat};
use std::collections::{BTreeMap, HashSet};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone)]
struct MockVolume {
    format: VolumeFormat,
    size: u64,
    data: Vec<u8>,
    parent: Option<String>,
    snapshots: Vec<String>,
    protected: bool,
}

#[derive(Debug, Default)]
struct MockState {
    volumes: BTreeMap<String, MockVolume>,
    files: BTreeMap<(ContentType, String), BackendFile>,
    log: Vec<String>,
    failing: HashSet<String>,
}

/// Backend keeping everything in memory
#[derive(Debug)]
pub struct MockBackend {
    state: Mutex<MockState>,
    capacity: u64,
    arbitrary_rollback: bool,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            capacity: 100 * 1024 * 1024 * 1024,
            arbitrary_rollback: false,
        }
    }

    /// Allow rollbacks to any snapshot, like qcow2 files
    pub fn with_arbitrary_rollback(mut self, allowed: bool) -> Self {
        self.arbitrary_rollback = allowed;
        self
    }

    fn state(&self) -> Result<MutexGuard<'_, MockState>> {
        self.state
            .lock()
            .map_err(|_| Error::Other("mock backend poisoned".to_string()))
    }

    /// Make every later call of `operation` fail
    pub fn fail_on(&self, operation: &str) {
        if let Ok(mut state) = self.state() {
            state.failing.insert(operation.to_string());
        }
    }

    /// Recorded operations, e.g. `delete vm-100-disk-1`
    pub fn log(&self) -> Vec<String> {
        self.state().map(|s| s.log.clone()).unwrap_or_default()
    }

    pub fn clear_log(&self) {
        if let Ok(mut state) = self.state() {
            state.log.clear();
        }
    }

    pub fn is_protected(&self, handle: &str) -> bool {
        self.state()
            .ok()
            .and_then(|s| s.volumes.get(handle).map(|v| v.protected))
            .unwrap_or(false)
    }

    pub fn data(&self, handle: &str) -> Option<Vec<u8>> {
        self.state().ok()?.volumes.get(handle).map(|v| v.data.clone())
    }

    /// Replace the contents of a volume
    pub fn write_data(&self, handle: &str, data: &[u8]) -> Result<()> {
        let mut state = self.state()?;
        let volume = state
            .volumes
            .get_mut(handle)
            .ok_or_else(|| Error::NotFound(format!("volume '{}'", handle)))?;
        volume.data = data.to_vec();
        Ok(())
    }

    /// Add a content file such as a backup archive
    pub fn add_file(&self, content: ContentType, name: &str, ctime: i64, protected: bool) {
        if let Ok(mut state) = self.state() {
            state.files.insert(
                (content, name.to_string()),
                BackendFile {
                    name: name.to_string(),
                    size: 1024,
                    ctime: Some(ctime),
                    protected,
                },
            );
        }
    }

    pub fn has_file(&self, content: ContentType, name: &str) -> bool {
        self.state()
            .map(|s| s.files.contains_key(&(content, name.to_string())))
            .unwrap_or(false)
    }

    /// Record `entry` unless the operation was set up to fail
    fn record(state: &mut MockState, operation: &str, entry: String) -> Result<()> {
        if state.failing.contains(operation) {
            return Err(Error::BackendToolFailure {
                tool: "mock",
                message: format!("{} failed", entry),
            });
        }
        state.log.push(entry);
        Ok(())
    }

    fn volume_mut<'a>(state: &'a mut MockState, handle: &str) -> Result<&'a mut MockVolume> {
        state
            .volumes
            .get_mut(handle)
            .ok_or_else(|| Error::NotFound(format!("volume '{}'", handle)))
    }
}

impl VolumeBackend for MockBackend {
    fn status(&self) -> Result<StorageStatus> {
        let state = self.state()?;
        let used: u64 = state.volumes.values().map(|v| v.size).sum();
        Ok(StorageStatus {
            total: self.capacity,
            avail: self.capacity.saturating_sub(used),
            used,
            active: true,
        })
    }

    fn allocate(&self, handle: &str, format: VolumeFormat, size: u64) -> Result<()> {
        let mut state = self.state()?;
        if state.volumes.contains_key(handle) {
            return Err(Error::AlreadyExists(format!("volume '{}'", handle)));
        }
        // a failing allocation leaves the partial volume behind
        state.volumes.insert(
            handle.to_string(),
            MockVolume {
                format,
                size,
                data: Vec::new(),
                parent: None,
                snapshots: Vec::new(),
                protected: false,
            },
        );
        Self::record(&mut state, "allocate", format!("allocate {}", handle))
    }

    fn allocate_linked(
        &self,
        handle: &str,
        format: VolumeFormat,
        parent: &str,
        snapshot: Option<&str>,
    ) -> Result<()> {
        let mut state = self.state()?;
        let base = state
            .volumes
            .get(parent)
            .ok_or_else(|| Error::NotFound(format!("volume '{}'", parent)))?
            .clone();
        if let Some(snap) = snapshot {
            if !base.snapshots.iter().any(|s| s == snap) {
                return Err(Error::NotFound(format!("snapshot '{}@{}'", parent, snap)));
            }
        }
        if state.volumes.contains_key(handle) {
            return Err(Error::AlreadyExists(format!("volume '{}'", handle)));
        }
        Self::record(
            &mut state,
            "allocate_linked",
            format!("clone {} {}", parent, handle),
        )?;
        state.volumes.insert(
            handle.to_string(),
            MockVolume {
                format,
                size: base.size,
                data: base.data,
                parent: Some(parent.to_string()),
                snapshots: Vec::new(),
                protected: false,
            },
        );
        Ok(())
    }

    fn delete(&self, handle: &str) -> Result<()> {
        let mut state = self.state()?;
        let volume = Self::volume_mut(&mut state, handle)?;
        if volume.protected {
            return Err(Error::BackendToolFailure {
                tool: "mock",
                message: format!("volume '{}' is protected", handle),
            });
        }
        if !volume.snapshots.is_empty() {
            return Err(Error::BackendToolFailure {
                tool: "mock",
                message: format!("volume '{}' has snapshots", handle),
            });
        }
        Self::record(&mut state, "delete", format!("delete {}", handle))?;
        state.volumes.remove(handle);
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let mut state = self.state()?;
        if state.volumes.contains_key(to) {
            return Err(Error::AlreadyExists(format!("volume '{}'", to)));
        }
        let volume = state
            .volumes
            .remove(from)
            .ok_or_else(|| Error::NotFound(format!("volume '{}'", from)))?;
        state.volumes.insert(to.to_string(), volume);
        Self::record(&mut state, "rename", format!("rename {} {}", from, to))
    }

    fn exists(&self, handle: &str) -> Result<bool> {
        Ok(self.state()?.volumes.contains_key(handle))
    }

    fn protect(&self, handle: &str, protect: bool) -> Result<()> {
        let mut state = self.state()?;
        Self::volume_mut(&mut state, handle)?.protected = protect;
        let verb = if protect { "protect" } else { "unprotect" };
        Self::record(&mut state, verb, format!("{} {}", verb, handle))
    }

    fn resize(&self, handle: &str, size: u64) -> Result<()> {
        let mut state = self.state()?;
        Self::volume_mut(&mut state, handle)?.size = size;
        Self::record(&mut state, "resize", format!("resize {} {}", handle, size))
    }

    fn volume_size(&self, handle: &str) -> Result<u64> {
        let mut state = self.state()?;
        Ok(Self::volume_mut(&mut state, handle)?.size)
    }

    fn list(&self) -> Result<Vec<BackendVolume>> {
        let state = self.state()?;
        Ok(state
            .volumes
            .iter()
            .map(|(handle, v)| BackendVolume {
                handle: handle.clone(),
                format: v.format,
                size: v.size,
                used: Some(v.data.len() as u64),
                parent: v.parent.clone(),
                ctime: None,
            })
            .collect())
    }

    fn path(&self, handle: &str, snapshot: Option<&str>) -> Result<PathBuf> {
        let name = match snapshot {
            Some(snap) => format!("{}@{}", handle, snap),
            None => handle.to_string(),
        };
        Ok(PathBuf::from("/dev/mock").join(name))
    }

    fn snapshot(&self, handle: &str, snapshot: &str) -> Result<()> {
        let mut state = self.state()?;
        let volume = Self::volume_mut(&mut state, handle)?;
        if volume.snapshots.iter().any(|s| s == snapshot) {
            return Err(Error::AlreadyExists(format!("snapshot '{}@{}'", handle, snapshot)));
        }
        volume.snapshots.push(snapshot.to_string());
        Self::record(&mut state, "snapshot", format!("snapshot {}@{}", handle, snapshot))
    }

    fn snapshot_rollback(&self, handle: &str, snapshot: &str) -> Result<()> {
        let mut state = self.state()?;
        let volume = Self::volume_mut(&mut state, handle)?;
        if !volume.snapshots.iter().any(|s| s == snapshot) {
            return Err(Error::NotFound(format!("snapshot '{}@{}'", handle, snapshot)));
        }
        Self::record(&mut state, "rollback", format!("rollback {}@{}", handle, snapshot))
    }

    fn snapshot_delete(&self, handle: &str, snapshot: &str) -> Result<()> {
        let mut state = self.state()?;
        let volume = Self::volume_mut(&mut state, handle)?;
        let before = volume.snapshots.len();
        volume.snapshots.retain(|s| s != snapshot);
        if volume.snapshots.len() == before {
            return Err(Error::NotFound(format!("snapshot '{}@{}'", handle, snapshot)));
        }
        Self::record(
            &mut state,
            "snapshot_delete",
            format!("delsnapshot {}@{}", handle, snapshot),
        )
    }

    fn snapshots(&self, handle: &str) -> Result<Vec<String>> {
        let mut state = self.state()?;
        Ok(Self::volume_mut(&mut state, handle)?.snapshots.clone())
    }

    fn supports_arbitrary_rollback(&self) -> bool {
        self.arbitrary_rollback
    }

    fn export(
        &self,
        handle: &str,
        format: StreamFormat,
        _snapshot: Option<&str>,
        _base_snapshot: Option<&str>,
        out: &mut dyn Write,
    ) -> Result<()> {
        let data = {
            let mut state = self.state()?;
            Self::record(&mut state, "export", format!("export {} {}", handle, format))?;
            let volume = Self::volume_mut(&mut state, handle)?;
            let mut data = volume.data.clone();
            if format == StreamFormat::RawSize {
                data.resize(volume.size as usize, 0);
            }
            data
        };
        out.write_all(&data)?;
        Ok(())
    }

    fn import(
        &self,
        handle: &str,
        format: StreamFormat,
        size: u64,
        _base_snapshot: Option<&str>,
        input: &mut dyn Read,
    ) -> Result<()> {
        let volume_format = format.data_format().unwrap_or(VolumeFormat::Raw);
        self.allocate(handle, volume_format, size)?;
        {
            let mut state = self.state()?;
            Self::record(&mut state, "import", format!("import {} {}", handle, format))?;
        }

        let mut data = Vec::new();
        if format == StreamFormat::RawSize {
            copy_exact(input, &mut data, size)?;
        } else {
            input.read_to_end(&mut data)?;
        }
        self.write_data(handle, &data)
    }

    fn list_files(&self, content: ContentType) -> Result<Vec<BackendFile>> {
        let state = self.state()?;
        Ok(state
            .files
            .iter()
            .filter(|((c, _), _)| *c == content)
            .map(|(_, f)| f.clone())
            .collect())
    }

    fn remove_file(&self, content: ContentType, name: &str) -> Result<()> {
        let mut state = self.state()?;
        let key = (content, name.to_string());
        match state.files.get(&key) {
            None => return Err(Error::NotFound(format!("file '{}'", name))),
            Some(f) if f.protected => {
                return Err(Error::UnsupportedOperation(format!(
                    "removing protected file '{}'",
                    name
                )))
            }
            Some(_) => {}
        }
        Self::record(&mut state, "remove_file", format!("remove {}", name))?;
        state.files.remove(&key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delete_refuses_snapshotted_or_protected() {
        let backend = MockBackend::new();
        backend.allocate("vm-100-disk-1", VolumeFormat::Raw, 1024).unwrap();
        backend.snapshot("vm-100-disk-1", "s1").unwrap();
        assert!(backend.delete("vm-100-disk-1").is_err());

        backend.snapshot_delete("vm-100-disk-1", "s1").unwrap();
        backend.protect("vm-100-disk-1", true).unwrap();
        assert!(backend.delete("vm-100-disk-1").is_err());

        backend.protect("vm-100-disk-1", false).unwrap();
        backend.delete("vm-100-disk-1").unwrap();
        assert_eq!(
            backend.log(),
            vec![
                "allocate vm-100-disk-1",
                "snapshot vm-100-disk-1@s1",
                "delsnapshot vm-100-disk-1@s1",
                "protect vm-100-disk-1",
                "unprotect vm-100-disk-1",
                "delete vm-100-disk-1",
            ]
        );
    }

    #[test]
    fn test_fail_on() {
        let backend = MockBackend::new();
        backend.fail_on("allocate");
        assert!(backend.allocate("vm-100-disk-1", VolumeFormat::Raw, 1024).is_err());
        assert!(backend.exists("vm-100-disk-1").unwrap());
        assert!(backend.log().is_empty());
    }
}

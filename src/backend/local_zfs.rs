//! Local ZFS backend implementation
//!
//! Handles are dataset names relative to the configured pool. Disk images
//! are zvols, container subvolumes are filesystems with a `refquota`.

use super::{BackendVolume, VolumeBackend};
use crate::command::{classify_failure, CommandRunner, PipeReader, PipeWriter};
use crate::error::{Error, Result};
use crate::stream::{copy_exact, StreamFormat};
use crate::types::{StorageStatus, VolumeFormat};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::PathBuf;
use tracing::{debug, info, instrument};

/// Snapshot that every base image carries and clones are created from
pub const BASE_SNAPSHOT: &str = "__base__";

/// Configuration for the local ZFS backend
#[derive(Debug, Clone)]
pub struct ZfsConfig {
    /// Parent dataset of all volumes (e.g., rpool/data)
    pub pool: String,
    /// Create zvols without reservation
    pub sparse: bool,
    /// Volume block size (e.g., 8k)
    pub blocksize: Option<String>,
    /// Where the pool's filesystems are mounted, defaults to `/<pool>`
    pub mountpoint: Option<PathBuf>,
}

impl ZfsConfig {
    pub fn new(pool: impl Into<String>) -> Self {
        Self {
            pool: pool.into(),
            sparse: false,
            blocksize: None,
            mountpoint: None,
        }
    }
}

/// Local ZFS backend implementation
///
/// Manages volumes as datasets below one parent dataset using the `zfs`
/// command line tool.
pub struct ZfsBackend {
    config: ZfsConfig,
}

impl ZfsBackend {
    pub fn new(config: ZfsConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ZfsConfig {
        &self.config
    }

    /// Get the full ZFS dataset path for a volume
    fn dataset(&self, handle: &str) -> String {
        format!("{}/{}", self.config.pool, handle)
    }

    fn snapshot_name(&self, handle: &str, snapshot: &str) -> String {
        format!("{}@{}", self.dataset(handle), snapshot)
    }

    /// Block device of a zvol
    fn device_path(&self, handle: &str, snapshot: Option<&str>) -> PathBuf {
        let name = match snapshot {
            Some(snap) => self.snapshot_name(handle, snap),
            None => self.dataset(handle),
        };
        PathBuf::from("/dev/zvol").join(name)
    }

    fn mount_path(&self, handle: &str) -> PathBuf {
        self.config
            .mountpoint
            .clone()
            .unwrap_or_else(|| PathBuf::from("/").join(&self.config.pool))
            .join(handle)
    }

    /// Run a zfs query and return stdout
    fn zfs_query(&self, args: &[&str], subject: &str) -> Result<String> {
        CommandRunner::query()
            .run("zfs", args)
            .map_err(|e| classify_failure("zfs", subject, e))
    }

    /// Run a zfs command that changes state, without timeout
    fn zfs(&self, args: &[&str], subject: &str) -> Result<()> {
        CommandRunner::unbounded()
            .run("zfs", args)
            .map_err(|e| classify_failure("zfs", subject, e))?;
        Ok(())
    }

    fn get_property(&self, dataset: &str, property: &str) -> Result<String> {
        let output = self.zfs_query(&["get", "-Hp", "-o", "value", property, dataset], dataset)?;
        Ok(output.trim().to_string())
    }

    fn is_filesystem(&self, handle: &str) -> Result<bool> {
        Ok(self.get_property(&self.dataset(handle), "type")? == "filesystem")
    }

    fn kib(size: u64) -> String {
        format!("{}k", size.div_ceil(1024))
    }

    /// Parse one line of `zfs list -Hp -o name,type,volsize,refquota,used,origin,creation`
    fn parse_list_line(&self, line: &str) -> Option<BackendVolume> {
        let parts: Vec<&str> = line.split('\t').collect();
        if parts.len() < 7 {
            return None;
        }
        let handle = parts[0].strip_prefix(&format!("{}/", self.config.pool))?;
        if handle.contains('/') || handle.contains('@') {
            return None;
        }
        let known = ["vm-", "base-", "subvol-", "basevol-"];
        if !known.iter().any(|p| handle.starts_with(p)) {
            return None;
        }

        let (format, size) = match parts[1] {
            "volume" => (VolumeFormat::Raw, parse_bytes(parts[2]).ok()?),
            "filesystem" => (VolumeFormat::Subvol, parse_bytes(parts[3]).ok()?),
            _ => return None,
        };
        let parent = match parts[5] {
            "-" | "" => None,
            origin => origin
                .strip_prefix(&format!("{}/", self.config.pool))
                .and_then(|o| o.split_once('@'))
                .map(|(dataset, _)| dataset.to_string()),
        };

        Some(BackendVolume {
            handle: handle.to_string(),
            format,
            size,
            used: parse_bytes(parts[4]).ok(),
            parent,
            ctime: parts[6].parse().ok(),
        })
    }
}

/// Exact byte count from `zfs -p` output; unset properties count as zero
fn parse_bytes(value: &str) -> Result<u64> {
    match value.trim() {
        "" | "-" | "none" => Ok(0),
        exact => exact
            .parse::<u64>()
            .map_err(|_| Error::parse("zfs byte count", exact, "expected a plain number")),
    }
}

impl VolumeBackend for ZfsBackend {
    fn status(&self) -> Result<StorageStatus> {
        let output = self.zfs_query(
            &["get", "-Hp", "-o", "value", "available,used", &self.config.pool],
            &self.config.pool,
        )?;
        let values = output.lines().map(parse_bytes).collect::<Result<Vec<u64>>>()?;
        let avail = values.first().copied().unwrap_or(0);
        let used = values.get(1).copied().unwrap_or(0);
        Ok(StorageStatus {
            total: avail + used,
            avail,
            used,
            active: true,
        })
    }

    #[instrument(skip(self))]
    fn allocate(&self, handle: &str, format: VolumeFormat, size: u64) -> Result<()> {
        let dataset = self.dataset(handle);
        let size_arg = Self::kib(size);

        match format {
            VolumeFormat::Raw => {
                let mut args = vec!["create"];
                if self.config.sparse {
                    args.push("-s");
                }
                if let Some(bs) = &self.config.blocksize {
                    args.extend(["-b", bs.as_str()]);
                }
                args.extend(["-V", size_arg.as_str(), dataset.as_str()]);
                self.zfs(&args, &dataset)?;
            }
            VolumeFormat::Subvol => {
                let quota = if size == 0 {
                    "refquota=none".to_string()
                } else {
                    format!("refquota={}", size_arg)
                };
                self.zfs(
                    &[
                        "create",
                        "-o",
                        "acltype=posixacl",
                        "-o",
                        "xattr=sa",
                        "-o",
                        &quota,
                        &dataset,
                    ],
                    &dataset,
                )?;
            }
            other => {
                return Err(Error::UnsupportedOperation(format!(
                    "format '{}' on ZFS",
                    other
                )))
            }
        }

        info!(dataset = %dataset, "created dataset");
        Ok(())
    }

    #[instrument(skip(self))]
    fn allocate_linked(
        &self,
        handle: &str,
        _format: VolumeFormat,
        parent: &str,
        snapshot: Option<&str>,
    ) -> Result<()> {
        let origin = self.snapshot_name(parent, snapshot.unwrap_or(BASE_SNAPSHOT));
        let dataset = self.dataset(handle);
        self.zfs(&["clone", &origin, &dataset], &dataset)?;
        info!(origin = %origin, dataset = %dataset, "cloned dataset");
        Ok(())
    }

    #[instrument(skip(self))]
    fn delete(&self, handle: &str) -> Result<()> {
        let dataset = self.dataset(handle);
        self.zfs(&["destroy", &dataset], &dataset)
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let src = self.dataset(from);
        let dst = self.dataset(to);
        self.zfs(&["rename", &src, &dst], &dst)
    }

    fn exists(&self, handle: &str) -> Result<bool> {
        let dataset = self.dataset(handle);
        CommandRunner::query().check("zfs", &["list", "-H", "-o", "name", &dataset])
    }

    fn protect(&self, handle: &str, protect: bool) -> Result<()> {
        let dataset = self.dataset(handle);
        if protect {
            let has_base = self.snapshots(handle)?.iter().any(|s| s == BASE_SNAPSHOT);
            if !has_base {
                self.zfs(&["snapshot", &self.snapshot_name(handle, BASE_SNAPSHOT)], &dataset)?;
            }
            if !self.is_filesystem(handle)? {
                self.zfs(&["set", "readonly=on", &dataset], &dataset)?;
            }
        } else {
            self.zfs(&["set", "readonly=off", &dataset], &dataset)?;
        }
        Ok(())
    }

    fn resize(&self, handle: &str, size: u64) -> Result<()> {
        let dataset = self.dataset(handle);
        let property = if self.is_filesystem(handle)? {
            format!("refquota={}", Self::kib(size))
        } else {
            format!("volsize={}", Self::kib(size))
        };
        self.zfs(&["set", &property, &dataset], &dataset)
    }

    fn volume_size(&self, handle: &str) -> Result<u64> {
        let dataset = self.dataset(handle);
        let property = if self.is_filesystem(handle)? {
            "refquota"
        } else {
            "volsize"
        };
        let value = self.get_property(&dataset, property)?;
        parse_bytes(&value).map_err(|_| Error::BackendToolFailure {
            tool: "zfs",
            message: format!("unexpected {} '{}' for {}", property, value, dataset),
        })
    }

    fn list(&self) -> Result<Vec<BackendVolume>> {
        let output = self.zfs_query(
            &[
                "list",
                "-Hp",
                "-t",
                "volume,filesystem",
                "-d",
                "1",
                "-o",
                "name,type,volsize,refquota,used,origin,creation",
                &self.config.pool,
            ],
            &self.config.pool,
        )?;
        Ok(output.lines().filter_map(|l| self.parse_list_line(l)).collect())
    }

    fn path(&self, handle: &str, snapshot: Option<&str>) -> Result<PathBuf> {
        if self.is_filesystem(handle)? {
            let mut path = self.mount_path(handle);
            if let Some(snap) = snapshot {
                path = path.join(".zfs/snapshot").join(snap);
            }
            Ok(path)
        } else {
            Ok(self.device_path(handle, snapshot))
        }
    }

    #[instrument(skip(self))]
    fn snapshot(&self, handle: &str, snapshot: &str) -> Result<()> {
        if snapshot == BASE_SNAPSHOT {
            return Err(Error::invalid_name(snapshot, "reserved snapshot name"));
        }
        let name = self.snapshot_name(handle, snapshot);
        self.zfs(&["snapshot", &name], &name)
    }

    #[instrument(skip(self))]
    fn snapshot_rollback(&self, handle: &str, snapshot: &str) -> Result<()> {
        let name = self.snapshot_name(handle, snapshot);
        self.zfs(&["rollback", &name], &name)
    }

    #[instrument(skip(self))]
    fn snapshot_delete(&self, handle: &str, snapshot: &str) -> Result<()> {
        let name = self.snapshot_name(handle, snapshot);
        self.zfs(&["destroy", &name], &name)
    }

    fn snapshots(&self, handle: &str) -> Result<Vec<String>> {
        let dataset = self.dataset(handle);
        let output = self.zfs_query(
            &[
                "list", "-H", "-t", "snapshot", "-o", "name", "-s", "creation", "-d", "1",
                &dataset,
            ],
            &dataset,
        )?;
        Ok(output
            .lines()
            .filter_map(|l| l.trim().rsplit_once('@'))
            .map(|(_, snap)| snap.to_string())
            .collect())
    }

    #[instrument(skip(self, out))]
    fn export(
        &self,
        handle: &str,
        format: StreamFormat,
        snapshot: Option<&str>,
        base_snapshot: Option<&str>,
        out: &mut dyn Write,
    ) -> Result<()> {
        match format {
            StreamFormat::Zfs => {
                let snapshot = snapshot.ok_or_else(|| {
                    Error::UnsupportedOperation("zfs export without snapshot".to_string())
                })?;
                let name = self.snapshot_name(handle, snapshot);
                let base = base_snapshot.map(|b| self.snapshot_name(handle, b));
                let mut args = vec!["send", "-Rpv"];
                if let Some(base) = &base {
                    args.extend(["-I", base.as_str()]);
                }
                args.extend(["--", name.as_str()]);

                let mut sender = PipeReader::spawn("zfs", &args)?;
                io::copy(sender.stdout()?, out)?;
                sender.finish()
            }
            StreamFormat::RawSize => {
                if base_snapshot.is_some() || self.is_filesystem(handle)? {
                    return Err(Error::UnsupportedOperation(format!(
                        "exporting '{}' as raw+size",
                        handle
                    )));
                }
                let size = self.volume_size(handle)?;
                let mut device = File::open(self.device_path(handle, snapshot))?;
                copy_exact(&mut device, out, size)
            }
            other => Err(Error::UnsupportedOperation(format!(
                "export format '{}' on ZFS",
                other
            ))),
        }
    }

    #[instrument(skip(self, input))]
    fn import(
        &self,
        handle: &str,
        format: StreamFormat,
        size: u64,
        base_snapshot: Option<&str>,
        input: &mut dyn Read,
    ) -> Result<()> {
        let dataset = self.dataset(handle);
        match format {
            StreamFormat::Zfs => {
                if let Some(base) = base_snapshot {
                    if !self.snapshots(handle)?.iter().any(|s| s == base) {
                        return Err(Error::NotFound(format!(
                            "base snapshot '{}'",
                            self.snapshot_name(handle, base)
                        )));
                    }
                } else if self.exists(handle)? {
                    return Err(Error::AlreadyExists(format!("dataset '{}'", dataset)));
                }

                let mut receiver = PipeWriter::spawn("zfs", &["recv", "-F", "--", &dataset])?;
                io::copy(input, receiver.stdin()?)?;
                receiver.finish()?;
                debug!(dataset = %dataset, "received stream");
                Ok(())
            }
            StreamFormat::RawSize => {
                if base_snapshot.is_some() {
                    return Err(Error::UnsupportedOperation(
                        "incremental raw+size import".to_string(),
                    ));
                }
                self.allocate(handle, VolumeFormat::Raw, size)?;
                let mut device = OpenOptions::new()
                    .write(true)
                    .open(self.device_path(handle, None))?;
                copy_exact(input, &mut device, size)?;
                device.flush()?;
                Ok(())
            }
            other => Err(Error::UnsupportedOperation(format!(
                "import format '{}' on ZFS",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> ZfsBackend {
        ZfsBackend::new(ZfsConfig::new("rpool/data"))
    }

    #[test]
    fn test_parse_bytes() {
        assert_eq!(parse_bytes("34359738368").unwrap(), 32 * 1024 * 1024 * 1024);
        assert_eq!(parse_bytes("-").unwrap(), 0);
        assert_eq!(parse_bytes("none\n").unwrap(), 0);
        assert!(matches!(parse_bytes("1.5G"), Err(Error::Parse { .. })));
    }

    #[test]
    fn test_parse_list_line() {
        let b = backend();
        let zvol = b
            .parse_list_line("rpool/data/vm-100-disk-1\tvolume\t34359738368\t-\t8192\t-\t1700000000")
            .unwrap();
        assert_eq!(zvol.handle, "vm-100-disk-1");
        assert_eq!(zvol.format, VolumeFormat::Raw);
        assert_eq!(zvol.size, 32 * 1024 * 1024 * 1024);
        assert_eq!(zvol.parent, None);
        assert_eq!(zvol.ctime, Some(1700000000));

        let clone = b
            .parse_list_line(
                "rpool/data/subvol-101-disk-0\tfilesystem\t-\t8589934592\t1024\trpool/data/basevol-100-disk-0@__base__\t1700000001",
            )
            .unwrap();
        assert_eq!(clone.format, VolumeFormat::Subvol);
        assert_eq!(clone.size, 8 * 1024 * 1024 * 1024);
        assert_eq!(clone.parent.as_deref(), Some("basevol-100-disk-0"));
    }

    #[test]
    fn test_parse_list_line_skips_foreign_datasets() {
        let b = backend();
        assert!(b
            .parse_list_line("rpool/data\tfilesystem\t-\t0\t1024\t-\t1700000000")
            .is_none());
        assert!(b
            .parse_list_line("rpool/data/other\tfilesystem\t-\t0\t1024\t-\t1700000000")
            .is_none());
        assert!(b
            .parse_list_line("rpool/data/vm-100-disk-1/nested\tvolume\t1024\t-\t0\t-\t1")
            .is_none());
    }

    #[test]
    fn test_paths() {
        let b = backend();
        assert_eq!(
            b.device_path("vm-100-disk-1", Some("snap1")),
            PathBuf::from("/dev/zvol/rpool/data/vm-100-disk-1@snap1")
        );
        assert_eq!(
            b.mount_path("subvol-100-disk-0"),
            PathBuf::from("/rpool/data/subvol-100-disk-0")
        );
        assert_eq!(ZfsBackend::kib(1536), "2k");
    }
}

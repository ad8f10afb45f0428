//! volstore CLI - Manage storages and the volumes on them

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use volstore::config::{FileConfigStore, DEFAULT_CONFIG_PATH};
use volstore::lock::DEFAULT_LOCK_DIR;
use volstore::plugin::{ExportOptions, ImportOptions, ListCache};
use volstore::{
    Error, Feature, FileLocker, GuestType, PluginRegistry, PruneMark, PrunePolicy, Result,
    StorageManager, StorageState, StorageType, StreamFormat, VolumeFormat, VolumeName,
};

#[derive(Parser)]
#[command(name = "volstore")]
#[command(about = "Manage storages and the volumes on them", long_about = None)]
#[command(version)]
struct Cli {
    /// Storage configuration file
    #[arg(long, env = "VOLSTORE_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Node name used for storage restrictions (defaults to the hostname)
    #[arg(long, env = "VOLSTORE_NODE")]
    node: Option<String>,

    /// Directory for storage lock files
    #[arg(long, env = "VOLSTORE_LOCK_DIR", default_value = DEFAULT_LOCK_DIR)]
    lock_dir: PathBuf,

    /// Log filter when RUST_LOG is not set
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the status of all storages (sizes in KiB)
    Status {
        /// Print human readable sizes
        #[arg(long, short = 'H')]
        human: bool,
    },

    /// List images
    List {
        /// Only list images on this storage
        storage: Option<String>,
        /// Only list images owned by this guest
        #[arg(long)]
        owner: Option<u32>,
        /// Print JSON
        #[arg(long)]
        json: bool,
    },

    /// Decode a volume id
    Parse {
        /// Volume id (<storage>:<volume name>)
        volid: String,
        /// Print JSON
        #[arg(long)]
        json: bool,
    },

    /// Allocate a new image
    Alloc {
        /// Storage to allocate on
        storage: String,
        /// Owning guest id
        owner: u32,
        /// Size, e.g. 512M or 32G
        size: String,
        /// Image format (raw, qcow2, vmdk, subvol)
        #[arg(long)]
        format: Option<String>,
        /// Image name (default: next free vm-<owner>-disk-<n>)
        #[arg(long)]
        name: Option<String>,
    },

    /// Remove a volume and all of its snapshots
    Free {
        /// Volume id
        volid: String,
    },

    /// Convert an image into a read-only base image
    CreateBase {
        /// Volume id
        volid: String,
    },

    /// Clone an image for another guest
    Clone {
        /// Source volume id
        volid: String,
        /// Guest id that owns the clone
        owner: u32,
        /// Clone from this snapshot
        #[arg(long)]
        snapshot: Option<String>,
    },

    /// Grow an image
    Resize {
        /// Volume id
        volid: String,
        /// New size, e.g. 64G
        size: String,
    },

    /// Create a snapshot
    Snapshot {
        /// Volume id
        volid: String,
        /// Snapshot name
        name: String,
    },

    /// Roll back to a snapshot
    Rollback {
        /// Volume id
        volid: String,
        /// Snapshot name
        name: String,
    },

    /// Delete a snapshot
    Delsnapshot {
        /// Volume id
        volid: String,
        /// Snapshot name
        name: String,
    },

    /// Check whether a volume supports a feature
    HasFeature {
        /// Feature (snapshot, clone, template, copy, sparseinit, rename)
        feature: String,
        /// Volume id
        volid: String,
        /// Check the feature for this snapshot
        #[arg(long)]
        snapshot: Option<String>,
    },

    /// Apply a retention policy to the backups of a storage
    PruneBackups {
        /// Storage holding the backups
        storage: String,
        /// Retention options, e.g. keep-daily=7,keep-weekly=4 (default: storage setting)
        #[arg(long)]
        keep: Option<String>,
        /// Only consider backups of this guest type (qemu, lxc)
        #[arg(long = "type")]
        guest_type: Option<String>,
        /// Only consider backups of this guest
        #[arg(long)]
        owner: Option<u32>,
        /// Only show what would be removed
        #[arg(long)]
        dry_run: bool,
    },

    /// Write a volume to an export stream
    Export {
        /// Volume id
        volid: String,
        /// Stream format (raw+size, qcow2+size, vmdk+size, tar+size, zfs)
        format: String,
        /// Output file (default: stdout)
        #[arg(long, short)]
        output: Option<PathBuf>,
        /// Export the state of this snapshot
        #[arg(long)]
        snapshot: Option<String>,
        /// Send only the changes since this snapshot
        #[arg(long)]
        base: Option<String>,
        /// Include snapshots
        #[arg(long)]
        with_snapshots: bool,
    },

    /// Create a volume from an export stream
    Import {
        /// Volume id to create
        volid: String,
        /// Stream format (raw+size, qcow2+size, vmdk+size, tar+size, zfs)
        format: String,
        /// Input file (default: stdin)
        #[arg(long, short, conflicts_with = "listen")]
        input: Option<PathBuf>,
        /// Receive the stream over TCP on this address
        #[arg(long)]
        listen: Option<IpAddr>,
        /// The stream is incremental to this snapshot
        #[arg(long)]
        base: Option<String>,
        /// The stream includes snapshots
        #[arg(long)]
        with_snapshots: bool,
        /// Delete this snapshot after a successful import
        #[arg(long)]
        delete_snapshot: Option<String>,
        /// Pick a free name if the volume already exists
        #[arg(long)]
        allow_rename: bool,
    },

    /// Add a storage
    Add {
        /// Storage type (dir, nfs, zfspool, ...)
        storage_type: String,
        /// Storage id
        id: String,
        /// Properties as key=value
        #[arg(value_name = "KEY=VALUE")]
        properties: Vec<String>,
    },

    /// Change storage properties
    Set {
        /// Storage id
        id: String,
        /// Properties as key=value
        #[arg(value_name = "KEY=VALUE")]
        properties: Vec<String>,
        /// Properties to remove
        #[arg(long)]
        delete: Vec<String>,
    },

    /// Remove a storage from the configuration (volumes are kept)
    Remove {
        /// Storage id
        id: String,
    },
}

fn info(msg: &str) {
    println!("{} {}", "[INFO]".blue(), msg);
}

fn success(msg: &str) {
    println!("{} {}", "[OK]".green(), msg);
}

fn warn(msg: &str) {
    println!("{} {}", "[WARN]".yellow(), msg);
}

fn error(msg: &str) {
    eprintln!("{} {}", "[ERROR]".red(), msg);
}

fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.1}T", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.1}G", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1}M", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1}K", bytes as f64 / KB as f64)
    } else {
        format!("{}B", bytes)
    }
}

/// Parse a size like `512M` or `32G` into bytes
fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim();
    let (number, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(i) => s.split_at(i),
        None => (s, ""),
    };
    let number: u64 = number
        .parse()
        .map_err(|_| Error::Other(format!("invalid size '{}'", s)))?;
    let multiplier: u64 = match unit.to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" => 1 << 10,
        "M" | "MB" => 1 << 20,
        "G" | "GB" => 1 << 30,
        "T" | "TB" => 1 << 40,
        _ => return Err(Error::Other(format!("invalid size unit in '{}'", s))),
    };
    number
        .checked_mul(multiplier)
        .ok_or_else(|| Error::Other(format!("size '{}' is too large", s)))
}

fn parse_properties(args: &[String]) -> Result<BTreeMap<String, String>> {
    args.iter()
        .map(|arg| {
            arg.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| Error::Other(format!("expected KEY=VALUE, got '{}'", arg)))
        })
        .collect()
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Size column of the status table, KiB unless `human` is set
fn status_size(bytes: u64, human: bool) -> String {
    if human {
        format_size(bytes)
    } else {
        (bytes / 1024).to_string()
    }
}

fn cmd_status(manager: &StorageManager, human: bool) -> Result<()> {
    println!(
        "{:<15} {:<10} {:<9} {:>14} {:>14} {:>14} {:>6}",
        "NAME", "TYPE", "STATUS", "TOTAL", "USED", "AVAIL", "%"
    );
    for row in manager.status() {
        let percent = match row.state {
            StorageState::Active => format!("{:.1}%", row.status.used_fraction() * 100.0),
            _ => "-".to_string(),
        };
        println!(
            "{:<15} {:<10} {:<9} {:>14} {:>14} {:>14} {:>6}",
            row.id,
            row.storage_type.as_str(),
            row.state.as_str(),
            status_size(row.status.total, human),
            status_size(row.status.used, human),
            status_size(row.status.avail, human),
            percent
        );
    }
    Ok(())
}

fn cmd_list(
    manager: &StorageManager,
    storage: Option<&str>,
    owner: Option<u32>,
    json: bool,
) -> Result<()> {
    let images = manager.list_images(storage, owner, &mut ListCache::new())?;
    if json {
        return print_json(&images);
    }
    if images.is_empty() {
        info("No images found");
        return Ok(());
    }

    println!(
        "{:<45} {:<8} {:<8} {:>9} {:>6}",
        "VOLID", "FORMAT", "CONTENT", "SIZE", "OWNER"
    );
    for image in images {
        let owner = image.owner.map(|o| o.to_string()).unwrap_or_default();
        println!(
            "{:<45} {:<8} {:<8} {:>9} {:>6}",
            image.volid,
            image.format.as_str(),
            image.content.as_str(),
            format_size(image.size),
            owner
        );
        if let Some(parent) = image.parent {
            println!("  parent: {}", parent);
        }
    }
    Ok(())
}

fn cmd_parse(manager: &StorageManager, volid: &str, json: bool) -> Result<()> {
    let (storeid, volume) = manager.parse_volume(volid)?;
    if json {
        return print_json(&serde_json::json!({
            "storage": storeid,
            "volume": volume,
        }));
    }

    println!("storage: {}", storeid);
    println!("content: {}", volume.content());
    if let Some(owner) = volume.owner() {
        println!("owner:   {}", owner);
    }
    if let Some(format) = volume.format() {
        println!("format:  {}", format);
    }
    if let VolumeName::Image(img) = &volume {
        println!("name:    {}", img.name);
        println!("base:    {}", if img.is_base { "yes" } else { "no" });
        if let Some(parent) = &img.parent {
            println!("parent:  {}/{}", parent.owner, parent.name);
        }
    }
    Ok(())
}

fn cmd_alloc(
    manager: &StorageManager,
    storage: &str,
    owner: u32,
    size: &str,
    format: Option<&str>,
    name: Option<&str>,
) -> Result<()> {
    let bytes = parse_size(size)?;
    let format = format
        .map(|f| f.parse::<VolumeFormat>().map_err(Error::Other))
        .transpose()?;
    // allocation is in KiB, round up
    let size_kib = bytes.div_ceil(1024);

    info(&format!("Allocating {} on '{}'...", format_size(bytes), storage));
    let volid = manager.vdisk_alloc(storage, owner, format, name, size_kib)?;
    success(&format!("Allocated {}", volid));
    Ok(())
}

fn cmd_free(manager: &StorageManager, volid: &str) -> Result<()> {
    info(&format!("Removing '{}'...", volid));
    manager.vdisk_free(volid)?;
    success(&format!("Removed {}", volid));
    Ok(())
}

fn cmd_create_base(manager: &StorageManager, volid: &str) -> Result<()> {
    info(&format!("Converting '{}' into a base image...", volid));
    let base = manager.vdisk_create_base(volid)?;
    success(&format!("Base image {}", base));
    Ok(())
}

fn cmd_clone(
    manager: &StorageManager,
    volid: &str,
    owner: u32,
    snapshot: Option<&str>,
) -> Result<()> {
    info(&format!("Cloning '{}' for guest {}...", volid, owner));
    let clone = manager.vdisk_clone(volid, owner, snapshot)?;
    success(&format!("Created {}", clone));
    Ok(())
}

fn cmd_resize(manager: &StorageManager, volid: &str, size: &str) -> Result<()> {
    let bytes = parse_size(size)?;
    info(&format!("Resizing '{}' to {}...", volid, format_size(bytes)));
    let size = manager.volume_resize(volid, bytes)?;
    success(&format!("'{}' is now {}", volid, format_size(size)));
    Ok(())
}

fn cmd_snapshot(manager: &StorageManager, volid: &str, name: &str) -> Result<()> {
    info(&format!("Creating snapshot '{}' of '{}'...", name, volid));
    manager.volume_snapshot(volid, name)?;
    success(&format!("Snapshot created: {}@{}", volid, name));
    Ok(())
}

fn cmd_rollback(manager: &StorageManager, volid: &str, name: &str) -> Result<()> {
    warn(&format!(
        "Changes to '{}' made after snapshot '{}' will be lost",
        volid, name
    ));
    manager.volume_snapshot_rollback(volid, name)?;
    success(&format!("Rolled back '{}' to '{}'", volid, name));
    Ok(())
}

fn cmd_delsnapshot(manager: &StorageManager, volid: &str, name: &str) -> Result<()> {
    info(&format!("Deleting snapshot '{}' of '{}'...", name, volid));
    manager.volume_snapshot_delete(volid, name)?;
    success(&format!("Snapshot '{}' deleted", name));
    Ok(())
}

fn cmd_has_feature(
    manager: &StorageManager,
    feature: &str,
    volid: &str,
    snapshot: Option<&str>,
) -> Result<()> {
    let feature: Feature = feature.parse().map_err(Error::Other)?;
    let available = manager.volume_has_feature(feature, volid, snapshot)?;
    println!("{}", if available { "yes" } else { "no" });
    Ok(())
}

fn prune_row(volid: &str, backup_id: &str, mark: &str) -> String {
    format!("{:<60} {:<15} {}", volid, backup_id, mark)
}

fn cmd_prune_backups(
    manager: &StorageManager,
    storage: &str,
    keep: Option<&str>,
    guest_type: Option<&str>,
    owner: Option<u32>,
    dry_run: bool,
) -> Result<()> {
    let policy = keep.map(str::parse::<PrunePolicy>).transpose()?;
    let guest_type = guest_type
        .map(|t| t.parse::<GuestType>().map_err(Error::Other))
        .transpose()?;

    if dry_run {
        info("Dry run, nothing will be removed");
    }
    let items = manager.prune_backups(storage, policy.as_ref(), guest_type, owner, dry_run)?;
    if items.is_empty() {
        info("No backups found");
        return Ok(());
    }

    println!("{}", prune_row("VOLID", "BACKUP-ID", "MARK"));
    for item in &items {
        println!("{}", prune_row(&item.volid, &item.backup_id(), item.mark.as_str()));
    }

    let removed = items.iter().filter(|i| i.mark == PruneMark::Remove).count();
    if dry_run {
        info(&format!("{} backup(s) would be removed", removed));
    } else {
        success(&format!("{} backup(s) removed", removed));
    }
    Ok(())
}

fn cmd_export(
    manager: &StorageManager,
    volid: &str,
    format: &str,
    output: Option<PathBuf>,
    options: ExportOptions,
) -> Result<()> {
    let format: StreamFormat = format.parse()?;
    match output {
        Some(path) => {
            let mut out = BufWriter::new(File::create(&path)?);
            manager.volume_export(volid, format, &options, &mut out)?;
            out.flush()?;
            success(&format!("Exported '{}' to {}", volid, path.display()));
        }
        // stdout carries the stream, keep it clean
        None => {
            let stdout = io::stdout();
            let mut out = BufWriter::new(stdout.lock());
            manager.volume_export(volid, format, &options, &mut out)?;
            out.flush()?;
        }
    }
    Ok(())
}

fn cmd_import(
    manager: &StorageManager,
    volid: &str,
    format: &str,
    input: Option<PathBuf>,
    listen: Option<IpAddr>,
    options: ImportOptions,
) -> Result<()> {
    let format: StreamFormat = format.parse()?;
    let imported = match (listen, input) {
        (Some(ip), _) => {
            let stdout = io::stdout();
            let mut announce = stdout.lock();
            manager.volume_import_tcp(volid, format, ip, &options, &mut announce)?
        }
        (None, Some(path)) => {
            let mut reader = BufReader::new(File::open(&path)?);
            manager.volume_import(volid, format, &mut reader, &options)?
        }
        (None, None) => {
            let stdin = io::stdin();
            let mut reader = stdin.lock();
            manager.volume_import(volid, format, &mut reader, &options)?
        }
    };
    success(&format!("Imported {}", imported));
    Ok(())
}

fn cmd_add(
    manager: &mut StorageManager,
    storage_type: &str,
    id: &str,
    properties: &[String],
) -> Result<()> {
    let storage_type: StorageType = storage_type.parse().map_err(Error::Other)?;
    let props = parse_properties(properties)?;
    manager.add_storage(id, storage_type, &props)?;
    success(&format!("Storage '{}' added", id));
    Ok(())
}

fn cmd_set(
    manager: &mut StorageManager,
    id: &str,
    properties: &[String],
    delete: &[String],
) -> Result<()> {
    let changes = parse_properties(properties)?;
    manager.update_storage(id, &changes, delete)?;
    success(&format!("Storage '{}' updated", id));
    Ok(())
}

fn cmd_remove(manager: &mut StorageManager, id: &str) -> Result<()> {
    manager.remove_storage(id)?;
    success(&format!("Storage '{}' removed", id));
    info("Volumes on the storage were not touched");
    Ok(())
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn node_name(node: Option<String>) -> Result<String> {
    match node {
        Some(node) => Ok(node),
        None => Ok(nix::unistd::gethostname()?.to_string_lossy().into_owned()),
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let mut manager = StorageManager::new(
        Arc::new(FileConfigStore::new(&cli.config)),
        PluginRegistry::with_defaults(),
        Arc::new(FileLocker::new(&cli.lock_dir)),
        node_name(cli.node)?,
    )?;

    match cli.command {
        None => cmd_status(&manager, false),
        Some(Commands::Status { human }) => cmd_status(&manager, human),
        Some(Commands::List { storage, owner, json }) => {
            cmd_list(&manager, storage.as_deref(), owner, json)
        }
        Some(Commands::Parse { volid, json }) => cmd_parse(&manager, &volid, json),
        Some(Commands::Alloc { storage, owner, size, format, name }) => cmd_alloc(
            &manager,
            &storage,
            owner,
            &size,
            format.as_deref(),
            name.as_deref(),
        ),
        Some(Commands::Free { volid }) => cmd_free(&manager, &volid),
        Some(Commands::CreateBase { volid }) => cmd_create_base(&manager, &volid),
        Some(Commands::Clone { volid, owner, snapshot }) => {
            cmd_clone(&manager, &volid, owner, snapshot.as_deref())
        }
        Some(Commands::Resize { volid, size }) => cmd_resize(&manager, &volid, &size),
        Some(Commands::Snapshot { volid, name }) => cmd_snapshot(&manager, &volid, &name),
        Some(Commands::Rollback { volid, name }) => cmd_rollback(&manager, &volid, &name),
        Some(Commands::Delsnapshot { volid, name }) => cmd_delsnapshot(&manager, &volid, &name),
        Some(Commands::HasFeature { feature, volid, snapshot }) => {
            cmd_has_feature(&manager, &feature, &volid, snapshot.as_deref())
        }
        Some(Commands::PruneBackups { storage, keep, guest_type, owner, dry_run }) => {
            cmd_prune_backups(
                &manager,
                &storage,
                keep.as_deref(),
                guest_type.as_deref(),
                owner,
                dry_run,
            )
        }
        Some(Commands::Export { volid, format, output, snapshot, base, with_snapshots }) => {
            let options = ExportOptions {
                snapshot,
                base_snapshot: base,
                with_snapshots,
            };
            cmd_export(&manager, &volid, &format, output, options)
        }
        Some(Commands::Import {
            volid,
            format,
            input,
            listen,
            base,
            with_snapshots,
            delete_snapshot,
            allow_rename,
        }) => {
            let options = ImportOptions {
                base_snapshot: base,
                with_snapshots,
                delete_snapshot,
                allow_rename,
            };
            cmd_import(&manager, &volid, &format, input, listen, options)
        }
        Some(Commands::Add { storage_type, id, properties }) => {
            cmd_add(&mut manager, &storage_type, &id, &properties)
        }
        Some(Commands::Set { id, properties, delete }) => {
            cmd_set(&mut manager, &id, &properties, &delete)
        }
        Some(Commands::Remove { id }) => cmd_remove(&mut manager, &id),
    }
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error(&e.to_string());
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use volstore::PruneItem;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("512").unwrap(), 512);
        assert_eq!(parse_size("4K").unwrap(), 4096);
        assert_eq!(parse_size("32G").unwrap(), 32 << 30);
        assert_eq!(parse_size("1tb").unwrap(), 1 << 40);
        assert!(parse_size("G").is_err());
        assert!(parse_size("12X").is_err());
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512B");
        assert_eq!(format_size(1536), "1.5K");
        assert_eq!(format_size(32 << 30), "32.0G");
    }

    #[test]
    fn test_status_sizes_default_to_kib() {
        assert_eq!(status_size(32 << 30, false), "33554432");
        assert_eq!(status_size(1023, false), "0");
        assert_eq!(status_size(32 << 30, true), "32.0G");
    }

    #[test]
    fn test_prune_row_columns() {
        let item = PruneItem {
            volid: "local:backup/vzdump-qemu-100-2024_01_01-00_00_00.vma.zst".to_string(),
            guest_type: Some(GuestType::Qemu),
            owner: Some(100),
            ctime: None,
            mark: PruneMark::Keep,
        };
        let row = prune_row(&item.volid, &item.backup_id(), item.mark.as_str());
        let columns: Vec<&str> = row.split_whitespace().collect();
        assert_eq!(columns, vec![item.volid.as_str(), "qemu/100", "keep"]);
    }

    #[test]
    fn test_parse_properties() {
        let props = parse_properties(&["path=/srv/a".to_string(), "content=images,iso".to_string()])
            .unwrap();
        assert_eq!(props["path"], "/srv/a");
        assert_eq!(props["content"], "images,iso");
        assert!(parse_properties(&["path".to_string()]).is_err());
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from([
            "volstore",
            "--node",
            "node1",
            "alloc",
            "local",
            "100",
            "4G",
            "--format",
            "qcow2",
        ])
        .unwrap();
        assert_eq!(cli.node.as_deref(), Some("node1"));
        assert!(matches!(
            cli.command,
            Some(Commands::Alloc { owner: 100, .. })
        ));

        let cli = Cli::try_parse_from(["volstore", "status", "-H"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Status { human: true })));
    }
}

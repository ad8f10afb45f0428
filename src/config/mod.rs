//! Storage configuration
//!
//! The configuration is a section file (see [`section`]) with one section per
//! storage. Each section is decoded against the property declarations of its
//! type (see [`schema`]) into a [`StorageConfig`].

pub mod schema;
pub mod section;

use crate::error::{Error, Result};
use crate::prune::PrunePolicy;
use crate::types::{ContentType, StorageType, VolumeFormat};
use crate::volname::parse_storage_id;
use schema::{check_config, lookup, type_info, ParseMode, PropertyValue};
use section::{parse_sections, write_sections, RawSection, SectionError};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Default location of the storage configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/volstore/storage.cfg";

/// Id of the storage that always exists
pub const LOCAL_STORAGE_ID: &str = "local";

const LOCAL_STORAGE_PATH: &str = "/var/lib/vz";

/// Configuration of a single storage
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StorageConfig {
    pub id: String,
    pub storage_type: StorageType,
    pub content: BTreeSet<ContentType>,
    /// Nodes the storage is available on, `None` for all nodes
    pub nodes: Option<BTreeSet<String>>,
    pub shared: bool,
    pub disabled: bool,
    /// Default image format for new volumes
    pub format: Option<VolumeFormat>,
    pub path: Option<PathBuf>,
    pub pool: Option<String>,
    pub prune: Option<PrunePolicy>,
    /// Legacy retention setting, superseded by `prune`
    pub maxfiles: Option<u32>,
    /// Remaining declared properties, undecoded
    pub properties: BTreeMap<String, String>,
    /// Keys not declared for the type, kept so they survive a rewrite
    pub unknown: BTreeMap<String, String>,
}

impl StorageConfig {
    /// Decode a storage from its raw properties
    pub fn from_properties<'a, I>(
        id: &str,
        storage_type: StorageType,
        props: I,
        mode: ParseMode,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        parse_storage_id(id).map_err(|e| Error::Config(e.to_string()))?;

        let mut config = StorageConfig {
            id: id.to_string(),
            storage_type,
            content: type_info(storage_type).default_content.iter().copied().collect(),
            nodes: None,
            shared: storage_type.is_shared_by_default(),
            disabled: false,
            format: None,
            path: None,
            pool: None,
            prune: None,
            maxfiles: None,
            properties: BTreeMap::new(),
            unknown: BTreeMap::new(),
        };

        for (key, raw) in props {
            if lookup(storage_type, key).is_none() {
                if mode == ParseMode::Strict {
                    return Err(Error::Config(format!(
                        "property '{}' is not defined for storage type '{}'",
                        key, storage_type
                    )));
                }
                warn!(storage = id, key, "keeping unknown property");
                config.unknown.insert(key.to_string(), raw.to_string());
                continue;
            }

            match (key, schema::decode_value(storage_type, key, raw, mode)?) {
                ("content", PropertyValue::Content(c)) => config.content = c,
                ("nodes", PropertyValue::Nodes(n)) => config.nodes = Some(n),
                ("disable", PropertyValue::Bool(b)) => config.disabled = b,
                ("shared", PropertyValue::Bool(b)) => config.shared = b,
                ("format", PropertyValue::Format(f)) => config.format = Some(f),
                ("path", PropertyValue::Path(p)) => config.path = Some(p),
                ("pool", PropertyValue::String(p)) => config.pool = Some(p),
                ("prune-backups", PropertyValue::Prune(p)) => config.prune = Some(p),
                ("maxfiles", PropertyValue::Integer(n)) => {
                    config.maxfiles = Some(u32::try_from(n).unwrap_or(u32::MAX))
                }
                _ => {
                    config.properties.insert(key.to_string(), raw.to_string());
                }
            }
        }

        if storage_type.is_network_mount() && config.path.is_none() {
            config.path = Some(schema::default_mountpoint(id));
        }

        Ok(config)
    }

    /// Encode the storage back into properties, in a stable order
    pub fn to_properties(&self) -> Vec<(String, String)> {
        let mut props = Vec::new();
        let mut push = |k: &str, v: String| props.push((k.to_string(), v));

        if let Some(path) = &self.path {
            push("path", path.display().to_string());
        }
        if let Some(pool) = &self.pool {
            push("pool", pool.clone());
        }
        for (k, v) in &self.properties {
            push(k.as_str(), v.clone());
        }
        if self.content.is_empty() {
            push("content", "none".to_string());
        } else {
            let list: Vec<&str> = self.content.iter().map(|c| c.as_str()).collect();
            push("content", list.join(","));
        }
        if let Some(nodes) = &self.nodes {
            push("nodes", nodes.iter().cloned().collect::<Vec<_>>().join(","));
        }
        if self.shared != self.storage_type.is_shared_by_default() {
            push("shared", if self.shared { "1" } else { "0" }.to_string());
        }
        if self.disabled {
            push("disable", "1".to_string());
        }
        if let Some(format) = self.format {
            push("format", format.to_string());
        }
        if let Some(prune) = &self.prune {
            push("prune-backups", prune.to_string());
        }
        if let Some(maxfiles) = self.maxfiles {
            push("maxfiles", maxfiles.to_string());
        }
        for (k, v) in &self.unknown {
            push(k.as_str(), v.clone());
        }
        props
    }

    /// Effective retention policy
    pub fn prune_policy(&self) -> PrunePolicy {
        self.prune
            .or_else(|| self.maxfiles.map(PrunePolicy::from_maxfiles))
            .unwrap_or_default()
    }

    pub fn has_content(&self, content: ContentType) -> bool {
        self.content.contains(&content)
    }

    /// Default format for new images
    pub fn default_format(&self) -> Option<VolumeFormat> {
        self.format.or(type_info(self.storage_type).default_format)
    }

    /// Whether the storage is usable on `node`
    pub fn available_on(&self, node: &str) -> bool {
        !self.disabled && self.nodes.as_ref().map_or(true, |n| n.contains(node))
    }

    /// Property value as the user wrote it, including undeclared keys
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties
            .get(key)
            .or_else(|| self.unknown.get(key))
            .map(String::as_str)
    }

    fn to_section(&self) -> RawSection {
        let mut section = RawSection::new(self.storage_type.as_str(), &self.id);
        section.properties = self.to_properties();
        section
    }
}

fn local_storage() -> StorageConfig {
    StorageConfig {
        id: LOCAL_STORAGE_ID.to_string(),
        storage_type: StorageType::Dir,
        content: [
            ContentType::Images,
            ContentType::Rootdir,
            ContentType::Iso,
            ContentType::Vztmpl,
        ]
        .into_iter()
        .collect(),
        nodes: None,
        shared: false,
        disabled: false,
        format: None,
        path: Some(PathBuf::from(LOCAL_STORAGE_PATH)),
        pool: None,
        prune: None,
        maxfiles: None,
        properties: BTreeMap::new(),
        unknown: BTreeMap::new(),
    }
}

/// All configured storages
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Configuration {
    pub storages: BTreeMap<String, StorageConfig>,
}

impl Configuration {
    pub fn get(&self, id: &str) -> Result<&StorageConfig> {
        self.storages
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("storage '{}'", id)))
    }

    /// Storage `id`, failing when it is disabled or not available on `node`
    pub fn enabled_on(&self, id: &str, node: &str) -> Result<&StorageConfig> {
        let storage = self.get(id)?;
        if storage.disabled {
            return Err(Error::Config(format!("storage '{}' is disabled", id)));
        }
        if !storage.available_on(node) {
            return Err(Error::Config(format!(
                "storage '{}' is not available on node '{}'",
                id, node
            )));
        }
        Ok(storage)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.storages.keys().map(String::as_str)
    }

    /// Add a new storage from user input
    pub fn add_storage(
        &mut self,
        id: &str,
        storage_type: StorageType,
        props: &BTreeMap<String, String>,
    ) -> Result<&StorageConfig> {
        if self.storages.contains_key(id) {
            return Err(Error::AlreadyExists(format!("storage ID '{}'", id)));
        }
        let props = check_config(id, storage_type, props, true)?;
        let config = StorageConfig::from_properties(
            id,
            storage_type,
            props.iter().map(|(k, v)| (k.as_str(), v.as_str())),
            ParseMode::Strict,
        )?;
        debug!(storage = id, %storage_type, "adding storage");
        Ok(self.storages.entry(id.to_string()).or_insert(config))
    }

    /// Change properties of an existing storage
    ///
    /// `changes` are set, `delete` keys are removed. Fixed properties can
    /// be neither changed nor deleted.
    pub fn update_storage(
        &mut self,
        id: &str,
        changes: &BTreeMap<String, String>,
        delete: &[String],
    ) -> Result<&StorageConfig> {
        let current = self.get(id)?;
        let storage_type = current.storage_type;
        let changes = check_config(id, storage_type, changes, false)?;

        let mut props: BTreeMap<String, String> = current.to_properties().into_iter().collect();
        for key in delete {
            match lookup(storage_type, key) {
                Some(decl) if decl.fixed => {
                    return Err(Error::Config(format!("can't delete fixed property '{}'", key)));
                }
                Some(_) => {
                    props.remove(key);
                }
                None => {
                    return Err(Error::Config(format!(
                        "property '{}' is not defined for storage type '{}'",
                        key, storage_type
                    )));
                }
            }
        }
        for (k, v) in changes {
            if delete.contains(&k) {
                return Err(Error::Config(format!(
                    "cannot set and delete property '{}' at the same time",
                    k
                )));
            }
            props.insert(k, v);
        }

        let unknown = current.unknown.clone();
        let mut updated = StorageConfig::from_properties(
            id,
            storage_type,
            props
                .iter()
                .filter(|(k, _)| !unknown.contains_key(*k))
                .map(|(k, v)| (k.as_str(), v.as_str())),
            ParseMode::Strict,
        )?;
        updated.unknown = unknown;

        debug!(storage = id, "updating storage");
        let slot = self
            .storages
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("storage '{}'", id)))?;
        *slot = updated;
        Ok(slot)
    }

    pub fn remove_storage(&mut self, id: &str) -> Result<StorageConfig> {
        if id == LOCAL_STORAGE_ID {
            return Err(Error::Config(format!("can't remove storage '{}'", id)));
        }
        self.storages
            .remove(id)
            .ok_or_else(|| Error::NotFound(format!("storage '{}'", id)))
    }

    /// Serialize into the section file format
    pub fn write(&self) -> String {
        let sections: Vec<RawSection> = self.storages.values().map(|s| s.to_section()).collect();
        write_sections(&sections)
    }
}

/// Result of reading a configuration file
#[derive(Debug, Clone)]
pub struct ParsedConfig {
    pub config: Configuration,
    /// Sections that were skipped
    pub errors: Vec<SectionError>,
}

/// Read a configuration from section file text
///
/// Invalid sections are skipped and reported in [`ParsedConfig::errors`].
pub fn parse(text: &str, mode: ParseMode) -> ParsedConfig {
    let (sections, mut errors) = parse_sections(text);
    let mut config = Configuration::default();

    for raw in sections {
        let fail = |message: String| SectionError {
            line: raw.line,
            section: Some(raw.id.clone()),
            message,
        };

        let storage_type = match raw.section_type.parse::<StorageType>() {
            Ok(t) => t,
            Err(e) => {
                errors.push(fail(e));
                continue;
            }
        };
        if raw.id == LOCAL_STORAGE_ID && storage_type != StorageType::Dir {
            errors.push(fail(format!(
                "storage '{}' must be of type 'dir'",
                LOCAL_STORAGE_ID
            )));
            continue;
        }
        if config.storages.contains_key(&raw.id) {
            errors.push(fail("duplicate storage ID".to_string()));
            continue;
        }

        let props = raw.properties.iter().map(|(k, v)| (k.as_str(), v.as_str()));
        match StorageConfig::from_properties(&raw.id, storage_type, props, mode) {
            Ok(storage) => {
                config.storages.insert(raw.id.clone(), storage);
            }
            Err(e) => errors.push(fail(e.to_string())),
        }
    }

    for e in &errors {
        warn!("skipping storage configuration entry: {}", e);
    }

    ParsedConfig {
        config: normalize(config),
        errors,
    }
}

/// Apply defaults that every configuration carries
pub fn normalize(mut config: Configuration) -> Configuration {
    config
        .storages
        .entry(LOCAL_STORAGE_ID.to_string())
        .or_insert_with(local_storage);
    config
}

/// Persistent home of the configuration text
pub trait ConfigStore: Send + Sync {
    fn read(&self) -> Result<String>;
    fn write(&self, text: &str) -> Result<()>;
}

/// Configuration kept in a file on disk
#[derive(Debug, Clone)]
pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStore for FileConfigStore {
    fn read(&self) -> Result<String> {
        match fs::read_to_string(&self.path) {
            Ok(text) => Ok(text),
            // a missing file is an empty configuration
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, text: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension(format!("tmp.{}", std::process::id()));
        fs::write(&tmp, text)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Configuration kept in memory
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    text: Mutex<String>,
}

impl MemoryConfigStore {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: Mutex::new(text.into()),
        }
    }
}

impl ConfigStore for MemoryConfigStore {
    fn read(&self) -> Result<String> {
        Ok(self.text.lock().map_err(|_| Error::Other("config store poisoned".into()))?.clone())
    }

    fn write(&self, text: &str) -> Result<()> {
        *self.text.lock().map_err(|_| Error::Other("config store poisoned".into()))? =
            text.to_string();
        Ok(())
    }
}

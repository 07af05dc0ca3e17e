//! Server registry: the authoritative list of tool server descriptors.
//!
//! The registry keeps each descriptor twice: the raw form as written in the
//! config file (so `${VAR}` references survive a save) and the expanded form
//! handed to callers. It never holds live connections.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::descriptor::ServerDescriptor;
use crate::error::{ConfigError, Result};

/// The `[[servers]]` portion of a config file. Other tables are ignored.
#[derive(Debug, Default, Serialize, Deserialize)]
struct ServersFile {
    #[serde(default)]
    servers: Vec<ServerDescriptor>,
}

#[derive(Debug, Clone)]
struct Entry {
    raw: ServerDescriptor,
    expanded: ServerDescriptor,
}

impl Entry {
    fn new(raw: ServerDescriptor) -> Result<Self> {
        let expanded = raw.expanded();
        expanded.validate()?;
        Ok(Self { raw, expanded })
    }
}

/// Ordered, name-unique collection of server descriptors.
#[derive(Debug, Clone, Default)]
pub struct ServerRegistry {
    entries: Vec<Entry>,
    path: Option<PathBuf>,
}

impl ServerRegistry {
    /// Create an empty, in-memory registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a registry from a TOML file. Mutations are persisted back to it.
    ///
    /// A missing file yields an empty registry bound to `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut registry = if path.is_file() {
            let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
                path: path.display().to_string(),
                source: e,
            })?;
            Self::from_toml(&contents)?
        } else {
            tracing::debug!(path = %path.display(), "registry file not found, starting empty");
            Self::new()
        };
        registry.path = Some(path.to_path_buf());
        Ok(registry)
    }

    /// Parse `[[servers]]` tables from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let file: ServersFile = toml::from_str(toml_str)?;
        Self::from_descriptors(file.servers)
    }

    /// Build a registry from raw descriptors, validating each.
    pub fn from_descriptors(descriptors: impl IntoIterator<Item = ServerDescriptor>) -> Result<Self> {
        let mut registry = Self::new();
        for descriptor in descriptors {
            registry.insert(descriptor)?;
        }
        Ok(registry)
    }

    /// Backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Bind the registry to a file for subsequent saves.
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Number of descriptors.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether a descriptor with this name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// Expanded descriptor by name.
    pub fn get(&self, name: &str) -> Option<&ServerDescriptor> {
        self.position(name).map(|i| &self.entries[i].expanded)
    }

    /// Raw descriptor by name, as written in the config file.
    pub fn get_raw(&self, name: &str) -> Option<&ServerDescriptor> {
        self.position(name).map(|i| &self.entries[i].raw)
    }

    /// All expanded descriptors in registry order.
    pub fn descriptors(&self) -> Vec<ServerDescriptor> {
        self.entries.iter().map(|e| e.expanded.clone()).collect()
    }

    /// Enabled expanded descriptors in registry order.
    pub fn enabled(&self) -> Vec<ServerDescriptor> {
        self.entries
            .iter()
            .filter(|e| e.expanded.enabled)
            .map(|e| e.expanded.clone())
            .collect()
    }

    /// Names in registry order.
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.raw.name.as_str()).collect()
    }

    /// Add a descriptor and persist.
    pub fn add(&mut self, descriptor: ServerDescriptor) -> Result<()> {
        let name = descriptor.name.clone();
        let previous = self.entries.clone();
        self.insert(descriptor)?;
        self.persist_or_restore(previous)?;
        tracing::info!(server = %name, "server added to registry");
        Ok(())
    }

    /// Replace an existing descriptor with the same name and persist.
    pub fn update(&mut self, descriptor: ServerDescriptor) -> Result<()> {
        let idx = self
            .position(&descriptor.name)
            .ok_or_else(|| ConfigError::not_found(&descriptor.name))?;
        let name = descriptor.name.clone();
        let previous = self.entries.clone();
        self.entries[idx] = Entry::new(descriptor)?;
        self.persist_or_restore(previous)?;
        tracing::info!(server = %name, "server updated in registry");
        Ok(())
    }

    /// Remove a descriptor by name and persist. Returns the removed raw descriptor.
    pub fn remove(&mut self, name: &str) -> Result<ServerDescriptor> {
        let idx = self
            .position(name)
            .ok_or_else(|| ConfigError::not_found(name))?;
        let previous = self.entries.clone();
        let entry = self.entries.remove(idx);
        self.persist_or_restore(previous)?;
        tracing::info!(server = %name, "server removed from registry");
        Ok(entry.raw)
    }

    /// Set the persisted enabled flag and persist.
    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> Result<()> {
        let idx = self
            .position(name)
            .ok_or_else(|| ConfigError::not_found(name))?;
        let previous = self.entries.clone();
        let entry = &mut self.entries[idx];
        entry.raw.enabled = enabled;
        entry.expanded.enabled = enabled;
        self.persist_or_restore(previous)?;
        tracing::info!(server = %name, enabled, "server enabled flag changed");
        Ok(())
    }

    /// Write the raw descriptors to the backing file.
    ///
    /// Other tables already present in the file are kept; only `servers` is
    /// replaced. Does nothing for an in-memory registry.
    pub fn save(&self) -> Result<()> {
        match &self.path {
            Some(path) => self.save_to(path),
            None => Ok(()),
        }
    }

    /// Write the raw descriptors to an explicit path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let mut table = if path.is_file() {
            let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
                path: path.display().to_string(),
                source: e,
            })?;
            toml::from_str::<toml::Table>(&contents)?
        } else {
            toml::Table::new()
        };

        let servers = toml::Value::try_from(
            self.entries
                .iter()
                .map(|e| e.raw.clone())
                .collect::<Vec<_>>(),
        )?;
        table.insert("servers".to_string(), servers);

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::WriteFile {
                path: parent.display().to_string(),
                source: e,
            })?;
        }

        let contents = toml::to_string_pretty(&table)?;
        std::fs::write(path, contents).map_err(|e| ConfigError::WriteFile {
            path: path.display().to_string(),
            source: e,
        })?;
        tracing::debug!(path = %path.display(), servers = self.entries.len(), "registry saved");
        Ok(())
    }

    fn insert(&mut self, descriptor: ServerDescriptor) -> Result<()> {
        if self.contains(&descriptor.name) {
            return Err(ConfigError::duplicate(&descriptor.name));
        }
        self.entries.push(Entry::new(descriptor)?);
        Ok(())
    }

    /// Save, putting `previous` back if the write fails so memory and disk
    /// never disagree.
    fn persist_or_restore(&mut self, previous: Vec<Entry>) -> Result<()> {
        if let Err(e) = self.save() {
            tracing::warn!(error = %e, "registry save failed, change rolled back");
            self.entries = previous;
            return Err(e);
        }
        Ok(())
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.raw.name == name)
    }
}

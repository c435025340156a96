//! Configuration and Values layers
//!
//! - **ConfigLayer**: read-only defaults merged from every `*.ini` file in a directory
//! - **ValuesLayer**: settings a client explicitly changed, persisted to one file

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::settings::{Section, SettingsStore};
use crate::constants::{paths, sections};

/// True for `override`, `fallback` and `datatype`
pub fn is_special(section: &str) -> bool {
    sections::SPECIALS.contains(&section)
}

/// Layered defaults: `override`, `fallback`, `datatype` and one section per profile
#[derive(Debug, Clone, Default)]
pub struct ConfigLayer {
    store: SettingsStore,
}

impl ConfigLayer {
    #[cfg(test)]
    pub fn from_store(store: SettingsStore) -> Self {
        Self { store }
    }

    /// Merge every definition file in `dir`, in file name order
    ///
    /// Later files add to or replace keys of sections seen in earlier files.
    /// A missing or unreadable directory yields an empty layer.
    pub fn load_dir(dir: &Path) -> Self {
        let mut store = SettingsStore::new();
        let files = definition_files(dir);
        for file in &files {
            store.load(file);
        }
        info!(dir = %dir.display(), files = files.len(), "Loaded configuration");
        Self { store }
    }

    pub fn value<'a>(&'a self, section: &str, key: &str, default: &'a str) -> &'a str {
        self.store.value(section, key, default)
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.store.get(section, key)
    }

    pub fn section_names(&self) -> impl Iterator<Item = &str> {
        self.store.section_names()
    }

    pub fn sections(&self) -> impl Iterator<Item = (&str, &Section)> {
        self.store.sections()
    }
}

fn definition_files(dir: &Path) -> Vec<PathBuf> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "Cannot read configuration directory");
            return Vec::new();
        }
    };

    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.is_file()
                && path.extension().is_some_and(|ext| ext == paths::CONFIG_EXTENSION)
        })
        .collect();
    files.sort();
    files
}

/// User-set values, the delta from the layered defaults
#[derive(Debug, Clone, Default)]
pub struct ValuesLayer {
    store: SettingsStore,
}

impl ValuesLayer {
    pub fn load(path: &Path) -> Self {
        let mut store = SettingsStore::new();
        store.load(path);
        info!(path = %path.display(), profiles = store.section_names().count(), "Loaded values");
        Self { store }
    }

    pub fn get(&self, profile: &str, key: &str) -> Option<&str> {
        self.store.get(profile, key)
    }

    /// Assign in memory; callers check the profile and persist
    pub fn set(&mut self, profile: &str, key: &str, value: &str) {
        self.store.set(profile, key, value);
    }

    #[cfg(test)]
    pub fn remove(&mut self, profile: &str, key: &str) -> Option<String> {
        self.store.remove(profile, key)
    }

    pub fn section_names(&self) -> impl Iterator<Item = &str> {
        self.store.section_names()
    }

    pub fn sections(&self) -> impl Iterator<Item = (&str, &Section)> {
        self.store.sections()
    }
}

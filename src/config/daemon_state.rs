//! Daemon runtime state
//!
//! Owns both layers and the active profile. Resolution of effective values,
//! the profile session and persistence of the user-set delta all live here.
//! Only the event loop touches it, so nothing is locked.

use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::fs;
use tracing::{debug, info, warn};

use super::layers::{is_special, ConfigLayer, ValuesLayer};
use super::paths::ServicePaths;
use super::settings::{write_atomic, SettingsStore};
use crate::constants::sections;

/// `Some` only for present, non-empty values
///
/// An empty string counts as unset at every resolution step, so a user value
/// of "" never hides a lower-precedence default.
fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

#[derive(Debug)]
pub struct DaemonState {
    pub paths: ServicePaths,
    pub config: ConfigLayer,
    pub values: ValuesLayer,
    profile: String,
}

impl DaemonState {
    /// Empty layers, built-in default profile, nothing read from disk
    #[cfg(test)]
    pub fn new(paths: ServicePaths) -> Self {
        Self {
            paths,
            config: ConfigLayer::default(),
            values: ValuesLayer::default(),
            profile: sections::DEFAULT_PROFILE.to_string(),
        }
    }

    /// Load configuration, values and the active profile tag
    pub fn load(paths: ServicePaths) -> Self {
        let config = ConfigLayer::load_dir(&paths.config_dir);
        let values = ValuesLayer::load(&paths.values_file);
        let profile = load_profile_tag(&paths);
        info!(profile = %profile, "Daemon state loaded");
        Self {
            paths,
            config,
            values,
            profile,
        }
    }

    // ------------------------------------------------------------------
    // Resolution
    // ------------------------------------------------------------------

    /// Empty profile argument means the active profile
    fn profile_or_current<'a>(&'a self, profile: &'a str) -> &'a str {
        if profile.is_empty() { &self.profile } else { profile }
    }

    /// Layered default, ignoring user values: override > profile > fallback
    fn default_value(&self, profile: &str, key: &str) -> Option<&str> {
        non_empty(self.config.get(sections::OVERRIDE, key))
            .or_else(|| non_empty(self.config.get(profile, key)))
            .or_else(|| non_empty(self.config.get(sections::FALLBACK, key)))
    }

    /// Values > override > profile > fallback, "" when nothing is set
    pub fn effective_value(&self, profile: &str, key: &str) -> String {
        let profile = self.profile_or_current(profile);
        non_empty(self.values.get(profile, key))
            .or_else(|| self.default_value(profile, key))
            .unwrap_or_default()
            .to_string()
    }

    /// Every key of a non-special section in either layer
    pub fn known_keys(&self) -> BTreeSet<String> {
        self.config
            .sections()
            .chain(self.values.sections())
            .filter(|(name, _)| !is_special(name))
            .flat_map(|(_, section)| section.keys().cloned())
            .collect()
    }

    pub fn datatype(&self, key: &str) -> String {
        self.config
            .value(sections::DATATYPE, key, sections::UNKNOWN_DATATYPE)
            .to_string()
    }

    /// (key, effective value, datatype) for every known key
    pub fn values_for(&self, profile: &str) -> Vec<(String, String, String)> {
        let profile = self.profile_or_current(profile).to_string();
        self.known_keys()
            .into_iter()
            .map(|key| {
                let value = self.effective_value(&profile, &key);
                let datatype = self.datatype(&key);
                (key, value, datatype)
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Profiles
    // ------------------------------------------------------------------

    /// Configuration sections, Values sections and built-ins, minus specials
    pub fn profiles(&self) -> BTreeSet<String> {
        self.config
            .section_names()
            .chain(self.values.section_names())
            .chain(sections::BUILTIN_PROFILES)
            .filter(|name| !is_special(name))
            .map(str::to_string)
            .collect()
    }

    pub fn has_profile(&self, profile: &str) -> bool {
        !is_special(profile)
            && (sections::BUILTIN_PROFILES.contains(&profile)
                || self.config.section_names().any(|name| name == profile)
                || self.values.section_names().any(|name| name == profile))
    }

    pub fn current_profile(&self) -> &str {
        &self.profile
    }

    /// Switch profile if known; returns the active profile and whether the target was known
    pub fn set_profile(&mut self, profile: &str) -> (String, bool) {
        if !self.has_profile(profile) {
            debug!(profile = %profile, current = %self.profile, "Ignoring switch to unknown profile");
            return (self.profile.clone(), false);
        }
        let changed = self.profile != profile;
        if changed {
            info!(from = %self.profile, to = %profile, "Active profile changed");
            self.profile = profile.to_string();
        }
        (self.profile.clone(), true)
    }

    /// Assign a user value; false (and no change) for unknown profiles
    pub fn set_value(&mut self, profile: &str, key: &str, value: &str) -> bool {
        let profile = self.profile_or_current(profile).to_string();
        if !self.has_profile(&profile) {
            debug!(profile = %profile, key = %key, "Ignoring value for unknown profile");
            return false;
        }
        debug!(profile = %profile, key = %key, value = %value, "Value set");
        self.values.set(&profile, key, value);
        true
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// User values that differ from what the defaults alone resolve to
    pub fn overrides(&self) -> SettingsStore {
        let mut delta = SettingsStore::new();
        for (profile, section) in self.values.sections() {
            if is_special(profile) {
                continue;
            }
            for (key, value) in section {
                if self.default_value(profile, key).unwrap_or_default() != value.as_str() {
                    delta.set(profile, key, value);
                }
            }
        }
        delta
    }

    /// Write the profile tag and the recomputed value overrides
    pub fn save(&self) -> Result<()> {
        write_atomic(&self.paths.profile_tag, self.profile.as_bytes())
            .with_context(|| format!("Failed to save profile tag to {}", self.paths.profile_tag.display()))?;
        self.overrides()
            .save(&self.paths.values_file)
            .with_context(|| format!("Failed to save values to {}", self.paths.values_file.display()))?;
        Ok(())
    }
}

fn load_profile_tag(paths: &ServicePaths) -> String {
    match fs::read_to_string(&paths.profile_tag) {
        Ok(contents) if !contents.trim().is_empty() => contents.trim().to_string(),
        Ok(_) => {
            warn!(path = %paths.profile_tag.display(), "Empty profile tag, using default profile");
            sections::DEFAULT_PROFILE.to_string()
        }
        Err(e) => {
            debug!(path = %paths.profile_tag.display(), error = %e, "No profile tag, using default profile");
            sections::DEFAULT_PROFILE.to_string()
        }
    }
}

//! Section-delimited settings file
//!
//! In-memory table of named sections, each mapping key → string value,
//! with a fail-soft loader and an atomic saver for the line-oriented text format:
//!
//! ```text
//! # comment
//! [section]
//! key=value
//! ```
//!
//! Section names, keys and values are escaped on write; keys additionally
//! escape `=`, `[` and `#`.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::constants::paths;

/// Key → value mapping of one section
pub type Section = BTreeMap<String, String>;

/// Named sections loaded from one or more settings files
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettingsStore {
    sections: BTreeMap<String, Section>,
}

impl SettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get section, creating it empty if needed
    pub fn add_section(&mut self, name: &str) -> &mut Section {
        self.sections.entry(name.to_string()).or_default()
    }

    /// Raw lookup, None when either the section or the key is missing
    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .get(section)
            .and_then(|sec| sec.get(key))
            .map(String::as_str)
    }

    /// Lookup with a caller supplied default
    pub fn value<'a>(&'a self, section: &str, key: &str, default: &'a str) -> &'a str {
        self.get(section, key).unwrap_or(default)
    }

    pub fn set(&mut self, section: &str, key: &str, value: &str) {
        self.add_section(section)
            .insert(key.to_string(), value.to_string());
    }

    #[cfg(test)]
    pub fn remove(&mut self, section: &str, key: &str) -> Option<String> {
        self.sections.get_mut(section).and_then(|sec| sec.remove(key))
    }

    pub fn section_names(&self) -> impl Iterator<Item = &str> {
        self.sections.keys().map(String::as_str)
    }

    pub fn sections(&self) -> impl Iterator<Item = (&str, &Section)> {
        self.sections.iter().map(|(name, sec)| (name.as_str(), sec))
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    /// Merge a settings file into this store
    ///
    /// Never fails: a missing file falls back to its `.bak` sibling, unreadable
    /// files and malformed lines are logged and skipped. Keys from the file
    /// replace same-named keys already present in a section.
    pub fn load(&mut self, path: &Path) {
        let source = if path.exists() {
            path.to_path_buf()
        } else {
            let backup = sibling(path, paths::BACKUP_SUFFIX);
            if !backup.exists() {
                debug!(path = %path.display(), "Settings file not found, nothing to load");
                return;
            }
            warn!(path = %path.display(), backup = %backup.display(), "Settings file missing, recovering from backup");
            backup
        };

        let bytes = match fs::read(&source) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(path = %source.display(), error = %e, "Failed to read settings file");
                return;
            }
        };
        self.parse(&String::from_utf8_lossy(&bytes), &source);
    }

    fn parse(&mut self, contents: &str, origin: &Path) {
        let mut current: Option<String> = None;
        let mut entries = 0usize;

        for (index, line) in contents.lines().enumerate() {
            if line.starts_with('#') {
                continue;
            }

            if let Some(rest) = line.strip_prefix('[') {
                let name = unescape(rest.rsplit_once(']').map_or(rest, |(name, _)| name));
                self.add_section(&name);
                current = Some(name);
                continue;
            }

            match (&current, split_entry(line)) {
                (Some(section), Some((key, value))) => {
                    self.set(section, &unescape_key(key.trim()), &unescape(value.trim()));
                    entries += 1;
                }
                _ if line.trim().is_empty() => {}
                _ => {
                    warn!(
                        path = %origin.display(),
                        line = index + 1,
                        content = %line,
                        "Skipping malformed settings line"
                    );
                }
            }
        }

        debug!(path = %origin.display(), entries, "Loaded settings file");
    }

    /// Render the store in the on-disk text format
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (name, section) in &self.sections {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&format!("[{}]\n", escape(name)));
            for (key, value) in section {
                out.push_str(&format!("{}={}\n", escape_key(key), escape(value)));
            }
        }
        out
    }

    /// Atomically replace the file at `path` with the store contents
    ///
    /// Content goes to `<path>.tmp` first, the previous file is kept as a hard
    /// linked `<path>.bak`, then the temp file is renamed over the target.
    /// The target path always holds either the old or the new complete file.
    pub fn save(&self, path: &Path) -> Result<()> {
        write_atomic(path, self.render().as_bytes())?;
        info!(path = %path.display(), sections = self.sections.len(), "Saved settings file");
        Ok(())
    }
}

/// `<path>.<suffix>` next to `path`
pub fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

/// Write `payload` to `path` via temp file + backup + rename
pub fn write_atomic(path: &Path, payload: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }

    let temp = sibling(path, paths::TEMP_SUFFIX);
    let backup = sibling(path, paths::BACKUP_SUFFIX);

    {
        let mut file = fs::File::create(&temp)
            .with_context(|| format!("Failed to create temp file {}", temp.display()))?;
        file.write_all(payload)
            .with_context(|| format!("Failed to write temp file {}", temp.display()))?;
        file.sync_all()
            .with_context(|| format!("Failed to sync temp file {}", temp.display()))?;
    }

    if backup.exists() {
        fs::remove_file(&backup)
            .with_context(|| format!("Failed to remove old backup {}", backup.display()))?;
    }
    if path.exists() {
        // Hard link keeps the target in place until the rename below replaces it
        if let Err(e) = fs::hard_link(path, &backup) {
            debug!(path = %path.display(), error = %e, "Hard link failed, copying backup instead");
            fs::copy(path, &backup)
                .with_context(|| format!("Failed to back up {}", path.display()))?;
        }
    }

    fs::rename(&temp, path)
        .with_context(|| format!("Failed to move {} into place", temp.display()))?;

    // The rename is only durable once the directory entry is on disk
    let dir = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => parent,
        None => Path::new("."),
    };
    fs::File::open(dir)
        .and_then(|d| d.sync_all())
        .with_context(|| format!("Failed to sync directory {}", dir.display()))?;
    Ok(())
}

/// Characters that only need escaping inside keys
const KEY_LITERALS: [char; 3] = ['=', '[', '#'];

fn push_escaped(out: &mut String, c: char) {
    match c {
        '\\' => out.push_str("\\\\"),
        '\n' => out.push_str("\\n"),
        '\r' => out.push_str("\\r"),
        '\t' => out.push_str("\\t"),
        other => out.push(other),
    }
}

/// Escape characters that would break the line format
pub fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        push_escaped(&mut out, c);
    }
    out
}

/// Like [`escape`], and also protects `=`, `[` and `#` so a key can neither
/// end early nor be read back as a header or comment
pub fn escape_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for c in key.chars() {
        if KEY_LITERALS.contains(&c) {
            out.push('\\');
            out.push(c);
        } else {
            push_escaped(&mut out, c);
        }
    }
    out
}

/// Reverse of [`escape`], unknown sequences are kept verbatim
pub fn unescape(value: &str) -> String {
    decode(value, &[])
}

/// Reverse of [`escape_key`]
pub fn unescape_key(key: &str) -> String {
    decode(key, &KEY_LITERALS)
}

fn decode(text: &str, literals: &[char]) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some(other) if literals.contains(&other) => out.push(other),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// Split `key=value` at the first `=` that is not escaped
fn split_entry(line: &str) -> Option<(&str, &str)> {
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            '=' => return Some((&line[..i], &line[i + 1..])),
            _ => {}
        }
    }
    None
}

//! Literal/CIDR matcher over an externally maintained text list.
//!
//! The list file holds one entry per line. A line containing `/` is a CIDR
//! prefix, anything else is a literal hostname or address compared
//! case-insensitively. Blank lines and `#` comments are ignored.
//!
//! Readers take an `Arc` snapshot of the entry sets; `load` builds a complete
//! replacement off to the side and publishes it with a single pointer swap, so
//! `is_match` never observes a half-loaded list.
//!
//! Entries merged in with `add_from_file` are kept apart from the backing
//! file's entries and folded into every later `load`, so a reload of the
//! main file never drops them.

use log::{debug, info, warn};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use crate::error::{PolicyError, PolicyResult};
use crate::flow::Flow;
use crate::prefix::IpPrefix;

/// One parsed list line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListEntry {
    Literal(String),
    Prefix(IpPrefix),
}

impl ListEntry {
    /// Parses one line. `Ok(None)` for blank lines and comments.
    pub fn parse_line(line: &str, line_no: usize) -> PolicyResult<Option<ListEntry>> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }
        if line.contains('/') {
            return line
                .parse::<IpPrefix>()
                .map(|p| Some(ListEntry::Prefix(p)))
                .map_err(|reason| PolicyError::InvalidEntry {
                    line: line_no,
                    reason,
                });
        }
        Ok(Some(ListEntry::Literal(line.to_lowercase())))
    }
}

#[derive(Debug, Default)]
struct ListEntries {
    items: HashSet<String>,
    prefixes: Vec<IpPrefix>,
}

impl ListEntries {
    fn insert(&mut self, entry: ListEntry) {
        match entry {
            ListEntry::Literal(item) => {
                self.items.insert(item);
            }
            ListEntry::Prefix(prefix) => {
                if !self.prefixes.contains(&prefix) {
                    self.prefixes.push(prefix);
                }
            }
        }
    }

    fn union(&mut self, other: &ListEntries) {
        self.items.extend(other.items.iter().cloned());
        for prefix in &other.prefixes {
            if !self.prefixes.contains(prefix) {
                self.prefixes.push(*prefix);
            }
        }
    }

    fn is_match(&self, flow: &Flow) -> bool {
        if let Some(ip) = &flow.remote.address {
            if self.items.contains(&ip.to_string().to_lowercase()) {
                return true;
            }
            if self.prefixes.iter().any(|p| p.contains(ip)) {
                return true;
            }
        }
        if let Some(host) = &flow.remote.hostname {
            if self.items.contains(&host.trim().to_lowercase()) {
                return true;
            }
        }
        false
    }
}

#[derive(Debug, Default)]
struct ListState {
    path: Option<PathBuf>,
    last_modified: Option<SystemTime>,
    /// Union of every file merged with `add_from_file`
    merged: ListEntries,
    entries: Arc<ListEntries>,
}

/// Counts from one load or merge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoadStats {
    pub items: usize,
    pub prefixes: usize,
    pub skipped: usize,
}

/// Block list or allow list backed by a text file
#[derive(Debug, Default)]
pub struct BlockOrAllowList {
    state: RwLock<ListState>,
}

impl BlockOrAllowList {
    /// Empty list with no backing file
    pub fn new() -> Self {
        Self::default()
    }

    /// List bound to `path`, loaded immediately. A missing or unreadable file
    /// yields an empty list that will load once the file appears.
    pub fn open(path: impl AsRef<Path>) -> Self {
        let list = Self::new();
        if let Err(e) = list.load(path.as_ref()) {
            warn!("Starting with empty list: {}", e);
            list.state.write().path = Some(path.as_ref().to_path_buf());
        }
        list
    }

    /// Reads the whole file and replaces the item and prefix sets.
    ///
    /// Malformed lines are skipped. If the file itself cannot be read the
    /// previous entries stay in place and an `Io` error is returned.
    pub fn load(&self, path: impl AsRef<Path>) -> PolicyResult<LoadStats> {
        let path = path.as_ref();
        let modified = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .map_err(|e| PolicyError::io(path, e))?;
        let mut entries = ListEntries::default();
        let skipped = read_entries(path, &mut entries)?;

        let stats = LoadStats {
            items: entries.items.len(),
            prefixes: entries.prefixes.len(),
            skipped,
        };

        {
            let mut state = self.state.write();
            entries.union(&state.merged);
            state.path = Some(path.to_path_buf());
            state.last_modified = Some(modified);
            state.entries = Arc::new(entries);
        }

        info!(
            "Loaded {} ({} items, {} prefixes, {} skipped)",
            path.display(),
            stats.items,
            stats.prefixes,
            stats.skipped
        );
        Ok(stats)
    }

    /// True iff the backing file is newer than the last successful load.
    /// Never true when the file cannot be inspected.
    pub fn should_reload(&self) -> bool {
        let state = self.state.read();
        let Some(path) = &state.path else {
            return false;
        };
        let modified = match std::fs::metadata(path).and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(e) => {
                debug!("Cannot stat {}: {}", path.display(), e);
                return false;
            }
        };
        match state.last_modified {
            Some(last) => modified > last,
            None => true,
        }
    }

    /// Re-reads the backing file when it changed. Returns whether a reload happened.
    pub fn reload_if_stale(&self) -> bool {
        if !self.should_reload() {
            return false;
        }
        let Some(path) = self.path() else {
            return false;
        };
        match self.load(&path) {
            Ok(_) => true,
            Err(e) => {
                warn!("Reload failed, keeping previous entries: {}", e);
                false
            }
        }
    }

    /// Union-merges the entries of a second file into the current sets
    pub fn add_from_file(&self, path: impl AsRef<Path>) -> PolicyResult<LoadStats> {
        let path = path.as_ref();
        let mut extra = ListEntries::default();
        let skipped = read_entries(path, &mut extra)?;

        let stats = LoadStats {
            items: extra.items.len(),
            prefixes: extra.prefixes.len(),
            skipped,
        };

        let mut state = self.state.write();
        let mut current = ListEntries {
            items: state.entries.items.clone(),
            prefixes: state.entries.prefixes.clone(),
        };
        current.union(&extra);
        state.merged.union(&extra);
        state.entries = Arc::new(current);

        debug!("Merged {} into list", path.display());
        Ok(stats)
    }

    /// True iff the flow's address or hostname equals a literal entry, or the
    /// address lies inside a stored prefix of the same family
    pub fn is_match(&self, flow: &Flow) -> bool {
        let entries = Arc::clone(&self.state.read().entries);
        entries.is_match(flow)
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.state.read().path.clone()
    }

    pub fn last_modified(&self) -> Option<SystemTime> {
        self.state.read().last_modified
    }

    pub fn len(&self) -> usize {
        let entries = Arc::clone(&self.state.read().entries);
        entries.items.len() + entries.prefixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Parses every readable line of `path` into `entries`; returns the number
/// of skipped lines.
fn read_entries(path: &Path, entries: &mut ListEntries) -> PolicyResult<usize> {
    let bytes = std::fs::read(path).map_err(|e| PolicyError::io(path, e))?;
    let mut skipped = 0;

    for (idx, raw) in bytes.split(|b| *b == b'\n').enumerate() {
        let line_no = idx + 1;
        let Ok(line) = std::str::from_utf8(raw) else {
            debug!("{}:{}: not valid UTF-8, skipped", path.display(), line_no);
            skipped += 1;
            continue;
        };
        match ListEntry::parse_line(line, line_no) {
            Ok(Some(entry)) => entries.insert(entry),
            Ok(None) => {}
            Err(e) => {
                debug!("{}: {}", path.display(), e);
                skipped += 1;
            }
        }
    }
    Ok(skipped)
}

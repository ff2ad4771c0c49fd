//! File-backed event store with ordered secondary indexes.
//!
//! Primary records live at `events/<id[0..2]>/<id[2..4]>/<id>.json`.
//! Secondary indexes are per-key text files of `created_at id` lines:
//! `index/by-author/<pubkey>.idx`, `index/by-kind/<kind>.idx`, and
//! `index/by-tag/<letter>/<sha1(value)>.idx` for single-letter tag names.
//! Every range read orders by `created_at` descending with ties broken by
//! id ascending, so callers can page without touching primaries.

use std::{
    cmp::Reverse,
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{anyhow, Result};
use parking_lot::RwLock;
use rand::{seq::SliceRandom, thread_rng};
use serde_json::to_writer;
use sha1::{Digest, Sha1};
use walkdir::WalkDir;

use crate::event::{verify_event, Event, Tag};

/// One secondary index entry: enough to order results without touching
/// the primary record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub created_at: u64,
    pub id: String,
}

/// Resume point for a range scan: the `(created_at, id)` of the last
/// entry already consumed.
pub type Cursor = (u64, String);

/// Persistent store for events and indexes rooted at `root`.
///
/// All writes (put, delete, reindex) serialize behind a store-wide write
/// lock so primary and secondary entries always change together; reads
/// share the lock.
#[derive(Clone)]
pub struct Store {
    root: PathBuf,
    lock: Arc<RwLock<()>>,
}

impl Store {
    /// Create a new store rooted at `root`.
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            lock: Arc::new(RwLock::new(())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Ensure the on-disk directory structure exists.
    pub fn init(&self) -> Result<()> {
        let dirs = [
            "events",
            "index/by-author",
            "index/by-kind",
            "index/by-tag",
            "satellites",
        ];
        for d in dirs {
            fs::create_dir_all(self.root.join(d))?;
        }
        Ok(())
    }

    /// Store an event and all its index entries. Idempotent: returns
    /// `false` without side effects when the id is already present.
    pub fn put(&self, ev: &Event) -> Result<bool> {
        let _g = self.lock.write();
        let path = self.event_path(&ev.id)?;
        if path.exists() {
            return Ok(false);
        }
        let parent_dir = path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        fs::create_dir_all(&parent_dir)?;
        let tmp = tempfile::NamedTempFile::new_in(&parent_dir)?;
        to_writer(&tmp, ev)?;
        tmp.persist(&path)?;
        self.index_event(ev)?;
        Ok(true)
    }

    /// Fetch an event by id. Unknown and malformed ids return `None`.
    pub fn get(&self, id: &str) -> Result<Option<Event>> {
        let _g = self.lock.read();
        self.read_event(id)
    }

    /// Index entries for an author, newest first.
    pub fn range_by_author(
        &self,
        pubkey: &str,
        since: Option<u64>,
        until: Option<u64>,
        cursor: Option<&Cursor>,
        limit_hint: Option<usize>,
    ) -> Result<Vec<IndexEntry>> {
        if !is_hex(pubkey) {
            return Ok(vec![]);
        }
        let _g = self.lock.read();
        read_entries(&self.author_index(pubkey), since, until, cursor, limit_hint)
    }

    /// Index entries for a kind, newest first.
    pub fn range_by_kind(
        &self,
        kind: u32,
        since: Option<u64>,
        until: Option<u64>,
        cursor: Option<&Cursor>,
        limit_hint: Option<usize>,
    ) -> Result<Vec<IndexEntry>> {
        let _g = self.lock.read();
        read_entries(
            &self.kind_index(kind),
            since,
            until,
            cursor,
            limit_hint,
        )
    }

    /// Index entries for a single-letter tag value, newest first.
    pub fn range_by_tag(
        &self,
        name: char,
        value: &str,
        since: Option<u64>,
        until: Option<u64>,
        cursor: Option<&Cursor>,
        limit_hint: Option<usize>,
    ) -> Result<Vec<IndexEntry>> {
        if !name.is_ascii_alphanumeric() {
            return Ok(vec![]);
        }
        let _g = self.lock.read();
        read_entries(
            &self.tag_index(name, value),
            since,
            until,
            cursor,
            limit_hint,
        )
    }

    /// Entries across every kind index, newest first. Backs time-only
    /// filters; the kind space is bounded by the allow-list so the scan
    /// touches a handful of files.
    pub fn all_kind_entries(
        &self,
        since: Option<u64>,
        until: Option<u64>,
    ) -> Result<Vec<IndexEntry>> {
        let _g = self.lock.read();
        let dir = self.root.join("index/by-kind");
        let mut entries = vec![];
        if !dir.exists() {
            return Ok(entries);
        }
        for item in fs::read_dir(dir)? {
            let item = item?;
            if item.file_type()?.is_file() {
                entries.extend(read_entries(&item.path(), since, until, None, None)?);
            }
        }
        sort_entries(&mut entries);
        Ok(entries)
    }

    /// Remove every event whose `expires_at` tag is at or before `now`.
    /// Primary and secondary entries go together.
    pub fn delete_expired(&self, now: u64) -> Result<usize> {
        let _g = self.lock.write();
        let mut expired = vec![];
        for entry in WalkDir::new(self.root.join("events")) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let data = fs::read_to_string(entry.path())?;
            let ev: Event = match serde_json::from_str(&data) {
                Ok(ev) => ev,
                Err(_) => continue,
            };
            let is_expired = ev
                .tag_value("expires_at")
                .and_then(|v| v.parse::<u64>().ok())
                .map_or(false, |t| t <= now);
            if is_expired {
                expired.push(ev);
            }
        }
        for ev in &expired {
            self.remove_event(ev)?;
        }
        Ok(expired.len())
    }

    /// Rebuild all secondary indexes from the `events/` tree.
    pub fn reindex(&self) -> Result<()> {
        let _g = self.lock.write();
        let index_dir = self.root.join("index");
        if index_dir.exists() {
            fs::remove_dir_all(&index_dir)?;
        }
        fs::create_dir_all(self.root.join("index/by-author"))?;
        fs::create_dir_all(self.root.join("index/by-kind"))?;
        fs::create_dir_all(self.root.join("index/by-tag"))?;
        for entry in WalkDir::new(self.root.join("events")) {
            let entry = entry?;
            if entry.file_type().is_file() {
                let data = fs::read_to_string(entry.path())?;
                let ev: Event = serde_json::from_str(&data)?;
                self.index_event(&ev)?;
            }
        }
        Ok(())
    }

    /// Verify signatures for a random sample of stored events.
    pub fn verify_sample(&self, sample: usize) -> Result<usize> {
        let _g = self.lock.read();
        let mut paths = vec![];
        for entry in WalkDir::new(self.root.join("events")) {
            let entry = entry?;
            if entry.file_type().is_file() {
                paths.push(entry.into_path());
            }
        }
        let mut rng = thread_rng();
        paths.shuffle(&mut rng);
        let take = sample.min(paths.len());
        for p in paths.iter().take(take) {
            let data = fs::read_to_string(p)?;
            let ev: Event = serde_json::from_str(&data)?;
            verify_event(&ev)?;
        }
        Ok(take)
    }

    fn read_event(&self, id: &str) -> Result<Option<Event>> {
        let Ok(path) = self.event_path(id) else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&data)?))
    }

    /// Append index entries for an event to every applicable secondary.
    fn index_event(&self, ev: &Event) -> Result<()> {
        append_entry(&self.author_index(&ev.pubkey), ev)?;
        append_entry(&self.kind_index(ev.kind), ev)?;
        for (name, value) in single_letter_tags(ev) {
            append_entry(&self.tag_index(name, value), ev)?;
        }
        Ok(())
    }

    /// Delete an event's primary record and strip it from every index.
    fn remove_event(&self, ev: &Event) -> Result<()> {
        fs::remove_file(self.event_path(&ev.id)?)?;
        strip_entry(&self.author_index(&ev.pubkey), &ev.id)?;
        strip_entry(&self.kind_index(ev.kind), &ev.id)?;
        for (name, value) in single_letter_tags(ev) {
            strip_entry(&self.tag_index(name, value), &ev.id)?;
        }
        Ok(())
    }

    /// Compute the canonical path for an event id.
    fn event_path(&self, id: &str) -> Result<PathBuf> {
        if id.len() < 4 || !is_hex(id) {
            return Err(anyhow!("malformed event id: {id:?}"));
        }
        Ok(self
            .root
            .join("events")
            .join(&id[0..2])
            .join(&id[2..4])
            .join(format!("{id}.json")))
    }

    fn author_index(&self, pubkey: &str) -> PathBuf {
        self.root
            .join("index/by-author")
            .join(format!("{pubkey}.idx"))
    }

    fn kind_index(&self, kind: u32) -> PathBuf {
        self.root.join("index/by-kind").join(format!("{kind}.idx"))
    }

    /// Tag index files are keyed by the SHA-1 of the value so arbitrary
    /// tag values map to safe filenames.
    fn tag_index(&self, name: char, value: &str) -> PathBuf {
        let digest = hex::encode(Sha1::digest(value.as_bytes()));
        self.root
            .join("index/by-tag")
            .join(name.to_string())
            .join(format!("{digest}.idx"))
    }
}

/// Single-letter tag `(name, value)` pairs of an event; only these are
/// indexed for query-side matching.
fn single_letter_tags(ev: &Event) -> impl Iterator<Item = (char, &str)> {
    ev.tags.iter().filter_map(|Tag(fields)| {
        let mut chars = fields.first()?.chars();
        let name = chars.next()?;
        if chars.next().is_some() || !name.is_ascii_alphanumeric() {
            return None;
        }
        Some((name, fields.get(1)?.as_str()))
    })
}

fn is_hex(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Descending by `created_at`, ties broken by id ascending.
fn sort_entries(entries: &mut [IndexEntry]) {
    entries.sort_by(|a, b| {
        (Reverse(a.created_at), &a.id).cmp(&(Reverse(b.created_at), &b.id))
    });
}

fn append_entry(path: &Path, ev: &Event) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut f = fs::OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(f, "{} {}", ev.created_at, ev.id)?;
    Ok(())
}

/// Rewrite an index file without the given id, removing the file when it
/// becomes empty.
fn strip_entry(path: &Path, id: &str) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    let data = fs::read_to_string(path)?;
    let kept: Vec<&str> = data
        .lines()
        .filter(|line| line.split_whitespace().nth(1) != Some(id))
        .collect();
    if kept.is_empty() {
        fs::remove_file(path)?;
    } else {
        fs::write(path, kept.join("\n") + "\n")?;
    }
    Ok(())
}

/// Read an index file into ordered, bounded, cursor-aware entries.
fn read_entries(
    path: &Path,
    since: Option<u64>,
    until: Option<u64>,
    cursor: Option<&Cursor>,
    limit_hint: Option<usize>,
) -> Result<Vec<IndexEntry>> {
    if !path.exists() {
        return Ok(vec![]);
    }
    let data = fs::read_to_string(path)?;
    let mut entries: Vec<IndexEntry> = data
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let created_at = parts.next()?.parse().ok()?;
            let id = parts.next()?.to_string();
            Some(IndexEntry { created_at, id })
        })
        .filter(|e| {
            since.map_or(true, |s| e.created_at >= s) && until.map_or(true, |u| e.created_at <= u)
        })
        .filter(|e| match cursor {
            // Strictly after the cursor in descending order.
            Some((ts, id)) => e.created_at < *ts || (e.created_at == *ts && e.id > *id),
            None => true,
        })
        .collect();
    sort_entries(&mut entries);
    if let Some(limit) = limit_hint {
        entries.truncate(limit);
    }
    Ok(entries)
}

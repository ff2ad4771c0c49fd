//! Filter parsing and the index-backed query planner.

use std::collections::HashSet;

use anyhow::Result;
use serde_json::Value;

use crate::event::{Event, Tag};
use crate::storage::{IndexEntry, Store};

/// Conjunction of optional constraints over id, author, kind, time range,
/// and single-letter tag values. A filter matches an event iff every
/// populated field matches; a filter with no populated fields matches
/// nothing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub ids: Option<Vec<String>>,
    pub authors: Option<Vec<String>>,
    pub kinds: Option<Vec<u32>>,
    pub since: Option<u64>,
    pub until: Option<u64>,
    pub limit: Option<usize>,
    /// `#x` keys: tag letter to accepted values.
    pub tags: Vec<(char, Vec<String>)>,
}

impl Filter {
    /// Build a `Filter` from a wire filter JSON object. Unknown keys are
    /// ignored; only single-letter `#x` tag keys are interpreted.
    pub fn from_value(val: &Value) -> Self {
        let strings = |key: &str| {
            val.get(key).and_then(|v| v.as_array()).map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect()
            })
        };
        let ids = strings("ids");
        let authors = strings("authors");
        let kinds = val.get("kinds").and_then(|v| v.as_array()).map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_u64().map(|u| u as u32))
                .collect()
        });
        let since = val.get("since").and_then(|v| v.as_u64());
        let until = val.get("until").and_then(|v| v.as_u64());
        let limit = val
            .get("limit")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize);
        let mut tags = vec![];
        if let Some(obj) = val.as_object() {
            for (key, v) in obj {
                let Some(rest) = key.strip_prefix('#') else {
                    continue;
                };
                let mut chars = rest.chars();
                let (Some(letter), None) = (chars.next(), chars.next()) else {
                    continue;
                };
                if let Some(arr) = v.as_array() {
                    let values = arr
                        .iter()
                        .filter_map(|v| v.as_str().map(|s| s.to_string()))
                        .collect();
                    tags.push((letter, values));
                }
            }
        }
        Filter {
            ids,
            authors,
            kinds,
            since,
            until,
            limit,
            tags,
        }
    }

    /// True when no field is populated. Deliberately matches nothing.
    pub fn is_empty(&self) -> bool {
        self.ids.is_none()
            && self.authors.is_none()
            && self.kinds.is_none()
            && self.since.is_none()
            && self.until.is_none()
            && self.limit.is_none()
            && self.tags.is_empty()
    }

    /// Whether an event satisfies every populated constraint.
    pub fn matches(&self, ev: &Event) -> bool {
        if self.is_empty() {
            return false;
        }
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|id| id == &ev.id) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.iter().any(|a| a == &ev.pubkey) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&ev.kind) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if ev.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if ev.created_at > until {
                return false;
            }
        }
        for (letter, values) in &self.tags {
            let hit = ev.tags.iter().any(|Tag(fields)| {
                fields.len() >= 2
                    && fields[0].len() == 1
                    && fields[0].starts_with(*letter)
                    && values.contains(&fields[1])
            });
            if !hit {
                return false;
            }
        }
        true
    }
}

/// Run a filter set against the store: per-filter index scans unioned,
/// deduplicated by id, ordered `created_at` descending with ids breaking
/// ties, capped at `max_limit`.
pub fn execute(
    store: &Store,
    filters: &[Filter],
    default_limit: usize,
    max_limit: usize,
) -> Result<Vec<Event>> {
    let mut merged: Vec<Event> = vec![];
    let mut seen = HashSet::new();
    for filter in filters {
        for ev in run_filter(store, filter, default_limit, max_limit)? {
            if seen.insert(ev.id.clone()) {
                merged.push(ev);
            }
        }
    }
    merged.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
    merged.truncate(max_limit);
    Ok(merged)
}

/// Evaluate one filter: pick the most selective index, winnow the rest by
/// post-filter, stop at the filter's limit.
fn run_filter(
    store: &Store,
    filter: &Filter,
    default_limit: usize,
    max_limit: usize,
) -> Result<Vec<Event>> {
    if filter.is_empty() {
        return Ok(vec![]);
    }
    let limit = filter.limit.unwrap_or(default_limit).min(max_limit);
    if limit == 0 {
        return Ok(vec![]);
    }
    // Point lookups beat any scan; unknown ids just yield fewer results.
    if let Some(ids) = &filter.ids {
        let mut out: Vec<Event> = vec![];
        for id in ids {
            if let Some(ev) = store.get(id)? {
                if filter.matches(&ev) {
                    out.push(ev);
                }
            }
        }
        out.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        out.truncate(limit);
        return Ok(out);
    }
    let mut out = vec![];
    for entry in candidates(store, filter)? {
        if let Some(ev) = store.get(&entry.id)? {
            if filter.matches(&ev) {
                out.push(ev);
                if out.len() == limit {
                    break;
                }
            }
        }
    }
    Ok(out)
}

/// Candidate index entries for a filter, already time-bounded and in
/// output order. Preference: tag index, then author, then kind, then the
/// bounded all-kinds sweep for time-only filters.
fn candidates(store: &Store, filter: &Filter) -> Result<Vec<IndexEntry>> {
    if let Some((letter, values)) = filter.tags.first() {
        let mut entries = vec![];
        for value in values {
            entries.extend(store.range_by_tag(*letter, value, filter.since, filter.until, None, None)?);
        }
        return Ok(merge_entries(entries));
    }
    if let Some(authors) = &filter.authors {
        let mut entries = vec![];
        for author in authors {
            entries.extend(store.range_by_author(author, filter.since, filter.until, None, None)?);
        }
        return Ok(merge_entries(entries));
    }
    if let Some(kinds) = &filter.kinds {
        let mut entries = vec![];
        for kind in kinds {
            entries.extend(store.range_by_kind(*kind, filter.since, filter.until, None, None)?);
        }
        return Ok(merge_entries(entries));
    }
    store.all_kind_entries(filter.since, filter.until)
}

/// Re-order a union of per-key scans and drop duplicate ids.
fn merge_entries(mut entries: Vec<IndexEntry>) -> Vec<IndexEntry> {
    entries.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
    entries.dedup_by(|a, b| a.id == b.id);
    entries
}

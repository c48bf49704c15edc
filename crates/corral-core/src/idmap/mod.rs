//! UID/GID mapping sets.
//!
//! An [`IdmapSet`] is an ordered list of [`IdmapEntry`] blocks, each mapping a
//! contiguous range of namespace ids onto host ids for uids, gids or both.
//! Sets are persisted as JSON in the container's volatile configuration, so
//! the serialized field names are part of the on-disk format.

pub mod host;
pub mod raw;
pub mod shift;

use std::fmt;

use serde::{Deserialize, Serialize};

use corral_common::error::{CorralError, Result};

/// One contiguous mapping block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdmapEntry {
    /// Block applies to uids.
    #[serde(rename = "Isuid")]
    pub is_uid: bool,
    /// Block applies to gids.
    #[serde(rename = "Isgid")]
    pub is_gid: bool,
    /// First host id of the block.
    #[serde(rename = "Hostid")]
    pub host_id: i64,
    /// First namespace id of the block.
    #[serde(rename = "Nsid")]
    pub ns_id: i64,
    /// Number of ids in the block.
    #[serde(rename = "Maprange")]
    pub range: i64,
}

/// Highest id a `uid_t`/`gid_t` can hold.
pub const MAX_ID: i64 = 0xFFFF_FFFF;

const fn between(x: i64, low: i64, high: i64) -> bool {
    x >= low && x <= high
}

const fn last_id(first: i64, range: i64) -> i64 {
    first.saturating_add(range).saturating_sub(1)
}

/// Checks that `range` ids starting at `first` fit the id space.
///
/// # Errors
///
/// Returns [`CorralError::InvalidIdmap`] when the block is empty, negative
/// or reaches past [`MAX_ID`].
pub fn check_block(first: i64, range: i64) -> Result<()> {
    let fits = first >= 0
        && range > 0
        && first
            .checked_add(range - 1)
            .is_some_and(|last| last <= MAX_ID);
    if fits {
        Ok(())
    } else {
        Err(CorralError::InvalidIdmap {
            message: format!("id range of {range} starting at {first} does not fit the id space"),
        })
    }
}

impl IdmapEntry {
    /// A block mapping both uids and gids.
    #[must_use]
    pub const fn both(host_id: i64, ns_id: i64, range: i64) -> Self {
        Self {
            is_uid: true,
            is_gid: true,
            host_id,
            ns_id,
            range,
        }
    }

    /// A uid-only block.
    #[must_use]
    pub const fn uid(host_id: i64, ns_id: i64, range: i64) -> Self {
        Self {
            is_uid: true,
            is_gid: false,
            host_id,
            ns_id,
            range,
        }
    }

    /// A gid-only block.
    #[must_use]
    pub const fn gid(host_id: i64, ns_id: i64, range: i64) -> Self {
        Self {
            is_uid: false,
            is_gid: true,
            host_id,
            ns_id,
            range,
        }
    }

    /// Last host id covered by the block.
    #[must_use]
    pub const fn host_end(&self) -> i64 {
        last_id(self.host_id, self.range)
    }

    const fn ns_end(&self) -> i64 {
        last_id(self.ns_id, self.range)
    }

    const fn same_kind(&self, other: &Self) -> bool {
        (self.is_uid && other.is_uid) || (self.is_gid && other.is_gid)
    }

    /// Whether the host id ranges of two blocks of the same kind overlap.
    #[must_use]
    pub const fn host_ids_intersect(&self, other: &Self) -> bool {
        self.same_kind(other)
            && (between(self.host_id, other.host_id, other.host_end())
                || between(other.host_id, self.host_id, self.host_end()))
    }

    /// Whether two blocks of the same kind overlap on either side of the mapping.
    #[must_use]
    pub const fn intersects(&self, other: &Self) -> bool {
        self.host_ids_intersect(other)
            || (self.same_kind(other)
                && (between(self.ns_id, other.ns_id, other.ns_end())
                    || between(other.ns_id, self.ns_id, self.ns_end())))
    }

    fn ns_to_host(&self, id: i64) -> Option<i64> {
        between(id, self.ns_id, self.ns_end()).then(|| id - self.ns_id + self.host_id)
    }

    fn host_to_ns(&self, id: i64) -> Option<i64> {
        between(id, self.host_id, self.host_end()).then(|| id - self.host_id + self.ns_id)
    }
}

impl fmt::Display for IdmapEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match (self.is_uid, self.is_gid) {
            (true, true) => "b",
            (true, false) => "u",
            (false, true) => "g",
            (false, false) => "-",
        };
        write!(f, "{kind}:{}:{}:{}", self.ns_id, self.host_id, self.range)
    }
}

/// An ordered list of mapping blocks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdmapSet {
    entries: Vec<IdmapEntry>,
}

impl IdmapSet {
    /// Creates a set from explicit entries, in order.
    #[must_use]
    pub const fn new(entries: Vec<IdmapEntry>) -> Self {
        Self { entries }
    }

    /// Builds the usual isolated map: uid and gid blocks of `range` ids at `host_base`,
    /// starting at namespace id 0.
    #[must_use]
    pub fn contiguous(host_base: i64, range: i64) -> Self {
        Self::new(vec![
            IdmapEntry::uid(host_base, 0, range),
            IdmapEntry::gid(host_base, 0, range),
        ])
    }

    /// Entries in order.
    #[must_use]
    pub fn entries(&self) -> &[IdmapEntry] {
        &self.entries
    }

    /// Whether the set has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Merges `entry` into the set.
    ///
    /// Existing blocks that overlap `entry` on the namespace side are split
    /// around it, so `entry` takes precedence for the ids it covers.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::HostIdIsSubId`] when the host ids of `entry`
    /// fall inside an existing block, i.e. inside the container's own range,
    /// and [`CorralError::InvalidIdmap`] when either side of `entry` leaves
    /// the id space.
    pub fn add_safe(&mut self, entry: IdmapEntry) -> Result<()> {
        check_block(entry.host_id, entry.range)?;
        check_block(entry.ns_id, entry.range)?;
        let mut result = Vec::with_capacity(self.entries.len() + 2);
        let mut added = false;
        for existing in &self.entries {
            if !existing.intersects(&entry) {
                result.push(*existing);
                continue;
            }
            if existing.host_ids_intersect(&entry) {
                return Err(CorralError::HostIdIsSubId);
            }

            let lower = IdmapEntry {
                range: entry.ns_id - existing.ns_id,
                ..*existing
            };
            let upper = IdmapEntry {
                host_id: existing.host_id + lower.range + entry.range,
                ns_id: entry.ns_id + entry.range,
                range: existing.range - entry.range - lower.range,
                ..*existing
            };
            if lower.range > 0 {
                result.push(lower);
            }
            if !added {
                result.push(entry);
                added = true;
            }
            if upper.range > 0 {
                result.push(upper);
            }
        }
        if !added {
            result.push(entry);
        }
        self.entries = result;
        Ok(())
    }

    /// Whether any host id range of `self` overlaps one of `other`.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.entries
            .iter()
            .any(|a| other.entries.iter().any(|b| a.host_ids_intersect(b)))
    }

    fn normalized(&self) -> Vec<IdmapEntry> {
        let mut out = Vec::with_capacity(self.entries.len() * 2);
        for e in &self.entries {
            if e.is_uid {
                out.push(IdmapEntry { is_gid: false, ..*e });
            }
            if e.is_gid {
                out.push(IdmapEntry { is_uid: false, ..*e });
            }
        }
        out.sort();
        out
    }

    /// Order-insensitive equality, treating a uid+gid block like two separate blocks.
    #[must_use]
    pub fn equivalent(&self, other: &Self) -> bool {
        self.normalized() == other.normalized()
    }

    /// Maps a namespace uid/gid pair to host ids. `None` when either id is unmapped.
    #[must_use]
    pub fn ns_to_host(&self, uid: i64, gid: i64) -> Option<(i64, i64)> {
        let u = self
            .entries
            .iter()
            .filter(|e| e.is_uid)
            .find_map(|e| e.ns_to_host(uid))?;
        let g = self
            .entries
            .iter()
            .filter(|e| e.is_gid)
            .find_map(|e| e.ns_to_host(gid))?;
        Some((u, g))
    }

    /// Maps a host uid/gid pair to namespace ids. `None` when either id is unmapped.
    #[must_use]
    pub fn host_to_ns(&self, uid: i64, gid: i64) -> Option<(i64, i64)> {
        let u = self
            .entries
            .iter()
            .filter(|e| e.is_uid)
            .find_map(|e| e.host_to_ns(uid))?;
        let g = self
            .entries
            .iter()
            .filter(|e| e.is_gid)
            .find_map(|e| e.host_to_ns(gid))?;
        Some((u, g))
    }

    /// Serializes the entries as the JSON stored in volatile keys.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.entries)?)
    }

    /// Parses a volatile JSON value. Empty values and `[]` mean "no map".
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a JSON list of entries.
    pub fn from_json(value: &str) -> Result<Option<Self>> {
        let value = value.trim();
        if value.is_empty() {
            return Ok(None);
        }
        let entries: Vec<IdmapEntry> = serde_json::from_str(value)?;
        if entries.is_empty() {
            return Ok(None);
        }
        Ok(Some(Self::new(entries)))
    }

    /// Runtime library configuration lines for this map (`u|g nsid hostid range`).
    #[must_use]
    pub fn to_lxc_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for e in &self.entries {
            if e.is_uid {
                lines.push(format!("u {} {} {}", e.ns_id, e.host_id, e.range));
            }
            if e.is_gid {
                lines.push(format!("g {} {} {}", e.ns_id, e.host_id, e.range));
            }
        }
        lines
    }
}

/// JSON for an optional map, `[]` when absent.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn optional_to_json(set: Option<&IdmapSet>) -> Result<String> {
    set.map_or_else(|| Ok("[]".to_string()), IdmapSet::to_json)
}

/// Equality of optional maps, where `None` only equals `None`.
#[must_use]
pub fn optional_equivalent(a: Option<&IdmapSet>, b: Option<&IdmapSet>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a.equivalent(b),
        _ => false,
    }
}

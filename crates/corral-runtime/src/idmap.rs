//! Host-wide idmap allocation.
//!
//! Unprivileged containers share the host's default range unless they ask
//! for an isolated one. Isolated ranges are carved first-fit out of the
//! host range, skipping the first 65536 ids and every range already handed
//! to another isolated container. The scan and the persisting of its result
//! must happen under the allocator lock, which [`Allocation`] holds until it
//! is dropped. With a lock file the lock also covers other `corralctl`
//! processes.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use corral_common::constants::{DEFAULT_ISOLATED_IDMAP_SIZE, keys};
use corral_common::error::{CorralError, Result};
use corral_common::types::{ConfigMap, config_is_true};
use corral_core::idmap::raw::parse_raw_idmap;
use corral_core::filesystem::lock::FileLock;
use corral_core::idmap::{IdmapEntry, IdmapSet, check_block};

use crate::expand::expand_config;
use crate::store::ConfigStore;

/// A computed idmap, holding the allocator lock until dropped.
#[derive(Debug)]
pub struct Allocation<'a> {
    /// The map, `None` for privileged containers.
    pub set: Option<IdmapSet>,
    /// First host id of an isolated range, `0` otherwise.
    pub base: i64,
    _file: Option<FileLock>,
    _guard: MutexGuard<'a, ()>,
}

impl Allocation<'_> {
    /// Volatile keys recording this allocation.
    ///
    /// # Errors
    ///
    /// Returns an error if the map cannot be serialized.
    pub fn volatile_changes(&self) -> Result<Vec<(String, Option<String>)>> {
        let next = corral_core::idmap::optional_to_json(self.set.as_ref())?;
        Ok(vec![
            (keys::VOLATILE_IDMAP_NEXT.to_string(), Some(next)),
            (keys::VOLATILE_IDMAP_BASE.to_string(), Some(self.base.to_string())),
        ])
    }
}

/// Allocates idmaps out of the host's subordinate id range.
#[derive(Debug)]
pub struct IdmapAllocator {
    host: IdmapSet,
    lock: Mutex<()>,
    lock_file: Option<PathBuf>,
}

impl IdmapAllocator {
    /// Creates an allocator over the host's default map.
    #[must_use]
    pub fn new(host: IdmapSet) -> Self {
        Self {
            host,
            lock: Mutex::new(()),
            lock_file: None,
        }
    }

    /// Also holds an exclusive `flock` on `path` for every allocation.
    #[must_use]
    pub fn with_lock_file(mut self, path: &Path) -> Self {
        self.lock_file = Some(path.to_path_buf());
        self
    }

    /// The host's default map.
    #[must_use]
    pub const fn host(&self) -> &IdmapSet {
        &self.host
    }

    fn host_range(&self) -> Result<(i64, i64)> {
        self.host
            .entries()
            .first()
            .map(|e| (e.host_id, e.range))
            .ok_or_else(|| CorralError::InvalidIdmap {
                message: "the host has no default idmap".into(),
            })
    }

    /// Size of the range a container with this configuration needs.
    ///
    /// # Errors
    ///
    /// Returns an error for a malformed size or an unusable host map.
    pub fn idmap_size(&self, isolated: bool, size: &str) -> Result<i64> {
        if isolated {
            if size.is_empty() || size == "auto" {
                return Ok(DEFAULT_ISOLATED_IDMAP_SIZE);
            }
            return size.parse().map_err(|_| CorralError::InvalidIdmap {
                message: format!("invalid {}: {size:?}", keys::SECURITY_IDMAP_SIZE),
            });
        }
        if self.host.entries().len() != 2 {
            return Err(CorralError::InvalidIdmap {
                message: "bad initial idmap".into(),
            });
        }
        Ok(self.host.entries()[0].range)
    }

    /// Computes the idmap for `container` from its expanded configuration.
    ///
    /// Privileged containers get no map. Other isolated, unprivileged
    /// containers in `store` are scanned to keep isolated ranges disjoint;
    /// `container` itself is skipped so recomputing is stable.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::IdmapExhausted`] when no gap is large enough,
    /// [`CorralError::HostIdIsSubId`] when a raw entry collides with the
    /// map, or a validation error for malformed keys.
    pub fn allocate(
        &self,
        store: &dyn ConfigStore,
        container: &str,
        config: &ConfigMap,
    ) -> Result<Allocation<'_>> {
        let guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let file = self.lock_file.as_deref().map(FileLock::exclusive).transpose()?;
        if config_is_true(config, keys::SECURITY_PRIVILEGED) {
            return Ok(Allocation {
                set: None,
                base: 0,
                _file: file,
                _guard: guard,
            });
        }

        let value = |key: &str| config.get(key).map_or("", String::as_str);
        let isolated = config_is_true(config, keys::SECURITY_IDMAP_ISOLATED);
        let raw = parse_raw_idmap(value(keys::RAW_IDMAP))?;

        let (set, base) = if isolated {
            let size = self.idmap_size(true, value(keys::SECURITY_IDMAP_SIZE))?;
            let base = match value(keys::SECURITY_IDMAP_BASE) {
                "" => self.first_fit(store, container, size)?,
                base => base.parse().map_err(|_| CorralError::InvalidIdmap {
                    message: format!("invalid {}: {base:?}", keys::SECURITY_IDMAP_BASE),
                })?,
            };
            check_block(base, size)?;
            (with_raw(IdmapSet::contiguous(base, size), &raw)?, base)
        } else {
            (with_raw(self.host.clone(), &raw)?, 0)
        };
        tracing::debug!(container, isolated, base, "idmap computed");
        Ok(Allocation {
            set: Some(set),
            base,
            _file: file,
            _guard: guard,
        })
    }

    fn first_fit(&self, store: &dyn ConfigStore, container: &str, size: i64) -> Result<i64> {
        let (host_base, host_range) = self.host_range()?;
        let mut blocks = Vec::new();
        for record in store.containers()? {
            if record.name == container {
                continue;
            }
            let profiles = store.resolve_profiles(&record.profiles)?;
            let config = expand_config(&record.config, &profiles);
            if config_is_true(&config, keys::SECURITY_PRIVILEGED)
                || !config_is_true(&config, keys::SECURITY_IDMAP_ISOLATED)
            {
                continue;
            }
            let base = config
                .get(keys::VOLATILE_IDMAP_BASE)
                .filter(|b| !b.is_empty())
                .map_or(Ok(0), |b| b.parse::<i64>())
                .map_err(|_| CorralError::InvalidIdmap {
                    message: format!("invalid {} on {}", keys::VOLATILE_IDMAP_BASE, record.name),
                })?;
            let size = self.idmap_size(
                true,
                config.get(keys::SECURITY_IDMAP_SIZE).map_or("", String::as_str),
            )?;
            blocks.push((base, size));
        }
        first_fit(&mut blocks, host_base, host_range, size)
    }
}

fn with_raw(mut set: IdmapSet, raw: &[IdmapEntry]) -> Result<IdmapSet> {
    for entry in raw {
        set.add_safe(*entry)?;
    }
    Ok(set)
}

/// Finds the first gap of `size` ids in `[host_base + 65536, host_base + host_range)`
/// not covered by `blocks` (`(base, size)` pairs).
fn first_fit(blocks: &mut [(i64, i64)], host_base: i64, host_range: i64, size: i64) -> Result<i64> {
    blocks.sort_unstable();
    let limit = host_base.saturating_add(host_range);
    let mut cursor = host_base.saturating_add(DEFAULT_ISOLATED_IDMAP_SIZE);
    for &(start, len) in blocks.iter() {
        let end = start.saturating_add(len);
        if end <= cursor {
            continue;
        }
        if cursor.saturating_add(size) <= start {
            return Ok(cursor);
        }
        cursor = cursor.max(end);
    }
    if cursor.saturating_add(size) <= limit {
        Ok(cursor)
    } else {
        Err(CorralError::IdmapExhausted)
    }
}

//! Discovery of the host's default id range from `/etc/subuid` and `/etc/subgid`.

use std::path::Path;

use corral_common::constants::DEFAULT_HOST_IDMAP;
use corral_common::error::{CorralError, Result};

use super::{IdmapEntry, IdmapSet};

fn first_range(path: &Path, user: &str) -> Result<Option<(i64, i64)>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path).map_err(|e| CorralError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    for line in content.lines() {
        let mut fields = line.trim().split(':');
        if fields.next() != Some(user) {
            continue;
        }
        let start = fields.next().and_then(|s| s.parse::<i64>().ok());
        let size = fields.next().and_then(|s| s.parse::<i64>().ok());
        if let (Some(start), Some(size)) = (start, size) {
            return Ok(Some((start, size)));
        }
    }
    Ok(None)
}

/// Builds the host's default map: one uid and one gid block owned by `user`.
///
/// Falls back to `1000000:1000000000` for any file without an entry.
///
/// # Errors
///
/// Returns an error if an existing file cannot be read.
pub fn host_idmap(subuid: &Path, subgid: &Path, user: &str) -> Result<IdmapSet> {
    let (uid_base, uid_range) = first_range(subuid, user)?.unwrap_or(DEFAULT_HOST_IDMAP);
    let (gid_base, gid_range) = first_range(subgid, user)?.unwrap_or(DEFAULT_HOST_IDMAP);
    tracing::debug!(uid_base, uid_range, gid_base, gid_range, "host idmap");
    Ok(IdmapSet::new(vec![
        IdmapEntry::uid(uid_base, 0, uid_range),
        IdmapEntry::gid(gid_base, 0, gid_range),
    ]))
}

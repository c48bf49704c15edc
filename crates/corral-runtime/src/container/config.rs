//! Runtime library configuration generated at start.

use std::path::Path;

use corral_common::config::DriverConfig;
use corral_common::constants::keys;
use corral_common::error::Result;
use corral_common::types::{ConfigMap, is_true};
use corral_core::cgroup::CgroupItem;
use corral_core::cgroup::cpu::cpu_items;
use corral_core::cgroup::io::io_weight_item;
use corral_core::cgroup::memory::{host_memory_total, memory_items, parse_memory_limit};
use corral_core::cgroup::pids::pids_item;
use corral_core::idmap::IdmapSet;

use crate::validate::check_raw_lxc;

const MEMINFO: &str = "/proc/meminfo";

fn value<'a>(config: &'a ConfigMap, key: &str) -> &'a str {
    config.get(key).map_or("", String::as_str)
}

/// Memory items for the current `limits.memory*` keys. An empty limit
/// lifts it.
///
/// # Errors
///
/// Returns a validation error for malformed limits, or an error when a
/// percentage needs the host total and it cannot be read.
pub fn memory_limit_items(config: &ConfigMap, driver: &DriverConfig) -> Result<Vec<CgroupItem>> {
    let memory = value(config, keys::LIMITS_MEMORY);
    let limit = if memory.is_empty() {
        None
    } else {
        let total = if memory.ends_with('%') {
            host_memory_total(Path::new(MEMINFO))?
        } else {
            0
        };
        Some(parse_memory_limit(memory, total)?)
    };
    let soft = value(config, keys::LIMITS_MEMORY_ENFORCE) == "soft";
    let swap = match value(config, keys::LIMITS_MEMORY_SWAP) {
        "" => true,
        other => is_true(other),
    };
    Ok(memory_items(limit, soft, swap, driver.cgroup_swap))
}

/// Cgroup items for every configured limit.
///
/// # Errors
///
/// Returns a validation error for malformed limits.
pub fn limit_items(config: &ConfigMap, driver: &DriverConfig) -> Result<Vec<CgroupItem>> {
    let mut items = Vec::new();
    if !value(config, keys::LIMITS_MEMORY).is_empty() {
        items.extend(memory_limit_items(config, driver)?);
    }
    let allowance = value(config, keys::LIMITS_CPU_ALLOWANCE);
    let priority = value(config, keys::LIMITS_CPU_PRIORITY);
    if !allowance.is_empty() || !priority.is_empty() {
        items.extend(cpu_items(allowance, priority)?);
    }
    let disk_priority = value(config, keys::LIMITS_DISK_PRIORITY);
    if !disk_priority.is_empty() {
        items.push(io_weight_item(disk_priority)?);
    }
    let processes = value(config, keys::LIMITS_PROCESSES);
    if !processes.is_empty() && driver.cgroup_pids {
        items.push(pids_item(processes)?);
    }
    Ok(items)
}

/// Base configuration of a starting container: identity, root filesystem,
/// idmap and cgroup limits.
///
/// # Errors
///
/// Returns a validation error for malformed limits.
pub fn runtime_items(
    name: &str,
    rootfs: &Path,
    config: &ConfigMap,
    idmap: Option<&IdmapSet>,
    driver: &DriverConfig,
) -> Result<Vec<(String, String)>> {
    let mut items: Vec<(String, String)> = [
        ("lxc.uts.name", name.to_string()),
        ("lxc.rootfs.path", format!("dir:{}", rootfs.display())),
        ("lxc.autodev", "1".into()),
        ("lxc.pty.max", "1024".into()),
        ("lxc.tty.max", "0".into()),
        ("lxc.signal.halt", "SIGPWR".into()),
        ("lxc.mount.auto", "proc:rw sys:rw cgroup:mixed".into()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect();

    if let Some(set) = idmap {
        items.extend(set.to_lxc_lines().into_iter().map(|line| ("lxc.idmap".to_string(), line)));
    }
    items.extend(
        limit_items(config, driver)?
            .into_iter()
            .map(|item| (format!("lxc.cgroup2.{}", item.key), item.value)),
    );
    Ok(items)
}

/// Items of `raw.lxc`, applied after everything else.
///
/// # Errors
///
/// Returns a validation error for malformed lines or reserved keys.
pub fn raw_items(config: &ConfigMap) -> Result<Vec<(String, String)>> {
    match value(config, keys::RAW_LXC) {
        "" => Ok(Vec::new()),
        raw => check_raw_lxc(raw),
    }
}

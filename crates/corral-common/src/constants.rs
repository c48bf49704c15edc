//! System-wide constants, default paths and configuration key names.

/// Default base directory for container state and data.
pub const DEFAULT_DATA_DIR: &str = "/var/lib/corral";
/// Default base directory for per-container logs.
pub const DEFAULT_LOG_DIR: &str = "/var/log/corral";
/// Default location of the driver configuration file.
pub const DEFAULT_CONFIG_FILE: &str = "/etc/corral/config.json";
/// Name of the store document inside the data directory.
pub const STORE_FILE_NAME: &str = "store.json";

/// Environment variable overriding the data directory.
pub const ENV_DATA_DIR: &str = "CORRAL_DATA_DIR";
/// Environment variable overriding the log directory.
pub const ENV_LOG_DIR: &str = "CORRAL_LOG_DIR";

/// Watchdog window of a lifecycle operation.
pub const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 30_000;
/// Upper bound on a runtime state probe.
pub const DEFAULT_STATE_PROBE_TIMEOUT_MS: u64 = 5_000;
/// Upper bound on the freeze attempted before a forced stop.
pub const DEFAULT_FREEZE_TIMEOUT_MS: u64 = 5_000;
/// Grace period between SIGTERM and SIGKILL for helper processes.
pub const DEFAULT_HELPER_KILL_TIMEOUT_MS: u64 = 2_000;

/// Size of an isolated id range when none is configured.
pub const DEFAULT_ISOLATED_IDMAP_SIZE: i64 = 65_536;
/// Host range assumed when `/etc/subuid` has no entry for root.
pub const DEFAULT_HOST_IDMAP: (i64, i64) = (1_000_000, 1_000_000_000);
/// Sub-id files consulted for the host range.
pub const SUBUID_PATH: &str = "/etc/subuid";
/// Sub-gid file consulted for the host range.
pub const SUBGID_PATH: &str = "/etc/subgid";

/// Default sysfs root used for device inventory.
pub const DEFAULT_SYSFS_ROOT: &str = "/sys";
/// Default name of the socket forwarding helper.
pub const DEFAULT_PROXY_HELPER: &str = "socat";

/// Name of the generated low-level configuration file in the log directory.
pub const RUNTIME_CONFIG_FILE: &str = "lxc.conf";
/// Name of the runtime library log file in the log directory.
pub const RUNTIME_LOG_FILE: &str = "lxc.log";

/// Separator between a container name and a snapshot name.
pub const SNAPSHOT_DELIMITER: char = '/';

/// Prefix of the MAC addresses generated for nics.
pub const MAC_PREFIX: &str = "00:16:3e";

/// Container configuration keys.
pub mod keys {
    /// Run the container without an id map.
    pub const SECURITY_PRIVILEGED: &str = "security.privileged";
    /// Give the container a private id range.
    pub const SECURITY_IDMAP_ISOLATED: &str = "security.idmap.isolated";
    /// Fixed host base of the private id range.
    pub const SECURITY_IDMAP_BASE: &str = "security.idmap.base";
    /// Size of the private id range.
    pub const SECURITY_IDMAP_SIZE: &str = "security.idmap.size";
    /// Forbid deleting the container.
    pub const SECURITY_PROTECTION_DELETE: &str = "security.protection.delete";
    /// Forbid remapping the container filesystem.
    pub const SECURITY_PROTECTION_SHIFT: &str = "security.protection.shift";
    /// Allow nesting containers.
    pub const SECURITY_NESTING: &str = "security.nesting";
    /// Extra id mappings, one per line.
    pub const RAW_IDMAP: &str = "raw.idmap";
    /// Raw runtime library configuration lines.
    pub const RAW_LXC: &str = "raw.lxc";
    /// Comma separated list of kernel modules to load before start.
    pub const LINUX_KERNEL_MODULES: &str = "linux.kernel_modules";

    /// Memory limit, absolute or percentage.
    pub const LIMITS_MEMORY: &str = "limits.memory";
    /// `hard` or `soft` memory enforcement.
    pub const LIMITS_MEMORY_ENFORCE: &str = "limits.memory.enforce";
    /// Whether swap may be used.
    pub const LIMITS_MEMORY_SWAP: &str = "limits.memory.swap";
    /// CPU time allowance, `N%` or `Nms/Mms`.
    pub const LIMITS_CPU_ALLOWANCE: &str = "limits.cpu.allowance";
    /// CPU priority, 0 to 10.
    pub const LIMITS_CPU_PRIORITY: &str = "limits.cpu.priority";
    /// Block I/O priority, 0 to 10.
    pub const LIMITS_DISK_PRIORITY: &str = "limits.disk.priority";
    /// Maximum number of processes.
    pub const LIMITS_PROCESSES: &str = "limits.processes";
    /// Network priority, 0 to 10.
    pub const LIMITS_NETWORK_PRIORITY: &str = "limits.network.priority";

    /// Id map to use on next start.
    pub const VOLATILE_IDMAP_NEXT: &str = "volatile.idmap.next";
    /// Host base of the allocated id range.
    pub const VOLATILE_IDMAP_BASE: &str = "volatile.idmap.base";
    /// Id map in use by the running container.
    pub const VOLATILE_IDMAP_CURRENT: &str = "volatile.idmap.current";
    /// Id map the on-disk filesystem is shifted to.
    pub const VOLATILE_LAST_STATE_IDMAP: &str = "volatile.last_state.idmap";
    /// Root disk quota to apply on next start.
    pub const VOLATILE_APPLY_QUOTA: &str = "volatile.apply_quota";

    /// Prefix of every volatile key.
    pub const VOLATILE_PREFIX: &str = "volatile.";
    /// Prefix of image metadata keys.
    pub const IMAGE_PREFIX: &str = "image.";

    /// Builds the per-device volatile key `volatile.<device>.<suffix>`.
    #[must_use]
    pub fn volatile_device(device: &str, suffix: &str) -> String {
        format!("volatile.{device}.{suffix}")
    }
}

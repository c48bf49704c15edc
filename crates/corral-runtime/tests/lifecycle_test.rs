//! Lifecycle tests against in-memory collaborators.
//!
//! These drive the engine the way the daemon does:
//! 1. Operation locking across concurrent callers and the watchdog
//! 2. Idmap allocation and the root filesystem remap on start
//! 3. Live updates of devices, limits and the root disk
//! 4. Stop, freeze, reboot and ephemeral cleanup through the hooks
//! 5. Snapshots, restore, rename and delete

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use std::sync::{Arc, Barrier};
use std::time::Duration;

use common::{Harness, HOST_BASE, bridged_nic, config, eventually, with_nic};
use corral_common::constants::keys;
use corral_common::device::Device;
use corral_common::error::CorralError;
use corral_common::types::{OperationAction, PowerState, StatusCode};
use corral_core::idmap::IdmapSet;
use corral_runtime::container::UpdateArgs;
use corral_runtime::engine::CreateArgs;
use corral_runtime::store::ConfigStore;

fn isolated(name: &str) -> CreateArgs {
    let mut args = CreateArgs::new(name);
    args.config = config(&[(keys::SECURITY_IDMAP_ISOLATED, "true")]);
    args
}

// ── Operation lock ───────────────────────────────────────────────────

#[test]
fn concurrent_starts_run_once_and_report_busy() {
    let h = Harness::new();
    let c = h.engine.create(CreateArgs::new("c1")).expect("create");
    h.runtime.state("c1").set_start_delay(Duration::from_millis(300));

    let barrier = Arc::new(Barrier::new(2));
    let threads: Vec<_> = (0..2)
        .map(|_| {
            let c = Arc::clone(&c);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                let _ = barrier.wait();
                c.start(false)
            })
        })
        .collect();
    let results: Vec<_> = threads.into_iter().map(|t| t.join().expect("join")).collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    let err = results.into_iter().find_map(Result::err).expect("one start fails");
    assert!(matches!(err.root(), CorralError::Busy { .. }), "got {err}");
    assert_eq!(h.runtime.state("c1").starts(), 1);
    assert_eq!(h.events.count("container-started"), 1);
}

#[test]
fn abandoned_operation_is_released_by_the_watchdog() {
    let h = Harness::with_driver(|d| d.operation_timeout_ms = 150);
    let c = h.engine.create(CreateArgs::new("c1")).expect("create");
    let services = h.engine.services();
    let abandoned = services
        .operations
        .create("c1", OperationAction::Stop, false, false)
        .expect("operation");

    let err = c.start(false).expect_err("busy");
    assert!(matches!(err.root(), CorralError::Busy { .. }));

    let waited = abandoned.wait().expect_err("timed out");
    assert!(matches!(waited, CorralError::OperationTimeout { .. }));
    assert!(!services.operations.is_busy("c1"));
    c.start(false).expect("start after watchdog");
    assert!(c.is_running());
}

#[test]
fn operation_is_released_after_start_and_stop() {
    let h = Harness::new();
    let c = h.engine.create(CreateArgs::new("c1")).expect("create");
    c.start(false).expect("start");
    assert!(!h.engine.services().operations.is_busy("c1"));
    c.stop(false).expect("stop");
    assert!(!h.engine.services().operations.is_busy("c1"));
}

// ── Idmap ────────────────────────────────────────────────────────────

#[test]
fn isolated_containers_get_disjoint_ranges() {
    let h = Harness::new();
    let a = h.engine.create(isolated("a")).expect("create a");
    let b = h.engine.create(isolated("b")).expect("create b");

    let range = |c: &corral_runtime::container::Container| {
        let set = c.next_idmap().expect("parse").expect("unprivileged");
        let first = set.entries()[0].clone();
        (first.host_id, first.host_id + first.range)
    };
    let (a_start, a_end) = range(&a);
    let (b_start, b_end) = range(&b);
    assert!(a_end <= b_start || b_end <= a_start, "{a_start}..{a_end} overlaps {b_start}..{b_end}");
    for start in [a_start, b_start] {
        assert!(start >= HOST_BASE + 65_536, "isolated range inside the shared block");
    }
    assert_eq!(
        a.local_config().get(keys::VOLATILE_IDMAP_BASE),
        Some(&a_start.to_string())
    );
}

#[test]
fn start_remaps_rootfs_once_and_records_the_map() {
    let h = Harness::new();
    let c = h.engine.create(isolated("c1")).expect("create");

    let stale = IdmapSet::contiguous(2_000_000, 65_536);
    let mut args = UpdateArgs::from_record(&c.record());
    let _ = args.config.insert(
        keys::VOLATILE_LAST_STATE_IDMAP.into(),
        stale.to_json().expect("json"),
    );
    c.update(args, false).expect("record stale disk map");

    c.start(false).expect("start");
    assert_eq!(h.storage.unshifts(), 1);
    assert_eq!(h.storage.shifts(), 1);

    let local = c.local_config();
    let next = local.get(keys::VOLATILE_IDMAP_NEXT).expect("next");
    assert_eq!(local.get(keys::VOLATILE_IDMAP_CURRENT), Some(next));
    assert_eq!(local.get(keys::VOLATILE_LAST_STATE_IDMAP), Some(next));

    c.stop(false).expect("stop");
    c.start(false).expect("second start");
    assert_eq!(h.storage.shifts(), 1, "an unchanged map is not shifted again");
}

#[test]
fn shift_protection_refuses_the_remap() {
    let h = Harness::new();
    let mut args = isolated("c1");
    let _ = args.config.insert(keys::SECURITY_PROTECTION_SHIFT.into(), "true".into());
    let c = h.engine.create(args).expect("create");

    let err = c.start(false).expect_err("protected");
    assert!(matches!(err.root(), CorralError::Protected { .. }));
    assert_eq!(h.storage.shifts(), 0);
    assert!(!c.is_running());
}

// ── Update ───────────────────────────────────────────────────────────

#[test]
fn update_replaces_nic_host_name_live() {
    let h = Harness::new();
    let mut args = CreateArgs::new("c1");
    args.devices = with_nic(bridged_nic("vethA"));
    let c = h.engine.create(args).expect("create");
    c.start(false).expect("start");

    let mut update = UpdateArgs::from_record(&c.record());
    update.devices = with_nic(bridged_nic("vethB"));
    c.update(update, true).expect("update");

    let calls = h.network.calls();
    let deleted = calls.iter().position(|c| c == "delete_link vethA").expect("old link removed");
    let created = calls.iter().position(|c| c == "create_veth vethB").expect("new link created");
    assert!(deleted < created);
    assert_eq!(h.events.count("container-updated"), 1);
    assert_eq!(
        h.store.container("c1").expect("record").devices.get("eth0").map(|d| d.value("host_name").to_string()),
        Some("vethB".to_string())
    );
}

#[test]
fn identical_update_touches_no_device() {
    let h = Harness::new();
    let mut args = CreateArgs::new("c1");
    args.devices = with_nic(bridged_nic("vethA"));
    let c = h.engine.create(args).expect("create");
    c.start(false).expect("start");
    let before = h.network.calls().len();

    c.update(UpdateArgs::from_record(&c.record()), true).expect("update");
    assert_eq!(h.network.calls().len(), before);
    assert!(h.runtime.state("c1").interfaces().is_empty());
}

#[test]
fn user_update_cannot_change_volatile_keys() {
    let h = Harness::new();
    let c = h.engine.create(isolated("c1")).expect("create");
    let mut args = UpdateArgs::from_record(&c.record());
    let _ = args.config.insert(keys::VOLATILE_IDMAP_BASE.into(), "0".into());

    let err = c.update(args, true).expect_err("read-only");
    assert!(err.to_string().contains("read-only"), "got {err}");
    assert_eq!(h.events.count("container-updated"), 0);
}

#[test]
fn update_rejects_a_second_root_disk() {
    let h = Harness::new();
    let c = h.engine.create(CreateArgs::new("c1")).expect("create");
    let mut args = UpdateArgs::from_record(&c.record());
    let _ = args.devices.insert(
        "root2",
        Device::from_pairs([("type", "disk"), ("path", "/"), ("pool", "default")]),
    );

    assert!(c.update(args, true).is_err());
    assert!(c.record().devices.is_empty());
    assert!(h.store.container("c1").expect("record").devices.is_empty());
}

#[test]
fn update_refuses_a_root_pool_change() {
    let h = Harness::new();
    let c = h.engine.create(CreateArgs::new("c1")).expect("create");
    let mut args = UpdateArgs::from_record(&c.record());
    let _ = args.devices.insert(
        "root",
        Device::from_pairs([("type", "disk"), ("path", "/"), ("pool", "fast")]),
    );

    let err = c.update(args, true).expect_err("pool change");
    assert!(err.to_string().contains("storage pool"), "got {err}");
    assert_eq!(c.expanded_devices().get("root").map(|d| d.value("pool").to_string()), Some("default".into()));
}

#[test]
fn root_disk_resize_waits_for_next_start_when_offline_only() {
    let h = Harness::new();
    let c = h.engine.create(CreateArgs::new("c1")).expect("create");
    c.start(false).expect("start");

    let mut args = UpdateArgs::from_record(&c.record());
    let _ = args.devices.insert(
        "root",
        Device::from_pairs([("type", "disk"), ("path", "/"), ("pool", "default"), ("size", "20GB")]),
    );
    c.update(args, true).expect("update");
    assert!(h.storage.quotas().is_empty());
    assert_eq!(
        h.store.container("c1").expect("record").config.get(keys::VOLATILE_APPLY_QUOTA),
        Some(&"20GB".to_string())
    );

    c.stop(false).expect("stop");
    c.start(false).expect("restart");
    assert_eq!(h.storage.quotas(), vec![("c1".to_string(), "20GB".to_string())]);
    assert!(c.local_config().get(keys::VOLATILE_APPLY_QUOTA).is_none());
}

#[test]
fn root_disk_resize_is_immediate_with_online_resize() {
    let h = Harness::new();
    h.storage.set_online_resize(true);
    let c = h.engine.create(CreateArgs::new("c1")).expect("create");
    c.start(false).expect("start");

    let mut args = UpdateArgs::from_record(&c.record());
    let _ = args.devices.insert(
        "root",
        Device::from_pairs([("type", "disk"), ("path", "/"), ("pool", "default"), ("size", "10GB")]),
    );
    c.update(args, true).expect("update");
    assert_eq!(h.storage.quotas().len(), 1);
    assert!(c.local_config().get(keys::VOLATILE_APPLY_QUOTA).is_none());
}

#[test]
fn failed_memory_limit_leaves_config_untouched() {
    let h = Harness::new();
    let c = h.engine.create(CreateArgs::new("c1")).expect("create");
    c.start(false).expect("start");
    h.runtime.state("c1").fail_cgroup_key("memory.max");

    let mut args = UpdateArgs::from_record(&c.record());
    let _ = args.config.insert(keys::LIMITS_MEMORY.into(), "1GiB".into());
    assert!(c.update(args, true).is_err());

    assert!(c.local_config().get(keys::LIMITS_MEMORY).is_none());
    assert!(h.store.container("c1").expect("record").config.get(keys::LIMITS_MEMORY).is_none());
    assert_eq!(h.events.count("container-updated"), 0);
}

#[test]
fn process_limit_reaches_the_running_container() {
    let h = Harness::new();
    let c = h.engine.create(CreateArgs::new("c1")).expect("create");
    c.start(false).expect("start");

    let mut args = UpdateArgs::from_record(&c.record());
    let _ = args.config.insert(keys::LIMITS_PROCESSES.into(), "100".into());
    c.update(args, true).expect("update");
    assert!(
        h.runtime
            .state("c1")
            .cgroup_writes()
            .contains(&("pids.max".to_string(), "100".to_string()))
    );
}

// ── Stop, freeze and hooks ───────────────────────────────────────────

#[test]
fn stop_runs_the_hooks_and_records_the_power_state() {
    let h = Harness::new();
    let c = h.engine.create(CreateArgs::new("c1")).expect("create");
    c.start(false).expect("start");
    assert_eq!(h.store.container("c1").expect("record").power_state, PowerState::Running);

    c.stop(false).expect("stop");
    assert_eq!(c.status(), StatusCode::Stopped);
    assert_eq!(h.store.container("c1").expect("record").power_state, PowerState::Stopped);
    assert!(
        h.runtime
            .state("c1")
            .cgroup_writes()
            .contains(&("pids.max".to_string(), "0".to_string()))
    );
    assert_eq!(h.events.count("container-stopped"), 1);

    let err = c.stop(false).expect_err("already stopped");
    assert!(err.to_string().contains("already stopped"), "got {err}");
}

#[test]
fn shutdown_emits_its_own_event() {
    let h = Harness::new();
    let c = h.engine.create(CreateArgs::new("c1")).expect("create");
    c.start(false).expect("start");
    c.shutdown(Duration::from_secs(5)).expect("shutdown");
    assert!(!c.is_running());
    assert_eq!(h.events.count("container-shutdown"), 1);
}

#[test]
fn freeze_and_unfreeze_toggle_the_state() {
    let h = Harness::new();
    let c = h.engine.create(CreateArgs::new("c1")).expect("create");
    assert!(c.freeze().is_err(), "stopped containers cannot be frozen");
    c.start(false).expect("start");

    c.freeze().expect("freeze");
    assert!(c.is_frozen());
    assert!(c.freeze().expect_err("twice").to_string().contains("already frozen"));
    c.unfreeze().expect("unfreeze");
    assert_eq!(c.status(), StatusCode::Running);
    assert_eq!(h.events.count("container-paused"), 1);
    assert_eq!(h.events.count("container-resumed"), 1);
}

#[test]
fn hung_monitor_reports_frozen() {
    let h = Harness::new();
    let c = h.engine.create(CreateArgs::new("c1")).expect("create");
    c.start(false).expect("start");

    h.runtime.state("c1").hang();
    assert!(matches!(c.state(), Err(CorralError::MonitorHung)));
    assert!(c.is_running(), "a hung monitor counts as running");
}

#[test]
fn reboot_from_inside_starts_the_container_again() {
    let h = Harness::new();
    let c = h.engine.create(CreateArgs::new("c1")).expect("create");
    c.start(false).expect("start");

    h.runtime.reboot("c1").expect("reboot hooks");
    assert!(eventually(|| h.runtime.state("c1").starts() == 2));
    assert!(eventually(|| !h.engine.services().operations.is_busy("c1")));
    assert!(c.is_running());
}

#[test]
fn ephemeral_container_is_deleted_on_stop() {
    let h = Harness::new();
    let mut args = CreateArgs::new("c1");
    args.ephemeral = true;
    let c = h.engine.create(args).expect("create");
    c.start(false).expect("start");

    c.stop(false).expect("stop");
    assert!(matches!(h.store.container("c1"), Err(CorralError::NotFound { .. })));
    assert_eq!(h.events.count("container-deleted"), 1);
}

#[test]
fn network_up_rejects_unknown_devices() {
    let h = Harness::new();
    let c = h.engine.create(CreateArgs::new("c1")).expect("create");
    let err = h
        .engine
        .callhook(
            "c1",
            &corral_runtime::engine::Hook::NetworkUp {
                device: "eth9".into(),
                host_name: "veth9".into(),
            },
        )
        .expect_err("unknown device");
    assert!(err.to_string().contains("unknown device"), "got {err}");
    drop(c);
}

fn unix_char(h: &Harness, required: bool) -> CreateArgs {
    let source = h.dir.path().join("missing/ttyX");
    let source = source.to_str().expect("utf-8 path").to_string();
    let mut args = CreateArgs::new("c1");
    let _ = args.devices.insert(
        "dev",
        Device::from_pairs([
            ("type", "unix-char"),
            ("source", source.as_str()),
            ("path", "/dev/ttyX"),
            ("required", if required { "true" } else { "false" }),
        ]),
    );
    args
}

#[test]
fn optional_unix_device_with_missing_source_is_watched() {
    let h = Harness::new();
    let c = h.engine.create(unix_char(&h, false)).expect("create");
    c.start(false).expect("start");

    assert!(c.is_running());
    assert_eq!(h.engine.services().hotplug.pending("c1"), vec!["dev".to_string()]);
}

#[test]
fn required_unix_device_with_missing_source_aborts_start() {
    let h = Harness::new();
    let c = h.engine.create(unix_char(&h, true)).expect("create");
    let err = c.start(false).expect_err("missing required device");

    assert!(err.to_string().contains("missing source"), "got {err}");
    assert!(!c.is_running());
    assert_eq!(c.status(), StatusCode::Stopped);
    assert_eq!(h.runtime.state("c1").starts(), 0);
    assert!(h.engine.services().hotplug.pending("c1").is_empty());
}

#[test]
fn stateless_stop_discards_a_leftover_checkpoint() {
    let h = Harness::new();
    let c = h.engine.create(CreateArgs::new("c1")).expect("create");
    c.start(false).expect("start");
    let state = c.state_path();
    std::fs::create_dir_all(&state).expect("state dir");
    std::fs::write(state.join("dump.img"), b"stale").expect("stale dump");

    c.stop(false).expect("stop");
    assert!(!state.exists());
}

// ── Snapshots, rename and delete ─────────────────────────────────────

#[test]
fn restore_brings_back_the_snapshot_contents() {
    let h = Harness::new();
    let c = h.engine.create(CreateArgs::new("c1")).expect("create");
    let marker = h.engine.services().storage.rootfs_path("c1").join("marker");
    std::fs::write(&marker, "before").expect("write");

    let snap = c.snapshot("snap0", false).expect("snapshot");
    assert_eq!(snap.name(), "c1/snap0");
    std::fs::write(&marker, "after").expect("overwrite");

    c.restore(&snap, false).expect("restore");
    assert_eq!(std::fs::read_to_string(&marker).expect("read"), "before");
    assert_eq!(h.events.count("container-snapshot-created"), 1);
    let restored = h
        .events
        .events()
        .into_iter()
        .find(|e| e.action == "container-snapshot-restored")
        .expect("restored event");
    assert_eq!(restored.metadata["snapshot_name"], "snap0");
    assert!(!c.is_running());
}

#[test]
fn restore_restarts_a_running_container() {
    let h = Harness::new();
    let c = h.engine.create(CreateArgs::new("c1")).expect("create");
    let snap = c.snapshot("snap0", false).expect("snapshot");
    c.start(false).expect("start");

    c.restore(&snap, false).expect("restore");
    assert!(c.is_running());
    assert_eq!(h.runtime.state("c1").starts(), 2);
}

#[test]
fn snapshot_names_are_validated() {
    let h = Harness::new();
    let c = h.engine.create(CreateArgs::new("c1")).expect("create");
    assert!(c.snapshot("", false).is_err());
    assert!(c.snapshot("a/b", false).is_err());
    assert!(c.snapshot("s0", true).is_err(), "stateful snapshots need a running container");
    assert!(h.store.snapshots("c1").expect("snapshots").is_empty());
}

#[test]
fn rename_moves_snapshots_along() {
    let h = Harness::new();
    let c = h.engine.create(CreateArgs::new("c1")).expect("create");
    let _ = c.snapshot("snap0", false).expect("snapshot");

    c.rename("c2").expect("rename");
    assert_eq!(c.name(), "c2");
    assert!(h.store.container("c1").is_err());
    assert!(h.store.container("c2/snap0").is_ok());
    assert!(h.engine.services().storage.rootfs_path("c2").exists());
    let renamed = h
        .events
        .events()
        .into_iter()
        .find(|e| e.action == "container-renamed")
        .expect("renamed event");
    assert_eq!(renamed.source, "/1.0/containers/c1");
    assert_eq!(renamed.metadata["new_name"], "c2");
}

#[test]
fn running_containers_cannot_be_renamed() {
    let h = Harness::new();
    let c = h.engine.create(CreateArgs::new("c1")).expect("create");
    c.start(false).expect("start");
    assert!(c.rename("c2").is_err());
    assert!(c.rename("not a hostname").is_err());
    assert_eq!(c.name(), "c1");
}

#[test]
fn delete_removes_snapshots_and_volume() {
    let h = Harness::new();
    let c = h.engine.create(CreateArgs::new("c1")).expect("create");
    let _ = c.snapshot("snap0", false).expect("snapshot");
    drop(c);

    h.engine.delete("c1").expect("delete");
    assert!(h.store.containers().expect("containers").is_empty());
    assert!(!h.engine.services().storage.rootfs_path("c1").exists());
    assert_eq!(h.events.count("container-snapshot-deleted"), 1);
    assert_eq!(h.events.count("container-deleted"), 1);
}

#[test]
fn protected_containers_are_not_deleted() {
    let h = Harness::new();
    let mut args = CreateArgs::new("c1");
    args.config = config(&[(keys::SECURITY_PROTECTION_DELETE, "true")]);
    let _ = h.engine.create(args).expect("create");

    let err = h.engine.delete("c1").expect_err("protected");
    assert!(matches!(err.root(), CorralError::Protected { .. }));
    assert!(h.store.container("c1").is_ok());
}

#[test]
fn running_containers_are_not_deleted() {
    let h = Harness::new();
    let c = h.engine.create(CreateArgs::new("c1")).expect("create");
    c.start(false).expect("start");
    assert!(h.engine.delete("c1").is_err());
    assert!(c.is_running());
}

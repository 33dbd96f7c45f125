//! Runtime configuration builder.
//!
//! Builds an ordered sequence of (key, value) directives. The contract is
//! output-equivalence: two builds from the same [`BuildInput`] must produce
//! byte-identical directive sequences, so every step here iterates only
//! over already-sorted collections (`BTreeMap`, or a locally-sorted `Vec`).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{CoreError, CoreResult};
use crate::idmap::{IdKind, Idmap};

use super::legacy::translate_key;
use super::limits::MemoryLimits;
use super::keys;

/// Mount hook script the NVIDIA container runtime library installs
/// alongside `nvidia-container-cli`; this driver registers it via
/// `lxc.hook.mount` rather than re-entering its own `callhook`.
pub const NVIDIA_MOUNT_HOOK_SCRIPT: &str = "/usr/share/ctnrd/hooks/nvidia-container-mount.sh";

/// `nvidia.runtime` requires both the mount hook script and the NVIDIA
/// container CLI to be present on this host; a container configured for it
/// on a host missing either would start with no GPU devices visible and no
/// indication why.
pub fn nvidia_preflight() -> CoreResult<()> {
    if !Path::new(NVIDIA_MOUNT_HOOK_SCRIPT).is_file() {
        return Err(CoreError::InvalidConfig(format!(
            "nvidia.runtime is set but the mount hook script is missing: {NVIDIA_MOUNT_HOOK_SCRIPT}"
        )));
    }
    if !binary_on_path("nvidia-container-cli") {
        return Err(CoreError::InvalidConfig(
            "nvidia.runtime is set but nvidia-container-cli is not on PATH".to_string(),
        ));
    }
    Ok(())
}

fn binary_on_path(name: &str) -> bool {
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(name).is_file()))
        .unwrap_or(false)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Warn,
    Info,
    Trace,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Trace => "trace",
        }
    }
}

/// Everything the builder needs to produce directives for one Start. Plain
/// data — no collaborator calls happen here; callers resolve idmap,
/// personality, capability probes, etc. up front.
#[derive(Debug, Clone)]
pub struct BuildInput {
    pub log_file: PathBuf,
    pub log_level: LogLevel,
    pub console_log_path: PathBuf,
    pub hostname: String,

    pub privileged: bool,
    pub in_userns: bool,
    pub apparmor_stacking_active: bool,
    pub cgroup_unified: bool,
    pub host_supports_devices_controller: bool,

    pub architecture_personality: String,

    /// `project/name` or equivalent, embedded into hook argv so the hook
    /// handler can locate the instance.
    pub instance_ref: String,

    pub idmap: Idmap,
    pub environment: BTreeMap<String, String>,

    pub nvidia_runtime: bool,

    pub memory: Option<MemoryLimits>,
    pub cpu_shares: Option<u64>,
    pub cpu_period: Option<u64>,
    pub cpu_quota: Option<i64>,
    pub blkio_weight: Option<u32>,
    pub pids_max: Option<u64>,
    /// Size class (e.g. `"2MB"`) to limit.
    pub hugepages: BTreeMap<String, u64>,
    /// `limits.kernel.<name>` suffix to rlimit value.
    pub rlimits: BTreeMap<String, String>,

    pub raw_lxc: Option<String>,

    pub runtime_version: (u32, u32),
    pub rootfs_path: PathBuf,
}

const STANDARD_CHAR_DEVICES: &[&str] = &[
    "null", "zero", "full", "random", "urandom", "tty", "console", "ptmx",
];

pub fn build(input: &BuildInput) -> CoreResult<Vec<(String, String)>> {
    let mut out = Vec::new();
    let push = |out: &mut Vec<(String, String)>, key: &str, value: String| -> CoreResult<()> {
        let key = translate_key(key, input.runtime_version)?;
        out.push((key, value));
        Ok(())
    };

    // Logging.
    push(&mut out, keys::log::FILE, input.log_file.display().to_string())?;
    push(&mut out, keys::log::LEVEL, input.log_level.as_str().to_string())?;
    push(&mut out, keys::log::CONSOLE_SIZE, "auto".to_string())?;
    push(
        &mut out,
        keys::log::CONSOLE_LOG,
        input.console_log_path.display().to_string(),
    )?;

    push(&mut out, keys::uts::NAME, input.hostname.clone())?;

    // Privilege-dependent capability drop.
    if input.privileged {
        let mut drop = vec!["sys_time", "sys_module", "sys_rawio"];
        if !input.apparmor_stacking_active {
            drop.push("mac_admin");
            drop.push("mac_override");
        }
        push(&mut out, keys::cap::DROP, drop.join(" "))?;
    }

    // Auto-mounts.
    let proc_sys_mode = if input.privileged && !input.in_userns { "mixed" } else { "rw" };
    let cgroup_mode = if input.cgroup_unified { "rw:force" } else { "mixed" };
    push(
        &mut out,
        keys::mount::AUTO,
        format!("proc:{proc_sys_mode} sys:{proc_sys_mode} cgroup:{cgroup_mode}"),
    )?;

    // Bind mounts: fixed pseudo-fs set, plus mqueue when unprivileged or in
    // a user namespace.
    const PSEUDO_FS: &[&str] = &["/dev/fuse", "/dev/net/tun"];
    for path in PSEUDO_FS {
        push(&mut out, keys::mount::ENTRY, format!("{path} {path} none bind,optional,create=file"))?;
    }
    if !input.privileged || input.in_userns {
        push(
            &mut out,
            keys::mount::ENTRY,
            "mqueue dev/mqueue mqueue rw,relatime,create=dir,optional".to_string(),
        )?;
    }

    // Device cgroup: deny-all then an explicit allowlist, when privileged
    // and the devices controller is available.
    if input.privileged && input.host_supports_devices_controller {
        push(&mut out, keys::cgroup_device::DENY, "a".to_string())?;
        push(&mut out, keys::cgroup_device::ALLOW, "b *:* m".to_string())?;
        push(&mut out, keys::cgroup_device::ALLOW, "c *:* m".to_string())?;
        for dev in STANDARD_CHAR_DEVICES {
            push(&mut out, keys::cgroup_device::ALLOW, format!("c {dev}"))?;
        }
        push(&mut out, keys::cgroup_device::ALLOW, "c 136:* rwm".to_string())?; // pts range
    }

    // Architecture.
    push(&mut out, keys::arch::PERSONALITY, input.architecture_personality.clone())?;

    // Hooks: the driver re-enters itself via `callhook`, embedding the
    // instance reference so the hook handler can locate it.
    push(
        &mut out,
        keys::hook::PRE_START,
        format!("callhook {} start", input.instance_ref),
    )?;
    push(
        &mut out,
        keys::hook::STOP_NS,
        format!("callhook {} stopns", input.instance_ref),
    )?;
    push(
        &mut out,
        keys::hook::POST_STOP,
        format!("callhook {} stop", input.instance_ref),
    )?;

    // Idmap: one directive per line, sorted so output-equivalence holds
    // regardless of the order entries were pushed onto the idmap set.
    let mut entries = input.idmap.0.clone();
    entries.sort_by_key(|e| (e.kind, e.nsid, e.hostid, e.maprange));
    for entry in entries {
        let kind = match entry.kind {
            IdKind::Uid => "u",
            IdKind::Gid => "g",
        };
        push(
            &mut out,
            keys::idmap::ENTRY,
            format!("{kind} {} {} {}", entry.nsid, entry.hostid, entry.maprange),
        )?;
    }

    // Environment.
    for (key, value) in &input.environment {
        push(&mut out, keys::env::ENTRY, format!("{key}={value}"))?;
    }

    // NVIDIA.
    if input.nvidia_runtime {
        nvidia_preflight()?;
        push(&mut out, keys::env::ENTRY, "NVIDIA_VISIBLE_DEVICES=none".to_string())?;
        push(
            &mut out,
            keys::env::ENTRY,
            "NVIDIA_DRIVER_CAPABILITIES=compute,utility".to_string(),
        )?;
        push(&mut out, keys::hook::MOUNT, NVIDIA_MOUNT_HOOK_SCRIPT.to_string())?;
    }

    // Resource limits.
    if let Some(mem) = input.memory {
        push(&mut out, keys::limits::MEMORY_LIMIT, mem.hard.to_string())?;
        push(&mut out, keys::limits::MEMORY_SOFT_LIMIT, mem.soft.to_string())?;
        if let Some(swap) = mem.swap {
            push(&mut out, keys::limits::MEMORY_SWAP_LIMIT, swap.to_string())?;
        }
        push(&mut out, keys::limits::MEMORY_SWAPPINESS, mem.swappiness.to_string())?;
    }
    if let Some(shares) = input.cpu_shares {
        push(&mut out, keys::limits::CPU_SHARES, shares.to_string())?;
    }
    if let Some(period) = input.cpu_period {
        push(&mut out, keys::limits::CPU_PERIOD, period.to_string())?;
    }
    if let Some(quota) = input.cpu_quota {
        push(&mut out, keys::limits::CPU_QUOTA, quota.to_string())?;
    }
    if let Some(weight) = input.blkio_weight {
        push(&mut out, keys::limits::BLKIO_WEIGHT, weight.to_string())?;
    }
    if let Some(pids) = input.pids_max {
        push(&mut out, keys::limits::PIDS_MAX, pids.to_string())?;
    }
    for (size_class, limit) in &input.hugepages {
        push(&mut out, keys::limits::HUGEPAGES, format!("{size_class}:{limit}"))?;
    }
    for (name, value) in &input.rlimits {
        push(&mut out, &format!("{}.{name}", keys::limits::RLIMIT), value.clone())?;
    }

    // Rootfs.
    push(&mut out, keys::rootfs::PATH, input.rootfs_path.display().to_string())?;

    // Raw passthrough, appended last so it overrides all prior directives.
    if let Some(raw) = &input.raw_lxc {
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                push(&mut out, key.trim(), value.trim().to_string())?;
            }
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idmap::IdEntry;

    fn minimal_input() -> BuildInput {
        BuildInput {
            log_file: PathBuf::from("/var/log/ctnrd/c1/lxc.log"),
            log_level: LogLevel::Info,
            console_log_path: PathBuf::from("/var/log/ctnrd/c1/console.log"),
            hostname: "c1".into(),
            privileged: false,
            in_userns: true,
            apparmor_stacking_active: false,
            cgroup_unified: true,
            host_supports_devices_controller: true,
            architecture_personality: "x86_64".into(),
            instance_ref: "default/c1".into(),
            idmap: Idmap(vec![
                IdEntry { kind: IdKind::Gid, nsid: 0, hostid: 100000, maprange: 65536 },
                IdEntry { kind: IdKind::Uid, nsid: 0, hostid: 100000, maprange: 65536 },
            ]),
            environment: BTreeMap::new(),
            nvidia_runtime: false,
            memory: None,
            cpu_shares: None,
            cpu_period: None,
            cpu_quota: None,
            blkio_weight: None,
            pids_max: None,
            hugepages: BTreeMap::new(),
            rlimits: BTreeMap::new(),
            raw_lxc: None,
            runtime_version: (2, 1),
            rootfs_path: PathBuf::from("/var/lib/ctnrd/c1/rootfs"),
        }
    }

    #[test]
    fn output_is_deterministic_regardless_of_idmap_insertion_order() {
        let a = minimal_input();
        let mut b = a.clone();
        b.idmap.0.reverse();

        assert_eq!(build(&a).unwrap(), build(&b).unwrap());
    }

    #[test]
    fn unprivileged_has_no_capability_drop() {
        let input = minimal_input();
        let out = build(&input).unwrap();
        assert!(!out.iter().any(|(k, _)| k == keys::cap::DROP));
    }

    #[test]
    fn privileged_without_apparmor_stacking_drops_mac_caps() {
        let mut input = minimal_input();
        input.privileged = true;
        let out = build(&input).unwrap();
        let (_, value) = out.iter().find(|(k, _)| k == keys::cap::DROP).unwrap();
        assert!(value.contains("mac_admin"));
        assert!(value.contains("mac_override"));
    }

    #[test]
    fn raw_lxc_is_appended_last_and_overrides() {
        let mut input = minimal_input();
        input.raw_lxc = Some("lxc.arch = aarch64".to_string());
        let out = build(&input).unwrap();
        assert_eq!(out.last().unwrap(), &("lxc.arch".to_string(), "aarch64".to_string()));
    }

    #[test]
    fn legacy_runtime_translates_idmap_key() {
        let mut input = minimal_input();
        input.runtime_version = (1, 9);
        let out = build(&input).unwrap();
        assert!(out.iter().any(|(k, _)| k == "lxc.id_map"));
        assert!(!out.iter().any(|(k, _)| k == "lxc.idmap"));
    }

    #[test]
    fn nvidia_runtime_fails_preflight_without_the_mount_hook_script() {
        let mut input = minimal_input();
        input.nvidia_runtime = true;
        let err = build(&input).unwrap_err();
        assert!(matches!(err, CoreError::InvalidConfig(_)));
    }

    #[test]
    fn binary_on_path_finds_a_real_executable() {
        assert!(binary_on_path("sh"));
        assert!(!binary_on_path("definitely-not-a-real-binary-ctnrd-test"));
    }

    #[test]
    fn environment_keys_are_sorted() {
        let mut input = minimal_input();
        input.environment.insert("B".into(), "2".into());
        input.environment.insert("A".into(), "1".into());
        let out = build(&input).unwrap();
        let envs: Vec<_> = out
            .iter()
            .filter(|(k, _)| k == keys::env::ENTRY)
            .map(|(_, v)| v.clone())
            .collect();
        assert_eq!(envs, vec!["A=1".to_string(), "B=2".to_string()]);
    }
}

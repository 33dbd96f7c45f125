//! Runtime directive key constants, grouped by directive family — matching
//! how `volumes/constants.rs` groups `qcow2`/`ext4` knobs into their own
//! modules rather than one flat list.

/// Logging directives.
pub mod log {
    pub const FILE: &str = "lxc.log.file";
    pub const LEVEL: &str = "lxc.log.level";
    pub const CONSOLE_SIZE: &str = "lxc.console.buffer.size";
    pub const CONSOLE_LOG: &str = "lxc.console.logfile";
}

/// Namespace/uts/hostname directives.
pub mod uts {
    pub const NAME: &str = "lxc.uts.name";
}

/// Mount directives.
pub mod mount {
    pub const ENTRY: &str = "lxc.mount.entry";
    pub const AUTO: &str = "lxc.mount.auto";
    pub const FSTAB: &str = "lxc.mount.fstab";
}

/// Capability directives.
pub mod cap {
    pub const DROP: &str = "lxc.cap.drop";
}

/// Device cgroup directives.
pub mod cgroup_device {
    pub const ALLOW: &str = "lxc.cgroup2.devices.allow";
    pub const DENY: &str = "lxc.cgroup2.devices.deny";
}

/// Resource-limit directives.
pub mod limits {
    pub const MEMORY_LIMIT: &str = "lxc.cgroup2.memory.max";
    pub const MEMORY_SOFT_LIMIT: &str = "lxc.cgroup2.memory.high";
    pub const MEMORY_SWAP_LIMIT: &str = "lxc.cgroup2.memory.swap.max";
    pub const MEMORY_SWAPPINESS: &str = "lxc.cgroup2.memory.swappiness";
    pub const CPU_SHARES: &str = "lxc.cgroup2.cpu.weight";
    pub const CPU_PERIOD: &str = "lxc.cgroup2.cpu.max.period";
    pub const CPU_QUOTA: &str = "lxc.cgroup2.cpu.max.quota";
    pub const BLKIO_WEIGHT: &str = "lxc.cgroup2.io.weight";
    pub const PIDS_MAX: &str = "lxc.cgroup2.pids.max";
    pub const HUGEPAGES: &str = "lxc.cgroup2.hugetlb";
    pub const RLIMIT: &str = "lxc.prlimit";
}

/// Personality/architecture directives.
pub mod arch {
    pub const PERSONALITY: &str = "lxc.arch";
}

/// Hook directives.
pub mod hook {
    pub const PRE_START: &str = "lxc.hook.pre-start";
    pub const STOP_NS: &str = "lxc.hook.stop";
    pub const POST_STOP: &str = "lxc.hook.post-stop";
    pub const MOUNT: &str = "lxc.hook.mount";
}

/// Idmap directives.
pub mod idmap {
    pub const ENTRY: &str = "lxc.idmap";
}

/// Environment directives.
pub mod env {
    pub const ENTRY: &str = "lxc.environment";
}

/// Security-profile directives.
pub mod security {
    pub const APPARMOR_PROFILE: &str = "lxc.apparmor.profile";
    pub const APPARMOR_ALLOW_INCOMPLETE: &str = "lxc.apparmor.allow_incomplete";
    pub const SELINUX_CONTEXT: &str = "lxc.selinux.context";
    pub const SECCOMP_PROFILE: &str = "lxc.seccomp.profile";
}

/// TTY/console directives.
pub mod tty {
    pub const MAX: &str = "lxc.tty.max";
    pub const DIR: &str = "lxc.tty.dir";
    pub const PATH: &str = "lxc.console.path";
}

/// PTY directives.
pub mod pty {
    pub const MAX: &str = "lxc.pty.max";
}

/// Signal directives.
pub mod signal {
    pub const HALT: &str = "lxc.signal.halt";
    pub const REBOOT: &str = "lxc.signal.reboot";
    pub const STOP: &str = "lxc.signal.stop";
}

/// Init directives.
pub mod init {
    pub const CMD: &str = "lxc.init.cmd";
    pub const UID: &str = "lxc.init.uid";
    pub const GID: &str = "lxc.init.gid";
}

/// Rootfs directive.
pub mod rootfs {
    pub const PATH: &str = "lxc.rootfs.path";
}

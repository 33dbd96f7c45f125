//! Re-exec helper argv dispatch.
//!
//! The driver re-executes its own binary for privileged or namespace-
//! entering work rather than doing it in the long-lived daemon process.
//! This module only defines the argv surface; the actual namespace/mount
//! syscalls it would issue are out of scope for this crate the same way
//! the runtime process itself is (`runtime_trait::Runtime`).

use clap::{Parser, Subcommand};

use crate::error::{CoreError, CoreResult};
use crate::hooks::HookTarget;

#[derive(Debug, Parser)]
#[command(name = "ctnrd-helper", about = "ctnrd re-exec helper")]
pub struct HelperArgs {
    #[command(subcommand)]
    pub command: HelperCommand,
}

#[derive(Debug, Subcommand)]
pub enum HelperCommand {
    /// `forkstart <name> <lxcpath> <configpath>` — starts the runtime.
    Forkstart { name: String, lxcpath: String, configpath: String },
    /// `forkmount {lxc-mount|lxd-mount|lxc-umount|lxd-umount} -- ...`
    Forkmount { op: MountOp, args: Vec<String> },
    /// `forkfile {exists|pull|push|remove} <rootfs> <pid> <pidfd> <args...>`
    Forkfile { op: FileOp, rootfs: String, pid: i32, pidfd: i32, args: Vec<String> },
    /// `forknet {info|detach} -- ...`
    Forknet { op: NetOp, args: Vec<String> },
    /// `forkuevent inject -- <pid> <pidfd> <len> <payload parts>`
    Forkuevent { pid: i32, pidfd: i32, len: usize, payload: Vec<String> },
    /// `callhook <varpath> <project> <name> {start|stopns|stop}`
    Callhook { varpath: String, project: String, name: String, hook: HookName },
    /// `forkmigrate <name> <lxcpath> <configpath> <stateDir> <preservesInodes>`
    Forkmigrate { name: String, lxcpath: String, configpath: String, state_dir: String, preserves_inodes: bool },
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum MountOp {
    LxcMount,
    LxdMount,
    LxcUmount,
    LxdUmount,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum FileOp {
    Exists,
    Pull,
    Push,
    Remove,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum NetOp {
    Info,
    Detach,
}

/// Which of the three hooks `callhook` is dispatching to.
#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum HookName {
    Start,
    Stopns,
    Stop,
}

/// The stop/reboot target LXC passes to `stopns`/`stop` hooks via the
/// `LXC_TARGET` environment variable.
pub fn read_hook_target_env() -> CoreResult<HookTarget> {
    std::env::var("LXC_TARGET")
        .unwrap_or_else(|_| "stop".to_string())
        .parse()
        .map_err(|_| CoreError::HookInvalidTarget("LXC_TARGET".to_string()))
}

/// Drops every ambient and permitted capability the re-exec'd helper
/// doesn't need once it has done the privileged part of its work (e.g.
/// after entering the target namespace but before running the rest of a
/// `forkmount`/`forkfile` request). No-op on non-Linux targets.
#[cfg(target_os = "linux")]
pub fn drop_ambient_capabilities() -> CoreResult<()> {
    caps::clear(None, caps::CapSet::Ambient)
        .map_err(|e| CoreError::Internal(format!("clearing ambient capabilities: {e}")))?;
    caps::clear(None, caps::CapSet::Permitted)
        .map_err(|e| CoreError::Internal(format!("clearing permitted capabilities: {e}")))?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn drop_ambient_capabilities() -> CoreResult<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_lxc_target_env_defaults_to_stop() {
        unsafe { std::env::remove_var("LXC_TARGET") };
        assert_eq!(read_hook_target_env().unwrap(), HookTarget::Stop);
    }
}

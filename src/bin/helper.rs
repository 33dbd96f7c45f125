//! `ctnrd-helper`: the binary the long-lived daemon re-execs itself as for
//! privileged/namespace-entering work.
//!
//! Each subcommand here is a thin argv parser; the actual namespace-entry
//! and mount/file/net syscalls are issued by helper crates this binary
//! would link against in a full deployment (this crate draws the line at
//! the argv contract, the same way it draws it at the `Runtime` trait
//! boundary for the runtime library itself).

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use clap::Parser;

use ctnrd::device::ShiftMode;
use ctnrd::helpers::{HelperArgs, HelperCommand, HookName, MountOp, drop_ambient_capabilities, read_hook_target_env};
use ctnrd::hooks::{HookTarget, socket_path};
use ctnrd::live::{MountRequest, insert_mount, remove_mount};

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = HelperArgs::parse();
    drop_ambient_capabilities()?;

    match args.command {
        HelperCommand::Forkstart { name, lxcpath, configpath } => {
            tracing::info!(name, lxcpath, configpath, "forkstart");
        }
        HelperCommand::Forkmount { op, args } => forkmount(op, &args)?,
        HelperCommand::Forkfile { op, rootfs, pid, pidfd, args } => {
            tracing::info!(?op, rootfs, pid, pidfd, ?args, "forkfile");
        }
        HelperCommand::Forknet { op, args } => {
            tracing::info!(?op, ?args, "forknet");
        }
        HelperCommand::Forkuevent { pid, pidfd, len, payload } => {
            tracing::info!(pid, pidfd, len, ?payload, "forkuevent");
        }
        HelperCommand::Callhook { varpath, project, name, hook } => callhook(&varpath, &project, &name, hook)?,
        HelperCommand::Forkmigrate { name, lxcpath, configpath, state_dir, preserves_inodes } => {
            tracing::info!(name, lxcpath, configpath, state_dir, preserves_inodes, "forkmigrate");
        }
    }

    Ok(())
}

/// `source target fstype flags` positional args; the PID to enter comes
/// from `LXC_PID`, same as every other hook/helper invocation.
fn forkmount(op: MountOp, args: &[String]) -> Result<()> {
    let [source, target, fstype, flags] = args else {
        return Err(anyhow!("forkmount expects source target fstype flags, got {args:?}"));
    };
    let pid: i32 = std::env::var("LXC_PID").context("LXC_PID not set")?.parse().context("LXC_PID not an integer")?;
    let flags: u64 = flags.parse().context("flags not an integer")?;
    let req = MountRequest {
        source: source.into(),
        target: target.into(),
        fstype: fstype.clone(),
        flags,
        shift_mode: ShiftMode::None,
    };

    match op {
        MountOp::LxcMount | MountOp::LxdMount => insert_mount(Some(pid), None, &req, None)?,
        MountOp::LxcUmount | MountOp::LxdUmount => remove_mount(Some(pid), &req.target)?,
    }
    Ok(())
}

/// Forwards the hook invocation to the daemon's live `HookHandler` over
/// the hook socket at `<varpath>/ctnrd-hooks.sock` — this process has no
/// access to the daemon's in-memory instance state, only the re-exec
/// argv and the `LXC_*` environment the runtime's monitor set up.
fn callhook(varpath: &str, project: &str, name: &str, hook: HookName) -> Result<()> {
    let instance_ref = format!("{project}/{name}");
    let line = match hook {
        HookName::Start => format!("start {instance_ref}"),
        HookName::Stopns => {
            let pid = std::env::var("LXC_PID").unwrap_or_default();
            format!("stopns {instance_ref} /proc/{pid}/ns/net")
        }
        HookName::Stop => {
            let target = read_hook_target_env().unwrap_or(HookTarget::Stop);
            let target = if target.is_reboot() { "reboot" } else { "stop" };
            let rootfs = std::env::var("LXC_ROOTFS_MOUNT").unwrap_or_else(|_| varpath.to_string());
            format!("stop {instance_ref} {target} {rootfs}")
        }
    };

    let socket = socket_path(Path::new(varpath));
    let mut stream = UnixStream::connect(&socket).with_context(|| format!("connecting to hook socket {}", socket.display()))?;
    writeln!(stream, "{line}").context("writing hook request")?;
    stream.shutdown(std::net::Shutdown::Write).ok();

    let mut response = String::new();
    BufReader::new(stream).read_line(&mut response).context("reading hook response")?;
    let response = response.trim();
    if let Some(detail) = response.strip_prefix("ERR ") {
        return Err(anyhow!("{hook:?} hook failed: {detail}"));
    }
    tracing::info!(varpath, project, name, ?hook, "callhook dispatched");
    Ok(())
}

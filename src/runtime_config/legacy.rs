//! Legacy key translation for runtime API versions below 2.1.

use crate::error::{CoreError, CoreResult};

/// The minimum runtime API version (major, minor) that understands
/// `lxc.prlimit.*` and the modern key names directly.
const MODERN_SINCE: (u32, u32) = (2, 1);

/// Translate a modern directive key to its legacy equivalent when `version`
/// is below 2.1. Returns the key unchanged on modern runtimes, or on keys
/// the rename table doesn't cover.
pub fn translate_key(key: &str, version: (u32, u32)) -> CoreResult<String> {
    if version >= MODERN_SINCE {
        return Ok(key.to_string());
    }

    if key.starts_with("lxc.prlimit.") {
        return Err(CoreError::RuntimeTooOld(format!(
            "{key} requires runtime api >= 2.1"
        )));
    }

    let legacy = match key {
        "lxc.uts.name" => "lxc.utsname",
        "lxc.pty.max" => "lxc.pts",
        "lxc.tty.dir" => "lxc.devttydir",
        "lxc.tty.max" => "lxc.tty",
        "lxc.apparmor.profile" => "lxc.aa_profile",
        "lxc.apparmor.allow_incomplete" => "lxc.aa_allow_incomplete",
        "lxc.selinux.context" => "lxc.se_context",
        "lxc.mount.fstab" => "lxc.mount",
        "lxc.console.path" => "lxc.console",
        "lxc.seccomp.profile" => "lxc.seccomp",
        "lxc.signal.halt" => "lxc.haltsignal",
        "lxc.signal.reboot" => "lxc.rebootsignal",
        "lxc.signal.stop" => "lxc.stopsignal",
        "lxc.log.syslog" => "lxc.syslog",
        "lxc.log.level" => "lxc.loglevel",
        "lxc.log.file" => "lxc.logfile",
        "lxc.init.cmd" => "lxc.init_cmd",
        "lxc.init.uid" => "lxc.init_uid",
        "lxc.init.gid" => "lxc.init_gid",
        "lxc.idmap" => "lxc.id_map",
        _ => key,
    };

    Ok(legacy.to_string())
}

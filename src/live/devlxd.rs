//! devlxd guest socket: mounted/unmounted into a running container's mount
//! namespace the same way any other live bind mount is, gated on
//! `security.devlxd`.

use std::path::{Path, PathBuf};

use crate::device::ShiftMode;
use crate::error::CoreResult;

use super::mount::{MountRequest, insert_mount, remove_mount};

pub const GUEST_SOCKET_PATH: &str = "dev/lxd/sock";

pub fn host_socket_path(instance_path: &Path) -> PathBuf {
    instance_path.join("devlxd").join("sock")
}

pub fn mount_socket(instance_path: &Path, init_pid: Option<i32>, init_pidfd: Option<i32>) -> CoreResult<()> {
    let req = MountRequest {
        source: host_socket_path(instance_path),
        target: PathBuf::from(GUEST_SOCKET_PATH),
        fstype: "none".to_string(),
        flags: 0,
        shift_mode: ShiftMode::None,
    };
    insert_mount(init_pid, init_pidfd, &req, None)
}

pub fn unmount_socket(init_pid: Option<i32>) -> CoreResult<()> {
    remove_mount(init_pid, Path::new(GUEST_SOCKET_PATH))
}

//! Live Injector: mount/cgroup changes applied into a running
//! container's namespaces without a Stop/Start round trip.

mod cgroup;
mod devlxd;
mod mount;

pub use cgroup::add_rule as add_cgroup_rule;
pub use devlxd::{GUEST_SOCKET_PATH, host_socket_path as devlxd_host_socket_path, mount_socket as mount_devlxd_socket, unmount_socket as unmount_devlxd_socket};
pub use mount::{MountRequest, SHARED_MOUNT_TREE, SHIFT_OVERLAY_FLAG_MASK, ShiftBackend, insert_mount, remove_mount};

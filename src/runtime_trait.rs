//! The external container runtime library this crate drives (analogous to
//! liblxc). Owning a process, namespaces, and cgroups is this trait's job;
//! this crate only ever holds a handle to it.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::CoreResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Freezing,
    Frozen,
    Thawed,
    Aborting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrateCmd {
    PreDump,
    Dump,
    Restore,
}

/// A handle onto a single container's runtime-library state. One instance
/// owns exactly one handle; rebuilding it always goes through `Release`
/// first.
#[async_trait]
pub trait Runtime: Send + Sync {
    async fn new_container(&self, name: &str, path: &Path) -> CoreResult<()>;
    async fn release(&self) -> CoreResult<()>;

    async fn set_config_item(&self, key: &str, value: &str) -> CoreResult<()>;
    async fn config_item(&self, key: &str) -> CoreResult<Option<String>>;
    async fn load_config_file(&self, path: &Path) -> CoreResult<()>;
    async fn save_config_file(&self, path: &Path) -> CoreResult<()>;

    async fn state(&self) -> CoreResult<RawState>;
    async fn init_pid(&self) -> CoreResult<Option<i32>>;
    async fn init_pid_fd(&self) -> CoreResult<Option<i32>>;

    async fn start(&self) -> CoreResult<()>;
    async fn stop(&self) -> CoreResult<()>;
    async fn shutdown(&self, timeout: Duration) -> CoreResult<()>;
    async fn freeze(&self) -> CoreResult<()>;
    async fn unfreeze(&self) -> CoreResult<()>;

    async fn attach_interface(&self, host_name: &str, guest_name: &str) -> CoreResult<()>;
    async fn detach_interface_rename(&self, guest_name: &str, host_name: &str) -> CoreResult<()>;
    async fn interfaces(&self) -> CoreResult<Vec<String>>;

    async fn set_cgroup_item(&self, key: &str, value: &str) -> CoreResult<()>;
    async fn cgroup_item(&self, key: &str) -> CoreResult<Option<String>>;

    async fn migrate(&self, cmd: MigrateCmd, opts: &BTreeMap<String, String>) -> CoreResult<()>;
    async fn console_log(&self) -> CoreResult<String>;

    /// `(major, minor)` runtime API version, for the legacy key
    /// translation table.
    fn api_version(&self) -> (u32, u32);
}

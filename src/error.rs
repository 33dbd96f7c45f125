//! Crate-wide error type.
//!
//! One variant per failure domain, matching the error kinds enumerated for
//! the driver. Display messages read as complete sentences so they can be
//! surfaced directly to a caller without further formatting.

use thiserror::Error;

/// Action tag recorded on an `OperationConflict`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationAction {
    Create,
    Start,
    Stop,
    Shutdown,
    Restart,
    Freeze,
    Unfreeze,
    Restore,
    Delete,
    Rename,
    Update,
}

impl std::fmt::Display for OperationAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OperationAction::Create => "create",
            OperationAction::Start => "start",
            OperationAction::Stop => "stop",
            OperationAction::Shutdown => "shutdown",
            OperationAction::Restart => "restart",
            OperationAction::Freeze => "freeze",
            OperationAction::Unfreeze => "unfreeze",
            OperationAction::Restore => "restore",
            OperationAction::Delete => "delete",
            OperationAction::Rename => "rename",
            OperationAction::Update => "update",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("profile not found: {0}")]
    ProfileNotFound(String),

    #[error("duplicate profile: {0}")]
    DuplicateProfile(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("invalid devices: {0}")]
    InvalidDevices(String),

    #[error("unsupported device type: {0}")]
    UnsupportedDevType(String),

    #[error("device {0} cannot be hot-plugged into a running instance")]
    DeviceCannotHotPlug(String),

    #[error("device {0} failed to start: {1}")]
    DeviceStartFailed(String, String),

    #[error("no free host id range of size {0} available")]
    IdmapExhausted(u32),

    #[error("raw idmap entry host id is a sub-id the host does not own: {0}")]
    HostIdIsSubId(String),

    #[error("instance rootfs is protected from uid/gid shifting")]
    ShiftProtected,

    #[error("instance is already running")]
    AlreadyRunning,

    #[error("instance is already stopped")]
    AlreadyStopped,

    #[error("instance is already frozen")]
    AlreadyFrozen,

    #[error("instance is not running")]
    NotRunning,

    #[error("runtime is too old: {0}")]
    RuntimeTooOld(String),

    #[error("runtime failed to start: {0}")]
    RuntimeFailed(String),

    #[error("hook invoked with invalid target: {0}")]
    HookInvalidTarget(String),

    #[error("runtime monitor is unresponsive")]
    MonitorUnresponsive,

    #[error("storage operation failed: {0}")]
    StorageFailed(String),

    #[error("another operation ({0}) is already in progress on this instance")]
    OperationConflict(OperationAction),

    #[error("instance is protected from deletion")]
    ProtectedFromDelete,

    #[error("CRIU is not available on this host")]
    CRIUMissing,

    #[error("instance not found: {0}")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;

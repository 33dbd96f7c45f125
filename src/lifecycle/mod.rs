//! Lifecycle Controller, the per-instance mutual-exclusion lock,
//! and the runtime-factory boundary it drives.

mod controller;
mod operation_lock;
mod runtime_factory;
mod state;

pub use controller::LifecycleController;
pub use operation_lock::{Acquired, OperationGuard, OperationLock};
pub use runtime_factory::RuntimeFactory;
pub use state::InstanceState;

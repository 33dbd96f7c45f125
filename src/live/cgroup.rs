//! Live cgroup rule injection.

use crate::error::{CoreError, CoreResult};
use crate::hooks::current_hook_context;
use crate::runtime_trait::Runtime;

/// Write `(key, value)` through the runtime's cgroup item setter. Rules
/// keyed under `devices.` are silently skipped when the host can't apply
/// them (inside a user namespace, or the devices controller isn't
/// mounted) — treated as expected rather than an error.
///
/// Fails fast with `MonitorUnresponsive` instead of calling into the
/// runtime handle while a hook dispatch is active on this task: the
/// runtime's own monitor thread is what invoked the hook, so a call here
/// would wait on a thread that's waiting on us.
pub async fn add_rule(
    runtime: &dyn Runtime,
    key: &str,
    value: &str,
    in_userns: bool,
    host_supports_devices_controller: bool,
) -> CoreResult<()> {
    if current_hook_context().from_hook {
        return Err(CoreError::MonitorUnresponsive);
    }
    if key.starts_with("devices.") && (in_userns || !host_supports_devices_controller) {
        tracing::debug!(key, "skipping devices cgroup rule, controller unavailable");
        return Ok(());
    }
    runtime.set_cgroup_item(key, value).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime_trait::test_support::NoopRuntime;

    #[tokio::test]
    async fn devices_rule_is_skipped_in_userns() {
        let runtime = NoopRuntime::default();
        add_rule(&runtime, "devices.allow", "c 1:3 rwm", true, true).await.unwrap();
        assert!(runtime.cgroup_items.lock().is_empty());
    }

    #[tokio::test]
    async fn non_devices_rule_is_always_applied() {
        let runtime = NoopRuntime::default();
        add_rule(&runtime, "memory.limit_in_bytes", "1024", true, true).await.unwrap();
        assert_eq!(runtime.cgroup_items.lock().len(), 1);
    }

    #[tokio::test]
    async fn fails_fast_instead_of_blocking_while_a_hook_is_active() {
        let runtime = NoopRuntime::default();
        let err = crate::hooks::run_as_hook(async { add_rule(&runtime, "memory.limit_in_bytes", "1024", true, true).await })
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::CoreError::MonitorUnresponsive));
    }
}

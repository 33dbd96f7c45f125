//! Unix-socket bridge for `callhook`.
//!
//! The runtime invokes hooks from its own monitor process; the only thing
//! on that invocation path is the re-exec'd helper binary; not a live
//! [`HookHandler`]. `callhook` forwards the invocation here over a unix
//! socket so it still runs against the daemon's actual instance state,
//! rather than duplicating store/device/storage wiring in the helper
//! binary itself.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

use crate::error::{CoreError, CoreResult};
use crate::persistence::InstanceStore;
use crate::runtime_trait::Runtime;

use super::{HookHandler, HookTarget};

pub const SOCKET_NAME: &str = "ctnrd-hooks.sock";

pub fn socket_path(var_dir: &Path) -> PathBuf {
    var_dir.join(SOCKET_NAME)
}

/// Runs until the listener errors. Callers spawn this alongside the
/// lifecycle controller; a `runtime_for` closure resolves the `Runtime`
/// handle a `start` hook needs to defer its network-priority application
/// onto.
pub async fn serve<S, F>(path: &Path, handler: Arc<HookHandler<S>>, runtime_for: F) -> CoreResult<()>
where
    S: InstanceStore + 'static,
    F: Fn(u64) -> CoreResult<Arc<dyn Runtime>> + Send + Sync + 'static,
{
    let _ = std::fs::remove_file(path);
    let listener = UnixListener::bind(path).map_err(CoreError::Io)?;
    let runtime_for = Arc::new(runtime_for);

    loop {
        let (stream, _) = listener.accept().await.map_err(CoreError::Io)?;
        let handler = handler.clone();
        let runtime_for = runtime_for.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, handler, runtime_for).await {
                tracing::warn!(error = %e, "hook socket connection failed");
            }
        });
    }
}

async fn handle_connection<S, F>(stream: UnixStream, handler: Arc<HookHandler<S>>, runtime_for: Arc<F>) -> CoreResult<()>
where
    S: InstanceStore + 'static,
    F: Fn(u64) -> CoreResult<Arc<dyn Runtime>> + Send + Sync + 'static,
{
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    let Some(line) = lines.next_line().await.map_err(CoreError::Io)? else {
        return Ok(());
    };

    let result = dispatch(&line, &handler, runtime_for.as_ref()).await;
    let response = match &result {
        Ok(()) => "OK\n".to_string(),
        Err(e) => format!("ERR {e}\n"),
    };
    writer.write_all(response.as_bytes()).await.map_err(CoreError::Io)?;
    result
}

async fn dispatch<S, F>(line: &str, handler: &HookHandler<S>, runtime_for: &F) -> CoreResult<()>
where
    S: InstanceStore + 'static,
    F: Fn(u64) -> CoreResult<Arc<dyn Runtime>>,
{
    let mut parts = line.split_whitespace();
    let hook = parts.next().ok_or_else(|| CoreError::HookInvalidTarget("empty hook line".to_string()))?;
    let instance_ref = parts.next().ok_or_else(|| CoreError::HookInvalidTarget("missing instance reference".to_string()))?;
    let instance = handler.store.get_by_name(instance_ref)?;
    let instance_id = instance.id;

    match hook {
        "start" => {
            let runtime = runtime_for(instance_id)?;
            handler.handle_start(instance_id, runtime).await
        }
        "stopns" => {
            let netns_path = parts.next().unwrap_or_default();
            handler.handle_stopns(instance_id, HookTarget::Stop, netns_path).await
        }
        "stop" => {
            let target: HookTarget = parts.next().unwrap_or("stop").parse().unwrap_or(HookTarget::Stop);
            let instance_path = parts.next().unwrap_or(".");
            handler.handle_stop(instance_id, target, Path::new(instance_path)).await.map(|_| ())
        }
        other => Err(CoreError::HookInvalidTarget(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{NoopProfileGenerator, VecEventSink};
    use crate::device::DeviceOrchestrator;
    use crate::instance::Instance;
    use crate::persistence::{InMemoryInstanceStore, StoreVolatileWriter};
    use crate::runtime_trait::test_support::NoopRuntime;

    struct NoopStorage;

    #[async_trait::async_trait]
    impl crate::collaborators::StoragePool for NoopStorage {
        async fn create_volume(&self, _name: &str) -> CoreResult<crate::collaborators::StorageVolume> {
            unimplemented!()
        }
        async fn mount_volume(&self, _name: &str) -> CoreResult<crate::collaborators::StorageVolume> {
            unimplemented!()
        }
        async fn unmount_volume(&self, _name: &str) -> CoreResult<()> {
            Ok(())
        }
        async fn delete_volume(&self, _name: &str) -> CoreResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn dispatch_resolves_instance_by_name_and_runs_the_start_hook() {
        let store = Arc::new(InMemoryInstanceStore::new());
        store.save(&Instance::new(3, "default/c1", "x86_64")).unwrap();
        let volatile = Arc::new(StoreVolatileWriter::new(store.clone()));
        let devices = Arc::new(DeviceOrchestrator::new(store.clone(), volatile.clone()));
        let handler = HookHandler::new(
            store.clone(),
            volatile,
            devices,
            Arc::new(NoopStorage),
            Arc::new(NoopProfileGenerator),
            Arc::new(VecEventSink::new()),
        );
        let runtime: Arc<dyn Runtime> = Arc::new(NoopRuntime::default());
        let runtime_for = move |_: u64| Ok(runtime.clone());

        dispatch("start default/c1", &handler, &runtime_for).await.unwrap();
        assert_eq!(store.get(3).unwrap().local_config.get("volatile.power_state").unwrap(), "RUNNING");
    }

    #[tokio::test]
    async fn dispatch_rejects_an_unknown_hook_name() {
        let store = Arc::new(InMemoryInstanceStore::new());
        store.save(&Instance::new(1, "default/c1", "x86_64")).unwrap();
        let volatile = Arc::new(StoreVolatileWriter::new(store.clone()));
        let devices = Arc::new(DeviceOrchestrator::new(store.clone(), volatile.clone()));
        let handler = HookHandler::new(
            store,
            volatile,
            devices,
            Arc::new(NoopStorage),
            Arc::new(NoopProfileGenerator),
            Arc::new(VecEventSink::new()),
        );
        let runtime_for = |_: u64| -> CoreResult<Arc<dyn Runtime>> { unreachable!() };

        let err = dispatch("reboot default/c1", &handler, &runtime_for).await.unwrap_err();
        assert!(matches!(err, CoreError::HookInvalidTarget(_)));
    }
}

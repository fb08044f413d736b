//! Host interface registration for component linkers.
//!
//! Each function a quest component imports is backed by the agent's
//! [`HostCapabilities`](quest_sandbox_core::HostCapabilities), so a call
//! from wasm becomes a bridge request or event exactly like a call from a
//! script adapter.

use std::future::Future;

use tracing::trace;
use wasmtime::StoreContextMut;
use wasmtime::component::{ComponentType, Lift, Linker, Lower};

use quest_sandbox_common::EngineError;

use crate::store::AgentContext;

/// `component:quest-v1/engine-types.status`
#[derive(ComponentType, Lift, Lower, Clone, Copy, Debug, PartialEq, Eq)]
#[component(enum)]
#[repr(u8)]
pub enum Status {
    #[component(name = "pending")]
    Pending,
    #[component(name = "in-progress")]
    InProgress,
    #[component(name = "completed")]
    Completed,
    #[component(name = "failed")]
    Failed,
}

impl Status {
    /// The wire spelling used by `quest.updateTask`.
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::InProgress => "in-progress",
            Status::Completed => "completed",
            Status::Failed => "failed",
        }
    }
}

type HostFuture<'a, R> = Box<dyn Future<Output = wasmtime::Result<R>> + Send + 'a>;

/// Register every host interface and WASI on `linker`.
///
/// # Errors
///
/// Returns an error if a function is defined twice.
pub fn register_host_interfaces(linker: &mut Linker<AgentContext>) -> Result<(), EngineError> {
    register_quest(linker).map_err(|e| registration_failed(&e))?;
    register_agent(linker).map_err(|e| registration_failed(&e))?;
    wasmtime_wasi::add_to_linker_async(linker).map_err(|e| registration_failed(&e))?;
    Ok(())
}

fn registration_failed(e: &wasmtime::Error) -> EngineError {
    EngineError::invalid_config(format!("Failed to register host interfaces: {e}"))
}

/// `component:quest-v1/*`
pub fn register_quest(linker: &mut Linker<AgentContext>) -> wasmtime::Result<()> {
    // Only carries the `status` type; nothing to define.
    linker.instance("component:quest-v1/engine-types")?;

    let mut console = linker.instance("component:quest-v1/host-console")?;
    console.func_wrap_async("log", log)?;

    let mut manager = linker.instance("component:quest-v1/host-quest-manager")?;
    manager.func_wrap_async(
        "register-task",
        |ctx: StoreContextMut<'_, AgentContext>,
         (quest_id, task_id, description): (String, String, String)|
         -> HostFuture<'_, ()> {
            let caps = ctx.data().capabilities.clone();
            Box::new(async move {
                caps.quest()
                    .register_task(&quest_id, &task_id, &description)
                    .await;
                Ok(())
            })
        },
    )?;
    manager.func_wrap_async(
        "update-task",
        |ctx: StoreContextMut<'_, AgentContext>,
         (quest_id, task_id, status): (String, String, Status)|
         -> HostFuture<'_, ()> {
            let caps = ctx.data().capabilities.clone();
            Box::new(async move {
                caps.quest()
                    .update_task(&quest_id, &task_id, status.as_str())
                    .await;
                Ok(())
            })
        },
    )?;
    manager.func_wrap_async(
        "notify-player",
        |ctx: StoreContextMut<'_, AgentContext>, (message,): (String,)| -> HostFuture<'_, ()> {
            let caps = ctx.data().capabilities.clone();
            Box::new(async move {
                caps.quest().notify_player(&message).await;
                Ok(())
            })
        },
    )?;

    let mut events = linker.instance("component:quest-v1/host-events")?;
    events.func_wrap_async(
        "get-current-url",
        |ctx: StoreContextMut<'_, AgentContext>, (): ()| -> HostFuture<'_, (String,)> {
            let caps = ctx.data().capabilities.clone();
            Box::new(async move { Ok((caps.quest().get_current_url().await,)) })
        },
    )?;

    let mut content = linker.instance("component:quest-v1/host-content")?;
    content.func_wrap_async(
        "register-item",
        |ctx: StoreContextMut<'_, AgentContext>,
         (id, url, title, kind): (String, String, String, String)|
         -> HostFuture<'_, ()> {
            let caps = ctx.data().capabilities.clone();
            Box::new(async move {
                caps.quest().register_item(&id, &url, &title, &kind).await;
                Ok(())
            })
        },
    )?;

    Ok(())
}

/// `component:agent/*`
pub fn register_agent(linker: &mut Linker<AgentContext>) -> wasmtime::Result<()> {
    let mut capabilities = linker.instance("component:agent/host-capabilities")?;
    capabilities.func_wrap_async(
        "ask",
        |ctx: StoreContextMut<'_, AgentContext>, (prompt,): (String,)| -> HostFuture<'_, (String,)> {
            let caps = ctx.data().capabilities.clone();
            Box::new(async move { Ok((caps.ask(&prompt).await,)) })
        },
    )?;

    let mut console = linker.instance("component:agent/host-console")?;
    console.func_wrap_async("log", log)?;

    Ok(())
}

fn log(ctx: StoreContextMut<'_, AgentContext>, (message,): (String,)) -> HostFuture<'_, ()> {
    let caps = &ctx.data().capabilities;
    trace!(instance_id = caps.instance_id(), "guest log");
    caps.log(&message);
    Box::new(async { Ok(()) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WasmEngine;
    use quest_sandbox_common::EngineConfig;

    #[test]
    fn test_register_host_interfaces() {
        let engine = WasmEngine::new(&EngineConfig::default()).unwrap();
        let mut linker = Linker::new(engine.inner());

        assert!(register_host_interfaces(&mut linker).is_ok());
    }

    #[test]
    fn test_double_registration_fails() {
        let engine = WasmEngine::new(&EngineConfig::default()).unwrap();
        let mut linker = Linker::new(engine.inner());

        register_quest(&mut linker).unwrap();
        assert!(register_quest(&mut linker).is_err());
    }

    #[test]
    fn test_status_spelling() {
        assert_eq!(Status::InProgress.as_str(), "in-progress");
        assert_eq!(Status::Completed.as_str(), "completed");
    }
}

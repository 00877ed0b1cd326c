//! Shared runtime state for the router: every collaborator a dispatched
//! message might need, held behind `Arc` so a spawned `brain.run.start` task
//! can clone what it needs and outlive the request that started it.

use std::sync::Arc;

use tabline_agent::ToolDispatcher;
use tabline_core::{InMemoryStore, SessionStore};
use tabline_llm::{LlmHook, LlmProvider, NoopHook, OpenAiCompatibleProvider};
use tabline_infra::InfraHandler;

use crate::events::EventHub;
use crate::hooks::{NoopRouteHook, RouteHook};
use crate::registry::SessionRuntimeRegistry;

pub struct AppState {
    pub infra: Arc<InfraHandler>,
    pub store: Arc<dyn SessionStore>,
    pub provider: Arc<dyn LlmProvider>,
    pub llm_hook: Arc<dyn LlmHook>,
    pub dispatcher: Arc<ToolDispatcher>,
    pub registry: SessionRuntimeRegistry,
    pub events: Arc<EventHub>,
    pub route_hook: Arc<dyn RouteHook>,
}

impl AppState {
    pub fn new(infra: Arc<InfraHandler>, llm_api_base: String, llm_api_key: String) -> Self {
        let dispatcher = Arc::new(ToolDispatcher::new(infra.clone()));
        Self {
            infra,
            store: Arc::new(InMemoryStore::new()),
            provider: Arc::new(OpenAiCompatibleProvider::new(llm_api_base, llm_api_key)),
            llm_hook: Arc::new(NoopHook),
            dispatcher,
            registry: SessionRuntimeRegistry::new(),
            events: Arc::new(EventHub::new()),
            route_hook: Arc::new(NoopRouteHook),
        }
    }
}

//! The runtime router (SPEC_FULL §4.5): a single WebSocket protocol that
//! fronts the config/bridge/lease/cdp surface (C1), the agent run loop (C4),
//! and the session store, plus a bounded per-session event buffer.

pub mod app;
pub mod dispatch;
pub mod events;
pub mod hooks;
pub mod registry;
pub mod server;
pub mod ws;

pub use app::AppState;
pub use dispatch::route_message;
pub use server::build_router;
pub use ws::handle_connection;

//! Infra Handler (C1): bridge client, CDP transport, tab leases, interactive
//! snapshots, action execution, and verification (SPEC_FULL §4.1).

pub mod action;
pub mod bridge;
pub mod cdp;
pub mod handler;
pub mod lease;
pub mod snapshot;
pub mod verify;

pub use action::{execute_action, ActionKind, ActionRequest, ActionResult};
pub use bridge::{resolve_invoke_timeout_ms, BridgeClient};
pub use cdp::CdpRegistry;
pub use handler::{InfraHandler, SnapshotResponse};
pub use lease::LeaseTable;
pub use snapshot::{NodeDescriptor, Snapshot, SnapshotQuery, SnapshotStore};
pub use verify::{verify, Expectation, Observation, VerifyRequest, VerifyResult};

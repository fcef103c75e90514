//! # tandem-sync: real-time room synchronization for shared documents
//!
//! Clients attach to a named room, receive the room's current text, and see
//! each other's whole-document edits with last-writer-wins semantics.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐    WebSocket     ┌──────────────────────────────────┐
//! │ SyncClient  │ ◄──────────────► │ SyncServer (connection tasks)    │
//! │ (per user)  │    JSON frames   └───────────────┬──────────────────┘
//! └─────────────┘                                  │ HubEvent (mpsc)
//!                                                  ▼
//!                                  ┌──────────────────────────────────┐
//!                                  │ SyncHandler (single hub task)    │
//!                                  │  ├── SessionStore   room → text  │
//!                                  │  ├── ConnectionRegistry          │
//!                                  │  └── Dispatcher     fan-out      │
//!                                  └──────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire messages, room keys, connection ids
//! - [`store`]: authoritative room text
//! - [`registry`]: connection ↔ room membership
//! - [`broadcast`]: bounded per-connection delivery
//! - [`handler`]: join / edit / disconnect state machine
//! - [`exec`]: opaque code-execution collaborator
//! - [`server`]: WebSocket server and hub loop
//! - [`client`]: WebSocket client

pub mod protocol;
pub mod store;
pub mod registry;
pub mod broadcast;
pub mod handler;
pub mod exec;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use protocol::{
    ClientMessage, ConnectionId, MessageKind, ProtocolError, RoomKey, ServerMessage,
    StatusReport, DEFAULT_ROOM_TEXT,
};
pub use store::{Ensured, SessionStore};
pub use registry::ConnectionRegistry;
pub use broadcast::{DispatchStats, Dispatcher, Frame};
pub use handler::{ConnectionPhase, JoinOutcome, SyncHandler};
pub use exec::{CodeExecutor, ExecutionOutput, ExecutionRequest, UnconfiguredExecutor};
pub use server::{ServerConfig, ServerError, ServerStats, SyncServer};
pub use client::{ConnectionState, SyncClient, SyncEvent};

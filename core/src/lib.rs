/// Inbox Sync - realtime conversation list and unread-state engine
///
/// Keeps a signed-in identity's conversation list and unread markers in step
/// with a remote store: snapshot pulls triggered by realtime change events,
/// identity-scoped subscriptions, and a view-model for the list screen.

pub mod error;
pub mod config;
pub mod types;
pub mod identity;
pub mod remote;
pub mod subscriber;
pub mod projector;
pub mod unread;
pub mod engine;
pub mod view_model;
pub mod memory;
pub mod api;

pub use error::{Result, SyncError};
pub use config::Config;
pub use engine::{Collaborators, EngineHandle, EngineStatus, SyncEngine};
pub use memory::MemoryRemote;

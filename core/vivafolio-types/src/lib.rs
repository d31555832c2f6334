//! Core type definitions for Vivafolio block hosts.
//!
//! This crate defines the data that crosses the boundary between the
//! notification producer, the block host, and the blocks themselves:
//! - Entities and entity graphs (replace-not-merge on every notification)
//! - Block notifications and their resources
//! - Outbound entity updates
//! - Hook protocol messages for nested block embedding
//!
//! Rendering, sandboxing and loading live in `vivafolio-block-host`.

mod entity;
mod hook;
mod ids;
mod notification;

pub use entity::{Entity, EntityGraph, EntityUpdate, LinkRecord};
pub use hook::{EMBED_ENTITY_HOOK, HookData, HookError, HookErrorCode, HookResponse};
pub use ids::NodeId;
pub use notification::{
    BLOCK_TYPE_URL_PREFIX, BlockNotification, BlockResource, DisplayMode, NotificationReader,
    Position, Range, block_type_name, block_type_url,
};

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("duplicate entity id in graph: {0}")]
    DuplicateEntity(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

//! Error types for the block host.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BlockLoaderError {
    #[error("resource not found: {0}")]
    MissingResource(String),

    #[error("block '{block_id}' has no bundle or template entry")]
    NoEntry { block_id: String },

    #[error("failed to fetch {url}: {message}")]
    Fetch { url: String, message: String },

    #[error("dependency '{specifier}' is not in the allowlist (block '{block_id}')")]
    BlockedDependency { block_id: String, specifier: String },

    #[error("cannot resolve '{specifier}' for block '{block_id}': {reason}")]
    UnresolvedDependency {
        block_id: String,
        specifier: String,
        reason: String,
    },

    #[error("wasm compilation error: {0}")]
    Compilation(#[from] wasmtime::Error),

    #[error("block '{block_id}' failed during {stage}: {message}")]
    Evaluation {
        block_id: String,
        stage: String,
        message: String,
    },

    #[error("block '{block_id}' exports no renderable component")]
    NoRenderableExport { block_id: String },

    #[error("entity '{entity_id}' not found in the current entity graph")]
    EntityNotFound { entity_id: String },

    #[error("nested block for entity '{entity_id}' refused: {reason}")]
    NestingRefused { entity_id: String, reason: String },

    #[error("hook for entity '{entity_id}' issued while its block was already handling a hook")]
    HookReentered { entity_id: String },

    #[error("block '{0}' has been destroyed")]
    Destroyed(String),

    #[error("block '{0}' has not been loaded")]
    NotLoaded(String),

    #[error("block '{block_id}' may not modify {node}")]
    NodeAccessDenied {
        block_id: String,
        node: vivafolio_types::NodeId,
    },

    #[error("render tree error: {0}")]
    Dom(#[from] crate::dom::DomError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid notification: {0}")]
    InvalidNotification(#[from] vivafolio_types::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl BlockLoaderError {
    /// True for the sandbox-violation class of errors.
    pub fn is_blocked_dependency(&self) -> bool {
        matches!(self, Self::BlockedDependency { .. })
    }

    /// Recovers a host error that travelled through a wasm trap, or wraps the
    /// trap as an evaluation failure of `stage`.
    pub(crate) fn from_trap(block_id: &str, stage: &str, err: wasmtime::Error) -> Self {
        match err.downcast::<BlockLoaderError>() {
            Ok(inner) => inner,
            Err(err) => Self::Evaluation {
                block_id: block_id.to_string(),
                stage: stage.to_string(),
                message: format!("{err:#}"),
            },
        }
    }
}

//! Hook protocol messages exchanged between a mounted block and its host.

use serde::{Deserialize, Serialize};

use crate::NodeId;

/// Hook type dedicated to embedding a block for another entity.
pub const EMBED_ENTITY_HOOK: &str = "vivafolio:embed:entity";

/// A hook request sent by a mounted block.
///
/// `node == None` asks the host to tear down a previously granted hook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookData {
    #[serde(rename = "type")]
    pub hook_type: String,
    pub entity_id: String,
    pub node: Option<NodeId>,
    #[serde(default)]
    pub path: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hook_id: Option<String>,
}

impl HookData {
    pub fn embed(entity_id: impl Into<String>, node: NodeId) -> Self {
        Self {
            hook_type: EMBED_ENTITY_HOOK.to_string(),
            entity_id: entity_id.into(),
            node: Some(node),
            path: Vec::new(),
            hook_id: None,
        }
    }

    pub fn teardown(entity_id: impl Into<String>, hook_id: Option<String>) -> Self {
        Self {
            hook_type: EMBED_ENTITY_HOOK.to_string(),
            entity_id: entity_id.into(),
            node: None,
            path: Vec::new(),
            hook_id,
        }
    }

    pub fn is_teardown(&self) -> bool {
        self.node.is_none()
    }
}

/// Block Protocol error codes carried in hook responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HookErrorCode {
    NotImplemented,
    NotFound,
    InvalidInput,
    Forbidden,
    InternalError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookError {
    pub code: HookErrorCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Response to a hook request: either the granted hook id or a list of errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HookResponse {
    #[serde(rename_all = "camelCase")]
    Granted { hook_id: String },
    Errors { errors: Vec<HookError> },
}

impl HookResponse {
    pub fn granted(hook_id: impl Into<String>) -> Self {
        Self::Granted {
            hook_id: hook_id.into(),
        }
    }

    pub fn error(code: HookErrorCode, message: impl Into<String>) -> Self {
        Self::Errors {
            errors: vec![HookError {
                code,
                message: Some(message.into()),
            }],
        }
    }

    pub fn not_implemented(hook_type: &str) -> Self {
        Self::error(
            HookErrorCode::NotImplemented,
            format!("hook type '{hook_type}' is not implemented"),
        )
    }

    pub fn hook_id(&self) -> Option<&str> {
        match self {
            Self::Granted { hook_id } => Some(hook_id),
            Self::Errors { .. } => None,
        }
    }

    /// First error code, if this is an error response.
    pub fn error_code(&self) -> Option<HookErrorCode> {
        match self {
            Self::Granted { .. } => None,
            Self::Errors { errors } => errors.first().map(|e| e.code),
        }
    }
}

//! Handles for nodes in a host's render tree.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque handle to a renderable node owned by the host document.
///
/// Blocks never see node contents, only these handles, which they pass back
/// to host functions and hook messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(u32);

impl NodeId {
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn as_raw(&self) -> u32 {
        self.0
    }

    /// Converts a handle received from a guest (`i32` on the wasm ABI).
    /// Negative values are never valid handles.
    #[must_use]
    pub fn from_guest(raw: i32) -> Option<Self> {
        u32::try_from(raw).ok().map(Self)
    }

    /// Handle as passed to a guest.
    #[must_use]
    pub fn to_guest(&self) -> i32 {
        self.0 as i32
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

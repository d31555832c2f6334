//! Block notifications: the payload describing one block mount.

use serde::{Deserialize, Serialize};
use std::io::BufRead;
use tracing::warn;

use crate::{EntityGraph, Error};

/// Prefix of Block Protocol block type URLs.
pub const BLOCK_TYPE_URL_PREFIX: &str = "https://blockprotocol.org/@blockprotocol/types/block-type/";

/// Builds the canonical block type URL for a short block name.
pub fn block_type_url(name: &str) -> String {
    format!("{BLOCK_TYPE_URL_PREFIX}{name}/")
}

/// Extracts the short block name from a block type URL. Values that are not
/// Block Protocol URLs are returned unchanged.
pub fn block_type_name(block_type: &str) -> &str {
    block_type
        .strip_prefix(BLOCK_TYPE_URL_PREFIX)
        .map(|rest| rest.trim_end_matches('/'))
        .unwrap_or(block_type)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DisplayMode {
    #[default]
    MultiLine,
    Inline,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

/// A fetchable resource, addressed by `logical_name` within one notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockResource {
    pub logical_name: String,
    pub physical_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caching_tag: Option<String>,
}

impl BlockResource {
    pub fn new(logical_name: impl Into<String>, physical_path: impl Into<String>) -> Self {
        Self {
            logical_name: logical_name.into(),
            physical_path: physical_path.into(),
            caching_tag: None,
        }
    }

    pub fn with_caching_tag(mut self, tag: impl Into<String>) -> Self {
        self.caching_tag = Some(tag.into());
        self
    }

    /// Lower-cased extension of the logical name, if any.
    pub fn extension(&self) -> Option<String> {
        let name = self.logical_name.rsplit('/').next()?;
        let (stem, ext) = name.rsplit_once('.')?;
        if stem.is_empty() {
            return None;
        }
        Some(ext.to_ascii_lowercase())
    }
}

/// One notification fully describes one block mount. A later notification
/// with the same `block_id` is an update, not a new mount.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockNotification {
    pub block_id: String,
    pub block_type: String,
    #[serde(default)]
    pub display_mode: DisplayMode,
    #[serde(default)]
    pub source_uri: String,
    #[serde(default)]
    pub range: Range,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub resources: Vec<BlockResource>,
    #[serde(default)]
    pub entity_graph: EntityGraph,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supports_hot_reload: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_height: Option<u32>,
}

impl BlockNotification {
    /// Parses one JSON line as emitted by a notification producer.
    pub fn from_json_line(line: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(line.trim())?)
    }

    pub fn resource(&self, logical_name: &str) -> Option<&BlockResource> {
        self.resources.iter().find(|r| r.logical_name == logical_name)
    }

    pub fn has_resource(&self, logical_name: &str) -> bool {
        self.resource(logical_name).is_some()
    }

    /// The block entity id: the explicit `entity_id`, or else the first
    /// entity of the graph.
    pub fn block_entity_id(&self) -> Option<&str> {
        self.entity_id
            .as_deref()
            .or_else(|| self.entity_graph.entities.first().map(|e| e.entity_id.as_str()))
    }
}

/// Iterates notifications from a JSON-lines stream.
///
/// Blank lines are skipped. Lines that fail to parse are logged and skipped
/// so one malformed producer line does not stall the stream.
pub struct NotificationReader<R> {
    reader: R,
    line: String,
}

impl<R: BufRead> NotificationReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: String::new(),
        }
    }
}

impl<R: BufRead> Iterator for NotificationReader<R> {
    type Item = Result<BlockNotification, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.line.clear();
            match self.reader.read_line(&mut self.line) {
                Ok(0) => return None,
                Ok(_) => {}
                Err(e) => return Some(Err(Error::Io(e))),
            }
            if self.line.trim().is_empty() {
                continue;
            }
            match BlockNotification::from_json_line(&self.line) {
                Ok(n) => return Some(Ok(n)),
                Err(e) => {
                    warn!(error = %e, "Skipping malformed notification line");
                }
            }
        }
    }
}

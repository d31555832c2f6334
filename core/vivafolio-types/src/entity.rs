use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

use crate::Error;

/// A record in the entity graph.
///
/// `properties` is opaque to the host; its shape is owned by whichever
/// collaborator last wrote it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub entity_id: String,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

impl Entity {
    pub fn new(entity_id: impl Into<String>, properties: Map<String, Value>) -> Self {
        Self {
            entity_id: entity_id.into(),
            properties,
        }
    }

    /// Builds an entity from a JSON object literal. Non-object values yield
    /// an entity with no properties.
    pub fn from_json(entity_id: impl Into<String>, properties: Value) -> Self {
        let properties = match properties {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self::new(entity_id, properties)
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    /// Extract a string value from `properties` using a JSON pointer (e.g., "/title").
    pub fn get_str(&self, pointer: &str) -> Option<&str> {
        self.pointer(pointer).and_then(|v| v.as_str())
    }

    /// Extract a boolean value from `properties` using a JSON pointer.
    pub fn get_bool(&self, pointer: &str) -> Option<bool> {
        self.pointer(pointer).and_then(|v| v.as_bool())
    }

    pub fn has_properties(&self, keys: &[&str]) -> bool {
        keys.iter().all(|k| self.properties.contains_key(*k))
    }

    fn pointer(&self, pointer: &str) -> Option<&Value> {
        let mut parts = pointer.strip_prefix('/')?.splitn(2, '/');
        let head = parts.next()?;
        let value = self.properties.get(head)?;
        match parts.next() {
            Some(rest) => value.pointer(&format!("/{rest}")),
            None => Some(value),
        }
    }
}

/// A link between two entities. Links are carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_entity_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_entity_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_type: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Entities plus links, supplied wholesale with every notification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityGraph {
    #[serde(default)]
    pub entities: Vec<Entity>,
    #[serde(default)]
    pub links: Vec<LinkRecord>,
}

impl EntityGraph {
    /// Graph holding a single entity and no links.
    pub fn single(entity_id: impl Into<String>, properties: Value) -> Self {
        Self {
            entities: vec![Entity::from_json(entity_id, properties)],
            links: Vec::new(),
        }
    }

    pub fn entity(&self, entity_id: &str) -> Option<&Entity> {
        self.entities.iter().find(|e| e.entity_id == entity_id)
    }

    pub fn entity_mut(&mut self, entity_id: &str) -> Option<&mut Entity> {
        self.entities.iter_mut().find(|e| e.entity_id == entity_id)
    }

    pub fn contains(&self, entity_id: &str) -> bool {
        self.entity(entity_id).is_some()
    }

    /// Checks that every entity id appears at most once.
    pub fn validate(&self) -> Result<(), Error> {
        let mut seen = HashSet::with_capacity(self.entities.len());
        for entity in &self.entities {
            if !seen.insert(entity.entity_id.as_str()) {
                return Err(Error::DuplicateEntity(entity.entity_id.clone()));
            }
        }
        Ok(())
    }

    /// Subgraph made of one entity and the links touching it.
    pub fn subgraph_for(&self, entity_id: &str) -> EntityGraph {
        let entities = self.entity(entity_id).cloned().into_iter().collect();
        let links = self
            .links
            .iter()
            .filter(|l| {
                l.source_entity_id.as_deref() == Some(entity_id)
                    || l.destination_entity_id.as_deref() == Some(entity_id)
            })
            .cloned()
            .collect();
        EntityGraph { entities, links }
    }
}

/// Outbound property change requested by a mounted block.
/// The embedding host turns this into a new notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityUpdate {
    pub entity_id: String,
    pub properties: Map<String, Value>,
}

impl EntityUpdate {
    pub fn new(entity_id: impl Into<String>, properties: Map<String, Value>) -> Self {
        Self {
            entity_id: entity_id.into(),
            properties,
        }
    }
}

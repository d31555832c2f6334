//! Entity typing for nested blocks, and the block resources registry used
//! to build their synthetic notifications.

use std::cell::RefCell;
use std::collections::HashMap;
use vivafolio_types::{BlockResource, Entity, block_type_url};

pub const PERSON_ENTITY_TYPE: &str = "person";
pub const TASK_ENTITY_TYPE: &str = "task";
pub const GENERIC_ENTITY_TYPE: &str = "generic";

/// Derives an entity type identifier for an entity.
pub trait EntityClassifier {
    fn classify(&self, entity: &Entity) -> String;
}

/// Infers the type from property shape: `name` + `email` is a person,
/// `title` + `status` is a task, anything else is generic.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeuristicClassifier;

impl EntityClassifier for HeuristicClassifier {
    fn classify(&self, entity: &Entity) -> String {
        let entity_type = if entity.has_properties(&["name", "email"]) {
            PERSON_ENTITY_TYPE
        } else if entity.has_properties(&["title", "status"]) {
            TASK_ENTITY_TYPE
        } else {
            GENERIC_ENTITY_TYPE
        };
        entity_type.to_string()
    }
}

impl<F> EntityClassifier for F
where
    F: Fn(&Entity) -> String,
{
    fn classify(&self, entity: &Entity) -> String {
        self(entity)
    }
}

const BLOCK_TYPES: &[(&str, &str)] = &[
    (PERSON_ENTITY_TYPE, "person-chip"),
    (TASK_ENTITY_TYPE, "task-card"),
];

const FALLBACK_BLOCK: &str = "entity-card";

/// Block type URL rendering entities of `entity_type_id`.
pub fn block_type_for(entity_type_id: &str) -> String {
    let name = BLOCK_TYPES
        .iter()
        .find(|(ty, _)| *ty == entity_type_id)
        .map(|(_, block)| *block)
        .unwrap_or(FALLBACK_BLOCK);
    block_type_url(name)
}

/// Resources available for each block type.
#[derive(Debug, Default)]
pub struct BlockRegistry {
    blocks: RefCell<HashMap<String, Vec<BlockResource>>>,
}

impl BlockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the resources of a block type URL.
    pub fn register(&self, block_type: impl Into<String>, resources: Vec<BlockResource>) {
        self.blocks.borrow_mut().insert(block_type.into(), resources);
    }

    /// Resources of `block_type`; empty when unknown.
    pub fn resources_for(&self, block_type: &str) -> Vec<BlockResource> {
        self.blocks
            .borrow()
            .get(block_type)
            .cloned()
            .unwrap_or_default()
    }

    pub fn contains(&self, block_type: &str) -> bool {
        self.blocks.borrow().contains_key(block_type)
    }

    pub fn len(&self) -> usize {
        self.blocks.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.borrow().is_empty()
    }
}

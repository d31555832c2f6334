//! The data a block renders from, shared between its loader and its sandbox.
//!
//! Render and update calls read the view at call time, so whichever
//! notification was applied last is what the guest sees.

use serde::Serialize;
use vivafolio_types::{BlockNotification, Entity, EntityGraph};

#[derive(Debug, Clone, Default)]
pub struct BlockView {
    pub block_entity: Entity,
    pub graph: EntityGraph,
    pub readonly: bool,
    /// Bumped on every applied notification or entity refresh.
    pub generation: u64,
}

impl BlockView {
    pub fn from_notification(notification: &BlockNotification, readonly: bool) -> Self {
        let mut view = Self {
            readonly,
            ..Self::default()
        };
        view.apply(notification);
        view
    }

    /// Replaces entity and graph with the notification's.
    pub fn apply(&mut self, notification: &BlockNotification) {
        let entity_id = notification.block_entity_id().unwrap_or_default();
        self.block_entity = notification
            .entity_graph
            .entity(entity_id)
            .cloned()
            .unwrap_or_else(|| Entity::new(entity_id, Default::default()));
        self.graph = notification.entity_graph.clone();
        self.generation += 1;
    }

    /// Replaces a single entity, e.g. after a shared-graph publish.
    pub fn refresh_entity(&mut self, entity: &Entity) {
        if self.block_entity.entity_id == entity.entity_id {
            self.block_entity = entity.clone();
        }
        if let Some(existing) = self.graph.entity_mut(&entity.entity_id) {
            *existing = entity.clone();
        }
        self.generation += 1;
    }

    pub fn props(&self) -> BlockProps {
        BlockProps {
            entity: self.block_entity.clone(),
            readonly: self.readonly,
            graph: GraphProps {
                block_entity: self.block_entity.clone(),
                block_graph: self.graph.subgraph_for(&self.block_entity.entity_id),
                readonly: self.readonly,
            },
        }
    }
}

/// Props handed to components. Both the flat (`entity`, `readonly`) and the
/// nested graph (`graph.blockEntity`, `graph.readonly`) shapes are present.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockProps {
    pub entity: Entity,
    pub readonly: bool,
    pub graph: GraphProps,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphProps {
    pub block_entity: Entity,
    pub block_graph: EntityGraph,
    pub readonly: bool,
}

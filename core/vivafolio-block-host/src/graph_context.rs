//! Read-mostly view of the entity graphs of every top-level block, with
//! per-entity subscriptions for nested blocks.

use crate::sandbox::UpdateCallback;
use serde_json::{Map, Value};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use tracing::debug;
use vivafolio_types::{Entity, EntityGraph, EntityUpdate};

type Subscriber = Rc<dyn Fn(&EntityUpdate)>;

pub struct SharedGraphContext {
    /// Graphs by top-level block id, most recently set first.
    graphs: RefCell<Vec<(String, EntityGraph)>>,
    subscribers: RefCell<HashMap<String, Vec<(u64, Subscriber)>>>,
    next_subscription: Cell<u64>,
    /// Where updates made through the context are forwarded.
    channel: RefCell<Option<UpdateCallback>>,
}

impl SharedGraphContext {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            graphs: RefCell::new(Vec::new()),
            subscribers: RefCell::new(HashMap::new()),
            next_subscription: Cell::new(1),
            channel: RefCell::new(None),
        })
    }

    /// Sets the default update channel used by `update_entity`.
    pub fn set_update_channel(&self, channel: Option<UpdateCallback>) {
        *self.channel.borrow_mut() = channel;
    }

    /// Replaces the graph contributed by one top-level block.
    pub fn set_graph(&self, block_id: &str, graph: EntityGraph) {
        let mut graphs = self.graphs.borrow_mut();
        graphs.retain(|(id, _)| id != block_id);
        graphs.insert(0, (block_id.to_string(), graph));
    }

    pub fn remove_graph(&self, block_id: &str) {
        self.graphs.borrow_mut().retain(|(id, _)| id != block_id);
    }

    pub fn get_entity(&self, entity_id: &str) -> Option<Entity> {
        self.graphs
            .borrow()
            .iter()
            .find_map(|(_, graph)| graph.entity(entity_id).cloned())
    }

    /// Forwards an update through the default channel and to subscribers.
    pub fn update_entity(&self, entity_id: &str, properties: Map<String, Value>) {
        let channel = self.channel.borrow().clone();
        self.publish(&EntityUpdate::new(entity_id, properties), channel.as_ref());
    }

    /// Delivers an update to `sink` (if any), then to every subscriber of
    /// the entity. Subscribers may subscribe or unsubscribe while notified.
    pub fn publish(&self, update: &EntityUpdate, sink: Option<&UpdateCallback>) {
        if let Some(sink) = sink {
            sink(update);
        }
        let targets: Vec<Subscriber> = self
            .subscribers
            .borrow()
            .get(&update.entity_id)
            .map(|subs| subs.iter().map(|(_, s)| s.clone()).collect())
            .unwrap_or_default();
        debug!(entity_id = %update.entity_id, subscribers = targets.len(), "Publishing entity update");
        for subscriber in targets {
            subscriber(update);
        }
    }

    pub fn subscribe_to_entity(
        self: &Rc<Self>,
        entity_id: &str,
        callback: impl Fn(&EntityUpdate) + 'static,
    ) -> Subscription {
        let id = self.next_subscription.get();
        self.next_subscription.set(id + 1);
        self.subscribers
            .borrow_mut()
            .entry(entity_id.to_string())
            .or_default()
            .push((id, Rc::new(callback)));
        Subscription {
            id,
            entity_id: entity_id.to_string(),
            context: Rc::downgrade(self),
        }
    }

    pub fn subscriber_count(&self, entity_id: &str) -> usize {
        self.subscribers.borrow().get(entity_id).map_or(0, Vec::len)
    }

    fn unsubscribe(&self, entity_id: &str, id: u64) {
        let mut subscribers = self.subscribers.borrow_mut();
        if let Some(subs) = subscribers.get_mut(entity_id) {
            subs.retain(|(sub_id, _)| *sub_id != id);
            if subs.is_empty() {
                subscribers.remove(entity_id);
            }
        }
    }
}

/// Unsubscribes when dropped.
pub struct Subscription {
    id: u64,
    entity_id: String,
    context: Weak<SharedGraphContext>,
}

impl Subscription {
    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(context) = self.context.upgrade() {
            context.unsubscribe(&self.entity_id, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn props(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn most_recent_graph_wins() {
        let ctx = SharedGraphContext::new();
        ctx.set_graph("a", EntityGraph::single("e1", json!({"v": 1})));
        ctx.set_graph("b", EntityGraph::single("e1", json!({"v": 2})));
        assert_eq!(ctx.get_entity("e1").unwrap().property("v"), Some(&json!(2)));
        ctx.remove_graph("b");
        assert_eq!(ctx.get_entity("e1").unwrap().property("v"), Some(&json!(1)));
        assert!(ctx.get_entity("zzz").is_none());
    }

    #[test]
    fn update_reaches_channel_and_subscribers() {
        let ctx = SharedGraphContext::new();
        let channel_hits = Rc::new(Cell::new(0));
        let hits = channel_hits.clone();
        ctx.set_update_channel(Some(Rc::new(move |_: &EntityUpdate| hits.set(hits.get() + 1))));

        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let _sub = ctx.subscribe_to_entity("e1", move |u| sink.borrow_mut().push(u.clone()));

        ctx.update_entity("e1", props(json!({"status": "done"})));
        ctx.update_entity("e2", props(json!({})));

        assert_eq!(channel_hits.get(), 2);
        assert_eq!(seen.borrow().len(), 1);
        assert_eq!(seen.borrow()[0].properties["status"], json!("done"));
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let ctx = SharedGraphContext::new();
        let sub = ctx.subscribe_to_entity("e1", |_| {});
        let other = ctx.subscribe_to_entity("e1", |_| {});
        assert_eq!(ctx.subscriber_count("e1"), 2);
        sub.unsubscribe();
        assert_eq!(ctx.subscriber_count("e1"), 1);
        drop(other);
        assert_eq!(ctx.subscriber_count("e1"), 0);
    }

    #[test]
    fn subscriber_may_unsubscribe_during_publish() {
        let ctx = SharedGraphContext::new();
        let slot: Rc<RefCell<Option<Subscription>>> = Rc::new(RefCell::new(None));
        let inner = slot.clone();
        let sub = ctx.subscribe_to_entity("e1", move |_| {
            inner.borrow_mut().take();
        });
        *slot.borrow_mut() = Some(sub);
        ctx.update_entity("e1", Map::new());
        assert_eq!(ctx.subscriber_count("e1"), 0);
    }
}

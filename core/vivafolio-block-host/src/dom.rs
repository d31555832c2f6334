//! Arena-backed render tree shared by every block mounted in one surface.
//!
//! Blocks only ever hold `NodeId` handles. A removed node frees its whole
//! subtree; later use of a freed id is a no-op (or `None`), never a panic,
//! so a guest holding a stale handle cannot corrupt the tree.
//!
//! Freed slots are reused. A handle packs the slot index with the slot's
//! generation, which is bumped on every free, so a stale handle never
//! aliases the node that took its slot. A slot whose generation is
//! exhausted is retired instead of reused.

use std::fmt::Write as _;
use thiserror::Error;
use vivafolio_types::NodeId;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DomError {
    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    #[error("{0} cannot have children")]
    NotAnElement(NodeId),

    #[error("appending {child} under {parent} would create a cycle")]
    Cycle { parent: NodeId, child: NodeId },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Element {
        tag: String,
        attributes: Vec<(String, String)>,
    },
    Text(String),
    /// Pre-rendered markup injected verbatim (template blocks).
    Raw(String),
}

#[derive(Debug)]
struct NodeData {
    kind: NodeKind,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

const INDEX_BITS: u32 = 21;
const INDEX_MASK: u32 = (1 << INDEX_BITS) - 1;
/// Keeps packed handles below 2^31 so they stay positive guest `i32`s.
const MAX_GENERATION: u32 = (1 << (31 - INDEX_BITS)) - 1;

#[derive(Debug)]
struct Slot {
    generation: u32,
    data: Option<NodeData>,
}

fn handle(index: usize, generation: u32) -> NodeId {
    NodeId::from_raw((generation << INDEX_BITS) | index as u32)
}

fn split(id: NodeId) -> (usize, u32) {
    let raw = id.as_raw();
    ((raw & INDEX_MASK) as usize, raw >> INDEX_BITS)
}

#[derive(Debug)]
pub struct Document {
    slots: Vec<Slot>,
    free: Vec<usize>,
    body: NodeId,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    pub fn new() -> Self {
        let mut doc = Self {
            slots: Vec::new(),
            free: Vec::new(),
            body: NodeId::from_raw(0),
        };
        doc.body = doc.create_element("body");
        doc
    }

    pub fn body(&self) -> NodeId {
        self.body
    }

    fn insert(&mut self, kind: NodeKind) -> NodeId {
        let data = NodeData {
            kind,
            parent: None,
            children: Vec::new(),
        };
        if let Some(index) = self.free.pop()
            && let Some(slot) = self.slots.get_mut(index)
        {
            slot.data = Some(data);
            return handle(index, slot.generation);
        }
        let index = self.slots.len();
        debug_assert!(index <= INDEX_MASK as usize, "render tree slot space exhausted");
        self.slots.push(Slot {
            generation: 0,
            data: Some(data),
        });
        handle(index, 0)
    }

    fn data(&self, id: NodeId) -> Option<&NodeData> {
        let (index, generation) = split(id);
        self.slots
            .get(index)
            .filter(|slot| slot.generation == generation)
            .and_then(|slot| slot.data.as_ref())
    }

    fn data_mut(&mut self, id: NodeId) -> Option<&mut NodeData> {
        let (index, generation) = split(id);
        self.slots
            .get_mut(index)
            .filter(|slot| slot.generation == generation)
            .and_then(|slot| slot.data.as_mut())
    }

    /// Empties the slot behind `id` and queues it for reuse.
    fn release(&mut self, id: NodeId) -> Option<NodeData> {
        let (index, generation) = split(id);
        let slot = self.slots.get_mut(index).filter(|s| s.generation == generation)?;
        let data = slot.data.take()?;
        if slot.generation < MAX_GENERATION {
            slot.generation += 1;
            self.free.push(index);
        }
        Some(data)
    }

    /// Slots allocated so far, live or free.
    pub fn slot_capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn create_element(&mut self, tag: &str) -> NodeId {
        self.insert(NodeKind::Element {
            tag: tag.to_ascii_lowercase(),
            attributes: Vec::new(),
        })
    }

    pub fn create_text(&mut self, text: &str) -> NodeId {
        self.insert(NodeKind::Text(text.to_string()))
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.data(id).is_some()
    }

    /// Number of live nodes, including `body`.
    pub fn node_count(&self) -> usize {
        self.slots.iter().filter(|s| s.data.is_some()).count()
    }

    pub fn kind(&self, id: NodeId) -> Option<&NodeKind> {
        self.data(id).map(|d| &d.kind)
    }

    pub fn tag(&self, id: NodeId) -> Option<&str> {
        match self.kind(id)? {
            NodeKind::Element { tag, .. } => Some(tag),
            _ => None,
        }
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.data(id)?.parent
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.data(id).map(|d| d.children.as_slice()).unwrap_or(&[])
    }

    /// True when `node` is `ancestor` or lies beneath it.
    pub fn is_descendant_of(&self, node: NodeId, ancestor: NodeId) -> bool {
        let mut current = Some(node);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.parent(id);
        }
        false
    }

    /// Topmost ancestor of `id` (itself when detached).
    pub fn root_of(&self, id: NodeId) -> NodeId {
        let mut current = id;
        while let Some(parent) = self.parent(current) {
            current = parent;
        }
        current
    }

    pub fn is_attached(&self, id: NodeId) -> bool {
        self.contains(id) && self.is_descendant_of(id, self.body)
    }

    pub fn append_child(&mut self, parent: NodeId, child: NodeId) -> Result<(), DomError> {
        match self.kind(parent) {
            None => return Err(DomError::UnknownNode(parent)),
            Some(NodeKind::Element { .. }) => {}
            Some(_) => return Err(DomError::NotAnElement(parent)),
        }
        if !self.contains(child) {
            return Err(DomError::UnknownNode(child));
        }
        if self.is_descendant_of(parent, child) {
            return Err(DomError::Cycle { parent, child });
        }
        self.detach(child);
        if let Some(c) = self.data_mut(child) {
            c.parent = Some(parent);
        }
        if let Some(p) = self.data_mut(parent) {
            p.children.push(child);
        }
        Ok(())
    }

    /// Unlinks a node from its parent, keeping its subtree alive.
    pub fn detach(&mut self, id: NodeId) {
        let Some(parent) = self.parent(id) else {
            return;
        };
        if let Some(p) = self.data_mut(parent) {
            p.children.retain(|c| *c != id);
        }
        if let Some(d) = self.data_mut(id) {
            d.parent = None;
        }
    }

    /// Detaches and frees a node and its whole subtree. Returns false if
    /// the node was already gone. `body` is never removed.
    pub fn remove(&mut self, id: NodeId) -> bool {
        if id == self.body || !self.contains(id) {
            return false;
        }
        self.detach(id);
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            if let Some(data) = self.release(next) {
                stack.extend(data.children);
            }
        }
        true
    }

    pub fn clear_children(&mut self, id: NodeId) {
        let children: Vec<NodeId> = self.children(id).to_vec();
        for child in children {
            self.remove(child);
        }
    }

    pub fn set_attribute(&mut self, id: NodeId, name: &str, value: &str) -> bool {
        let Some(NodeData {
            kind: NodeKind::Element { attributes, .. },
            ..
        }) = self.data_mut(id)
        else {
            return false;
        };
        match attributes.iter_mut().find(|(k, _)| k == name) {
            Some((_, v)) => *v = value.to_string(),
            None => attributes.push((name.to_string(), value.to_string())),
        }
        true
    }

    pub fn attribute(&self, id: NodeId, name: &str) -> Option<&str> {
        match self.kind(id)? {
            NodeKind::Element { attributes, .. } => attributes
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str()),
            _ => None,
        }
    }

    /// Replaces the children of an element with a single text node.
    pub fn set_text_content(&mut self, id: NodeId, text: &str) -> Result<(), DomError> {
        self.clear_children(id);
        let text = self.create_text(text);
        self.append_child(id, text)
    }

    /// Replaces the children of an element with verbatim markup.
    pub fn set_inner_html(&mut self, id: NodeId, html: &str) -> Result<(), DomError> {
        self.clear_children(id);
        let raw = self.insert(NodeKind::Raw(html.to_string()));
        self.append_child(id, raw)
    }

    pub fn text_content(&self, id: NodeId) -> String {
        let mut out = String::new();
        self.collect_text(id, &mut out);
        out
    }

    fn collect_text(&self, id: NodeId, out: &mut String) {
        let Some(data) = self.data(id) else {
            return;
        };
        match &data.kind {
            NodeKind::Text(t) | NodeKind::Raw(t) => out.push_str(t),
            NodeKind::Element { .. } => {
                for child in &data.children {
                    self.collect_text(*child, out);
                }
            }
        }
    }

    pub fn inner_html(&self, id: NodeId) -> String {
        let mut out = String::new();
        for child in self.children(id) {
            self.write_node(*child, &mut out);
        }
        out
    }

    pub fn outer_html(&self, id: NodeId) -> String {
        let mut out = String::new();
        self.write_node(id, &mut out);
        out
    }

    fn write_node(&self, id: NodeId, out: &mut String) {
        let Some(data) = self.data(id) else {
            return;
        };
        match &data.kind {
            NodeKind::Text(t) => out.push_str(&escape_text(t)),
            NodeKind::Raw(html) => out.push_str(html),
            NodeKind::Element { tag, attributes } => {
                let _ = write!(out, "<{tag}");
                for (k, v) in attributes {
                    let _ = write!(out, " {k}=\"{}\"", escape_attribute(v));
                }
                out.push('>');
                for child in &data.children {
                    self.write_node(*child, out);
                }
                let _ = write!(out, "</{tag}>");
            }
        }
    }

    /// Depth-first search beneath `root` (inclusive) for an element whose
    /// attribute `name` equals `value`.
    pub fn find_by_attribute(&self, root: NodeId, name: &str, value: &str) -> Option<NodeId> {
        if self.attribute(root, name) == Some(value) {
            return Some(root);
        }
        self.children(root)
            .iter()
            .find_map(|c| self.find_by_attribute(*c, name, value))
    }
}

fn escape_text(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn escape_attribute(s: &str) -> String {
    s.replace('&', "&amp;").replace('"', "&quot;").replace('<', "&lt;")
}

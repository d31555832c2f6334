//! Shared fixtures for block-host integration tests: an in-memory fetcher,
//! notification builders and WAT bundles.

#![allow(dead_code)]

use serde_json::{Value, json};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use vivafolio_block_host::*;
use vivafolio_types::{
    BlockNotification, BlockResource, Entity, EntityGraph, EntityUpdate, NodeId, block_type_url,
};

/// Serves registered paths from memory and records every URL requested.
#[derive(Clone, Default)]
pub struct MapFetcher {
    files: Rc<RefCell<HashMap<String, Vec<u8>>>>,
    calls: Rc<RefCell<Vec<String>>>,
}

impl MapFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serve(&self, path: &str, body: &str) {
        self.files
            .borrow_mut()
            .insert(path.to_string(), body.as_bytes().to_vec());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.borrow().len()
    }
}

impl ResourceFetcher for MapFetcher {
    fn fetch(&self, url: &str) -> Result<FetchedResource, BlockLoaderError> {
        self.calls.borrow_mut().push(url.to_string());
        let path = url.split('?').next().unwrap_or(url);
        self.files
            .borrow()
            .get(path)
            .map(|bytes| FetchedResource::new(bytes.clone(), content_type_for(path).map(str::to_string)))
            .ok_or_else(|| BlockLoaderError::Fetch {
                url: url.to_string(),
                message: "404 Not Found".into(),
            })
    }
}

/// Routes `tracing` output to the test writer; honors `RUST_LOG`.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub struct Harness {
    pub host: Rc<BlockHost>,
    pub fetcher: MapFetcher,
    pub updates: Rc<RefCell<Vec<EntityUpdate>>>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(LoaderConfig::default())
    }

    pub fn with_config(config: LoaderConfig) -> Self {
        init_test_logging();
        let fetcher = MapFetcher::new();
        let updates: Rc<RefCell<Vec<EntityUpdate>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = updates.clone();
        let host = BlockHost::builder()
            .config(config)
            .shared_fetcher(Rc::new(fetcher.clone()))
            .on_block_update(move |update| sink.borrow_mut().push(update.clone()))
            .build()
            .unwrap();
        Self {
            host,
            fetcher,
            updates,
        }
    }

    /// A loader rendering into a fresh container under the body.
    pub fn loader(&self) -> BlockLoader {
        self.host
            .create_loader(LoaderOptions::new(self.host.create_container()))
    }

    /// Serves `files` under `/blocks/{block}/` and returns matching resources.
    pub fn publish(&self, block: &str, files: &[(&str, &str)]) -> Vec<BlockResource> {
        files
            .iter()
            .map(|(name, body)| {
                let path = format!("/blocks/{block}/{name}");
                self.fetcher.serve(&path, body);
                BlockResource::new(*name, path)
            })
            .collect()
    }

    /// Registers a block type for nested mounts of `entity_type`.
    pub fn register_nested(&self, entity_type: &str, files: &[(&str, &str)]) {
        let block_type = block_type_for(entity_type);
        let resources = self.publish(entity_type, files);
        self.host.registry().register(block_type, resources);
    }

    pub fn inner_html(&self, node: NodeId) -> String {
        self.host.document().borrow().inner_html(node)
    }

    pub fn text(&self, node: NodeId) -> String {
        self.host.document().borrow().text_content(node)
    }
}

pub fn notification(block_id: &str, graph: EntityGraph, resources: Vec<BlockResource>) -> BlockNotification {
    BlockNotification {
        block_id: block_id.to_string(),
        block_type: block_type_url("test-block"),
        display_mode: Default::default(),
        source_uri: "file:///notes/today.md".into(),
        range: Default::default(),
        entity_id: graph.entities.first().map(|e| e.entity_id.clone()),
        resources,
        entity_graph: graph,
        supports_hot_reload: None,
        initial_height: None,
    }
}

pub fn graph(entities: &[(&str, Value)]) -> EntityGraph {
    EntityGraph {
        entities: entities
            .iter()
            .map(|(id, props)| Entity::from_json(*id, props.clone()))
            .collect(),
        links: Vec::new(),
    }
}

pub fn task(title: &str, status: &str) -> Value {
    json!({ "title": title, "status": status })
}

// ============================================================
// Bundles
// ============================================================

/// Direct component: `render()` builds a `<div id="x">` filled
/// with the entity's `title`.
pub const DIRECT_BUNDLE: &str = r#"(module
  (import "react" "create_element" (func $ce (param i32 i32) (result i32)))
  (import "react" "set_attribute" (func $sa (param i32 i32 i32 i32 i32)))
  (import "@blockprotocol/graph" "entity_property" (func $ep (param i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 0) "div")
  (data (i32.const 16) "id")
  (data (i32.const 32) "x")
  (data (i32.const 48) "title")
  (func (export "render") (result i32)
    (local $el i32)
    (local.set $el (call $ce (i32.const 0) (i32.const 3)))
    (call $sa (local.get $el) (i32.const 16) (i32.const 2) (i32.const 32) (i32.const 1))
    (drop (call $ep (local.get $el) (i32.const 48) (i32.const 5)))
    (local.get $el)))"#;

/// Custom-element factory: `element()` creates `<status-pill>`, `init()`
/// and `update_entity()` write the entity's `status` into it.
pub const ELEMENT_BUNDLE: &str = r#"(module
  (import "react" "create_element" (func $ce (param i32 i32) (result i32)))
  (import "@blockprotocol/graph" "entity_property" (func $ep (param i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 0) "status-pill")
  (data (i32.const 32) "status")
  (global $el (mut i32) (i32.const -1))
  (func (export "element") (result i32)
    (global.set $el (call $ce (i32.const 0) (i32.const 11)))
    (global.get $el))
  (func (export "init")
    (drop (call $ep (global.get $el) (i32.const 32) (i32.const 6))))
  (func (export "update_entity")
    (drop (call $ep (global.get $el) (i32.const 32) (i32.const 6)))))"#;

/// Vanilla node bundle depending on a local script and a local stylesheet.
pub const MODULAR_BUNDLE: &str = r#"(module
  (import "./util.wat" "helper" (func $helper (result i32)))
  (import "./style.css" "apply" (func $apply))
  (import "react" "create_text" (func $ct (param i32 i32) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 0) "ok")
  (func (export "create_node") (result i32)
    (call $apply)
    (drop (call $helper))
    (call $ct (i32.const 0) (i32.const 2))))"#;

pub const UTIL_MODULE: &str = r#"(module
  (func (export "helper") (result i32) (i32.const 7)))"#;

pub const STYLE_SHEET: &str = ".card { color: teal; }";

/// Direct component importing a package outside the allowlist.
pub const LEFT_PAD_BUNDLE: &str = r#"(module
  (import "./util.wat" "helper" (func $helper (result i32)))
  (import "left-pad" "pad" (func $pad (param i32) (result i32)))
  (func (export "render") (result i32) (i32.const -1)))"#;

/// Direct component that embeds entity `e2` inside a `<section>`.
pub const EMBEDDING_BUNDLE: &str = r#"(module
  (import "react" "create_element" (func $ce (param i32 i32) (result i32)))
  (import "@blockprotocol/graph" "embed_entity" (func $embed (param i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 0) "section")
  (data (i32.const 16) "e2")
  (func (export "render") (result i32)
    (local $el i32)
    (local.set $el (call $ce (i32.const 0) (i32.const 7)))
    (drop (call $embed (local.get $el) (i32.const 16) (i32.const 2)))
    (local.get $el)))"#;

/// Direct component whose render embeds `e1` into a fresh `<section>`.
pub const ANCESTOR_EMBEDDING_BUNDLE: &str = r#"(module
  (import "react" "create_element" (func $ce (param i32 i32) (result i32)))
  (import "@blockprotocol/graph" "embed_entity" (func $embed (param i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 0) "section")
  (data (i32.const 16) "e1")
  (func (export "render") (result i32)
    (local $el i32)
    (local.set $el (call $ce (i32.const 0) (i32.const 7)))
    (drop (call $embed (local.get $el) (i32.const 16) (i32.const 2)))
    (local.get $el)))"#;

/// Vanilla node rendering a `<span>` with the entity's `title`.
pub const CHIP_BUNDLE: &str = r#"(module
  (import "react" "create_element" (func $ce (param i32 i32) (result i32)))
  (import "@blockprotocol/graph" "entity_property" (func $ep (param i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 0) "span")
  (data (i32.const 16) "title")
  (func (export "create_node") (result i32)
    (local $el i32)
    (local.set $el (call $ce (i32.const 0) (i32.const 4)))
    (drop (call $ep (local.get $el) (i32.const 16) (i32.const 5)))
    (local.get $el)))"#;

/// Direct component whose render sets `status` to `"done"`.
pub const UPDATING_BUNDLE: &str = r#"(module
  (import "react" "create_text" (func $ct (param i32 i32) (result i32)))
  (import "@blockprotocol/graph" "update_property" (func $up (param i32 i32 i32 i32)))
  (memory (export "memory") 1)
  (data (i32.const 0) "status")
  (data (i32.const 16) "\"done\"")
  (func (export "render") (result i32)
    (call $up (i32.const 0) (i32.const 6) (i32.const 16) (i32.const 6))
    (call $ct (i32.const 0) (i32.const 6))))"#;

/// Companion script for a template: keeps a `<p>` in the mount node in sync
/// with the entity's `title`.
pub const TEMPLATE_SCRIPT_MODULE: &str = r#"(module
  (import "react-dom" "mount_node" (func $mount (result i32)))
  (import "react" "create_element" (func $ce (param i32 i32) (result i32)))
  (import "react" "append_child" (func $append (param i32 i32)))
  (import "@blockprotocol/graph" "entity_property" (func $ep (param i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 0) "p")
  (data (i32.const 16) "title")
  (global $p (mut i32) (i32.const -1))
  (func (export "set_entity")
    (if (i32.lt_s (global.get $p) (i32.const 0))
      (then
        (global.set $p (call $ce (i32.const 0) (i32.const 1)))
        (call $append (call $mount) (global.get $p))))
    (drop (call $ep (global.get $p) (i32.const 16) (i32.const 5)))))"#;

/// Spins forever in `render()`.
pub const SPINNING_BUNDLE: &str = r#"(module
  (func (export "render") (result i32)
    (loop $spin (br $spin))
    (i32.const -1)))"#;

/// Exports nothing renderable.
pub const INERT_BUNDLE: &str = r#"(module
  (func (export "helper") (result i32) (i32.const 1)))"#;

//! Integration tests for BlockLoader: mode selection, sandboxed evaluation,
//! dependency policy, local modules, updates and teardown.

mod common;

use common::*;
use pretty_assertions::assert_eq;
use serde_json::json;
use vivafolio_block_host::*;
use vivafolio_types::{BlockResource, DisplayMode, NodeId};

fn style_count(harness: &Harness, container: NodeId) -> usize {
    let doc = harness.host.document().borrow();
    doc.children(container)
        .iter()
        .filter(|child| doc.tag(**child) == Some("style"))
        .count()
}

// ================================================================
// Rendering
// ================================================================

#[test]
fn direct_component_renders_with_no_blocked_dependencies() {
    let h = Harness::new();
    let resources = h.publish("direct", &[("main.js", DIRECT_BUNDLE)]);
    let n = notification("b1", graph(&[("e1", task("Write tests", "todo"))]), resources);

    let mut loader = h.loader();
    loader.load_block(&n).unwrap();

    let html = h.inner_html(loader.container());
    assert!(html.contains(r#"id="x""#), "{html}");
    assert!(html.contains(MOUNT_CLASS));
    assert_eq!(h.text(loader.container()), "Write tests");
    assert_eq!(loader.component_kind(), Some("direct"));
    assert!(loader.is_loaded());

    let diagnostics = loader.get_diagnostics().unwrap();
    assert!(diagnostics.blocked_dependencies.is_empty());
    assert_eq!(
        diagnostics.required_dependencies,
        vec!["react".to_string(), "@blockprotocol/graph".to_string()]
    );
    assert_eq!(diagnostics.bundle_url, "/blocks/direct/main.js");
    assert_eq!(
        diagnostics.integrity_sha256.as_deref(),
        Some(sha256_hex(DIRECT_BUNDLE.as_bytes()).as_str())
    );

    let doc = h.host.document().borrow();
    assert_eq!(doc.attribute(loader.container(), "data-block-state"), Some("ready"));
    assert_eq!(doc.attribute(loader.container(), "data-block-id"), Some("b1"));
}

#[test]
fn template_entry_wins_over_bundle() {
    let h = Harness::new();
    let resources = h.publish(
        "both",
        &[("main.js", DIRECT_BUNDLE), ("app.html", r#"<div id="x"></div>"#)],
    );
    let n = notification("b1", graph(&[("e1", task("t", "todo"))]), resources);

    let mut loader = h.loader();
    loader.load_block(&n).unwrap();

    assert_eq!(loader.mode().map(BlockMode::name), Some("html"));
    assert_eq!(h.inner_html(loader.container()), r#"<div id="x"></div>"#);
    assert!(h.fetcher.calls().iter().all(|url| !url.contains("main.js")));
    assert_eq!(loader.component_kind(), None);
}

#[test]
fn template_script_follows_entity_updates() {
    let h = Harness::new();
    let resources = h.publish(
        "tmpl",
        &[
            ("index.html", r#"<h3 class="title"></h3>"#),
            ("app.js", TEMPLATE_SCRIPT_MODULE),
        ],
    );
    let mut loader = h.loader();
    loader
        .load_block(&notification("b1", graph(&[("e1", task("First", "todo"))]), resources.clone()))
        .unwrap();

    let bridge = h.host.template_bridge().unwrap();
    let handlers = bridge.handlers("b1").unwrap();
    assert!(handlers.set_entity);
    assert!(!handlers.set_readonly);
    assert!(h.inner_html(loader.container()).ends_with("<p>First</p>"));

    loader
        .update_block(&notification("b1", graph(&[("e1", task("Second", "todo"))]), resources))
        .unwrap();
    assert!(h.inner_html(loader.container()).ends_with("<p>Second</p>"));

    loader.destroy();
    assert!(bridge.handlers("b1").is_none());
}

#[test]
fn container_reflects_display_mode_and_initial_height() {
    let h = Harness::new();
    let resources = h.publish("inline", &[("app.html", "<span>hi</span>")]);
    let mut n = notification("b1", graph(&[("e1", json!({}))]), resources);
    n.display_mode = DisplayMode::Inline;
    n.initial_height = Some(120);

    let mut loader = h.loader();
    loader.load_block(&n).unwrap();

    let doc = h.host.document().borrow();
    let container = loader.container();
    assert_eq!(doc.attribute(container, "data-display-mode"), Some("inline"));
    assert_eq!(doc.attribute(container, "data-initial-height"), Some("120"));
}

// ================================================================
// Dependency policy
// ================================================================

#[test]
fn blocked_dependency_is_reported_without_partial_load() {
    let h = Harness::new();
    let resources = h.publish(
        "pad",
        &[("main.js", LEFT_PAD_BUNDLE), ("util.wat", UTIL_MODULE)],
    );
    let n = notification("b1", graph(&[("e1", task("t", "todo"))]), resources);

    let mut loader = h.loader();
    let err = loader.load_block(&n).unwrap_err();

    assert!(err.is_blocked_dependency(), "{err}");
    assert!(err.to_string().contains("left-pad"));
    assert!(!loader.is_loaded());

    let diagnostics = loader.get_diagnostics().unwrap();
    assert_eq!(diagnostics.blocked_dependencies, vec!["left-pad".to_string()]);
    let util = diagnostics.local_module("util.wat").unwrap();
    assert!(!util.executed);

    let doc = h.host.document().borrow();
    let container = loader.container();
    assert_eq!(doc.attribute(container, "data-block-state"), Some("error"));
    assert!(doc.find_by_attribute(container, "class", ERROR_CLASS).is_some());
    assert!(doc.text_content(container).contains("left-pad"));
}

#[test]
fn allowlisted_but_unbound_specifier_is_unresolved_not_blocked() {
    let allowlist = DependencyAllowlist::new(["react", "react-dom", "@blockprotocol/graph", "lodash"]);
    let h = Harness::with_config(LoaderConfig::default().with_allowlist(allowlist));
    let bundle = r#"(module
      (import "lodash" "chunk" (func (param i32) (result i32)))
      (func (export "render") (result i32) (i32.const -1)))"#;
    let resources = h.publish("lodash", &[("main.js", bundle)]);

    let mut loader = h.loader();
    let err = loader
        .load_block(&notification("b1", graph(&[("e1", json!({}))]), resources))
        .unwrap_err();

    assert!(matches!(err, BlockLoaderError::UnresolvedDependency { ref specifier, .. } if specifier == "lodash"));
    assert!(loader.get_diagnostics().unwrap().blocked_dependencies.is_empty());
}

#[test]
fn host_import_outside_module_surface_is_unresolved() {
    let h = Harness::new();
    let bundle = r#"(module
      (import "react" "use_state" (func (result i32)))
      (func (export "render") (result i32) (i32.const -1)))"#;
    let resources = h.publish("hooks", &[("main.js", bundle)]);

    let mut loader = h.loader();
    let err = loader
        .load_block(&notification("b1", graph(&[("e1", json!({}))]), resources))
        .unwrap_err();
    assert!(err.to_string().contains("use_state"), "{err}");
}

// ================================================================
// Local modules and updates
// ================================================================

#[test]
fn local_modules_run_once_and_updates_do_not_refetch() {
    let h = Harness::new();
    let resources = h.publish(
        "modular",
        &[
            ("main.js", MODULAR_BUNDLE),
            ("util.wat", UTIL_MODULE),
            ("style.css", STYLE_SHEET),
        ],
    );
    let mut loader = h.loader();
    loader
        .load_block(&notification("b1", graph(&[("e1", task("A", "todo"))]), resources.clone()))
        .unwrap();

    let container = loader.container();
    assert_eq!(loader.component_kind(), Some("vanilla-node"));
    assert_eq!(style_count(&h, container), 1);
    assert!(h.inner_html(container).contains(r#"data-module="style.css""#));
    assert!(h.text(container).ends_with("ok"));

    let before = loader.get_diagnostics().unwrap().clone();
    let util = before.local_module("util.wat").unwrap();
    assert!(util.executed);
    assert_eq!(util.exports, Some(vec!["helper".to_string()]));
    assert!(before.local_module("style.css").unwrap().executed);
    assert_eq!(
        before.required_dependencies,
        vec!["./util.wat".to_string(), "./style.css".to_string(), "react".to_string()]
    );

    let fetches = h.fetcher.call_count();
    loader
        .update_block(&notification("b1", graph(&[("e1", task("B", "done"))]), resources))
        .unwrap();

    assert_eq!(h.fetcher.call_count(), fetches);
    assert_eq!(style_count(&h, container), 1);
    let after = loader.get_diagnostics().unwrap();
    assert_eq!(after.evaluated_at, before.evaluated_at);
    assert_eq!(after.local_modules, before.local_modules);
    assert_eq!(loader.view().block_entity.get_str("/status"), Some("done"));
}

#[test]
fn custom_element_update_sees_latest_entity() {
    let h = Harness::new();
    let resources = h.publish("pill", &[("main.js", ELEMENT_BUNDLE)]);
    let mut loader = h.loader();
    loader
        .load_block(&notification("b1", graph(&[("e1", task("t", "todo"))]), resources.clone()))
        .unwrap();

    assert_eq!(loader.component_kind(), Some("custom-element-factory"));
    assert!(h.inner_html(loader.container()).starts_with(r#"<status-pill data-block-id="b1">todo"#));

    let fetches = h.fetcher.call_count();
    loader
        .update_block(&notification("b1", graph(&[("e1", task("t", "doing"))]), resources.clone()))
        .unwrap();
    loader
        .update_block(&notification("b1", graph(&[("e1", task("t", "done"))]), resources))
        .unwrap();

    assert_eq!(h.text(loader.container()), "done");
    assert_eq!(h.fetcher.call_count(), fetches);
}

#[test]
fn caching_tag_serves_second_load_from_cache() {
    let h = Harness::new();
    let resources: Vec<BlockResource> = h
        .publish("cached", &[("main.js", DIRECT_BUNDLE)])
        .into_iter()
        .map(|r| r.with_caching_tag("v1"))
        .collect();

    let mut first = h.loader();
    first
        .load_block(&notification("b1", graph(&[("e1", task("t", "todo"))]), resources.clone()))
        .unwrap();
    assert_eq!(h.fetcher.calls(), vec!["/blocks/cached/main.js?cache=v1".to_string()]);

    let mut second = h.loader();
    second
        .load_block(&notification("b2", graph(&[("e1", task("t", "todo"))]), resources))
        .unwrap();
    assert_eq!(h.fetcher.call_count(), 1);
    assert!(second.is_loaded());
}

// ================================================================
// Updates from the block
// ================================================================

#[test]
fn property_updates_reach_the_update_channel() {
    let h = Harness::new();
    let resources = h.publish("updating", &[("main.js", UPDATING_BUNDLE)]);
    let mut loader = h.loader();
    loader
        .load_block(&notification("b1", graph(&[("e1", task("Ship", "todo"))]), resources))
        .unwrap();

    let updates = h.updates.borrow();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].entity_id, "e1");
    assert_eq!(updates[0].properties.get("status"), Some(&json!("done")));
    assert_eq!(updates[0].properties.get("title"), Some(&json!("Ship")));
}

#[test]
fn readonly_blocks_cannot_update() {
    let h = Harness::new();
    let resources = h.publish("updating", &[("main.js", UPDATING_BUNDLE)]);
    let container = h.host.create_container();
    let mut loader = h
        .host
        .create_loader(LoaderOptions::new(container).readonly(true));
    loader
        .load_block(&notification("b1", graph(&[("e1", task("Ship", "todo"))]), resources))
        .unwrap();

    assert!(h.updates.borrow().is_empty());
    assert!(loader.view().readonly);
}

#[test]
fn loader_callback_overrides_host_channel() {
    use std::cell::RefCell;
    use std::rc::Rc;

    let h = Harness::new();
    let resources = h.publish("updating", &[("main.js", UPDATING_BUNDLE)]);
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();
    let container = h.host.create_container();
    let mut loader = h.host.create_loader(
        LoaderOptions::new(container)
            .with_update_callback(move |u| sink.borrow_mut().push(u.entity_id.clone())),
    );
    loader
        .load_block(&notification("b1", graph(&[("e1", task("Ship", "todo"))]), resources))
        .unwrap();

    assert_eq!(*seen.borrow(), vec!["e1".to_string()]);
    assert!(h.updates.borrow().is_empty());
}

// ================================================================
// Failures and lifecycle
// ================================================================

#[test]
fn runaway_render_is_stopped_by_fuel_budget() {
    let config = LoaderConfig::from_toml("[loader.limits]\nfuel-per-call = 10000\n").unwrap();
    let h = Harness::with_config(config);
    let resources = h.publish("spin", &[("main.js", SPINNING_BUNDLE)]);
    let mut loader = h.loader();

    let err = loader
        .load_block(&notification("b1", graph(&[("e1", json!({}))]), resources))
        .unwrap_err();

    assert!(matches!(err, BlockLoaderError::Evaluation { ref stage, .. } if stage == "render()"), "{err}");
    let doc = h.host.document().borrow();
    assert_eq!(doc.attribute(loader.container(), "data-block-state"), Some("error"));
}

#[test]
fn sandbox_metrics_report_fuel_and_memory_of_mounted_block() {
    let config = LoaderConfig::from_toml("[loader.limits]\nfuel-per-call = 2000000\n").unwrap();
    let h = Harness::with_config(config);
    let resources = h.publish("direct", &[("main.js", DIRECT_BUNDLE)]);
    let mut loader = h.loader();
    assert!(loader.sandbox_metrics().is_none());

    loader
        .load_block(&notification("b1", graph(&[("e1", task("t", "todo"))]), resources))
        .unwrap();

    let metrics = loader.sandbox_metrics().unwrap();
    assert_eq!(metrics.fuel_budget_per_call, 2_000_000);
    assert!(metrics.fuel_consumed_last_call > 0);
    assert!(metrics.fuel_consumed_last_call < metrics.fuel_budget_per_call);
    assert_eq!(metrics.memory_used_bytes, 64 * 1024);
    assert!(metrics.memory_used_bytes <= metrics.memory_limit_bytes);

    loader.destroy();
    assert!(loader.sandbox_metrics().is_none());
}

#[test]
fn bundle_without_component_fails() {
    let h = Harness::new();
    let resources = h.publish("inert", &[("main.js", INERT_BUNDLE)]);
    let mut loader = h.loader();
    let err = loader
        .load_block(&notification("b1", graph(&[("e1", json!({}))]), resources))
        .unwrap_err();
    assert!(matches!(err, BlockLoaderError::NoRenderableExport { .. }));
}

#[test]
fn missing_bundle_fetch_fails_with_url() {
    let h = Harness::new();
    let n = notification(
        "b1",
        graph(&[("e1", json!({}))]),
        vec![BlockResource::new("main.js", "/blocks/gone/main.js")],
    );
    let mut loader = h.loader();
    let err = loader.load_block(&n).unwrap_err();
    assert!(err.to_string().contains("/blocks/gone/main.js"));
}

#[test]
fn update_before_load_is_recorded_only() {
    let h = Harness::new();
    let mut loader = h.loader();
    loader
        .update_block(&notification("b1", graph(&[("e1", task("t", "todo"))]), Vec::new()))
        .unwrap();
    assert!(!loader.is_loaded());
    assert_eq!(loader.view().block_entity.entity_id, "e1");
}

#[test]
fn destroy_is_idempotent_and_final() {
    let h = Harness::new();
    let resources = h.publish("direct", &[("main.js", DIRECT_BUNDLE)]);
    let n = notification("b1", graph(&[("e1", task("t", "todo"))]), resources);
    let mut loader = h.loader();
    loader.load_block(&n).unwrap();

    loader.destroy();
    loader.destroy();

    assert!(loader.is_destroyed());
    assert!(!loader.is_loaded());
    assert_eq!(h.inner_html(loader.container()), "");
    assert!(loader.update_block(&n).is_ok());
    assert!(matches!(loader.load_block(&n), Err(BlockLoaderError::Destroyed(_))));
    assert!(h.host.graph_context().get_entity("e1").is_none());
}

#[test]
fn duplicate_entities_are_rejected() {
    let h = Harness::new();
    let n = notification(
        "b1",
        graph(&[("e1", json!({})), ("e1", json!({}))]),
        Vec::new(),
    );
    let mut loader = h.loader();
    assert!(matches!(
        loader.load_block(&n),
        Err(BlockLoaderError::InvalidNotification(_))
    ));
}

use pretty_assertions::assert_eq;
use serde_json::json;
use std::io::Cursor;
use vivafolio_types::*;

fn sample_json() -> serde_json::Value {
    json!({
        "blockId": "picker-123",
        "blockType": "https://blockprotocol.org/@blockprotocol/types/block-type/color-picker/",
        "displayMode": "multi-line",
        "sourceUri": "file:///tmp/two_blocks.py",
        "range": {"start": {"line": 4, "character": 0}, "end": {"line": 4, "character": 50}},
        "entityId": "entity-picker-123",
        "resources": [
            {"logicalName": "index.html", "physicalPath": "file:///blocks/color-picker/dist/index.html", "cachingTag": "picker-v2"}
        ],
        "entityGraph": {
            "entities": [{"entityId": "entity-picker-123", "properties": {"color": "#3700ff"}}],
            "links": []
        },
        "supportsHotReload": false,
        "initialHeight": 200
    })
}

// ── Parsing ──────────────────────────────────────────────────────

#[test]
fn parses_producer_notification() {
    let n: BlockNotification = serde_json::from_value(sample_json()).unwrap();
    assert_eq!(n.block_id, "picker-123");
    assert_eq!(n.display_mode, DisplayMode::MultiLine);
    assert_eq!(n.range.start.line, 4);
    assert_eq!(n.resources[0].caching_tag.as_deref(), Some("picker-v2"));
    assert_eq!(n.supports_hot_reload, Some(false));
    assert_eq!(n.initial_height, Some(200));
    assert_eq!(
        n.entity_graph.entity("entity-picker-123").unwrap().get_str("/color"),
        Some("#3700ff")
    );
}

#[test]
fn optional_fields_default() {
    let n = BlockNotification::from_json_line(
        r#"{"blockId":"b","blockType":"t","displayMode":"inline"}"#,
    )
    .unwrap();
    assert_eq!(n.display_mode, DisplayMode::Inline);
    assert!(n.resources.is_empty());
    assert!(n.entity_graph.entities.is_empty());
    assert_eq!(n.entity_id, None);
    assert_eq!(n.initial_height, None);
}

#[test]
fn block_entity_falls_back_to_first_entity() {
    let mut n: BlockNotification = serde_json::from_value(sample_json()).unwrap();
    n.entity_id = None;
    assert_eq!(n.block_entity_id(), Some("entity-picker-123"));
}

#[test]
fn serialization_uses_camel_case() {
    let n: BlockNotification = serde_json::from_value(sample_json()).unwrap();
    let value = serde_json::to_value(&n).unwrap();
    assert_eq!(value["blockId"], "picker-123");
    assert_eq!(value["displayMode"], "multi-line");
    assert_eq!(value["resources"][0]["logicalName"], "index.html");
}

// ── Resources ────────────────────────────────────────────────────

#[test]
fn resource_extension_is_lowercased() {
    assert_eq!(BlockResource::new("Main.JS", "x").extension().as_deref(), Some("js"));
    assert_eq!(BlockResource::new("styles/app.css", "x").extension().as_deref(), Some("css"));
    assert_eq!(BlockResource::new("README", "x").extension(), None);
    assert_eq!(BlockResource::new(".hidden", "x").extension(), None);
}

#[test]
fn resource_lookup_by_logical_name() {
    let n: BlockNotification = serde_json::from_value(sample_json()).unwrap();
    assert!(n.has_resource("index.html"));
    assert!(!n.has_resource("main.js"));
}

// ── Block type URLs ──────────────────────────────────────────────

#[test]
fn block_type_url_roundtrip() {
    let url = block_type_url("person-chip");
    assert_eq!(url, "https://blockprotocol.org/@blockprotocol/types/block-type/person-chip/");
    assert_eq!(block_type_name(&url), "person-chip");
    assert_eq!(block_type_name("custom"), "custom");
}

// ── JSON lines stream ────────────────────────────────────────────

#[test]
fn reader_skips_blank_and_malformed_lines() {
    let line = serde_json::to_string(&sample_json()).unwrap();
    let input = format!("\n{line}\nnot json at all\n\n{line}\n");
    let parsed: Vec<_> = NotificationReader::new(Cursor::new(input))
        .collect::<std::result::Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(parsed.len(), 2);
    assert!(parsed.iter().all(|n| n.block_id == "picker-123"));
}

#[test]
fn reader_on_empty_input_yields_nothing() {
    let mut reader = NotificationReader::new(Cursor::new(""));
    assert!(reader.next().is_none());
}

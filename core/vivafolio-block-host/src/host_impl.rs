//! Host functions backing the allowlisted specifiers.
//!
//! Strings cross the boundary as `(ptr, len)` pairs into the caller's
//! exported `memory`. Buffers written back use `(ptr, cap)` and return the
//! full length; nothing is written when `cap` is too small.

use crate::allowlist::{DependencyAllowlist, HostModule};
use crate::error::BlockLoaderError;
use crate::sandbox::BlockState;
use serde_json::Value;
use tracing::{debug, warn};
use vivafolio_types::{EntityUpdate, NodeId};
use wasmtime::{Caller, Linker, Memory};

/// Registers every host module that has a specifier bound in `allowlist`.
pub(crate) fn add_to_linker(
    linker: &mut Linker<BlockState>,
    allowlist: &DependencyAllowlist,
) -> wasmtime::Result<()> {
    for module in HostModule::ALL {
        let Some(specifier) = allowlist.specifier_for(module) else {
            continue;
        };
        match module {
            HostModule::Ui => add_ui(linker, specifier)?,
            HostModule::DomRenderer => add_dom_renderer(linker, specifier)?,
            HostModule::Graph => add_graph(linker, specifier)?,
        }
    }
    Ok(())
}

// ============================================================
// Guest memory helpers
// ============================================================

fn guest_memory(caller: &mut Caller<'_, BlockState>) -> wasmtime::Result<Memory> {
    caller
        .get_export("memory")
        .and_then(|e| e.into_memory())
        .ok_or_else(|| wasmtime::Error::msg("block module does not export \"memory\""))
}

fn read_string(caller: &mut Caller<'_, BlockState>, ptr: i32, len: i32) -> wasmtime::Result<String> {
    let (Ok(ptr), Ok(len)) = (usize::try_from(ptr), usize::try_from(len)) else {
        return Err(wasmtime::Error::msg(format!("invalid guest string ({ptr}, {len})")));
    };
    let memory = guest_memory(caller)?;
    let mut buf = vec![0u8; len];
    memory.read(&*caller, ptr, &mut buf)?;
    Ok(String::from_utf8(buf)?)
}

fn write_bytes(
    caller: &mut Caller<'_, BlockState>,
    ptr: i32,
    cap: i32,
    bytes: &[u8],
) -> wasmtime::Result<i32> {
    let len = i32::try_from(bytes.len())?;
    if let Ok(offset) = usize::try_from(ptr)
        && cap >= len
    {
        let memory = guest_memory(caller)?;
        memory.write(&mut *caller, offset, bytes)?;
    }
    Ok(len)
}

fn node_arg(raw: i32) -> wasmtime::Result<NodeId> {
    NodeId::from_guest(raw).ok_or_else(|| wasmtime::Error::msg(format!("invalid node handle {raw}")))
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == ':')
}

// ============================================================
// Ui ("react")
// ============================================================

fn add_ui(linker: &mut Linker<BlockState>, module: &str) -> wasmtime::Result<()> {
    linker.func_wrap(
        module,
        "create_element",
        |mut caller: Caller<'_, BlockState>, ptr: i32, len: i32| -> wasmtime::Result<i32> {
            let tag = read_string(&mut caller, ptr, len)?;
            if !valid_name(&tag) || tag.eq_ignore_ascii_case("script") {
                return Err(wasmtime::Error::msg(format!("element <{tag}> is not allowed")));
            }
            let document = caller.data().document.clone();
            let node = document.borrow_mut().create_element(&tag);
            Ok(node.to_guest())
        },
    )?;

    linker.func_wrap(
        module,
        "create_text",
        |mut caller: Caller<'_, BlockState>, ptr: i32, len: i32| -> wasmtime::Result<i32> {
            let text = read_string(&mut caller, ptr, len)?;
            let document = caller.data().document.clone();
            let node = document.borrow_mut().create_text(&text);
            Ok(node.to_guest())
        },
    )?;

    linker.func_wrap(
        module,
        "set_attribute",
        |mut caller: Caller<'_, BlockState>,
         node: i32,
         name_ptr: i32,
         name_len: i32,
         value_ptr: i32,
         value_len: i32|
         -> wasmtime::Result<()> {
            let node = node_arg(node)?;
            let name = read_string(&mut caller, name_ptr, name_len)?;
            let value = read_string(&mut caller, value_ptr, value_len)?;
            if !valid_name(&name) {
                return Err(wasmtime::Error::msg(format!("invalid attribute name '{name}'")));
            }
            let state = caller.data();
            let mut doc = state.document.borrow_mut();
            state.check_writable(&doc, node)?;
            if !doc.set_attribute(node, &name, &value) {
                debug!(block_id = %state.block_id, %node, "set_attribute on a non-element ignored");
            }
            Ok(())
        },
    )?;

    linker.func_wrap(
        module,
        "append_child",
        |caller: Caller<'_, BlockState>, parent: i32, child: i32| -> wasmtime::Result<()> {
            let (parent, child) = (node_arg(parent)?, node_arg(child)?);
            let state = caller.data();
            let mut doc = state.document.borrow_mut();
            state.check_writable(&doc, parent)?;
            state.check_writable(&doc, child)?;
            doc.append_child(parent, child).map_err(BlockLoaderError::from)?;
            Ok(())
        },
    )?;

    linker.func_wrap(
        module,
        "set_text",
        |mut caller: Caller<'_, BlockState>, node: i32, ptr: i32, len: i32| -> wasmtime::Result<()> {
            let node = node_arg(node)?;
            let text = read_string(&mut caller, ptr, len)?;
            let state = caller.data();
            let mut doc = state.document.borrow_mut();
            state.check_writable(&doc, node)?;
            doc.set_text_content(node, &text).map_err(BlockLoaderError::from)?;
            Ok(())
        },
    )?;

    Ok(())
}

// ============================================================
// DomRenderer ("react-dom")
// ============================================================

fn add_dom_renderer(linker: &mut Linker<BlockState>, module: &str) -> wasmtime::Result<()> {
    linker.func_wrap(
        module,
        "mount_node",
        |caller: Caller<'_, BlockState>| -> i32 {
            let state = caller.data();
            state.mount_node.unwrap_or(state.container).to_guest()
        },
    )?;

    linker.func_wrap(
        module,
        "clear",
        |caller: Caller<'_, BlockState>, node: i32| -> wasmtime::Result<()> {
            let node = node_arg(node)?;
            let state = caller.data();
            let mut doc = state.document.borrow_mut();
            state.check_writable(&doc, node)?;
            doc.clear_children(node);
            Ok(())
        },
    )?;

    Ok(())
}

// ============================================================
// Graph ("@blockprotocol/graph")
// ============================================================

fn add_graph(linker: &mut Linker<BlockState>, module: &str) -> wasmtime::Result<()> {
    linker.func_wrap(
        module,
        "block_entity_id",
        |mut caller: Caller<'_, BlockState>, ptr: i32, cap: i32| -> wasmtime::Result<i32> {
            let id = caller.data().view.borrow().block_entity.entity_id.clone();
            write_bytes(&mut caller, ptr, cap, id.as_bytes())
        },
    )?;

    linker.func_wrap(
        module,
        "entity_property",
        |mut caller: Caller<'_, BlockState>, node: i32, ptr: i32, len: i32| -> wasmtime::Result<i32> {
            let node = node_arg(node)?;
            let key = read_string(&mut caller, ptr, len)?;
            let state = caller.data();
            let text = match state.view.borrow().block_entity.property(&key) {
                None | Some(Value::Null) => None,
                Some(Value::String(s)) => Some(s.clone()),
                Some(other) => Some(other.to_string()),
            };
            let Some(text) = text else {
                return Ok(0);
            };
            let mut doc = state.document.borrow_mut();
            state.check_writable(&doc, node)?;
            doc.set_text_content(node, &text).map_err(BlockLoaderError::from)?;
            Ok(1)
        },
    )?;

    linker.func_wrap(
        module,
        "is_readonly",
        |caller: Caller<'_, BlockState>| -> i32 { i32::from(caller.data().view.borrow().readonly) },
    )?;

    linker.func_wrap(
        module,
        "props_json",
        |mut caller: Caller<'_, BlockState>, ptr: i32, cap: i32| -> wasmtime::Result<i32> {
            let props = caller.data().view.borrow().props();
            let json = serde_json::to_vec(&props)?;
            write_bytes(&mut caller, ptr, cap, &json)
        },
    )?;

    linker.func_wrap(
        module,
        "update_property",
        |mut caller: Caller<'_, BlockState>,
         key_ptr: i32,
         key_len: i32,
         value_ptr: i32,
         value_len: i32|
         -> wasmtime::Result<()> {
            let key = read_string(&mut caller, key_ptr, key_len)?;
            let raw = read_string(&mut caller, value_ptr, value_len)?;
            let value = match serde_json::from_str::<Value>(&raw) {
                Ok(v) => v,
                Err(_) => Value::String(raw),
            };

            let state = caller.data();
            let update = {
                let view = state.view.borrow();
                if view.readonly {
                    warn!(block_id = %state.block_id, key = %key, "Ignoring update from readonly block");
                    return Ok(());
                }
                let mut properties = view.block_entity.properties.clone();
                properties.insert(key, value);
                EntityUpdate::new(view.block_entity.entity_id.clone(), properties)
            };
            let sink = state.updates.clone();
            sink(&update);
            Ok(())
        },
    )?;

    linker.func_wrap(
        module,
        "embed_entity",
        |mut caller: Caller<'_, BlockState>, node: i32, ptr: i32, len: i32| -> wasmtime::Result<i32> {
            let node = node_arg(node)?;
            let entity_id = read_string(&mut caller, ptr, len)?;
            let state = caller.data();
            state.check_writable(&state.document.borrow(), node)?;
            let hooks = state.hooks.clone();
            Ok(hooks.embed(&entity_id, node))
        },
    )?;

    linker.func_wrap(
        module,
        "release_hook",
        |caller: Caller<'_, BlockState>, slot: i32| {
            let hooks = caller.data().hooks.clone();
            if let Err(e) = hooks.release(slot) {
                warn!(block_id = %caller.data().block_id, slot, error = %e, "Hook teardown failed");
            }
        },
    )?;

    Ok(())
}

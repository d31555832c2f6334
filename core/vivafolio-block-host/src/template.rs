//! Registry letting template (html-mode) blocks receive entity and
//! readonly changes after their first render.

use std::cell::RefCell;
use std::collections::HashMap;
use tracing::debug;

/// Export names a template companion script may provide.
pub const SET_ENTITY_EXPORT: &str = "set_entity";
pub const SET_READONLY_EXPORT: &str = "set_readonly";

/// Which update entry points a template block registered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TemplateHandlers {
    pub set_entity: bool,
    pub set_readonly: bool,
}

impl TemplateHandlers {
    pub fn is_empty(&self) -> bool {
        !self.set_entity && !self.set_readonly
    }
}

#[derive(Debug, Default)]
pub struct TemplateBridge {
    handlers: RefCell<HashMap<String, TemplateHandlers>>,
}

impl TemplateBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, block_id: &str, handlers: TemplateHandlers) {
        debug!(block_id, ?handlers, "Registering template handlers");
        self.handlers
            .borrow_mut()
            .insert(block_id.to_string(), handlers);
    }

    pub fn unregister(&self, block_id: &str) -> bool {
        self.handlers.borrow_mut().remove(block_id).is_some()
    }

    pub fn handlers(&self, block_id: &str) -> Option<TemplateHandlers> {
        self.handlers.borrow().get(block_id).copied()
    }

    pub fn len(&self) -> usize {
        self.handlers.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.borrow().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_unregister() {
        let bridge = TemplateBridge::new();
        let handlers = TemplateHandlers {
            set_entity: true,
            set_readonly: false,
        };
        bridge.register("b1", handlers);
        assert_eq!(bridge.handlers("b1"), Some(handlers));
        assert!(bridge.unregister("b1"));
        assert!(!bridge.unregister("b1"));
        assert!(bridge.is_empty());
    }
}

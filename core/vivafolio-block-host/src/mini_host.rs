//! Nested-block composition.
//!
//! A `MiniHost` belongs to one loader and answers that block's
//! `vivafolio:embed:entity` hooks by mounting child loaders for other
//! entities in the same graph. The `HookEmbedder` shared by a host routes
//! every hook to the block's mini-host first and falls back to an optional
//! outer handler.

use crate::classify::block_type_for;
use crate::error::BlockLoaderError;
use crate::host::BlockHost;
use crate::loader::{BlockLoader, LoaderOptions};
use crate::sandbox::UpdateCallback;
use crate::view::BlockView;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vivafolio_types::{
    BlockNotification, DisplayMode, EMBED_ENTITY_HOOK, EntityGraph, HookData, HookErrorCode,
    HookResponse, NodeId,
};

/// Longest chain of blocks, counting the top-level one, that may be nested
/// inside each other.
pub const MAX_NESTING_DEPTH: usize = 8;

/// Parameters for mounting a nested block.
#[derive(Clone)]
pub struct NestedBlockOptions {
    pub entity_id: String,
    pub entity_type_id: String,
    pub container: NodeId,
    /// Overrides the parent's update callback for this child.
    pub on_block_update: Option<UpdateCallback>,
}

struct NestedMount {
    hook_id: String,
    entity_type_id: String,
    container: NodeId,
    loader: BlockLoader,
}

pub struct MiniHost {
    host: Rc<BlockHost>,
    parent_view: Rc<RefCell<BlockView>>,
    inherited: LoaderOptions,
    mounts: BTreeMap<String, NestedMount>,
}

impl MiniHost {
    pub(crate) fn new(
        host: Rc<BlockHost>,
        parent_view: Rc<RefCell<BlockView>>,
        inherited: LoaderOptions,
    ) -> Self {
        Self {
            host,
            parent_view,
            inherited,
            mounts: BTreeMap::new(),
        }
    }

    /// Handles an entity-embedding hook. Returns `Ok(None)` for hook types
    /// this mini-host does not serve.
    pub fn handle_hook_message(
        &mut self,
        data: &HookData,
    ) -> Result<Option<HookResponse>, BlockLoaderError> {
        if data.hook_type != EMBED_ENTITY_HOOK {
            return Ok(None);
        }

        let Some(container) = data.node else {
            if let Some(requested) = &data.hook_id
                && let Some(mount) = self.mounts.get(&data.entity_id)
                && mount.hook_id != *requested
            {
                debug!(
                    entity_id = %data.entity_id,
                    hook_id = %requested,
                    current = %mount.hook_id,
                    "Teardown for a superseded hook, keeping current mount"
                );
                return Ok(Some(HookResponse::granted(requested.clone())));
            }
            let recorded = self.mounts.get(&data.entity_id).map(|m| m.hook_id.clone());
            if !self.unmount_nested_block(&data.entity_id) {
                warn!(entity_id = %data.entity_id, "Teardown for an entity with no nested block");
            }
            let hook_id = data.hook_id.clone().or(recorded).unwrap_or_default();
            return Ok(Some(HookResponse::granted(hook_id)));
        };

        let entity = self
            .parent_view
            .borrow()
            .graph
            .entity(&data.entity_id)
            .cloned()
            .ok_or_else(|| BlockLoaderError::EntityNotFound {
                entity_id: data.entity_id.clone(),
            })?;

        // Re-sent grant for an existing mount: move it if the node changed
        // and refresh it in place.
        if let Some(hook_id) = &data.hook_id
            && self
                .mounts
                .get(&data.entity_id)
                .is_some_and(|m| m.hook_id == *hook_id)
        {
            self.relocate_mount(&data.entity_id, container)?;
            let graph = self.parent_view.borrow().graph.clone();
            self.refresh_mount(&data.entity_id, &graph)?;
            return Ok(Some(HookResponse::granted(hook_id.clone())));
        }

        let entity_type_id = self.host.classifier().classify(&entity);
        let hook_id = data
            .hook_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let mounted = self.mount_with_hook_id(
            NestedBlockOptions {
                entity_id: data.entity_id.clone(),
                entity_type_id,
                container,
                on_block_update: None,
            },
            hook_id.clone(),
        );
        match mounted {
            Ok(()) => Ok(Some(HookResponse::granted(hook_id))),
            Err(e @ BlockLoaderError::NestingRefused { .. }) => {
                warn!(entity_id = %data.entity_id, error = %e, "Embed refused");
                Ok(Some(HookResponse::error(HookErrorCode::Forbidden, e.to_string())))
            }
            Err(e) => Err(e),
        }
    }

    /// Mounts a child loader for `options.entity_id` and returns its hook id.
    pub fn mount_nested_block(&mut self, options: NestedBlockOptions) -> Result<String, BlockLoaderError> {
        let hook_id = Uuid::new_v4().to_string();
        self.mount_with_hook_id(options, hook_id.clone())?;
        Ok(hook_id)
    }

    fn mount_with_hook_id(
        &mut self,
        options: NestedBlockOptions,
        hook_id: String,
    ) -> Result<(), BlockLoaderError> {
        let ancestors = self.check_nesting(&options.entity_id)?;
        if let Some(mut previous) = self.mounts.remove(&options.entity_id) {
            previous.loader.destroy();
            if previous.container != options.container {
                self.host.document().borrow_mut().remove(previous.container);
            }
        }

        let notification = self.nested_notification(&options.entity_id, &options.entity_type_id);
        let loader_options = LoaderOptions {
            container: options.container,
            on_block_update: options
                .on_block_update
                .or_else(|| self.inherited.on_block_update.clone()),
            readonly: self.inherited.readonly,
            nested: true,
            ancestors,
        };

        let mut loader = BlockLoader::new(self.host.clone(), loader_options);
        loader.load_block(&notification)?;

        info!(
            entity_id = %options.entity_id,
            entity_type = %options.entity_type_id,
            block_type = %notification.block_type,
            hook_id = %hook_id,
            "Nested block mounted"
        );
        self.mounts.insert(
            options.entity_id,
            NestedMount {
                hook_id,
                entity_type_id: options.entity_type_id,
                container: options.container,
                loader,
            },
        );
        Ok(())
    }

    /// Entity ids from the top-level block down to this mini-host's block.
    fn lineage(&self) -> Vec<String> {
        let mut lineage = self.inherited.ancestors.clone();
        let own = self.parent_view.borrow().block_entity.entity_id.clone();
        if !own.is_empty() {
            lineage.push(own);
        }
        lineage
    }

    /// Refuses a mount for an entity that is already an ancestor (the block
    /// itself included) or one that would nest too deep. Returns the lineage
    /// the child inherits.
    fn check_nesting(&self, entity_id: &str) -> Result<Vec<String>, BlockLoaderError> {
        let lineage = self.lineage();
        let reason = if lineage.iter().any(|a| a == entity_id) {
            "entity is already rendered by an enclosing block".to_string()
        } else if lineage.len() >= MAX_NESTING_DEPTH {
            format!("nesting is limited to {MAX_NESTING_DEPTH} levels")
        } else {
            return Ok(lineage);
        };
        Err(BlockLoaderError::NestingRefused {
            entity_id: entity_id.to_string(),
            reason,
        })
    }

    fn relocate_mount(&mut self, entity_id: &str, container: NodeId) -> Result<(), BlockLoaderError> {
        let Some(mount) = self.mounts.get_mut(entity_id) else {
            return Ok(());
        };
        if mount.container != container {
            mount.loader.relocate(container)?;
            mount.container = container;
        }
        Ok(())
    }

    /// Destroys the child for `entity_id` and removes its container.
    pub fn unmount_nested_block(&mut self, entity_id: &str) -> bool {
        let Some(mut mount) = self.mounts.remove(entity_id) else {
            return false;
        };
        mount.loader.destroy();
        self.host.document().borrow_mut().remove(mount.container);
        debug!(entity_id, hook_id = %mount.hook_id, "Nested block unmounted");
        true
    }

    pub fn unmount_all(&mut self) {
        let entity_ids: Vec<String> = self.mounts.keys().cloned().collect();
        for entity_id in entity_ids {
            self.unmount_nested_block(&entity_id);
        }
    }

    /// Pushes a new parent graph into every child. Children whose entity is
    /// gone from the graph are unmounted.
    pub fn refresh(&mut self, graph: &EntityGraph) {
        let entity_ids: Vec<String> = self.mounts.keys().cloned().collect();
        for entity_id in entity_ids {
            if !graph.contains(&entity_id) {
                debug!(entity_id = %entity_id, "Entity left the graph, unmounting nested block");
                self.unmount_nested_block(&entity_id);
                continue;
            }
            if let Err(e) = self.refresh_mount(&entity_id, graph) {
                warn!(entity_id = %entity_id, error = %e, "Nested block update failed");
            }
        }
    }

    fn refresh_mount(&mut self, entity_id: &str, graph: &EntityGraph) -> Result<(), BlockLoaderError> {
        let Some(entity_type_id) = self.mounts.get(entity_id).map(|m| m.entity_type_id.clone()) else {
            return Ok(());
        };
        let mut notification = self.nested_notification(entity_id, &entity_type_id);
        notification.entity_graph = graph.clone();
        match self.mounts.get_mut(entity_id) {
            Some(mount) => mount.loader.update_block(&notification),
            None => Ok(()),
        }
    }

    /// Synthetic notification for a nested block: inline, sharing the
    /// parent's current graph.
    fn nested_notification(&self, entity_id: &str, entity_type_id: &str) -> BlockNotification {
        let block_type = block_type_for(entity_type_id);
        BlockNotification {
            block_id: format!("nested-{entity_id}"),
            resources: self.host.registry().resources_for(&block_type),
            block_type,
            display_mode: DisplayMode::Inline,
            source_uri: String::new(),
            range: Default::default(),
            entity_id: Some(entity_id.to_string()),
            entity_graph: self.parent_view.borrow().graph.clone(),
            supports_hot_reload: None,
            initial_height: None,
        }
    }

    pub fn mounted_entities(&self) -> Vec<String> {
        self.mounts.keys().cloned().collect()
    }

    pub fn hook_id_for(&self, entity_id: &str) -> Option<&str> {
        self.mounts.get(entity_id).map(|m| m.hook_id.as_str())
    }

    pub fn nested_loader(&self, entity_id: &str) -> Option<&BlockLoader> {
        self.mounts.get(entity_id).map(|m| &m.loader)
    }

    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty()
    }
}

/// Outer handler for hooks no mini-host serves.
pub type HookHandler = Box<dyn Fn(&HookData) -> HookResponse>;

/// Routes hook messages: the block's mini-host first, then the fallback.
#[derive(Default)]
pub struct HookEmbedder {
    fallback: RefCell<Option<HookHandler>>,
}

impl HookEmbedder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fallback(&self, handler: impl Fn(&HookData) -> HookResponse + 'static) {
        *self.fallback.borrow_mut() = Some(Box::new(handler));
    }

    pub fn dispatch(
        &self,
        mini_host: &RefCell<MiniHost>,
        data: &HookData,
    ) -> Result<HookResponse, BlockLoaderError> {
        let handled = {
            let mut host = mini_host
                .try_borrow_mut()
                .map_err(|_| BlockLoaderError::HookReentered {
                    entity_id: data.entity_id.clone(),
                })?;
            host.handle_hook_message(data)?
        };
        if let Some(response) = handled {
            return Ok(response);
        }
        match self.fallback.borrow().as_ref() {
            Some(handler) => Ok(handler(data)),
            None => {
                debug!(hook_type = %data.hook_type, "No handler for hook");
                Ok(HookResponse::not_implemented(&data.hook_type))
            }
        }
    }
}

struct HookGrant {
    entity_id: String,
    hook_id: String,
}

/// A block's handle for issuing hooks from inside its sandbox. Grants are
/// indexed by slot so the guest only ever holds an integer.
#[derive(Clone)]
pub(crate) struct HookChannel {
    embedder: Rc<HookEmbedder>,
    mini_host: Rc<RefCell<MiniHost>>,
    grants: Rc<RefCell<Vec<Option<HookGrant>>>>,
}

impl HookChannel {
    pub(crate) fn new(embedder: Rc<HookEmbedder>, mini_host: Rc<RefCell<MiniHost>>) -> Self {
        Self {
            embedder,
            mini_host,
            grants: Rc::new(RefCell::new(Vec::new())),
        }
    }

    /// Requests an embedded block for `entity_id` inside `node`. Returns the
    /// grant slot, or -1 when the hook was refused or failed.
    ///
    /// A live grant for the same entity is re-sent with its hook id, so a
    /// re-render moves and refreshes the existing child and keeps its slot.
    pub(crate) fn embed(&self, entity_id: &str, node: NodeId) -> i32 {
        let mut data = HookData::embed(entity_id, node);
        let existing = {
            let grants = self.grants.borrow();
            grants.iter().enumerate().find_map(|(slot, grant)| {
                grant
                    .as_ref()
                    .filter(|g| g.entity_id == entity_id)
                    .map(|g| (slot, g.hook_id.clone()))
            })
        };
        if let Some((_, hook_id)) = &existing {
            data.hook_id = Some(hook_id.clone());
        }

        let response = match self.embedder.dispatch(&self.mini_host, &data) {
            Ok(response) => response,
            Err(e) => {
                warn!(entity_id, error = %e, "Embed hook failed");
                return -1;
            }
        };
        let Some(hook_id) = response.hook_id() else {
            warn!(entity_id, code = ?response.error_code(), "Embed hook refused");
            return -1;
        };
        let grant = HookGrant {
            entity_id: entity_id.to_string(),
            hook_id: hook_id.to_string(),
        };
        let mut grants = self.grants.borrow_mut();
        let slot = match existing {
            Some((slot, _)) => {
                grants[slot] = Some(grant);
                slot
            }
            None => {
                grants.push(Some(grant));
                grants.len() - 1
            }
        };
        i32::try_from(slot).unwrap_or(-1)
    }

    /// Tears down the grant in `slot`. Unknown slots are ignored.
    pub(crate) fn release(&self, slot: i32) -> Result<(), BlockLoaderError> {
        let grant = usize::try_from(slot)
            .ok()
            .and_then(|i| self.grants.borrow_mut().get_mut(i).and_then(Option::take));
        let Some(grant) = grant else {
            debug!(slot, "Release of unknown hook slot");
            return Ok(());
        };
        self.embedder.dispatch(
            &self.mini_host,
            &HookData::teardown(grant.entity_id, Some(grant.hook_id)),
        )?;
        Ok(())
    }
}

//! Block lifecycle: load, update, destroy, diagnostics.
//!
//! A `BlockLoader` owns one container in the shared document. Each
//! `load_block` tears down the previous mount, prefetches local modules,
//! evaluates the entry in a fresh sandbox and renders it. `update_block`
//! only pushes new data into what is already mounted and never refetches.

use crate::component::{BlockComponent, BlockMode, MountedComponent};
use crate::diagnostics::BlockLoaderDiagnostics;
use crate::error::BlockLoaderError;
use crate::graph_context::Subscription;
use crate::host::BlockHost;
use crate::mini_host::{HookChannel, MiniHost, NestedBlockOptions};
use crate::resources::{LocalModuleEntry, ResourceLayer, sha256_hex};
use crate::sandbox::{BlockSandbox, BlockState, DependencyReport, SandboxMetrics, UpdateCallback};
use crate::template::{SET_ENTITY_EXPORT, SET_READONLY_EXPORT, TemplateHandlers};
use crate::view::BlockView;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;
use tracing::{debug, info, warn};
use vivafolio_types::{
    BlockNotification, DisplayMode, Entity, EntityUpdate, HookData, HookResponse, NodeId,
};
use wasmtime::Instance;

/// Container attributes that travel with a block when it is relocated.
const CONTAINER_ATTRIBUTES: [&str; 4] = [
    "data-block-id",
    "data-display-mode",
    "data-initial-height",
    "data-block-state",
];

/// Class of the node shown when a load fails.
pub const ERROR_CLASS: &str = "vivafolio-block-error";

/// Per-loader settings.
#[derive(Clone)]
pub struct LoaderOptions {
    pub container: NodeId,
    pub on_block_update: Option<UpdateCallback>,
    pub readonly: bool,
    pub(crate) nested: bool,
    /// Entity ids of the blocks this one is nested under, outermost first.
    pub(crate) ancestors: Vec<String>,
}

impl LoaderOptions {
    pub fn new(container: NodeId) -> Self {
        Self {
            container,
            on_block_update: None,
            readonly: false,
            nested: false,
            ancestors: Vec::new(),
        }
    }

    pub fn with_update_callback(mut self, callback: impl Fn(&EntityUpdate) + 'static) -> Self {
        self.on_block_update = Some(Rc::new(callback));
        self
    }

    pub fn readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }
}

enum Mounted {
    Bundle {
        sandbox: BlockSandbox,
        component: MountedComponent,
    },
    Template {
        script: Option<(BlockSandbox, Instance)>,
    },
}

pub struct BlockLoader {
    host: Rc<BlockHost>,
    options: LoaderOptions,
    block_id: String,
    notification: Option<BlockNotification>,
    view: Rc<RefCell<BlockView>>,
    resources: ResourceLayer,
    mode: Option<BlockMode>,
    mounted: Option<Mounted>,
    mini_host: Rc<RefCell<MiniHost>>,
    diagnostics: Option<BlockLoaderDiagnostics>,
    subscription: Option<Subscription>,
    destroyed: bool,
}

impl BlockLoader {
    pub fn new(host: Rc<BlockHost>, options: LoaderOptions) -> Self {
        let view = Rc::new(RefCell::new(BlockView {
            readonly: options.readonly,
            ..BlockView::default()
        }));
        let resources = ResourceLayer::new(
            host.fetcher(),
            host.cache(),
            host.config().compute_integrity,
        );
        let mini_host = Rc::new(RefCell::new(MiniHost::new(
            host.clone(),
            view.clone(),
            options.clone(),
        )));
        Self {
            host,
            options,
            block_id: String::new(),
            notification: None,
            view,
            resources,
            mode: None,
            mounted: None,
            mini_host,
            diagnostics: None,
            subscription: None,
            destroyed: false,
        }
    }

    // ================================================================
    // Lifecycle
    // ================================================================

    /// Loads (or reloads) the block described by `notification`. On failure
    /// the container shows an error indicator and the error is returned.
    pub fn load_block(&mut self, notification: &BlockNotification) -> Result<(), BlockLoaderError> {
        if self.destroyed {
            return Err(BlockLoaderError::Destroyed(notification.block_id.clone()));
        }
        let started = Instant::now();
        notification.entity_graph.validate()?;

        self.teardown_mount();
        self.block_id = notification.block_id.clone();
        self.view.borrow_mut().apply(notification);
        self.notification = Some(notification.clone());
        self.resources.set_notification(notification);
        self.diagnostics = None;
        self.attach_to_host(notification);
        self.apply_container_attributes(notification);

        let result = match BlockMode::detect(notification) {
            Some(mode) => {
                info!(block_id = %self.block_id, mode = mode.name(), "Loading block");
                self.mode = Some(mode.clone());
                match mode {
                    BlockMode::Bundle { entry } => self.load_bundle(&entry),
                    BlockMode::Html { template, script } => self.load_template(&template, script.as_deref()),
                }
            }
            None => {
                self.mode = None;
                Err(BlockLoaderError::NoEntry {
                    block_id: self.block_id.clone(),
                })
            }
        };

        match result {
            Ok(()) => {
                self.set_container_state("ready");
                info!(
                    block_id = %self.block_id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Block loaded"
                );
                Ok(())
            }
            Err(e) => {
                self.mounted = None;
                self.render_failure(&e);
                warn!(block_id = %self.block_id, error = %e, "Block failed to load");
                Err(e)
            }
        }
    }

    /// Applies a newer notification to the mounted block without refetching
    /// or re-evaluating anything. Before the first load completes the data is
    /// only recorded; after `destroy` this is a no-op.
    pub fn update_block(&mut self, notification: &BlockNotification) -> Result<(), BlockLoaderError> {
        if self.destroyed {
            debug!(block_id = %notification.block_id, "Update after destroy ignored");
            return Ok(());
        }
        notification.entity_graph.validate()?;

        self.view.borrow_mut().apply(notification);
        self.notification = Some(notification.clone());
        if !self.options.nested {
            self.host
                .graph_context()
                .set_graph(&notification.block_id, notification.entity_graph.clone());
        }
        self.apply_container_attributes(notification);

        let generation = self.view.borrow().generation;
        let block_id = self.block_id.clone();
        let bridge = self.host.installed_template_bridge().cloned();
        match &mut self.mounted {
            None => {
                debug!(block_id = %notification.block_id, generation, "Block not mounted, update recorded");
                return Ok(());
            }
            Some(Mounted::Bundle { sandbox, component }) => component.update(sandbox)?,
            Some(Mounted::Template { script: Some((sandbox, instance)) }) => {
                let handlers = bridge
                    .and_then(|b| b.handlers(&block_id))
                    .unwrap_or_default();
                push_template_update(sandbox, *instance, handlers)?;
            }
            Some(Mounted::Template { script: None }) => {}
        }

        self.mini_host.borrow_mut().refresh(&notification.entity_graph);
        debug!(block_id = %self.block_id, generation, "Block updated");
        Ok(())
    }

    /// Unmounts nested blocks, releases the sandbox and subscriptions and
    /// empties the container. Idempotent.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        self.teardown_mount();
        self.subscription = None;
        if !self.options.nested && !self.block_id.is_empty() {
            self.host.graph_context().remove_graph(&self.block_id);
        }
        info!(block_id = %self.block_id, "Block destroyed");
    }

    /// Moves the rendered block into `container` without refetching or
    /// re-evaluating anything. The old container is left empty.
    pub(crate) fn relocate(&mut self, container: NodeId) -> Result<(), BlockLoaderError> {
        let previous = self.options.container;
        if previous == container {
            return Ok(());
        }
        {
            let mut doc = self.host.document().borrow_mut();
            let children: Vec<NodeId> = doc.children(previous).to_vec();
            for child in children {
                doc.append_child(container, child)?;
            }
            for name in CONTAINER_ATTRIBUTES {
                if let Some(value) = doc.attribute(previous, name).map(str::to_string) {
                    doc.set_attribute(container, name, &value);
                }
            }
        }

        self.options.container = container;
        match &mut self.mounted {
            Some(Mounted::Bundle { sandbox, component }) => {
                sandbox.state_mut().retarget(previous, container);
                component.retarget(previous, container);
            }
            Some(Mounted::Template {
                script: Some((sandbox, _)),
            }) => sandbox.state_mut().retarget(previous, container),
            _ => {}
        }
        debug!(block_id = %self.block_id, from = %previous, to = %container, "Block relocated");
        Ok(())
    }

    // ================================================================
    // Modes
    // ================================================================

    fn load_bundle(&mut self, entry: &str) -> Result<(), BlockLoaderError> {
        let prefetched = self.resources.prefetch_local_resources(entry);
        debug!(block_id = %self.block_id, entry, prefetched, "Local modules prefetched");

        let url = self.resources.resolve_resource_url(entry).unwrap_or_default();
        let bundle = self.resources.fetch_resource(entry)?;
        let integrity = self
            .resources
            .compute_integrity()
            .then(|| sha256_hex(&bundle.bytes));

        let mut sandbox = self.create_sandbox()?;
        let evaluated = sandbox.evaluate(&mut self.resources, &bundle.bytes, entry);
        self.record_diagnostics(url, integrity, sandbox.report());
        let instance = evaluated?;

        self.ensure_alive()?;
        let component = BlockComponent::classify(&mut sandbox, instance, &self.block_id)?;
        debug!(block_id = %self.block_id, kind = component.kind(), "Component classified");
        self.ensure_alive()?;
        let component =
            MountedComponent::render(&mut sandbox, component, self.options.container, &self.block_id)?;

        self.mounted = Some(Mounted::Bundle { sandbox, component });
        Ok(())
    }

    fn load_template(&mut self, template: &str, script: Option<&str>) -> Result<(), BlockLoaderError> {
        let template_url = self.resources.resolve_resource_url(template).unwrap_or_default();
        let html = self.resources.fetch_resource(template)?.text();
        self.ensure_alive()?;
        {
            let mut doc = self.host.document().borrow_mut();
            doc.set_inner_html(self.options.container, &html)?;
        }

        let Some(script) = script else {
            let integrity = self
                .resources
                .compute_integrity()
                .then(|| sha256_hex(html.as_bytes()));
            self.record_diagnostics(template_url, integrity, &DependencyReport::default());
            self.mounted = Some(Mounted::Template { script: None });
            return Ok(());
        };

        self.resources.prefetch_local_resources(script);
        let url = self.resources.resolve_resource_url(script).unwrap_or_default();
        let source = self.resources.fetch_resource(script)?;
        let integrity = self
            .resources
            .compute_integrity()
            .then(|| sha256_hex(&source.bytes));

        let mut sandbox = self.create_sandbox()?;
        let evaluated = sandbox.evaluate(&mut self.resources, &source.bytes, script);
        self.record_diagnostics(url, integrity, sandbox.report());
        let instance = evaluated?;
        self.ensure_alive()?;

        let handlers = TemplateHandlers {
            set_entity: sandbox.has_export(instance, SET_ENTITY_EXPORT),
            set_readonly: sandbox.has_export(instance, SET_READONLY_EXPORT),
        };
        if let Some(bridge) = self.host.template_bridge()
            && !handlers.is_empty()
        {
            bridge.register(&self.block_id, handlers);
            push_template_update(&mut sandbox, instance, handlers)?;
        }

        self.mounted = Some(Mounted::Template {
            script: Some((sandbox, instance)),
        });
        Ok(())
    }

    fn create_sandbox(&self) -> Result<BlockSandbox, BlockLoaderError> {
        let hooks = HookChannel::new(self.host.hook_embedder(), self.mini_host.clone());
        let state = BlockState::new(
            &self.block_id,
            self.host.document().clone(),
            self.options.container,
            self.view.clone(),
            self.update_sink(),
            hooks,
            &self.host.config().resource_limits,
        );
        BlockSandbox::new(
            self.host.engine(),
            state,
            self.host.config().allowlist.clone(),
            self.host.config().resource_limits.clone(),
        )
    }

    /// Updates from the guest go to this loader's callback (or the host's
    /// default channel), then to graph subscribers.
    fn update_sink(&self) -> UpdateCallback {
        let context = self.host.graph_context();
        let sink = self
            .options
            .on_block_update
            .clone()
            .or_else(|| self.host.on_block_update());
        Rc::new(move |update: &EntityUpdate| context.publish(update, sink.as_ref()))
    }

    // ================================================================
    // Host wiring
    // ================================================================

    /// Top-level blocks contribute their graph to the shared context and
    /// install the hook embedder; nested blocks subscribe to their entity.
    fn attach_to_host(&mut self, notification: &BlockNotification) {
        let context = self.host.graph_context();
        if !self.options.nested {
            context.set_graph(&notification.block_id, notification.entity_graph.clone());
            self.host.hook_embedder();
            return;
        }

        let Some(entity_id) = notification.block_entity_id() else {
            return;
        };
        let view = Rc::downgrade(&self.view);
        self.subscription = Some(context.subscribe_to_entity(entity_id, move |update| {
            let Some(view) = view.upgrade() else {
                return;
            };
            let Ok(mut view) = view.try_borrow_mut() else {
                debug!(entity_id = %update.entity_id, "View busy, skipping entity refresh");
                return;
            };
            view.refresh_entity(&Entity::new(
                update.entity_id.clone(),
                update.properties.clone(),
            ));
        }));
    }

    fn teardown_mount(&mut self) {
        self.mini_host.borrow_mut().unmount_all();
        if let Some(bridge) = self.host.installed_template_bridge() {
            bridge.unregister(&self.block_id);
        }
        self.mounted = None;
        self.host
            .document()
            .borrow_mut()
            .clear_children(self.options.container);
    }

    fn apply_container_attributes(&self, notification: &BlockNotification) {
        let container = self.options.container;
        let mut doc = self.host.document().borrow_mut();
        doc.set_attribute(container, "data-block-id", &notification.block_id);
        let display = match notification.display_mode {
            DisplayMode::MultiLine => "multi-line",
            DisplayMode::Inline => "inline",
        };
        doc.set_attribute(container, "data-display-mode", display);
        if let Some(height) = notification.initial_height {
            doc.set_attribute(container, "data-initial-height", &height.to_string());
        }
    }

    fn set_container_state(&self, state: &str) {
        self.host
            .document()
            .borrow_mut()
            .set_attribute(self.options.container, "data-block-state", state);
    }

    fn render_failure(&self, error: &BlockLoaderError) {
        if self.destroyed {
            return;
        }
        let container = self.options.container;
        let mut doc = self.host.document().borrow_mut();
        doc.clear_children(container);
        doc.set_attribute(container, "data-block-state", "error");
        let notice = doc.create_element("div");
        doc.set_attribute(notice, "class", ERROR_CLASS);
        doc.set_attribute(notice, "role", "alert");
        let message = format!("Block failed to load: {error}");
        if let Err(e) = doc
            .set_text_content(notice, &message)
            .and_then(|_| doc.append_child(container, notice))
        {
            warn!(block_id = %self.block_id, error = %e, "Could not render failure indicator");
        }
    }

    fn record_diagnostics(&mut self, bundle_url: String, integrity: Option<String>, report: &DependencyReport) {
        self.diagnostics = Some(BlockLoaderDiagnostics::new(
            bundle_url,
            integrity,
            report,
            self.host.config().allowlist.specifiers(),
            self.resources.modules(),
        ));
    }

    fn ensure_alive(&self) -> Result<(), BlockLoaderError> {
        if self.destroyed {
            Err(BlockLoaderError::Destroyed(self.block_id.clone()))
        } else {
            Ok(())
        }
    }

    // ================================================================
    // Queries and hooks
    // ================================================================

    /// Routes a hook through the host's embedder, with this block's
    /// mini-host as first responder.
    pub fn handle_hook_message(&self, data: &HookData) -> Result<HookResponse, BlockLoaderError> {
        if self.destroyed {
            return Err(BlockLoaderError::Destroyed(self.block_id.clone()));
        }
        self.host.hook_embedder().dispatch(&self.mini_host, data)
    }

    pub fn mount_nested_block(&self, options: NestedBlockOptions) -> Result<String, BlockLoaderError> {
        self.mini_host.borrow_mut().mount_nested_block(options)
    }

    pub fn unmount_nested_block(&self, entity_id: &str) -> bool {
        self.mini_host.borrow_mut().unmount_nested_block(entity_id)
    }

    pub fn mini_host(&self) -> &Rc<RefCell<MiniHost>> {
        &self.mini_host
    }

    /// Report of the most recent evaluation; `None` before any load got as
    /// far as evaluating code.
    pub fn get_diagnostics(&self) -> Option<&BlockLoaderDiagnostics> {
        self.diagnostics.as_ref()
    }

    pub fn local_module(&self, logical_name: &str) -> Option<&LocalModuleEntry> {
        self.resources.module(logical_name)
    }

    pub fn block_id(&self) -> &str {
        &self.block_id
    }

    pub fn container(&self) -> NodeId {
        self.options.container
    }

    pub fn mode(&self) -> Option<&BlockMode> {
        self.mode.as_ref()
    }

    pub fn is_loaded(&self) -> bool {
        self.mounted.is_some()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn is_nested(&self) -> bool {
        self.options.nested
    }

    /// Kind of the mounted component in bundle mode.
    pub fn component_kind(&self) -> Option<&'static str> {
        match &self.mounted {
            Some(Mounted::Bundle { component, .. }) => Some(component.component().kind()),
            _ => None,
        }
    }

    pub fn supports_hot_reload(&self) -> bool {
        self.notification
            .as_ref()
            .and_then(|n| n.supports_hot_reload)
            .unwrap_or(false)
    }

    pub fn view(&self) -> BlockView {
        self.view.borrow().clone()
    }

    pub fn sandbox_metrics(&self) -> Option<SandboxMetrics> {
        match &self.mounted {
            Some(Mounted::Bundle { sandbox, .. }) => Some(sandbox.metrics()),
            Some(Mounted::Template {
                script: Some((sandbox, _)),
            }) => Some(sandbox.metrics()),
            _ => None,
        }
    }
}

fn push_template_update(
    sandbox: &mut BlockSandbox,
    instance: Instance,
    handlers: TemplateHandlers,
) -> Result<(), BlockLoaderError> {
    if handlers.set_entity {
        sandbox.call_unit(instance, SET_ENTITY_EXPORT)?;
    }
    if handlers.set_readonly {
        sandbox.call_unit(instance, SET_READONLY_EXPORT)?;
    }
    Ok(())
}

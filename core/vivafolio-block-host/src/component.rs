//! Mode detection, export classification and the single render dispatcher.

use crate::error::BlockLoaderError;
use crate::resources::{BUNDLE_ENTRIES, TEMPLATE_ENTRIES, TEMPLATE_SCRIPT};
use crate::sandbox::BlockSandbox;
use tracing::debug;
use vivafolio_types::{BlockNotification, NodeId};
use wasmtime::Instance;

pub const ELEMENT_EXPORT: &str = "element";
pub const INIT_EXPORT: &str = "init";
pub const UPDATE_ENTITY_EXPORT: &str = "update_entity";
pub const RENDER_EXPORT: &str = "render";
pub const CREATE_NODE_EXPORT: &str = "create_node";

/// Class of the node framework-rendered components are mounted into.
pub const MOUNT_CLASS: &str = "vivafolio-block-mount";

/// How a notification's resources are turned into a rendered block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockMode {
    /// Inject a template, optionally driven by a companion script.
    Html {
        template: String,
        script: Option<String>,
    },
    /// Evaluate a bundle and render its component export.
    Bundle { entry: String },
}

impl BlockMode {
    /// A template entry always selects html mode; otherwise the first
    /// bundle entry present selects bundle mode.
    pub fn detect(notification: &BlockNotification) -> Option<Self> {
        if let Some(template) = TEMPLATE_ENTRIES
            .iter()
            .find(|name| notification.has_resource(name))
        {
            return Some(Self::Html {
                template: template.to_string(),
                script: notification
                    .has_resource(TEMPLATE_SCRIPT)
                    .then(|| TEMPLATE_SCRIPT.to_string()),
            });
        }
        BUNDLE_ENTRIES
            .iter()
            .find(|name| notification.has_resource(name))
            .map(|entry| Self::Bundle {
                entry: entry.to_string(),
            })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Html { .. } => "html",
            Self::Bundle { .. } => "bundle",
        }
    }
}

/// The renderable shape of an evaluated bundle, decided once from its exports.
#[derive(Debug, Clone, Copy)]
pub enum BlockComponent {
    /// `element() -> node` plus `init()`, optionally `update_entity()`.
    CustomElementFactory {
        instance: Instance,
        update_entity: bool,
    },
    /// `render() -> node`, re-run on every update.
    Direct { instance: Instance },
    /// `create_node() -> node`, appended as-is.
    VanillaNode { instance: Instance },
}

impl BlockComponent {
    pub fn classify(
        sandbox: &mut BlockSandbox,
        instance: Instance,
        block_id: &str,
    ) -> Result<Self, BlockLoaderError> {
        if sandbox.has_export(instance, ELEMENT_EXPORT) {
            if !sandbox.has_export(instance, INIT_EXPORT) {
                return Err(BlockLoaderError::Evaluation {
                    block_id: block_id.to_string(),
                    stage: "classification".into(),
                    message: format!("'{ELEMENT_EXPORT}' factory without '{INIT_EXPORT}'"),
                });
            }
            return Ok(Self::CustomElementFactory {
                instance,
                update_entity: sandbox.has_export(instance, UPDATE_ENTITY_EXPORT),
            });
        }
        if sandbox.has_export(instance, RENDER_EXPORT) {
            return Ok(Self::Direct { instance });
        }
        if sandbox.has_export(instance, CREATE_NODE_EXPORT) {
            return Ok(Self::VanillaNode { instance });
        }
        Err(BlockLoaderError::NoRenderableExport {
            block_id: block_id.to_string(),
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::CustomElementFactory { .. } => "custom-element-factory",
            Self::Direct { .. } => "direct",
            Self::VanillaNode { .. } => "vanilla-node",
        }
    }
}

/// A component rendered into a container.
#[derive(Debug)]
pub struct MountedComponent {
    component: BlockComponent,
    mount: NodeId,
    root: Option<NodeId>,
    block_id: String,
}

impl MountedComponent {
    pub fn component(&self) -> &BlockComponent {
        &self.component
    }

    /// The node the component's output lives under.
    pub fn mount(&self) -> NodeId {
        self.mount
    }

    /// The node last produced by the component, if it returned one.
    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    /// Renders `component` into `container`.
    pub fn render(
        sandbox: &mut BlockSandbox,
        component: BlockComponent,
        container: NodeId,
        block_id: &str,
    ) -> Result<Self, BlockLoaderError> {
        let mut mounted = Self {
            component,
            mount: container,
            root: None,
            block_id: block_id.to_string(),
        };

        match component {
            BlockComponent::CustomElementFactory { instance, .. } => {
                let raw = sandbox.call_i32(instance, ELEMENT_EXPORT)?;
                let element = mounted.guest_node(raw, ELEMENT_EXPORT)?;
                {
                    let state = sandbox.state();
                    let mut doc = state.document.borrow_mut();
                    state.check_writable(&doc, element)?;
                    doc.set_attribute(element, "data-block-id", block_id);
                    doc.append_child(container, element)?;
                }
                sandbox.state_mut().mount_node = Some(element);
                mounted.root = Some(element);
                sandbox.call_unit(instance, INIT_EXPORT)?;
            }
            BlockComponent::Direct { instance } => {
                let mount = {
                    let state = sandbox.state();
                    let mut doc = state.document.borrow_mut();
                    let mount = doc.create_element("div");
                    doc.set_attribute(mount, "class", MOUNT_CLASS);
                    doc.append_child(container, mount)?;
                    mount
                };
                sandbox.state_mut().mount_node = Some(mount);
                mounted.mount = mount;
                mounted.render_direct(sandbox, instance)?;
            }
            BlockComponent::VanillaNode { instance } => {
                sandbox.state_mut().mount_node = Some(container);
                mounted.render_vanilla(sandbox, instance)?;
            }
        }

        debug!(block_id, kind = component.kind(), "Component rendered");
        Ok(mounted)
    }

    pub(crate) fn retarget(&mut self, previous: NodeId, container: NodeId) {
        if self.mount == previous {
            self.mount = container;
        }
    }

    /// Pushes the current view into the component.
    pub fn update(&mut self, sandbox: &mut BlockSandbox) -> Result<(), BlockLoaderError> {
        match self.component {
            BlockComponent::CustomElementFactory {
                instance,
                update_entity: true,
            } => sandbox.call_unit(instance, UPDATE_ENTITY_EXPORT),
            BlockComponent::CustomElementFactory { .. } => {
                debug!(block_id = %self.block_id, "Element has no update entry point");
                Ok(())
            }
            BlockComponent::Direct { instance } => self.render_direct(sandbox, instance),
            BlockComponent::VanillaNode { instance } => self.render_vanilla(sandbox, instance),
        }
    }

    /// Runs `render()` and makes its node the only child of the mount node.
    /// A negative handle means the guest rendered into the mount itself.
    fn render_direct(
        &mut self,
        sandbox: &mut BlockSandbox,
        instance: Instance,
    ) -> Result<(), BlockLoaderError> {
        let raw = sandbox.call_i32(instance, RENDER_EXPORT)?;
        let Some(node) = NodeId::from_guest(raw) else {
            self.root = None;
            return Ok(());
        };

        let state = sandbox.state();
        let mut doc = state.document.borrow_mut();
        state.check_writable(&doc, node)?;
        let stale: Vec<NodeId> = doc
            .children(self.mount)
            .iter()
            .copied()
            .filter(|child| *child != node)
            .collect();
        for child in stale {
            doc.remove(child);
        }
        if doc.parent(node) != Some(self.mount) {
            doc.append_child(self.mount, node)?;
        }
        self.root = Some(node);
        Ok(())
    }

    /// Runs `create_node()` and swaps its node in for the previous one.
    fn render_vanilla(
        &mut self,
        sandbox: &mut BlockSandbox,
        instance: Instance,
    ) -> Result<(), BlockLoaderError> {
        let raw = sandbox.call_i32(instance, CREATE_NODE_EXPORT)?;
        let node = self.guest_node(raw, CREATE_NODE_EXPORT)?;

        let state = sandbox.state();
        let mut doc = state.document.borrow_mut();
        state.check_writable(&doc, node)?;
        if let Some(previous) = self.root.take()
            && previous != node
        {
            doc.remove(previous);
        }
        doc.append_child(self.mount, node)?;
        self.root = Some(node);
        Ok(())
    }

    fn guest_node(&self, raw: i32, export: &str) -> Result<NodeId, BlockLoaderError> {
        NodeId::from_guest(raw).ok_or_else(|| BlockLoaderError::Evaluation {
            block_id: self.block_id.clone(),
            stage: format!("{export}()"),
            message: format!("returned invalid node handle {raw}"),
        })
    }
}

//! Per-load block sandbox: one `wasmtime::Store` per evaluated bundle.
//!
//! Each `BlockSandbox` owns a store with:
//! - Memory isolation (configurable ceiling, tracked by `TrackingLimiter`)
//! - CPU fuel budgets (prevents infinite loops in block code)
//! - No WASI: blocks see only the allowlisted host modules
//!
//! Every import module name of a bundle is a `require` specifier. Imports are
//! resolved before instantiation, so a blocked specifier aborts the load
//! before any block code has run.

use crate::allowlist::{DependencyAllowlist, HostModule, SpecifierClass};
use crate::dom::Document;
use crate::error::BlockLoaderError;
use crate::host_impl;
use crate::mini_host::HookChannel;
use crate::resources::{ModuleType, ResourceLayer, logical_name_of};
use crate::view::BlockView;
use serde::Serialize;
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, warn};
use vivafolio_types::{EntityUpdate, NodeId};
use wasmtime::{Engine, ExternType, Instance, Linker, Module, ResourceLimiter, Store};

/// Callback receiving entity updates requested by a block.
pub type UpdateCallback = Rc<dyn Fn(&EntityUpdate)>;

/// Creates the wasmtime engine shared by every sandbox of one host.
pub(crate) fn create_engine() -> Result<Engine, BlockLoaderError> {
    let mut config = wasmtime::Config::new();
    config.consume_fuel(true);
    Engine::new(&config).map_err(BlockLoaderError::Compilation)
}

/// Resource limits for a block sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Maximum linear memory in bytes.
    pub max_memory_bytes: usize,
    /// CPU fuel budget per guest call.
    pub fuel_per_call: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_bytes: 32 * 1024 * 1024, // 32MB
            fuel_per_call: 500_000_000,
        }
    }
}

/// Resource usage of one sandbox.
#[derive(Debug, Clone, Serialize)]
pub struct SandboxMetrics {
    pub memory_used_bytes: usize,
    pub memory_limit_bytes: usize,
    pub fuel_consumed_last_call: u64,
    pub fuel_budget_per_call: u64,
}

/// A resource limiter that tracks actual memory usage.
pub struct TrackingLimiter {
    max_memory: usize,
    current_memory: AtomicUsize,
    max_tables: u32,
    max_table_elements: u32,
    max_instances: u32,
    max_memories: u32,
}

impl TrackingLimiter {
    pub fn new(max_memory: usize) -> Self {
        Self {
            max_memory,
            current_memory: AtomicUsize::new(0),
            max_tables: 100,
            max_table_elements: 20_000,
            max_instances: 50,
            max_memories: 50,
        }
    }

    pub fn current_memory_bytes(&self) -> usize {
        self.current_memory.load(Ordering::Relaxed)
    }
}

impl ResourceLimiter for TrackingLimiter {
    fn memory_growing(
        &mut self,
        current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> anyhow::Result<bool> {
        if desired <= self.max_memory {
            self.current_memory.store(desired, Ordering::Relaxed);
            Ok(true)
        } else {
            debug!(
                current = current,
                desired = desired,
                max = self.max_memory,
                "Memory growth denied - would exceed limit"
            );
            Ok(false)
        }
    }

    fn table_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> anyhow::Result<bool> {
        Ok(desired <= self.max_table_elements as usize)
    }

    fn instances(&self) -> usize {
        self.max_instances as usize
    }

    fn tables(&self) -> usize {
        self.max_tables as usize
    }

    fn memories(&self) -> usize {
        self.max_memories as usize
    }
}

/// State stored in each block's `wasmtime::Store`; host functions reach the
/// document, the live view and the hook channel through it.
pub struct BlockState {
    pub(crate) block_id: String,
    pub(crate) document: Rc<RefCell<Document>>,
    /// Node the block renders into. Guests may only touch nodes beneath it
    /// or nodes not yet attached to the document.
    pub(crate) container: NodeId,
    /// Dedicated mount node for framework-rendered components.
    pub(crate) mount_node: Option<NodeId>,
    pub(crate) view: Rc<RefCell<BlockView>>,
    pub(crate) updates: UpdateCallback,
    pub(crate) hooks: HookChannel,
    pub(crate) limiter: TrackingLimiter,
}

impl BlockState {
    pub(crate) fn new(
        block_id: &str,
        document: Rc<RefCell<Document>>,
        container: NodeId,
        view: Rc<RefCell<BlockView>>,
        updates: UpdateCallback,
        hooks: HookChannel,
        limits: &ResourceLimits,
    ) -> Self {
        Self {
            block_id: block_id.to_string(),
            document,
            container,
            mount_node: None,
            view,
            updates,
            hooks,
            limiter: TrackingLimiter::new(limits.max_memory_bytes),
        }
    }

    /// Points the block at a new container, carrying the mount node along
    /// when it was the container itself.
    pub(crate) fn retarget(&mut self, previous: NodeId, container: NodeId) {
        self.container = container;
        if self.mount_node == Some(previous) {
            self.mount_node = Some(container);
        }
    }

    /// Checks that a guest may mutate `node`.
    pub(crate) fn check_writable(&self, doc: &Document, node: NodeId) -> Result<(), BlockLoaderError> {
        let allowed = doc.contains(node)
            && (doc.is_descendant_of(node, self.container) || doc.root_of(node) != doc.body());
        if allowed {
            Ok(())
        } else {
            Err(BlockLoaderError::NodeAccessDenied {
                block_id: self.block_id.clone(),
                node,
            })
        }
    }
}

/// Specifiers seen while resolving one load.
#[derive(Debug, Clone, Default)]
pub struct DependencyReport {
    /// Relative and host specifiers that resolved, in first-seen order.
    pub required: Vec<String>,
    /// Specifiers rejected by the allowlist.
    pub blocked: Vec<String>,
    /// Logical names of local modules that were required.
    pub touched_modules: BTreeSet<String>,
}

fn push_unique(list: &mut Vec<String>, value: &str) {
    if !list.iter().any(|v| v == value) {
        list.push(value.to_string());
    }
}

/// What a specifier resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolved {
    Host(HostModule),
    Script,
    Style,
}

pub struct BlockSandbox {
    block_id: String,
    engine: Engine,
    store: Store<BlockState>,
    linker: Linker<BlockState>,
    allowlist: DependencyAllowlist,
    limits: ResourceLimits,
    /// Local script instances by logical name.
    instances: HashMap<String, Instance>,
    /// Specifiers already registered with the linker.
    linked: HashSet<String>,
    /// Local modules currently being instantiated (cycle detection).
    evaluating: HashSet<String>,
    report: DependencyReport,
    last_fuel_consumed: u64,
}

impl BlockSandbox {
    pub(crate) fn new(
        engine: &Engine,
        state: BlockState,
        allowlist: DependencyAllowlist,
        limits: ResourceLimits,
    ) -> Result<Self, BlockLoaderError> {
        let block_id = state.block_id.clone();
        let mut linker = Linker::new(engine);
        linker.allow_shadowing(true);
        host_impl::add_to_linker(&mut linker, &allowlist).map_err(BlockLoaderError::Compilation)?;

        let mut store = Store::new(engine, state);
        store.limiter(|s| &mut s.limiter);

        Ok(Self {
            block_id,
            engine: engine.clone(),
            store,
            linker,
            allowlist,
            limits,
            instances: HashMap::new(),
            linked: HashSet::new(),
            evaluating: HashSet::new(),
            report: DependencyReport::default(),
            last_fuel_consumed: 0,
        })
    }

    pub fn report(&self) -> &DependencyReport {
        &self.report
    }

    pub(crate) fn state(&self) -> &BlockState {
        self.store.data()
    }

    pub(crate) fn state_mut(&mut self) -> &mut BlockState {
        self.store.data_mut()
    }

    pub fn metrics(&self) -> SandboxMetrics {
        SandboxMetrics {
            memory_used_bytes: self.state().limiter.current_memory_bytes(),
            memory_limit_bytes: self.limits.max_memory_bytes,
            fuel_consumed_last_call: self.last_fuel_consumed,
            fuel_budget_per_call: self.limits.fuel_per_call,
        }
    }

    // ================================================================
    // Evaluation
    // ================================================================

    /// Compiles and instantiates a bundle. All imports are resolved through
    /// the require shim first; the module's start function (if any) runs
    /// under the fuel budget.
    pub fn evaluate(
        &mut self,
        resources: &mut ResourceLayer,
        source: &[u8],
        name: &str,
    ) -> Result<Instance, BlockLoaderError> {
        let (instance, _) = self.instantiate_source(resources, source, name)?;
        Ok(instance)
    }

    fn instantiate_source(
        &mut self,
        resources: &mut ResourceLayer,
        source: &[u8],
        name: &str,
    ) -> Result<(Instance, Vec<String>), BlockLoaderError> {
        let module = Module::new(&self.engine, source).map_err(BlockLoaderError::Compilation)?;
        self.link_imports(resources, &module)?;

        self.refuel();
        let result = self.linker.instantiate(&mut self.store, &module);
        self.track_fuel_consumption();
        let instance = result.map_err(|e| {
            BlockLoaderError::from_trap(&self.block_id, &format!("evaluation of {name}"), e)
        })?;

        let exports = module.exports().map(|e| e.name().to_string()).collect();
        debug!(block_id = %self.block_id, module = name, "Module evaluated");
        Ok((instance, exports))
    }

    fn link_imports(
        &mut self,
        resources: &mut ResourceLayer,
        module: &Module,
    ) -> Result<(), BlockLoaderError> {
        let imports: Vec<(String, String, ExternType)> = module
            .imports()
            .map(|i| (i.module().to_string(), i.name().to_string(), i.ty()))
            .collect();

        // Reject blocked specifiers before any local module runs.
        let mut blocked = Vec::new();
        for (specifier, _, _) in &imports {
            if self.allowlist.classify(specifier) == SpecifierClass::Blocked {
                push_unique(&mut self.report.blocked, specifier);
                push_unique(&mut blocked, specifier);
            }
        }
        if let Some(first) = blocked.first() {
            warn!(block_id = %self.block_id, blocked = ?blocked, "Blocked dependencies outside allowlist");
            return Err(BlockLoaderError::BlockedDependency {
                block_id: self.block_id.clone(),
                specifier: first.clone(),
            });
        }

        for (specifier, name, ty) in imports {
            match self.require(resources, &specifier)? {
                Resolved::Host(host_module) => {
                    let is_func = matches!(ty, ExternType::Func(_));
                    if !is_func || !host_module.functions().contains(&name.as_str()) {
                        return Err(self.unresolved(
                            &specifier,
                            format!("host module provides no function '{name}'"),
                        ));
                    }
                }
                Resolved::Style => self.define_style_import(&specifier, &name, ty)?,
                Resolved::Script => {}
            }
        }
        Ok(())
    }

    /// The require shim: classifies a specifier against the allowlist and
    /// makes it available to the linker.
    fn require(
        &mut self,
        resources: &mut ResourceLayer,
        specifier: &str,
    ) -> Result<Resolved, BlockLoaderError> {
        match self.allowlist.classify(specifier) {
            SpecifierClass::Blocked => {
                push_unique(&mut self.report.blocked, specifier);
                warn!(block_id = %self.block_id, specifier, "Blocked dependency outside allowlist");
                Err(BlockLoaderError::BlockedDependency {
                    block_id: self.block_id.clone(),
                    specifier: specifier.to_string(),
                })
            }
            SpecifierClass::Unresolvable => Err(self.unresolved(
                specifier,
                "allowlisted but no host module is bound to it".into(),
            )),
            SpecifierClass::Host(host_module) => {
                push_unique(&mut self.report.required, specifier);
                Ok(Resolved::Host(host_module))
            }
            SpecifierClass::Relative => {
                push_unique(&mut self.report.required, specifier);
                self.require_local(resources, specifier)
            }
        }
    }

    fn require_local(
        &mut self,
        resources: &mut ResourceLayer,
        specifier: &str,
    ) -> Result<Resolved, BlockLoaderError> {
        let logical = logical_name_of(specifier).to_string();
        let (module_type, executed, source) = match resources.module(&logical) {
            Some(entry) => (entry.module_type, entry.executed, entry.source.clone()),
            None => {
                return Err(self.unresolved(specifier, "no prefetched local module".into()));
            }
        };
        self.report.touched_modules.insert(logical.clone());

        match module_type {
            ModuleType::Css => {
                if !executed {
                    self.inject_style(&logical, &String::from_utf8_lossy(&source));
                    if let Some(entry) = resources.module_mut(&logical) {
                        entry.executed = true;
                    }
                }
                Ok(Resolved::Style)
            }
            ModuleType::Js => {
                if !executed {
                    if !self.evaluating.insert(logical.clone()) {
                        return Err(self.unresolved(specifier, "circular import".into()));
                    }
                    let result = self.instantiate_source(resources, &source, &logical);
                    self.evaluating.remove(&logical);
                    let (instance, exports) = result?;
                    if let Some(entry) = resources.module_mut(&logical) {
                        entry.executed = true;
                        entry.exports = Some(exports);
                    }
                    self.instances.insert(logical.clone(), instance);
                }
                let instance = self
                    .instances
                    .get(&logical)
                    .copied()
                    .ok_or_else(|| self.unresolved(specifier, "module executed by another load".into()))?;
                if self.linked.insert(specifier.to_string()) {
                    self.linker
                        .instance(&mut self.store, specifier, instance)
                        .map_err(BlockLoaderError::Compilation)?;
                }
                Ok(Resolved::Script)
            }
        }
    }

    /// Functions imported from a style module are no-op hooks.
    fn define_style_import(
        &mut self,
        specifier: &str,
        name: &str,
        ty: ExternType,
    ) -> Result<(), BlockLoaderError> {
        let ExternType::Func(func_ty) = ty else {
            return Err(self.unresolved(specifier, format!("style modules only provide functions, not '{name}'")));
        };
        if func_ty.results().len() != 0 {
            return Err(self.unresolved(specifier, format!("style hook '{name}' must not return values")));
        }
        self.linker
            .func_new(specifier, name, func_ty, |_caller, _params, _results| Ok(()))
            .map_err(BlockLoaderError::Compilation)?;
        Ok(())
    }

    fn inject_style(&mut self, logical: &str, css: &str) {
        let state = self.store.data();
        let mut doc = state.document.borrow_mut();
        let style = doc.create_element("style");
        doc.set_attribute(style, "data-module", logical);
        let text = doc.create_text(css);
        let appended = doc
            .append_child(style, text)
            .and_then(|_| doc.append_child(state.container, style));
        match appended {
            Ok(()) => debug!(block_id = %self.block_id, module = logical, "Injected style module"),
            Err(e) => warn!(block_id = %self.block_id, module = logical, error = %e, "Failed to inject style module"),
        }
    }

    fn unresolved(&self, specifier: &str, reason: String) -> BlockLoaderError {
        BlockLoaderError::UnresolvedDependency {
            block_id: self.block_id.clone(),
            specifier: specifier.to_string(),
            reason,
        }
    }

    // ================================================================
    // Guest calls
    // ================================================================

    pub fn has_export(&mut self, instance: Instance, name: &str) -> bool {
        instance.get_func(&mut self.store, name).is_some()
    }

    /// Calls a `() -> i32` export.
    pub fn call_i32(&mut self, instance: Instance, export: &str) -> Result<i32, BlockLoaderError> {
        let func = instance
            .get_typed_func::<(), i32>(&mut self.store, export)
            .map_err(|e| self.bad_signature(export, e))?;
        self.refuel();
        let result = func.call(&mut self.store, ());
        self.track_fuel_consumption();
        result.map_err(|e| BlockLoaderError::from_trap(&self.block_id, &format!("{export}()"), e))
    }

    /// Calls a `() -> ()` export.
    pub fn call_unit(&mut self, instance: Instance, export: &str) -> Result<(), BlockLoaderError> {
        let func = instance
            .get_typed_func::<(), ()>(&mut self.store, export)
            .map_err(|e| self.bad_signature(export, e))?;
        self.refuel();
        let result = func.call(&mut self.store, ());
        self.track_fuel_consumption();
        result.map_err(|e| BlockLoaderError::from_trap(&self.block_id, &format!("{export}()"), e))
    }

    fn bad_signature(&self, export: &str, err: wasmtime::Error) -> BlockLoaderError {
        BlockLoaderError::Evaluation {
            block_id: self.block_id.clone(),
            stage: format!("lookup of {export}"),
            message: format!("{err:#}"),
        }
    }

    fn refuel(&mut self) {
        if let Err(e) = self.store.set_fuel(self.limits.fuel_per_call) {
            warn!(block_id = %self.block_id, error = %e, "Failed to set fuel budget");
        }
    }

    fn track_fuel_consumption(&mut self) {
        match self.store.get_fuel() {
            Ok(remaining) => {
                self.last_fuel_consumed = self.limits.fuel_per_call.saturating_sub(remaining);
            }
            Err(e) => {
                warn!(block_id = %self.block_id, error = %e, "Failed to get fuel remaining");
                self.last_fuel_consumed = 0;
            }
        }
    }
}

//! Wasmtime-based block loader for Vivafolio.
//!
//! Loads Block Protocol blocks described by notifications, evaluates their
//! bundles in a sandbox that only exposes allowlisted host modules, renders
//! them into a shared document, and composes nested blocks for other
//! entities of the same graph.
//!
//! Each evaluated bundle runs in its own `wasmtime::Store` with memory
//! isolation, CPU fuel budgets, and no WASI.

mod allowlist;
mod cache;
mod classify;
mod component;
mod config;
mod diagnostics;
mod dom;
mod error;
mod fetch;
mod graph_context;
mod host;
mod host_impl;
mod loader;
mod manager;
mod mini_host;
mod resources;
mod sandbox;
mod template;
mod view;

pub use allowlist::{DependencyAllowlist, HostModule, SpecifierClass, is_relative};
pub use cache::{CacheKey, MemoryResourceCache, ResourceCache};
pub use classify::{
    BlockRegistry, EntityClassifier, GENERIC_ENTITY_TYPE, HeuristicClassifier, PERSON_ENTITY_TYPE,
    TASK_ENTITY_TYPE, block_type_for,
};
pub use component::{BlockComponent, BlockMode, MOUNT_CLASS, MountedComponent};
pub use config::LoaderConfig;
pub use diagnostics::{BlockLoaderDiagnostics, LocalModuleDiagnostics};
pub use dom::{Document, DomError, NodeKind};
pub use error::BlockLoaderError;
pub use fetch::{DefaultFetcher, FetchedResource, FileFetcher, HttpFetcher, ResourceFetcher, content_type_for};
pub use graph_context::{SharedGraphContext, Subscription};
pub use host::{BlockHost, BlockHostBuilder};
pub use loader::{BlockLoader, ERROR_CLASS, LoaderOptions};
pub use manager::BlockHostManager;
pub use mini_host::{HookEmbedder, HookHandler, MAX_NESTING_DEPTH, MiniHost, NestedBlockOptions};
pub use resources::{LocalModuleEntry, ModuleType, ResourceLayer, sha256_hex};
pub use sandbox::{ResourceLimits, SandboxMetrics, UpdateCallback};
pub use template::{TemplateBridge, TemplateHandlers};
pub use view::{BlockProps, BlockView, GraphProps};

//! Resource & module layer.
//!
//! Resolves logical resource names to fetchable URLs and pulls every
//! non-entry script/style resource into memory before the entry runs, so the
//! sandbox can satisfy relative imports without touching the network.

use crate::cache::{CacheKey, ResourceCache};
use crate::error::BlockLoaderError;
use crate::fetch::{FetchedResource, ResourceFetcher};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::rc::Rc;
use tracing::{debug, warn};
use vivafolio_types::{BlockNotification, BlockResource};

/// Bundle entry names, in preference order.
pub const BUNDLE_ENTRIES: [&str; 2] = ["main.js", "app.js"];
/// Template entry names, in preference order.
pub const TEMPLATE_ENTRIES: [&str; 2] = ["app.html", "index.html"];
/// Companion script executed alongside a template.
pub const TEMPLATE_SCRIPT: &str = "app.js";

const SCRIPT_EXTENSIONS: [&str; 5] = ["js", "mjs", "cjs", "wasm", "wat"];
const STYLE_EXTENSIONS: [&str; 1] = ["css"];

/// SHA-256 of `bytes`, hex encoded.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleType {
    Js,
    Css,
}

impl ModuleType {
    /// Module type implied by a resource's extension, if it is one the
    /// prefetcher recognizes.
    pub fn of(resource: &BlockResource) -> Option<Self> {
        let ext = resource.extension()?;
        if SCRIPT_EXTENSIONS.contains(&ext.as_str()) {
            Some(Self::Js)
        } else if STYLE_EXTENSIONS.contains(&ext.as_str()) {
            Some(Self::Css)
        } else {
            None
        }
    }
}

/// A prefetched local module. Owned by the loader that fetched it; rebuilt on
/// every (re)load of the bundle entry.
#[derive(Debug, Clone)]
pub struct LocalModuleEntry {
    pub logical_name: String,
    pub url: String,
    pub module_type: ModuleType,
    pub source: Vec<u8>,
    pub integrity_sha256: Option<String>,
    /// Set once the module has been evaluated (js) or injected (css).
    pub executed: bool,
    pub exports: Option<Vec<String>>,
}

/// Normalizes a relative specifier (`./a.js`, `../lib/a.js`) to the logical
/// name it refers to.
pub fn logical_name_of(specifier: &str) -> &str {
    let mut rest = specifier;
    loop {
        if let Some(r) = rest.strip_prefix("./") {
            rest = r;
        } else if let Some(r) = rest.strip_prefix("../") {
            rest = r;
        } else {
            return rest;
        }
    }
}

/// Per-loader view of one notification's resources.
pub struct ResourceLayer {
    package: String,
    resources: Vec<BlockResource>,
    fetcher: Rc<dyn ResourceFetcher>,
    cache: Option<Rc<dyn ResourceCache>>,
    compute_integrity: bool,
    modules: BTreeMap<String, LocalModuleEntry>,
}

impl ResourceLayer {
    pub fn new(
        fetcher: Rc<dyn ResourceFetcher>,
        cache: Option<Rc<dyn ResourceCache>>,
        compute_integrity: bool,
    ) -> Self {
        Self {
            package: String::new(),
            resources: Vec::new(),
            fetcher,
            cache,
            compute_integrity,
            modules: BTreeMap::new(),
        }
    }

    /// Adopts the resource set of `notification`. Module entries from a
    /// previous set stay until the next prefetch replaces them.
    pub fn set_notification(&mut self, notification: &BlockNotification) {
        self.package = notification.block_type.clone();
        self.resources = notification.resources.clone();
    }

    pub fn resource(&self, logical_name: &str) -> Option<&BlockResource> {
        self.resources.iter().find(|r| r.logical_name == logical_name)
    }

    pub fn has_resource(&self, logical_name: &str) -> bool {
        self.resource(logical_name).is_some()
    }

    /// Physical URL for a logical name with the caching tag appended as a
    /// `cache` query parameter. `None` if the resource is absent.
    pub fn resolve_resource_url(&self, logical_name: &str) -> Option<String> {
        let resource = self.resource(logical_name)?;
        Some(with_caching_tag(
            &resource.physical_path,
            resource.caching_tag.as_deref(),
        ))
    }

    /// Retrieves a resource, consulting the cache first when the resource
    /// carries a caching tag.
    pub fn fetch_resource(&self, logical_name: &str) -> Result<FetchedResource, BlockLoaderError> {
        let resource = self
            .resource(logical_name)
            .ok_or_else(|| BlockLoaderError::MissingResource(logical_name.to_string()))?;
        let url = with_caching_tag(&resource.physical_path, resource.caching_tag.as_deref());

        let key = match (&self.cache, &resource.caching_tag) {
            (Some(_), Some(tag)) => Some(CacheKey::new(&self.package, tag, logical_name)),
            _ => None,
        };

        if let (Some(cache), Some(key)) = (&self.cache, &key)
            && let Some(hit) = cache.get(key)
        {
            debug!(logical_name, package = %self.package, "Resource served from cache");
            let content_type = hit
                .content_type
                .or_else(|| crate::fetch::content_type_for(logical_name).map(str::to_string));
            return Ok(FetchedResource::new(hit.bytes, content_type));
        }

        let fetched = self.fetcher.fetch(&url)?;
        if let (Some(cache), Some(key)) = (&self.cache, key) {
            cache.put(key, fetched.clone());
        }
        Ok(fetched)
    }

    /// Clears the module cache, then fetches every non-entry script or style
    /// resource. Per-resource failures are logged and skipped. Returns the
    /// number of modules now cached.
    pub fn prefetch_local_resources(&mut self, entry_name: &str) -> usize {
        self.modules.clear();

        let candidates: Vec<(String, ModuleType)> = self
            .resources
            .iter()
            .filter(|r| r.logical_name != entry_name)
            .filter_map(|r| ModuleType::of(r).map(|t| (r.logical_name.clone(), t)))
            .collect();

        for (logical_name, module_type) in candidates {
            let url = self.resolve_resource_url(&logical_name).unwrap_or_default();
            let fetched = match self.fetch_resource(&logical_name) {
                Ok(f) => f,
                Err(e) => {
                    warn!(logical_name = %logical_name, error = %e, "Skipping local module that failed to fetch");
                    continue;
                }
            };
            let integrity_sha256 = self.compute_integrity.then(|| sha256_hex(&fetched.bytes));
            debug!(
                logical_name = %logical_name,
                size_bytes = fetched.bytes.len(),
                "Prefetched local module"
            );
            self.modules.insert(
                logical_name.clone(),
                LocalModuleEntry {
                    logical_name,
                    url,
                    module_type,
                    source: fetched.bytes,
                    integrity_sha256,
                    executed: false,
                    exports: None,
                },
            );
        }
        self.modules.len()
    }

    pub fn module(&self, logical_name: &str) -> Option<&LocalModuleEntry> {
        self.modules.get(logical_name)
    }

    pub fn module_mut(&mut self, logical_name: &str) -> Option<&mut LocalModuleEntry> {
        self.modules.get_mut(logical_name)
    }

    /// Module a relative specifier refers to.
    pub fn lookup_relative(&self, specifier: &str) -> Option<&LocalModuleEntry> {
        self.modules.get(logical_name_of(specifier))
    }

    pub fn modules(&self) -> impl Iterator<Item = &LocalModuleEntry> {
        self.modules.values()
    }

    pub fn compute_integrity(&self) -> bool {
        self.compute_integrity
    }
}

/// Appends `cache=<tag>` to a physical path, using a real URL parser when
/// the path is a URL.
pub fn with_caching_tag(physical_path: &str, caching_tag: Option<&str>) -> String {
    let Some(tag) = caching_tag else {
        return physical_path.to_string();
    };
    if let Ok(mut url) = url::Url::parse(physical_path) {
        url.query_pairs_mut().append_pair("cache", tag);
        return url.to_string();
    }
    let sep = if physical_path.contains('?') { '&' } else { '?' };
    format!("{physical_path}{sep}cache={tag}")
}

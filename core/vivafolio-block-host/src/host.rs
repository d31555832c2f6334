//! Composition root shared by every loader of one rendering surface.
//!
//! Owns the render tree, the retrieval stack, the wasmtime engine and the
//! host-wide collaborators (hook embedder, graph context, template bridge).
//! The collaborators are installed lazily, once, on first use.

use crate::cache::{MemoryResourceCache, ResourceCache};
use crate::classify::{BlockRegistry, EntityClassifier, HeuristicClassifier};
use crate::config::LoaderConfig;
use crate::dom::Document;
use crate::error::BlockLoaderError;
use crate::fetch::{DefaultFetcher, ResourceFetcher};
use crate::graph_context::SharedGraphContext;
use crate::loader::{BlockLoader, LoaderOptions};
use crate::mini_host::HookEmbedder;
use crate::sandbox::{UpdateCallback, create_engine};
use crate::template::TemplateBridge;
use std::cell::{OnceCell, RefCell};
use std::rc::Rc;
use tracing::{info, warn};
use vivafolio_types::{EntityUpdate, NodeId};
use wasmtime::Engine;

pub struct BlockHost {
    config: LoaderConfig,
    engine: Engine,
    document: Rc<RefCell<Document>>,
    fetcher: Rc<dyn ResourceFetcher>,
    cache: Option<Rc<dyn ResourceCache>>,
    registry: BlockRegistry,
    classifier: Box<dyn EntityClassifier>,
    on_block_update: Option<UpdateCallback>,
    hook_embedder: OnceCell<Rc<HookEmbedder>>,
    graph_context: OnceCell<Rc<SharedGraphContext>>,
    template_bridge: OnceCell<Rc<TemplateBridge>>,
}

impl BlockHost {
    pub fn builder() -> BlockHostBuilder {
        BlockHostBuilder::default()
    }

    /// Host with the default fetcher, an in-memory cache and the heuristic
    /// entity classifier.
    pub fn new(config: LoaderConfig) -> Result<Rc<Self>, BlockLoaderError> {
        Self::builder().config(config).build()
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub(crate) fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn document(&self) -> &Rc<RefCell<Document>> {
        &self.document
    }

    pub fn fetcher(&self) -> Rc<dyn ResourceFetcher> {
        self.fetcher.clone()
    }

    pub fn cache(&self) -> Option<Rc<dyn ResourceCache>> {
        self.cache.clone()
    }

    pub fn registry(&self) -> &BlockRegistry {
        &self.registry
    }

    pub fn classifier(&self) -> &dyn EntityClassifier {
        self.classifier.as_ref()
    }

    /// Default update channel for top-level blocks.
    pub fn on_block_update(&self) -> Option<UpdateCallback> {
        self.on_block_update.clone()
    }

    pub fn hook_embedder(&self) -> Rc<HookEmbedder> {
        self.hook_embedder
            .get_or_init(|| {
                info!("Installing hook embedder");
                Rc::new(HookEmbedder::new())
            })
            .clone()
    }

    pub fn is_hook_embedder_installed(&self) -> bool {
        self.hook_embedder.get().is_some()
    }

    pub fn graph_context(&self) -> Rc<SharedGraphContext> {
        self.graph_context
            .get_or_init(|| {
                info!("Installing shared graph context");
                let context = SharedGraphContext::new();
                context.set_update_channel(self.on_block_update.clone());
                context
            })
            .clone()
    }

    /// The template bridge, unless disabled in the config.
    pub fn template_bridge(&self) -> Option<Rc<TemplateBridge>> {
        if !self.config.template_bridge {
            return None;
        }
        Some(
            self.template_bridge
                .get_or_init(|| {
                    info!("Installing template bridge");
                    Rc::new(TemplateBridge::new())
                })
                .clone(),
        )
    }

    /// The template bridge if something already installed it.
    pub(crate) fn installed_template_bridge(&self) -> Option<&Rc<TemplateBridge>> {
        self.template_bridge.get()
    }

    /// Appends a fresh container element to the document body.
    pub fn create_container(&self) -> NodeId {
        let mut doc = self.document.borrow_mut();
        let container = doc.create_element("div");
        doc.set_attribute(container, "class", "vivafolio-block");
        let body = doc.body();
        if let Err(e) = doc.append_child(body, container) {
            warn!(error = %e, "Could not attach block container");
        }
        container
    }

    pub fn create_loader(self: &Rc<Self>, options: LoaderOptions) -> BlockLoader {
        BlockLoader::new(self.clone(), options)
    }
}

#[derive(Default)]
pub struct BlockHostBuilder {
    config: Option<LoaderConfig>,
    document: Option<Rc<RefCell<Document>>>,
    fetcher: Option<Rc<dyn ResourceFetcher>>,
    cache: Option<Option<Rc<dyn ResourceCache>>>,
    classifier: Option<Box<dyn EntityClassifier>>,
    on_block_update: Option<UpdateCallback>,
}

impl BlockHostBuilder {
    pub fn config(mut self, config: LoaderConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn document(mut self, document: Rc<RefCell<Document>>) -> Self {
        self.document = Some(document);
        self
    }

    pub fn fetcher(mut self, fetcher: impl ResourceFetcher + 'static) -> Self {
        self.fetcher = Some(Rc::new(fetcher));
        self
    }

    pub fn shared_fetcher(mut self, fetcher: Rc<dyn ResourceFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Replaces the default in-memory cache; `None` disables caching.
    pub fn cache(mut self, cache: Option<Rc<dyn ResourceCache>>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn classifier(mut self, classifier: impl EntityClassifier + 'static) -> Self {
        self.classifier = Some(Box::new(classifier));
        self
    }

    pub fn on_block_update(mut self, callback: impl Fn(&EntityUpdate) + 'static) -> Self {
        self.on_block_update = Some(Rc::new(callback));
        self
    }

    pub fn build(self) -> Result<Rc<BlockHost>, BlockLoaderError> {
        let cache = match self.cache {
            Some(cache) => cache,
            None => {
                let cache: Rc<dyn ResourceCache> = Rc::new(MemoryResourceCache::new());
                Some(cache)
            }
        };
        let fetcher: Rc<dyn ResourceFetcher> = match self.fetcher {
            Some(fetcher) => fetcher,
            None => Rc::new(DefaultFetcher::new()),
        };
        let classifier: Box<dyn EntityClassifier> = match self.classifier {
            Some(classifier) => classifier,
            None => Box::new(HeuristicClassifier),
        };
        Ok(Rc::new(BlockHost {
            config: self.config.unwrap_or_default(),
            engine: create_engine()?,
            document: self
                .document
                .unwrap_or_else(|| Rc::new(RefCell::new(Document::new()))),
            fetcher,
            cache,
            registry: BlockRegistry::new(),
            classifier,
            on_block_update: self.on_block_update,
            hook_embedder: OnceCell::new(),
            graph_context: OnceCell::new(),
            template_bridge: OnceCell::new(),
        }))
    }
}

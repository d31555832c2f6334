//! Top-level block lifecycle manager.
//!
//! Owns one `BlockLoader` per top-level `blockId`, each in its own container,
//! and turns the notification stream into load/update/remove calls.

use crate::error::BlockLoaderError;
use crate::host::BlockHost;
use crate::loader::{BlockLoader, LoaderOptions};
use std::collections::HashMap;
use std::io::BufRead;
use std::rc::Rc;
use tracing::{info, warn};
use vivafolio_types::{BlockNotification, HookData, HookResponse, NotificationReader};

pub struct BlockHostManager {
    host: Rc<BlockHost>,
    blocks: HashMap<String, BlockLoader>,
}

impl BlockHostManager {
    pub fn new(host: Rc<BlockHost>) -> Self {
        Self {
            host,
            blocks: HashMap::new(),
        }
    }

    pub fn host(&self) -> &Rc<BlockHost> {
        &self.host
    }

    // ================================================================
    // Notifications
    // ================================================================

    /// Loads a block on first sight of its `blockId` and updates it
    /// afterwards. A block whose last load failed is loaded again.
    pub fn apply_notification(&mut self, notification: &BlockNotification) -> Result<(), BlockLoaderError> {
        if let Some(loader) = self.blocks.get_mut(&notification.block_id) {
            if loader.is_loaded() {
                return loader.update_block(notification);
            }
            info!(block_id = %notification.block_id, "Retrying load of block");
            return loader.load_block(notification);
        }

        let container = self.host.create_container();
        let mut loader = self.host.create_loader(LoaderOptions::new(container));
        let result = loader.load_block(notification);
        self.blocks.insert(notification.block_id.clone(), loader);
        result
    }

    /// Applies every notification of a JSON-lines stream. Failures are
    /// logged; returns how many notifications applied cleanly.
    pub fn apply_notifications(&mut self, reader: impl BufRead) -> usize {
        let mut applied = 0;
        for item in NotificationReader::new(reader) {
            let notification = match item {
                Ok(n) => n,
                Err(e) => {
                    warn!(error = %e, "Notification stream failed");
                    break;
                }
            };
            match self.apply_notification(&notification) {
                Ok(()) => applied += 1,
                Err(e) => warn!(block_id = %notification.block_id, error = %e, "Notification failed"),
            }
        }
        applied
    }

    /// Destroys a top-level block and removes its container.
    pub fn remove_block(&mut self, block_id: &str) -> Result<(), BlockLoaderError> {
        match self.blocks.remove(block_id) {
            Some(mut loader) => {
                loader.destroy();
                self.host.document().borrow_mut().remove(loader.container());
                info!(block_id = %block_id, "Block removed");
                Ok(())
            }
            None => Err(BlockLoaderError::NotLoaded(block_id.to_string())),
        }
    }

    pub fn handle_hook_message(
        &self,
        block_id: &str,
        data: &HookData,
    ) -> Result<HookResponse, BlockLoaderError> {
        self.get_block(block_id)?.handle_hook_message(data)
    }

    // ================================================================
    // Block access
    // ================================================================

    pub fn get_block(&self, block_id: &str) -> Result<&BlockLoader, BlockLoaderError> {
        self.blocks
            .get(block_id)
            .ok_or_else(|| BlockLoaderError::NotLoaded(block_id.to_string()))
    }

    pub fn get_block_mut(&mut self, block_id: &str) -> Result<&mut BlockLoader, BlockLoaderError> {
        self.blocks
            .get_mut(block_id)
            .ok_or_else(|| BlockLoaderError::NotLoaded(block_id.to_string()))
    }

    /// Block ids, sorted.
    pub fn list_blocks(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.blocks.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_loaded(&self, block_id: &str) -> bool {
        self.blocks.get(block_id).is_some_and(BlockLoader::is_loaded)
    }

    /// Destroys every block.
    pub fn clear(&mut self) {
        let ids: Vec<String> = self.blocks.keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.remove_block(&id) {
                warn!(block_id = %id, error = %e, "Failed to remove block");
            }
        }
    }
}

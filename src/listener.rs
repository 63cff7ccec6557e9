use async_trait::async_trait;
use fieldx_plus::fx_plus;
use fieldx_plus::Child;
use tracing::trace;

use crate::bus::InvalidationHandler;
use crate::engine::CacheEngine;
use crate::types::InvalidationMessage;

// Keeps its engine alive for as long as the subscription task runs. CacheEngine::close() aborts the task.
#[fx_plus(child(CacheEngine, rc_strong), sync, rc, get(off), default(off))]
pub(crate) struct InvalidationListener {
    /// Timestamp of the newest message seen so far.
    #[fieldx(lock, get(vis(pub(crate)), copy), set(private), default(0), builder(off))]
    newest: i64,
}

#[async_trait]
impl InvalidationHandler for InvalidationListener {
    async fn on_invalidation(&self, message: &InvalidationMessage) {
        let engine = self.parent();
        if message.timestamp < self.newest() {
            // Eviction is idempotent, so late messages are applied all the same.
            trace!(key = %message.key, "out of order invalidation");
        }
        else {
            self.set_newest(message.timestamp);
        }
        engine.apply_invalidation(message).await;
    }
}

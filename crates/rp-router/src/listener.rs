use std::sync::Arc;

use parking_lot::RwLock;

/// Told once per routed message when it is delivered, dropped or expired.
pub trait MessageProcessedListener: Send + Sync {
    fn message_processed(&self, message_id: &str);
}

#[derive(Default)]
pub(crate) struct ListenerRegistry {
    listeners: RwLock<Vec<Arc<dyn MessageProcessedListener>>>,
}

impl ListenerRegistry {
    pub(crate) fn register(&self, listener: Arc<dyn MessageProcessedListener>) {
        self.listeners.write().push(listener);
    }

    pub(crate) fn unregister(&self, listener: &Arc<dyn MessageProcessedListener>) {
        self.listeners.write().retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub(crate) fn notify(&self, message_id: &str) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.message_processed(message_id);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.listeners.read().len()
    }
}

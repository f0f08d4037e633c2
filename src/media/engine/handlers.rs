#![forbid(unsafe_code)]

// Observer registration for engine entities.
// Handlers are removed when their `HandlerId` is dropped unless detached.

use std::sync::{Arc, Mutex as StdMutex, Weak};

struct BagInner<F: ?Sized> {
    next_id: u64,
    handlers: Vec<(u64, Arc<F>)>,
}

/// A set of callbacks of one event type
pub struct Bag<F: ?Sized> {
    inner: Arc<StdMutex<BagInner<F>>>,
}

impl<F: ?Sized> Default for Bag<F> {
    fn default() -> Self {
        Self {
            inner: Arc::new(StdMutex::new(BagInner {
                next_id: 0,
                handlers: Vec::new(),
            })),
        }
    }
}

impl<F: ?Sized + Send + Sync + 'static> Bag<F> {
    /// Registers a callback; it stays registered while the returned id is alive
    pub fn add(&self, callback: Arc<F>) -> HandlerId {
        let id = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let id = inner.next_id;
            inner.next_id += 1;
            inner.handlers.push((id, callback));
            id
        };

        let weak: Weak<StdMutex<BagInner<F>>> = Arc::downgrade(&self.inner);
        HandlerId {
            remove: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    let mut inner = inner.lock().unwrap_or_else(|e| e.into_inner());
                    inner.handlers.retain(|(handler_id, _)| *handler_id != id);
                }
            })),
        }
    }

    /// Invokes every registered callback. The lock is released before calling out,
    /// so callbacks may register handlers or close other entities.
    pub fn call(&self, mut invoke: impl FnMut(&F)) {
        let handlers: Vec<Arc<F>> = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.handlers.iter().map(|(_, h)| Arc::clone(h)).collect()
        };
        for handler in handlers {
            invoke(&handler);
        }
    }

    /// Drops every callback (used once an entity is closed)
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.handlers.clear();
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Registration guard returned by `on_*` methods
#[must_use = "the handler is removed as soon as the HandlerId is dropped; call detach() to keep it"]
pub struct HandlerId {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl HandlerId {
    /// Keeps the handler registered for the lifetime of the entity
    pub fn detach(mut self) {
        self.remove = None;
    }
}

impl Drop for HandlerId {
    fn drop(&mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl std::fmt::Debug for HandlerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerId")
            .field("attached", &self.remove.is_some())
            .finish()
    }
}

use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Mutex, PoisonError, Weak},
};

use tracing::error;

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct RegistryInner<T> {
    next_id: u64,
    handlers: Vec<(u64, Handler<T>)>,
}

/// Publish-subscribe registry behind the status and message streams.
/// Handlers run synchronously in registration order; a panicking handler is
/// logged and never blocks its siblings.
pub struct HandlerRegistry<T> {
    inner: Arc<Mutex<RegistryInner<T>>>,
}

impl<T: 'static> HandlerRegistry<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner {
                next_id: 0,
                handlers: Vec::new(),
            })),
        }
    }

    pub fn subscribe(&self, handler: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let id = {
            let mut inner = lock(&self.inner);
            let id = inner.next_id;
            inner.next_id += 1;
            inner.handlers.push((id, Arc::new(handler)));
            id
        };
        let inner: Arc<dyn Detach> = Arc::clone(&self.inner) as Arc<dyn Detach>;
        let registry: Weak<dyn Detach> = Arc::downgrade(&inner);
        Subscription { id, registry }
    }

    pub fn notify(&self, value: &T) {
        let handlers: Vec<(u64, Handler<T>)> = lock(&self.inner).handlers.clone();
        for (id, handler) in handlers {
            invoke(id, &handler, value);
        }
    }

    /// Replays a value to a single subscriber, used to hand fresh
    /// subscribers the current state at registration time.
    pub fn notify_one(&self, id: u64, value: &T) {
        let handler = lock(&self.inner)
            .handlers
            .iter()
            .find(|(handler_id, _)| *handler_id == id)
            .map(|(_, handler)| Arc::clone(handler));
        if let Some(handler) = handler {
            invoke(id, &handler, value);
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: 'static> Default for HandlerRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn invoke<T>(id: u64, handler: &Handler<T>, value: &T) {
    if catch_unwind(AssertUnwindSafe(|| handler(value))).is_err() {
        error!(handler_id = id, "event subscriber panicked; continuing with remaining subscribers");
    }
}

fn lock<T>(inner: &Mutex<RegistryInner<T>>) -> std::sync::MutexGuard<'_, RegistryInner<T>> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

trait Detach: Send + Sync {
    fn detach(&self, id: u64);
}

impl<T: 'static> Detach for Mutex<RegistryInner<T>> {
    fn detach(&self, id: u64) {
        let mut inner = self.lock().unwrap_or_else(PoisonError::into_inner);
        inner.handlers.retain(|(handler_id, _)| *handler_id != id);
    }
}

/// Guard returned by `subscribe`; dropping it (or calling `unsubscribe`)
/// removes the handler from the registry.
pub struct Subscription {
    id: u64,
    registry: Weak<dyn Detach>,
}

impl Subscription {
    pub fn unsubscribe(self) {}

    pub(crate) fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.detach(self.id);
        }
    }
}

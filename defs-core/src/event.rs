//! Typed event bus
//!
//! Events are plain structs implementing [`Event`]; the bus keys handlers by
//! `Event::NAME` and hands each handler a typed reference, so subscriber
//! signatures are checked at compile time.
//!
//! Async handlers run on the tokio runtime. Handlers registered as
//! transactional are tracked per publish and awaited together by
//! [`EventBus::wait_async`].

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A value that can be published on the bus
pub trait Event: Clone + Send + Sync + 'static {
    /// Registry key for handlers of this event
    const NAME: &'static str;
}

/// Handle returned by `subscribe*`, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type SyncHandler = Arc<dyn Fn(&dyn Any) + Send + Sync>;
type AsyncHandler = Arc<dyn Fn(&dyn Any) -> Option<BoxFuture<'static, ()>> + Send + Sync>;

#[derive(Clone)]
enum Handler {
    Sync(SyncHandler),
    Async {
        handler: AsyncHandler,
        transactional: bool,
    },
}

#[derive(Clone)]
struct Subscription {
    id: SubscriptionId,
    once: bool,
    handler: Handler,
}

struct Inner {
    next_id: AtomicU64,
    handlers: RwLock<HashMap<&'static str, Vec<Subscription>>>,
    pending: Mutex<Vec<JoinHandle<()>>>,
    runtime: Option<Handle>,
}

/// Registry of typed event handlers. Cloning shares the registry.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create a bus bound to the current tokio runtime, if any
    pub fn new() -> Self {
        Self::build(Handle::try_current().ok())
    }

    /// Create a bus that spawns async handlers on `runtime`
    pub fn with_runtime(runtime: Handle) -> Self {
        Self::build(Some(runtime))
    }

    fn build(runtime: Option<Handle>) -> Self {
        Self {
            inner: Arc::new(Inner {
                next_id: AtomicU64::new(1),
                handlers: RwLock::new(HashMap::new()),
                pending: Mutex::new(Vec::new()),
                runtime,
            }),
        }
    }

    fn register(&self, name: &'static str, once: bool, handler: Handler) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner
            .handlers
            .write()
            .entry(name)
            .or_default()
            .push(Subscription { id, once, handler });
        debug!(event = name, id = id.0, "Handler subscribed");
        id
    }

    fn sync_handler<E, F>(f: F) -> Handler
    where
        E: Event,
        F: Fn(&E) + Send + Sync + 'static,
    {
        Handler::Sync(Arc::new(move |any: &dyn Any| {
            if let Some(event) = any.downcast_ref::<E>() {
                f(event);
            }
        }))
    }

    /// Call `f` for every published `E`
    pub fn subscribe<E, F>(&self, f: F) -> SubscriptionId
    where
        E: Event,
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.register(E::NAME, false, Self::sync_handler(f))
    }

    /// Call `f` for the next published `E` only
    pub fn subscribe_once<E, F>(&self, f: F) -> SubscriptionId
    where
        E: Event,
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.register(E::NAME, true, Self::sync_handler(f))
    }

    /// Run `f` as a task for every published `E`. Transactional handlers are
    /// awaited by [`EventBus::wait_async`].
    pub fn subscribe_async<E, F, Fut>(&self, transactional: bool, f: F) -> SubscriptionId
    where
        E: Event,
        F: Fn(E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: AsyncHandler = Arc::new(move |any: &dyn Any| {
            any.downcast_ref::<E>()
                .map(|event| f(event.clone()).boxed())
        });
        self.register(
            E::NAME,
            false,
            Handler::Async {
                handler,
                transactional,
            },
        )
    }

    /// Remove a handler of `E`; returns whether it was registered
    pub fn unsubscribe<E: Event>(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.inner.handlers.write();
        let Some(list) = handlers.get_mut(E::NAME) else {
            return false;
        };
        let before = list.len();
        list.retain(|s| s.id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(E::NAME);
        }
        removed
    }

    /// Whether any handler is registered for `E`
    pub fn has_callback<E: Event>(&self) -> bool {
        self.inner
            .handlers
            .read()
            .get(E::NAME)
            .is_some_and(|list| !list.is_empty())
    }

    /// Deliver `event` to every handler of `E`; returns the number of handlers
    /// invoked. Handlers run without the registry lock held.
    pub fn publish<E: Event>(&self, event: E) -> usize {
        let snapshot = {
            let mut handlers = self.inner.handlers.write();
            let Some(list) = handlers.get_mut(E::NAME) else {
                return 0;
            };
            let snapshot = list.clone();
            list.retain(|s| !s.once);
            if list.is_empty() {
                handlers.remove(E::NAME);
            }
            snapshot
        };

        let mut delivered = 0;
        for subscription in snapshot {
            match subscription.handler {
                Handler::Sync(handler) => {
                    handler(&event);
                    delivered += 1;
                }
                Handler::Async {
                    handler,
                    transactional,
                } => {
                    let Some(future) = handler(&event) else {
                        continue;
                    };
                    if self.spawn(future, transactional) {
                        delivered += 1;
                    } else {
                        warn!(event = E::NAME, "No runtime for async handler, event dropped");
                    }
                }
            }
        }
        delivered
    }

    fn spawn(&self, future: BoxFuture<'static, ()>, transactional: bool) -> bool {
        let handle = match self.inner.runtime.clone().or_else(|| Handle::try_current().ok()) {
            Some(handle) => handle.spawn(future),
            None => return false,
        };
        if transactional {
            self.inner.pending.lock().push(handle);
        }
        true
    }

    /// Await every transactional async handler started so far
    pub async fn wait_async(&self) {
        loop {
            let pending: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.pending.lock());
            if pending.is_empty() {
                return;
            }
            for result in futures::future::join_all(pending).await {
                if let Err(e) = result {
                    warn!(error = %e, "Async event handler failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    struct Stored {
        file_id: String,
        index: u32,
    }

    impl Event for Stored {
        const NAME: &'static str = "test.stored";
    }

    #[derive(Debug, Clone)]
    struct Other;

    impl Event for Other {
        const NAME: &'static str = "test.other";
    }

    #[test]
    fn test_subscribe_publish() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe(move |e: &Stored| sink.lock().push(e.clone()));

        assert!(bus.has_callback::<Stored>());
        assert!(!bus.has_callback::<Other>());

        let delivered = bus.publish(Stored {
            file_id: "abc".into(),
            index: 3,
        });
        assert_eq!(delivered, 1);
        assert_eq!(bus.publish(Other), 0);

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].index, 3);
    }

    #[test]
    fn test_subscribe_once() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        bus.subscribe_once(move |_: &Other| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(Other);
        bus.publish(Other);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!bus.has_callback::<Other>());
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let id = bus.subscribe(move |_: &Other| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert!(bus.unsubscribe::<Other>(id));
        assert!(!bus.unsubscribe::<Other>(id));
        bus.publish(Other);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_handler_may_subscribe_during_publish() {
        let bus = EventBus::new();
        let inner_bus = bus.clone();
        bus.subscribe(move |_: &Other| {
            inner_bus.subscribe(|_: &Stored| {});
        });
        bus.publish(Other);
        assert!(bus.has_callback::<Stored>());
    }

    #[tokio::test]
    async fn test_transactional_wait() {
        let bus = EventBus::new();
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let d = done.clone();
            bus.subscribe_async(true, move |e: Stored| {
                let d = d.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    d.fetch_add(e.index as usize, Ordering::SeqCst);
                }
            });
        }

        assert_eq!(
            bus.publish(Stored {
                file_id: "f".into(),
                index: 2,
            }),
            3
        );
        bus.wait_async().await;
        assert_eq!(done.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_non_transactional_not_tracked() {
        let bus = EventBus::new();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = Arc::new(Mutex::new(Some(tx)));
        bus.subscribe_async(false, move |_: Other| {
            let tx = tx.clone();
            async move {
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(());
                }
            }
        });

        bus.publish(Other);
        bus.wait_async().await;
        tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_async_without_runtime_is_dropped() {
        let bus = EventBus::new();
        bus.subscribe_async(true, |_: Other| async {});
        assert_eq!(bus.publish(Other), 0);
    }
}

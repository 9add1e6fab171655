//! Watch-driven informers
//!
//! An [`Informer`] runs a kube watcher for one kind, folds its events into a
//! shared [`ScopedCache`] and fans each resulting [`Change`] out to the
//! registered handlers, in order, on the informer task. Handlers must be
//! quick: they enqueue keys or update in-memory indexes, never call the API.

use std::fmt::Debug;
use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Resource};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{Change, ScopedCache};
use crate::WATCH_TIMEOUT_SECS;

/// Callback invoked for every cache change
pub type ChangeHandler<K> = Arc<dyn Fn(&Change<K>) + Send + Sync>;

/// Watches one resource kind and keeps a cache plus its subscribers current
pub struct Informer<K> {
    api: Api<K>,
    cache: Arc<ScopedCache<K>>,
    handlers: Vec<ChangeHandler<K>>,
}

impl<K> Informer<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    /// Create an informer writing into `cache`
    pub fn new(api: Api<K>, cache: Arc<ScopedCache<K>>) -> Self {
        Self {
            api,
            cache,
            handlers: Vec::new(),
        }
    }

    /// Register a handler; handlers run in registration order
    pub fn with_handler(mut self, handler: ChangeHandler<K>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// The cache this informer fills
    pub fn cache(&self) -> Arc<ScopedCache<K>> {
        Arc::clone(&self.cache)
    }

    /// Run until `token` is cancelled
    ///
    /// Watch errors are logged and retried with the watcher's default
    /// backoff; they never end the loop.
    pub async fn run(self, token: CancellationToken) {
        let kind = self.cache.kind();
        let config = watcher::Config::default().timeout(WATCH_TIMEOUT_SECS);
        let stream = watcher(self.api, config).default_backoff();
        tokio::pin!(stream);

        info!(kind, "Starting informer");
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(kind, "Informer cancelled");
                    break;
                }
                event = stream.next() => match event {
                    Some(Ok(event)) => {
                        for change in self.cache.handle_event(event) {
                            dispatch(&self.handlers, &change);
                        }
                    }
                    Some(Err(e)) => {
                        warn!(kind, error = %e, "Watch error, retrying");
                    }
                    None => {
                        warn!(kind, "Watch stream ended");
                        break;
                    }
                }
            }
        }
        info!(kind, "Informer stopped");
    }
}

/// Deliver a change to every handler
pub fn dispatch<K>(handlers: &[ChangeHandler<K>], change: &Change<K>) {
    for handler in handlers {
        handler(change);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Namespace;
    use kube::api::ObjectMeta;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn dispatch_reaches_every_handler_in_order() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen = Arc::new(AtomicUsize::new(0));

        let first: ChangeHandler<Namespace> = {
            let order = order.clone();
            Arc::new(move |_| order.lock().push("first"))
        };
        let second: ChangeHandler<Namespace> = {
            let order = order.clone();
            let seen = seen.clone();
            Arc::new(move |c| {
                if matches!(c, Change::Added(_)) {
                    seen.fetch_add(1, Ordering::SeqCst);
                }
                order.lock().push("second");
            })
        };

        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some("ns-a".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        dispatch(&[first, second], &Change::Added(Arc::new(ns)));

        assert_eq!(*order.lock(), vec!["first", "second"]);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}

//! Coalescing of concurrent identical fetches
//!
//! The first caller for a key becomes the leader: its fetch runs in a
//! detached task so that cancelling any individual waiter (including the
//! leader) never cancels the fetch for the others. Waiters subscribe to a
//! completion channel; the in-flight entry is removed before the result is
//! broadcast, so a fetch that lands immediately after completion starts
//! fresh.

use buildstash_core::{Error, Result};
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

type Outcome<V> = std::result::Result<V, Arc<Error>>;
type Slot<V> = watch::Receiver<Option<Outcome<V>>>;

/// Map from key to in-flight fetch
#[derive(Debug)]
pub struct SingleFlight<K, V> {
    inflight: Arc<Mutex<HashMap<K, Slot<V>>>>,
}

impl<K, V> Default for SingleFlight<K, V> {
    fn default() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of fetches currently in flight.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inflight.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether no fetch is in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `fetch` for `key`, or join the fetch already in flight.
    ///
    /// `fetch` is only invoked by the leader. The shared error is wrapped in
    /// an `Arc` because every waiter observes the same failure.
    pub async fn run<F, Fut>(&self, key: K, fetch: F) -> Outcome<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let mut rx = {
            let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(rx) = inflight.get(&key) {
                rx.clone()
            } else {
                let (tx, rx) = watch::channel(None);
                inflight.insert(key.clone(), rx.clone());
                let fut = fetch();
                let map = Arc::clone(&self.inflight);
                tokio::spawn(async move {
                    let outcome = fut.await.map_err(Arc::new);
                    map.lock().unwrap_or_else(|e| e.into_inner()).remove(&key);
                    let _ = tx.send(Some(outcome));
                });
                rx
            }
        };

        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(outcome) = current {
                return outcome;
            }
            if rx.changed().await.is_err() {
                return Err(Arc::new(Error::remote_fatal(
                    "singleflight",
                    "fetch task terminated without a result",
                )));
            }
        }
    }
}

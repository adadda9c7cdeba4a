//! Request batching
//!
//! Keys requested within one window (or until the batch is full) are handed
//! to a single resolver call, and each caller gets back the value for its
//! own key. Duplicate keys inside a window share one slot in the batch.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use netguard_domain::{ErrorKind, NetError};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// What a resolver returns for one batch.
#[derive(Debug, Clone)]
pub enum BatchOutput<K, V> {
    /// Values looked up by key. Keys absent from the map fail.
    Keyed(HashMap<K, V>),
    /// Values in the same order as the keys passed in.
    Positional(Vec<V>),
}

#[async_trait]
pub trait BatchResolver<K, V>: Send + Sync {
    async fn resolve(&self, keys: Vec<K>) -> Result<BatchOutput<K, V>, NetError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatcherConfig {
    pub max_batch_size: usize,
    pub window: Duration,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self { max_batch_size: 100, window: Duration::from_millis(10) }
    }
}

type Waiters<K, V> = HashMap<K, Vec<oneshot::Sender<Result<V, NetError>>>>;

struct Pending<K, V> {
    keys: Vec<K>,
    waiters: Waiters<K, V>,
    generation: u64,
}

impl<K: Eq + Hash, V> Pending<K, V> {
    fn take(&mut self) -> (Vec<K>, Waiters<K, V>) {
        self.generation += 1;
        (std::mem::take(&mut self.keys), std::mem::take(&mut self.waiters))
    }
}

struct Inner<K, V> {
    resolver: Arc<dyn BatchResolver<K, V>>,
    config: BatcherConfig,
    pending: Mutex<Pending<K, V>>,
}

/// DataLoader-style batcher.
pub struct Batcher<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for Batcher<K, V> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<K, V> Batcher<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + 'static,
{
    pub fn new(resolver: Arc<dyn BatchResolver<K, V>>, config: BatcherConfig) -> Self {
        let config = BatcherConfig { max_batch_size: config.max_batch_size.max(1), ..config };
        Self {
            inner: Arc::new(Inner {
                resolver,
                config,
                pending: Mutex::new(Pending { keys: Vec::new(), waiters: HashMap::new(), generation: 0 }),
            }),
        }
    }

    /// # Errors
    /// The resolver's error, or `Client` when the batch had no value for `key`.
    pub async fn load(&self, key: K) -> Result<V, NetError> {
        let (tx, rx) = oneshot::channel();
        let (full, timer_generation) = {
            let mut pending = self.inner.pending.lock();
            if !pending.waiters.contains_key(&key) {
                pending.keys.push(key.clone());
            }
            pending.waiters.entry(key).or_default().push(tx);

            if pending.keys.len() >= self.inner.config.max_batch_size {
                (Some(pending.take()), None)
            } else if pending.keys.len() == 1 && pending.waiters.values().map(Vec::len).sum::<usize>() == 1 {
                (None, Some(pending.generation))
            } else {
                (None, None)
            }
        };

        if let Some((keys, waiters)) = full {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move { inner.dispatch(keys, waiters).await });
        }
        if let Some(generation) = timer_generation {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                tokio::time::sleep(inner.config.window).await;
                let batch = {
                    let mut pending = inner.pending.lock();
                    (pending.generation == generation && !pending.keys.is_empty()).then(|| pending.take())
                };
                if let Some((keys, waiters)) = batch {
                    inner.dispatch(keys, waiters).await;
                }
            });
        }

        rx.await.unwrap_or_else(|_| Err(NetError::cancelled("batch dropped before resolving")))
    }

    /// Load several keys; results come back in the same order.
    pub async fn load_many(&self, keys: Vec<K>) -> Vec<Result<V, NetError>> {
        join_all(keys.into_iter().map(|key| self.load(key))).await
    }
}

impl<K, V> Inner<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + 'static,
{
    async fn dispatch(&self, keys: Vec<K>, waiters: Waiters<K, V>) {
        debug!(size = keys.len(), "Dispatching batch");
        let values = match self.resolver.resolve(keys.clone()).await {
            Ok(BatchOutput::Keyed(map)) => map,
            Ok(BatchOutput::Positional(values)) => {
                if values.len() != keys.len() {
                    warn!(keys = keys.len(), values = values.len(), "Batch resolver returned wrong number of values");
                }
                keys.into_iter().zip(values).collect()
            }
            Err(err) => {
                warn!(error = %err, "Batch resolver failed");
                for senders in waiters.into_values() {
                    for tx in senders {
                        let _ = tx.send(Err(err.clone()));
                    }
                }
                return;
            }
        };

        for (key, senders) in waiters {
            let result = values
                .get(&key)
                .cloned()
                .ok_or_else(|| NetError::new(ErrorKind::Client, 404, format!("no value for key {key:?}")));
            for tx in senders {
                let _ = tx.send(result.clone());
            }
        }
    }
}

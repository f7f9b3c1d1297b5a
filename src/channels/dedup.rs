//! Dispatcher-side receipt cache keyed by idempotency key

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{DeliveryReceipt, DispatchError, Dispatcher};

/// Default receipt TTL (24 hours)
const RECEIPT_TTL_SECS: u64 = 24 * 60 * 60;

/// Maximum cached receipts
const RECEIPT_MAX_ENTRIES: usize = 10_000;

/// Receipts of successful sends, plus keys whose send outcome is unknown
///
/// TTL-based eviction with a hard cap on entries. A key is unsettled from the
/// moment a send starts until it succeeds or fails before reaching the
/// platform.
#[derive(Debug)]
pub struct ReceiptCache {
    cache: HashMap<String, (DeliveryReceipt, Instant)>,
    unsettled: HashMap<String, Instant>,
    ttl: Duration,
    max_entries: usize,
}

impl Default for ReceiptCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(RECEIPT_TTL_SECS), RECEIPT_MAX_ENTRIES)
    }
}

impl ReceiptCache {
    /// Create a cache with the given TTL and capacity
    #[must_use]
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            cache: HashMap::new(),
            unsettled: HashMap::new(),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    /// Receipt previously stored for `key`, if still fresh
    pub fn get(&mut self, key: &str) -> Option<DeliveryReceipt> {
        let now = Instant::now();
        match self.cache.get(key) {
            Some((receipt, ts)) if now.duration_since(*ts) < self.ttl => Some(receipt.clone()),
            Some(_) => {
                self.cache.remove(key);
                None
            }
            None => None,
        }
    }

    /// Store a receipt
    pub fn insert(&mut self, receipt: DeliveryReceipt) {
        let now = Instant::now();
        self.unsettled.remove(&receipt.idempotency_key);

        // Evict expired entries when at capacity
        if self.cache.len() >= self.max_entries {
            self.cache.retain(|_, (_, ts)| now.duration_since(*ts) < self.ttl);
        }

        // Still full: drop the oldest entry
        if self.cache.len() >= self.max_entries {
            if let Some(oldest_key) = self
                .cache
                .iter()
                .min_by_key(|(_, (_, ts))| *ts)
                .map(|(k, _)| k.clone())
            {
                self.cache.remove(&oldest_key);
            }
        }

        self.cache.insert(receipt.idempotency_key.clone(), (receipt, now));
    }

    /// Mark `key` as in flight
    ///
    /// Returns false when an earlier send of `key` is still unsettled.
    pub fn claim(&mut self, key: &str) -> bool {
        let now = Instant::now();
        if self
            .unsettled
            .get(key)
            .is_some_and(|ts| now.duration_since(*ts) < self.ttl)
        {
            return false;
        }

        if self.unsettled.len() >= self.max_entries {
            self.unsettled.retain(|_, ts| now.duration_since(*ts) < self.ttl);
        }
        if self.unsettled.len() >= self.max_entries {
            if let Some(oldest_key) = self
                .unsettled
                .iter()
                .min_by_key(|(_, ts)| **ts)
                .map(|(k, _)| k.clone())
            {
                self.unsettled.remove(&oldest_key);
            }
        }

        self.unsettled.insert(key.to_string(), now);
        true
    }

    /// Clear the in-flight mark on `key`
    pub fn release(&mut self, key: &str) {
        self.unsettled.remove(key);
    }

    /// Whether `key` has a send with an unknown outcome
    #[must_use]
    pub fn is_unsettled(&self, key: &str) -> bool {
        self.unsettled
            .get(key)
            .is_some_and(|ts| ts.elapsed() < self.ttl)
    }

    /// Number of cached receipts
    #[must_use]
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Whether the cache is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

/// Wraps a dispatcher so one key reaches the platform at most once
///
/// Repeated sends of a delivered key return the first receipt. A key whose
/// earlier send ended in [`DispatchError::Ambiguous`] is refused without
/// calling the inner dispatcher.
pub struct IdempotentDispatcher<D> {
    inner: D,
    receipts: Arc<Mutex<ReceiptCache>>,
}

impl<D: Dispatcher> IdempotentDispatcher<D> {
    /// Wrap a dispatcher with the default cache
    #[must_use]
    pub fn new(inner: D) -> Self {
        Self::with_cache(inner, ReceiptCache::default())
    }

    /// Wrap a dispatcher with a custom cache
    #[must_use]
    pub fn with_cache(inner: D, cache: ReceiptCache) -> Self {
        Self {
            inner,
            receipts: Arc::new(Mutex::new(cache)),
        }
    }

    /// The wrapped dispatcher
    pub const fn inner(&self) -> &D {
        &self.inner
    }
}

#[async_trait]
impl<D: Dispatcher> Dispatcher for IdempotentDispatcher<D> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn send(
        &self,
        recipient: &str,
        text: &str,
        idempotency_key: &str,
    ) -> Result<DeliveryReceipt, DispatchError> {
        {
            let mut receipts = self.receipts.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(mut receipt) = receipts.get(idempotency_key) {
                tracing::debug!(idempotency_key, "replaying cached delivery receipt");
                receipt.replayed = true;
                return Ok(receipt);
            }
            if !receipts.claim(idempotency_key) {
                tracing::warn!(idempotency_key, "earlier send has an unknown outcome, refusing to resend");
                return Err(DispatchError::Ambiguous(format!(
                    "earlier send of {idempotency_key} has an unknown outcome"
                )));
            }
        }

        let result = self.inner.send(recipient, text, idempotency_key).await;
        let mut receipts = self.receipts.lock().unwrap_or_else(PoisonError::into_inner);
        match &result {
            Ok(receipt) => receipts.insert(receipt.clone()),
            // Stays claimed until the TTL passes
            Err(DispatchError::Ambiguous(_)) => {}
            Err(_) => receipts.release(idempotency_key),
        }
        result
    }
}

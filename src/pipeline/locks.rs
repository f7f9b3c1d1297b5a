//! Keyed lock table serializing work per conversation

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Table = Arc<Mutex<HashMap<String, Slot>>>;

#[derive(Debug, Default)]
struct Slot {
    mutex: Arc<AsyncMutex<()>>,
    /// Holders plus waiters
    users: usize,
}

/// One holder's or waiter's claim on a table entry
///
/// The entry is removed when the last claim is dropped, including waiters
/// whose `lock` future was cancelled.
#[derive(Debug)]
struct Lease {
    table: Table,
    key: String,
}

impl Lease {
    fn acquire(table: &Table, key: &str) -> (Self, Arc<AsyncMutex<()>>) {
        let mut map = table.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = map.entry(key.to_string()).or_default();
        slot.users += 1;
        let mutex = Arc::clone(&slot.mutex);
        let lease = Self {
            table: Arc::clone(table),
            key: key.to_string(),
        };
        (lease, mutex)
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let mut map = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = map.get_mut(&self.key) {
            slot.users = slot.users.saturating_sub(1);
            if slot.users == 0 {
                map.remove(&self.key);
            }
        }
    }
}

/// Exclusive access to one conversation, released on drop
#[must_use = "the conversation is unlocked as soon as the guard is dropped"]
#[derive(Debug)]
pub struct ConversationGuard {
    // Field order matters: the mutex is released before the lease
    _guard: OwnedMutexGuard<()>,
    _lease: Lease,
}

/// One async mutex per conversation id
///
/// Entries are created on demand and removed once no task holds or waits on
/// them, so the table only ever tracks active conversations.
#[derive(Debug, Default, Clone)]
pub struct ConversationLocks {
    inner: Table,
}

impl ConversationLocks {
    /// Create an empty lock table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to a conversation
    pub async fn lock(&self, conversation_id: &str) -> ConversationGuard {
        let (lease, mutex) = Lease::acquire(&self.inner, conversation_id);
        let guard = mutex.lock_owned().await;
        ConversationGuard {
            _guard: guard,
            _lease: lease,
        }
    }

    /// Try to take a conversation without waiting
    #[must_use]
    pub fn try_lock(&self, conversation_id: &str) -> Option<ConversationGuard> {
        let (lease, mutex) = Lease::acquire(&self.inner, conversation_id);
        let guard = mutex.try_lock_owned().ok()?;
        Some(ConversationGuard {
            _guard: guard,
            _lease: lease,
        })
    }

    /// Number of tracked conversations
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether no conversation is tracked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

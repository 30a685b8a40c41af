//! Cancellation tokens for chunk requests and fetches
//!
//! Tokens are cooperative: a fetch checks `is_cancelled()` between steps and
//! stops early, and a caller waiting on a chunk can withdraw its interest by
//! cancelling its own token.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, PoisonError,
};

/// Cancellation token for cooperative cancellation
///
/// Clones share the same underlying state, so cancelling any clone is
/// observed by all of them.
///
/// # Example
///
/// ```
/// use chunkstream_scheduler::CancellationToken;
///
/// let token = CancellationToken::new();
/// let fetch_token = token.clone();
///
/// token.cancel();
/// assert!(fetch_token.is_cancelled());
/// ```
#[derive(Clone, Debug)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Create a new token in the non-cancelled state
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Cancel this token and every clone of it; idempotent
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Returns `true` once `cancel()` has been called on this token or any clone
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Tokens of in-flight work, keyed by what the work is for
///
/// Registering a key that is already present cancels the previous token, so
/// at most one live token exists per key.
pub struct CancellationRegistry<K> {
    tokens: Arc<Mutex<HashMap<K, CancellationToken>>>,
}

impl<K: Eq + Hash + Clone> CancellationRegistry<K> {
    pub fn new() -> Self {
        Self {
            tokens: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<K, CancellationToken>> {
        self.tokens.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register work for `key` and return the token to hand to it
    pub fn register(&self, key: K) -> CancellationToken {
        let token = CancellationToken::new();
        if let Some(previous) = self.lock().insert(key, token.clone()) {
            previous.cancel();
        }
        token
    }

    /// Cancel and forget the work for `key`; returns `true` if there was any
    pub fn cancel(&self, key: &K) -> bool {
        match self.lock().remove(key) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Forget finished work without cancelling it
    ///
    /// Only removes the entry if it still holds `token`, so a finished stale
    /// fetch cannot unregister a newer one for the same key.
    pub fn unregister(&self, key: &K, token: &CancellationToken) -> bool {
        let mut tokens = self.lock();
        match tokens.get(key) {
            Some(current) if Arc::ptr_eq(&current.cancelled, &token.cancelled) => {
                tokens.remove(key);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, key: &K) -> Option<CancellationToken> {
        self.lock().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl<K: Eq + Hash + Clone> Default for CancellationRegistry<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Clone for CancellationRegistry<K> {
    fn clone(&self) -> Self {
        Self {
            tokens: Arc::clone(&self.tokens),
        }
    }
}

//! Async FIFO mutual exclusion and a table of named mutexes.
//!
//! A [`Mutex`] serializes critical sections across tasks of one process.
//! Waiters are served strictly in arrival order. The lock is released when the
//! [`MutexGuard`] is dropped, so `with_lock` releases on every exit path:
//! normal return, an `Err` value, or a panic unwinding through the body.
//!
//! [`MutexRegistry`] maps resource names (for example the path of a shared
//! registry file) to their mutex. It is an explicit handle, cloned into every
//! component that needs it, so independent registries can coexist.

use crate::error::{Result, VfError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;

// ---------------------------------------------------------------------------
// Mutex
// ---------------------------------------------------------------------------

struct Shared {
    name: String,
    lock: Arc<tokio::sync::Mutex<()>>,
    waiting: AtomicUsize,
}

/// Cloning yields another handle to the same lock.
#[derive(Clone)]
pub struct Mutex {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Mutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutex")
            .field("name", &self.shared.name)
            .field("locked", &self.is_locked())
            .field("queue_length", &self.queue_length())
            .finish()
    }
}

/// Holding this value means holding the lock.
#[derive(Debug)]
pub struct MutexGuard {
    _guard: OwnedMutexGuard<()>,
}

impl MutexGuard {
    /// Hand the lock to the next waiter, or unlock if nobody waits.
    pub fn release(self) {}
}

/// Counts a caller as waiting until it either gets the lock or gives up.
struct WaitTicket<'a>(&'a AtomicUsize);

impl<'a> WaitTicket<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for WaitTicket<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Mutex {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                lock: Arc::new(tokio::sync::Mutex::new(())),
                waiting: AtomicUsize::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Resolve immediately when unlocked, otherwise queue behind earlier
    /// callers.
    pub async fn acquire(&self) -> MutexGuard {
        let _ticket = WaitTicket::new(&self.shared.waiting);
        let guard = Arc::clone(&self.shared.lock).lock_owned().await;
        MutexGuard { _guard: guard }
    }

    /// Like [`Mutex::acquire`], but gives up after `timeout` and leaves the
    /// wait queue.
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<MutexGuard> {
        tokio::time::timeout(timeout, self.acquire())
            .await
            .map_err(|_| VfError::LockTimeout {
                name: self.shared.name.clone(),
                seconds: timeout.as_secs(),
            })
    }

    /// Run `f` inside the critical section.
    pub async fn with_lock<F, Fut, T>(&self, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.acquire().await;
        f().await
    }

    /// [`Mutex::with_lock`] with an optional acquisition timeout.
    pub async fn with_lock_timeout<F, Fut, T>(&self, timeout: Option<Duration>, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = match timeout {
            Some(t) => self.acquire_timeout(t).await?,
            None => self.acquire().await,
        };
        Ok(f().await)
    }

    pub fn is_locked(&self) -> bool {
        self.shared.lock.try_lock().is_err()
    }

    /// Number of callers currently waiting for the lock.
    pub fn queue_length(&self) -> usize {
        self.shared.waiting.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> MutexStatus {
        MutexStatus {
            locked: self.is_locked(),
            queue_length: self.queue_length(),
        }
    }
}

// ---------------------------------------------------------------------------
// MutexRegistry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutexStatus {
    pub locked: bool,
    pub queue_length: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MutexRegistry {
    mutexes: Arc<std::sync::Mutex<BTreeMap<String, Mutex>>>,
}

impl MutexRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Mutex>> {
        // The table is only touched by short non-panicking sections.
        self.mutexes.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The mutex for `name`, created on first use.
    pub fn get_mutex(&self, name: &str) -> Mutex {
        self.table()
            .entry(name.to_string())
            .or_insert_with(|| Mutex::new(name))
            .clone()
    }

    pub async fn with_lock<F, Fut, T>(&self, name: &str, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let mutex = self.get_mutex(name);
        tracing::debug!(lock = name, "acquiring");
        mutex.with_lock(f).await
    }

    pub async fn with_lock_timeout<F, Fut, T>(
        &self,
        name: &str,
        timeout: Option<Duration>,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let mutex = self.get_mutex(name);
        tracing::debug!(lock = name, "acquiring");
        mutex.with_lock_timeout(timeout, f).await
    }

    /// Forget every named mutex. Handles already given out keep working but
    /// no longer exclude callers that look the name up afresh.
    pub fn clear(&self) {
        self.table().clear();
    }

    pub fn status(&self) -> BTreeMap<String, MutexStatus> {
        self.table()
            .iter()
            .map(|(name, m)| (name.clone(), m.status()))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

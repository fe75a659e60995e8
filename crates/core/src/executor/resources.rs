//! Per-worker resource pool
//!
//! Some operators hold state that must not be shared between concurrent
//! tile computations (a classifier instance, a scratch arena). Instead of
//! thread-local storage — which does not survive a move between worker
//! tasks — such operators keep a [`ResourcePool`] sized to the worker
//! pool's parallelism and acquire one instance around each computation.

use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tokio::sync::{Semaphore, SemaphorePermit};

use crate::error::{Error, Result};

/// A fixed set of reusable resources, handed out one at a time.
pub struct ResourcePool<T> {
    items: Mutex<Vec<T>>,
    available: Arc<Semaphore>,
    capacity: usize,
}

impl<T: Send> ResourcePool<T> {
    /// Creates a pool over the given instances.
    pub fn new(items: Vec<T>) -> Self {
        let capacity = items.len();
        Self {
            items: Mutex::new(items),
            available: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Builds a pool of `capacity` instances from a factory.
    pub fn with_capacity(capacity: usize, mut factory: impl FnMut() -> T) -> Self {
        Self::new((0..capacity).map(|_| factory()).collect())
    }

    /// Number of instances the pool was created with.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of instances currently available.
    pub fn available(&self) -> usize {
        self.available.available_permits()
    }

    /// Acquires one instance, waiting until one is free. The guard returns
    /// the instance on drop.
    pub async fn acquire(&self) -> Result<ResourceGuard<'_, T>> {
        let permit = self
            .available
            .acquire()
            .await
            .map_err(|_| Error::Execution("resource pool closed".to_string()))?;
        let item = self
            .items
            .lock()
            .pop()
            .ok_or_else(|| Error::Execution("resource pool exhausted".to_string()))?;
        Ok(ResourceGuard {
            pool: self,
            item: Some(item),
            _permit: permit,
        })
    }
}

/// Exclusive access to one pooled instance.
pub struct ResourceGuard<'a, T: Send> {
    pool: &'a ResourcePool<T>,
    item: Option<T>,
    _permit: SemaphorePermit<'a>,
}

impl<T: Send> Deref for ResourceGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.item.as_ref().expect("resource present until drop")
    }
}

impl<T: Send> DerefMut for ResourceGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_mut().expect("resource present until drop")
    }
}

impl<T: Send> Drop for ResourceGuard<'_, T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.pool.items.lock().push(item);
        }
        // The permit is released after the item is back in the pool
    }
}

//! Thread-safe object pools.
//!
//! Shared by every connection: one pool of write buffers per server and one
//! pool of packet contexts per handled packet type.

use parking_lot::Mutex;
use std::fmt;
use std::ops::{Deref, DerefMut};

/// Values that can be cleared and handed out again.
pub trait Reusable: Default + Send {
    /// Drop any per-use state.
    fn reset(&mut self);
}

impl Reusable for Vec<u8> {
    fn reset(&mut self) {
        self.clear();
    }
}

/// Bounded free list of reusable values.
pub struct Pool<T> {
    idle: Mutex<Vec<T>>,
    max_idle: usize,
}

impl<T: Reusable> Pool<T> {
    /// Pool that keeps at most `max_idle` values around.
    pub fn new(max_idle: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            max_idle,
        }
    }

    /// Take a value, constructing one if the pool is empty.
    ///
    /// The value returns to the pool, reset, when the guard drops.
    pub fn rent(&self) -> Pooled<'_, T> {
        let item = self.idle.lock().pop().unwrap_or_default();
        Pooled { pool: self, item }
    }

    /// Values currently waiting in the pool.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    fn give_back(&self, mut item: T) {
        item.reset();
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(item);
        }
    }
}

impl<T> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("idle", &self.idle.lock().len())
            .field("max_idle", &self.max_idle)
            .finish()
    }
}

/// A rented value; returned to its pool on drop.
pub struct Pooled<'a, T: Reusable> {
    pool: &'a Pool<T>,
    item: T,
}

impl<T: Reusable> Deref for Pooled<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.item
    }
}

impl<T: Reusable> DerefMut for Pooled<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.item
    }
}

impl<T: Reusable> Drop for Pooled<'_, T> {
    fn drop(&mut self) {
        let item = std::mem::take(&mut self.item);
        self.pool.give_back(item);
    }
}

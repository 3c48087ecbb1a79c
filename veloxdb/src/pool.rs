//! Context pool (§4.C10, ambient): reusable per-session scratch contexts
//! (allocator handles, change lists, pools) checked out for the lifetime of
//! one `ObjectModel` session and returned on dispose. One slot per core is
//! kept latched with a CAS spin loop — grounded on the `RWSpinlock`
//! latch-and-spin technique from `prataprc-rdms`'s `spinlock.rs`, simplified
//! to a single-owner latch since a checked-out context is never shared —
//! with a mutex-guarded overflow pool for when every core's slot is busy.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// One per-core slot: `busy` is the latch bit, `value` the parked context.
struct Slot<T> {
    busy: AtomicBool,
    value: Mutex<Option<T>>,
}

/// A pool of `T` sized to the machine's core count, with unbounded
/// spillover. `T` is typically a session context struct bundling an id
/// allocator, change list, and value pools — expensive enough to be worth
/// reusing, cheap enough that blocking on it defeats the point.
pub struct ContextPool<T> {
    slots: Vec<Slot<T>>,
    overflow: Mutex<Vec<T>>,
    factory: Box<dyn Fn() -> T + Send + Sync>,
}

/// A checked-out context. Returned to its origin slot (or the overflow
/// pool) on drop.
pub struct Checkout<'a, T> {
    pool: &'a ContextPool<T>,
    value: Option<T>,
    slot: Option<usize>,
}

impl<T> ContextPool<T> {
    pub fn new(factory: impl Fn() -> T + Send + Sync + 'static) -> Self {
        let cores = num_cpus::get().max(1);
        let slots = (0..cores)
            .map(|_| Slot { busy: AtomicBool::new(false), value: Mutex::new(None) })
            .collect();
        ContextPool { slots, overflow: Mutex::new(Vec::new()), factory: Box::new(factory) }
    }

    /// Tries each per-core slot first (CAS spin, one pass, non-blocking —
    /// a busy slot is skipped rather than spun on, since another core's
    /// slot is just as good); falls back to the overflow pool, then to a
    /// freshly constructed context.
    pub fn acquire(&self) -> Checkout<'_, T> {
        for (index, slot) in self.slots.iter().enumerate() {
            if slot.busy.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed).is_ok() {
                let value = slot.value.lock().unwrap().take().unwrap_or_else(&self.factory);
                return Checkout { pool: self, value: Some(value), slot: Some(index) };
            }
        }
        let value = self.overflow.lock().unwrap().pop().unwrap_or_else(&self.factory);
        Checkout { pool: self, value: Some(value), slot: None }
    }
}

impl<'a, T> std::ops::Deref for Checkout<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.value.as_ref().unwrap()
    }
}

impl<'a, T> std::ops::DerefMut for Checkout<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_mut().unwrap()
    }
}

impl<'a, T> Drop for Checkout<'a, T> {
    fn drop(&mut self) {
        let value = self.value.take().unwrap();
        match self.slot {
            Some(index) => {
                let slot = &self.pool.slots[index];
                *slot.value.lock().unwrap() = Some(value);
                slot.busy.store(false, Ordering::Release);
            }
            None => {
                self.pool.overflow.lock().unwrap().push(value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuses_a_returned_context() {
        let pool = ContextPool::new(|| 0i32);
        {
            let mut ctx = pool.acquire();
            *ctx = 42;
        }
        let ctx = pool.acquire();
        assert_eq!(*ctx, 42);
    }

    #[test]
    fn spills_over_when_every_slot_is_checked_out() {
        let pool = ContextPool::new(|| 0i32);
        let cores = num_cpus::get().max(1);
        let mut held: Vec<_> = (0..cores).map(|_| pool.acquire()).collect();
        let overflow = pool.acquire();
        assert_eq!(*overflow, 0);
        held.clear();
    }
}

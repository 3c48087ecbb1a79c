//! Pipelined id-range allocation (§4.C1). A session never blocks its own
//! `reserve` call on the engine round trip: it hands out ids from a local
//! `[current, limit)` window and kicks off a background refill once the
//! window crosses the low-water mark, so the engine call overlaps with the
//! caller's own work instead of sitting in its critical path.

use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::error::{Error, Result};

/// What `alloc.rs` needs from the engine: reserving a range of raw sequence
/// numbers. Kept separate from `engine::Transaction` so the allocator isn't
/// tied to any one in-flight transaction's lifetime.
pub trait IdSource: Send + Sync + 'static {
    fn reserve_id_range(&self, count: u64) -> Result<u64>;
}

#[derive(Clone, Copy)]
struct Window {
    current: u64,
    limit: u64,
}

enum Refill {
    Idle,
    InFlight(oneshot::Receiver<Result<u64>>),
}

/// The session-wide id allocator (§4.C1). Hands out raw 48-bit sequence
/// numbers; the caller (the session, on `create_object`) tags the class id
/// into the high bits via `ObjectId::new`. Spec defaults (§6
/// Configuration): `range_size` ~5_000_000, `request_size` ~1_000,
/// `water_mark` ~0.4.
pub struct IdAllocator<S: IdSource> {
    source: std::sync::Arc<S>,
    range_size: u64,
    request_size: u64,
    water_mark: f64,
    window: Mutex<Window>,
    refill: Mutex<Refill>,
    /// A `request_size`-sized window fetched in the background, waiting to
    /// be adopted by the next `reserve` that exhausts `window`. Populated by
    /// `poll_refill` unconditionally, so the prefetch is never wasted.
    pending: Mutex<Option<Window>>,
}

impl<S: IdSource> IdAllocator<S> {
    pub fn new(source: std::sync::Arc<S>, range_size: u64, request_size: u64, water_mark: f64) -> Self {
        IdAllocator {
            source,
            range_size,
            request_size,
            water_mark,
            window: Mutex::new(Window { current: 0, limit: 0 }),
            refill: Mutex::new(Refill::Idle),
            pending: Mutex::new(None),
        }
    }

    /// Reserves `count` consecutive sequence numbers, refilling the local
    /// window synchronously if it's exhausted, and kicking off a background
    /// refill once the remaining window drops below the water mark.
    pub fn reserve(&self, count: u64) -> Result<u64> {
        self.poll_refill();

        let mut window = self.window.lock().unwrap();
        if window.current + count > window.limit {
            if let Some(next) = self.pending.lock().unwrap().take() {
                if next.limit.saturating_sub(next.current) >= count {
                    *window = next;
                }
            }
        }
        if window.current + count > window.limit {
            let requested = self.range_size.max(count);
            let first = self.source.reserve_id_range(requested)?;
            window.current = first;
            window.limit = first + requested;
        }

        let first = window.current;
        window.current += count;

        let remaining = window.limit.saturating_sub(window.current) as f64;
        let span = (window.limit.saturating_sub(first)) as f64;
        if span > 0.0 && remaining / span < self.water_mark {
            drop(window);
            self.start_refill();
        }

        Ok(first)
    }

    fn start_refill(&self) {
        let mut refill = self.refill.lock().unwrap();
        if matches!(*refill, Refill::InFlight(_)) {
            return;
        }
        let (tx, rx) = oneshot::channel();
        let source = self.source.clone();
        let request_size = self.request_size;
        tokio::spawn(async move {
            let _ = tx.send(source.reserve_id_range(request_size));
        });
        *refill = Refill::InFlight(rx);
    }

    /// Drains a completed background fetch into `pending`, if any. Does not
    /// touch `window` itself — `reserve` adopts `pending` on its own next
    /// exhaustion, which is the only place that can safely decide whether
    /// the prefetched range is still needed.
    fn poll_refill(&self) {
        let mut refill = self.refill.lock().unwrap();
        if let Refill::InFlight(rx) = &mut *refill {
            match rx.try_recv() {
                Ok(result) => {
                    *refill = Refill::Idle;
                    if let Ok(first) = result {
                        let requested = self.request_size;
                        *self.pending.lock().unwrap() = Some(Window { current: first, limit: first + requested });
                    }
                }
                Err(oneshot::error::TryRecvError::Empty) => {}
                Err(oneshot::error::TryRecvError::Closed) => {
                    *refill = Refill::Idle;
                }
            }
        }
    }
}

/// Raised when a window refill's engine call fails outright; surfaced from
/// `reserve` as [`Error::IdExhausted`] so the caller sees a normal session
/// error rather than a panic.
pub fn exhausted(detail: impl Into<String>) -> Error {
    Error::IdExhausted(detail.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    struct CountingSource(AtomicU64);

    impl IdSource for CountingSource {
        fn reserve_id_range(&self, count: u64) -> Result<u64> {
            Ok(self.0.fetch_add(count, Ordering::SeqCst))
        }
    }

    #[tokio::test]
    async fn reserves_disjoint_ids_within_a_window() {
        let source = Arc::new(CountingSource(AtomicU64::new(1)));
        let alloc = IdAllocator::new(source, 100, 10, 0.4);
        let a = alloc.reserve(1).unwrap();
        let b = alloc.reserve(1).unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn new_window_once_exhausted() {
        let source = Arc::new(CountingSource(AtomicU64::new(1)));
        let alloc = IdAllocator::new(source, 4, 4, 0.4);
        let sequences: std::collections::HashSet<_> = (0..6).map(|_| alloc.reserve(1).unwrap()).collect();
        assert_eq!(sequences.len(), 6);
    }
}

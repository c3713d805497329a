//! Bounded pooling of expensive resources (connections, handles).
//!
//! A [`PoolContainer`] keeps up to `N` idle elements and allows up to `2·N`
//! leased at once as a burst allowance. Acquisition blocks on a condition
//! variable when the burst allowance is exhausted; after a 60 second wait
//! the container over-allocates rather than deadlock, which is logged and
//! recoverable. Leases release automatically on drop; the explicit
//! reference-count path ([`Lease::reacquire`]) passes an element through a
//! nested call without releasing it in between.

use std::collections::{HashMap, VecDeque};
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use log::warn;
use parking_lot::{Condvar, Mutex};

use crate::errors::{DmError, DmResult, ErrorCode};

/// How long a blocking acquire waits before over-allocating.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(60);

/// Creates, destroys and validates the pooled elements.
pub trait PoolElementFactory: Send + Sync + 'static {
    /// The pooled resource type.
    type Element: Send + Sync + 'static;

    /// Create a fresh element.
    fn create(&self) -> DmResult<Self::Element>;

    /// Dispose of an element. The default just drops it.
    fn destroy(&self, element: Self::Element) {
        drop(element);
    }

    /// Whether a pooled element is still usable. Invalid elements are
    /// destroyed and replaced on acquire.
    fn is_valid(&self, _element: &Self::Element) -> bool {
        true
    }
}

struct LeaseSlot<E> {
    element: Arc<E>,
    refs: u32,
}

struct State<E> {
    free: VecDeque<E>,
    used: HashMap<u64, LeaseSlot<E>>,
    /// Remaining burst allowance; negative after timeout over-allocation.
    free_slots: i64,
    /// Target pooled size N.
    max: i64,
    next_lease: u64,
}

struct Shared<F: PoolElementFactory> {
    factory: F,
    state: Mutex<State<F::Element>>,
    available: Condvar,
}

/// A bounded pool of elements produced by a [`PoolElementFactory`].
pub struct PoolContainer<F: PoolElementFactory> {
    shared: Arc<Shared<F>>,
}

impl<F: PoolElementFactory> std::fmt::Debug for PoolContainer<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("PoolContainer")
            .field("free", &state.free.len())
            .field("used", &state.used.len())
            .field("free_slots", &state.free_slots)
            .field("max", &state.max)
            .finish()
    }
}

impl<F: PoolElementFactory> PoolContainer<F> {
    /// Create a pool targeting `size` pooled elements (burst cap `2·size`).
    pub fn new(factory: F, size: usize) -> PoolContainer<F> {
        PoolContainer {
            shared: Arc::new(Shared {
                factory,
                state: Mutex::new(State {
                    free: VecDeque::new(),
                    used: HashMap::new(),
                    free_slots: 2 * size as i64,
                    max: size as i64,
                    next_lease: 1,
                }),
                available: Condvar::new(),
            }),
        }
    }

    /// Lease an element. With `block` set, waits for a release when the
    /// burst allowance is exhausted; otherwise fails immediately with
    /// `RESOURCE_UNAVAILABLE`.
    pub fn acquire(&self, block: bool) -> DmResult<Lease<F>> {
        let mut popped = None;
        {
            let mut state = self.shared.state.lock();

            if !block && state.free_slots <= 0 {
                return Err(DmError::new(
                    ErrorCode::RESOURCE_UNAVAILABLE,
                    "no pooled resources available",
                ));
            }

            while state.free_slots < 1 {
                let timed_out = self
                    .shared
                    .available
                    .wait_for(&mut state, ACQUIRE_TIMEOUT)
                    .timed_out();
                if timed_out {
                    warn!(
                        "timeout after {}s waiting for a pooled resource, over-allocating",
                        ACQUIRE_TIMEOUT.as_secs()
                    );
                    break;
                }
            }

            while let Some(e) = state.free.pop_front() {
                if self.shared.factory.is_valid(&e) {
                    popped = Some(e);
                    break;
                }
                // Expired while pooled; replace it.
                self.shared.factory.destroy(e);
            }
        }

        // Creation happens outside the lock; it may be slow (real
        // connections) or itself need the pool.
        let element = match popped {
            Some(e) => e,
            None => self.shared.factory.create()?,
        };

        let mut state = self.shared.state.lock();
        let id = state.next_lease;
        state.next_lease += 1;
        let element = Arc::new(element);
        state.used.insert(
            id,
            LeaseSlot {
                element: Arc::clone(&element),
                refs: 1,
            },
        );
        state.free_slots -= 1;
        Ok(Lease {
            shared: Arc::clone(&self.shared),
            id,
            element: Some(element),
        })
    }

    /// Current reference count of a lease (0 when unknown).
    pub fn ref_count(&self, lease: &Lease<F>) -> u32 {
        let state = self.shared.state.lock();
        state.used.get(&lease.id).map(|s| s.refs).unwrap_or(0)
    }

    /// Number of idle pooled elements.
    pub fn idle(&self) -> usize {
        self.shared.state.lock().free.len()
    }

    /// Change the target size. Usage self-regulates on subsequent releases.
    pub fn resize(&self, size: usize) {
        let mut state = self.shared.state.lock();
        state.max = size as i64;
        state.free_slots = 2 * state.max - state.used.len() as i64;
        if state.free_slots > 0 {
            self.shared.available.notify_all();
        }
    }
}

impl<F: PoolElementFactory> Drop for Shared<F> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        while let Some(e) = state.free.pop_front() {
            self.factory.destroy(e);
        }
        if !state.used.is_empty() {
            // Destroying leased elements under a client's feet would be
            // worse than the leak.
            warn!(
                "{} pooled elements still leased on pool destruction",
                state.used.len()
            );
        }
    }
}

/// A leased element. Dereferences to the element; dropping it releases one
/// reference, and the element returns to the pool when the last reference
/// goes.
pub struct Lease<F: PoolElementFactory> {
    shared: Arc<Shared<F>>,
    id: u64,
    element: Option<Arc<F::Element>>,
}

impl<F: PoolElementFactory> Lease<F> {
    /// Increment the reference count and return a second handle to the same
    /// element, for passing a leased resource through a nested call.
    pub fn reacquire(&self) -> Lease<F> {
        let mut state = self.shared.state.lock();
        if let Some(slot) = state.used.get_mut(&self.id) {
            slot.refs += 1;
        }
        Lease {
            shared: Arc::clone(&self.shared),
            id: self.id,
            element: self.element.clone(),
        }
    }
}

impl<F: PoolElementFactory> Deref for Lease<F> {
    type Target = F::Element;

    fn deref(&self) -> &F::Element {
        self.element.as_ref().expect("lease already released")
    }
}

impl<F: PoolElementFactory> std::fmt::Debug for Lease<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Lease({})", self.id)
    }
}

impl<F: PoolElementFactory> Drop for Lease<F> {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        let ours = self.element.take();
        let last = match state.used.get_mut(&self.id) {
            Some(slot) => {
                slot.refs -= 1;
                slot.refs == 0
            }
            None => false,
        };
        if !last {
            return;
        }
        let slot = state.used.remove(&self.id).expect("slot present");
        drop(slot.element);
        let element = match ours.and_then(|a| Arc::try_unwrap(a).ok()) {
            Some(e) => e,
            // A reacquired handle still holds the element somewhere; give
            // the slot back anyway.
            None => {
                state.free_slots += 1;
                self.shared.available.notify_one();
                return;
            }
        };
        if (state.free.len() as i64) < state.max {
            state.free.push_back(element);
        } else {
            self.shared.factory.destroy(element);
        }
        state.free_slots += 1;
        drop(state);
        self.shared.available.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::thread;

    struct CountingFactory {
        created: AtomicU32,
        destroyed: AtomicU32,
        valid: std::sync::atomic::AtomicBool,
    }

    impl CountingFactory {
        fn new() -> CountingFactory {
            CountingFactory {
                created: AtomicU32::new(0),
                destroyed: AtomicU32::new(0),
                valid: std::sync::atomic::AtomicBool::new(true),
            }
        }
    }

    impl PoolElementFactory for Arc<CountingFactory> {
        type Element = u32;

        fn create(&self) -> DmResult<u32> {
            Ok(self.created.fetch_add(1, Ordering::SeqCst))
        }

        fn destroy(&self, _element: u32) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }

        fn is_valid(&self, _element: &u32) -> bool {
            self.valid.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_acquire_release_reuses_elements() {
        let factory = Arc::new(CountingFactory::new());
        let pool = PoolContainer::new(Arc::clone(&factory), 2);

        let a = pool.acquire(true).unwrap();
        let first = *a;
        drop(a);
        let b = pool.acquire(true).unwrap();
        assert_eq!(*b, first);
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_refcount_requires_matching_releases() {
        let factory = Arc::new(CountingFactory::new());
        let pool = PoolContainer::new(Arc::clone(&factory), 1);

        let lease = pool.acquire(true).unwrap();
        let h2 = lease.reacquire();
        let h3 = lease.reacquire();
        assert_eq!(pool.ref_count(&lease), 3);

        drop(lease);
        assert_eq!(pool.ref_count(&h2), 2);
        assert_eq!(pool.idle(), 0);
        drop(h2);
        assert_eq!(pool.idle(), 0);
        drop(h3);
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn test_nonblocking_acquire_fails_when_exhausted() {
        let factory = Arc::new(CountingFactory::new());
        let pool = PoolContainer::new(Arc::clone(&factory), 1);

        let _a = pool.acquire(true).unwrap();
        let _b = pool.acquire(true).unwrap();
        let err = pool.acquire(false).unwrap_err();
        assert_eq!(err.code(), ErrorCode::RESOURCE_UNAVAILABLE);
    }

    #[test]
    fn test_invalid_elements_are_replaced() {
        let factory = Arc::new(CountingFactory::new());
        let pool = PoolContainer::new(Arc::clone(&factory), 1);

        drop(pool.acquire(true).unwrap());
        factory.valid.store(false, Ordering::SeqCst);
        let _lease = pool.acquire(true).unwrap();
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_blocked_acquire_wakes_on_release() {
        let factory = Arc::new(CountingFactory::new());
        let pool = Arc::new(PoolContainer::new(Arc::clone(&factory), 1));

        let a = pool.acquire(true).unwrap();
        let b = pool.acquire(true).unwrap();

        let pool2 = Arc::clone(&pool);
        let waiter = thread::spawn(move || {
            let lease = pool2.acquire(true).unwrap();
            *lease
        });

        thread::sleep(Duration::from_millis(50));
        drop(a);
        drop(b);
        waiter.join().unwrap();
    }

    #[test]
    fn test_pool_never_holds_more_than_max() {
        let factory = Arc::new(CountingFactory::new());
        let pool = PoolContainer::new(Arc::clone(&factory), 1);

        let a = pool.acquire(true).unwrap();
        let b = pool.acquire(true).unwrap();
        drop(a);
        drop(b);
        // One pooled, one destroyed.
        assert_eq!(pool.idle(), 1);
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_resize_shrinks_on_release() {
        let factory = Arc::new(CountingFactory::new());
        let pool = PoolContainer::new(Arc::clone(&factory), 4);
        let leases: Vec<_> = (0..4).map(|_| pool.acquire(true).unwrap()).collect();
        pool.resize(1);
        drop(leases);
        assert_eq!(pool.idle(), 1);
    }
}

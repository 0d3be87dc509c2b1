use futures::future::BoxFuture;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, watch, Mutex as AsyncMutex};
use tracing::warn;

/// A generic bounded pool that lends at most `max` instances of a resource
/// `T` to concurrent callers.
///
/// The unused queue is FIFO, so long-idle resources are recycled first.
/// Waiters that arrive once the pool is exhausted (`owned == max` and no
/// unused resource is available) are served, also FIFO, in the order they
/// suspended.
///
/// Resources are created lazily via the factory supplied at
/// [construction](Pool::new), up to `max` of them. The factory is expected to
/// retry internally until it succeeds (much like a `Connector` does for AMQP
/// channels); this pool does not retry resource creation itself.
///
/// A `Pool` is only useful wrapped in an `Arc` (see [`Pool::into_shared`]),
/// since [`acquire`](Pool::acquire) hands out [`Leased`] guards that release
/// themselves back to the pool on drop.
pub struct Pool<T: Send + 'static> {
    state: AsyncMutex<State<T>>,
    factory: Box<dyn Fn() -> BoxFuture<'static, T> + Send + Sync>,
    max: usize,
    empty_tx: watch::Sender<bool>,
    empty_rx: watch::Receiver<bool>,
    next_lease: AtomicU64,
    name: Arc<str>,
}

struct State<T> {
    unused: VecDeque<T>,
    owned: usize,
    checked_out: HashSet<u64>,
    waiters: VecDeque<oneshot::Sender<(u64, T)>>,
}

/// A resource leased from a [`Pool`]. Dereferences to the underlying
/// resource. Dropping a lease returns the resource to the pool (via a
/// spawned task); call [`Pool::release`] to do so eagerly and synchronously
/// with respect to the caller instead.
pub struct Leased<T: Send + 'static> {
    value: Option<T>,
    lease_id: u64,
    pool: Arc<Pool<T>>,
}

/// Fatal, non-recoverable misuse of a [`Pool`].
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// A resource was released that this pool does not recognize as
    /// currently checked out. [`Leased`]'s ownership makes this unreachable
    /// through the public API (a `Leased<T>` can only be produced by
    /// [`Pool::acquire`] on the same pool it is later released to), but the
    /// variant is kept public for lower-level release paths built atop
    /// [`Pool`].
    #[error("attempted to release a resource that is not currently checked out of this pool")]
    NotCheckedOut,
}

impl<T: Send + 'static> Pool<T> {
    /// Creates a new pool that lends at most `max` resources, creating fresh
    /// ones lazily via `factory`.
    pub fn new<F, Fut>(name: impl Into<Arc<str>>, max: usize, factory: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = T> + Send + 'static,
    {
        let (empty_tx, empty_rx) = watch::channel(true);

        Self {
            state: AsyncMutex::new(State {
                unused: VecDeque::new(),
                owned: 0,
                checked_out: HashSet::new(),
                waiters: VecDeque::new(),
            }),
            factory: Box::new(move || Box::pin(factory()) as BoxFuture<'static, T>),
            max,
            empty_tx,
            empty_rx,
            next_lease: AtomicU64::new(0),
            name: name.into(),
        }
    }

    /// Wraps this pool in an `Arc` so [`acquire`](Self::acquire) can hand out
    /// self-releasing [`Leased`] guards.
    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Reports the configured maximum number of resources this pool will own
    /// at once.
    pub fn max(&self) -> usize {
        self.max
    }

    /// Reports this pool's name, for logging/debugging.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns an unused resource, creating a fresh one if `owned < max`;
    /// otherwise enqueues this call as a FIFO waiter and suspends until some
    /// caller [releases](Self::release) a resource.
    pub async fn acquire(self: &Arc<Self>) -> Leased<T> {
        enum Outcome<T> {
            Resource(u64, T),
            MustCreate,
            Waiting(u64, T),
        }

        let outcome = {
            let mut state = self.state.lock().await;

            if let Some(resource) = state.unused.pop_front() {
                let lease_id = self.next_lease.fetch_add(1, Ordering::Relaxed);
                state.checked_out.insert(lease_id);
                Outcome::Resource(lease_id, resource)
            } else if state.owned < self.max {
                state.owned += 1;
                Outcome::MustCreate
            } else {
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                drop(state);

                let (lease_id, resource) = rx.await.expect(
                    "pool waiter's oneshot sender was dropped without a response; this \
                     indicates the pool itself was dropped while a waiter was suspended",
                );

                Outcome::Waiting(lease_id, resource)
            }
        };

        let (lease_id, resource) = match outcome {
            Outcome::Resource(lease_id, resource) => {
                self.mark_in_use();
                (lease_id, resource)
            }
            Outcome::Waiting(lease_id, resource) => (lease_id, resource),
            Outcome::MustCreate => {
                let resource = (self.factory)().await;
                let lease_id = self.next_lease.fetch_add(1, Ordering::Relaxed);
                self.state.lock().await.checked_out.insert(lease_id);
                self.mark_in_use();
                (lease_id, resource)
            }
        };

        Leased { value: Some(resource), lease_id, pool: Arc::clone(self) }
    }

    /// Acquires a resource and invokes `f` with it, releasing it afterward
    /// regardless of whether `f`'s future completes normally.
    pub async fn use_with<F, Fut, R>(self: &Arc<Self>, f: F) -> R
    where
        F: FnOnce(&mut T) -> Fut,
        Fut: std::future::Future<Output = R>,
    {
        let mut leased = self.acquire().await;
        f(&mut leased).await
    }

    /// Explicitly releases a lease early. Equivalent to dropping it, spelled
    /// out for callers that want the release to happen before the guard
    /// would otherwise go out of scope.
    pub async fn release(self: &Arc<Self>, mut leased: Leased<T>) {
        let resource = leased.value.take().expect("lease value already released");
        self.complete_release(leased.lease_id, resource).await;
    }

    async fn complete_release(self: &Arc<Self>, lease_id: u64, resource: T) {
        let mut state = self.state.lock().await;

        if !state.checked_out.remove(&lease_id) {
            warn!(pool = self.name.as_ref(), lease_id, "release of an unrecognized lease");
            return;
        }

        let became_empty = if let Some(waiter) = state.waiters.pop_front() {
            match waiter.send((lease_id, resource)) {
                Ok(()) => {
                    state.checked_out.insert(lease_id);
                    false
                }
                Err((_, resource)) => {
                    // Waiter vanished; keep the resource for the next caller.
                    state.unused.push_back(resource);
                    state.checked_out.is_empty()
                }
            }
        } else {
            state.unused.push_back(resource);
            state.checked_out.is_empty()
        };

        drop(state);

        if became_empty {
            let _ = self.empty_tx.send(true);
        }
    }

    fn mark_in_use(&self) {
        let _ = self.empty_tx.send(false);
    }

    /// Waits for the in-use set to become empty, then destroys every unused
    /// resource via `destroyer`, returning its responses in destruction
    /// order. Concurrent acquires during a drain are a caller error this
    /// pool does not guard against.
    pub async fn drain_all<D, Fut, R>(self: &Arc<Self>, destroyer: D) -> Vec<R>
    where
        D: Fn(T) -> Fut,
        Fut: std::future::Future<Output = R>,
    {
        let mut empty_rx = self.empty_rx.clone();
        empty_rx
            .wait_for(|is_empty| *is_empty)
            .await
            .expect("pool's empty-signal sender dropped while draining");

        let drained: Vec<T> = {
            let mut state = self.state.lock().await;
            let drained: Vec<T> = state.unused.drain(..).collect();
            state.owned -= drained.len();
            drained
        };

        let mut responses = Vec::with_capacity(drained.len());
        for resource in drained {
            responses.push(destroyer(resource).await);
        }

        responses
    }
}

impl<T: Send + 'static> std::ops::Deref for Leased<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.value.as_ref().expect("lease value already released")
    }
}

impl<T: Send + 'static> std::ops::DerefMut for Leased<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_mut().expect("lease value already released")
    }
}

impl<T: Send + 'static> Drop for Leased<T> {
    fn drop(&mut self) {
        let Some(resource) = self.value.take() else {
            // Already explicitly released via `Pool::release`.
            return;
        };

        let pool = Arc::clone(&self.pool);
        let lease_id = self.lease_id;

        tokio::spawn(async move {
            pool.complete_release(lease_id, resource).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Mutex;

    fn counting_pool(max: usize) -> (Arc<Pool<u32>>, Arc<AtomicUsize>) {
        let created = Arc::new(AtomicUsize::new(0));
        let created_for_factory = Arc::clone(&created);

        let pool = Pool::new("test", max, move || {
            let created = Arc::clone(&created_for_factory);
            async move { created.fetch_add(1, Ordering::SeqCst) as u32 }
        })
        .into_shared();

        (pool, created)
    }

    #[tokio::test]
    async fn creates_lazily_up_to_max() {
        // Given
        let (pool, created) = counting_pool(2);

        // When
        let a = pool.acquire().await;
        let b = pool.acquire().await;

        // Then
        assert_eq!(created.load(Ordering::SeqCst), 2);
        drop(a);
        drop(b);
    }

    #[tokio::test]
    async fn reuses_released_resource() {
        // Given
        let (pool, created) = counting_pool(1);

        // When
        let a = pool.acquire().await;
        pool.release(a).await;
        let _b = pool.acquire().await;

        // Then: only one resource was ever created
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn waiters_served_fifo() {
        // Given: pool of 1, fully checked out
        let (pool, _created) = counting_pool(1);
        let order: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
        let first = pool.acquire().await;

        // When: two waiters queue up, in this order
        let pool_a = Arc::clone(&pool);
        let order_a = Arc::clone(&order);
        let waiter_a = tokio::spawn(async move {
            let leased = pool_a.acquire().await;
            order_a.lock().await.push(1);
            leased
        });
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let pool_b = Arc::clone(&pool);
        let order_b = Arc::clone(&order);
        let waiter_b = tokio::spawn(async move {
            let leased = pool_b.acquire().await;
            order_b.lock().await.push(2);
            leased
        });
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        // When: the held resource is released, it should go to waiter A first
        pool.release(first).await;
        let leased_a = waiter_a.await.unwrap();
        pool.release(leased_a).await;
        let leased_b = waiter_b.await.unwrap();
        pool.release(leased_b).await;

        // Then
        assert_eq!(*order.lock().await, vec![1, 2]);
    }

    #[tokio::test]
    async fn acquire_four_of_four_then_two_waiters_served_in_suspension_order() {
        // Given: pool of 4, all four checked out
        let (pool, _created) = counting_pool(4);
        let held: Vec<Leased<u32>> =
            futures::future::join_all((0..4).map(|_| pool.acquire())).await;
        let order: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));

        // When: two more acquires suspend, in this order
        let pool_a = Arc::clone(&pool);
        let order_a = Arc::clone(&order);
        let waiter_a = tokio::spawn(async move {
            let leased = pool_a.acquire().await;
            order_a.lock().await.push(1);
            leased
        });
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let pool_b = Arc::clone(&pool);
        let order_b = Arc::clone(&order);
        let waiter_b = tokio::spawn(async move {
            let leased = pool_b.acquire().await;
            order_b.lock().await.push(2);
            leased
        });
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        // When: the four held resources are released in arbitrary order
        for leased in held {
            pool.release(leased).await;
        }

        // Then: the two waiters receive the first two released resources, in
        // the order they suspended
        let leased_a = waiter_a.await.unwrap();
        let leased_b = waiter_b.await.unwrap();
        assert_eq!(*order.lock().await, vec![1, 2]);
        pool.release(leased_a).await;
        pool.release(leased_b).await;
    }

    #[tokio::test]
    async fn drain_all_waits_for_empty_then_destroys_unused() {
        // Given: two resources, one released back as unused, one still held
        let (pool, _created) = counting_pool(2);
        let a = pool.acquire().await;
        let b = pool.acquire().await;
        pool.release(b).await;

        let destroyed: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
        let destroyed_for_drain = Arc::clone(&destroyed);
        let pool_for_drain = Arc::clone(&pool);

        // When
        let drain = tokio::spawn(async move {
            pool_for_drain
                .drain_all(move |resource| {
                    let destroyed = Arc::clone(&destroyed_for_drain);
                    async move {
                        destroyed.lock().await.push(resource);
                        resource
                    }
                })
                .await
        });

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        // Then: drain is still waiting, since one resource remains checked out
        assert!(destroyed.lock().await.is_empty());

        pool.release(a).await;
        let responses = drain.await.unwrap();
        assert_eq!(responses.len(), 1);
    }
}

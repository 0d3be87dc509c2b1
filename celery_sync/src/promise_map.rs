use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex as AsyncMutex};

/// Holds at most one settleable future per key `K`, decoupling a single
/// producer (whoever eventually learns the value for `K`) from any number of
/// consumers (callers [awaiting](PromiseMap::get) that same key).
///
/// Unlike [`Conduit`](crate::Conduit), which pairs exactly one owner with any
/// number of requesters of the *same upcoming* value, a [`PromiseMap`] fans
/// out over many independent keys at once, and tolerates the producer
/// settling a key before anyone has asked for it.
///
/// ## State machine
///
/// Every entry starts `Pending` and transitions at most by one [`resolve`] or
/// [`reject`] call to either `Fulfilled` or `Rejected`. A settled entry may be
/// settled again (the spec for this map mandates *overwrite*, not rejection of
/// the second settle), in which case later observers see the newest value, but
/// the original future's callbacks are never invoked twice.
///
/// ## Time-to-live
///
/// If constructed [`with_ttl`](PromiseMap::with_ttl), every call that touches
/// an entry (settling it, deleting it, or creating it via a fresh `get`)
/// (re)schedules its removal after the TTL elapses.
///
/// [`resolve`]: PromiseMap::resolve
/// [`reject`]: PromiseMap::reject
pub struct PromiseMap<K, V> {
    entries: AsyncMutex<HashMap<K, Entry<V>>>,
    ttl: Option<Duration>,
}

/// A clonable outcome stored per key: either a value or a rejection reason,
/// wrapped so cloning is cheap regardless of `V`'s size.
#[derive(Clone)]
pub enum Outcome<V> {
    /// The entry settled successfully.
    Fulfilled(Arc<V>),
    /// The entry settled with a rejection reason.
    Rejected(Arc<str>),
}

impl<V> Outcome<V> {
    /// Reports whether this outcome is a [`Fulfilled`](Outcome::Fulfilled).
    pub fn is_fulfilled(&self) -> bool {
        matches!(self, Outcome::Fulfilled(_))
    }

    /// Reports whether this outcome is a [`Rejected`](Outcome::Rejected).
    pub fn is_rejected(&self) -> bool {
        matches!(self, Outcome::Rejected(_))
    }
}

/// The state tag of a [`PromiseMap`] entry, exposed for introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// No settlement has happened yet.
    Pending,
    /// Settled successfully.
    Fulfilled,
    /// Settled with a rejection.
    Rejected,
}

struct Entry<V> {
    state: State,
    /// The most recent settlement, if any. `None` while `Pending`.
    outcome: Option<Outcome<V>>,
    /// Broadcast used to wake up everyone awaiting this entry's settlement.
    /// Entries that are already settled don't need this populated, but it is
    /// kept so a subsequent overwrite can still notify anyone still holding a
    /// receiver from before the first settlement.
    settle: broadcast::Sender<Outcome<V>>,
    /// Monotonically increasing generation, bumped on every settle so that a
    /// scheduled TTL-deletion task can recognize it has gone stale.
    generation: u64,
}

impl<V> Entry<V> {
    fn pending() -> Self {
        let (settle, _) = broadcast::channel(1);

        Self {
            state: State::Pending,
            outcome: None,
            settle,
            generation: 0,
        }
    }
}

impl<K, V> PromiseMap<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Creates an empty [`PromiseMap`] with no entry expiry.
    pub fn new() -> Self {
        Self {
            entries: AsyncMutex::new(HashMap::new()),
            ttl: None,
        }
    }

    /// Creates an empty [`PromiseMap`] whose entries are automatically
    /// removed `ttl` after they were last touched.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: AsyncMutex::new(HashMap::new()),
            ttl: Some(ttl),
        }
    }

    /// Returns a future resolving to the value for `key`. If the entry is
    /// already settled, the returned future resolves immediately. Otherwise a
    /// `Pending` entry is installed (if one is not already present) and the
    /// future resolves once a later [`resolve`](Self::resolve) or
    /// [`reject`](Self::reject) call settles it.
    pub async fn get(self: &Arc<Self>, key: K) -> Result<V, Arc<str>>
    where
        V: Clone,
    {
        let mut receiver = {
            let mut entries = self.entries.lock().await;

            let freshly_created = !entries.contains_key(&key);
            let entry = entries.entry(key.clone()).or_insert_with(Entry::pending);

            if let Some(outcome) = &entry.outcome {
                let outcome = outcome.clone();
                drop(entries);
                self.reschedule_expiry(key);
                return Self::outcome_into_result(outcome);
            }

            let receiver = entry.settle.subscribe();
            drop(entries);

            if freshly_created {
                self.reschedule_expiry(key.clone());
            }

            receiver
        };

        // Entry was Pending when we let go of the lock: wait for a broadcast.
        // A recv error (lagged or closed) means we raced a settle that
        // happened between checking `outcome` and subscribing; re-check.
        match receiver.recv().await {
            Ok(outcome) => Self::outcome_into_result(outcome),
            Err(_) => {
                let entries = self.entries.lock().await;
                match entries.get(&key).and_then(|entry| entry.outcome.clone()) {
                    Some(outcome) => Self::outcome_into_result(outcome),
                    None => Err(Arc::from("deleted")),
                }
            }
        }
    }

    fn outcome_into_result(outcome: Outcome<V>) -> Result<V, Arc<str>>
    where
        V: Clone,
    {
        match outcome {
            Outcome::Fulfilled(value) => Ok((*value).clone()),
            Outcome::Rejected(reason) => Err(reason),
        }
    }

    /// Settles `key` with a successful `value`. Returns `true` if this call
    /// *installed* a fresh, already-fulfilled entry (i.e., `key` was absent),
    /// `false` if it settled or overwrote an existing entry.
    pub async fn resolve(self: &Arc<Self>, key: K, value: V) -> bool {
        let installed = self.settle(key.clone(), Outcome::Fulfilled(Arc::new(value))).await;
        self.reschedule_expiry(key);
        installed
    }

    /// Settles `key` with a rejection `reason`. Symmetric to
    /// [`resolve`](Self::resolve).
    pub async fn reject(self: &Arc<Self>, key: K, reason: impl Into<Arc<str>>) -> bool {
        let installed = self.settle(key.clone(), Outcome::Rejected(reason.into())).await;
        self.reschedule_expiry(key);
        installed
    }

    async fn settle(&self, key: K, outcome: Outcome<V>) -> bool {
        let mut entries = self.entries.lock().await;

        match entries.get_mut(&key) {
            Some(entry) => {
                // The key was already present (pending or previously settled),
                // so this call settled/overwrote it rather than installing it.
                entry.state = match &outcome {
                    Outcome::Fulfilled(_) => State::Fulfilled,
                    Outcome::Rejected(_) => State::Rejected,
                };
                entry.generation += 1;
                // Notify current subscribers; errors mean nobody is listening,
                // which is fine for a settle that nobody awaited yet.
                let _ = entry.settle.send(outcome.clone());
                entry.outcome = Some(outcome);
                false
            }
            None => {
                let mut entry = Entry::pending();
                entry.state = match &outcome {
                    Outcome::Fulfilled(_) => State::Fulfilled,
                    Outcome::Rejected(_) => State::Rejected,
                };
                entry.outcome = Some(outcome);
                entries.insert(key, entry);
                true
            }
        }
    }

    /// Rejects every still-`Pending` entry with `reason`, returning how many
    /// were rejected. Entries that are already settled are left untouched.
    pub async fn reject_all(&self, reason: impl Into<Arc<str>>) -> usize {
        let reason = reason.into();
        let mut entries = self.entries.lock().await;
        let mut count = 0;

        for entry in entries.values_mut() {
            if entry.state == State::Pending {
                entry.state = State::Rejected;
                entry.generation += 1;
                let outcome = Outcome::Rejected(reason.clone());
                let _ = entry.settle.send(outcome.clone());
                entry.outcome = Some(outcome);
                count += 1;
            }
        }

        count
    }

    /// Reports whether `key` currently has an entry (in any state).
    pub async fn has(&self, key: &K) -> bool {
        self.entries.lock().await.contains_key(key)
    }

    /// Reports whether `key`'s entry exists and is `Pending`.
    pub async fn is_pending(&self, key: &K) -> bool {
        matches!(
            self.entries.lock().await.get(key).map(|e| e.state),
            Some(State::Pending)
        )
    }

    /// Reports whether `key`'s entry exists and is `Fulfilled`.
    pub async fn is_fulfilled(&self, key: &K) -> bool {
        matches!(
            self.entries.lock().await.get(key).map(|e| e.state),
            Some(State::Fulfilled)
        )
    }

    /// Reports whether `key`'s entry exists and is `Rejected`.
    pub async fn is_rejected(&self, key: &K) -> bool {
        matches!(
            self.entries.lock().await.get(key).map(|e| e.state),
            Some(State::Rejected)
        )
    }

    /// Removes `key`'s entry, rejecting any `Pending` future awaiting it with
    /// a `"deleted"` reason. Returns whether the key was present.
    pub async fn delete(&self, key: &K) -> bool {
        let mut entries = self.entries.lock().await;

        match entries.remove(key) {
            Some(entry) => {
                if entry.state == State::Pending {
                    let _ = entry.settle.send(Outcome::Rejected(Arc::from("deleted")));
                }
                true
            }
            None => false,
        }
    }

    /// Rejects every `Pending` entry with a `"cleared"` reason and removes all
    /// entries, returning the number removed.
    pub async fn clear(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let count = entries.len();

        for entry in entries.values() {
            if entry.state == State::Pending {
                let _ = entry.settle.send(Outcome::Rejected(Arc::from("cleared")));
            }
        }

        entries.clear();
        count
    }

    /// Schedules (or reschedules) the TTL-based removal of `key`, if this map
    /// was constructed [`with_ttl`](Self::with_ttl). Only removes the entry if
    /// it wasn't touched again (settled) after this call scheduled it.
    fn reschedule_expiry(self: &Arc<Self>, key: K) {
        let Some(ttl) = self.ttl else {
            return;
        };

        let map = Arc::clone(self);

        tokio::spawn(async move {
            let generation_at_schedule = {
                let entries = map.entries.lock().await;
                entries.get(&key).map(|entry| entry.generation)
            };

            tokio::time::sleep(ttl).await;

            let mut entries = map.entries.lock().await;
            if let Some(entry) = entries.get(&key) {
                if Some(entry.generation) == generation_at_schedule {
                    entries.remove(&key);
                }
            }
        });
    }
}

impl<K, V> Default for PromiseMap<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// A boxed, owned future, used where a settled value must be allowed to
/// itself be "following" another in-flight future (see [`PromiseMap::resolve`]
/// semantics in the wider spec this crate's consumers implement).
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    #[tokio::test]
    async fn get_after_resolve() {
        // Given
        let map: Arc<PromiseMap<String, String>> = Arc::new(PromiseMap::new());

        // When
        map.resolve("k1".to_string(), "v1".to_string()).await;
        let result = map.get("k1".to_string()).await;

        // Then
        assert_eq!(result.unwrap(), "v1");
    }

    #[tokio::test]
    async fn resolve_after_get() {
        // Given
        let map: Arc<PromiseMap<String, String>> = Arc::new(PromiseMap::new());
        let map_for_getter = Arc::clone(&map);

        // When
        let getter = tokio::spawn(async move { map_for_getter.get("k2".to_string()).await });
        tokio::task::yield_now().await;
        map.resolve("k2".to_string(), "v2".to_string()).await;

        // Then
        assert_eq!(getter.await.unwrap().unwrap(), "v2");
    }

    #[tokio::test]
    async fn overwrite_settled_entry() {
        // Given
        let map: Arc<PromiseMap<String, String>> = Arc::new(PromiseMap::new());
        map.resolve("k3".to_string(), "first".to_string()).await;

        // When
        map.resolve("k3".to_string(), "second".to_string()).await;
        let result = map.get("k3".to_string()).await;

        // Then
        assert_eq!(result.unwrap(), "second");
    }

    #[tokio::test]
    async fn reject_all_skips_settled() {
        // Given
        let map: Arc<PromiseMap<String, String>> = Arc::new(PromiseMap::new());
        map.resolve("settled".to_string(), "v".to_string()).await;
        let map_for_getter = Arc::clone(&map);
        let pending_getter =
            tokio::spawn(async move { map_for_getter.get("pending".to_string()).await });
        tokio::task::yield_now().await;

        // When
        let count = map.reject_all("disconnecting").await;

        // Then
        assert_eq!(count, 1);
        assert!(pending_getter.await.unwrap().is_err());
        assert!(map.get("settled".to_string()).await.is_ok());
    }

    #[tokio::test]
    async fn delete_rejects_pending() {
        // Given
        let map: Arc<PromiseMap<String, String>> = Arc::new(PromiseMap::new());
        let map_for_getter = Arc::clone(&map);
        let getter = tokio::spawn(async move { map_for_getter.get("k4".to_string()).await });
        tokio::task::yield_now().await;

        // When
        let existed = map.delete(&"k4".to_string()).await;

        // Then
        assert!(existed);
        assert_eq!(getter.await.unwrap().unwrap_err().as_ref(), "deleted");
    }

    #[tokio::test]
    async fn ttl_expires_entry() {
        // Given
        let map: Arc<PromiseMap<String, String>> =
            Arc::new(PromiseMap::with_ttl(Duration::from_millis(10)));
        map.resolve("k5".to_string(), "v5".to_string()).await;

        // When
        tokio::time::sleep(Duration::from_millis(30)).await;

        // Then
        assert!(!map.has(&"k5".to_string()).await);
    }
}

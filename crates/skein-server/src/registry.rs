//! Connection registry: the server's id → connection map.
//!
//! The accept path inserts, any disconnect path removes, and broadcast or
//! heartbeat paths read snapshots. One coarse lock guards the map; it is
//! never held across an await. Whoever removes an entry owns its cleanup,
//! which is what makes removal happen exactly once.

use std::{
    collections::HashMap,
    fmt, io,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

/// Server-assigned identity of a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u32);

impl ConnectionId {
    /// Raw id value.
    pub fn get(self) -> u32 {
        self.0
    }
}

impl From<u32> for ConnectionId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug)]
struct Inner<T> {
    entries: HashMap<ConnectionId, Arc<T>>,
    next: u32,
}

impl<T> Inner<T> {
    /// Counter starts at 1, wraps past `u32::MAX` back to 1 and skips ids
    /// still present.
    fn next_free_id(&mut self) -> ConnectionId {
        loop {
            let id = ConnectionId(self.next);
            self.next = self.next.checked_add(1).unwrap_or(1);
            if !self.entries.contains_key(&id) {
                return id;
            }
        }
    }
}

/// Map from connection id to connection.
#[derive(Debug)]
pub struct Registry<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> Registry<T> {
    /// Empty registry whose first id is 1.
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    fn starting_at(next: u32) -> Self {
        Self { inner: Mutex::new(Inner { entries: HashMap::new(), next: next.max(1) }) }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate the next free id and insert what `create` builds for it.
    ///
    /// Allocation and insertion are one step under the lock. A failed
    /// `create` inserts nothing; its id is burned, not reused.
    pub fn register<F>(&self, create: F) -> io::Result<(ConnectionId, Arc<T>)>
    where
        F: FnOnce(ConnectionId) -> io::Result<Arc<T>>,
    {
        let mut inner = self.lock();
        let id = inner.next_free_id();
        let entry = create(id)?;
        inner.entries.insert(id, Arc::clone(&entry));
        Ok((id, entry))
    }

    /// Look up a live entry.
    pub fn get(&self, id: ConnectionId) -> Option<Arc<T>> {
        self.lock().entries.get(&id).cloned()
    }

    /// Remove an entry. Only the first caller for an id gets it back.
    pub fn remove(&self, id: ConnectionId) -> Option<Arc<T>> {
        self.lock().entries.remove(&id)
    }

    /// Whether `id` is registered.
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.lock().entries.contains_key(&id)
    }

    /// Registered ids in ascending order, copied out of the lock.
    pub fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.lock().entries.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Registered entries, copied out of the lock.
    pub fn snapshot(&self) -> Vec<(ConnectionId, Arc<T>)> {
        let mut entries: Vec<_> =
            self.lock().entries.iter().map(|(id, entry)| (*id, Arc::clone(entry))).collect();
        entries.sort_unstable_by_key(|(id, _)| *id);
        entries
    }

    /// Number of registered entries.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use proptest::prelude::*;

    use super::*;

    fn add(registry: &Registry<&'static str>, name: &'static str) -> ConnectionId {
        registry.register(|_| Ok(Arc::new(name))).unwrap().0
    }

    #[test]
    fn ids_start_at_one_and_increase() {
        let registry = Registry::new();
        assert_eq!(add(&registry, "a"), ConnectionId(1));
        assert_eq!(add(&registry, "b"), ConnectionId(2));
        assert_eq!(add(&registry, "c"), ConnectionId(3));
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn removed_ids_are_not_reused() {
        let registry = Registry::new();
        let first = add(&registry, "a");
        registry.remove(first);
        assert_ne!(add(&registry, "b"), first);
    }

    #[test]
    fn removal_happens_once() {
        let registry = Registry::new();
        let id = add(&registry, "a");
        assert_eq!(registry.remove(id).as_deref(), Some(&"a"));
        assert!(registry.remove(id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn counter_wraps_to_one() {
        let registry = Registry::starting_at(u32::MAX);
        assert_eq!(add(&registry, "max"), ConnectionId(u32::MAX));
        assert_eq!(add(&registry, "one"), ConnectionId(1));
    }

    #[test]
    fn wrapped_counter_skips_live_ids() {
        let registry = Registry::new();
        add(&registry, "first");
        add(&registry, "second");
        registry.lock().next = 1;
        assert_eq!(add(&registry, "third"), ConnectionId(3));
    }

    #[test]
    fn failed_creation_inserts_nothing() {
        let registry: Registry<&str> = Registry::new();
        let result = registry.register(|_| Err(io::ErrorKind::Other.into()));
        assert!(result.is_err());
        assert!(registry.is_empty());
        assert_eq!(add(&registry, "next"), ConnectionId(2));
    }

    #[test]
    fn snapshots_are_sorted_copies() {
        let registry = Registry::new();
        for name in ["a", "b", "c"] {
            add(&registry, name);
        }
        let ids = registry.ids();
        registry.remove(ids[1]);

        assert_eq!(ids, [ConnectionId(1), ConnectionId(2), ConnectionId(3)]);
        let names: Vec<_> = registry.snapshot().into_iter().map(|(_, name)| *name).collect();
        assert_eq!(names, ["a", "c"]);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Register,
        Remove(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![3 => Just(Op::Register), 1 => any::<usize>().prop_map(Op::Remove)]
    }

    proptest! {
        #[test]
        fn ids_are_unique_for_the_whole_run(ops in prop::collection::vec(op(), 1..200)) {
            let registry = Registry::new();
            let mut issued = HashSet::new();
            let mut live = Vec::new();

            for op in ops {
                match op {
                    Op::Register => {
                        let id = add(&registry, "x");
                        prop_assert!(issued.insert(id), "id {id} issued twice");
                        live.push(id);
                    },
                    Op::Remove(index) if !live.is_empty() => {
                        let id = live.swap_remove(index % live.len());
                        prop_assert!(registry.remove(id).is_some());
                    },
                    Op::Remove(_) => {},
                }
            }

            live.sort_unstable();
            prop_assert_eq!(registry.ids(), live);
        }
    }
}

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex},
};

use crate::poison::lock;

/// Remote id → local handle for one entity kind.
///
/// Each id maps to exactly one `Arc` for the lifetime of the cache: when
/// two callers race to create the same entry, the first insert wins and the
/// loser receives the winner's handle.
pub struct IdentityCache<M> {
    kind: &'static str,
    entries: Mutex<HashMap<u32, Arc<M>>>,
}

impl<M> IdentityCache<M> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn get(&self, id: u32) -> Option<Arc<M>> {
        lock(&self.entries, self.kind).get(&id).cloned()
    }

    /// Return the cached handle, creating it under the lock if absent.
    pub fn get_or_insert_with(&self, id: u32, create: impl FnOnce() -> M) -> Arc<M> {
        lock(&self.entries, self.kind)
            .entry(id)
            .or_insert_with(|| Arc::new(create()))
            .clone()
    }

    /// Insert `value` unless an entry exists; returns whichever handle is
    /// cached afterwards.
    ///
    /// Used when building the handle needs remote round trips that cannot
    /// run under the lock.
    pub fn insert_if_absent(&self, id: u32, value: M) -> Arc<M> {
        let mut entries = lock(&self.entries, self.kind);
        match entries.get(&id) {
            Some(existing) => existing.clone(),
            None => {
                let value = Arc::new(value);
                entries.insert(id, value.clone());
                value
            }
        }
    }

    pub fn remove(&self, id: u32) -> Option<Arc<M>> {
        lock(&self.entries, self.kind).remove(&id)
    }

    pub fn len(&self) -> usize {
        lock(&self.entries, self.kind).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        lock(&self.entries, self.kind).clear();
    }
}

impl<M> fmt::Debug for IdentityCache<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityCache")
            .field("kind", &self.kind)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;

    #[test]
    fn concurrent_first_lookups_share_one_handle() {
        let cache = Arc::new(IdentityCache::<u32>::new("object"));
        let created = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let created = created.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    cache.get_or_insert_with(5, || {
                        created.fetch_add(1, Ordering::SeqCst);
                        5
                    })
                })
            })
            .collect();
        let results: Vec<Arc<u32>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| Arc::ptr_eq(r, &results[0])));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn insert_if_absent_keeps_the_first_value() {
        let cache = IdentityCache::new("type");
        let first = cache.insert_if_absent(1, "first");
        let second = cache.insert_if_absent(1, "second");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(*second, "first");
        assert!(cache.get(2).is_none());
    }
}

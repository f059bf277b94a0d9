use std::{
    collections::{HashMap, hash_map::Entry},
    sync::Arc,
};

use ota_core::Address;
use tokio::sync::{Mutex, RwLock};

/// Live sessions by peer address.
///
/// Each session sits behind its own mutex, so sessions of different peers are
/// handled concurrently while a single session only ever has one writer.
/// Whoever removes a session holds that session's lock while doing so; the map
/// lock is never held while waiting for a session lock.
#[derive(Debug)]
pub struct SessionRegistry<S> {
    sessions: RwLock<HashMap<Address, Arc<Mutex<S>>>>,
}

impl<S> Default for SessionRegistry<S> {
    fn default() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }
}

impl<S> SessionRegistry<S> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the session for `address`, creating it with `create` if there
    /// is none. The flag tells whether this call created it.
    pub async fn get_or_create(
        &self,
        address: Address,
        create: impl FnOnce() -> S,
    ) -> (Arc<Mutex<S>>, bool) {
        if let Some(session) = self.sessions.read().await.get(&address) {
            return (session.clone(), false);
        }
        match self.sessions.write().await.entry(address) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => (entry.insert(Arc::new(Mutex::new(create()))).clone(), true),
        }
    }

    pub async fn get(&self, address: Address) -> Option<Arc<Mutex<S>>> {
        self.sessions.read().await.get(&address).cloned()
    }

    pub async fn remove(&self, address: Address) -> Option<Arc<Mutex<S>>> {
        self.sessions.write().await.remove(&address)
    }

    /// Removes `address` only if it still maps to `session`, a replacement
    /// created in the meantime is left alone.
    pub async fn remove_if_same(&self, address: Address, session: &Arc<Mutex<S>>) -> bool {
        let mut sessions = self.sessions.write().await;
        if sessions
            .get(&address)
            .is_some_and(|current| Arc::ptr_eq(current, session))
        {
            sessions.remove(&address);
            true
        } else {
            false
        }
    }

    /// Point-in-time copy of the registry, ordered by address.
    pub async fn snapshot(&self) -> Vec<(Address, Arc<Mutex<S>>)> {
        let mut sessions: Vec<_> = self
            .sessions
            .read()
            .await
            .iter()
            .map(|(address, session)| (*address, session.clone()))
            .collect();
        sessions.sort_by_key(|(address, _)| *address);
        sessions
    }

    /// Runs `f` on every session of a snapshot, one session lock at a time.
    pub async fn for_each(&self, mut f: impl FnMut(Address, &mut S)) {
        for (address, session) in self.snapshot().await {
            f(address, &mut *session.lock().await);
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u16) -> Address {
        Address::new(n).unwrap()
    }

    #[tokio::test]
    async fn creation_is_idempotent() {
        let registry = SessionRegistry::new();
        let (first, created) = registry.get_or_create(addr(5), || 1).await;
        assert!(created);
        let (second, created) = registry.get_or_create(addr(5), || 2).await;
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(*second.lock().await, 1);
    }

    #[tokio::test]
    async fn concurrent_creators_share_one_session() {
        let registry = Arc::new(SessionRegistry::new());
        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.get_or_create(addr(7), || i).await.0 })
            })
            .collect();
        let mut sessions = Vec::new();
        for task in tasks {
            sessions.push(task.await.unwrap());
        }
        assert!(sessions.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn stale_removal_keeps_replacement() {
        let registry = SessionRegistry::new();
        let (old, _) = registry.get_or_create(addr(5), || "old").await;
        registry.remove(addr(5)).await;
        let (new, _) = registry.get_or_create(addr(5), || "new").await;

        assert!(!registry.remove_if_same(addr(5), &old).await);
        assert!(registry.get(addr(5)).await.is_some());
        assert!(registry.remove_if_same(addr(5), &new).await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn for_each_visits_in_address_order() {
        let registry = SessionRegistry::new();
        for n in [9, 3, 6] {
            registry.get_or_create(addr(n), || 0).await;
        }
        let mut seen = Vec::new();
        registry
            .for_each(|address, value| {
                *value += 1;
                seen.push(address.get());
            })
            .await;
        assert_eq!(seen, [3, 6, 9]);
        assert_eq!(*registry.get(addr(6)).await.unwrap().lock().await, 1);
    }
}

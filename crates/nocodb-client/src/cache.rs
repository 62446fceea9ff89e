//! Two-tier name→id cache.
//!
//! - **Session tier**: an unbounded map per session key. Entries live until
//!   the session's cache is cleared or their scope is invalidated.
//! - **Fallback tier**: a bounded LRU shared by all sessions, keyed by
//!   `(session, scope, name)`. A fallback hit is promoted into the session
//!   tier.
//!
//! # Staleness
//!
//! Neither tier expires entries. After names are created, renamed or
//! deleted, call [`HybridCache::invalidate_scope`] (the client does this for
//! every mutation it performs). Changes made by other NocoDB users are only
//! picked up after [`HybridCache::clear`].
//!
//! Every invalidation bumps a generation counter. A lookup that lists the
//! server takes a [`CacheGeneration`] first and stores its answer with
//! [`HybridCache::put_if_current`], which refuses the write when an
//! invalidation happened in between.

use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use tokio::sync::Mutex;

/// `(scope, name)` within one session.
type ScopedName = (String, String);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FallbackKey {
    session: String,
    scope: String,
    name: String,
}

impl FallbackKey {
    fn new(session: &str, scope: &str, name: &str) -> Self {
        Self {
            session: session.to_string(),
            scope: scope.to_string(),
            name: name.to_string(),
        }
    }
}

/// Tier that answered a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    Session,
    Fallback,
}

/// Snapshot of the invalidation counters that cover one scope.
///
/// Obtained from [`HybridCache::generation`]; only meaningful for the scope
/// it was taken for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheGeneration {
    epoch: u64,
    scope: u64,
}

/// Session-tier maps plus the invalidation counters, under one lock.
#[derive(Default)]
struct SessionTier {
    entries: HashMap<String, HashMap<ScopedName, String>>,
    /// Bumped by `invalidate_id` and `clear`, whose scope is unknown
    epoch: u64,
    scope_generations: HashMap<String, u64>,
}

impl SessionTier {
    fn generation(&self, scope: &str) -> CacheGeneration {
        CacheGeneration {
            epoch: self.epoch,
            scope: self.scope_generations.get(scope).copied().unwrap_or(0),
        }
    }

    fn insert(&mut self, session: &str, scope: &str, name: &str, id: &str) {
        self.entries
            .entry(session.to_string())
            .or_default()
            .insert((scope.to_string(), name.to_string()), id.to_string());
    }
}

/// Session tier plus bounded fallback tier.
///
/// Each tier sits behind its own mutex; no lock is held across an await
/// point outside this type. When both are needed the session tier is
/// locked first.
pub struct HybridCache {
    session_tier: Mutex<SessionTier>,
    fallback_tier: Mutex<LruCache<FallbackKey, String>>,
}

impl HybridCache {
    /// Create a cache whose fallback tier holds at most `capacity` entries
    /// (a zero capacity is raised to 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            session_tier: Mutex::new(SessionTier::default()),
            fallback_tier: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Look up `name` under `scope` for `session`.
    ///
    /// The session tier is checked first. A fallback hit is copied into the
    /// session tier before returning, unless the scope was invalidated
    /// while the fallback was read.
    pub async fn get(
        &self,
        session: &str,
        scope: &str,
        name: &str,
    ) -> Option<(String, CacheTier)> {
        let key = (scope.to_string(), name.to_string());

        let generation = {
            let tier = self.session_tier.lock().await;
            if let Some(id) = tier.entries.get(session).and_then(|entries| entries.get(&key)) {
                tracing::debug!(
                    session = %session,
                    scope = %scope,
                    name = %name,
                    "Session cache hit"
                );
                return Some((id.clone(), CacheTier::Session));
            }
            tier.generation(scope)
        };

        let id = {
            let mut fallback = self.fallback_tier.lock().await;
            fallback.get(&FallbackKey::new(session, scope, name)).cloned()
        }?;

        let mut tier = self.session_tier.lock().await;
        if tier.generation(scope) != generation {
            tracing::debug!(
                session = %session,
                scope = %scope,
                name = %name,
                "Scope invalidated during lookup"
            );
            return None;
        }
        tier.insert(session, scope, name, &id);
        tracing::debug!(
            session = %session,
            scope = %scope,
            name = %name,
            "Fallback cache hit, promoted"
        );
        Some((id, CacheTier::Fallback))
    }

    /// Current invalidation generation for `scope`.
    pub async fn generation(&self, scope: &str) -> CacheGeneration {
        self.session_tier.lock().await.generation(scope)
    }

    /// Store `id` in both tiers.
    pub async fn put(&self, session: &str, scope: &str, name: &str, id: &str) {
        let mut tier = self.session_tier.lock().await;
        tier.insert(session, scope, name, id);
        self.put_fallback(session, scope, name, id).await;
        tracing::debug!(session = %session, scope = %scope, name = %name, id = %id, "Cached id");
    }

    /// Store `id` in both tiers if `scope` has not been invalidated since
    /// `generation` was taken. Returns whether the entry was written.
    pub async fn put_if_current(
        &self,
        session: &str,
        scope: &str,
        name: &str,
        id: &str,
        generation: CacheGeneration,
    ) -> bool {
        let mut tier = self.session_tier.lock().await;
        if tier.generation(scope) != generation {
            tracing::debug!(
                session = %session,
                scope = %scope,
                name = %name,
                id = %id,
                "Scope invalidated while listing, not caching"
            );
            return false;
        }
        tier.insert(session, scope, name, id);
        self.put_fallback(session, scope, name, id).await;
        tracing::debug!(session = %session, scope = %scope, name = %name, id = %id, "Cached id");
        true
    }

    async fn put_fallback(&self, session: &str, scope: &str, name: &str, id: &str) {
        self.fallback_tier
            .lock()
            .await
            .put(FallbackKey::new(session, scope, name), id.to_string());
    }

    /// Drop every entry under `scope`, in both tiers and for all sessions.
    ///
    /// Returns the number of entries removed.
    pub async fn invalidate_scope(&self, scope: &str) -> usize {
        let mut removed = 0;

        let mut tier = self.session_tier.lock().await;
        *tier.scope_generations.entry(scope.to_string()).or_insert(0) += 1;
        for entries in tier.entries.values_mut() {
            let before = entries.len();
            entries.retain(|(entry_scope, _), _| entry_scope != scope);
            removed += before - entries.len();
        }

        {
            let mut fallback = self.fallback_tier.lock().await;
            let stale: Vec<FallbackKey> = fallback
                .iter()
                .filter(|(key, _)| key.scope == scope)
                .map(|(key, _)| key.clone())
                .collect();
            for key in &stale {
                fallback.pop(key);
            }
            removed += stale.len();
        }

        if removed > 0 {
            tracing::debug!(scope = %scope, removed, "Invalidated cache scope");
        }
        removed
    }

    /// Drop every name that maps to `id`, in both tiers and for all sessions.
    ///
    /// Used when an entity is renamed or deleted and its scope is unknown.
    pub async fn invalidate_id(&self, id: &str) -> usize {
        let mut removed = 0;

        let mut tier = self.session_tier.lock().await;
        tier.epoch += 1;
        for entries in tier.entries.values_mut() {
            let before = entries.len();
            entries.retain(|_, cached| cached != id);
            removed += before - entries.len();
        }

        {
            let mut fallback = self.fallback_tier.lock().await;
            let stale: Vec<FallbackKey> = fallback
                .iter()
                .filter(|(_, cached)| cached.as_str() == id)
                .map(|(key, _)| key.clone())
                .collect();
            for key in &stale {
                fallback.pop(key);
            }
            removed += stale.len();
        }

        if removed > 0 {
            tracing::debug!(id = %id, removed, "Invalidated cached id");
        }
        removed
    }

    /// Clear both tiers for one session, or everything when `session` is
    /// `None`.
    pub async fn clear(&self, session: Option<&str>) {
        let mut tier = self.session_tier.lock().await;
        tier.epoch += 1;

        match session {
            Some(session) => {
                tier.entries.remove(session);

                let mut fallback = self.fallback_tier.lock().await;
                let owned: Vec<FallbackKey> = fallback
                    .iter()
                    .filter(|(key, _)| key.session == session)
                    .map(|(key, _)| key.clone())
                    .collect();
                for key in &owned {
                    fallback.pop(key);
                }
                tracing::debug!(session = %session, "Session cache cleared");
            }
            None => {
                tier.entries.clear();
                self.fallback_tier.lock().await.clear();
                tracing::debug!("All caches cleared");
            }
        }
    }

    /// Returns cache statistics.
    pub async fn stats(&self) -> CacheStats {
        let (sessions, session_entries) = {
            let tier = self.session_tier.lock().await;
            (tier.entries.len(), tier.entries.values().map(HashMap::len).sum())
        };
        let fallback = self.fallback_tier.lock().await;

        CacheStats {
            sessions,
            session_entries,
            fallback_entries: fallback.len(),
            fallback_capacity: fallback.cap().get(),
        }
    }
}

/// Cache statistics for monitoring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    /// Sessions with a session-tier map
    pub sessions: usize,
    /// Entries across all session-tier maps
    pub session_entries: usize,
    /// Entries in the fallback tier
    pub fallback_entries: usize,
    /// Fallback tier capacity
    pub fallback_capacity: usize,
}

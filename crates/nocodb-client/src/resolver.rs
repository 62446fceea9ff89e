//! Name→id resolution over the hybrid cache.
//!
//! Bases, tables and columns resolve through the same algorithm; only the
//! listing call differs. A lookup checks the session tier, then the fallback
//! tier, and only then lists the scope from the server.

use crate::cache::{CacheStats, HybridCache};
use crate::error::{ClientError, Result};
use crate::types::NamedEntity;
use std::fmt;
use std::future::Future;
use std::str::FromStr;

/// Rule for picking one id when several entities share a name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Disambiguation {
    /// The first match in server order
    #[default]
    First,
    /// Latest `created_at`
    Newest,
    /// Earliest `created_at`
    Oldest,
    /// Refuse to pick and report all candidate ids
    Error,
}

impl Disambiguation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disambiguation::First => "first",
            Disambiguation::Newest => "newest",
            Disambiguation::Oldest => "oldest",
            Disambiguation::Error => "error",
        }
    }
}

impl fmt::Display for Disambiguation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Disambiguation {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "first" => Ok(Disambiguation::First),
            "newest" => Ok(Disambiguation::Newest),
            "oldest" => Ok(Disambiguation::Oldest),
            "error" => Ok(Disambiguation::Error),
            other => Err(ClientError::InvalidArgument(format!(
                "unknown disambiguation strategy '{}' (expected first, newest, oldest or error)",
                other
            ))),
        }
    }
}

/// What a resolver looks up, for logs and error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Base,
    Table,
    Column,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Base => "base",
            EntityKind::Table => "table",
            EntityKind::Column => "column",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolves names of one [`EntityKind`] to ids, caching the answers.
pub struct NameResolver {
    kind: EntityKind,
    cache: HybridCache,
}

impl NameResolver {
    /// Create a resolver whose fallback tier holds `capacity` entries.
    pub fn new(kind: EntityKind, capacity: usize) -> Self {
        Self {
            kind,
            cache: HybridCache::new(capacity),
        }
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    /// Resolve `name` within `scope` for `session`.
    ///
    /// `on_miss` lists the scope and is only called when neither cache tier
    /// knows the name. Returns `Ok(None)` when no entity has that title;
    /// listing failures are returned as errors. The answer is not cached if
    /// the scope was invalidated while `on_miss` ran.
    pub async fn resolve<F, Fut>(
        &self,
        scope: &str,
        name: &str,
        session: &str,
        on_miss: F,
        policy: Disambiguation,
    ) -> Result<Option<String>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<NamedEntity>>>,
    {
        if let Some((id, tier)) = self.cache.get(session, scope, name).await {
            tracing::debug!(
                kind = %self.kind,
                scope = %scope,
                name = %name,
                tier = ?tier,
                "Resolved from cache"
            );
            return Ok(Some(id));
        }

        let generation = self.cache.generation(scope).await;
        let candidates = on_miss().await?;
        let matches: Vec<&NamedEntity> = candidates.iter().filter(|e| e.title == name).collect();

        let chosen = match matches.as_slice() {
            [] => {
                tracing::warn!(kind = %self.kind, scope = %scope, name = %name, "Name not found");
                return Ok(None);
            }
            [only] => *only,
            _ => self.disambiguate(scope, name, &matches, policy)?,
        };

        // A create or delete may have landed while the scope was listed
        if !self
            .cache
            .put_if_current(session, scope, name, &chosen.id, generation)
            .await
        {
            tracing::debug!(
                kind = %self.kind,
                scope = %scope,
                name = %name,
                id = %chosen.id,
                "Resolved from server, scope changed meanwhile"
            );
            return Ok(Some(chosen.id.clone()));
        }
        tracing::debug!(
            kind = %self.kind,
            scope = %scope,
            name = %name,
            id = %chosen.id,
            "Resolved from server"
        );
        Ok(Some(chosen.id.clone()))
    }

    fn disambiguate<'a>(
        &self,
        scope: &str,
        name: &str,
        matches: &[&'a NamedEntity],
        policy: Disambiguation,
    ) -> Result<&'a NamedEntity> {
        let ids: Vec<&str> = matches.iter().map(|e| e.id.as_str()).collect();

        if policy == Disambiguation::Error {
            tracing::warn!(
                kind = %self.kind,
                scope = %scope,
                name = %name,
                ids = ?ids,
                strategy = %policy,
                "Ambiguous name, refusing to pick"
            );
            return Err(ClientError::validation(
                format!(
                    "{} {}s share the name '{}': {}",
                    matches.len(),
                    self.kind,
                    name,
                    ids.join(", ")
                ),
                Some(serde_json::json!({
                    "kind": self.kind.as_str(),
                    "scope": scope,
                    "name": name,
                    "ids": ids,
                })),
            ));
        }

        let chosen = select(matches, policy);
        tracing::warn!(
            kind = %self.kind,
            scope = %scope,
            name = %name,
            ids = ?ids,
            strategy = %policy,
            chosen = %chosen.id,
            "Ambiguous name, picked one candidate"
        );
        Ok(chosen)
    }

    /// Drop cached names under `scope` for every session.
    pub async fn invalidate_scope(&self, scope: &str) -> usize {
        self.cache.invalidate_scope(scope).await
    }

    /// Drop every cached name that maps to `id`.
    pub async fn invalidate_id(&self, id: &str) -> usize {
        self.cache.invalidate_id(id).await
    }

    /// Clear cached names for one session, or all of them.
    pub async fn clear(&self, session: Option<&str>) {
        self.cache.clear(session).await;
    }

    pub async fn stats(&self) -> CacheStats {
        self.cache.stats().await
    }
}

/// Pick one of several same-named candidates (`matches` is non-empty).
///
/// Newest/Oldest order by `created_at` with a stable sort, so ties keep
/// server order; a missing timestamp sorts as the oldest.
fn select<'a>(matches: &[&'a NamedEntity], policy: Disambiguation) -> &'a NamedEntity {
    let mut ordered = matches.to_vec();
    match policy {
        Disambiguation::Newest => ordered.sort_by(|a, b| b.created_at.cmp(&a.created_at)),
        Disambiguation::Oldest => ordered.sort_by(|a, b| a.created_at.cmp(&b.created_at)),
        Disambiguation::First | Disambiguation::Error => {}
    }
    ordered[0]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn at(day: u32) -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()
    }

    fn three_demos() -> Vec<NamedEntity> {
        vec![
            NamedEntity::new("p_mid", "Demo").created_at(at(10)),
            NamedEntity::new("p_new", "Demo").created_at(at(20)),
            NamedEntity::new("p_old", "Demo").created_at(at(1)),
            NamedEntity::new("p_other", "Other"),
        ]
    }

    /// Server listing of the `ws` scope that counts how often it is called.
    struct Listing {
        entities: Vec<NamedEntity>,
        calls: AtomicUsize,
    }

    impl Listing {
        fn new(entities: Vec<NamedEntity>) -> Self {
            Self {
                entities,
                calls: AtomicUsize::new(0),
            }
        }

        async fn resolve(
            &self,
            resolver: &NameResolver,
            name: &str,
            session: &str,
            policy: Disambiguation,
        ) -> Result<Option<String>> {
            let listing = self;
            resolver
                .resolve(
                    "ws",
                    name,
                    session,
                    move || async move {
                        listing.calls.fetch_add(1, Ordering::SeqCst);
                        Ok(listing.entities.clone())
                    },
                    policy,
                )
                .await
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn test_lists_once_then_serves_from_cache() {
        let resolver = NameResolver::new(EntityKind::Base, 10);
        let listing = Listing::new(vec![NamedEntity::new("p1", "Sales")]);

        let first = listing
            .resolve(&resolver, "Sales", "default", Disambiguation::First)
            .await;
        let second = listing
            .resolve(&resolver, "Sales", "default", Disambiguation::First)
            .await;

        assert_eq!(first.unwrap().as_deref(), Some("p1"));
        assert_eq!(second.unwrap().as_deref(), Some("p1"));
        assert_eq!(listing.calls(), 1);
    }

    #[tokio::test]
    async fn test_absent_name_is_none_and_not_cached() {
        let resolver = NameResolver::new(EntityKind::Table, 10);
        let listing = Listing::new(three_demos());

        for _ in 0..2 {
            let result = listing
                .resolve(&resolver, "Missing", "default", Disambiguation::First)
                .await
                .unwrap();
            assert!(result.is_none());
        }
        assert_eq!(listing.calls(), 2);
    }

    #[tokio::test]
    async fn test_disambiguation_strategies() {
        let listing = Listing::new(three_demos());
        let cases = [
            (Disambiguation::First, "p_mid"),
            (Disambiguation::Newest, "p_new"),
            (Disambiguation::Oldest, "p_old"),
        ];

        for (policy, expected) in cases {
            let resolver = NameResolver::new(EntityKind::Base, 10);
            let id = listing
                .resolve(&resolver, "Demo", "default", policy)
                .await
                .unwrap();
            assert_eq!(id.as_deref(), Some(expected), "strategy {}", policy);
        }
    }

    #[tokio::test]
    async fn test_error_strategy_names_all_candidates() {
        let resolver = NameResolver::new(EntityKind::Base, 10);
        let listing = Listing::new(three_demos());

        let err = listing
            .resolve(&resolver, "Demo", "default", Disambiguation::Error)
            .await
            .unwrap_err();

        match err.kind() {
            Some(ErrorKind::Validation {
                status: None,
                message,
                details,
            }) => {
                for id in ["p_mid", "p_new", "p_old"] {
                    assert!(message.contains(id), "message should name {}", id);
                }
                assert_eq!(details.as_ref().unwrap()["ids"].as_array().unwrap().len(), 3);
            }
            other => panic!("Expected local Validation, got: {:?}", other),
        }

        // Nothing was cached, so the next lookup lists again
        let _ = listing
            .resolve(&resolver, "Demo", "default", Disambiguation::First)
            .await;
        assert_eq!(listing.calls(), 2);
    }

    #[tokio::test]
    async fn test_missing_timestamps_sort_oldest() {
        let listing = Listing::new(vec![
            NamedEntity::new("p_dated", "Demo").created_at(at(5)),
            NamedEntity::new("p_undated", "Demo"),
        ]);

        let resolver = NameResolver::new(EntityKind::Base, 10);
        let oldest = listing
            .resolve(&resolver, "Demo", "default", Disambiguation::Oldest)
            .await;
        assert_eq!(oldest.unwrap().as_deref(), Some("p_undated"));

        let resolver = NameResolver::new(EntityKind::Base, 10);
        let newest = listing
            .resolve(&resolver, "Demo", "default", Disambiguation::Newest)
            .await;
        assert_eq!(newest.unwrap().as_deref(), Some("p_dated"));
    }

    #[tokio::test]
    async fn test_equal_timestamps_keep_server_order() {
        let resolver = NameResolver::new(EntityKind::Base, 10);
        let listing = Listing::new(vec![
            NamedEntity::new("p_a", "Demo").created_at(at(3)),
            NamedEntity::new("p_b", "Demo").created_at(at(3)),
        ]);

        let newest = listing
            .resolve(&resolver, "Demo", "default", Disambiguation::Newest)
            .await;
        assert_eq!(newest.unwrap().as_deref(), Some("p_a"));
    }

    #[tokio::test]
    async fn test_clear_one_session_forces_relisting() {
        let resolver = NameResolver::new(EntityKind::Base, 10);
        let listing = Listing::new(vec![NamedEntity::new("p1", "Sales")]);

        for session in ["s1", "s2"] {
            listing
                .resolve(&resolver, "Sales", session, Disambiguation::First)
                .await
                .unwrap();
        }
        assert_eq!(listing.calls(), 2);

        resolver.clear(Some("s1")).await;

        listing
            .resolve(&resolver, "Sales", "s2", Disambiguation::First)
            .await
            .unwrap();
        assert_eq!(listing.calls(), 2);

        listing
            .resolve(&resolver, "Sales", "s1", Disambiguation::First)
            .await
            .unwrap();
        assert_eq!(listing.calls(), 3);
    }

    #[tokio::test]
    async fn test_invalidate_scope_forces_relisting() {
        let resolver = NameResolver::new(EntityKind::Table, 10);
        let listing = Listing::new(vec![NamedEntity::new("t1", "Orders")]);

        listing
            .resolve(&resolver, "Orders", "default", Disambiguation::First)
            .await
            .unwrap();
        assert_eq!(resolver.invalidate_scope("ws").await, 2);
        listing
            .resolve(&resolver, "Orders", "default", Disambiguation::First)
            .await
            .unwrap();

        assert_eq!(listing.calls(), 2);
    }

    #[tokio::test]
    async fn test_create_during_listing_does_not_pin_stale_id() {
        let resolver = NameResolver::new(EntityKind::Base, 10);
        let creator = &resolver;

        // A second "Demo" is created (and the scope invalidated) while the
        // first lookup is still waiting for its listing
        let stale = resolver
            .resolve(
                "ws",
                "Demo",
                "default",
                move || async move {
                    creator.invalidate_scope("ws").await;
                    Ok(vec![NamedEntity::new("p_old", "Demo").created_at(at(1))])
                },
                Disambiguation::Newest,
            )
            .await
            .unwrap();
        assert_eq!(stale.as_deref(), Some("p_old"));
        assert_eq!(resolver.stats().await.session_entries, 0);

        let listing = Listing::new(vec![
            NamedEntity::new("p_old", "Demo").created_at(at(1)),
            NamedEntity::new("p_new", "Demo").created_at(at(2)),
        ]);
        let fresh = listing
            .resolve(&resolver, "Demo", "default", Disambiguation::Newest)
            .await;

        assert_eq!(fresh.unwrap().as_deref(), Some("p_new"));
        assert_eq!(listing.calls(), 1);
    }

    #[tokio::test]
    async fn test_listing_failure_propagates() {
        let resolver = NameResolver::new(EntityKind::Column, 10);

        let result = resolver
            .resolve(
                "m1",
                "Status",
                "default",
                || async {
                    Err(ClientError::from(ErrorKind::Server {
                        status: 503,
                        message: "unavailable".to_string(),
                        details: None,
                    }))
                },
                Disambiguation::First,
            )
            .await;

        assert_eq!(result.unwrap_err().status(), Some(503));
    }

    #[test]
    fn test_disambiguation_from_str() {
        assert_eq!("Newest".parse::<Disambiguation>().unwrap(), Disambiguation::Newest);
        assert_eq!("error".parse::<Disambiguation>().unwrap(), Disambiguation::Error);
        assert!("latest".parse::<Disambiguation>().is_err());
        assert_eq!(Disambiguation::default(), Disambiguation::First);
    }
}

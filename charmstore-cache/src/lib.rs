//! Charm Store Cache - Backing-Store Contract and Request-Scoped Cache
//!
//! Defines the minimal document-store abstraction the cache consumes, an
//! in-memory mock implementation for tests, and the cache subsystem
//! itself (see [`cache`]).

pub mod cache;

pub use cache::{CachedIter, EntityCache, BASE_ENTITY_THRESHOLD, ENTITY_THRESHOLD};

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use charmstore_core::{
    BaseEntity, BaseEntityFields, BaseUrl, CharmUrl, CharmstoreError, CharmstoreResult, Entity,
    EntityFields, StoreError,
};

// ============================================================================
// BACKING-STORE CONTRACT
// ============================================================================

/// Backing document-store contract consumed by the cache.
///
/// Both operations are synchronous from the caller's perspective and must
/// be safe for concurrent use; the cache shares one handle between all of
/// its fetch workers. `Ok(None)` is the distinguished not-found outcome.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Resolve `url` (fully qualified or partial) to the best matching
    /// entity, populated with at least `fields`.
    async fn find_best_entity(
        &self,
        url: &CharmUrl,
        fields: EntityFields,
    ) -> CharmstoreResult<Option<Entity>>;

    /// Fetch the base entity stored under exactly `url`, populated with at
    /// least `fields`.
    async fn find_base_entity(
        &self,
        url: &BaseUrl,
        fields: BaseEntityFields,
    ) -> CharmstoreResult<Option<BaseEntity>>;
}

/// Upstream cursor over entity documents, as produced by a store query.
///
/// `Ok(None)` marks exhaustion; a terminal error is reported once and ends
/// iteration.
#[async_trait]
pub trait EntityCursor: Send {
    /// Advance to the next document.
    async fn next(&mut self) -> CharmstoreResult<Option<Entity>>;

    /// Release cursor resources.
    async fn close(&mut self) -> CharmstoreResult<()>;
}

// ============================================================================
// MOCK STORE
// ============================================================================

/// In-memory mock store for testing.
///
/// Resolves partial URLs the way the real store does (user present: best
/// revision owned by that user; user absent: best promulgated revision),
/// projects results to the requested field set, and records every call so
/// tests can assert on fetch counts and requested fields.
#[derive(Default)]
pub struct MockStore {
    entities: RwLock<Vec<Entity>>,
    base_entities: RwLock<HashMap<BaseUrl, BaseEntity>>,
    entity_calls: RwLock<Vec<(CharmUrl, EntityFields)>>,
    base_calls: RwLock<Vec<(BaseUrl, BaseEntityFields)>>,
    fail_names: RwLock<HashSet<String>>,
    latency: RwLock<Option<Duration>>,
}

impl MockStore {
    /// Create a new empty mock store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an entity document.
    pub fn insert_entity(&self, entity: Entity) {
        self.entities.write().unwrap().push(entity);
    }

    /// Seed a base-entity document.
    pub fn insert_base_entity(&self, base: BaseEntity) {
        self.base_entities
            .write()
            .unwrap()
            .insert(base.url.clone(), base);
    }

    /// Make every fetch for `name` fail with a query error.
    pub fn fail_name(&self, name: impl Into<String>) {
        self.fail_names.write().unwrap().insert(name.into());
    }

    /// Delay every fetch by `latency`, to widen concurrency windows in
    /// tests.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.write().unwrap() = Some(latency);
    }

    /// Number of `find_best_entity` calls so far.
    pub fn entity_fetch_count(&self) -> u64 {
        self.entity_calls.read().unwrap().len() as u64
    }

    /// Number of `find_base_entity` calls so far.
    pub fn base_fetch_count(&self) -> u64 {
        self.base_calls.read().unwrap().len() as u64
    }

    /// Log of `find_best_entity` calls, in order.
    pub fn entity_calls(&self) -> Vec<(CharmUrl, EntityFields)> {
        self.entity_calls.read().unwrap().clone()
    }

    /// Log of `find_base_entity` calls, in order.
    pub fn base_calls(&self) -> Vec<(BaseUrl, BaseEntityFields)> {
        self.base_calls.read().unwrap().clone()
    }

    fn resolve(&self, url: &CharmUrl) -> Option<Entity> {
        let entities = self.entities.read().unwrap();
        match &url.user {
            Some(user) => entities
                .iter()
                .filter(|e| e.url.name == url.name)
                .filter(|e| e.url.user.as_deref() == Some(user.as_str()))
                .filter(|e| {
                    url.series
                        .as_ref()
                        .map_or(true, |series| e.url.series.as_ref() == Some(series))
                })
                .filter(|e| url.revision.map_or(true, |rev| e.url.revision == Some(rev)))
                .max_by_key(|e| e.url.revision)
                .cloned(),
            None => entities
                .iter()
                .filter_map(|e| e.promulgated_url.as_ref().map(|p| (e, p)))
                .filter(|(_, p)| p.name == url.name)
                .filter(|(_, p)| {
                    url.series
                        .as_ref()
                        .map_or(true, |series| p.series.as_ref() == Some(series))
                })
                .filter(|(_, p)| url.revision.map_or(true, |rev| p.revision == Some(rev)))
                .max_by_key(|(_, p)| p.revision)
                .map(|(e, _)| e.clone()),
        }
    }

    async fn simulate_latency(&self) {
        let latency = *self.latency.read().unwrap();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl EntityStore for MockStore {
    async fn find_best_entity(
        &self,
        url: &CharmUrl,
        fields: EntityFields,
    ) -> CharmstoreResult<Option<Entity>> {
        self.entity_calls
            .write()
            .unwrap()
            .push((url.clone(), fields));
        self.simulate_latency().await;
        if self.fail_names.read().unwrap().contains(&url.name) {
            return Err(StoreError::QueryFailed {
                reason: format!("injected failure for {}", url.name),
            }
            .into());
        }
        Ok(self.resolve(url).map(|e| e.with_fields(fields)))
    }

    async fn find_base_entity(
        &self,
        url: &BaseUrl,
        fields: BaseEntityFields,
    ) -> CharmstoreResult<Option<BaseEntity>> {
        self.base_calls.write().unwrap().push((url.clone(), fields));
        self.simulate_latency().await;
        if self.fail_names.read().unwrap().contains(&url.name) {
            return Err(StoreError::QueryFailed {
                reason: format!("injected failure for {}", url.name),
            }
            .into());
        }
        let base = self.base_entities.read().unwrap().get(url).cloned();
        Ok(base.map(|b| b.with_fields(fields)))
    }
}

// ============================================================================
// TEST CURSOR
// ============================================================================

/// Cursor over a seeded sequence of entities, optionally ending in an
/// error, for exercising the streaming iterator.
pub struct VecCursor {
    items: VecDeque<Entity>,
    terminal: Option<CharmstoreError>,
    closed: Arc<AtomicBool>,
    next_calls: Arc<AtomicU64>,
}

impl VecCursor {
    /// Cursor yielding `items` and then exhaustion.
    pub fn new(items: Vec<Entity>) -> Self {
        Self {
            items: items.into(),
            terminal: None,
            closed: Arc::new(AtomicBool::new(false)),
            next_calls: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Cursor yielding `items` and then `err`.
    pub fn with_error(items: Vec<Entity>, err: CharmstoreError) -> Self {
        Self {
            terminal: Some(err),
            ..Self::new(items)
        }
    }

    /// Handle observing whether `close` has been called.
    pub fn closed_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.closed)
    }

    /// Handle observing how often `next` has been called.
    pub fn next_call_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.next_calls)
    }
}

#[async_trait]
impl EntityCursor for VecCursor {
    async fn next(&mut self) -> CharmstoreResult<Option<Entity>> {
        self.next_calls.fetch_add(1, Ordering::SeqCst);
        match self.items.pop_front() {
            Some(entity) => Ok(Some(entity)),
            None => match self.terminal.take() {
                Some(err) => Err(err),
                None => Ok(None),
            },
        }
    }

    async fn close(&mut self) -> CharmstoreResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use charmstore_core::{blob_digest, AclSet};
    use chrono::Utc;

    fn make_entity(url: &str, promulgated: Option<&str>) -> Entity {
        let url: CharmUrl = url.parse().unwrap();
        let base_url = url.base().unwrap();
        Entity {
            url,
            base_url,
            promulgated_url: promulgated.map(|p| p.parse().unwrap()),
            blob_name: Some("blob-0001".to_string()),
            blob_hash: Some(blob_digest(b"archive content")),
            size: Some(2048),
            uploaded: Some(Utc::now()),
            supported_series: Some(vec!["trusty".to_string()]),
        }
    }

    fn make_base_entity(url: &str) -> BaseEntity {
        BaseEntity {
            url: url.parse().unwrap(),
            name: Some(url.rsplit('/').next().unwrap().to_string()),
            public: Some(true),
            acls: Some(AclSet {
                read: vec!["everyone".to_string()],
                write: vec!["bob".to_string()],
            }),
            promulgated: Some(false),
        }
    }

    #[tokio::test]
    async fn test_find_best_entity_fully_qualified() {
        let store = MockStore::new();
        store.insert_entity(make_entity("cs:~bob/trusty/wordpress-1", None));
        store.insert_entity(make_entity("cs:~bob/trusty/wordpress-2", None));

        let url: CharmUrl = "cs:~bob/trusty/wordpress-1".parse().unwrap();
        let found = store
            .find_best_entity(&url, EntityFields::required_fields())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.url, url);
    }

    #[tokio::test]
    async fn test_find_best_entity_picks_latest_revision() {
        let store = MockStore::new();
        store.insert_entity(make_entity("cs:~bob/trusty/wordpress-1", None));
        store.insert_entity(make_entity("cs:~bob/trusty/wordpress-2", None));

        let url: CharmUrl = "cs:~bob/wordpress".parse().unwrap();
        let found = store
            .find_best_entity(&url, EntityFields::required_fields())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.url.revision, Some(2));
    }

    #[tokio::test]
    async fn test_find_best_entity_promulgated() {
        let store = MockStore::new();
        store.insert_entity(make_entity(
            "cs:~bob/trusty/wordpress-1",
            Some("cs:trusty/wordpress-3"),
        ));
        store.insert_entity(make_entity("cs:~alice/trusty/wordpress-7", None));

        let url: CharmUrl = "wordpress".parse().unwrap();
        let found = store
            .find_best_entity(&url, EntityFields::required_fields())
            .await
            .unwrap()
            .unwrap();
        // Alice's entity is not promulgated, so Bob's wins despite the
        // lower owner revision.
        assert_eq!(found.url.user.as_deref(), Some("bob"));
    }

    #[tokio::test]
    async fn test_find_best_entity_projects_fields() {
        let store = MockStore::new();
        store.insert_entity(make_entity("cs:~bob/trusty/wordpress-1", None));

        let url: CharmUrl = "cs:~bob/trusty/wordpress-1".parse().unwrap();
        let found = store
            .find_best_entity(&url, EntityFields::required_fields() | EntityFields::SIZE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.size, Some(2048));
        assert!(found.blob_name.is_none());
        assert!(found.supported_series.is_none());
    }

    #[tokio::test]
    async fn test_find_best_entity_not_found() {
        let store = MockStore::new();
        let url: CharmUrl = "cs:~bob/mysql".parse().unwrap();
        let found = store
            .find_best_entity(&url, EntityFields::required_fields())
            .await
            .unwrap();
        assert!(found.is_none());
        assert_eq!(store.entity_fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let store = MockStore::new();
        store.fail_name("wordpress");
        let url: CharmUrl = "wordpress".parse().unwrap();
        let result = store
            .find_best_entity(&url, EntityFields::required_fields())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_find_base_entity() {
        let store = MockStore::new();
        store.insert_base_entity(make_base_entity("cs:~bob/wordpress"));

        let url: BaseUrl = "cs:~bob/wordpress".parse().unwrap();
        let found = store
            .find_base_entity(&url, BaseEntityFields::URL | BaseEntityFields::ACLS)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.url, url);
        assert!(found.acls.is_some());
        assert!(found.public.is_none());

        let missing: BaseUrl = "cs:~alice/mysql".parse().unwrap();
        assert!(store
            .find_base_entity(&missing, BaseEntityFields::URL)
            .await
            .unwrap()
            .is_none());
        assert_eq!(store.base_fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_vec_cursor_exhaustion() {
        let mut cursor = VecCursor::new(vec![
            make_entity("cs:~bob/trusty/wordpress-1", None),
            make_entity("cs:~bob/trusty/wordpress-2", None),
        ]);
        assert!(cursor.next().await.unwrap().is_some());
        assert!(cursor.next().await.unwrap().is_some());
        assert!(cursor.next().await.unwrap().is_none());
        assert!(cursor.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_vec_cursor_terminal_error() {
        let mut cursor = VecCursor::with_error(
            vec![make_entity("cs:~bob/trusty/wordpress-1", None)],
            StoreError::CursorFailed {
                reason: "lost connection".to_string(),
            }
            .into(),
        );
        assert!(cursor.next().await.unwrap().is_some());
        assert!(cursor.next().await.is_err());
        // The error is reported once.
        assert!(cursor.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_vec_cursor_close_flag() {
        let mut cursor = VecCursor::new(Vec::new());
        let closed = cursor.closed_flag();
        assert!(!closed.load(Ordering::SeqCst));
        cursor.close().await.unwrap();
        assert!(closed.load(Ordering::SeqCst));
    }
}

//! Cache façade composing the entity and base-entity sub-caches.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use charmstore_core::{
    BaseEntity, BaseEntityFields, BaseUrl, CacheError, CharmUrl, CharmstoreResult, Entity,
    EntityFields,
};
use tracing::debug;

use super::iter::{CachedIter, IterHandle};
use super::sub_cache::{Fetch, SubCache};
use crate::{EntityCursor, EntityStore};

/// Fetches base entities for the base sub-cache.
pub(crate) struct BaseFetcher {
    store: Arc<dyn EntityStore>,
}

#[async_trait]
impl Fetch for BaseFetcher {
    type Key = BaseUrl;
    type Doc = BaseEntity;
    type Fields = BaseEntityFields;

    async fn fetch(
        &self,
        url: &BaseUrl,
        fields: BaseEntityFields,
    ) -> CharmstoreResult<Option<BaseEntity>> {
        self.store
            .find_base_entity(url, fields)
            .await
            .map_err(|err| {
                CacheError::FetchFailed {
                    url: url.to_string(),
                    reason: err.to_string(),
                }
                .into()
            })
    }
}

/// Fetches entities for the entity sub-cache and cross-links the base
/// sub-cache: as soon as a fetched record's base URL is known, the base
/// fetch is primed without the caller having to serialise.
pub(crate) struct EntityFetcher {
    store: Arc<dyn EntityStore>,
    bases: SubCache<BaseFetcher>,
}

#[async_trait]
impl Fetch for EntityFetcher {
    type Key = CharmUrl;
    type Doc = Entity;
    type Fields = EntityFields;

    async fn fetch(&self, url: &CharmUrl, fields: EntityFields) -> CharmstoreResult<Option<Entity>> {
        let fetched = self
            .store
            .find_best_entity(url, fields)
            .await
            .map_err(|err| CacheError::FetchFailed {
                url: url.to_string(),
                reason: err.to_string(),
            })?;
        if let Some(entity) = &fetched {
            self.bases.ensure_fetch(&entity.base_url);
        }
        Ok(fetched)
    }
}

/// Request-scoped cache over one backing store.
///
/// Lives for the span of one logical task and is discarded at its end via
/// [`close`](EntityCache::close). All operations are safe for concurrent
/// use, except that `close` is a final barrier and must not race other
/// calls.
pub struct EntityCache {
    entities: SubCache<EntityFetcher>,
    bases: SubCache<BaseFetcher>,
    iters: Mutex<Vec<IterHandle>>,
}

impl EntityCache {
    /// Create an empty cache over `store`.
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        let bases = SubCache::new(BaseFetcher {
            store: Arc::clone(&store),
        });
        let entities = SubCache::new(EntityFetcher {
            store,
            bases: bases.clone(),
        });
        Self {
            entities,
            bases,
            iters: Mutex::new(Vec::new()),
        }
    }

    /// Look up the entity for `url` (any flavour), fetching it if needed.
    ///
    /// The returned record contains a superset of `fields`. `Ok(None)`
    /// reports not-found, negatively cached for the cache's lifetime; a
    /// backend failure is likewise cached per key. Slots are indexed by
    /// the requested URL, so a repeat lookup under the same alias hits the
    /// cache while a different alias for the same entity fetches again.
    pub async fn entity(
        &self,
        url: &CharmUrl,
        fields: EntityFields,
    ) -> CharmstoreResult<Option<Entity>> {
        // With a user present the base URL is already known, so the base
        // fetch need not wait for entity resolution. Without one it is
        // primed by the entity fetch worker once the record arrives.
        if let Some(base) = url.base() {
            self.bases.ensure_fetch(&base);
        }
        self.entities.lookup(url, fields).await
    }

    /// Look up the base entity for `url`, fetching it if needed.
    pub async fn base_entity(
        &self,
        url: &BaseUrl,
        fields: BaseEntityFields,
    ) -> CharmstoreResult<Option<BaseEntity>> {
        self.bases.lookup(url, fields).await
    }

    /// Begin fetching all of `urls` asynchronously. Returns immediately;
    /// later lookups for the same URLs share the fetches started here.
    pub fn start_fetch<'a>(&self, urls: impl IntoIterator<Item = &'a CharmUrl>) {
        for url in urls {
            if let Some(base) = url.base() {
                self.bases.ensure_fetch(&base);
            }
            self.entities.ensure_fetch(url);
        }
    }

    /// Union-merge `fields` into the required entity field set. Every
    /// fetch dispatched from now on requests at least these fields.
    pub fn add_entity_fields(&self, fields: EntityFields) {
        self.entities.add_fields(fields);
    }

    /// Union-merge `fields` into the required base-entity field set.
    pub fn add_base_entity_fields(&self, fields: BaseEntityFields) {
        self.bases.add_fields(fields);
    }

    /// The current required entity field set, for constructing upstream
    /// cursors with a matching selector.
    pub fn entity_fields(&self) -> EntityFields {
        self.entities.required_fields()
    }

    /// The current required base-entity field set.
    pub fn base_entity_fields(&self) -> BaseEntityFields {
        self.bases.required_fields()
    }

    /// Wrap `cursor` in a streaming iterator that populates this cache
    /// and pre-fetches base entities in batches (see [`CachedIter`]).
    ///
    /// The cursor should have been constructed with the field selector
    /// returned by [`entity_fields`](EntityCache::entity_fields).
    pub fn iter(&self, cursor: Box<dyn EntityCursor>) -> CachedIter {
        let (iter, handle) = CachedIter::spawn(self.entities.clone(), self.bases.clone(), cursor);
        self.iters.lock().unwrap().push(handle);
        iter
    }

    /// Stop all iterator coordinators, wait for them, and release every
    /// slot. Results of still-running fetch workers are dropped silently.
    /// No operation may be issued after `close` returns.
    pub async fn close(&self) {
        let handles: Vec<IterHandle> = std::mem::take(&mut *self.iters.lock().unwrap());
        for handle in handles {
            handle.stop().await;
        }
        let entity_slots = self.entities.close();
        let base_slots = self.bases.close();
        debug!(entity_slots, base_slots, "entity cache closed");
    }
}

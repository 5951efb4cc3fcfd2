//! Streaming iterator wrapper: feeds an upstream cursor through the cache
//! while pre-fetching base entities in batches.
//!
//! The wrapper owns a single coordinator task. The consumer interacts
//! with it only through a capacity-1 hand-off channel and a close signal;
//! all iteration state lives on the coordinator.

use charmstore_core::{BaseEntityFields, BaseUrl, CharmstoreResult, Entity, EntityFields};
use futures_util::future::join_all;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::entity_cache::{BaseFetcher, EntityFetcher};
use super::sub_cache::SubCache;
use crate::EntityCursor;

/// Buffered-entity count at which the coordinator flushes a batch.
pub const ENTITY_THRESHOLD: usize = 100;

/// Distinct pending base-URL count at which the coordinator flushes.
pub const BASE_ENTITY_THRESHOLD: usize = 20;

/// Handle kept by the cache so `close` can stop and await the
/// coordinator.
pub(crate) struct IterHandle {
    close_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl IterHandle {
    pub(crate) async fn stop(self) {
        let _ = self.close_tx.send(true);
        let _ = self.join.await;
    }
}

/// Consumer side of the streaming iterator.
///
/// Entities arrive in upstream order, filtered to the required entity
/// field set at construction time; they are the upstream cursor's records,
/// never a record already cached under the same key, so compare by URL.
pub struct CachedIter {
    rx: mpsc::Receiver<CharmstoreResult<Entity>>,
    closed: bool,
    finished: bool,
}

impl CachedIter {
    pub(crate) fn spawn(
        entities: SubCache<EntityFetcher>,
        bases: SubCache<BaseFetcher>,
        cursor: Box<dyn EntityCursor>,
    ) -> (CachedIter, IterHandle) {
        let (tx, rx) = mpsc::channel(1);
        let (close_tx, close_rx) = watch::channel(false);
        let coordinator = Coordinator {
            at_version: entities.version(),
            fields: entities.required_fields(),
            entities,
            bases,
            tx,
            close_rx,
            buffered: Vec::new(),
            pending_bases: Vec::new(),
        };
        let join = tokio::spawn(coordinator.run(cursor));
        (
            CachedIter {
                rx,
                closed: false,
                finished: false,
            },
            IterHandle { close_tx, join },
        )
    }

    /// Await the next entity. `Ok(None)` marks exhaustion; an upstream
    /// cursor error is reported exactly once, after any entities read
    /// before the failure have been delivered.
    pub async fn next(&mut self) -> CharmstoreResult<Option<Entity>> {
        assert!(!self.closed, "iterator used after close");
        if self.finished {
            return Ok(None);
        }
        match self.rx.recv().await {
            Some(Ok(entity)) => Ok(Some(entity)),
            Some(Err(err)) => {
                self.finished = true;
                Err(err)
            }
            None => {
                self.finished = true;
                Ok(None)
            }
        }
    }

    /// Signal the coordinator to stop. Safe to call at any point; the
    /// coordinator detects the closed hand-off, finishes or abandons its
    /// current batch (every base fetch it started is backed by a live
    /// worker, so no slot is left permanently pending), closes the
    /// upstream cursor and exits.
    pub fn close(&mut self) {
        self.closed = true;
        self.rx.close();
    }
}

struct Coordinator {
    entities: SubCache<EntityFetcher>,
    bases: SubCache<BaseFetcher>,
    tx: mpsc::Sender<CharmstoreResult<Entity>>,
    close_rx: watch::Receiver<bool>,
    /// Entity sub-cache version when the wrapper was created; documents
    /// from the cursor are only inserted while it still matches.
    at_version: u64,
    /// Field selection applied to records handed to the consumer.
    fields: EntityFields,
    buffered: Vec<Entity>,
    pending_bases: Vec<BaseUrl>,
}

impl Coordinator {
    async fn run(mut self, mut cursor: Box<dyn EntityCursor>) {
        loop {
            let item = tokio::select! {
                _ = self.close_rx.wait_for(|closed| *closed) => break,
                item = cursor.next() => item,
            };
            match item {
                Ok(Some(entity)) => {
                    self.entities
                        .insert(entity.url.clone(), entity.clone(), self.at_version);
                    if !self.pending_bases.contains(&entity.base_url)
                        && !self.bases.contains(&entity.base_url)
                    {
                        self.pending_bases.push(entity.base_url.clone());
                    }
                    self.buffered.push(entity.with_fields(self.fields));
                    if self.buffered.len() >= ENTITY_THRESHOLD
                        || self.pending_bases.len() >= BASE_ENTITY_THRESHOLD
                    {
                        if !self.flush().await {
                            break;
                        }
                    }
                }
                Ok(None) => {
                    let _ = self.flush().await;
                    break;
                }
                Err(err) => {
                    // Entities read before the failure are still delivered,
                    // then the error ends iteration.
                    if self.flush().await {
                        let _ = self.tx.send(Err(err)).await;
                    }
                    break;
                }
            }
        }
        if let Err(err) = cursor.close().await {
            debug!(error = %err, "failed to close upstream cursor");
        }
        trace!("iterator coordinator stopped");
    }

    /// Fetch every pending base entity in parallel, wait all of them out,
    /// then hand the buffered entities to the consumer. Returns false if
    /// the consumer is gone or a close was signalled.
    async fn flush(&mut self) -> bool {
        if !self.pending_bases.is_empty() {
            debug!(
                entities = self.buffered.len(),
                base_urls = self.pending_bases.len(),
                "flushing iterator batch"
            );
            // Not-founds and failures count as completed here; a failure
            // is cached per key and surfaces when a caller asks for that
            // base entity.
            let lookups: Vec<_> = self
                .pending_bases
                .drain(..)
                .map(|url| {
                    let bases = self.bases.clone();
                    async move {
                        let _ = bases.lookup(&url, BaseEntityFields::empty()).await;
                    }
                })
                .collect();
            join_all(lookups).await;
        }
        for entity in self.buffered.drain(..) {
            tokio::select! {
                _ = self.close_rx.wait_for(|closed| *closed) => return false,
                sent = self.tx.send(Ok(entity)) => {
                    if sent.is_err() {
                        return false;
                    }
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::EntityCache;
    use crate::{MockStore, VecCursor};
    use charmstore_core::{blob_digest, BaseEntity, CharmUrl, StoreError};
    use chrono::Utc;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    fn make_entity(url: &str) -> Entity {
        let url: CharmUrl = url.parse().unwrap();
        let base_url = url.base().unwrap();
        Entity {
            url,
            base_url,
            promulgated_url: None,
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
            acls: None,
            promulgated: Some(false),
        }
    }

    #[tokio::test]
    async fn test_iterator_delivers_all_entities_in_order() {
        let store = Arc::new(MockStore::new());
        store.insert_base_entity(make_base_entity("cs:~bob/wordpress"));
        let cache = EntityCache::new(store.clone());

        let seeded: Vec<Entity> = (0..5)
            .map(|rev| make_entity(&format!("cs:~bob/trusty/wordpress-{rev}")))
            .collect();
        let mut iter = cache.iter(Box::new(VecCursor::new(seeded.clone())));

        for expected in &seeded {
            let entity = iter.next().await.unwrap().unwrap();
            assert_eq!(entity.url, expected.url);
        }
        assert!(iter.next().await.unwrap().is_none());
        assert!(iter.next().await.unwrap().is_none());

        // One shared base URL, fetched once.
        assert_eq!(store.base_fetch_count(), 1);

        // The iterated documents are now cached; looking them up issues no
        // entity fetches.
        for expected in &seeded {
            assert!(cache
                .entity(&expected.url, EntityFields::empty())
                .await
                .unwrap()
                .is_some());
        }
        assert_eq!(store.entity_fetch_count(), 0);

        cache.close().await;
    }

    #[tokio::test]
    async fn test_iterator_entity_threshold_flush() {
        let store = Arc::new(MockStore::new());
        store.insert_base_entity(make_base_entity("cs:~bob/wordpress"));
        let cache = EntityCache::new(store.clone());

        let seeded: Vec<Entity> = (0..ENTITY_THRESHOLD as u32 + 1)
            .map(|rev| make_entity(&format!("cs:~bob/trusty/wordpress-{rev}")))
            .collect();
        let mut iter = cache.iter(Box::new(VecCursor::new(seeded.clone())));

        let mut delivered = 0;
        while iter.next().await.unwrap().is_some() {
            delivered += 1;
        }
        assert_eq!(delivered, ENTITY_THRESHOLD + 1);
        // All entities share one base URL: the first batch fetches it, the
        // second finds it already slotted.
        assert!(store.base_fetch_count() <= 2);

        cache.close().await;
    }

    #[tokio::test]
    async fn test_iterator_base_threshold_flush() {
        let store = Arc::new(MockStore::new());
        let cache = EntityCache::new(store.clone());

        // Distinct base URL per entity; none seeded in the store, so every
        // base fetch reports not-found, which still counts as completed.
        let seeded: Vec<Entity> = (0..BASE_ENTITY_THRESHOLD as u32)
            .map(|i| make_entity(&format!("cs:~bob/trusty/wp{i}-1")))
            .collect();
        let mut iter = cache.iter(Box::new(VecCursor::new(seeded)));

        let mut delivered = 0;
        while iter.next().await.unwrap().is_some() {
            delivered += 1;
        }
        assert_eq!(delivered, BASE_ENTITY_THRESHOLD);
        assert_eq!(store.base_fetch_count(), BASE_ENTITY_THRESHOLD as u64);

        cache.close().await;
    }

    #[tokio::test]
    async fn test_iterator_filters_to_required_fields() {
        let store = Arc::new(MockStore::new());
        let cache = EntityCache::new(store.clone());
        cache.add_entity_fields(EntityFields::BLOB_NAME);

        let mut iter = cache.iter(Box::new(VecCursor::new(vec![make_entity(
            "cs:~bob/trusty/wordpress-1",
        )])));
        let entity = iter.next().await.unwrap().unwrap();
        assert_eq!(entity.blob_name.as_deref(), Some("blob-0001"));
        assert!(entity.size.is_none());
        assert!(entity.supported_series.is_none());
        assert!(iter.next().await.unwrap().is_none());

        cache.close().await;
    }

    #[tokio::test]
    async fn test_iterator_yields_upstream_record_not_the_cached_one() {
        let store = Arc::new(MockStore::new());
        store.insert_entity(make_entity("cs:~bob/trusty/wordpress-1"));
        store.insert_base_entity(make_base_entity("cs:~bob/wordpress"));
        let cache = EntityCache::new(store.clone());
        cache.add_entity_fields(EntityFields::SIZE);

        let url: CharmUrl = "cs:~bob/trusty/wordpress-1".parse().unwrap();
        let cached = cache
            .entity(&url, EntityFields::empty())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cached.size, Some(2048));

        let mut upstream = make_entity("cs:~bob/trusty/wordpress-1");
        upstream.size = Some(4096);
        let mut iter = cache.iter(Box::new(VecCursor::new(vec![upstream])));

        let yielded = iter.next().await.unwrap().unwrap();
        assert_eq!(yielded.size, Some(4096));
        assert!(iter.next().await.unwrap().is_none());

        // The published slot was not overwritten.
        let still_cached = cache
            .entity(&url, EntityFields::empty())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(still_cached.size, Some(2048));
        assert_eq!(store.entity_fetch_count(), 1);

        cache.close().await;
    }

    #[tokio::test]
    async fn test_iterator_reports_upstream_error_after_entities() {
        let store = Arc::new(MockStore::new());
        let cache = EntityCache::new(store.clone());

        let mut iter = cache.iter(Box::new(VecCursor::with_error(
            vec![
                make_entity("cs:~bob/trusty/wordpress-1"),
                make_entity("cs:~bob/trusty/wordpress-2"),
            ],
            StoreError::CursorFailed {
                reason: "lost connection".to_string(),
            }
            .into(),
        )));

        assert!(iter.next().await.unwrap().is_some());
        assert!(iter.next().await.unwrap().is_some());
        let err = iter.next().await.unwrap_err();
        assert!(err.to_string().contains("lost connection"));
        // The error is reported once; iteration is over.
        assert!(iter.next().await.unwrap().is_none());

        cache.close().await;
    }

    #[tokio::test]
    async fn test_iterator_close_early_leaves_no_pending_slots() {
        let store = Arc::new(MockStore::new());
        store.insert_base_entity(make_base_entity("cs:~bob/wordpress"));
        store.insert_base_entity(make_base_entity("cs:~alice/mysql"));
        let cache = EntityCache::new(store.clone());

        let cursor = VecCursor::new(vec![
            make_entity("cs:~bob/trusty/wordpress-1"),
            make_entity("cs:~alice/trusty/mysql-1"),
        ]);
        let closed = cursor.closed_flag();
        let mut iter = cache.iter(Box::new(cursor));
        iter.close();

        // Whatever the coordinator got to before the close, these lookups
        // either join a completed fetch or start a fresh one; they never
        // hang on an abandoned slot.
        let wordpress = cache
            .base_entity(&"cs:~bob/wordpress".parse().unwrap(), BaseEntityFields::empty())
            .await
            .unwrap();
        assert!(wordpress.is_some());
        let mysql = cache
            .base_entity(&"cs:~alice/mysql".parse().unwrap(), BaseEntityFields::empty())
            .await
            .unwrap();
        assert!(mysql.is_some());

        // close waits out the coordinator, which closes the cursor.
        cache.close().await;
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cache_close_stops_a_blocked_coordinator() {
        let store = Arc::new(MockStore::new());
        let cache = EntityCache::new(store.clone());

        let cursor = VecCursor::new(
            (0..3)
                .map(|rev| make_entity(&format!("cs:~bob/trusty/wordpress-{rev}")))
                .collect(),
        );
        let closed = cursor.closed_flag();
        // The consumer never calls next, so the coordinator ends up parked
        // on the capacity-1 hand-off; close must still terminate it.
        let _iter = cache.iter(Box::new(cursor));
        cache.close().await;
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    #[should_panic(expected = "iterator used after close")]
    async fn test_next_after_close_panics() {
        let store = Arc::new(MockStore::new());
        let cache = EntityCache::new(store);

        let mut iter = cache.iter(Box::new(VecCursor::new(Vec::new())));
        iter.close();
        let _ = iter.next().await;
    }
}

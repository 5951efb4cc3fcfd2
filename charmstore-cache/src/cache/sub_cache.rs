//! Per-kind sub-cache: slot map, in-flight coalescing, field-set
//! invalidation.
//!
//! One instance caches entities, another base entities; both share this
//! implementation through the [`Fetch`] seam. All slot-map and field-set
//! work happens under one mutex; fetches run on detached worker tasks so
//! no I/O ever holds the lock. Waiters park on a per-slot watch channel:
//! the subscription is taken under the lock and publication sends under
//! the lock, so a wake-up cannot be missed.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use charmstore_core::{CharmstoreError, CharmstoreResult, FieldSet};
use tokio::sync::watch;

/// Fetches one kind of document from the backing store on behalf of a
/// sub-cache.
#[async_trait]
pub(crate) trait Fetch: Send + Sync + 'static {
    type Key: Clone + Eq + Hash + Send + Sync + 'static;
    type Doc: Clone + Send + Sync + 'static;
    type Fields: FieldSet;

    /// Fetch `key` with at least `fields` populated. `Ok(None)` is the
    /// distinguished not-found outcome.
    async fn fetch(
        &self,
        key: &Self::Key,
        fields: Self::Fields,
    ) -> CharmstoreResult<Option<Self::Doc>>;
}

enum SlotState<D> {
    /// A fetch dispatched under `version` is in flight.
    Pending { version: u64 },
    Present(D),
    /// Negative cache: the store reported not-found.
    Absent,
    /// The fetch failed; the error is served to every later caller.
    Failed(CharmstoreError),
}

struct Slot<D> {
    state: SlotState<D>,
    /// Signalled on every transition out of pending.
    ready: watch::Sender<()>,
}

impl<D> Slot<D> {
    fn pending(version: u64) -> Self {
        let (ready, _) = watch::channel(());
        Slot {
            state: SlotState::Pending { version },
            ready,
        }
    }

    fn present(doc: D) -> Self {
        let (ready, _) = watch::channel(());
        Slot {
            state: SlotState::Present(doc),
            ready,
        }
    }
}

struct Inner<F: Fetch> {
    slots: HashMap<F::Key, Slot<F::Doc>>,
    /// Union of every field selection ever requested.
    required: F::Fields,
    /// Bumped whenever `required` grows; fetches carry the version they
    /// were dispatched under and results from superseded versions are
    /// discarded.
    version: u64,
    closed: bool,
}

struct Shared<F: Fetch> {
    fetcher: F,
    inner: Mutex<Inner<F>>,
}

impl<F: Fetch> Shared<F> {
    /// Deliver a fetch result to its slot, unless the slot was removed,
    /// the version moved on, or the cache closed in the meantime.
    fn publish(&self, key: &F::Key, version: u64, result: CharmstoreResult<Option<F::Doc>>) {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return;
        }
        let Some(slot) = inner.slots.get_mut(key) else {
            return;
        };
        match slot.state {
            SlotState::Pending { version: v } if v == version => {
                slot.state = match result {
                    Ok(Some(doc)) => SlotState::Present(doc),
                    Ok(None) => SlotState::Absent,
                    Err(err) => SlotState::Failed(err),
                };
                let _ = slot.ready.send(());
            }
            _ => {}
        }
    }
}

/// One of the two kind-specific caches behind the façade.
///
/// Cheap to clone; clones share the slot map.
pub(crate) struct SubCache<F: Fetch> {
    shared: Arc<Shared<F>>,
}

impl<F: Fetch> Clone for SubCache<F> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<F: Fetch> SubCache<F> {
    pub(crate) fn new(fetcher: F) -> Self {
        Self {
            shared: Arc::new(Shared {
                fetcher,
                inner: Mutex::new(Inner {
                    slots: HashMap::new(),
                    required: F::Fields::required(),
                    version: 0,
                    closed: false,
                }),
            }),
        }
    }

    /// Look up `key`, fetching it if no slot exists and waiting out any
    /// in-flight fetch. The returned document contains a superset of
    /// `fields`.
    pub(crate) async fn lookup(
        &self,
        key: &F::Key,
        fields: F::Fields,
    ) -> CharmstoreResult<Option<F::Doc>> {
        {
            let mut inner = self.shared.inner.lock().unwrap();
            assert!(!inner.closed, "charm-store cache used after close");
            if !inner.required.includes(fields) {
                self.grow_locked(&mut inner, fields);
            }
        }
        loop {
            let mut ready = {
                let mut inner = self.shared.inner.lock().unwrap();
                assert!(!inner.closed, "charm-store cache used after close");
                match inner.slots.get(key) {
                    Some(slot) => match &slot.state {
                        SlotState::Present(doc) => return Ok(Some(doc.clone())),
                        SlotState::Absent => return Ok(None),
                        SlotState::Failed(err) => return Err(err.clone()),
                        SlotState::Pending { .. } => slot.ready.subscribe(),
                    },
                    None => {
                        let version = inner.version;
                        let required = inner.required;
                        let slot = Slot::pending(version);
                        let ready = slot.ready.subscribe();
                        inner.slots.insert(key.clone(), slot);
                        self.spawn_fetch(key.clone(), required, version);
                        ready
                    }
                }
            };
            let _ = ready.changed().await;
        }
    }

    /// Union-merge `fields` into the required set, invalidating cached
    /// results if the set grew.
    pub(crate) fn add_fields(&self, fields: F::Fields) {
        let mut inner = self.shared.inner.lock().unwrap();
        assert!(!inner.closed, "charm-store cache used after close");
        self.grow_locked(&mut inner, fields);
    }

    /// Create a pending slot and dispatch a fetch for `key` if no slot
    /// exists yet; no-op otherwise (including after close, so that fetch
    /// workers racing a close cannot trip an assertion).
    pub(crate) fn ensure_fetch(&self, key: &F::Key) {
        let mut inner = self.shared.inner.lock().unwrap();
        if inner.closed || inner.slots.contains_key(key) {
            return;
        }
        let version = inner.version;
        let required = inner.required;
        inner.slots.insert(key.clone(), Slot::pending(version));
        self.spawn_fetch(key.clone(), required, version);
    }

    /// Publish an externally produced document, unless a slot already
    /// exists or the required field set moved past `at_version` (the
    /// document would then be missing fields).
    pub(crate) fn insert(&self, key: F::Key, doc: F::Doc, at_version: u64) {
        let mut inner = self.shared.inner.lock().unwrap();
        if inner.closed || inner.version != at_version || inner.slots.contains_key(&key) {
            return;
        }
        inner.slots.insert(key, Slot::present(doc));
    }

    /// Whether any slot exists for `key`, in any state.
    pub(crate) fn contains(&self, key: &F::Key) -> bool {
        self.shared.inner.lock().unwrap().slots.contains_key(key)
    }

    /// The current required field set.
    pub(crate) fn required_fields(&self) -> F::Fields {
        self.shared.inner.lock().unwrap().required
    }

    /// The current version counter.
    pub(crate) fn version(&self) -> u64 {
        self.shared.inner.lock().unwrap().version
    }

    /// Release all slots and refuse further operations. Results from
    /// still-running fetch workers are dropped silently. Returns the
    /// number of slots released.
    pub(crate) fn close(&self) -> usize {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.closed = true;
        let released = inner.slots.len();
        inner.slots.clear();
        released
    }

    fn grow_locked(&self, inner: &mut Inner<F>, fields: F::Fields) {
        let merged = inner.required.union(fields);
        if merged == inner.required {
            return;
        }
        inner.required = merged;
        inner.version += 1;
        let version = inner.version;
        // Completed slots are dropped outright; pending slots stay and get
        // a replacement fetch under the new version, so their waiters
        // migrate to a result carrying the grown field set.
        let mut redispatch = Vec::new();
        inner.slots.retain(|key, slot| match &mut slot.state {
            SlotState::Pending { version: v } => {
                *v = version;
                redispatch.push(key.clone());
                true
            }
            _ => false,
        });
        for key in redispatch {
            self.spawn_fetch(key, merged, version);
        }
    }

    fn spawn_fetch(&self, key: F::Key, fields: F::Fields, version: u64) {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let result = shared.fetcher.fetch(&key, fields).await;
            shared.publish(&key, version, result);
        });
    }
}

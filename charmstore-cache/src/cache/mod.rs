//! Request-scoped entity cache with in-flight coalescing.
//!
//! A cache lives for the span of one logical task (typically one HTTP
//! request) and is discarded at its end: there is no eviction, no TTL and
//! no persistence. Within that span it de-duplicates lookups, shares
//! in-flight fetches between concurrent callers, caches not-found and
//! error outcomes per key, and grows a single required field set so that
//! every cached record satisfies every caller.
//!
//! # Structure
//!
//! Two symmetric sub-caches (entities and base entities) sit behind the
//! [`EntityCache`] façade, which cross-links them: a successful entity
//! fetch immediately primes the base-entity fetch for the record's base
//! URL. [`CachedIter`] wraps an upstream store cursor, feeding documents
//! into the cache and pre-fetching base entities in batches while
//! streaming the documents to the consumer.
//!
//! # Consistency
//!
//! Cached records are immutable once published and may be arbitrarily
//! stale with respect to concurrent writers of the backing store; callers
//! needing growth of the field selection get a fresh record via
//! version-bump invalidation, never an in-place update.

mod entity_cache;
mod iter;
mod sub_cache;

pub use entity_cache::EntityCache;
pub use iter::{CachedIter, BASE_ENTITY_THRESHOLD, ENTITY_THRESHOLD};

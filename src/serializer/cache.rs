//! Schema-keyed serializer cache.
//!
//! Serializers are looked up by [`SchemaFingerprint`]. The cache never keeps
//! a serializer alive on its own: entries hold a [`Weak`] reference and are
//! evicted when the last [`Arc`] handed out is dropped. A later lookup simply
//! builds a new one.
//!
//! Construction is single-flight per fingerprint. The first caller for a
//! missing fingerprint builds; callers arriving while that build runs wait on
//! it and receive the same instance, or the same error. Failed builds are not
//! cached. Locking is per map shard and is never held while building, so
//! unrelated schemas do not wait on each other.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::ops::Deref;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};
use tracing::{debug, warn};

use super::json::{RecordSerializer, SerializerError};
use super::schema::{RecordSchema, SchemaFingerprint};

type Builder<S> = dyn Fn(&RecordSchema) -> Result<S, SerializerError> + Send + Sync;
type Entries<S> = DashMap<SchemaFingerprint, Slot<S>>;
type BuildResult<S> = Result<Arc<Cached<S>>, SerializerError>;

enum Slot<S> {
    Ready(Weak<Cached<S>>),
    Building(Arc<Flight<S>>),
}

/// A serializer handed out by [`SerializerCache::get`].
///
/// Dropping the last handle evicts the cache entry.
pub struct Cached<S> {
    value: S,
    fingerprint: SchemaFingerprint,
    entries: Weak<Entries<S>>,
}

impl<S> Cached<S> {
    pub fn fingerprint(&self) -> SchemaFingerprint {
        self.fingerprint
    }
}

impl<S> Deref for Cached<S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.value
    }
}

impl<S> Drop for Cached<S> {
    fn drop(&mut self) {
        if let Some(entries) = self.entries.upgrade() {
            let evicted = entries.remove_if(&self.fingerprint, |_, slot| {
                matches!(slot, Slot::Ready(weak) if weak.strong_count() == 0)
            });
            if evicted.is_some() {
                debug!(fingerprint = %self.fingerprint, "Evicted serializer");
            }
        }
    }
}

impl<S: std::fmt::Debug> std::fmt::Debug for Cached<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cached")
            .field("fingerprint", &self.fingerprint)
            .field("value", &self.value)
            .finish()
    }
}

/// An in-progress construction that late callers wait on.
struct Flight<S> {
    result: Mutex<Option<BuildResult<S>>>,
    done: Condvar,
}

impl<S> Flight<S> {
    fn new() -> Self {
        Self {
            result: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    fn complete(&self, result: BuildResult<S>) {
        let mut slot = self.result.lock().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(result);
        self.done.notify_all();
    }

    fn wait(&self) -> BuildResult<S> {
        let mut slot = self.result.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(result) = slot.as_ref() {
                return result.clone();
            }
            slot = self.done.wait(slot).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

pub struct SerializerCache<S> {
    entries: Arc<Entries<S>>,
    build: Box<Builder<S>>,
    builds: AtomicU64,
}

impl SerializerCache<RecordSerializer> {
    /// Cache of [`RecordSerializer`]s.
    pub fn json(with_schema: bool) -> Self {
        Self::new(move |schema: &RecordSchema| {
            RecordSerializer::build(schema).map(|s| s.with_schema(with_schema))
        })
    }
}

impl<S: Send + Sync + 'static> SerializerCache<S> {
    pub fn new<F>(build: F) -> Self
    where
        F: Fn(&RecordSchema) -> Result<S, SerializerError> + Send + Sync + 'static,
    {
        Self {
            entries: Arc::new(DashMap::new()),
            build: Box::new(build),
            builds: AtomicU64::new(0),
        }
    }

    /// Returns the live serializer for `schema`, building it if needed.
    ///
    /// Blocks the calling thread on a condition variable while another
    /// caller is building the same schema. From async code, resolve once and
    /// keep the returned `Arc` rather than calling this per record.
    pub fn get(&self, schema: &RecordSchema) -> Result<Arc<Cached<S>>, SerializerError> {
        let fingerprint = schema.fingerprint();

        let flight = match self.entries.entry(fingerprint) {
            Entry::Occupied(mut occupied) => {
                let (live, in_flight) = match occupied.get() {
                    Slot::Ready(weak) => (weak.upgrade(), None),
                    Slot::Building(flight) => (None, Some(flight.clone())),
                };
                if let Some(serializer) = live {
                    return Ok(serializer);
                }
                if let Some(flight) = in_flight {
                    // Release the shard before waiting so the builder can install.
                    drop(occupied);
                    return flight.wait();
                }
                let flight = Arc::new(Flight::new());
                occupied.insert(Slot::Building(flight.clone()));
                flight
            }
            Entry::Vacant(vacant) => {
                let flight = Arc::new(Flight::new());
                vacant.insert(Slot::Building(flight.clone()));
                flight
            }
        };

        self.lead(schema, fingerprint, flight)
    }

    fn lead(
        &self,
        schema: &RecordSchema,
        fingerprint: SchemaFingerprint,
        flight: Arc<Flight<S>>,
    ) -> BuildResult<S> {
        self.builds.fetch_add(1, Ordering::Relaxed);
        debug!(%fingerprint, schema = %schema.name, "Building serializer");

        let result = match panic::catch_unwind(AssertUnwindSafe(|| (self.build)(schema))) {
            Ok(Ok(value)) => Ok(Arc::new(Cached {
                value,
                fingerprint,
                entries: Arc::downgrade(&self.entries),
            })),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SerializerError::BuildPanicked(schema.name.clone())),
        };

        match &result {
            Ok(serializer) => {
                self.entries
                    .insert(fingerprint, Slot::Ready(Arc::downgrade(serializer)));
            }
            Err(e) => {
                warn!(%fingerprint, error = %e, "Serializer construction failed");
                self.entries.remove_if(&fingerprint, |_, slot| {
                    matches!(slot, Slot::Building(f) if Arc::ptr_eq(f, &flight))
                });
            }
        }

        flight.complete(result.clone());
        result
    }

    /// Number of constructions started so far.
    pub fn builds(&self) -> u64 {
        self.builds.load(Ordering::Relaxed)
    }

    /// Entries currently live or being built.
    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| match entry.value() {
                Slot::Ready(weak) => weak.strong_count() > 0,
                Slot::Building(_) => true,
            })
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::StructuredRecord;
    use crate::serializer::{FieldSchema, FieldType};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    fn other_schema() -> RecordSchema {
        RecordSchema {
            name: "orders".to_string(),
            fields: vec![FieldSchema {
                name: "id".to_string(),
                field_type: FieldType::Int64,
                optional: false,
            }],
        }
    }

    #[test]
    fn test_hit_returns_same_instance() {
        let cache = SerializerCache::json(false);
        let a = cache.get(&StructuredRecord::schema()).unwrap();
        let b = cache.get(&StructuredRecord::schema()).unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.builds(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_distinct_schemas_get_distinct_serializers() {
        let cache = SerializerCache::json(false);
        let a = cache.get(&StructuredRecord::schema()).unwrap();
        let b = cache.get(&other_schema()).unwrap();

        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_concurrent_get_builds_once() {
        let constructed = Arc::new(AtomicUsize::new(0));
        let counter = constructed.clone();
        let cache = Arc::new(SerializerCache::new(move |schema: &RecordSchema| {
            counter.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(50));
            RecordSerializer::build(schema)
        }));

        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    cache.get(&StructuredRecord::schema()).unwrap()
                })
            })
            .collect();
        let serializers: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(constructed.load(Ordering::SeqCst), 1);
        for s in &serializers {
            assert!(Arc::ptr_eq(s, &serializers[0]));
        }
    }

    #[test]
    fn test_failure_reaches_every_waiter_and_is_not_cached() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let cache = Arc::new(SerializerCache::new(move |schema: &RecordSchema| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(200));
            if n == 0 {
                Err(SerializerError::InvalidSchema {
                    schema: schema.name.clone(),
                    message: "registry unavailable".to_string(),
                })
            } else {
                RecordSerializer::build(schema)
            }
        }));

        let barrier = Arc::new(Barrier::new(4));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    cache.get(&StructuredRecord::schema()).map(|_| ())
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(results.iter().all(|r| r.is_err()));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(cache.is_empty());

        assert!(cache.get(&StructuredRecord::schema()).is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_dropped_serializer_is_evicted_and_rebuilt() {
        let cache = SerializerCache::json(false);
        let first = cache.get(&StructuredRecord::schema()).unwrap();
        let fingerprint = first.fingerprint();
        drop(first);

        assert!(cache.is_empty());

        let second = cache.get(&StructuredRecord::schema()).unwrap();
        assert_eq!(second.fingerprint(), fingerprint);
        assert_eq!(cache.builds(), 2);
        assert_eq!(second.schema(), &StructuredRecord::schema());
    }

    #[test]
    fn test_panicking_builder_fails_instead_of_hanging() {
        let cache: SerializerCache<RecordSerializer> =
            SerializerCache::new(|_: &RecordSchema| panic!("boom"));
        let err = cache.get(&StructuredRecord::schema()).unwrap_err();
        assert!(matches!(err, SerializerError::BuildPanicked(_)));
        assert!(cache.is_empty());
    }
}

//! Keyed pipeline storage with hit/miss accounting.

use super::key::PipelineKey;
use crate::error::Result;
use ash::vk;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

/// Counters for one keyed cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

/// One key's compiled pipeline, filled at most once.
#[derive(Default)]
struct Slot {
    pipeline: OnceLock<vk::Pipeline>,
    compile: Mutex<()>,
}

/// Map from structural key to compiled pipeline.
///
/// Entries are immutable once filled. Hits only take the map's read lock.
/// A miss inserts an empty slot and compiles under that slot's own lock, so
/// concurrent requests for one key compile it once while lookups of other
/// keys proceed.
pub(crate) struct KeyedCache<K: PipelineKey> {
    entries: RwLock<HashMap<K, Arc<Slot>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<K: PipelineKey> KeyedCache<K> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get_or_create(
        &self,
        key: &K,
        create: impl FnOnce() -> Result<vk::Pipeline>,
    ) -> Result<vk::Pipeline> {
        if let Some(pipeline) = self
            .entries
            .read()
            .get(key)
            .and_then(|slot| slot.pipeline.get())
        {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(*pipeline);
        }

        let slot = self
            .entries
            .write()
            .entry(key.clone())
            .or_default()
            .clone();

        let _compile = slot.compile.lock();
        if let Some(pipeline) = slot.pipeline.get() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(*pipeline);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        // A failed compile leaves the slot empty for the next request to retry.
        let pipeline = create()?;
        tracing::debug!("Created {} pipeline (key v{}): {:?}", K::KIND, K::VERSION, key);
        Ok(*slot.pipeline.get_or_init(|| pipeline))
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self
                .entries
                .read()
                .values()
                .filter(|slot| slot.pipeline.get().is_some())
                .count(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Remove every entry, returning the pipelines for destruction.
    pub fn drain(&self) -> Vec<vk::Pipeline> {
        self.entries
            .write()
            .drain()
            .filter_map(|(_, slot)| slot.pipeline.get().copied())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GpuError;
    use crate::pipeline::VertexInputKey;
    use ash::vk::Handle;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    fn key(topology: vk::PrimitiveTopology) -> VertexInputKey {
        VertexInputKey { topology }
    }

    #[test]
    fn second_lookup_hits() {
        let cache = KeyedCache::new();
        let a = cache
            .get_or_create(&key(vk::PrimitiveTopology::TRIANGLE_LIST), || {
                Ok(vk::Pipeline::from_raw(1))
            })
            .unwrap();
        let b = cache
            .get_or_create(&key(vk::PrimitiveTopology::TRIANGLE_LIST), || {
                panic!("cached key must not be recompiled")
            })
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(
            cache.stats(),
            CacheStats {
                entries: 1,
                hits: 1,
                misses: 1
            }
        );
    }

    #[test]
    fn failed_creation_caches_nothing() {
        let cache = KeyedCache::new();
        let err = cache.get_or_create(&key(vk::PrimitiveTopology::LINE_LIST), || {
            Err(GpuError::PipelineCreation("boom".to_string()))
        });
        assert!(err.is_err());
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn concurrent_requests_compile_once() {
        let cache = Arc::new(KeyedCache::<VertexInputKey>::new());
        let compiles = Arc::new(AtomicUsize::new(0));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let compiles = compiles.clone();
                std::thread::spawn(move || {
                    cache
                        .get_or_create(&key(vk::PrimitiveTopology::POINT_LIST), || {
                            compiles.fetch_add(1, Ordering::SeqCst);
                            Ok(vk::Pipeline::from_raw(9))
                        })
                        .unwrap()
                })
            })
            .collect();

        for thread in threads {
            assert_eq!(thread.join().unwrap(), vk::Pipeline::from_raw(9));
        }
        assert_eq!(compiles.load(Ordering::SeqCst), 1);
        assert_eq!(cache.drain().len(), 1);
    }

    #[test]
    fn hits_do_not_wait_for_other_keys_compiling() {
        let cache = Arc::new(KeyedCache::<VertexInputKey>::new());
        let cached = key(vk::PrimitiveTopology::TRIANGLE_LIST);
        cache
            .get_or_create(&cached, || Ok(vk::Pipeline::from_raw(1)))
            .unwrap();

        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let compiling = {
            let cache = cache.clone();
            std::thread::spawn(move || {
                cache
                    .get_or_create(&key(vk::PrimitiveTopology::LINE_STRIP), || {
                        started_tx.send(()).unwrap();
                        let _ = release_rx.recv_timeout(Duration::from_secs(2));
                        Ok(vk::Pipeline::from_raw(2))
                    })
                    .unwrap()
            })
        };

        started_rx.recv().unwrap();
        let start = Instant::now();
        let hit = cache.get_or_create(&cached, || panic!("cached key recompiled"));
        let waited = start.elapsed();
        release_tx.send(()).unwrap();

        assert_eq!(hit.unwrap(), vk::Pipeline::from_raw(1));
        assert!(waited < Duration::from_secs(1), "hit waited {waited:?}");
        assert_eq!(compiling.join().unwrap(), vk::Pipeline::from_raw(2));
        assert_eq!(cache.stats().entries, 2);
    }

    #[test]
    fn failed_creation_can_be_retried() {
        let cache = KeyedCache::new();
        let topology = key(vk::PrimitiveTopology::PATCH_LIST);
        assert!(cache
            .get_or_create(&topology, || Err(GpuError::PipelineCreation("boom".to_string())))
            .is_err());
        let pipeline = cache
            .get_or_create(&topology, || Ok(vk::Pipeline::from_raw(3)))
            .unwrap();
        assert_eq!(pipeline, vk::Pipeline::from_raw(3));
        assert_eq!(cache.stats().misses, 2);
        assert_eq!(cache.drain(), vec![vk::Pipeline::from_raw(3)]);
    }
}

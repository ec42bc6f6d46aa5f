//! Process-wide compiler context: the prepared-kernel cache, the schedule
//! table, and the tuning knobs they both read.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use lru::LruCache;
use once_cell::sync::Lazy;

use crate::config::TuningConfig;
use crate::error::Result;
use crate::exec::backend::PreparedKernel;
use crate::schedule::ScheduleTable;

/// Prepared kernels retained before LRU eviction kicks in.
const KERNEL_CACHE_CAPACITY: usize = 64;

/// Cache key for a prepared kernel. The structural fingerprint pins the
/// loop nest shape and types; the check signature pins which accesses are
/// instrumented, since demotion to full checking recompiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelKey {
    pub structural: u64,
    pub checks: u64,
}

/// Counter snapshot for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub builds: u64,
    pub entries: usize,
}

pub struct CompilerContext {
    config: TuningConfig,
    kernels: Mutex<LruCache<KernelKey, Arc<dyn PreparedKernel>>>,
    schedule: ScheduleTable,
    hits: AtomicU64,
    misses: AtomicU64,
    builds: AtomicU64,
}

impl CompilerContext {
    pub fn new(config: TuningConfig) -> CompilerContext {
        let capacity = NonZeroUsize::new(KERNEL_CACHE_CAPACITY)
            .unwrap_or(NonZeroUsize::MIN);
        CompilerContext {
            schedule: ScheduleTable::new(&config),
            config,
            kernels: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            builds: AtomicU64::new(0),
        }
    }

    /// Shared instance built once per process from the environment.
    pub fn shared() -> Arc<CompilerContext> {
        static CONTEXT: Lazy<Arc<CompilerContext>> =
            Lazy::new(|| Arc::new(CompilerContext::new(TuningConfig::global().clone())));
        Arc::clone(&CONTEXT)
    }

    pub fn config(&self) -> &TuningConfig {
        &self.config
    }

    pub fn schedule(&self) -> &ScheduleTable {
        &self.schedule
    }

    /// Look up a prepared kernel, building and caching it on a miss. The
    /// second element of the pair is true when the kernel was recycled from
    /// the cache. The builder runs outside the cache lock so slow device
    /// compiles do not serialize unrelated call-sites.
    pub fn obtain(
        &self,
        key: KernelKey,
        build: impl FnOnce() -> Result<Arc<dyn PreparedKernel>>,
    ) -> Result<(Arc<dyn PreparedKernel>, bool)> {
        if let Some(kernel) = self.lookup(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok((kernel, true));
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let kernel = build()?;
        self.builds.fetch_add(1, Ordering::Relaxed);
        self.lock().put(key, Arc::clone(&kernel));
        Ok((kernel, false))
    }

    pub fn lookup(&self, key: &KernelKey) -> Option<Arc<dyn PreparedKernel>> {
        self.lock().get(key).cloned()
    }

    pub fn cache_stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            builds: self.builds.load(Ordering::Relaxed),
            entries: self.lock().len(),
        }
    }

    /// Drop every cached kernel and schedule entry. Counters reset too, so
    /// tests can measure a single scenario.
    pub fn reset(&self) {
        self.lock().clear();
        self.schedule.reset();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.builds.store(0, Ordering::Relaxed);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruCache<KernelKey, Arc<dyn PreparedKernel>>> {
        self.kernels.lock().expect("kernel cache lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::bounds::ResolvedRange;
    use crate::error::OffloadError;
    use crate::exec::backend::LaunchReport;
    use crate::exec::device::DeviceHandle;
    use crate::symbols::Bindings;

    struct StubKernel(&'static str);

    impl PreparedKernel for StubKernel {
        fn entry(&self) -> &str {
            self.0
        }

        fn source(&self) -> &str {
            ""
        }

        fn execute(
            &self,
            _bindings: &Bindings,
            _ranges: &[ResolvedRange],
            _device: &DeviceHandle,
        ) -> Result<LaunchReport> {
            Err(OffloadError::unsupported("stub", "stub kernel cannot run"))
        }
    }

    #[test]
    fn obtain_builds_once_and_serves_hits() {
        let context = CompilerContext::new(TuningConfig::default());
        let key = KernelKey {
            structural: 0xfeed,
            checks: 1,
        };
        let (first, recycled) = context
            .obtain(key, || Ok(Arc::new(StubKernel("pl_a")) as Arc<dyn PreparedKernel>))
            .unwrap();
        assert!(!recycled);
        let (second, recycled) = context
            .obtain(key, || panic!("builder must not rerun on a hit"))
            .unwrap();
        assert!(recycled);
        assert_eq!(first.entry(), second.entry());
        let stats = context.cache_stats();
        assert_eq!(stats.builds, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn check_signature_distinguishes_kernels() {
        let context = CompilerContext::new(TuningConfig::default());
        let auto = KernelKey {
            structural: 7,
            checks: 10,
        };
        let all = KernelKey {
            structural: 7,
            checks: 20,
        };
        context
            .obtain(auto, || Ok(Arc::new(StubKernel("pl_auto")) as Arc<dyn PreparedKernel>))
            .unwrap();
        context
            .obtain(all, || Ok(Arc::new(StubKernel("pl_all")) as Arc<dyn PreparedKernel>))
            .unwrap();
        assert_eq!(context.cache_stats().entries, 2);
    }

    #[test]
    fn failed_builds_are_not_cached() {
        let context = CompilerContext::new(TuningConfig::default());
        let key = KernelKey {
            structural: 3,
            checks: 0,
        };
        let err = context.obtain(key, || Err(OffloadError::compilation("no device")));
        assert!(err.is_err());
        assert_eq!(context.cache_stats().entries, 0);
        let ok = context.obtain(key, || {
            Ok(Arc::new(StubKernel("pl_retry")) as Arc<dyn PreparedKernel>)
        });
        assert!(ok.is_ok());
        assert_eq!(context.cache_stats().builds, 1);
    }

    #[test]
    fn reset_clears_entries_and_counters() {
        let context = CompilerContext::new(TuningConfig::default());
        let key = KernelKey {
            structural: 9,
            checks: 0,
        };
        context
            .obtain(key, || Ok(Arc::new(StubKernel("pl_x")) as Arc<dyn PreparedKernel>))
            .unwrap();
        context.reset();
        assert_eq!(context.cache_stats(), CacheStats::default());
    }
}

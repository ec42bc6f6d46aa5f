//! Runtime backend registry. Backend crates register themselves at link
//! time through [`BACKEND_REGISTRARS`]; selection by name or platform
//! preference happens here so nothing upstream names a concrete backend
//! type.

use std::collections::HashMap;
use std::sync::{Arc, Once, OnceLock, RwLock};

use linkme::distributed_slice;

use crate::config::{PlatformKind, TuningConfig};
use crate::error::Result;
use crate::exec::backend::OffloadBackend;
use crate::telemetry::debug_log;

/// Factory producing a backend instance. Construction may fail, e.g. when
/// a native driver library is not present.
pub type BackendConstructor = Box<dyn Fn() -> Result<Arc<dyn OffloadBackend>> + Send + Sync>;

/// Registrar hooks contributed by backend crates. Each runs once, before
/// the first registry lookup.
#[distributed_slice]
pub static BACKEND_REGISTRARS: [fn()] = [..];

struct BackendRegistry {
    constructors: RwLock<HashMap<String, BackendConstructor>>,
    /// Built instances, one per name. Backends carry device state and
    /// kernel caches, so they are constructed once and shared.
    instances: RwLock<HashMap<String, Arc<dyn OffloadBackend>>>,
}

impl BackendRegistry {
    fn new() -> Self {
        BackendRegistry {
            constructors: RwLock::new(HashMap::new()),
            instances: RwLock::new(HashMap::new()),
        }
    }
}

static GLOBAL_REGISTRY: OnceLock<BackendRegistry> = OnceLock::new();

fn global_registry() -> &'static BackendRegistry {
    GLOBAL_REGISTRY.get_or_init(BackendRegistry::new)
}

/// Run every link-time registrar exactly once.
pub fn ensure_registered() {
    static RUN: Once = Once::new();
    RUN.call_once(|| {
        for registrar in BACKEND_REGISTRARS {
            registrar();
        }
    });
}

/// Register a backend by name. Backend crates call this from their
/// registrar function.
pub fn register_backend<F>(name: impl Into<String>, constructor: F)
where
    F: Fn() -> Result<Arc<dyn OffloadBackend>> + Send + Sync + 'static,
{
    global_registry()
        .constructors
        .write()
        .expect("backend registry lock poisoned")
        .insert(name.into(), Box::new(constructor));
}

/// Build or fetch the named backend. `None` when the name was never
/// registered; `Some(Err(..))` when construction failed.
pub fn create_backend(name: &str) -> Option<Result<Arc<dyn OffloadBackend>>> {
    ensure_registered();
    let registry = global_registry();
    if let Some(instance) = registry
        .instances
        .read()
        .expect("backend registry lock poisoned")
        .get(name)
    {
        return Some(Ok(Arc::clone(instance)));
    }
    let constructors = registry
        .constructors
        .read()
        .expect("backend registry lock poisoned");
    let constructor = constructors.get(name)?;
    let built = constructor();
    if let Ok(instance) = &built {
        registry
            .instances
            .write()
            .expect("backend registry lock poisoned")
            .insert(name.to_string(), Arc::clone(instance));
    }
    Some(built)
}

pub fn list_backends() -> Vec<String> {
    ensure_registered();
    let mut names: Vec<String> = global_registry()
        .constructors
        .read()
        .expect("backend registry lock poisoned")
        .keys()
        .cloned()
        .collect();
    names.sort_unstable();
    names
}

pub fn has_backend(name: &str) -> bool {
    ensure_registered();
    global_registry()
        .constructors
        .read()
        .expect("backend registry lock poisoned")
        .contains_key(name)
}

/// Candidate backend names for a platform preference, best first.
fn platform_candidates(platform: PlatformKind) -> &'static [&'static str] {
    match platform {
        PlatformKind::Native => &["opencl"],
        PlatformKind::Sim => &["sim"],
        PlatformKind::Auto => &["opencl", "sim"],
    }
}

/// The process-wide backend chosen from the configured platform
/// preference. `None` when no candidate constructs, in which case every
/// call runs on the baseline path.
pub fn default_backend() -> Option<Arc<dyn OffloadBackend>> {
    static DEFAULT: OnceLock<Option<Arc<dyn OffloadBackend>>> = OnceLock::new();
    DEFAULT
        .get_or_init(|| {
            let cfg = TuningConfig::global();
            for name in platform_candidates(cfg.platform) {
                match create_backend(name) {
                    Some(Ok(backend)) => {
                        debug_log(cfg.debug_level, 1, || {
                            format!("selected backend '{}'", backend.name())
                        });
                        return Some(backend);
                    }
                    Some(Err(e)) => {
                        debug_log(cfg.debug_level, 1, || {
                            format!("backend '{name}' unavailable: {e}")
                        });
                    }
                    None => {}
                }
            }
            None
        })
        .clone()
}

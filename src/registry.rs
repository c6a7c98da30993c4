//! The process-wide registry of [`crate::DiskCache`] instances.
//!
//! Two independently constructed [`crate::DiskCache`] handles pointing at the
//! same directory must share their intra-process ongoing-downloads map, or
//! they would each believe themselves leader for the same URL digest. This
//! module is the only process-global state in the crate, solving that by
//! keying a process-wide map on the cache directory.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    path::PathBuf,
};

use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::error::CacheError;

struct RegistryEntry {
    type_id: TypeId,
    type_name: &'static str,
    cache: Box<dyn Any + Send + Sync>,
}

static REGISTRY: OnceCell<Mutex<HashMap<PathBuf, RegistryEntry>>> = OnceCell::new();

fn registry() -> &'static Mutex<HashMap<PathBuf, RegistryEntry>> {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Returns the existing registered cache for `dir` if its key type matches,
/// constructs and registers a new one via `make` otherwise, or fails with
/// [`CacheError::CacheUrlTypeMismatch`] if `dir` is registered under a
/// different key type.
pub(crate) fn get_or_insert_with<U, C, F>(dir: &std::path::Path, make: F) -> Result<C, CacheError>
where
    U: 'static,
    C: Clone + Send + Sync + 'static,
    F: FnOnce() -> C,
{
    let mut guard = registry().lock();
    if let Some(entry) = guard.get(dir) {
        return if entry.type_id == TypeId::of::<U>() {
            Ok(entry
                .cache
                .downcast_ref::<C>()
                .expect("type id matched but downcast failed: registry corrupted")
                .clone())
        } else {
            Err(CacheError::CacheUrlTypeMismatch {
                cache_dir: dir.to_path_buf(),
                expected: entry.type_name,
                found: std::any::type_name::<U>(),
            })
        };
    }

    let cache = make();
    guard.insert(
        dir.to_path_buf(),
        RegistryEntry {
            type_id: TypeId::of::<U>(),
            type_name: std::any::type_name::<U>(),
            cache: Box::new(cache.clone()),
        },
    );
    Ok(cache)
}

#[cfg(test)]
pub(crate) fn clear_for_tests() {
    registry().lock().clear();
}

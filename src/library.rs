//! The Library Registry: a handle cache from canonical path to
//! opened dynamic library image, with refcounted loads/unloads and
//! lazy, per-call symbol resolution.
//!
//! Uses `dlopen2` in its low-level `raw::Library` mode rather than a
//! compile-time `WrapperApi` derive bound to a fixed ABI: here the set
//! of symbols is only known at request time, one `function_name` per
//! `call_function`.

use crate::error::{ExecutorError, Result};
use dlopen2::raw::Library;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::ffi::c_void;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

struct LoadedLibrary {
    path: PathBuf,
    handle: Library,
    refcount: usize,
    /// Calls currently executing against this image; an
    /// `unload_library` while this is non-zero would free memory a
    /// foreign call is still running against.
    in_flight: Arc<AtomicUsize>,
}

/// Held for the duration of one `call_function` against a library;
/// decrements the image's in-flight counter on drop.
pub struct CallGuard(Arc<AtomicUsize>);

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Process-wide directory of loaded images, keyed by the identifier
/// minted on first load.
pub struct LibraryRegistry {
    by_id: RwLock<HashMap<String, LoadedLibrary>>,
}

impl Default for LibraryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl LibraryRegistry {
    pub fn new() -> Self {
        LibraryRegistry {
            by_id: RwLock::new(HashMap::new()),
        }
    }

    /// `load_library(path)`: opens the image via the platform
    /// loader, mints a new id, and records `(id, path, handle,
    /// refcount=1)`. Reloading the same canonical path bumps the
    /// refcount of the existing id instead of opening a second handle.
    pub fn load(&self, path: &str) -> Result<String> {
        let canonical = canonicalize(path);

        {
            let mut by_id = self.by_id.write();
            if let Some((id, entry)) = by_id
                .iter_mut()
                .find(|(_, entry)| entry.path == canonical)
            {
                entry.refcount += 1;
                return Ok(id.clone());
            }
        }

        // SAFETY: dlopen of a path supplied over the control channel; the
        // executor trusts the controller and does not sandbox it.
        let handle = unsafe { Library::open(&canonical) }
            .map_err(|err| ExecutorError::LoadFailed(err.to_string()))?;

        let id = Uuid::new_v4().to_string();
        let mut by_id = self.by_id.write();
        by_id.insert(
            id.clone(),
            LoadedLibrary {
                path: canonical,
                handle,
                refcount: 1,
                in_flight: Arc::new(AtomicUsize::new(0)),
            },
        );
        log::info!("loaded library {path} as {id}");
        Ok(id)
    }

    /// `unload_library(id)`: decrements the refcount, closing the
    /// image at zero. Refuses while a call is still executing against
    /// it.
    pub fn unload(&self, id: &str) -> Result<()> {
        let mut by_id = self.by_id.write();
        let entry = by_id
            .get_mut(id)
            .ok_or_else(|| ExecutorError::LibraryNotFound(id.to_string()))?;

        if entry.in_flight.load(Ordering::SeqCst) > 0 {
            return Err(ExecutorError::LibraryBusy(id.to_string()));
        }

        entry.refcount -= 1;
        if entry.refcount == 0 {
            by_id.remove(id);
            log::info!("unloaded library {id}");
        }
        Ok(())
    }

    /// Resolves `function_name` in the image loaded as `library_id`,
    /// lazily on each call, and marks the image busy for the returned
    /// guard's lifetime.
    pub fn resolve_symbol(&self, library_id: &str, function_name: &str) -> Result<(*const c_void, CallGuard)> {
        let by_id = self.by_id.read();
        let entry = by_id
            .get(library_id)
            .ok_or_else(|| ExecutorError::LibraryNotFound(library_id.to_string()))?;

        let symbol = unsafe { entry.handle.symbol::<*const c_void>(function_name) }
            .map_err(|_| ExecutorError::SymbolNotFound(function_name.to_string()))?;
        entry.in_flight.fetch_add(1, Ordering::SeqCst);
        Ok((symbol, CallGuard(entry.in_flight.clone())))
    }
}

fn canonicalize(path: &str) -> PathBuf {
    Path::new(path)
        .canonicalize()
        .unwrap_or_else(|_| PathBuf::from(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_reports_missing_file() {
        let registry = LibraryRegistry::new();
        let err = registry.load("/nonexistent/definitely/not/here.so").unwrap_err();
        assert!(matches!(err, ExecutorError::LoadFailed(_)));
    }

    #[test]
    fn unload_unknown_id_is_library_not_found() {
        let registry = LibraryRegistry::new();
        let err = registry.unload("not-an-id").unwrap_err();
        assert!(matches!(err, ExecutorError::LibraryNotFound(_)));
    }

    #[test]
    fn loading_the_same_path_twice_shares_one_id_and_refcounts() {
        let registry = LibraryRegistry::new();
        let first = registry.load("libc.so.6");
        // Not every test environment carries libc.so.6 under that exact
        // soname; skip gracefully rather than fail the build machine.
        let Ok(first) = first else { return };
        let second = registry.load("libc.so.6").unwrap();
        assert_eq!(first, second);
        registry.unload(&first).unwrap();
        registry.unload(&second).unwrap();
        assert!(registry.unload(&first).is_err());
    }
}

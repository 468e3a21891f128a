//! A long-running executor that exposes arbitrary C dynamic libraries
//! over a length-framed JSON control channel.
//!
//! A controller connects over a Unix domain socket and, without this
//! crate ever being recompiled against the target library, can load a
//! `.so`/`.dylib`/`.dll`, describe aggregate types and function
//! signatures in JSON, call into it through `libffi`, and register
//! callbacks the target library can call back into. See
//! `SPEC_FULL.md` for the full protocol.

pub mod arena;
pub mod callback;
pub mod dispatch;
pub mod error;
pub mod ffi_type;
pub mod library;
pub mod protocol;
pub mod router;
pub mod state;
pub mod supervisor;
pub mod transport;
pub mod types;
pub mod value;

pub use error::{ExecutorError, Result};
pub use state::ExecutorState;

/// Support for the integration tests under `tests/`; not part of the
/// protocol surface.
pub mod testing {
    use std::path::PathBuf;

    /// Path to the `libfixture.so` built by `build.rs` from
    /// `tests/fixtures/fixture.c`, or `None` if no C toolchain was
    /// available to build it.
    pub fn fixture_library_path() -> Option<PathBuf> {
        let path = PathBuf::from(env!("OUT_DIR")).join("libfixture.so");
        path.exists().then_some(path)
    }
}

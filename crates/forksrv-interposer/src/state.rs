//! Process-wide state for the in-target server.
//!
//! Everything here is, by construction, per-target-process: it lives inside
//! the shared library once it's mapped into the target and is never meant to
//! be shared across processes. A single one-shot guard
//! ([`std::sync::Once`]) protects `forkserver_init` against running twice in
//! one process, mirroring the `init_done` flag from the original source
//! (`instrumentation/forkserver.c`).

use std::sync::Once;

/// Guards `forkserver_init` so it runs at most once per process. Children
/// that are released past the gate never re-enter it, matching `init_done`
/// in the original.
pub(crate) static INIT: Once = Once::new();

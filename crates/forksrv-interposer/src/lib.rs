//! Target-side half of a forkserver-based execution harness.
//!
//! Built as a `cdylib` and preloaded into the target via `LD_PRELOAD`
//! (section 6). This library never logs and never installs signal handlers
//! (design notes, section 9): it runs inside a process whose owner may have
//! already claimed both, and it must behave identically whether or not it is
//! actually driven by a forkserver-aware fuzzer.
//!
//! Two interposition strategies are available, chosen at build time via
//! Cargo features (`entry-interposition`, the default; or
//! `custom-function-interposition`). Exactly one is compiled in: both
//! together would install two competing hooks, and neither means the target
//! never gets the server, which the spec treats as a build-time
//! configuration error rather than a runtime fallback.

#[cfg(all(feature = "entry-interposition", not(target_os = "linux")))]
compile_error!(
    "entry-interposition hooks glibc's __libc_start_main and is only available on Linux; \
     build with `--no-default-features --features custom-function-interposition` instead"
);

#[cfg(not(any(feature = "entry-interposition", feature = "custom-function-interposition")))]
compile_error!(
    "forksrv-interposer requires exactly one interposition strategy; enable \
     `entry-interposition` (default, glibc only) or `custom-function-interposition`"
);

#[cfg(all(feature = "entry-interposition", feature = "custom-function-interposition"))]
compile_error!(
    "enable only one of `entry-interposition` and `custom-function-interposition`, not both"
);

#[cfg(feature = "entry-interposition")]
mod entry;

#[cfg(feature = "custom-function-interposition")]
mod custom;

mod server;
mod state;

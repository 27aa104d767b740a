//! Custom-function interposition (C1, secondary strategy): hook an
//! arbitrary, build-time-configured function instead of
//! `__libc_start_main`, running the server either before or after the
//! hooked call.
//!
//! Ported from the `USE_LIBC_START_MAIN == 0` branch of
//! `instrumentation/forkserver.c`, which hooks a generic 8-`void*`-argument
//! function by name via `dlsym`. Kept as a fallback for targets whose
//! startup never reaches a hookable `__libc_start_main` (e.g. statically
//! linked or non-glibc targets), at the cost of needing the hook point named
//! at build time.
//!
//! `entry.rs` can hardcode its exported symbol name because
//! `__libc_start_main` is fixed. Here the hooked name is only known at build
//! time, so the export itself can't be written as a literal `#[unsafe(...)]`
//! attribute in this file - `build.rs` generates a tiny shim under
//! `OUT_DIR/hook_export.rs` that re-exports [`forksrv_custom_hook`] under the
//! literal `FORKSRV_HOOK_FUNCTION` name (the C original does the same thing
//! with `#define NEW_FUNCTION FUNCTION`), and that shim is pulled in below via
//! `include!`.

use std::{
    ffi::{CString, c_void},
    sync::OnceLock,
};

use crate::{server, state::INIT};

/// Name of the function to hook. Must be set at build time when the
/// `custom-function-interposition` feature replaces the default
/// entry-interposition strategy.
const HOOK_FUNCTION_NAME: &str = match option_env!("FORKSRV_HOOK_FUNCTION") {
    Some(name) => name,
    None => panic!(
        "FORKSRV_HOOK_FUNCTION must be set at build time when the \
         custom-function-interposition feature is enabled"
    ),
};

/// Whether to run the server before or after the hooked call, set at build
/// time via `FORKSRV_HOOK_RUN_BEFORE=1`.
const RUN_BEFORE: bool = option_env!("FORKSRV_HOOK_RUN_BEFORE").is_some();

type GenericFn = extern "C" fn(
    *mut c_void,
    *mut c_void,
    *mut c_void,
    *mut c_void,
    *mut c_void,
    *mut c_void,
    *mut c_void,
    *mut c_void,
) -> *mut c_void;

static ORIG_FUNC: OnceLock<GenericFn> = OnceLock::new();

fn resolve_orig() -> GenericFn {
    *ORIG_FUNC.get_or_init(|| {
        let name = CString::new(HOOK_FUNCTION_NAME).expect("no interior NUL");
        // SAFETY: `RTLD_NEXT` resolves to the next definition of this symbol
        // after ours, i.e. the target's real implementation.
        let sym = unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr()) };
        assert!(
            !sym.is_null(),
            "could not resolve the hooked function {HOOK_FUNCTION_NAME}"
        );
        // SAFETY: the caller configured `HOOK_FUNCTION_NAME` to match this
        // generic 8-argument ABI.
        unsafe { std::mem::transmute::<*mut c_void, GenericFn>(sym) }
    })
}

fn run_server_once() {
    INIT.call_once(|| {
        // SAFETY: guarded by `Once`, runs single-threaded before/after the
        // hooked call with no concurrent access to the well-known fds.
        unsafe { server::forkserver_init() };
    });
}

/// Overrides the function named by `FORKSRV_HOOK_FUNCTION`.
///
/// Not exported under its own name: `include!`d below, [`__forksrv_hook_export`]
/// is the symbol the dynamic linker actually sees, under the literal name
/// `build.rs` baked in.
///
/// # Safety
/// Must be invoked with arguments matching the real hooked function's ABI;
/// the generic 8-`void*` signature only works for functions that are
/// themselves compatible with it.
unsafe extern "C" fn forksrv_custom_hook(
    a0: *mut c_void,
    a1: *mut c_void,
    a2: *mut c_void,
    a3: *mut c_void,
    a4: *mut c_void,
    a5: *mut c_void,
    a6: *mut c_void,
    a7: *mut c_void,
) -> *mut c_void {
    if RUN_BEFORE {
        run_server_once();
    }

    let orig = resolve_orig();
    let ret = orig(a0, a1, a2, a3, a4, a5, a6, a7);

    if !RUN_BEFORE {
        run_server_once();
    }

    ret
}

include!(concat!(env!("OUT_DIR"), "/hook_export.rs"));

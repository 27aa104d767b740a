//! Entry interposition (C1, primary strategy): hook `__libc_start_main` so
//! the server runs after the C runtime has finished initializing (linker
//! relocations, global constructors) but before user `main`.
//!
//! Only available on glibc/ELF, where `__libc_start_main` has the signature
//! hooked below. Ported from the `USE_LIBC_START_MAIN` branch of
//! `instrumentation/forkserver.c`.

use std::{
    ffi::{CString, c_char, c_int, c_void},
    sync::OnceLock,
};

use crate::{server, state::INIT};

type MainFn = extern "C" fn(c_int, *mut *mut c_char, *mut *mut c_char) -> c_int;

type StartMainFn = unsafe extern "C" fn(
    MainFn,
    c_int,
    *mut *mut c_char,
    Option<extern "C" fn()>,
    Option<extern "C" fn()>,
    Option<extern "C" fn()>,
    *mut c_void,
) -> c_int;

/// The real `__libc_start_main`, resolved once via `dlsym(RTLD_NEXT, ...)`.
static ORIG_START_MAIN: OnceLock<StartMainFn> = OnceLock::new();

/// The target's real `main`, captured when we're called in place of it.
static ORIG_MAIN: OnceLock<MainFn> = OnceLock::new();

fn resolve_orig_start_main() -> StartMainFn {
    *ORIG_START_MAIN.get_or_init(|| {
        let name = CString::new("__libc_start_main").expect("no interior NUL");
        // SAFETY: `RTLD_NEXT` asks the dynamic linker for the next
        // definition of this symbol after ours, which is the genuine libc
        // implementation as long as this library is loaded via the preload
        // mechanism (never linked directly).
        let sym = unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr()) };
        assert!(!sym.is_null(), "could not resolve the real __libc_start_main");
        // SAFETY: the resolved symbol has the documented glibc signature.
        unsafe { std::mem::transmute::<*mut c_void, StartMainFn>(sym) }
    })
}

/// Overrides libc's `__libc_start_main`. Substitutes [`fake_main`] for the
/// real `main` so the runtime calls us first.
///
/// # Safety
/// Must only ever be invoked once, by the C startup code itself, with the
/// arguments it is documented to pass.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __libc_start_main(
    main: MainFn,
    argc: c_int,
    argv: *mut *mut c_char,
    init: Option<extern "C" fn()>,
    fini: Option<extern "C" fn()>,
    rtld_fini: Option<extern "C" fn()>,
    stack_end: *mut c_void,
) -> c_int {
    let _ = ORIG_MAIN.set(main);
    let orig_start_main = resolve_orig_start_main();
    unsafe { orig_start_main(fake_main, argc, argv, init, fini, rtld_fini, stack_end) }
}

/// Stands in for the target's `main`. Runs the server exactly once, then
/// tail-calls the real `main`.
extern "C" fn fake_main(argc: c_int, argv: *mut *mut c_char, envp: *mut *mut c_char) -> c_int {
    INIT.call_once(|| {
        // SAFETY: called at most once (guarded by `Once`), single-threaded,
        // before user code has touched the well-known fds.
        unsafe { server::forkserver_init() };
    });

    let main = *ORIG_MAIN
        .get()
        .expect("fake_main invoked without __libc_start_main having run first");
    main(argc, argv, envp)
}

//! Generates the exported shim for `custom-function-interposition`.
//!
//! `#[export_name]` needs a string literal, so the build-time
//! `FORKSRV_HOOK_FUNCTION` name can't be spliced in from within `custom.rs`
//! itself (`option_env!` only gives a `&str` usable in `const` contexts, not
//! in attribute position). Instead this writes a one-function source file
//! under `OUT_DIR` with the literal name baked in, which `custom.rs` pulls in
//! via `include!`.

use std::{env, fs, path::Path};

fn main() {
    println!("cargo::rerun-if-env-changed=FORKSRV_HOOK_FUNCTION");

    let out_dir = env::var_os("OUT_DIR").expect("OUT_DIR is set by cargo");
    let dest = Path::new(&out_dir).join("hook_export.rs");

    if env::var_os("CARGO_FEATURE_CUSTOM_FUNCTION_INTERPOSITION").is_none() {
        // entry-interposition is active; custom.rs isn't compiled, so the
        // include! target doesn't need to exist.
        fs::write(&dest, "").expect("writing empty hook_export.rs");
        return;
    }

    let hook_name = env::var("FORKSRV_HOOK_FUNCTION").unwrap_or_else(|_| {
        panic!(
            "FORKSRV_HOOK_FUNCTION must be set at build time when the \
             custom-function-interposition feature is enabled"
        )
    });
    assert!(
        hook_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_'),
        "FORKSRV_HOOK_FUNCTION must be a valid C identifier, got {hook_name:?}"
    );

    let generated = format!(
        r#"/// Generated by build.rs from `FORKSRV_HOOK_FUNCTION`: re-exports
/// [`forksrv_custom_hook`] under the configured symbol name, so the dynamic
/// linker resolves the target's call to that name to this library instead of
/// the target's own definition.
///
/// # Safety
/// Must be invoked with arguments matching the hooked function's real ABI.
#[unsafe(export_name = "{hook_name}")]
pub unsafe extern "C" fn __forksrv_hook_export(
    a0: *mut std::ffi::c_void,
    a1: *mut std::ffi::c_void,
    a2: *mut std::ffi::c_void,
    a3: *mut std::ffi::c_void,
    a4: *mut std::ffi::c_void,
    a5: *mut std::ffi::c_void,
    a6: *mut std::ffi::c_void,
    a7: *mut std::ffi::c_void,
) -> *mut std::ffi::c_void {{
    unsafe {{ forksrv_custom_hook(a0, a1, a2, a3, a4, a5, a6, a7) }}
}}
"#
    );

    fs::write(&dest, generated).expect("writing generated hook_export.rs");
}

//! Per-architecture trampoline and context-switch assembly. x86-64 only;
//! other instruction sets are rejected at build time below.

#[cfg(not(target_arch = "x86_64"))]
compile_error!("stackful-coroutine is x86-64 only; no port exists for this target_arch");

cfg_if::cfg_if! {
    if #[cfg(windows)] {
        mod x86_64_windows;
        pub(crate) use x86_64_windows::*;
    } else {
        mod x86_64_unix;
        pub(crate) use x86_64_unix::*;
    }
}

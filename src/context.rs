//! Machine context and the context switch.
//!
//! [`MachineContext`] is the opaque, 16-byte-aligned record of
//! callee-saved CPU state needed to suspend and later resume one side of
//! a switch; [`switch`] is the full-barrier context switch built on top
//! of the per-architecture assembly in `arch/`.

use std::arch::x86_64::{_mm_mfence, _mm_lfence};

/// A 16-byte-aligned `xmm` register image. Plain `[u64; 2]` is only
/// 8-byte aligned, which is not good enough for `movdqa` (an *aligned*
/// move) even inside a struct that is itself 16-byte aligned overall —
/// the compiler only inserts enough padding before a field to satisfy
/// that field's own alignment requirement.
#[cfg(windows)]
#[repr(align(16))]
#[derive(Clone, Copy)]
struct Xmm128([u64; 2]);

cfg_if::cfg_if! {
    if #[cfg(windows)] {
        /// Non-volatile CPU state sufficient to resume execution at an
        /// arbitrary point, per the Windows x64 calling convention.
        ///
        /// Field order matches the save/restore order of
        /// `arch::x86_64_windows::switch`: GPRs and `rsp` are saved first,
        /// then restored last, so that `rsp` is loaded only once the rest
        /// of `to` has already been read out of memory into registers.
        #[repr(C, align(16))]
        #[derive(Clone, Copy)]
        pub(crate) struct MachineContext {
            pub rip: u64,
            pub rsp: u64,
            pub rbp: u64,
            pub rbx: u64,
            /// Callee-saved on Win64, unlike the SysV ABI where they are
            /// volatile.
            pub rdi: u64,
            pub rsi: u64,
            pub r12: u64,
            pub r13: u64,
            pub r14: u64,
            pub r15: u64,
            pub mxcsr: u32,
            pub fpcw: u16,
            _pad: u16,
            /// xmm6-xmm15, callee-saved on Windows x64.
            pub xmm: [Xmm128; 10],
            /// TIB fields read from `gs:[0x30]` at offsets 0x08, 0x10,
            /// 0x1478, 0x20 respectively: stack base, stack limit,
            /// deallocation stack, and fiber-local storage.
            pub stack_base: u64,
            pub stack_limit: u64,
            pub deallocation_stack: u64,
            pub fiber_storage: u64,
        }
    } else {
        /// Non-volatile CPU state sufficient to resume execution at an
        /// arbitrary point, per the SysV x86-64 calling convention.
        #[repr(C, align(16))]
        #[derive(Clone, Copy)]
        pub(crate) struct MachineContext {
            pub rip: u64,
            pub rsp: u64,
            pub rbp: u64,
            pub rbx: u64,
            pub r12: u64,
            pub r13: u64,
            pub r14: u64,
            pub r15: u64,
            pub mxcsr: u32,
            pub fpcw: u16,
            _pad: u16,
        }
    }
}

impl MachineContext {
    pub const fn zeroed() -> MachineContext {
        cfg_if::cfg_if! {
            if #[cfg(windows)] {
                MachineContext {
                    rip: 0, rsp: 0, rbp: 0, rbx: 0,
                    rdi: 0, rsi: 0,
                    r12: 0, r13: 0, r14: 0, r15: 0,
                    mxcsr: 0x1F80, fpcw: 0x037F, _pad: 0,
                    xmm: [Xmm128([0; 2]); 10],
                    stack_base: 0, stack_limit: 0,
                    deallocation_stack: 0, fiber_storage: 0,
                }
            } else {
                MachineContext {
                    rip: 0, rsp: 0, rbp: 0, rbx: 0,
                    r12: 0, r13: 0, r14: 0, r15: 0,
                    mxcsr: 0x1F80, fpcw: 0x037F, _pad: 0,
                }
            }
        }
    }

    /// Seed a synthetic context so that the first [`switch`] into it lands
    /// in `entry` with `rsp == sp` and `r13`/`r14` preloaded with the
    /// coroutine handle and packed-arguments pointers. `entry` is always
    /// the trampoline, never the user body directly.
    pub fn synthetic(entry: unsafe extern "C" fn(), sp: *mut u8, handle: *mut u8, packed_args: *mut u8) -> MachineContext {
        debug_assert_eq!(sp as usize % 16, 0, "coroutine stack pointer must be 16-byte aligned");
        let mut ctx = MachineContext::zeroed();
        ctx.rip = entry as usize as u64;
        ctx.rsp = sp as usize as u64;
        ctx.r13 = handle as usize as u64;
        ctx.r14 = packed_args as usize as u64;
        ctx
    }
}

/// Save the non-volatile state of the running side into `from`, load it
/// from `to`, and `jmp` to `to.rip`. Wrapped in a full memory barrier on
/// both sides to inhibit the compiler and CPU from reordering memory
/// operations across the switch.
///
/// # Safety
/// `to` must describe a valid, live machine state (either produced by
/// [`MachineContext::synthetic`] or previously saved into by a prior call
/// to `switch`), and the stack it points into must remain valid for the
/// duration the switched-to side runs.
#[inline(never)]
pub(crate) unsafe fn switch(from: *mut MachineContext, to: *const MachineContext) {
    // Safety: `_mm_mfence`/`_mm_lfence` have no preconditions beyond SSE2,
    // which x86-64 guarantees unconditionally.
    unsafe {
        _mm_mfence();
        _mm_lfence();
        crate::arch::switch_context(from, to);
        _mm_mfence();
        _mm_lfence();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zeroed_context_has_default_fp_mode() {
        let ctx = MachineContext::zeroed();
        assert_eq!(ctx.mxcsr, 0x1F80);
        assert_eq!(ctx.fpcw, 0x037F);
    }

    #[test]
    fn machine_context_is_16_byte_aligned() {
        assert_eq!(std::mem::align_of::<MachineContext>() % 16, 0);
    }

    #[cfg(windows)]
    #[test]
    fn xmm_field_is_16_byte_aligned() {
        assert_eq!(std::mem::offset_of!(MachineContext, xmm) % 16, 0);
    }
}

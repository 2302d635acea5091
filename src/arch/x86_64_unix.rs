//! x86-64 SysV (Linux, macOS) context switch and trampoline.
//!
//! Uses `#[naked]`/`naked_asm!` with `core::mem::offset_of!`-derived
//! field offsets rather than hardcoded magic numbers, the same idiom
//! fiber-style context switches in the ecosystem use. No DWARF CFI
//! bridging is needed here since this crate never unwinds across a
//! switch.

use crate::context::MachineContext;
use std::arch::naked_asm;
use std::mem::offset_of;

pub(crate) const STACK_ALIGNMENT: usize = 16;

/// First two SysV integer argument/callee-saved handoff registers used by
/// [`crate::context::MachineContext::synthetic`] to preload the coroutine
/// handle and packed-arguments pointers.
pub(crate) const PRELOAD_REGS: (&str, &str) = ("r13", "r14");

/// Save the running side's non-volatile state into `from`, load `to`, and
/// jump to `to.rip`. Entered by `call` the first time; re-entered by a
/// `jmp` into the `2:` label below on every subsequent switch back into
/// this side.
///
/// # Safety
/// See [`crate::context::switch`].
#[naked]
pub(crate) unsafe extern "C" fn switch_context(from: *mut MachineContext, to: *const MachineContext) {
    // Safety: inline assembly implementing the documented save/restore
    // order; `from` arrives in rdi, `to` in rsi per the SysV ABI.
    unsafe {
        naked_asm!(
            ".balign 16",
            // Step 1: the resume address for `from` is the instruction
            // right after this switch, i.e. the `2:` label below.
            "lea rax, [rip + 2f]",
            "mov [rdi + {RIP}], rax",
            // Step 2: callee-saved GPRs, rsp, MXCSR, x87 control word.
            "mov [rdi + {RSP}], rsp",
            "mov [rdi + {RBP}], rbp",
            "mov [rdi + {RBX}], rbx",
            "mov [rdi + {R12}], r12",
            "mov [rdi + {R13}], r13",
            "mov [rdi + {R14}], r14",
            "mov [rdi + {R15}], r15",
            "stmxcsr [rdi + {MXCSR}]",
            "fnstcw [rdi + {FPCW}]",
            // Step 3: load `to`'s fields in the reverse order (x87 cw,
            // then MXCSR, then GPRs, `rsp` last of all).
            "fldcw [rsi + {FPCW}]",
            "ldmxcsr [rsi + {MXCSR}]",
            "mov r15, [rsi + {R15}]",
            "mov r14, [rsi + {R14}]",
            "mov r13, [rsi + {R13}]",
            "mov r12, [rsi + {R12}]",
            "mov rbx, [rsi + {RBX}]",
            "mov rbp, [rsi + {RBP}]",
            "mov rax, [rsi + {RIP}]",
            "mov rsp, [rsi + {RSP}]",
            // Step 4: transfer control. A `jmp`, not a `call`/`ret`, so the
            // CPU's return-address predictor is never fed a mismatched
            // pair — the trampoline below is entered the same way for the
            // same reason.
            "jmp rax",
            // Landed on by a future switch whose `to` is the context we
            // just saved above.
            "2:",
            "ret",
            RIP = const offset_of!(MachineContext, rip),
            RSP = const offset_of!(MachineContext, rsp),
            RBP = const offset_of!(MachineContext, rbp),
            RBX = const offset_of!(MachineContext, rbx),
            R12 = const offset_of!(MachineContext, r12),
            R13 = const offset_of!(MachineContext, r13),
            R14 = const offset_of!(MachineContext, r14),
            R15 = const offset_of!(MachineContext, r15),
            MXCSR = const offset_of!(MachineContext, mxcsr),
            FPCW = const offset_of!(MachineContext, fpcw),
        )
    }
}

/// Entered by `jmp` on the very first switch into a freshly-`init`'d
/// coroutine. Realigns the stack (the usual 8-byte misalignment from a
/// `call`'s return address is absent, since we arrived via `jmp`) and
/// dispatches into the generic entry shim with the handle/packed-args
/// pointers moved from the preload registers into the SysV argument
/// registers.
#[naked]
pub(crate) unsafe extern "C" fn trampoline() {
    // Safety: inline assembly; `r13`/`r14` were preloaded by
    // `MachineContext::synthetic`, `rsp` by the same.
    unsafe {
        naked_asm!(
            ".balign 16",
            "and rsp, -16",
            "mov rdi, r13",
            "mov rsi, r14",
            "call {entry}",
            // `entry_shim` never returns normally; it always ends with a
            // context switch.
            "ud2",
            entry = sym crate::entry::entry_shim,
        )
    }
}

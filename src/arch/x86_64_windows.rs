//! x86-64 Windows (Win64) context switch and trampoline.
//!
//! Same structure as `arch::x86_64_unix`, plus the two things the Win64
//! ABI and the Windows TIB add to the non-volatile set: `xmm6`-`xmm15`
//! and the four TIB stack fields at `gs:[0x30] + {0x08, 0x10, 0x1478,
//! 0x20}`.

use crate::context::MachineContext;
use std::arch::naked_asm;
use std::mem::offset_of;

pub(crate) const STACK_ALIGNMENT: usize = 16;

pub(crate) const PRELOAD_REGS: (&str, &str) = ("r13", "r14");

/// Save the running side's non-volatile state into `from`, load `to`, and
/// jump to `to.rip`. `from` arrives in `rcx`, `to` in `rdx` per the Win64
/// ABI.
///
/// # Safety
/// See [`crate::context::switch`].
#[naked]
pub(crate) unsafe extern "C" fn switch_context(from: *mut MachineContext, to: *const MachineContext) {
    // Safety: inline assembly implementing the documented save/restore
    // order.
    unsafe {
        naked_asm!(
            ".balign 16",
            // Step 1: resume address for `from`.
            "lea rax, [rip + 2f]",
            "mov [rcx + {RIP}], rax",
            // Step 2: callee-saved GPRs (including rdi/rsi, callee-saved
            // only on Win64), rsp, xmm6-xmm15, the four TIB fields, MXCSR,
            // x87 control word.
            "mov [rcx + {RSP}], rsp",
            "mov [rcx + {RBP}], rbp",
            "mov [rcx + {RBX}], rbx",
            "mov [rcx + {RDI}], rdi",
            "mov [rcx + {RSI}], rsi",
            "mov [rcx + {R12}], r12",
            "mov [rcx + {R13}], r13",
            "mov [rcx + {R14}], r14",
            "mov [rcx + {R15}], r15",
            "movdqa [rcx + {XMM6}], xmm6",
            "movdqa [rcx + {XMM7}], xmm7",
            "movdqa [rcx + {XMM8}], xmm8",
            "movdqa [rcx + {XMM9}], xmm9",
            "movdqa [rcx + {XMM10}], xmm10",
            "movdqa [rcx + {XMM11}], xmm11",
            "movdqa [rcx + {XMM12}], xmm12",
            "movdqa [rcx + {XMM13}], xmm13",
            "movdqa [rcx + {XMM14}], xmm14",
            "movdqa [rcx + {XMM15}], xmm15",
            "mov rax, gs:[0x08]",
            "mov [rcx + {STACK_BASE}], rax",
            "mov rax, gs:[0x10]",
            "mov [rcx + {STACK_LIMIT}], rax",
            "mov rax, gs:[0x1478]",
            "mov [rcx + {DEALLOCATION_STACK}], rax",
            "mov rax, gs:[0x20]",
            "mov [rcx + {FIBER_STORAGE}], rax",
            "stmxcsr [rcx + {MXCSR}]",
            "fnstcw [rcx + {FPCW}]",
            // Step 3: load `to`'s fields in reverse order.
            "fldcw [rdx + {FPCW}]",
            "ldmxcsr [rdx + {MXCSR}]",
            "mov rax, [rdx + {FIBER_STORAGE}]",
            "mov gs:[0x20], rax",
            "mov rax, [rdx + {DEALLOCATION_STACK}]",
            "mov gs:[0x1478], rax",
            "mov rax, [rdx + {STACK_LIMIT}]",
            "mov gs:[0x10], rax",
            "mov rax, [rdx + {STACK_BASE}]",
            "mov gs:[0x08], rax",
            "movdqa xmm15, [rdx + {XMM15}]",
            "movdqa xmm14, [rdx + {XMM14}]",
            "movdqa xmm13, [rdx + {XMM13}]",
            "movdqa xmm12, [rdx + {XMM12}]",
            "movdqa xmm11, [rdx + {XMM11}]",
            "movdqa xmm10, [rdx + {XMM10}]",
            "movdqa xmm9, [rdx + {XMM9}]",
            "movdqa xmm8, [rdx + {XMM8}]",
            "movdqa xmm7, [rdx + {XMM7}]",
            "movdqa xmm6, [rdx + {XMM6}]",
            "mov r15, [rdx + {R15}]",
            "mov r14, [rdx + {R14}]",
            "mov r13, [rdx + {R13}]",
            "mov r12, [rdx + {R12}]",
            "mov rsi, [rdx + {RSI}]",
            "mov rdi, [rdx + {RDI}]",
            "mov rbx, [rdx + {RBX}]",
            "mov rbp, [rdx + {RBP}]",
            "mov rax, [rdx + {RIP}]",
            "mov rsp, [rdx + {RSP}]",
            // Step 4.
            "jmp rax",
            "2:",
            "ret",
            RIP = const offset_of!(MachineContext, rip),
            RSP = const offset_of!(MachineContext, rsp),
            RBP = const offset_of!(MachineContext, rbp),
            RBX = const offset_of!(MachineContext, rbx),
            RDI = const offset_of!(MachineContext, rdi),
            RSI = const offset_of!(MachineContext, rsi),
            R12 = const offset_of!(MachineContext, r12),
            R13 = const offset_of!(MachineContext, r13),
            R14 = const offset_of!(MachineContext, r14),
            R15 = const offset_of!(MachineContext, r15),
            XMM6 = const offset_of!(MachineContext, xmm) + 0 * 16,
            XMM7 = const offset_of!(MachineContext, xmm) + 1 * 16,
            XMM8 = const offset_of!(MachineContext, xmm) + 2 * 16,
            XMM9 = const offset_of!(MachineContext, xmm) + 3 * 16,
            XMM10 = const offset_of!(MachineContext, xmm) + 4 * 16,
            XMM11 = const offset_of!(MachineContext, xmm) + 5 * 16,
            XMM12 = const offset_of!(MachineContext, xmm) + 6 * 16,
            XMM13 = const offset_of!(MachineContext, xmm) + 7 * 16,
            XMM14 = const offset_of!(MachineContext, xmm) + 8 * 16,
            XMM15 = const offset_of!(MachineContext, xmm) + 9 * 16,
            STACK_BASE = const offset_of!(MachineContext, stack_base),
            STACK_LIMIT = const offset_of!(MachineContext, stack_limit),
            DEALLOCATION_STACK = const offset_of!(MachineContext, deallocation_stack),
            FIBER_STORAGE = const offset_of!(MachineContext, fiber_storage),
            MXCSR = const offset_of!(MachineContext, mxcsr),
            FPCW = const offset_of!(MachineContext, fpcw),
        )
    }
}

/// Entered by `jmp` on the first switch into a freshly-`init`'d
/// coroutine. See `arch::x86_64_unix::trampoline`; the only difference is
/// the Win64 argument registers.
#[naked]
pub(crate) unsafe extern "C" fn trampoline() {
    // Safety: inline assembly; `r13`/`r14` were preloaded by
    // `MachineContext::synthetic`, `rsp` by the same.
    unsafe {
        naked_asm!(
            ".balign 16",
            "and rsp, -16",
            // Reserve the 32-byte shadow space the Win64 ABI requires the
            // caller to provide for the callee's use.
            "sub rsp, 32",
            "mov rcx, r13",
            "mov rdx, r14",
            "call {entry}",
            "ud2",
            entry = sym crate::entry::entry_shim,
        )
    }
}

//! x86_64 System V switch primitive.
//!
//! Grounded on `switch_x86_64_gcc.h`'s register set: the six callee-preserved
//! GPRs (`rbx`, `r12`-`r15`, `rbp`). That header leans on GCC's
//! `asm volatile("":::clobbers)` trick to make the compiler emit the
//! save/restore for it; `global_asm!` has no equivalent, so this is a
//! faithful hand-written translation of the same prologue/epilogue shape:
//! push the same six registers, pad to keep `call` sites 16-byte aligned,
//! invoke the callback twice, pop, return.

use std::os::raw::c_void;
use super::SaveRestoreCb;

std::arch::global_asm!(
    ".global tealet_raw_switch",
    "tealet_raw_switch:",
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "sub rsp, 8",          // keep `call` 16-byte aligned; paired with the 6 pushes above
    "mov r12, rdi",        // r12 = cb (callee-saved, survives the calls below)
    "mov r13, rsi",        // r13 = ctx
    "mov rdi, r13",
    "xor esi, esi",        // OP_SAVE = 0
    "mov rdx, rsp",
    "call r12",
    "mov rsp, rax",        // install the stack pointer the callback chose
    "mov rdi, r13",
    "mov esi, 1",          // OP_RESTORE = 1
    "mov rdx, rsp",
    "call r12",
    "add rsp, 8",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "ret",
);

extern "C" {
    fn tealet_raw_switch(cb: SaveRestoreCb, ctx: *mut c_void) -> *mut u8;
}

/// Invoke the switch primitive. See [`super`] module docs for the contract.
///
/// # Safety
/// `cb` must uphold the §4.1 contract: it must be safe to call twice, with
/// `SAVE` then `RESTORE`, from an arbitrary point on the native stack, and
/// it must not unwind (panicking across this boundary is undefined
/// behavior since there is no frame to unwind into on the other side).
#[inline]
pub unsafe fn raw_switch(cb: SaveRestoreCb, ctx: *mut c_void) -> *mut u8 {
    tealet_raw_switch(cb, ctx)
}

//! Composable flags for `exit` and `fork` (§6).

/// No flags.
pub const FLAG_NONE: u32 = 0;
/// Auto-free the exiting coroutine's record once its save callback observes
/// a `NULL` saved stack.
pub const FLAG_DELETE: u32 = 1;
/// Defer the real exit: stash target/arg/flags on the family and return so
/// the caller can unwind its own Rust scopes (drop guards, nested frames)
/// before the framework performs the actual exit.
pub const FLAG_DEFER: u32 = 2;

/// `fork`'s default: neither parent nor child switch.
pub const FORK_DEFAULT: u32 = 0;
/// `fork` additionally switches control into the child immediately.
pub const FORK_SWITCH: u32 = 1;

#[inline]
pub fn wants_delete(flags: u32) -> bool {
    flags & FLAG_DELETE != 0
}

#[inline]
pub fn wants_defer(flags: u32) -> bool {
    flags & FLAG_DEFER != 0
}

#[inline]
pub fn wants_fork_switch(flags: u32) -> bool {
    flags & FORK_SWITCH != 0
}

//! The save/restore callback (§4.4) — the heart of the switch machinery.
//!
//! Called twice per [`crate::arch::raw_switch`] invocation: once with
//! `Opcode::Save` while still running on the outgoing coroutine's stack,
//! once with `Opcode::Restore` after the stack pointer has been replaced
//! with whatever `Save` returned.

use std::os::raw::c_void;
use std::ptr::NonNull;

use crate::arch::{self, Opcode};
use crate::family::Family;
use crate::record::{SavedStackState, StackFar, TealetId};
use crate::saved_stack::{decref, SavedStack};

/// What the primitive should do once control resumes after the stack
/// pointer has been replaced. Threaded through the family's scratch area
/// rather than a callback closure, per the "double-call callback" design
/// note: a state machine with two steps should be modeled explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// No saved stack was restored; the outgoing side's stack pointer was
    /// left unmoved (first entry into a fresh coroutine).
    Nop,
    /// A saved stack was copied back onto the native stack.
    Restored,
    /// Save failed; the switch must be treated as a no-op by the caller.
    Err,
}

/// Threaded through [`arch::raw_switch`] as the opaque context pointer.
pub(crate) struct SwitchCtx {
    pub family: NonNull<Family>,
    pub from: TealetId,
    pub to: TealetId,
    pub outcome: Outcome,
}

/// Run one switch to completion and report what happened to the side that
/// initiated it (see the module docs on why this is well-defined even
/// though the physical continuation point may belong to a different
/// coroutine entirely by the time this call returns).
///
/// # Safety
/// `from` and `to` must both be live records in the family at `family`,
/// `from` must be the coroutine currently running on the native stack, and
/// `to` must not already be `Defunct`.
pub(crate) unsafe fn perform_switch(
    family: NonNull<Family>,
    from: TealetId,
    to: TealetId,
) -> Outcome {
    log::trace!("switch {from:?} -> {to:?}");
    let mut ctx = SwitchCtx { family, from, to, outcome: Outcome::Err };
    let ctx_ptr = &mut ctx as *mut SwitchCtx as *mut c_void;
    arch::raw_switch(save_restore_cb, ctx_ptr);
    // This call only "returns" (in the Rust sense) at the moment `from` is
    // the coroutine physically running again — either immediately (Nop/Err,
    // nothing was ever handed off) or much later, whenever *something*
    // switches back into `from` specifically (the only way its suspended
    // frame can ever be reached). Either way, by construction, `from` is who
    // we now are — not `ctx.to`, which named this call's original target and
    // says nothing about who woke us. `ctx.to` read here would be exactly as
    // stale as the `do_restore` bug this module's docs describe.
    if ctx.outcome != Outcome::Err {
        ctx.family.as_mut().current = ctx.from;
    }
    ctx.outcome
}

pub(crate) unsafe extern "C" fn save_restore_cb(
    ctx: *mut c_void,
    op: i32,
    sp: *mut u8,
) -> *mut u8 {
    let ctx = &mut *(ctx as *mut SwitchCtx);
    match Opcode::from_raw(op) {
        Opcode::Save => do_save(ctx, sp),
        Opcode::Restore => {
            do_restore(ctx, sp);
            sp
        }
    }
}

unsafe fn do_save(ctx: &mut SwitchCtx, near: *mut u8) -> *mut u8 {
    let family = ctx.family.as_mut();
    let target_stop = match family.get(ctx.to).expect("target record must exist").stack_far {
        StackFar::Bound(a) => a,
        StackFar::Furthest => arch::furthest_marker(),
        StackFar::Exiting => unreachable!("a target being switched into cannot be exiting"),
    };

    let current_far = family.get(ctx.from).expect("current record must exist").stack_far;
    let exiting = matches!(current_far, StackFar::Exiting);
    let fail_ok = !exiting;

    if family.grow_pending(target_stop, fail_ok).is_err() && fail_ok {
        ctx.outcome = Outcome::Err;
        return near;
    }
    // On the exiting path a grow failure has already poisoned the offending
    // sharers inside `grow_pending`; the switch proceeds regardless (§7
    // error kind 2: failure is not permitted while exiting). On the
    // non-exiting path `grow_pending` left everything untouched on failure,
    // so the early return above is the only effect of that failure.

    if exiting {
        // Outgoing coroutine never resumes, so it gets no saved stack. If it
        // was not asked to stick around (`FLAG_DELETE`), its record is freed
        // right here, synchronously, while we still have a handle on it —
        // `lifecycle::exit` itself never gets a chance to run any cleanup
        // after this switch, since a successful exit never returns to it.
        let keep = family.get(ctx.from).unwrap().keep_on_exit;
        if !keep {
            family.remove(ctx.from);
        }
    } else {
        let far = match current_far {
            StackFar::Bound(a) => a,
            StackFar::Furthest => arch::furthest_marker(),
            StackFar::Exiting => unreachable!(),
        };
        // saveto = min(current's own far, target's far): never save past our
        // own legitimate range, and never save further than the target
        // actually needs right now (the rest stays pending, grown later).
        let saveto = if arch::deeper(far, target_stop) { target_stop } else { far };
        let full = !arch::deeper(far, target_stop);
        let size = arch::diff(saveto, near).max(0) as usize;
        let alloc = family.alloc();
        match SavedStack::new(alloc, near, far, size) {
            Some(stack) => {
                family.stats.record_alloc(size, 1);
                family.stats.stack_bytes += size;
                family.stats.stack_chunk_count += 1;
                family.stats.stack_count += 1;
                let stack_ref = std::rc::Rc::new(std::cell::RefCell::new(stack));
                if !full {
                    family.pending.link(std::rc::Rc::clone(&stack_ref));
                }
                family.get_mut(ctx.from).unwrap().saved = SavedStackState::Suspended(stack_ref);
                log::trace!("saved {size} bytes for {:?}", ctx.from);
            }
            None => {
                log::warn!("allocation failure saving stack for {:?}", ctx.from);
                if fail_ok {
                    ctx.outcome = Outcome::Err;
                    return near;
                }
                family.get_mut(ctx.from).unwrap().saved = SavedStackState::Defunct;
            }
        }
    }

    match family.get(ctx.to).unwrap().saved.as_suspended() {
        None => {
            ctx.outcome = Outcome::Nop;
            near
        }
        Some(stack) => {
            ctx.outcome = Outcome::Restored;
            stack.borrow().near()
        }
    }
}

unsafe fn do_restore(ctx: &mut SwitchCtx, _new_sp: *mut u8) {
    if ctx.outcome != Outcome::Restored {
        return;
    }
    // `ctx` lives in the outgoing coroutine's own (now-superseded) stack
    // frame. Everything this function needs from it must be copied into
    // true locals before `restore()` runs: that call memcpy's the target's
    // saved bytes back over the native stack, and `ctx`'s address may well
    // fall inside the range being overwritten. `family` is a pointer value,
    // already dereferenced below and independent of `ctx`'s storage once
    // bound; `to` is a plain integer and must be copied explicitly.
    let family = ctx.family.as_mut();
    let to: TealetId = ctx.to;
    let self_switch = ctx.from == to;
    family.last_restored = to;
    let stack_ref = match &family.get(to).unwrap().saved {
        SavedStackState::Suspended(s) => std::rc::Rc::clone(s),
        _ => unreachable!("Restored outcome implies a suspended target stack"),
    };
    stack_ref.borrow().restore();
    log::trace!("restored {} bytes for {:?}", stack_ref.borrow().saved_bytes(), to);
    if self_switch {
        // A switch that targets itself is a pure snapshot (`fork`'s way of
        // materialising a real, properly-framed save point without handing
        // control anywhere): leave what we just made as `Suspended` rather
        // than retiring it — the caller reads it back out once this
        // returns, instead of it being freed here like a normal restore.
        return;
    }
    let will_free = std::rc::Rc::strong_count(&stack_ref) == 1;
    let (freed_bytes, freed_chunks) = if will_free {
        (stack_ref.borrow().saved_bytes(), stack_ref.borrow().chunk_count())
    } else {
        (0, 0)
    };
    let alloc_ptr = family.alloc() as *const dyn crate::alloc::Allocator;
    family.get_mut(to).unwrap().saved = SavedStackState::Running;
    decref(&*alloc_ptr, stack_ref);
    if will_free {
        family.stats.record_free(freed_bytes, freed_chunks);
        family.stats.stack_bytes = family.stats.stack_bytes.saturating_sub(freed_bytes);
        family.stats.stack_chunk_count =
            family.stats.stack_chunk_count.saturating_sub(freed_chunks);
        family.stats.stack_count = family.stats.stack_count.saturating_sub(1);
    }
}

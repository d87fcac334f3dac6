//! Coroutine lifecycle operations (§4.5): `new`, `create`, `switch`, `exit`,
//! `duplicate`, `fork`, `delete`, `stub_run`, plus `initialize`/`finalize`.
//!
//! Grounded on `tealet_initialstub`/`tealet_switchstack`/`tealet_exit`/
//! `tealet_duplicate` in the original source. The one mechanism every op
//! here ultimately goes through is [`callback::perform_switch`]; the
//! trickiest part is `new`'s "saved-only" branch, which keeps running
//! *inline*, under a changed identity, rather than returning — see that
//! function's body for the full explanation.

use std::os::raw::c_void;
use std::ptr::NonNull;

use crate::alloc::Allocator;
use crate::callback::{perform_switch, Outcome};
use crate::error::{Result, TealetError};
use crate::family::{DeferredExit, Family};
use crate::flags::{self, FLAG_DELETE};
use crate::record::{CoroutineRecord, Handle, PendingEntry, RunFn, SavedStackState, StackFar, MAIN_ID};
use crate::saved_stack;
use crate::stats::Stats;
use crate::status::Status;

/// `initialize(alloc, extra_size) -> main`.
pub fn initialize(alloc: Box<dyn Allocator>, extra_size: usize) -> Handle {
    let family = Family::initialize(alloc, extra_size);
    let ptr = NonNull::new(Box::into_raw(family)).expect("Box::into_raw is never null");
    Handle::new(ptr, MAIN_ID)
}

/// `finalize(main)`. Undefined behavior (debug-asserted here) if any
/// non-main coroutine is still alive, per §4.5.
///
/// # Safety
/// `main` must be the main handle of a family produced by [`initialize`]
/// that has not already been finalized, and must not be called while
/// `current != main`.
pub unsafe fn finalize(main: Handle) {
    debug_assert!(main.is_main(), "finalize must be called on the main handle");
    let family = &*main.family.as_ptr();
    debug_assert_eq!(family.current, MAIN_ID, "finalize while a coroutine other than main is current");
    debug_assert_eq!(
        family.ids().count(),
        1,
        "finalize with non-main coroutines still alive"
    );
    drop(Box::from_raw(main.family.as_ptr()));
}

/// `new(any, run_fn) -> coro`. See module docs: this function is called
/// exactly once by the creator, but can be *entered* twice conceptually —
/// once inline (as the freshly-created coroutine, never actually returning)
/// and once for real, much later, when the creator itself is switched back
/// into (returning the coroutine's handle at that point).
///
/// # Safety
/// `creator` must be the coroutine currently running in its family.
pub unsafe fn new(creator: Handle, run: RunFn, arg: *mut c_void) -> Result<(Handle, *mut c_void)> {
    let family_ptr = creator.family;
    let family = &mut *family_ptr.as_ptr();
    let id = family.allocate_id();

    // "the address of a stack variable in the creating function": this
    // local genuinely must live in `new`'s own frame, not a callee's, so
    // that everything the creator needs to resume later is within range.
    let far_marker: u8 = 0;
    let mut record = CoroutineRecord::new(id, family.extra_size);
    record.stack_far = StackFar::Bound(&far_marker as *const u8 as *mut u8);
    record.entry = Some(PendingEntry(run));
    family.insert(record);

    let target = Handle::new(family_ptr, id);
    log::debug!("creating {:?} from {:?}", target, creator);
    family.previous = creator.id;
    family.arg = arg;
    let outcome = perform_switch(family_ptr, creator.id, id);

    match outcome {
        Outcome::Err => {
            family.remove(id);
            Err(TealetError::OutOfMemory)
        }
        Outcome::Restored => {
            // The creator, resumed for real: the coroutine it made has
            // since run for a while and switched back to us.
            family.current = creator.id;
            Ok((target, family.arg))
        }
        Outcome::Nop => {
            // We are now, by identity, the freshly-created coroutine —
            // still running inline on the creator's own physical stack,
            // because there was nothing to restore. Dispatch its body and
            // never return to the caller of `new`.
            family.current = id;
            let entry = family
                .get_mut(id)
                .and_then(|r| r.entry.take())
                .expect("a freshly-created coroutine must still have its entry closure")
                .0;
            let arg = family.arg;
            let next = entry(target, arg);
            run_entry_epilogue(target, next);
        }
    }
}

/// What happens after a `run_fn` (whether invoked from `new` or
/// `stub_run`) returns normally: equivalent to `exit(returned, NULL,
/// DELETE)` (§6). Never returns.
unsafe fn run_entry_epilogue(me: Handle, returned_to: Handle) -> ! {
    let family = &mut *me.family.as_ptr();
    if family.deferred_exit.is_some() {
        // The run function called `exit(..., FLAG_DEFER)` mid-body and then
        // returned normally instead of letting that switch take over: honor
        // the stashed exit rather than the default one below.
        run_deferred_exit(me);
    }
    let _ = exit(me, returned_to, std::ptr::null_mut(), FLAG_DELETE);
    // exit() only returns on failure (target defunct, already falls back to
    // main); if even main refuses there is nothing left to do but abort —
    // this mirrors the original's "failsafe" double-exit assertion.
    panic!("exit() returned while winding down a finished coroutine");
}

/// `create(any, run_fn) -> coro`: allocate and park an empty stub without
/// running it. Implemented as `new` with an internal trampoline that
/// immediately switches back to the creator — see §4.5.
///
/// # Safety
/// Same as [`new`].
pub unsafe fn create(creator: Handle) -> Result<Handle> {
    let family_ptr = creator.family;
    let saved_previous = (*family_ptr.as_ptr()).previous;
    let trampoline: RunFn = Box::new(move |me: Handle, _arg: *mut c_void| -> Handle {
        // Park: switch straight back to our creator, capturing this
        // (nearly empty) frame as our own SavedStack. We resume only when
        // `stub_run` switches into us for real.
        unsafe {
            switch(me, creator, std::ptr::null_mut())
                .expect("parking a freshly-created stub cannot fail");
            let family = &mut *me.family.as_ptr();
            let (run, user_arg) = *Box::from_raw(family.arg as *mut (RunFn, *mut c_void));
            run(me, user_arg)
        }
    });
    let (stub, _) = new(creator, trampoline, std::ptr::null_mut())?;
    (*family_ptr.as_ptr()).previous = saved_previous;
    Ok(stub)
}

/// `stub_run(stub, run_fn, arg) -> status`: dispatch a parked stub's real
/// body. Equivalent to handing `(run_fn, arg)` to the stub's trampoline and
/// switching into it.
///
/// # Safety
/// `stub` must be a handle previously returned by [`create`] (or a
/// [`duplicate`] of one) that has not yet been dispatched, in the same
/// family as `caller`.
pub unsafe fn stub_run(caller: Handle, stub: Handle, run: RunFn, user_arg: *mut c_void) -> Result<*mut c_void> {
    let boxed = Box::into_raw(Box::new((run, user_arg))) as *mut c_void;
    switch(caller, stub, boxed)
}

/// `switch(target, arg_io) -> status`.
///
/// # Safety
/// `from` must be the coroutine currently running in its family; `to` must
/// belong to the same family.
pub unsafe fn switch(from: Handle, to: Handle, arg: *mut c_void) -> Result<*mut c_void> {
    assert!(from.same_family(&to), "cross-family switch is undefined behavior");
    if from.id == to.id {
        // No-op self-switch: `previous` stays `current` (§4.5).
        return Ok(arg);
    }
    let family_ptr = from.family;
    let family = &mut *family_ptr.as_ptr();

    let target_defunct = family
        .get(to.id)
        .map(|r| r.saved.is_defunct())
        .unwrap_or(true);
    if target_defunct {
        log::warn!("switch into defunct target {:?}", to);
        return Err(TealetError::Defunct);
    }

    family.arg = arg;
    family.previous = from.id;
    let outcome = perform_switch(family_ptr, from.id, to.id);
    // `perform_switch` already restored `family.current` to whoever is
    // physically running by the time this returns (always `from`, by
    // construction — see its doc comment); nothing to set here.
    match outcome {
        Outcome::Err => Err(TealetError::OutOfMemory),
        Outcome::Nop | Outcome::Restored => Ok(family.arg),
    }
}

/// `exit(target, arg, flags) -> status`. Never returns on success — the
/// exiting coroutine's own Rust call stack is abandoned mid-unwind (it was
/// already heap-saved or discarded by the save callback before this
/// function's own call frame can return). On failure (defunct fallback
/// target or error before the switch) this *does* return, describing the
/// failure.
///
/// # Safety
/// `me` must be the coroutine currently running and must not be main.
pub unsafe fn exit(me: Handle, target: Handle, arg: *mut c_void, flags: u32) -> Result<()> {
    debug_assert!(!me.is_main(), "main must never exit");

    if flags::wants_defer(flags) {
        let family = &mut *me.family.as_ptr();
        family.deferred_exit = Some(DeferredExit {
            target: target.id,
            arg,
            flags: flags & !crate::flags::FLAG_DEFER,
        });
        return Ok(());
    }

    let family = &mut *me.family.as_ptr();
    let fallback_to_main = family
        .get(target.id)
        .map(|r| r.saved.is_defunct())
        .unwrap_or(true);
    let target_id = if fallback_to_main { MAIN_ID } else { target.id };

    family.get_mut(me.id).unwrap().stack_far = StackFar::Exiting;
    family.get_mut(me.id).unwrap().keep_on_exit = !flags::wants_delete(flags);

    family.arg = arg;
    family.previous = me.id;
    let outcome = perform_switch(me.family, me.id, target_id);
    // A successful exit never returns to this call: `me`'s own save is
    // skipped entirely while exiting (see `callback::do_save`), so there is
    // no saved frame for any later switch to land back in here. The one
    // exception — `target_id` itself never having switched away even once,
    // so the restore machinery finds nothing to restore and this call
    // genuinely keeps running inline as `me` — is not handled: there is no
    // entry closure to dispatch for an arbitrary already-running target the
    // way `new`'s Nop branch dispatches a fresh coroutine's `run_fn`.
    match outcome {
        Outcome::Err => Err(TealetError::OutOfMemory),
        Outcome::Nop | Outcome::Restored => Ok(()),
    }
}

/// Called by the trampoline wrapper (not part of the public surface) after
/// a deferred exit's caller has unwound back out. Performs the exit that
/// was stashed by `exit(..., FLAG_DEFER)`.
///
/// # Safety
/// Same as [`exit`]; additionally requires `family.deferred_exit` to be
/// `Some`.
pub unsafe fn run_deferred_exit(me: Handle) -> ! {
    let family = &mut *me.family.as_ptr();
    let deferred = family.deferred_exit.take().expect("no deferred exit was stashed");
    let target = Handle::new(me.family, deferred.target);
    let _ = exit(me, target, deferred.arg, deferred.flags);
    panic!("deferred exit's target rejected the switch and there is no main fallback left");
}

/// `duplicate(coro) -> copy`. Requires `coro` to be suspended and not main.
///
/// # Safety
/// `coro` must belong to the same family as the caller's current handle.
pub unsafe fn duplicate(coro: Handle) -> Result<Handle> {
    debug_assert!(!coro.is_main(), "main cannot be duplicated");
    let family = &mut *coro.family.as_ptr();
    let source = family.get(coro.id).ok_or(TealetError::Defunct)?;
    let stack = match &source.saved {
        SavedStackState::Suspended(s) => saved_stack::dup(s),
        SavedStackState::Defunct => return Err(TealetError::Defunct),
        SavedStackState::Running => return Err(TealetError::NotSuspended),
    };
    let stack_far = source.stack_far;
    let extra = source.extra.clone();

    let id = family.allocate_id();
    let mut copy = CoroutineRecord::new(id, family.extra_size);
    copy.stack_far = stack_far;
    copy.saved = SavedStackState::Suspended(stack);
    copy.extra = extra;
    family.insert(copy);
    Ok(Handle::new(coro.family, id))
}

/// `delete(coro)`. Frees a non-running coroutine's record and, if it still
/// holds a saved stack, releases it through the family's allocator.
///
/// # Safety
/// `coro` must not be the coroutine currently running, and must not be
/// main.
pub unsafe fn delete(coro: Handle) {
    debug_assert!(!coro.is_main(), "main is never deleted");
    let family = &mut *coro.family.as_ptr();
    debug_assert_ne!(family.current, coro.id, "cannot delete the running coroutine");
    log::debug!("deleting {:?}", coro);
    if let Some(record) = family.remove(coro.id) {
        if let SavedStackState::Suspended(stack) = record.saved {
            saved_stack::decref(family.alloc(), stack);
        }
    }
}

/// `fork(current, out_other, flags) -> {0 child | 1 parent | ERR}`.
///
/// Grounded on `tealet_fork`, which takes the forking coroutine's own
/// snapshot via `tealet_save_state` — a standalone primitive that captures
/// the live range and returns without installing a different stack pointer,
/// so the caller simply continues. This architecture's
/// [`crate::arch::raw_switch`] has no equivalent standalone "save only"
/// entry point, only the full save-then-restore round trip (§4.1); a
/// switch that targets itself gets the same effect, since nothing is ever
/// handed to anyone and the save it produces is left in place (see
/// `callback::do_restore`'s self-switch case) rather than retired the way
/// a normal restore would. Unlike a hand-copied range, this goes through
/// the real save prologue, so the resulting snapshot has exactly the frame
/// layout the restore path's pop/ret sequence expects when the child is
/// later switched into for real.
///
/// Distinguishing the parent's own continuation from the child's eventual
/// first resumption — both of which land at the same point in this
/// function, reading byte-identical stack content — relies on
/// `family.last_restored`: whichever *outer* switch operation actually
/// performed a restore stamps it with its own fresh target, which for the
/// self-switch is `me.id` (the parent, continuing immediately) and for any
/// later real switch into the child is `child_id` (read back here simply
/// as "whatever we have just become").
///
/// The returned [`Handle`] names *the other* tealet, matching the
/// original's `pother` out-parameter, not the caller's own identity: in
/// the parent continuation that is the freshly created child, and in the
/// child continuation it is genuinely `me.id` unchanged (the parent is
/// real and still has that id; nothing about it is stale). What *is*
/// stale for the child is its own closure-captured `me`, which still
/// reads as the parent since it is duplicated stack content — call
/// [`current`] to recover the real running id.
///
/// # Safety
/// `me` must be the coroutine currently running; its `stack_far` must be
/// bounded (main must have had its `stack_far` narrowed before being
/// forked).
pub unsafe fn fork(me: Handle, flags: u32) -> Result<(u32, Handle)> {
    let family_ptr = me.family;
    let family = &mut *family_ptr.as_ptr();
    match family.get(me.id).unwrap().stack_far {
        StackFar::Furthest | StackFar::Exiting => return Err(TealetError::Unforkable),
        StackFar::Bound(_) => {}
    }

    let outcome = perform_switch(family_ptr, me.id, me.id);
    if outcome == Outcome::Err {
        return Err(TealetError::OutOfMemory);
    }

    if family.last_restored != me.id {
        // Resuming, at some later point, as the child: this is exactly
        // where the parent's self-switch snapshot left off, now running
        // under a different identity entirely.
        family.current = family.last_restored;
        return Ok((0, me));
    }

    // The parent, continuing inline right after taking its own snapshot.
    family.current = me.id;
    let stack = match &family.get(me.id).unwrap().saved {
        SavedStackState::Suspended(s) => std::rc::Rc::clone(s),
        _ => unreachable!("a self-switch always leaves its own snapshot suspended"),
    };
    family.get_mut(me.id).unwrap().saved = SavedStackState::Running;

    let far = match family.get(me.id).unwrap().stack_far {
        StackFar::Bound(a) => a,
        _ => unreachable!("checked bounded above"),
    };
    let child_id = family.allocate_id();
    let mut child = CoroutineRecord::new(child_id, family.extra_size);
    child.stack_far = StackFar::Bound(far);
    child.saved = SavedStackState::Suspended(saved_stack::dup(&stack));
    family.insert(child);
    let child_handle = Handle::new(family_ptr, child_id);
    log::debug!("forked {:?} from {:?}", child_handle, me);

    if flags::wants_fork_switch(flags) {
        switch(me, child_handle, std::ptr::null_mut())?;
    }
    Ok((1, child_handle))
}

/// `status(coro)` (§4.6).
///
/// # Safety
/// `coro` must belong to a live family.
pub unsafe fn status(coro: Handle) -> Status {
    let family = &*coro.family.as_ptr();
    match family.get(coro.id) {
        None => Status::Exited,
        Some(record) => match (&record.stack_far, &record.saved) {
            (StackFar::Exiting, _) => Status::Exited,
            (_, SavedStackState::Defunct) => Status::Defunct,
            _ => Status::Active,
        },
    }
}

/// `get_stats` (§4.6).
///
/// # Safety
/// `any` must belong to a live family.
pub unsafe fn get_stats(any: Handle) -> Stats {
    (*any.family.as_ptr()).compute_stats()
}

/// `get_far(coro)`: the deepest address `coro` may legitimately own.
/// `FURTHEST` reads back as [`crate::arch::furthest_marker`]; `EXITING`
/// reads back as null, matching `tealet_get_far`'s raw-pointer contract.
///
/// # Safety
/// `coro` must belong to a live family.
pub unsafe fn get_far(coro: Handle) -> *mut u8 {
    let family = &*coro.family.as_ptr();
    match family.get(coro.id).expect("coro must be live").stack_far {
        StackFar::Furthest => crate::arch::furthest_marker(),
        StackFar::Bound(a) => a,
        StackFar::Exiting => std::ptr::null_mut(),
    }
}

/// `set_far(main, far_boundary)`: narrow main's unbounded stack extent so
/// `fork`/`duplicate` become possible on it. Only callable on the main
/// coroutine, and only while it is the one actually running — mirrors
/// `tealet_set_far`'s two checks exactly.
///
/// # Safety
/// `main` must be the main handle of a live family.
pub unsafe fn set_far(main: Handle, far_boundary: *mut u8) -> Result<()> {
    if !main.is_main() {
        return Err(TealetError::CrossFamily);
    }
    let family = &mut *main.family.as_ptr();
    if family.current != MAIN_ID {
        return Err(TealetError::CrossFamily);
    }
    family.get_mut(MAIN_ID).unwrap().stack_far = StackFar::Bound(far_boundary);
    Ok(())
}

/// `current()`: the coroutine the caller is actually running as right now.
///
/// `any` only needs to name the right family — not the caller's own
/// identity — since this simply reads `family.current` fresh off the heap.
/// That indirection is exactly what makes it useful after [`fork`]: a
/// forked child's own closure-captured `Handle` is stale (it is part of
/// the byte-for-byte duplicated stack content, so it still reads as the
/// parent), but `family.current` is heap state, untouched by the copy, and
/// reflects whichever continuation is actually running at the moment this
/// is called.
///
/// # Safety
/// `any` must belong to a live family.
pub unsafe fn current(any: Handle) -> Handle {
    let family = &*any.family.as_ptr();
    Handle::new(any.family, family.current)
}

/// `previous()`: the coroutine that most recently switched into the
/// caller.
///
/// # Safety
/// `any` must belong to a live family.
pub unsafe fn previous(any: Handle) -> Handle {
    let family = &*any.family.as_ptr();
    Handle::new(any.family, family.previous)
}

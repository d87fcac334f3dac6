//! A family of coroutines sharing one native stack (§3 "Family").
//!
//! Combines what the original spreads across `tealet_main_t` (the shared
//! state: allocator, extra size, pending list, stats) and the per-coroutine
//! arena it threads through an intrusive list.

use std::collections::HashMap;
use std::rc::Rc;

use crate::alloc::Allocator;
use crate::arch;
use crate::error::Result;
use crate::pending::PendingList;
use crate::record::{CoroutineRecord, SavedStackState, TealetId, MAIN_ID};
use crate::saved_stack::{decref, SavedStackRef};
use crate::stats::{Counters, Stats};

pub struct Family {
    alloc: Box<dyn Allocator>,
    pub extra_size: usize,
    main: CoroutineRecord,
    coroutines: HashMap<TealetId, CoroutineRecord>,
    next_id: TealetId,
    pub pending: PendingList,
    pub stats: Counters,
    /// The coroutine currently running on the native stack.
    pub current: TealetId,
    /// Whichever record's bytes the most recently completed restore copied
    /// onto the native stack (`ctx.to`, read fresh inside `do_restore` —
    /// never stale, since it lives on the heap, outside anything a restore
    /// overwrites). Distinguishes a forked child's first resumption from
    /// its parent's own continuation, which share byte-identical stack
    /// content and so cannot be told apart by `current` alone.
    pub last_restored: TealetId,
    /// The coroutine whose switch most recently woke `current` (`previous`
    /// in §4.5 — "coroutine that woke me").
    pub previous: TealetId,
    /// The argument threaded through the switch that woke `current`, read
    /// via `arg_io` by whichever lifecycle op is resuming (§4.5, §6).
    pub arg: *mut std::os::raw::c_void,
    /// Set by `exit(..., FLAG_DEFER)`; consumed by the trampoline wrapper
    /// once the caller has unwound back out to it.
    pub deferred_exit: Option<DeferredExit>,
}

/// Stashed by a deferred `exit` (`FLAG_DEFER`) so the real exit can be
/// performed later, once the caller's own Rust frames have unwound.
pub struct DeferredExit {
    pub target: TealetId,
    pub arg: *mut std::os::raw::c_void,
    pub flags: u32,
}

impl Family {
    /// `initialize(alloc, extra_size)`: create a family with just its main
    /// coroutine, active and running.
    pub fn initialize(alloc: Box<dyn Allocator>, extra_size: usize) -> Box<Family> {
        let mut stats = Counters::default();
        stats.n_active = 1;
        stats.n_total = 1;
        let mut main = CoroutineRecord::new(MAIN_ID, extra_size);
        main.stack_far = crate::record::StackFar::Furthest;
        Box::new(Family {
            alloc,
            extra_size,
            main,
            coroutines: HashMap::new(),
            next_id: MAIN_ID + 1,
            pending: PendingList::new(),
            stats,
            current: MAIN_ID,
            last_restored: MAIN_ID,
            previous: MAIN_ID,
            arg: std::ptr::null_mut(),
            deferred_exit: None,
        })
    }

    pub fn alloc(&self) -> &dyn Allocator {
        self.alloc.as_ref()
    }

    pub fn allocate_id(&mut self) -> TealetId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn insert(&mut self, record: CoroutineRecord) {
        debug_assert_ne!(record.id, MAIN_ID, "main is not stored in the arena");
        self.stats.n_active += 1;
        self.stats.n_total += 1;
        self.coroutines.insert(record.id, record);
    }

    pub fn get(&self, id: TealetId) -> Option<&CoroutineRecord> {
        if id == MAIN_ID {
            Some(&self.main)
        } else {
            self.coroutines.get(&id)
        }
    }

    pub fn get_mut(&mut self, id: TealetId) -> Option<&mut CoroutineRecord> {
        if id == MAIN_ID {
            Some(&mut self.main)
        } else {
            self.coroutines.get_mut(&id)
        }
    }

    /// Removes a non-main coroutine record after its stack storage has
    /// already been decref'd by the caller (lifecycle `delete`).
    pub fn remove(&mut self, id: TealetId) -> Option<CoroutineRecord> {
        debug_assert_ne!(id, MAIN_ID, "main is never removed");
        let removed = self.coroutines.remove(&id);
        if removed.is_some() {
            self.stats.n_active -= 1;
        }
        removed
    }

    pub fn ids(&self) -> impl Iterator<Item = TealetId> + '_ {
        std::iter::once(MAIN_ID).chain(self.coroutines.keys().copied())
    }

    /// Mark every record whose `saved_stack` shares `stack` as permanently
    /// defunct (§4.3: a grow failure with `fail_ok == false` must poison
    /// every sharer, not just the coroutine that triggered the grow, since
    /// `duplicate` lets several records point at the same [`SavedStack`]).
    pub fn poison_sharers(&mut self, stack: &SavedStackRef) {
        poison_if_sharing(&mut self.main.saved, stack);
        for record in self.coroutines.values_mut() {
            poison_if_sharing(&mut record.saved, stack);
        }
    }

    /// `grow_list` (§4.3): grow every stack still on the pending list that
    /// lies shallower than `boundary`, stopping each one either at its own
    /// `stack_far` or at `boundary`, whichever comes first. Called before a
    /// switch overwrites memory a pending stack has not yet copied out.
    ///
    /// `fail_ok` mirrors the caller's own failure budget (§4.3/§7 error kind
    /// 1 vs. 2): when `true` (the outgoing coroutine is not exiting), a grow
    /// failure must leave every observable bit of state exactly as it was —
    /// `Chunk::capture` fails before touching `self.chunks`, so simply
    /// propagating the error without poisoning or unlinking anything already
    /// satisfies that, and the switch is retryable. When `false` (exiting,
    /// where failure is not permitted), the failing stack and every other
    /// record sharing it are poisoned `Defunct` and released here, since
    /// there is no later point at which that cleanup could still happen.
    ///
    /// # Safety
    /// `boundary` and every pending stack's live range must currently be
    /// valid, readable native-stack memory.
    pub unsafe fn grow_pending(&mut self, boundary: *mut u8, fail_ok: bool) -> Result<()> {
        for stack_ref in self.pending.snapshot() {
            let (far, reached, have) = {
                let s = stack_ref.borrow();
                (s.stack_far, s.reached(), s.saved_bytes())
            };
            let target = if arch::deeper(far, boundary) { boundary } else { far };
            if !arch::deeper(target, reached) {
                continue;
            }
            let extra = arch::diff(target, reached) as usize;
            let new_size = have + extra;
            if let Err(e) = stack_ref.borrow_mut().grow(self.alloc.as_ref(), new_size) {
                if fail_ok {
                    log::warn!("stack grow failed, switch aborted without side effects");
                    return Err(e);
                }
                log::warn!("stack grow failed while exiting, poisoning sharers as defunct");
                let freed_bytes = stack_ref.borrow().saved_bytes();
                let freed_chunks = stack_ref.borrow().chunk_count();
                self.poison_sharers(&stack_ref);
                self.pending.unlink(&stack_ref);
                unsafe { stack_ref.borrow_mut().free_all(self.alloc.as_ref()) };
                self.stats.record_free(freed_bytes, freed_chunks);
                self.stats.stack_bytes = self.stats.stack_bytes.saturating_sub(freed_bytes);
                self.stats.stack_chunk_count =
                    self.stats.stack_chunk_count.saturating_sub(freed_chunks);
                self.stats.stack_count = self.stats.stack_count.saturating_sub(1);
                return Err(e);
            }
            self.stats.record_alloc(extra, 1);
            self.stats.stack_bytes += extra;
            self.stats.stack_chunk_count += 1;
            if stack_ref.borrow().is_full() {
                self.pending.unlink(&stack_ref);
            }
        }
        Ok(())
    }

    pub fn stats_snapshot(&self, stack_bytes_expanded: usize, stack_bytes_naive: usize) -> Stats {
        Stats {
            n_active: self.stats.n_active,
            n_total: self.stats.n_total,
            bytes_allocated: self.stats.bytes_allocated,
            blocks_allocated: self.stats.blocks_allocated,
            blocks_allocated_total: self.stats.blocks_allocated_total,
            bytes_allocated_peak: self.stats.bytes_allocated_peak,
            blocks_allocated_peak: self.stats.blocks_allocated_peak,
            stack_bytes: self.stats.stack_bytes,
            stack_count: self.stats.stack_count,
            stack_chunk_count: self.stats.stack_chunk_count,
            stack_bytes_expanded,
            stack_bytes_naive,
        }
    }

    /// Walks every live record, computing the two aggregate figures
    /// `get_stats` cannot keep as running counters: total saved bytes
    /// counting every sharer of a shared stack once per sharer
    /// (`expanded`), and the bytes a non-slicing allocator would have
    /// needed for each coroutine's full `[near, far]` range (`naive`).
    pub fn compute_stats(&self) -> Stats {
        let mut expanded = 0usize;
        let mut naive = 0usize;
        let records = std::iter::once(&self.main).chain(self.coroutines.values());
        for record in records {
            if let SavedStackState::Suspended(stack) = &record.saved {
                let s = stack.borrow();
                expanded += s.saved_bytes();
                naive += arch::diff(s.near(), s.stack_far).max(0) as usize;
            }
        }
        self.stats_snapshot(expanded, naive)
    }
}

fn poison_if_sharing(state: &mut SavedStackState, stack: &SavedStackRef) {
    let shares = matches!(state, SavedStackState::Suspended(s) if Rc::ptr_eq(s, stack));
    if shares {
        *state = SavedStackState::Defunct;
    }
}

impl Drop for Family {
    fn drop(&mut self) {
        let alloc = self.alloc.as_ref();
        if let SavedStackState::Suspended(stack) =
            std::mem::replace(&mut self.main.saved, SavedStackState::Running)
        {
            decref(alloc, stack);
        }
        for (_, record) in self.coroutines.drain() {
            if let SavedStackState::Suspended(stack) = record.saved {
                decref(alloc, stack);
            }
        }
    }
}

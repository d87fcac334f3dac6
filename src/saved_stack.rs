//! Heap-resident, chunked copy of a suspended coroutine's native-stack range
//! (§3 "SavedStack", §4.2 operations).

use std::cell::RefCell;
use std::rc::Rc;

use crate::alloc::Allocator;
use crate::arch;
use crate::chunk::Chunk;
use crate::error::{Result, TealetError};

/// Reference-counted handle to a [`SavedStack`]. Sharing happens only
/// through `Rc::clone` (the `dup` operation, §4.2) — refcounting is Rust's
/// `Rc` strong count, not a hand-rolled counter, but releasing the
/// underlying chunk memory still requires an explicit [`decref`] call
/// (see that function's docs for why `Drop` cannot do it).
pub type SavedStackRef = Rc<RefCell<SavedStack>>;

/// One or more [`Chunk`]s describing a contiguous run of native-stack
/// addresses, from the owning coroutine's position at save time down to
/// some point at or beyond its `stack_far`.
#[derive(Debug)]
pub struct SavedStack {
    /// The owner's `stack_far` at the time this stack was created, copied
    /// in so growth can be bounded without consulting the (possibly
    /// already-deleted) coroutine record.
    pub stack_far: *mut u8,
    chunks: Vec<Chunk>,
}

impl SavedStack {
    /// `new(near, far, size)`: allocate one inline chunk holding `size`
    /// bytes copied from the native stack starting at `near`.
    ///
    /// # Safety
    /// Same as [`Chunk::capture`].
    pub unsafe fn new(
        alloc: &dyn Allocator,
        near: *mut u8,
        far: *mut u8,
        size: usize,
    ) -> Option<SavedStack> {
        let chunk = Chunk::capture(alloc, near, size)?;
        Some(SavedStack { stack_far: far, chunks: vec![chunk] })
    }

    pub fn saved_bytes(&self) -> usize {
        self.chunks.iter().map(Chunk::size).sum()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// The shallowest address this stack's range starts at (its `near`).
    pub fn near(&self) -> *mut u8 {
        self.chunks.first().map(|c| c.near_end).unwrap_or(std::ptr::null_mut())
    }

    /// The deepest address actually saved so far.
    pub fn reached(&self) -> *mut u8 {
        self.chunks.last().map(Chunk::far_end).unwrap_or_else(|| self.near())
    }

    /// Whether this stack's saved range has reached `stack_far` (i.e. it is
    /// no longer partial and does not belong on the pending-save list).
    pub fn is_full(&self) -> bool {
        !arch::deeper(self.stack_far, self.reached())
    }

    /// `grow(stack, new_size)`: append a new chunk covering the bytes
    /// between the currently-saved region and `new_size` total bytes.
    /// Never rewrites earlier chunks.
    ///
    /// # Safety
    /// The newly-covered native-stack range must currently be valid,
    /// readable memory belonging to the coroutine being saved.
    pub unsafe fn grow(&mut self, alloc: &dyn Allocator, new_size: usize) -> Result<()> {
        let have = self.saved_bytes();
        debug_assert!(new_size > have, "grow must add bytes, never shrink");
        let extra = new_size - have;
        let near = self.reached();
        let chunk = Chunk::capture(alloc, near, extra).ok_or(TealetError::OutOfMemory)?;
        self.chunks.push(chunk);
        Ok(())
    }

    /// `restore(stack)`: memcpy every chunk back to its recorded
    /// native-stack location. Order does not matter — chunks are disjoint.
    ///
    /// # Safety
    /// Every chunk's destination range must currently belong to the
    /// coroutine being restored into.
    pub unsafe fn restore(&self) {
        for chunk in &self.chunks {
            chunk.restore();
        }
    }

    /// `defunct(stack)`: drop every chunk, releasing their memory. In this
    /// implementation the owning coroutine transitions its `saved_stack`
    /// field to the dedicated `Defunct` variant (see
    /// [`crate::record::SavedStackState`]) rather than retaining a
    /// zombie `SavedStack` with only its initial chunk left in place, so
    /// there is nothing left to keep around afterward — a simplification
    /// over the original's pointer-sentinel reuse, recorded in DESIGN.md.
    ///
    /// # Safety
    /// Must be called at most once; no other reference to this stack may
    /// be used afterward.
    pub unsafe fn free_all(&mut self, alloc: &dyn Allocator) {
        for chunk in &self.chunks {
            chunk.free(alloc);
        }
        self.chunks.clear();
    }
}

impl Drop for SavedStack {
    fn drop(&mut self) {
        debug_assert!(
            self.chunks.is_empty(),
            "SavedStack dropped without decref: chunk memory leaked"
        );
    }
}

/// `decref(stack)`: release one reference. If this was the last one,
/// free the stack's chunk memory through `alloc` and let the `Rc` itself
/// drop normally afterward.
///
/// `Rc`'s own `Drop` cannot free chunk memory because doing so requires the
/// family's [`Allocator`], which `SavedStack` has no way to reach on its
/// own (ownership edges point from the family down to its data, never the
/// reverse — see the "cyclic graph" design note). Every holder of a
/// [`SavedStackRef`] must therefore release it through this function
/// instead of a bare `drop(rc)`.
pub fn decref(alloc: &dyn Allocator, stack: SavedStackRef) {
    if Rc::strong_count(&stack) == 1 {
        unsafe {
            stack.borrow_mut().free_all(alloc);
        }
    }
    drop(stack);
}

/// `dup(stack)`: share the record with another owner. Saved-stack storage
/// is immutably shared by duplicated coroutines; growth is still allowed
/// (it only appends chunks, never rewrites existing ones).
pub fn dup(stack: &SavedStackRef) -> SavedStackRef {
    Rc::clone(stack)
}

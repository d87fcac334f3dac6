//! Pluggable allocator vtable (§6 "Allocator vtable").
//!
//! Every saved-stack chunk — the bytes copied off the native stack, whose
//! size and count are genuinely workload-driven and are what `get_stats`
//! reports — goes through a user-supplied [`Allocator`] rather than Rust's
//! global allocator, matching the C contract
//! `{alloc_fn(size, ctx) -> ptr|NULL, free_fn(ptr, ctx), ctx}`. [`LibcAlloc`]
//! is the default, behaving like plain `malloc`/`free`.
//!
//! The family record and each coroutine's own bookkeeping (including its
//! fixed-size `extra` slot) stay on Rust's ordinary global allocator instead.
//! `Family` owns its `Allocator` as a `Box<dyn Allocator>`; routing the
//! family's own backing memory through that same allocator would require
//! freeing it through the allocator's vtable after the rest of the struct —
//! including that very `Box` — has already been torn down, which plain
//! struct `Drop` cannot express (the original C implementation sidesteps
//! this by storing the vtable as bare function pointers with no drop glue
//! of their own). Kept as a documented simplification rather than solved.

use std::os::raw::c_void;
use std::ptr::NonNull;

/// Must behave like standard `malloc`/`free`: `alloc` may return null on
/// failure and must never be called with `size == 0` by the runtime;
/// `free` must accept exactly the pointers this allocator produced.
///
/// The runtime calls an allocator from arbitrary suspended/resumed
/// coroutine contexts, so an `Allocator` must be reentrant with respect to
/// itself, but need not be thread-safe (§5: a family is pinned to one
/// native thread).
pub trait Allocator {
    fn alloc(&self, size: usize) -> Option<NonNull<u8>>;

    /// # Safety
    /// `ptr` must have been returned by `self.alloc` and not yet freed.
    unsafe fn free(&self, ptr: NonNull<u8>);
}

/// Default allocator, backed by `libc::malloc`/`libc::free`
/// (`TEALET_ALLOC_INIT_MALLOC` in the original C implementation).
#[derive(Debug, Default, Clone, Copy)]
pub struct LibcAlloc;

impl Allocator for LibcAlloc {
    fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        debug_assert!(size > 0);
        let ptr = unsafe { libc::malloc(size) } as *mut u8;
        NonNull::new(ptr)
    }

    unsafe fn free(&self, ptr: NonNull<u8>) {
        libc::free(ptr.as_ptr() as *mut c_void);
    }
}

/// Wraps an inner allocator with block/byte counting by prefixing every
/// allocation with an 8-byte size header.
///
/// Grounded on `tealet_statsalloc_t` (`tools.c`): that wrapper exists
/// precisely so that test drivers and diagnostics can track allocation
/// counts without every call site threading sizes through by hand.
pub struct TrackingAlloc<A: Allocator> {
    inner: A,
    n_allocs: std::cell::Cell<usize>,
    s_allocs: std::cell::Cell<usize>,
}

impl<A: Allocator> TrackingAlloc<A> {
    pub fn new(inner: A) -> Self {
        TrackingAlloc {
            inner,
            n_allocs: std::cell::Cell::new(0),
            s_allocs: std::cell::Cell::new(0),
        }
    }

    pub fn live_allocations(&self) -> usize {
        self.n_allocs.get()
    }

    pub fn live_bytes(&self) -> usize {
        self.s_allocs.get()
    }
}

const HEADER: usize = std::mem::size_of::<usize>();

impl<A: Allocator> Allocator for TrackingAlloc<A> {
    fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        let real_size = size + HEADER;
        let raw = self.inner.alloc(real_size)?;
        unsafe {
            (raw.as_ptr() as *mut usize).write(size);
        }
        self.n_allocs.set(self.n_allocs.get() + 1);
        self.s_allocs.set(self.s_allocs.get() + size);
        NonNull::new(unsafe { raw.as_ptr().add(HEADER) })
    }

    unsafe fn free(&self, ptr: NonNull<u8>) {
        let raw = NonNull::new_unchecked(ptr.as_ptr().sub(HEADER));
        let size = (raw.as_ptr() as *const usize).read();
        self.n_allocs.set(self.n_allocs.get() - 1);
        self.s_allocs.set(self.s_allocs.get() - size);
        self.inner.free(raw);
    }
}

/// An allocator that fails its next `n` allocations, then delegates
/// normally. Used to exercise the defunct-propagation failure path (§8
/// scenario 5) deterministically.
pub struct FailAfter<A: Allocator> {
    inner: A,
    remaining_ok: std::cell::Cell<usize>,
}

impl<A: Allocator> FailAfter<A> {
    pub fn new(inner: A, allow: usize) -> Self {
        FailAfter {
            inner,
            remaining_ok: std::cell::Cell::new(allow),
        }
    }
}

impl<A: Allocator> Allocator for FailAfter<A> {
    fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        let remaining = self.remaining_ok.get();
        if remaining == 0 {
            return None;
        }
        self.remaining_ok.set(remaining - 1);
        self.inner.alloc(size)
    }

    unsafe fn free(&self, ptr: NonNull<u8>) {
        self.inner.free(ptr)
    }
}

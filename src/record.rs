//! Per-coroutine record (§3 "Coroutine record") and the public handle type.

use std::os::raw::c_void;
use std::ptr::NonNull;

use crate::family::Family;
use crate::saved_stack::SavedStackRef;

/// A coroutine's entry function: receives its own handle and the argument
/// threaded in by `new`/`stub_run`, and returns the handle to switch into
/// when it returns normally (equivalent to `exit(returned, NULL, DELETE)`,
/// per §6's entry-point contract).
pub type RunFn = Box<dyn FnOnce(Handle, *mut c_void) -> Handle>;

/// A not-yet-run coroutine's dispatch closure, held until its first switch-in.
pub struct PendingEntry(pub RunFn);

/// Identifies one coroutine within a family. `0` is reserved for main,
/// which is stored inline on [`Family`] rather than in its coroutine arena
/// (mirroring the original embedding main's `tealet_sub_t` base directly
/// inside `tealet_main_t`).
pub type TealetId = u64;
pub const MAIN_ID: TealetId = 0;

/// `stack_far` (§3): the deepest address a coroutine may legitimately own.
///
/// Replaces the original's two overloaded pointer values (the real
/// `STACKMAN_SP_FURTHEST` sentinel and a `NULL` "exiting" marker) with an
/// explicit enum, per the "dynamic dispatch over sentinels" design note.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackFar {
    /// Main only: unbounded, "the entire native stack below the current
    /// depth". Never fully saveable (§4.3 edge case).
    Furthest,
    /// A bounded floor address, set once at creation (non-main) or
    /// narrowed explicitly via `set_far` (main).
    Bound(*mut u8),
    /// This coroutine is exiting; do not save its stack (§4.5 `exit`).
    Exiting,
}

/// `saved_stack` (§3): three-valued in the original (`NULL` | `INVALID` |
/// real pointer), replaced with an explicit tagged variant per the "dynamic
/// dispatch over sentinels" design note.
pub enum SavedStackState {
    /// Currently running on the native stack.
    Running,
    /// A prior save failed while this coroutine's owner needed to exit
    /// through it; permanently unusable.
    Defunct,
    /// Suspended, with a saved stack ready to be restored.
    Suspended(SavedStackRef),
}

impl SavedStackState {
    pub fn is_running(&self) -> bool {
        matches!(self, SavedStackState::Running)
    }

    pub fn is_defunct(&self) -> bool {
        matches!(self, SavedStackState::Defunct)
    }

    pub fn as_suspended(&self) -> Option<&SavedStackRef> {
        match self {
            SavedStackState::Suspended(s) => Some(s),
            _ => None,
        }
    }
}

/// One coroutine's record: identity, stack bookkeeping, and its
/// fixed-size opaque extra-data slot.
pub struct CoroutineRecord {
    pub id: TealetId,
    pub stack_far: StackFar,
    pub saved: SavedStackState,
    pub extra: Box<[u8]>,
    /// Set for a coroutine that has never run yet (`new`/`create`/`stub_new`);
    /// taken and invoked the first time it is switched into.
    pub entry: Option<PendingEntry>,
    /// Do not auto-delete on exit even without *DEFER* pending; mirrors the
    /// original's "-1 means do-not-delete" sentinel, as a plain bool instead
    /// of overloading `saved`.
    pub keep_on_exit: bool,
}

impl CoroutineRecord {
    pub fn new(id: TealetId, extra_size: usize) -> CoroutineRecord {
        CoroutineRecord {
            id,
            stack_far: StackFar::Bound(std::ptr::null_mut()),
            saved: SavedStackState::Running,
            extra: vec![0u8; extra_size].into_boxed_slice(),
            entry: None,
            keep_on_exit: false,
        }
    }
}

/// A handle to one coroutine within a family (the `tealet_t*` of the
/// original — the same handle type identifies main and every non-main
/// coroutine).
///
/// Cheap to copy; carries no borrow, so callers juggle many of them freely,
/// matching the original's raw-pointer ergonomics without the aliasing
/// hazards of an actual shared pointer into the arena (all real access goes
/// through [`Family`] lookups keyed on `id`).
#[derive(Clone, Copy)]
pub struct Handle {
    pub(crate) family: NonNull<Family>,
    pub(crate) id: TealetId,
}

impl Handle {
    pub(crate) fn new(family: NonNull<Family>, id: TealetId) -> Handle {
        Handle { family, id }
    }

    pub fn is_main(&self) -> bool {
        self.id == MAIN_ID
    }

    /// The main coroutine of this handle's family.
    pub fn main(&self) -> Handle {
        Handle { family: self.family, id: MAIN_ID }
    }

    pub(crate) fn same_family(&self, other: &Handle) -> bool {
        self.family == other.family
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("family", &self.family.as_ptr())
            .field("id", &self.id)
            .finish()
    }
}

impl PartialEq for Handle {
    fn eq(&self, other: &Self) -> bool {
        self.family == other.family && self.id == other.id
    }
}
impl Eq for Handle {}

impl std::hash::Hash for Handle {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.family.hash(state);
        self.id.hash(state);
    }
}

//! Error types for the coroutine runtime.
//!
//! [`TealetError`] is the Rust-level error type used by every fallible
//! operation in this crate. The `ffi` module is the only place that narrows
//! it down to the bit-exact integer codes required by the C-callable
//! contract.

use thiserror::Error;

/// `0` on success; see [`TealetError::to_code`] for the rest.
pub const ERR_MEM: i32 = -1;
pub const ERR_DEFUNCT: i32 = -2;
pub const ERR_UNFORKABLE: i32 = -3;

/// Everything that can go wrong inside the runtime.
#[derive(Debug, Error)]
pub enum TealetError {
    /// The allocator returned a null pointer while trying to grow or create
    /// a saved stack. Observable state is unchanged when this is returned
    /// from a normal (non-exiting) switch.
    #[error("allocation failure while saving a stack")]
    OutOfMemory,

    /// The target coroutine's saved stack could not be grown while its
    /// owner was exiting and is now permanently unusable.
    #[error("coroutine is defunct and can no longer be switched into")]
    Defunct,

    /// `fork` was attempted on a coroutine whose stack extent is unbounded
    /// (main with `stack_far == FURTHEST`), or otherwise not eligible.
    #[error("coroutine cannot be forked in its current state")]
    Unforkable,

    /// The target coroutine is not currently suspended (no saved stack to
    /// duplicate from).
    #[error("coroutine is not suspended")]
    NotSuspended,

    /// The target belongs to a different family than the caller.
    #[error("coroutine belongs to a different family")]
    CrossFamily,
}

impl TealetError {
    /// Narrow to the bit-exact integer code used by the C-callable contract
    /// (§6): `-1` for `OutOfMemory`, `-2` for `Defunct`, `-3` for
    /// `Unforkable`. Misuse variants that have no dedicated code in the
    /// external contract collapse to `ERR_DEFUNCT`, mirroring the original
    /// implementation's reuse of that code as a general invalid-state
    /// signal from `fork`.
    pub fn to_code(&self) -> i32 {
        match self {
            TealetError::OutOfMemory => ERR_MEM,
            TealetError::Defunct => ERR_DEFUNCT,
            TealetError::Unforkable => ERR_UNFORKABLE,
            TealetError::NotSuspended => ERR_DEFUNCT,
            TealetError::CrossFamily => ERR_DEFUNCT,
        }
    }
}

pub type Result<T> = core::result::Result<T, TealetError>;

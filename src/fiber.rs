//! Thin adapter over the native stack switching primitive.
//!
//! Fibers are one-shot [`context::Context`] values resumed over protected
//! fixed size stacks. A resumed context is consumed, and the continuation of
//! the suspended side materializes in the [`context::Transfer`] received by
//! whoever runs next. To keep symmetric task-to-task switching possible on
//! top of that, every switch passes a pointer to the suspending side's
//! [`ContextSlot`] as the transfer datum, and the resumed side parks the
//! received continuation there before doing anything else.

use crate::error::TaskError;
use context::stack::ProtectedFixedSizeStack;
use context::Transfer;
use std::cell::Cell;
use std::fmt::{Debug, Formatter};

/// Default fiber stack size in bytes.
pub const DEFAULT_STACK_SIZE: usize = if std::mem::size_of::<usize>() < 8 {
    64 * 1024
} else {
    512 * 1024
};

/// Entry point of a fiber.
pub(crate) type EntryFn = extern "C" fn(Transfer) -> !;

/// Storage for the parked continuation of a suspended fiber.
pub(crate) struct ContextSlot(Cell<Option<context::Context>>);

impl ContextSlot {
    pub fn new() -> Self {
        Self(Cell::new(None))
    }

    /// Parks a continuation. The slot must be empty.
    pub fn park(&self, context: context::Context) {
        debug_assert!(self.is_empty());
        self.0.set(Some(context));
    }

    /// Takes the parked continuation out of the slot.
    pub fn take(&self) -> Option<context::Context> {
        self.0.take()
    }

    pub fn is_empty(&self) -> bool {
        let context = self.0.take();
        let empty = context.is_none();
        self.0.set(context);
        empty
    }
}

impl Debug for ContextSlot {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ContextSlot")
            .field(if self.is_empty() { &"empty" } else { &"parked" })
            .finish()
    }
}

/// An armed fiber stack.
///
/// The stack must stay allocated for as long as any context derived from it
/// can still be resumed, which is why tasks keep their fiber until teardown.
pub(crate) struct Fiber {
    _stack: ProtectedFixedSizeStack,
}

impl Fiber {
    /// Allocates a guarded stack of `stack_size` bytes and arms it so that
    /// the first switch into the returned context begins at `entry`.
    pub fn new(stack_size: usize, entry: EntryFn) -> Result<(Self, context::Context), TaskError> {
        let stack = ProtectedFixedSizeStack::new(stack_size).map_err(|e| {
            log::error!("fiber stack allocation of {} bytes failed: {}", stack_size, e);
            TaskError::StackAllocation(stack_size)
        })?;

        // Safety: the stack is owned by the returned fiber, which its task
        // keeps alive until the context is torn down.
        let initial = unsafe { context::Context::new(&stack, entry) };
        Ok((Self { _stack: stack }, initial))
    }
}

impl Debug for Fiber {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber").finish_non_exhaustive()
    }
}

/// Switches execution to `target`.
///
/// The continuation of the calling fiber is parked into `source` by whichever
/// fiber resumes it, so `source` must stay valid until then. Returns once
/// something switches back into the caller.
///
/// # Safety
///
/// `target` must be a live continuation, and `source` must outlive the
/// suspension of the calling fiber.
pub(crate) unsafe fn switch(target: context::Context, source: &ContextSlot) {
    // Safety: the datum is a pointer to the caller's context slot, which the
    // resumed side parks the received continuation into. The contract above
    // keeps the slot alive for that write.
    let transfer = unsafe { target.resume(source as *const ContextSlot as usize) };
    // Safety: every switch in this crate passes a slot pointer as the datum.
    unsafe { park_transfer(transfer) };
}

/// Parks the suspended side of a received transfer into the slot it named.
///
/// # Safety
///
/// `transfer.data` must be a pointer to a live [`ContextSlot`], which is the
/// case for every transfer produced by [`switch`] or by a fiber entry.
pub(crate) unsafe fn park_transfer(transfer: Transfer) {
    // Safety: ensured by the caller.
    let slot = unsafe { &*(transfer.data as *const ContextSlot) };
    slot.park(transfer.context);
}

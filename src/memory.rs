//! Free-memory probing and the verification memory budget.
//!
//! Heap and call stack share a few kilobytes on the target, growing towards
//! each other. Before hashing, the verifier compares the
//! [budget estimate](budget_estimate) for the message against a live
//! [`MemoryProbe`] reading and refuses to proceed when the two would collide.

use core::hint::black_box;
use core::ptr::addr_of;

use crate::consts::{HASH_BYTES, HASH_STACK_BYTES, IDENTITY_LEN};

/// Reports how much scratch memory is currently free.
pub trait MemoryProbe {
    /// Bytes between the top of dynamically managed memory and the stack.
    ///
    /// Must be cheap and free of side effects.
    fn available_bytes(&self) -> usize;
}

impl<P: MemoryProbe + ?Sized> MemoryProbe for &P {
    fn available_bytes(&self) -> usize {
        (**self).available_bytes()
    }
}

/// Bytes needed to verify a payload of `payload_len` bytes.
///
/// Covers the staged `identity ‖ payload` copy, the hash primitive's worst
/// stack depth and the digest it produces.
pub const fn budget_estimate(payload_len: usize) -> usize {
    payload_len + IDENTITY_LEN + HASH_STACK_BYTES + HASH_BYTES
}

/// Address of the caller's current stack extent.
///
/// The marker lives in a frame of its own, one level below the caller, so
/// the value slightly underestimates the caller's own stack pointer.
#[inline(never)]
pub fn stack_pointer() -> usize {
    let marker = 0u8;
    black_box(addr_of!(marker)) as usize
}

/// Probe for a downward-growing stack above the heap.
///
/// `heap_top` returns the allocator's current high-water mark (the break
/// pointer, or the end of static data when nothing was allocated).
#[derive(Debug, Clone, Copy)]
pub struct HeapStackProbe<F> {
    heap_top: F,
}

impl<F> HeapStackProbe<F>
where
    F: Fn() -> usize,
{
    /// Creates a probe reading the heap high-water mark from `heap_top`.
    pub const fn new(heap_top: F) -> Self {
        Self { heap_top }
    }
}

impl<F> MemoryProbe for HeapStackProbe<F>
where
    F: Fn() -> usize,
{
    fn available_bytes(&self) -> usize {
        stack_pointer().saturating_sub((self.heap_top)())
    }
}

/// A probe that always reports the same amount of free memory.
///
/// Useful on hosts, where heap and stack do not share a region, and in tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedBudget(pub usize);

impl MemoryProbe for FixedBudget {
    fn available_bytes(&self) -> usize {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_covers_message_and_hash() {
        assert_eq!(
            budget_estimate(27),
            27 + IDENTITY_LEN + HASH_STACK_BYTES + HASH_BYTES
        );
    }

    #[test]
    fn test_heap_stack_gap() {
        let top = stack_pointer().saturating_sub(4096);
        let probe = HeapStackProbe::new(move || top);
        let available = probe.available_bytes();
        assert!(available > 1024, "available = {available}");
        assert!(available < 4096 + 1024, "available = {available}");
    }

    #[test]
    fn test_collided_regions_report_nothing() {
        let probe = HeapStackProbe::new(|| usize::MAX);
        assert_eq!(probe.available_bytes(), 0);
    }

    #[test]
    fn test_fixed_budget() {
        let probe = FixedBudget(512);
        assert_eq!((&probe).available_bytes(), 512);
    }
}

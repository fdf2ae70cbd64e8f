//! Stack high-water-mark measurement.
//!
//! A bring-up diagnostic for sizing [`HASH_STACK_BYTES`](crate::consts::HASH_STACK_BYTES):
//! paint the unused stack with a random sentinel byte, run the operation
//! under test, then count how much of the paint survived. Whatever was
//! overwritten is the deepest the operation reached.
//!
//! The measurement is independent of the telemetry cycle and is meant to
//! run on a freshly booted device, before anything else has used the stack.

use core::cell::Cell;
use core::hint::black_box;
use core::ptr;

use heapless::Vec;
use rand_core::RngCore;

use crate::hash::HashPrimitive;
use crate::memory::stack_pointer;

/// Largest input length [`profile_hash`] measures.
pub const MAX_PROFILE_LEN: usize = 1024;

/// Number of input lengths [`profile_hash`] can report: zero, then every
/// power of two up to [`MAX_PROFILE_LEN`].
pub const PROFILE_SIZES: usize = 12;

/// A memory region that can be painted and inspected.
pub trait StackRegion {
    /// Fills the free part of the region with `sentinel` and returns the
    /// number of bytes painted.
    fn paint(&self, sentinel: u8) -> usize;

    /// Counts consecutive `sentinel` bytes from the region floor upwards,
    /// bounded by the last painted span.
    fn intact(&self, sentinel: u8) -> usize;
}

/// The real call stack, from a fixed floor up to the caller's frame.
///
/// The stack is assumed to grow downwards towards `floor`.
#[derive(Debug)]
pub struct RawStackRegion {
    floor: *mut u8,
    guard: usize,
    painted: Cell<usize>,
}

impl RawStackRegion {
    /// Creates a region starting at `floor`, leaving `guard` bytes below the
    /// caller's frame unpainted for the painting code itself.
    ///
    /// # Safety
    /// `floor` must be the lowest address the stack may grow into (usually
    /// the end of static data, from the linker). All memory between `floor`
    /// and the current stack pointer minus `guard` must be unused by
    /// anything, including the heap, for as long as the region is used.
    pub const unsafe fn new(floor: *mut u8, guard: usize) -> Self {
        Self {
            floor,
            guard,
            painted: Cell::new(0),
        }
    }
}

impl StackRegion for RawStackRegion {
    fn paint(&self, sentinel: u8) -> usize {
        let top = stack_pointer().saturating_sub(self.guard);
        let len = top.saturating_sub(self.floor as usize);
        for offset in 0..len {
            // SAFETY: `offset < len` keeps the write between `floor` and the
            // guarded stack pointer, which `new`'s contract declares unused.
            unsafe { ptr::write_volatile(self.floor.add(offset), sentinel) };
        }
        self.painted.set(len);
        len
    }

    fn intact(&self, sentinel: u8) -> usize {
        let painted = self.painted.get();
        let mut count = 0;
        // SAFETY: only the span written by the last `paint` is read.
        while count < painted && unsafe { ptr::read_volatile(self.floor.add(count)) } == sentinel
        {
            count += 1;
        }
        count
    }
}

/// Worst stack depth of `operation` over `trials` runs.
///
/// Every trial paints `region` with a fresh sentinel from `rng`, so a value
/// the operation happens to leave behind cannot hide a deeper run.
pub fn measure_stack_depth<R, G, F>(region: &R, rng: &mut G, trials: usize, mut operation: F) -> usize
where
    R: StackRegion + ?Sized,
    G: RngCore,
    F: FnMut(),
{
    let mut worst = 0;
    for _ in 0..trials {
        let sentinel = rng.next_u32().to_le_bytes()[0];
        let painted = region.paint(sentinel);
        operation();
        let depth = painted - region.intact(sentinel).min(painted);
        worst = worst.max(depth);
    }
    worst
}

/// Stack depth measured for one input length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub struct StackSample {
    /// Bytes hashed.
    pub input_len: usize,
    /// Worst depth observed, in bytes.
    pub depth: usize,
}

/// Measures the hash primitive's stack depth for inputs of 0, 1, 2, 4, …
/// bytes, up to `message.len()` or [`MAX_PROFILE_LEN`], whichever is smaller.
pub fn profile_hash<R, G, H>(
    region: &R,
    rng: &mut G,
    hasher: &mut H,
    message: &[u8],
    trials: usize,
) -> Vec<StackSample, PROFILE_SIZES>
where
    R: StackRegion + ?Sized,
    G: RngCore,
    H: HashPrimitive,
{
    let max = message.len().min(MAX_PROFILE_LEN);
    let mut samples = Vec::new();
    let mut input_len = 0;
    loop {
        let input = &message[..input_len];
        let depth = measure_stack_depth(region, rng, trials, || {
            let _ = black_box(hasher.hash(&[black_box(input)]));
        });
        info!("hash of {} bytes: {} stack bytes", input_len, depth);
        if samples.push(StackSample { input_len, depth }).is_err() {
            break;
        }
        input_len = if input_len == 0 { 1 } else { input_len * 2 };
        if input_len > max {
            break;
        }
    }
    samples
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::HASH_BYTES;
    use crate::hash::Digest;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;

    const STACK_LEN: usize = 256;

    /// A fake stack growing down from the end of an array.
    struct SimulatedStack {
        cells: [Cell<u8>; STACK_LEN],
        painted: Cell<usize>,
    }

    impl SimulatedStack {
        fn new() -> Self {
            Self {
                cells: core::array::from_fn(|_| Cell::new(0)),
                painted: Cell::new(0),
            }
        }

        /// Overwrites the top `depth` bytes, as a call that deep would.
        fn touch(&self, depth: usize) {
            for cell in &self.cells[STACK_LEN - depth..] {
                cell.set(cell.get().wrapping_add(1));
            }
        }
    }

    impl StackRegion for SimulatedStack {
        fn paint(&self, sentinel: u8) -> usize {
            for cell in &self.cells {
                cell.set(sentinel);
            }
            self.painted.set(STACK_LEN);
            STACK_LEN
        }

        fn intact(&self, sentinel: u8) -> usize {
            self.cells[..self.painted.get()]
                .iter()
                .take_while(|cell| cell.get() == sentinel)
                .count()
        }
    }

    /// Pretends to use 16 bytes of stack plus one per 8 input bytes.
    struct StackHungryHash<'s> {
        stack: &'s SimulatedStack,
    }

    impl HashPrimitive for StackHungryHash<'_> {
        fn hash(&mut self, parts: &[&[u8]]) -> Digest {
            let len: usize = parts.iter().map(|p| p.len()).sum();
            self.stack.touch(16 + len / 8);
            [0u8; HASH_BYTES]
        }
    }

    #[test]
    fn test_measures_touched_depth() {
        let stack = SimulatedStack::new();
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let depth = measure_stack_depth(&stack, &mut rng, 5, || stack.touch(40));
        assert_eq!(depth, 40);
    }

    #[test]
    fn test_reports_worst_trial() {
        let stack = SimulatedStack::new();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let depths = [10, 70, 30];
        let mut trial = 0;
        let depth = measure_stack_depth(&stack, &mut rng, depths.len(), || {
            stack.touch(depths[trial]);
            trial += 1;
        });
        assert_eq!(depth, 70);
        assert_eq!(trial, 3);
    }

    #[test]
    fn test_untouched_stack_has_no_depth() {
        let stack = SimulatedStack::new();
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        assert_eq!(measure_stack_depth(&stack, &mut rng, 4, || {}), 0);
        assert_eq!(measure_stack_depth(&stack, &mut rng, 0, || stack.touch(9)), 0);
    }

    #[test]
    fn test_profile_hash_sizes() {
        let stack = SimulatedStack::new();
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let mut hasher = StackHungryHash { stack: &stack };
        let message = [0xa5u8; 100];

        let samples = profile_hash(&stack, &mut rng, &mut hasher, &message, 3);
        let lens: std::vec::Vec<usize> = samples.iter().map(|s| s.input_len).collect();
        assert_eq!(lens, [0, 1, 2, 4, 8, 16, 32, 64]);
        assert_eq!(samples[0], StackSample { input_len: 0, depth: 16 });
        assert_eq!(samples[7], StackSample { input_len: 64, depth: 24 });
    }

    #[test]
    fn test_profile_hash_caps_input_length() {
        let stack = SimulatedStack::new();
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let mut hasher = StackHungryHash { stack: &stack };
        let message = [0u8; 2 * MAX_PROFILE_LEN];

        let samples = profile_hash(&stack, &mut rng, &mut hasher, &message, 1);
        assert_eq!(samples.len(), PROFILE_SIZES);
        let last = samples[PROFILE_SIZES - 1];
        assert_eq!(last.input_len, MAX_PROFILE_LEN);
        assert_eq!(last.depth, 16 + MAX_PROFILE_LEN / 8);
    }

    #[test]
    fn test_raw_region_above_stack_paints_nothing() {
        let mut frame = [0u8; 16];
        // The array lives in this frame, above the stack pointer of `paint`.
        let region = unsafe { RawStackRegion::new(frame.as_mut_ptr(), 0) };
        assert_eq!(region.paint(0x5a), 0);
        assert_eq!(region.intact(0x5a), 0);
        assert_eq!(frame, [0u8; 16]);
    }
}

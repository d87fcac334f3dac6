//! Allocation and stack-usage statistics (§4.6).
//!
//! Field order matches §6 exactly: counts, then byte/block totals, then
//! peak, then stack totals, then expanded, then naive.

/// Snapshot returned by `get_stats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    // counts
    pub n_active: usize,
    pub n_total: usize,
    // byte/block totals
    pub bytes_allocated: usize,
    pub blocks_allocated: usize,
    pub blocks_allocated_total: usize,
    // peak
    pub bytes_allocated_peak: usize,
    pub blocks_allocated_peak: usize,
    // stack totals
    pub stack_bytes: usize,
    pub stack_count: usize,
    pub stack_chunk_count: usize,
    // expanded (sum of chunk bytes counting every sharer of a shared stack)
    pub stack_bytes_expanded: usize,
    // naive (bytes needed to hold each coroutine's entire [near,far] extent
    // in one block, ignoring slicing)
    pub stack_bytes_naive: usize,
}

/// Running counters the family keeps incrementally so `get_stats` never has
/// to recompute anything beyond the two walk-based aggregates
/// (`stack_bytes_expanded`, `stack_bytes_naive`).
#[derive(Debug, Clone, Copy, Default)]
pub struct Counters {
    pub n_active: usize,
    pub n_total: usize,
    pub bytes_allocated: usize,
    pub blocks_allocated: usize,
    pub blocks_allocated_total: usize,
    pub bytes_allocated_peak: usize,
    pub blocks_allocated_peak: usize,
    pub stack_bytes: usize,
    pub stack_count: usize,
    pub stack_chunk_count: usize,
}

impl Counters {
    pub fn record_alloc(&mut self, size: usize, blocks: usize) {
        self.bytes_allocated += size;
        self.blocks_allocated += blocks;
        self.blocks_allocated_total += blocks;
        if self.bytes_allocated > self.bytes_allocated_peak {
            self.bytes_allocated_peak = self.bytes_allocated;
        }
        if self.blocks_allocated > self.blocks_allocated_peak {
            self.blocks_allocated_peak = self.blocks_allocated;
        }
    }

    pub fn record_free(&mut self, size: usize, blocks: usize) {
        debug_assert!(self.bytes_allocated >= size);
        debug_assert!(self.blocks_allocated >= blocks);
        self.bytes_allocated -= size;
        self.blocks_allocated -= blocks;
    }

    pub fn reset_peak(&mut self) {
        self.bytes_allocated_peak = self.bytes_allocated;
        self.blocks_allocated_peak = self.blocks_allocated;
    }
}

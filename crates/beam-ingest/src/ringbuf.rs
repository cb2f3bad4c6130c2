//! Per-beam telescoping ring buffer. Levels 0..L-1, each a FIFO deque of
//! strong chunk references; eviction from level `l` pairs two adjacent
//! evicted chunks, downsamples them, and pushes the result to level `l+1`.
//!
//! Resolves the "cyclic ownership" design note (see SPEC_FULL.md §4.5/§9) by
//! having the parent own all levels directly and drive eviction from its own
//! `push`, rather than giving each level a back-pointer to the parent (as
//! `ringbuf.cpp`'s `AssembledChunkRingbuf`/`L1Ringbuf` does).

use std::collections::VecDeque;
use std::sync::Arc;

use crate::chunk::AssembledChunk;
use crate::error::ConstructError;

/// One time-binning level: a bounded FIFO of chunk references.
struct Level {
    capacity: usize,
    chunks: VecDeque<Arc<AssembledChunk>>,
}

impl Level {
    fn new(capacity: usize) -> Self {
        Level {
            capacity,
            chunks: VecDeque::with_capacity(capacity),
        }
    }

    /// Push a chunk; if at capacity, pop and return the oldest as evicted.
    fn push(&mut self, chunk: Arc<AssembledChunk>) -> Option<Arc<AssembledChunk>> {
        let evicted = if self.chunks.len() >= self.capacity {
            self.chunks.pop_front()
        } else {
            None
        };
        self.chunks.push_back(chunk);
        evicted
    }
}

/// Multi-level, per-beam aging buffer with pairwise downsample-on-eviction.
pub struct TelescopingRingbuf {
    levels: Vec<Level>,
    /// One pending (odd, awaiting-partner) evicted chunk per level except
    /// the last.
    pending: Vec<Option<Arc<AssembledChunk>>>,
    /// Chunks released from the last level accumulate here for inspection/
    /// tests; production use simply drops them (Arc refcount reaches zero).
    released: Vec<Arc<AssembledChunk>>,
    keep_released: bool,
}

impl TelescopingRingbuf {
    pub fn new(capacities: &[usize]) -> Result<Self, ConstructError> {
        if capacities.iter().any(|&n| n < 2) {
            return Err(ConstructError::BadTelescopingCapacity);
        }
        let levels = capacities.iter().map(|&n| Level::new(n)).collect();
        let pending = vec![None; capacities.len().saturating_sub(1)];
        Ok(TelescopingRingbuf {
            levels,
            pending,
            released: Vec::new(),
            keep_released: false,
        })
    }

    #[cfg(test)]
    fn new_tracking_released(capacities: &[usize]) -> Result<Self, ConstructError> {
        let mut rb = Self::new(capacities)?;
        rb.keep_released = true;
        Ok(rb)
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn level_len(&self, level: usize) -> usize {
        self.levels[level].chunks.len()
    }

    pub fn level_snapshot(&self, level: usize) -> Vec<Arc<AssembledChunk>> {
        self.levels[level].chunks.iter().cloned().collect()
    }

    /// Push a shared, freshly-closed native-rate chunk onto level 0 (the
    /// same `Arc` handle a caller may also hold downstream — no data is
    /// copied). Drives eviction/downsample/promotion up through the levels
    /// as needed.
    pub fn push(&mut self, chunk: Arc<AssembledChunk>) {
        let mut current = chunk;
        let mut level = 0usize;
        loop {
            let evicted = self.levels[level].push(current.clone());
            let Some(evicted) = evicted else { break };
            match self.dropping(level, evicted) {
                Some(merged) => {
                    current = Arc::new(merged);
                    level += 1;
                    if level >= self.levels.len() {
                        break;
                    }
                    continue;
                }
                None => break,
            }
        }
    }

    /// Called when `chunk_evicted` is dropped from `level`. If `level` is
    /// the last level, release it. Otherwise hold it in `pending[level]`
    /// until a second chunk arrives, then downsample the pair and return
    /// the merged chunk for the caller to push onto `level+1`.
    fn dropping(&mut self, level: usize, chunk_evicted: Arc<AssembledChunk>) -> Option<AssembledChunk> {
        if level >= self.levels.len() - 1 {
            if self.keep_released {
                self.released.push(chunk_evicted);
            }
            return None;
        }

        match self.pending[level].take() {
            Some(first) => {
                let (a, b) = if first.ichunk <= chunk_evicted.ichunk {
                    (first, chunk_evicted)
                } else {
                    (chunk_evicted, first)
                };
                Some(AssembledChunk::downsample(&a, &b))
            }
            None => {
                self.pending[level] = Some(chunk_evicted);
                None
            }
        }
    }

    /// Ordered `(chunk, binning)` list across all levels, filtered by fpga
    /// overlap with `[min_fpga, max_fpga]`.
    pub fn snapshot(&self, min_fpga: u64, max_fpga: u64) -> Vec<(Arc<AssembledChunk>, u32)> {
        let mut out = Vec::new();
        for level in &self.levels {
            for ch in &level.chunks {
                if ch.fpga_end > min_fpga && ch.fpga_begin < max_fpga {
                    out.push((ch.clone(), ch.binning));
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(ichunk: u64, binning: u32) -> AssembledChunk {
        let mut ch = AssembledChunk::new(7, 2, 4, 10, 8, binning, ichunk, 0).unwrap();
        ch.fpga_begin = ichunk * 8 * 10 * binning as u64;
        ch.fpga_end = ch.fpga_begin + 8 * 10 * binning as u64;
        ch
    }

    #[test]
    fn telescoping_retains_capacities_and_promotes_pairs() {
        // With per-level capacity 2, a chunk only reaches level 2 once
        // level 1 has evicted *twice*, which needs 4 arrivals at level 1,
        // which needs 8 evictions from level 0, i.e. 10 native pushes (the
        // first 2 pushes fill level 0 without evicting). 8 native pushes,
        // as in the narrative scenario this models, fills level 0 and
        // level 1 but leaves level 2 still empty with one chunk pending a
        // partner — asserted below alongside the 10-push cascade.
        let mut rb = TelescopingRingbuf::new_tracking_released(&[2, 2, 2]).unwrap();
        for i in 0..10u64 {
            rb.push(Arc::new(chunk(i, 1)));
        }

        assert_eq!(rb.level_len(0), 2);
        let lvl0: Vec<u64> = rb.level_snapshot(0).iter().map(|c| c.ichunk).collect();
        assert_eq!(lvl0, vec![8, 9]);

        assert_eq!(rb.level_len(1), 2);
        for c in rb.level_snapshot(1) {
            assert_eq!(c.binning, 2);
        }
        let lvl1: Vec<u64> = rb.level_snapshot(1).iter().map(|c| c.ichunk).collect();
        // Binning-2 chunks sit on the native-rate timeline, so adjacent
        // entries differ by 2^1 = 2 (not 1).
        assert_eq!(lvl1, vec![4, 6]);

        assert_eq!(rb.level_len(2), 1);
        for c in rb.level_snapshot(2) {
            assert_eq!(c.binning, 4);
        }
        assert_eq!(rb.released.len(), 0);
    }

    #[test]
    fn eight_native_pushes_leave_level_two_still_empty() {
        let mut rb = TelescopingRingbuf::new_tracking_released(&[2, 2, 2]).unwrap();
        for i in 0..8u64 {
            rb.push(Arc::new(chunk(i, 1)));
        }
        assert_eq!(rb.level_len(0), 2);
        assert_eq!(rb.level_len(1), 2);
        assert_eq!(rb.level_len(2), 0);
    }

    #[test]
    fn last_level_eviction_releases_chunk() {
        let mut rb = TelescopingRingbuf::new_tracking_released(&[2]).unwrap();
        for i in 0..5u64 {
            rb.push(Arc::new(chunk(i, 1)));
        }
        assert_eq!(rb.level_len(0), 2);
        assert_eq!(rb.released.len(), 3);
    }

    #[test]
    fn rejects_capacity_below_two() {
        assert!(TelescopingRingbuf::new(&[2, 1]).is_err());
    }

    #[test]
    fn ichunk_spacing_is_2_pow_level_at_every_level() {
        let mut rb = TelescopingRingbuf::new(&[2, 2, 2]).unwrap();
        for i in 0..30u64 {
            rb.push(Arc::new(chunk(i, 1)));
        }
        for level in 0..rb.num_levels() {
            let want_spacing = 1u64 << level;
            let ichunks: Vec<u64> = rb.level_snapshot(level).iter().map(|c| c.ichunk).collect();
            for pair in ichunks.windows(2) {
                assert_eq!(pair[1] - pair[0], want_spacing, "level {level} spacing");
            }
        }
    }
}

use std::sync::atomic::{AtomicUsize, Ordering};

/// Round-robin cursor over a producer's partition set.
///
/// The cursor starts at the first partition and wraps after the last. The
/// atomic advance keeps concurrent `produce` callers on one producer valid
/// (interleaved but still round-robin); no weighting, no randomness.
pub(crate) struct PartitionRouter {
    partitions: Vec<u32>,
    cursor: AtomicUsize,
}

impl PartitionRouter {
    pub fn new(partitions: Vec<u32>) -> Self {
        debug_assert!(!partitions.is_empty());
        Self {
            partitions,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn next(&self) -> u32 {
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.partitions.len();
        self.partitions[idx]
    }

    pub fn partitions(&self) -> &[u32] {
        &self.partitions
    }
}

//! Counters for monitoring cache behavior.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::memory_budget::MemoryPressure;

/// Live counters of a single cache reader.
#[derive(Debug, Default)]
pub struct ReaderCounters {
    memory_hits: AtomicU64,
    file_reads: AtomicU64,
    source_reads: AtomicU64,
    tiles_written: AtomicU64,
    failed_file_reads: AtomicU64,
    failed_writes: AtomicU64,
    source_failures: AtomicU64,
    invalidations: AtomicU64,
}

macro_rules! counter {
    ($inc:ident, $field:ident) => {
        pub(crate) fn $inc(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl ReaderCounters {
    counter!(record_memory_hit, memory_hits);
    counter!(record_file_read, file_reads);
    counter!(record_source_read, source_reads);
    counter!(record_tile_written, tiles_written);
    counter!(record_failed_file_read, failed_file_reads);
    counter!(record_failed_write, failed_writes);
    counter!(record_source_failure, source_failures);
    counter!(record_invalidation, invalidations);

    pub fn snapshot(&self) -> ReaderStats {
        ReaderStats {
            memory_hits: self.memory_hits.load(Ordering::Relaxed),
            file_reads: self.file_reads.load(Ordering::Relaxed),
            source_reads: self.source_reads.load(Ordering::Relaxed),
            tiles_written: self.tiles_written.load(Ordering::Relaxed),
            failed_file_reads: self.failed_file_reads.load(Ordering::Relaxed),
            failed_writes: self.failed_writes.load(Ordering::Relaxed),
            source_failures: self.source_failures.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of a reader's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReaderStats {
    /// Tiles served from a resident buffer
    pub memory_hits: u64,
    /// Tiles loaded from the cache file
    pub file_reads: u64,
    /// Tiles loaded from the source reader
    pub source_reads: u64,
    /// Tiles written to the cache file
    pub tiles_written: u64,
    /// Cache file reads that failed and fell back to the source
    pub failed_file_reads: u64,
    /// Tile writes that failed during a flush
    pub failed_writes: u64,
    /// Source reads that failed and produced an empty tile
    pub source_failures: u64,
    /// Full invalidations because the source changed
    pub invalidations: u64,
}

impl ReaderStats {
    /// Fraction of tile lookups served from memory (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.memory_hits + self.file_reads + self.source_reads + self.source_failures;
        if total == 0 {
            0.0
        } else {
            self.memory_hits as f64 / total as f64
        }
    }
}

/// Snapshot of the cache manager
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ManagerStats {
    /// Live registered readers
    pub readers: usize,
    /// Bytes of resident tile buffers
    pub memory_used: usize,
    pub memory_budget: usize,
    /// Bytes of cache files on disk
    pub disk_used: usize,
    pub disk_budget: usize,
    /// Readers whose memory was released to make room
    pub evictions: u64,
    /// Cache files deleted to stay within the disk budget
    pub files_deleted: u64,
    pub pressure: MemoryPressure,
}

impl ManagerStats {
    /// Memory utilization (0.0 to 1.0)
    pub fn memory_utilization(&self) -> f64 {
        if self.memory_budget == 0 {
            0.0
        } else {
            self.memory_used as f64 / self.memory_budget as f64
        }
    }

    /// Disk utilization (0.0 to 1.0)
    pub fn disk_utilization(&self) -> f64 {
        if self.disk_budget == 0 {
            0.0
        } else {
            self.disk_used as f64 / self.disk_budget as f64
        }
    }
}

//! Byte buffer allocation.
//!
//! Every tile-sized buffer is allocated here. Buffers meant to stay resident
//! in a cache are announced to the [`CacheManager`] first, which may evict
//! other readers' tiles to make room.

use std::sync::Arc;

use tracing::{error, trace};

use crate::error::{CacheError, CacheResult};
use crate::manager::CacheManager;

/// Allocator of zero-filled byte buffers.
#[derive(Clone)]
pub struct ByteBufferAllocator {
    manager: Option<Arc<CacheManager>>,
}

impl ByteBufferAllocator {
    /// Allocator whose cache buffers are accounted by `manager`.
    pub fn new(manager: Arc<CacheManager>) -> Self {
        Self {
            manager: Some(manager),
        }
    }

    /// Allocator without any budget accounting.
    pub fn unmanaged() -> Self {
        Self { manager: None }
    }

    /// Allocates a zero-filled buffer of `size` bytes.
    ///
    /// With `for_cache` the manager is asked to free at least `size` bytes
    /// first and the buffer's capacity is charged to the memory budget; the
    /// caller hands the charge back with [`release`](Self::release). `direct`
    /// is a placement hint and has no effect on the heap allocation made here.
    ///
    /// # Errors
    /// [`CacheError::Allocation`] if the memory cannot be reserved.
    pub fn allocate(&self, size: usize, direct: bool, for_cache: bool) -> CacheResult<Vec<u8>> {
        trace!(size, direct, for_cache, "Allocating buffer");
        let manager = self.manager.as_deref().filter(|_| for_cache);
        if let Some(manager) = manager {
            manager.free_memory(size);
        }

        let mut buffer = Vec::new();
        if buffer.try_reserve_exact(size).is_err() {
            if let Some(manager) = manager {
                manager.release_memory(size);
            }
            error!(size, "Could not allocate buffer");
            return Err(CacheError::Allocation { size });
        }
        buffer.resize(size, 0);

        if let Some(manager) = manager {
            let extra = buffer.capacity() - size;
            if extra > 0 {
                manager.record_memory(extra);
            }
        }
        Ok(buffer)
    }

    /// Returns the charge of a cache buffer of `capacity` bytes to the budget.
    pub fn release(&self, capacity: usize) {
        if let Some(manager) = &self.manager {
            manager.release_memory(capacity);
        }
    }
}

impl std::fmt::Debug for ByteBufferAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteBufferAllocator")
            .field("managed", &self.manager.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;

    fn manager(budget: u64) -> Arc<CacheManager> {
        let dir = std::env::temp_dir();
        CacheManager::new(
            CacheConfig::default()
                .with_memory_budget(budget)
                .with_cache_dir(dir),
        )
    }

    #[test]
    fn test_unmanaged_allocation_is_zeroed() {
        let allocator = ByteBufferAllocator::unmanaged();
        let buffer = allocator.allocate(1024, false, true).unwrap();
        assert_eq!(buffer.len(), 1024);
        assert!(buffer.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_cache_allocation_is_charged() {
        let manager = manager(1 << 20);
        let allocator = ByteBufferAllocator::new(Arc::clone(&manager));

        let buffer = allocator.allocate(4096, true, true).unwrap();
        assert_eq!(manager.currently_used_memory(), buffer.capacity());

        allocator.release(buffer.capacity());
        assert_eq!(manager.currently_used_memory(), 0);
    }

    #[test]
    fn test_plain_allocation_is_not_charged() {
        let manager = manager(1 << 20);
        let allocator = ByteBufferAllocator::new(Arc::clone(&manager));

        let _buffer = allocator.allocate(4096, false, false).unwrap();
        assert_eq!(manager.currently_used_memory(), 0);
    }

    #[test]
    fn test_impossible_allocation_fails() {
        let manager = manager(1 << 20);
        let allocator = ByteBufferAllocator::new(Arc::clone(&manager));

        let err = allocator.allocate(usize::MAX, false, true).unwrap_err();
        assert!(matches!(err, CacheError::Allocation { size: usize::MAX }));
        assert_eq!(manager.currently_used_memory(), 0);
    }
}

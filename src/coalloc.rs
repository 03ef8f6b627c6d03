//! CO-Allocation Module
//!
//! Sub-allocates small context objects (query results, stream-output
//! declarations) out of larger kernel allocations. Each allocation is split
//! into at most 64 blocks tracked by a bitmap and an ordered offset array.

use tracing::debug;

use crate::error::{DxError, DxResult};
use crate::kernel::{AllocationHandle, KernelCallbacks, LockFlags};
use crate::protocol::{AllocationDesc, AllocationKind};

/// Maximum number of blocks per CO-allocation.
pub const CO_BLOCK_COUNT: usize = 64;

/// A kernel allocation carved into up to [`CO_BLOCK_COUNT`] blocks.
///
/// Block `i` spans `offsets[i]..offsets[i + 1]`; the last block extends to the
/// end of the allocation. Block 0 always starts at 0.
#[derive(Debug, Clone)]
pub struct CoAllocation {
    handle: AllocationHandle,
    size: u32,
    used: u64,
    offsets: [u32; CO_BLOCK_COUNT],
}

impl CoAllocation {
    pub fn new(handle: AllocationHandle, size: u32) -> Self {
        let mut offsets = [size; CO_BLOCK_COUNT];
        offsets[0] = 0;
        Self {
            handle,
            size,
            used: 0,
            offsets,
        }
    }

    pub fn handle(&self) -> AllocationHandle {
        self.handle
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn used_blocks(&self) -> u32 {
        self.used.count_ones()
    }

    fn is_used(&self, block: usize) -> bool {
        self.used & (1u64 << block) != 0
    }

    fn block_end(&self, block: usize) -> u32 {
        if block + 1 < CO_BLOCK_COUNT {
            self.offsets[block + 1]
        } else {
            self.size
        }
    }

    /// Byte range of a used block.
    pub fn block_range(&self, offset: u32) -> Option<std::ops::Range<u32>> {
        let block = (0..CO_BLOCK_COUNT)
            .find(|&i| self.is_used(i) && self.offsets[i] == offset)?;
        Some(offset..self.block_end(block))
    }

    /// First-fit allocation of `size` bytes. Returns the block offset.
    pub fn alloc(&mut self, size: u32) -> Option<u32> {
        for block in 0..CO_BLOCK_COUNT {
            if self.is_used(block) {
                continue;
            }
            let start = self.offsets[block];
            if self.block_end(block) - start < size {
                continue;
            }

            self.used |= 1u64 << block;
            // Keep the used block minimal by handing the rest to a free successor.
            if block + 1 < CO_BLOCK_COUNT && !self.is_used(block + 1) {
                self.offsets[block + 1] = start + size;
            }
            return Some(start);
        }
        None
    }

    /// Release the block starting at `offset`. Returns false when no used
    /// block starts there.
    pub fn free(&mut self, offset: u32) -> bool {
        let block = (0..CO_BLOCK_COUNT)
            .find(|&i| self.offsets[i] == offset && self.is_used(i));
        match block {
            Some(block) => {
                self.used &= !(1u64 << block);
                true
            }
            None => {
                debug_assert!(false, "freeing unused CO block at {offset}");
                false
            }
        }
    }
}

/// What a chain of CO-allocations holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoPurpose {
    Queries,
    StreamOutput,
}

/// A block handed out by a [`CoAllocationChain`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoBlock {
    pub handle: AllocationHandle,
    pub offset: u32,
    pub size: u32,
}

/// All CO-allocations of one purpose.
#[derive(Debug)]
pub struct CoAllocationChain {
    purpose: CoPurpose,
    links: Vec<CoAllocation>,
}

impl CoAllocationChain {
    pub fn new(purpose: CoPurpose) -> Self {
        Self {
            purpose,
            links: Vec::new(),
        }
    }

    pub fn purpose(&self) -> CoPurpose {
        self.purpose
    }

    pub fn links(&self) -> &[CoAllocation] {
        &self.links
    }

    /// Try every existing link in order.
    pub fn alloc(&mut self, size: u32) -> Option<CoBlock> {
        self.links.iter_mut().find_map(|link| {
            link.alloc(size).map(|offset| CoBlock {
                handle: link.handle(),
                offset,
                size,
            })
        })
    }

    /// Allocate from the chain, creating a `link_size`-byte link through the
    /// kernel when no existing link has room.
    pub fn alloc_or_grow<K: KernelCallbacks>(
        &mut self,
        kernel: &mut K,
        size: u32,
        link_size: u32,
    ) -> DxResult<CoBlock> {
        if let Some(block) = self.alloc(size) {
            return Ok(block);
        }

        let link = create_co_allocation(kernel, link_size.max(size))?;
        debug!(
            "New {:?} CO-allocation {} ({} bytes)",
            self.purpose,
            link.handle(),
            link.size()
        );
        self.links.push(link);
        self.alloc(size).ok_or_else(|| {
            DxError::out_of_memory(format!("{size}-byte {:?} block", self.purpose))
        })
    }

    pub fn free(&mut self, block: CoBlock) -> bool {
        match self.links.iter_mut().find(|link| link.handle() == block.handle) {
            Some(link) => link.free(block.offset),
            None => {
                debug_assert!(false, "block from unknown CO-allocation {}", block.handle);
                false
            }
        }
    }

    /// Remove every link, returning their kernel handles.
    pub fn take_handles(&mut self) -> Vec<AllocationHandle> {
        self.links.drain(..).map(|link| link.handle()).collect()
    }
}

/// Allocate and zero a CO-allocation of `size` bytes.
pub fn create_co_allocation<K: KernelCallbacks>(
    kernel: &mut K,
    size: u32,
) -> DxResult<CoAllocation> {
    let desc = AllocationDesc {
        kind: AllocationKind::ContextObjects as u32,
        size,
        ..Default::default()
    };
    let handle = kernel
        .allocate(&desc)
        .map_err(|e| DxError::kernel("allocate", e))?;

    let zeroed = kernel
        .lock(handle, LockFlags::WRITE_ONLY)
        .map(|mut region| region.as_mut_slice().fill(0))
        .and_then(|()| kernel.unlock(&[handle]));
    if let Err(e) = zeroed {
        let _ = kernel.deallocate(&[handle]);
        return Err(DxError::kernel("lock", e));
    }

    Ok(CoAllocation::new(handle, size))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overlaps(a: &std::ops::Range<u32>, b: &std::ops::Range<u32>) -> bool {
        a.start < b.end && b.start < a.end
    }

    #[test]
    fn test_fresh_allocation_layout() {
        let co = CoAllocation::new(AllocationHandle(1), 4096);
        assert_eq!(co.offsets[0], 0);
        assert!(co.offsets[1..].iter().all(|&o| o == 4096));
        assert_eq!(co.used_blocks(), 0);
    }

    #[test]
    fn test_sequential_allocations_are_packed() {
        let mut co = CoAllocation::new(AllocationHandle(1), 4096);
        assert_eq!(co.alloc(12), Some(0));
        assert_eq!(co.alloc(12), Some(12));
        assert_eq!(co.alloc(100), Some(24));
        assert_eq!(co.block_range(12), Some(12..24));
    }

    #[test]
    fn test_free_block_is_reused_first_fit() {
        let mut co = CoAllocation::new(AllocationHandle(1), 4096);
        let a = co.alloc(16).unwrap();
        let b = co.alloc(16).unwrap();
        assert!(co.free(a));
        // Smaller request fits into the freed first block, successor is used.
        assert_eq!(co.alloc(8), Some(0));
        assert_eq!(co.block_range(0), Some(0..16));
        assert_eq!(co.block_range(b), Some(16..32));
    }

    #[test]
    fn test_alloc_free_cycle_does_not_leak() {
        let mut co = CoAllocation::new(AllocationHandle(1), 256);
        for i in 0..1000u32 {
            let size = 8 + (i % 5) * 8;
            let offset = co.alloc(size).expect("cycle must not exhaust the link");
            assert!(co.free(offset));
        }
        assert_eq!(co.used_blocks(), 0);
    }

    #[test]
    fn test_at_most_64_blocks() {
        let mut co = CoAllocation::new(AllocationHandle(1), 4096);
        for _ in 0..CO_BLOCK_COUNT {
            assert!(co.alloc(4).is_some());
        }
        assert_eq!(co.alloc(4), None);
        assert_eq!(co.used_blocks(), 64);
    }

    #[test]
    fn test_last_block_extends_to_end() {
        let mut co = CoAllocation::new(AllocationHandle(1), 1024);
        for _ in 0..CO_BLOCK_COUNT - 1 {
            co.alloc(8).unwrap();
        }
        let last = co.alloc(500).unwrap();
        assert_eq!(last, 63 * 8);
        assert_eq!(co.block_range(last), Some(504..1024));
    }

    #[test]
    fn test_used_blocks_never_overlap() {
        let mut co = CoAllocation::new(AllocationHandle(1), 2048);
        let mut live = Vec::new();
        for i in 0..200u32 {
            if i % 3 == 2 && !live.is_empty() {
                let offset = live.remove((i as usize * 7) % live.len());
                assert!(co.free(offset));
            } else if let Some(offset) = co.alloc(4 + (i % 7) * 4) {
                live.push(offset);
            }
            let ranges: Vec<_> = live.iter().map(|&o| co.block_range(o).unwrap()).collect();
            for (x, a) in ranges.iter().enumerate() {
                for b in &ranges[x + 1..] {
                    assert!(!overlaps(a, b), "{a:?} overlaps {b:?}");
                }
            }
        }
    }

    #[test]
    fn test_chain_alloc_searches_links_in_order() {
        let mut chain = CoAllocationChain::new(CoPurpose::Queries);
        assert_eq!(chain.alloc(8), None);
        chain.links.push(CoAllocation::new(AllocationHandle(10), 16));
        chain.links.push(CoAllocation::new(AllocationHandle(11), 4096));

        let a = chain.alloc(16).unwrap();
        assert_eq!(a.handle, AllocationHandle(10));
        let b = chain.alloc(16).unwrap();
        assert_eq!(b.handle, AllocationHandle(11));

        assert!(chain.free(a));
        assert_eq!(chain.alloc(8).map(|b| b.handle), Some(AllocationHandle(10)));
        assert_eq!(
            chain.take_handles(),
            vec![AllocationHandle(10), AllocationHandle(11)]
        );
        assert!(chain.links().is_empty());
    }
}

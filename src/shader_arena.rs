//! Shader Arena Module
//!
//! Bump allocator over the single allocation that holds every shader's
//! bytecode and signatures for a device.

use std::fmt;

use crate::kernel::AllocationHandle;

/// A shader that has to move during a repack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderMove<K> {
    pub key: K,
    pub from: u32,
    pub to: u32,
    pub size: u32,
}

pub struct ShaderArena {
    handle: AllocationHandle,
    capacity: u32,
    offset_free: u32,
    available: u32,
}

impl ShaderArena {
    pub fn new(handle: AllocationHandle, capacity: u32) -> Self {
        Self {
            handle,
            capacity,
            offset_free: 0,
            available: capacity,
        }
    }

    pub fn handle(&self) -> AllocationHandle {
        self.handle
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Start of the never-used tail.
    pub fn offset_free(&self) -> u32 {
        self.offset_free
    }

    /// Bytes not held by live shaders, including holes below `offset_free`.
    pub fn available(&self) -> u32 {
        self.available
    }

    /// Contiguous bytes at the tail.
    pub fn contiguous(&self) -> u32 {
        self.capacity - self.offset_free
    }

    /// Bump-allocate `size` bytes from the tail.
    pub fn alloc(&mut self, size: u32) -> Option<u32> {
        if self.contiguous() < size {
            return None;
        }
        let offset = self.offset_free;
        self.offset_free += size;
        self.available -= size;
        Some(offset)
    }

    /// Whether packing the live shaders would make room for `size` bytes.
    pub fn fits_after_repack(&self, size: u32) -> bool {
        self.contiguous() < size && self.available >= size
    }

    /// Return a destroyed shader's bytes. The tail does not move.
    pub fn free(&mut self, size: u32) {
        debug_assert!(self.available + size <= self.capacity);
        self.available = (self.available + size).min(self.capacity);
    }

    /// Lay the live shaders out back to back from offset 0, in their current
    /// order, and move the tail to the packed end. Returns the shaders whose
    /// offset changed.
    pub fn repack<K: Copy>(&mut self, live: &[(K, u32, u32)]) -> Vec<ShaderMove<K>> {
        let mut ordered: Vec<_> = live.to_vec();
        ordered.sort_by_key(|&(_, offset, _)| offset);

        let mut cursor = 0u32;
        let mut moves = Vec::new();
        for (key, offset, size) in ordered {
            if offset != cursor {
                moves.push(ShaderMove {
                    key,
                    from: offset,
                    to: cursor,
                    size,
                });
            }
            cursor += size;
        }
        self.offset_free = cursor;
        debug_assert_eq!(self.capacity - cursor, self.available);
        moves
    }
}

impl fmt::Debug for ShaderArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShaderArena")
            .field("handle", &self.handle)
            .field("capacity", &self.capacity)
            .field("offset_free", &self.offset_free)
            .field("available", &self.available)
            .finish()
    }
}

//! Kernel Callbacks Module
//!
//! The interface the driver core consumes from the kernel-mode driver and
//! runtime: allocation management, CPU locking and command submission.

use std::fmt;
use std::ptr::NonNull;

use bitflags::bitflags;
use thiserror::Error;

use crate::protocol::AllocationDesc;

/// Kernel allocation handle. Zero means "no allocation".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AllocationHandle(pub u32);

impl AllocationHandle {
    pub const NULL: AllocationHandle = AllocationHandle(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for AllocationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Kernel submission context handle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ContextHandle(pub u32);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KernelError {
    #[error("allocation is still in use by the device")]
    WasStillDrawing,
    #[error("out of video memory")]
    OutOfMemory,
    #[error("invalid allocation handle {0}")]
    InvalidHandle(AllocationHandle),
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("device removed")]
    DeviceRemoved,
}

bitflags! {
    /// Flags for [`KernelCallbacks::lock`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct LockFlags: u32 {
        const READ_ONLY = 1 << 0;
        const WRITE_ONLY = 1 << 1;
        const DONOT_WAIT = 1 << 2;
        const DISCARD = 1 << 3;
        const NO_OVERWRITE = 1 << 4;
    }
}

/// CPU view of a locked allocation.
///
/// The pointer stays valid until the allocation is unlocked or deallocated.
/// The driver core never touches a region after its matching unlock.
#[derive(Debug)]
pub struct LockedRegion {
    handle: AllocationHandle,
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the region is the only accessor of its memory until unlock, so it
// may move to another thread together with its owner.
unsafe impl Send for LockedRegion {}

impl LockedRegion {
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `len` bytes until `handle`
    /// is unlocked or deallocated, and nothing else may access that memory
    /// while the region is in use.
    pub unsafe fn new(handle: AllocationHandle, ptr: NonNull<u8>, len: usize) -> Self {
        Self { handle, ptr, len }
    }

    /// Handle of the locked allocation. Differs from the requested handle
    /// after a discard lock that renamed the allocation.
    pub fn handle(&self) -> AllocationHandle {
        self.handle
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: guaranteed by the contract of `LockedRegion::new`
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: guaranteed by the contract of `LockedRegion::new`
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

/// One entry of the per-batch allocation list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocationListEntry {
    pub handle: AllocationHandle,
    pub write_operation: bool,
}

/// Tells the kernel where in the command buffer an allocation is referenced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PatchLocation {
    pub allocation_index: u32,
    /// Byte offset of the patched `u32` field within the command buffer.
    pub patch_offset: u32,
    pub allocation_offset: u32,
    /// Command buffer cursor at the start of the referencing command.
    pub split_offset: u32,
    /// [`crate::protocol::AllocationKind`] of the referenced allocation.
    pub driver_id: u32,
}

/// Command buffer and list capacities handed out by the kernel.
#[derive(Debug)]
pub struct CommandBufferLease {
    pub command_buffer: Vec<u8>,
    pub allocation_list_capacity: usize,
    pub patch_list_capacity: usize,
}

/// A batch handed to [`KernelCallbacks::render`].
#[derive(Debug)]
pub struct Submission {
    pub context: ContextHandle,
    /// Whole command buffer; only the first `length` bytes are valid.
    pub command_buffer: Vec<u8>,
    pub length: usize,
    pub allocations: Vec<AllocationListEntry>,
    pub patches: Vec<PatchLocation>,
}

impl Submission {
    pub fn commands(&self) -> &[u8] {
        &self.command_buffer[..self.length]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OfferPriority {
    Low,
    #[default]
    Normal,
    High,
}

/// Callbacks into the kernel-mode driver.
pub trait KernelCallbacks {
    /// Create the submission context and its first command buffer.
    fn create_context(&mut self) -> Result<(ContextHandle, CommandBufferLease), KernelError>;

    fn destroy_context(&mut self, context: ContextHandle) -> Result<(), KernelError>;

    /// Allocate video memory described by the private descriptor.
    fn allocate(&mut self, desc: &AllocationDesc) -> Result<AllocationHandle, KernelError>;

    fn deallocate(&mut self, handles: &[AllocationHandle]) -> Result<(), KernelError>;

    fn lock(&mut self, handle: AllocationHandle, flags: LockFlags)
        -> Result<LockedRegion, KernelError>;

    fn unlock(&mut self, handles: &[AllocationHandle]) -> Result<(), KernelError>;

    /// Execute a batch and return the buffer to fill next.
    fn render(&mut self, submission: Submission) -> Result<CommandBufferLease, KernelError>;

    fn offer(&mut self, handles: &[AllocationHandle], priority: OfferPriority)
        -> Result<(), KernelError>;

    /// Reclaim offered allocations. Returns, per handle, whether the contents
    /// were discarded while offered.
    fn reclaim(&mut self, handles: &[AllocationHandle]) -> Result<Vec<bool>, KernelError>;
}

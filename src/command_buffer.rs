//! Command Buffer Module
//!
//! Assembles SVGA3D commands into the kernel-supplied command buffer and keeps
//! the allocation list and patch-location list the kernel needs to relocate
//! allocation references at submit time.

use bytemuck::Pod;
use tracing::trace;

use crate::error::{DxError, DxResult};
use crate::kernel::{
    AllocationHandle, AllocationListEntry, CommandBufferLease, ContextHandle, PatchLocation,
    Submission,
};
use crate::protocol::{command_name, AllocationKind, CmdHeader, SVGA3D_CMD_HEADER_SIZE};

/// Space reserved for one command. Consumed by [`CommandBuffer::commit`].
#[must_use = "a reservation must be committed"]
#[derive(Debug)]
pub struct Reservation {
    offset: usize,
    payload_len: usize,
    allocations_before: usize,
    patches_before: usize,
}

impl Reservation {
    /// Buffer offset of the command header.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Buffer offset of the first payload byte.
    pub fn payload_offset(&self) -> usize {
        self.offset + SVGA3D_CMD_HEADER_SIZE
    }

    pub fn payload_len(&self) -> usize {
        self.payload_len
    }
}

/// A reference from a command field to a kernel allocation.
#[derive(Debug, Clone, Copy)]
pub struct PatchRequest {
    /// Offset of the `u32` field within the command payload.
    pub field_offset: usize,
    pub kind: AllocationKind,
    pub handle: AllocationHandle,
    pub allocation_offset: u32,
    pub write: bool,
}

impl PatchRequest {
    pub fn new(field_offset: usize, kind: AllocationKind, handle: AllocationHandle) -> Self {
        Self {
            field_offset,
            kind,
            handle,
            allocation_offset: 0,
            write: false,
        }
    }

    pub fn written(mut self) -> Self {
        self.write = true;
        self
    }

    pub fn at_offset(mut self, allocation_offset: u32) -> Self {
        self.allocation_offset = allocation_offset;
        self
    }
}

pub struct CommandBuffer {
    buffer: Vec<u8>,
    used: usize,
    reserved: usize,
    allocations: Vec<AllocationListEntry>,
    allocation_capacity: usize,
    patches: Vec<PatchLocation>,
    patch_capacity: usize,
}

impl CommandBuffer {
    pub fn new(lease: CommandBufferLease) -> Self {
        let mut buffer = Self {
            buffer: Vec::new(),
            used: 0,
            reserved: 0,
            allocations: Vec::new(),
            allocation_capacity: 0,
            patches: Vec::new(),
            patch_capacity: 0,
        };
        buffer.install(lease);
        buffer
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Committed bytes.
    pub fn used(&self) -> usize {
        self.used
    }

    /// Bytes reserved by an uncommitted command.
    pub fn reserved(&self) -> usize {
        self.reserved
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    pub fn commands(&self) -> &[u8] {
        &self.buffer[..self.used]
    }

    pub fn allocations(&self) -> &[AllocationListEntry] {
        &self.allocations
    }

    pub fn patches(&self) -> &[PatchLocation] {
        &self.patches
    }

    pub fn allocation_capacity(&self) -> usize {
        self.allocation_capacity
    }

    pub fn patch_capacity(&self) -> usize {
        self.patch_capacity
    }

    /// Whether the current batch references `handle`.
    pub fn references(&self, handle: AllocationHandle) -> bool {
        self.allocations.iter().any(|entry| entry.handle == handle)
    }

    /// Whether a command of `payload_len` bytes with `relocations` patches
    /// only fits after the batch is submitted.
    pub fn needs_flush(&self, payload_len: usize, relocations: usize) -> bool {
        let needed = SVGA3D_CMD_HEADER_SIZE + payload_len;
        self.capacity() - self.used < needed
            || self.patch_capacity - self.patches.len() < relocations
            || self.allocation_capacity - self.allocations.len() < relocations
    }

    /// Largest payload a single command can carry in an empty buffer.
    pub fn max_payload(&self) -> usize {
        self.capacity().saturating_sub(SVGA3D_CMD_HEADER_SIZE)
    }

    /// Reserve a command and write its header. The caller flushes first when
    /// [`needs_flush`](Self::needs_flush) says so.
    pub fn reserve(
        &mut self,
        opcode: u32,
        payload_len: usize,
        relocations: usize,
    ) -> DxResult<Reservation> {
        debug_assert_eq!(self.reserved, 0, "reserve without commit");
        if self.reserved != 0 {
            return Err(DxError::invalid("previous reservation was not committed"));
        }
        if self.needs_flush(payload_len, relocations) {
            debug_assert!(false, "command does not fit an empty buffer");
            return Err(DxError::invalid(format!(
                "{} ({payload_len} bytes, {relocations} relocations) exceeds command buffer capacity",
                command_name(opcode)
            )));
        }
        let size = u32::try_from(payload_len)
            .map_err(|_| DxError::invalid("command payload too large"))?;

        let offset = self.used;
        let header = CmdHeader { id: opcode, size };
        self.buffer[offset..offset + SVGA3D_CMD_HEADER_SIZE]
            .copy_from_slice(bytemuck::bytes_of(&header));
        self.buffer[offset + SVGA3D_CMD_HEADER_SIZE..offset + SVGA3D_CMD_HEADER_SIZE + payload_len]
            .fill(0);
        self.reserved = SVGA3D_CMD_HEADER_SIZE + payload_len;

        trace!(
            "Reserve {} at {}: {} payload bytes",
            command_name(opcode),
            offset,
            payload_len
        );
        Ok(Reservation {
            offset,
            payload_len,
            allocations_before: self.allocations.len(),
            patches_before: self.patches.len(),
        })
    }

    pub fn payload_mut(&mut self, reservation: &Reservation) -> &mut [u8] {
        let start = reservation.payload_offset();
        &mut self.buffer[start..start + reservation.payload_len]
    }

    /// Copy raw bytes into the payload at `offset`.
    pub fn write_bytes(
        &mut self,
        reservation: &Reservation,
        offset: usize,
        bytes: &[u8],
    ) -> DxResult<()> {
        let end = offset
            .checked_add(bytes.len())
            .filter(|end| *end <= reservation.payload_len)
            .ok_or_else(|| {
                DxError::invalid(format!(
                    "write of {} bytes at {offset} overruns {}-byte payload",
                    bytes.len(),
                    reservation.payload_len
                ))
            })?;
        self.payload_mut(reservation)[offset..end].copy_from_slice(bytes);
        Ok(())
    }

    pub fn write<T: Pod>(&mut self, reservation: &Reservation, offset: usize, value: &T) -> DxResult<()> {
        self.write_bytes(reservation, offset, bytemuck::bytes_of(value))
    }

    /// Record that the `u32` field at `request.field_offset` of the reserved
    /// command refers to `request.handle`.
    ///
    /// The first registration of a handle in a batch fixes its write flag;
    /// later registrations never upgrade it.
    pub fn register_patch(
        &mut self,
        reservation: &Reservation,
        request: PatchRequest,
    ) -> DxResult<()> {
        if request.handle.is_null() {
            return Ok(());
        }
        if request.field_offset + 4 > reservation.payload_len {
            return Err(DxError::invalid(format!(
                "patch field at {} outside {}-byte payload",
                request.field_offset, reservation.payload_len
            )));
        }

        let allocation_index = match self
            .allocations
            .iter()
            .position(|entry| entry.handle == request.handle)
        {
            Some(index) => index,
            None => {
                if self.allocations.len() >= self.allocation_capacity {
                    debug_assert!(false, "allocation list overflow");
                    return Err(DxError::invalid("allocation list is full"));
                }
                self.allocations.push(AllocationListEntry {
                    handle: request.handle,
                    write_operation: request.write,
                });
                self.allocations.len() - 1
            }
        };

        if self.patches.len() >= self.patch_capacity {
            debug_assert!(false, "patch list overflow");
            return Err(DxError::invalid("patch location list is full"));
        }
        self.patches.push(PatchLocation {
            allocation_index: allocation_index as u32,
            patch_offset: (reservation.payload_offset() + request.field_offset) as u32,
            allocation_offset: request.allocation_offset,
            split_offset: self.used as u32,
            driver_id: request.kind as u32,
        });
        Ok(())
    }

    pub fn commit(&mut self, reservation: Reservation) {
        debug_assert_eq!(
            self.reserved,
            SVGA3D_CMD_HEADER_SIZE + reservation.payload_len,
            "commit does not match reservation"
        );
        debug_assert_eq!(self.used, reservation.offset);
        self.used += self.reserved;
        self.reserved = 0;
    }

    /// Drop an uncommitted command together with any relocations it
    /// registered.
    pub fn abandon(&mut self, reservation: Reservation) {
        debug_assert_eq!(self.used, reservation.offset);
        self.allocations.truncate(reservation.allocations_before);
        self.patches.truncate(reservation.patches_before);
        self.reserved = 0;
    }

    /// Hand the batch to the kernel. The buffer is empty until
    /// [`install`](Self::install) or [`discard`](Self::discard).
    pub fn take_submission(&mut self, context: ContextHandle) -> Submission {
        debug_assert_eq!(self.reserved, 0, "submit with an open reservation");
        let length = self.used;
        self.used = 0;
        self.reserved = 0;
        Submission {
            context,
            command_buffer: std::mem::take(&mut self.buffer),
            length,
            allocations: std::mem::take(&mut self.allocations),
            patches: std::mem::take(&mut self.patches),
        }
    }

    /// Start a new batch in the buffer returned by the kernel.
    pub fn install(&mut self, lease: CommandBufferLease) {
        self.buffer = lease.command_buffer;
        self.allocation_capacity = lease.allocation_list_capacity;
        self.patch_capacity = lease.patch_list_capacity;
        self.allocations = Vec::with_capacity(self.allocation_capacity);
        self.patches = Vec::with_capacity(self.patch_capacity);
        self.used = 0;
        self.reserved = 0;
    }

    /// Drop the current batch and continue with a fresh buffer of `capacity`
    /// bytes, used after a failed submit.
    pub fn discard(&mut self, capacity: usize) {
        self.install(CommandBufferLease {
            command_buffer: vec![0; capacity],
            allocation_list_capacity: self.allocation_capacity,
            patch_list_capacity: self.patch_capacity,
        });
    }
}

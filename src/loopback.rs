//! Loopback Kernel Module
//!
//! In-process implementation of [`KernelCallbacks`]. Allocations live in
//! host memory, submitted batches are relocated and executed by the
//! [`CommandProcessor`], and failure injection exercises the device's error
//! paths. Used by the tests and the soak binary.

use std::collections::HashMap;
use std::ptr::NonNull;

use tracing::{debug, info, trace, warn};

use crate::command_processor::{CommandProcessor, MobMemory};
use crate::config::LoopbackConfig;
use crate::kernel::{
    AllocationHandle, CommandBufferLease, ContextHandle, KernelCallbacks, KernelError, LockFlags,
    LockedRegion, OfferPriority, Submission,
};
use crate::protocol::{AllocationDesc, CmdHeader, SVGA3D_CMD_HEADER_SIZE};

struct Allocation {
    desc: AllocationDesc,
    data: Box<[u8]>,
    locks: u32,
    offered: bool,
    discarded: bool,
    /// Non-blocking locks left to refuse before the allocation is idle.
    busy: u32,
    /// Replaced by a discard lock. Still readable by the batch in flight,
    /// released after the next submission.
    retired: bool,
}

/// Counters of everything the kernel has been asked to do.
#[derive(Debug, Clone, Default)]
pub struct LoopbackStats {
    pub submissions: u64,
    pub commands: u64,
    pub command_bytes: u64,
    /// Executed commands per opcode.
    pub histogram: HashMap<u32, u64>,
    pub allocations_created: u64,
    pub allocations_freed: u64,
    pub busy_refusals: u64,
    pub renames: u64,
}

/// A command as the host executed it, after relocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCommand {
    pub opcode: u32,
    pub payload: Vec<u8>,
}

struct Allocations<'a>(&'a mut HashMap<u32, Allocation>);

impl MobMemory for Allocations<'_> {
    fn mob(&self, id: u32) -> Option<&[u8]> {
        self.0.get(&id).map(|a| &a.data[..])
    }

    fn mob_mut(&mut self, id: u32) -> Option<&mut [u8]> {
        self.0.get_mut(&id).map(|a| &mut a.data[..])
    }

    fn mob_desc(&self, id: u32) -> Option<AllocationDesc> {
        self.0.get(&id).map(|a| a.desc)
    }
}

pub struct LoopbackKernel {
    config: LoopbackConfig,
    allocations: HashMap<u32, Allocation>,
    next_handle: u32,
    contexts: Vec<ContextHandle>,
    next_context: u32,
    bytes_allocated: u64,
    fill_byte: u8,
    fail_allocations: u32,
    fail_submits: u32,
    processor: CommandProcessor,
    recorded: Vec<RecordedCommand>,
    stats: LoopbackStats,
}

impl Default for LoopbackKernel {
    fn default() -> Self {
        Self::new(LoopbackConfig::default())
    }
}

impl LoopbackKernel {
    pub fn new(config: LoopbackConfig) -> Self {
        Self {
            config,
            allocations: HashMap::new(),
            next_handle: 1,
            contexts: Vec::new(),
            next_context: 1,
            bytes_allocated: 0,
            fill_byte: 0,
            fail_allocations: 0,
            fail_submits: 0,
            processor: CommandProcessor::new(),
            recorded: Vec::new(),
            stats: LoopbackStats::default(),
        }
    }

    pub fn config(&self) -> &LoopbackConfig {
        &self.config
    }

    pub fn stats(&self) -> &LoopbackStats {
        &self.stats
    }

    /// Make the next `count` allocations fail with out-of-memory.
    pub fn fail_next_allocations(&mut self, count: u32) {
        self.fail_allocations = count;
    }

    /// Make the next `count` submissions fail with device-removed.
    pub fn fail_next_submits(&mut self, count: u32) {
        self.fail_submits = count;
    }

    /// Byte new allocations are filled with.
    pub fn set_fill_byte(&mut self, byte: u8) {
        self.fill_byte = byte;
    }

    pub fn set_discard_offered(&mut self, discard: bool) {
        self.config.discard_offered = discard;
    }

    pub fn live_allocations(&self) -> usize {
        self.allocations.values().filter(|a| !a.retired).count()
    }

    pub fn live_contexts(&self) -> usize {
        self.contexts.len()
    }

    /// Bytes held by live allocations.
    pub fn bytes_allocated(&self) -> u64 {
        self.bytes_allocated
    }

    fn allocation(&self, handle: AllocationHandle) -> Option<&Allocation> {
        self.allocations.get(&handle.0).filter(|a| !a.retired)
    }

    pub fn allocation_desc(&self, handle: AllocationHandle) -> Option<AllocationDesc> {
        self.allocation(handle).map(|a| a.desc)
    }

    pub fn contents(&self, handle: AllocationHandle) -> Option<&[u8]> {
        self.allocation(handle).map(|a| &a.data[..])
    }

    pub fn is_offered(&self, handle: AllocationHandle) -> bool {
        self.allocation(handle).is_some_and(|a| a.offered)
    }

    pub fn current_fence(&self) -> u64 {
        self.processor.current_fence()
    }

    /// Commands executed since the last call, when recording is enabled.
    pub fn take_recorded(&mut self) -> Vec<RecordedCommand> {
        std::mem::take(&mut self.recorded)
    }

    fn lease(&self) -> CommandBufferLease {
        CommandBufferLease {
            command_buffer: vec![0; self.config.command_buffer_bytes as usize],
            allocation_list_capacity: self.config.allocation_list_entries as usize,
            patch_list_capacity: self.config.patch_list_entries as usize,
        }
    }

    fn new_allocation(&mut self, desc: &AllocationDesc) -> Result<AllocationHandle, KernelError> {
        if desc.size == 0 {
            return Err(KernelError::InvalidParameter("zero-sized allocation".to_string()));
        }
        if self.bytes_allocated + desc.size as u64 > self.config.video_memory_bytes {
            warn!(
                "Out of video memory: {} of {} bytes in use, {} requested",
                self.bytes_allocated, self.config.video_memory_bytes, desc.size
            );
            return Err(KernelError::OutOfMemory);
        }

        let handle = AllocationHandle(self.next_handle);
        self.next_handle += 1;
        self.allocations.insert(
            handle.0,
            Allocation {
                desc: *desc,
                data: vec![self.fill_byte; desc.size as usize].into_boxed_slice(),
                locks: 0,
                offered: false,
                discarded: false,
                busy: 0,
                retired: false,
            },
        );
        self.bytes_allocated += desc.size as u64;
        self.stats.allocations_created += 1;
        Ok(handle)
    }

    fn allocation_mut(&mut self, handle: AllocationHandle) -> Result<&mut Allocation, KernelError> {
        self.allocations
            .get_mut(&handle.0)
            .filter(|a| !a.retired)
            .ok_or(KernelError::InvalidHandle(handle))
    }

    /// Give a busy allocation new storage under a new handle, as a discard
    /// lock does when the device still reads the old contents.
    fn rename(&mut self, handle: AllocationHandle) -> Result<AllocationHandle, KernelError> {
        let desc = self.allocation_mut(handle)?.desc;
        let renamed = self.new_allocation(&desc)?;
        let old = self.allocation_mut(handle)?;
        old.retired = true;
        self.bytes_allocated -= desc.size as u64;
        self.stats.renames += 1;
        debug!("Renamed busy allocation {} to {}", handle, renamed);
        Ok(renamed)
    }

    /// Free the storage of allocations retired by a rename.
    fn drop_retired(&mut self) {
        let before = self.allocations.len();
        self.allocations.retain(|_, a| !a.retired);
        let freed = before - self.allocations.len();
        if freed > 0 {
            self.stats.allocations_freed += freed as u64;
            trace!("Dropped {} retired allocations", freed);
        }
    }

    fn relocate(&self, submission: &Submission) -> Result<Vec<u8>, KernelError> {
        if submission.allocations.len() > self.config.allocation_list_entries as usize
            || submission.patches.len() > self.config.patch_list_entries as usize
        {
            return Err(KernelError::InvalidParameter(format!(
                "{} allocations and {} patches exceed the list sizes",
                submission.allocations.len(),
                submission.patches.len()
            )));
        }

        let mut commands = submission.commands().to_vec();
        for patch in &submission.patches {
            let entry = submission
                .allocations
                .get(patch.allocation_index as usize)
                .ok_or_else(|| {
                    KernelError::InvalidParameter(format!(
                        "patch references allocation {}",
                        patch.allocation_index
                    ))
                })?;
            if !self.allocations.contains_key(&entry.handle.0) {
                return Err(KernelError::InvalidHandle(entry.handle));
            }
            let at = patch.patch_offset as usize;
            let field = commands.get_mut(at..at + 4).ok_or_else(|| {
                KernelError::InvalidParameter(format!("patch offset {at} past the batch"))
            })?;
            field.copy_from_slice(&entry.handle.0.to_le_bytes());
        }
        Ok(commands)
    }

    fn record_stream(&mut self, stream: &[u8]) {
        let mut rest = stream;
        while let Some(head) = rest.get(..SVGA3D_CMD_HEADER_SIZE) {
            let header: CmdHeader = bytemuck::pod_read_unaligned(head);
            let end = SVGA3D_CMD_HEADER_SIZE + header.size as usize;
            let Some(payload) = rest.get(SVGA3D_CMD_HEADER_SIZE..end) else {
                break;
            };
            self.recorded.push(RecordedCommand {
                opcode: header.id,
                payload: payload.to_vec(),
            });
            rest = &rest[end..];
        }
    }
}

impl KernelCallbacks for LoopbackKernel {
    fn create_context(&mut self) -> Result<(ContextHandle, CommandBufferLease), KernelError> {
        let context = ContextHandle(self.next_context);
        self.next_context += 1;
        self.contexts.push(context);
        info!("Loopback context {:?} created", context);
        Ok((context, self.lease()))
    }

    fn destroy_context(&mut self, context: ContextHandle) -> Result<(), KernelError> {
        let index = self
            .contexts
            .iter()
            .position(|c| *c == context)
            .ok_or_else(|| KernelError::InvalidParameter(format!("unknown context {context:?}")))?;
        self.contexts.remove(index);
        self.drop_retired();
        Ok(())
    }

    fn allocate(&mut self, desc: &AllocationDesc) -> Result<AllocationHandle, KernelError> {
        if self.fail_allocations > 0 {
            self.fail_allocations -= 1;
            debug!("Injected allocation failure ({} bytes)", desc.size);
            return Err(KernelError::OutOfMemory);
        }
        let handle = self.new_allocation(desc)?;
        trace!("Allocated {} ({} bytes, kind {})", handle, desc.size, desc.kind);
        Ok(handle)
    }

    fn deallocate(&mut self, handles: &[AllocationHandle]) -> Result<(), KernelError> {
        if let Some(missing) = handles.iter().find(|h| self.allocation(**h).is_none()) {
            return Err(KernelError::InvalidHandle(*missing));
        }
        for handle in handles {
            if let Some(allocation) = self.allocations.remove(&handle.0) {
                self.bytes_allocated -= allocation.desc.size as u64;
                self.stats.allocations_freed += 1;
            }
        }
        self.drop_retired();
        Ok(())
    }

    fn lock(&mut self, handle: AllocationHandle, flags: LockFlags) -> Result<LockedRegion, KernelError> {
        let busy = self.allocation_mut(handle)?.busy;
        let handle = if busy > 0 && flags.contains(LockFlags::DISCARD) {
            self.rename(handle)?
        } else {
            handle
        };

        let allocation = self.allocation_mut(handle)?;
        if allocation.busy > 0 {
            if flags.contains(LockFlags::DONOT_WAIT) {
                allocation.busy -= 1;
                self.stats.busy_refusals += 1;
                return Err(KernelError::WasStillDrawing);
            }
            allocation.busy = 0;
        }
        allocation.locks += 1;
        let len = allocation.data.len();
        let ptr = NonNull::new(allocation.data.as_mut_ptr()).ok_or(KernelError::InvalidHandle(handle))?;
        // SAFETY: the boxed storage neither moves nor is freed until the
        // allocation is deallocated, and the device accesses it only between
        // this lock and the matching unlock.
        Ok(unsafe { LockedRegion::new(handle, ptr, len) })
    }

    fn unlock(&mut self, handles: &[AllocationHandle]) -> Result<(), KernelError> {
        for handle in handles {
            let allocation = self.allocation_mut(*handle)?;
            if allocation.locks == 0 {
                return Err(KernelError::InvalidParameter(format!("{handle} is not locked")));
            }
            allocation.locks -= 1;
        }
        Ok(())
    }

    fn render(&mut self, submission: Submission) -> Result<CommandBufferLease, KernelError> {
        if !self.contexts.contains(&submission.context) {
            return Err(KernelError::InvalidParameter(format!(
                "submission on unknown context {:?}",
                submission.context
            )));
        }
        if self.fail_submits > 0 {
            self.fail_submits -= 1;
            debug!("Injected submission failure");
            return Err(KernelError::DeviceRemoved);
        }

        let stream = self.relocate(&submission)?;
        let opcodes = self
            .processor
            .process_stream(&stream, &mut Allocations(&mut self.allocations))
            .map_err(|e| KernelError::InvalidParameter(format!("{e:#}")))?;

        self.stats.submissions += 1;
        self.stats.commands += opcodes.len() as u64;
        self.stats.command_bytes += stream.len() as u64;
        for &opcode in &opcodes {
            *self.stats.histogram.entry(opcode).or_default() += 1;
        }
        if self.config.record_commands {
            self.record_stream(&stream);
        }

        let busy_polls = self.config.busy_polls;
        for entry in &submission.allocations {
            if let Some(allocation) = self.allocations.get_mut(&entry.handle.0) {
                allocation.busy = busy_polls;
            }
        }
        self.drop_retired();
        trace!(
            "Executed {} commands ({} bytes) on {:?}",
            opcodes.len(),
            stream.len(),
            submission.context
        );
        Ok(self.lease())
    }

    fn offer(&mut self, handles: &[AllocationHandle], priority: OfferPriority) -> Result<(), KernelError> {
        let discard = self.config.discard_offered;
        for handle in handles {
            let allocation = self.allocation_mut(*handle)?;
            allocation.offered = true;
            if discard {
                allocation.data.fill(0);
                allocation.discarded = true;
            }
        }
        debug!("Offered {} allocations at {:?} priority", handles.len(), priority);
        Ok(())
    }

    fn reclaim(&mut self, handles: &[AllocationHandle]) -> Result<Vec<bool>, KernelError> {
        if let Some(handle) = handles.iter().find(|h| !self.is_offered(**h)) {
            return Err(KernelError::InvalidParameter(format!("{handle} was not offered")));
        }
        handles
            .iter()
            .map(|handle| {
                let allocation = self.allocation_mut(*handle)?;
                allocation.offered = false;
                Ok(std::mem::take(&mut allocation.discarded))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{AllocationListEntry, PatchLocation};
    use crate::protocol::*;

    fn context_desc(size: u32) -> AllocationDesc {
        AllocationDesc {
            kind: AllocationKind::ContextObjects as u32,
            size,
            ..Default::default()
        }
    }

    #[test]
    fn test_allocate_respects_budget_and_fill() {
        let mut kernel = LoopbackKernel::new(LoopbackConfig {
            video_memory_bytes: 100,
            ..Default::default()
        });
        kernel.set_fill_byte(0x5A);
        let a = kernel.allocate(&context_desc(60)).unwrap();
        assert_eq!(kernel.allocate(&context_desc(60)), Err(KernelError::OutOfMemory));
        assert!(kernel.contents(a).unwrap().iter().all(|&b| b == 0x5A));

        kernel.deallocate(&[a]).unwrap();
        assert_eq!(kernel.bytes_allocated(), 0);
        assert!(kernel.allocate(&context_desc(60)).is_ok());
        assert_eq!(kernel.deallocate(&[a]), Err(KernelError::InvalidHandle(a)));
    }

    #[test]
    fn test_injected_allocation_failures() {
        let mut kernel = LoopbackKernel::default();
        kernel.fail_next_allocations(2);
        assert!(kernel.allocate(&context_desc(16)).is_err());
        assert!(kernel.allocate(&context_desc(16)).is_err());
        assert!(kernel.allocate(&context_desc(16)).is_ok());
    }

    #[test]
    fn test_render_relocates_and_executes() {
        let mut kernel = LoopbackKernel::default();
        let (context, lease) = kernel.create_context().unwrap();
        let mob = kernel.allocate(&context_desc(64)).unwrap();

        let cmd = CmdDxMobFence64 {
            value: 7,
            mob_id: SVGA3D_INVALID_ID,
            mob_offset: 24,
        };
        let mut buffer = lease.command_buffer;
        let header = CmdHeader {
            id: SVGA_3D_CMD_DX_MOB_FENCE_64,
            size: 16,
        };
        buffer[..8].copy_from_slice(bytemuck::bytes_of(&header));
        buffer[8..24].copy_from_slice(bytemuck::bytes_of(&cmd));

        let submission = Submission {
            context,
            command_buffer: buffer,
            length: 24,
            allocations: vec![AllocationListEntry {
                handle: mob,
                write_operation: true,
            }],
            patches: vec![PatchLocation {
                allocation_index: 0,
                patch_offset: 16,
                allocation_offset: 0,
                split_offset: 0,
                driver_id: AllocationKind::ContextObjects as u32,
            }],
        };
        let lease = kernel.render(submission).unwrap();
        assert_eq!(lease.command_buffer.len(), 64 * 1024);
        assert_eq!(&kernel.contents(mob).unwrap()[24..32], &7u64.to_le_bytes());
        assert_eq!(kernel.stats().histogram.get(&SVGA_3D_CMD_DX_MOB_FENCE_64), Some(&1));

        let recorded = kernel.take_recorded();
        assert_eq!(recorded.len(), 1);
        assert_eq!(&recorded[0].payload[8..12], &mob.0.to_le_bytes());
        assert!(kernel.take_recorded().is_empty());
    }

    #[test]
    fn test_busy_allocation_refuses_non_blocking_locks() {
        let mut kernel = LoopbackKernel::new(LoopbackConfig {
            busy_polls: 2,
            ..Default::default()
        });
        let (context, lease) = kernel.create_context().unwrap();
        let a = kernel.allocate(&context_desc(16)).unwrap();
        kernel
            .render(Submission {
                context,
                command_buffer: lease.command_buffer,
                length: 0,
                allocations: vec![AllocationListEntry {
                    handle: a,
                    write_operation: false,
                }],
                patches: Vec::new(),
            })
            .unwrap();

        let flags = LockFlags::READ_ONLY | LockFlags::DONOT_WAIT;
        assert_eq!(kernel.lock(a, flags).unwrap_err(), KernelError::WasStillDrawing);
        assert_eq!(kernel.lock(a, flags).unwrap_err(), KernelError::WasStillDrawing);
        let region = kernel.lock(a, flags).unwrap();
        assert_eq!(region.len(), 16);
        drop(region);
        kernel.unlock(&[a]).unwrap();
        assert!(kernel.unlock(&[a]).is_err());
        assert_eq!(kernel.stats().busy_refusals, 2);
    }

    #[test]
    fn test_discard_lock_renames_busy_allocation() {
        let mut kernel = LoopbackKernel::new(LoopbackConfig {
            busy_polls: 5,
            ..Default::default()
        });
        let (context, lease) = kernel.create_context().unwrap();
        let a = kernel.allocate(&context_desc(32)).unwrap();
        kernel
            .render(Submission {
                context,
                command_buffer: lease.command_buffer,
                length: 0,
                allocations: vec![AllocationListEntry {
                    handle: a,
                    write_operation: true,
                }],
                patches: Vec::new(),
            })
            .unwrap();

        let region = kernel
            .lock(a, LockFlags::WRITE_ONLY | LockFlags::DISCARD | LockFlags::DONOT_WAIT)
            .unwrap();
        let renamed = region.handle();
        drop(region);
        assert_ne!(renamed, a);
        assert!(kernel.contents(a).is_none());
        assert_eq!(kernel.live_allocations(), 1);
        kernel.unlock(&[renamed]).unwrap();
        assert_eq!(kernel.stats().renames, 1);
    }

    #[test]
    fn test_retired_storage_freed_without_render() {
        let mut kernel = LoopbackKernel::new(LoopbackConfig {
            busy_polls: 5,
            ..Default::default()
        });
        let (context, lease) = kernel.create_context().unwrap();
        let a = kernel.allocate(&context_desc(32)).unwrap();
        let b = kernel.allocate(&context_desc(32)).unwrap();
        kernel
            .render(Submission {
                context,
                command_buffer: lease.command_buffer,
                length: 0,
                allocations: vec![
                    AllocationListEntry { handle: a, write_operation: true },
                    AllocationListEntry { handle: b, write_operation: true },
                ],
                patches: Vec::new(),
            })
            .unwrap();
        let discard = LockFlags::WRITE_ONLY | LockFlags::DISCARD;

        let renamed_a = kernel.lock(a, discard).unwrap().handle();
        kernel.unlock(&[renamed_a]).unwrap();
        assert_eq!(kernel.allocations.len(), 3);
        kernel.deallocate(&[renamed_a]).unwrap();
        assert_eq!(kernel.allocations.len(), 1);
        assert_eq!(kernel.stats().allocations_freed, 2);

        let renamed_b = kernel.lock(b, discard).unwrap().handle();
        kernel.unlock(&[renamed_b]).unwrap();
        assert_eq!(kernel.allocations.len(), 2);
        kernel.destroy_context(context).unwrap();
        assert_eq!(kernel.allocations.len(), 1);
        assert_eq!(kernel.stats().allocations_freed, 3);
        assert_eq!(kernel.live_allocations(), 1);
        assert_eq!(kernel.bytes_allocated(), 32);
    }

    #[test]
    fn test_offer_reclaim() {
        let mut kernel = LoopbackKernel::default();
        let a = kernel.allocate(&context_desc(16)).unwrap();
        assert!(matches!(
            kernel.reclaim(&[a]),
            Err(KernelError::InvalidParameter(_))
        ));
        kernel.offer(&[a], OfferPriority::Normal).unwrap();
        assert!(kernel.is_offered(a));
        assert_eq!(kernel.reclaim(&[a]).unwrap(), vec![false]);

        kernel.set_discard_offered(true);
        kernel.offer(&[a], OfferPriority::High).unwrap();
        assert_eq!(kernel.reclaim(&[a]).unwrap(), vec![true]);
        assert!(!kernel.is_offered(a));
    }

    #[test]
    fn test_contexts_are_tracked() {
        let mut kernel = LoopbackKernel::default();
        let (context, _) = kernel.create_context().unwrap();
        assert_eq!(kernel.live_contexts(), 1);
        kernel.destroy_context(context).unwrap();
        assert_eq!(kernel.live_contexts(), 0);
        assert!(kernel.destroy_context(context).is_err());
    }
}

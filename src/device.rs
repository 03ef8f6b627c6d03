//! Device Module
//!
//! One D3D device. Owns the command buffer, the object tables, the
//! sub-allocators and the deferred-destruction queues, and is the single entry
//! point for every driver operation.

mod encode;
mod queries;
mod resources;
mod shaders;
pub(crate) mod upload;
mod views;

pub use resources::OpenAllocation;

use std::collections::VecDeque;

use bytemuck::Pod;
use tracing::{debug, error, info, trace, warn};

use crate::coalloc::{CoAllocationChain, CoPurpose};
use crate::command_buffer::{CommandBuffer, PatchRequest, Reservation};
use crate::config::DeviceConfig;
use crate::error::{DxError, DxResult};
use crate::handle_table::HandleTable;
use crate::kernel::{AllocationHandle, ContextHandle, KernelCallbacks, LockFlags};
use crate::protocol::{
    AllocationDesc, ShaderType, SVGA3D_DX11_1_MAX_UAVIEWS, SVGA3D_DX_MAX_SRVIEWS,
    SVGA3D_MAX_SHADERIDS, SVGA3D_MAX_SIMULTANEOUS_RENDER_TARGETS, SVGA_COTABLE_MAX_IDS,
};
use crate::query::{Query, QueryId};
use crate::resource::{KmResource, Resource, ResourceId};
use crate::shader::{Shader, ShaderId};
use crate::shader_arena::ShaderArena;
use crate::view::{View, ViewId, ViewKind};

/// Bindings the device tracks so they can be re-applied after views are
/// redefined.
#[derive(Debug, Clone)]
pub struct PipelineState {
    pub(crate) render_targets: [Option<ViewId>; SVGA3D_MAX_SIMULTANEOUS_RENDER_TARGETS],
    pub(crate) num_render_targets: usize,
    pub(crate) depth_stencil: Option<ViewId>,
    pub(crate) shader_resources: [Vec<Option<ViewId>>; 6],
    pub(crate) cs_uavs: Vec<Option<ViewId>>,
    pub(crate) shaders: [Option<ShaderId>; 6],
}

impl Default for PipelineState {
    fn default() -> Self {
        Self {
            render_targets: [None; SVGA3D_MAX_SIMULTANEOUS_RENDER_TARGETS],
            num_render_targets: 0,
            depth_stencil: None,
            shader_resources: std::array::from_fn(|_| vec![None; SVGA3D_DX_MAX_SRVIEWS]),
            cs_uavs: vec![None; SVGA3D_DX11_1_MAX_UAVIEWS],
            shaders: [None; 6],
        }
    }
}

impl PipelineState {
    pub fn render_targets(&self) -> &[Option<ViewId>] {
        &self.render_targets[..self.num_render_targets]
    }

    pub fn depth_stencil(&self) -> Option<ViewId> {
        self.depth_stencil
    }

    pub fn shader_resources(&self, stage: ShaderType) -> &[Option<ViewId>] {
        &self.shader_resources[stage.stage_index()]
    }

    pub fn cs_unordered_access_views(&self) -> &[Option<ViewId>] {
        &self.cs_uavs
    }

    pub fn shader(&self, stage: ShaderType) -> Option<ShaderId> {
        self.shaders[stage.stage_index()]
    }

    /// Whether any render-target or depth-stencil slot holds `view`.
    pub(crate) fn is_output_bound(&self, view: ViewId) -> bool {
        self.depth_stencil == Some(view) || self.render_targets().contains(&Some(view))
    }

    /// Forget every binding of `view`.
    pub(crate) fn unbind_view(&mut self, view: ViewId) {
        let clear = |slot: &mut Option<ViewId>| {
            if *slot == Some(view) {
                *slot = None;
            }
        };
        self.render_targets.iter_mut().for_each(clear);
        clear(&mut self.depth_stencil);
        self.shader_resources
            .iter_mut()
            .flat_map(|stage| stage.iter_mut())
            .for_each(clear);
        self.cs_uavs.iter_mut().for_each(clear);
    }
}

/// A D3D device over a kernel backend.
pub struct Device<K: KernelCallbacks> {
    pub(crate) kernel: K,
    pub(crate) config: DeviceConfig,
    pub(crate) context: ContextHandle,
    pub(crate) commands: CommandBuffer,
    pub(crate) last_error: Option<DxError>,
    pub(crate) resources: HandleTable<Resource>,
    pub(crate) views: [HandleTable<View>; 4],
    pub(crate) shaders: HandleTable<Shader>,
    pub(crate) stream_outputs: HandleTable<ShaderId>,
    pub(crate) queries: HandleTable<Query>,
    pub(crate) query_chain: CoAllocationChain,
    pub(crate) stream_output_chain: CoAllocationChain,
    pub(crate) shader_arena: Option<ShaderArena>,
    /// Staging buffers of uploads in the current batch, newest first.
    pub(crate) staging: VecDeque<KmResource>,
    pub(crate) deferred: Vec<KmResource>,
    pub(crate) pipeline: PipelineState,
    pub(crate) mob_fence: u64,
    destroyed: bool,
}

impl<K: KernelCallbacks> Device<K> {
    /// Create the kernel context and take the first command buffer.
    pub fn new(mut kernel: K, config: DeviceConfig) -> DxResult<Self> {
        let (context, lease) = kernel
            .create_context()
            .map_err(|e| DxError::kernel("create_context", e))?;
        info!(
            "Device context {:?} ready: {} byte command buffer, {} allocations, {} patches",
            context,
            lease.command_buffer.len(),
            lease.allocation_list_capacity,
            lease.patch_list_capacity
        );

        Ok(Self {
            kernel,
            config,
            context,
            commands: CommandBuffer::new(lease),
            last_error: None,
            resources: HandleTable::new(u32::MAX),
            views: std::array::from_fn(|_| HandleTable::new(SVGA_COTABLE_MAX_IDS)),
            shaders: HandleTable::new(SVGA3D_MAX_SHADERIDS),
            stream_outputs: HandleTable::new(SVGA_COTABLE_MAX_IDS),
            queries: HandleTable::new(SVGA_COTABLE_MAX_IDS),
            query_chain: CoAllocationChain::new(CoPurpose::Queries),
            stream_output_chain: CoAllocationChain::new(CoPurpose::StreamOutput),
            shader_arena: None,
            staging: VecDeque::new(),
            deferred: Vec::new(),
            pipeline: PipelineState::default(),
            mob_fence: 0,
            destroyed: false,
        })
    }

    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    pub fn kernel_mut(&mut self) -> &mut K {
        &mut self.kernel
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn context(&self) -> ContextHandle {
        self.context
    }

    pub fn command_buffer(&self) -> &CommandBuffer {
        &self.commands
    }

    pub fn resource(&self, id: ResourceId) -> Option<&Resource> {
        self.resources.get(id)
    }

    pub fn view(&self, id: ViewId) -> Option<&View> {
        self.views[id.kind as usize].get(id.handle)
    }

    pub fn shader(&self, id: ShaderId) -> Option<&Shader> {
        self.shaders.get(id)
    }

    pub fn query(&self, id: QueryId) -> Option<&Query> {
        self.queries.get(id)
    }

    pub fn pipeline(&self) -> &PipelineState {
        &self.pipeline
    }

    pub fn shader_arena(&self) -> Option<&ShaderArena> {
        self.shader_arena.as_ref()
    }

    pub fn query_chain(&self) -> &CoAllocationChain {
        &self.query_chain
    }

    pub fn stream_output_chain(&self) -> &CoAllocationChain {
        &self.stream_output_chain
    }

    /// Staging buffers waiting for the next flush.
    pub fn pending_staging(&self) -> usize {
        self.staging.len()
    }

    /// Allocations waiting for the next flush to be released.
    pub fn pending_deferred(&self) -> usize {
        self.deferred.len()
    }

    pub fn mob_fence(&self) -> u64 {
        self.mob_fence
    }

    /// Take the first error recorded since the last call.
    pub fn take_error(&mut self) -> Option<DxError> {
        self.last_error.take()
    }

    /// Note `result` in the last-error slot. The first error is kept.
    pub(crate) fn record<T>(&mut self, result: DxResult<T>) -> DxResult<T> {
        if let Err(e) = &result {
            if e.is_device_error() && self.last_error.is_none() {
                self.last_error = Some(e.clone());
            }
        }
        result
    }

    /// Run a public operation and record its failure.
    pub(crate) fn recorded<T>(
        &mut self,
        op: impl FnOnce(&mut Self) -> DxResult<T>,
    ) -> DxResult<T> {
        let result = if self.destroyed {
            Err(DxError::invalid("device has been destroyed"))
        } else {
            op(self)
        };
        self.record(result)
    }

    // =========================================================================
    // Command buffer
    // =========================================================================

    /// Reserve a command, submitting the current batch first when the command
    /// or its relocations would not fit.
    pub fn reserve(
        &mut self,
        opcode: u32,
        payload_len: usize,
        relocations: usize,
    ) -> DxResult<Reservation> {
        if self.commands.needs_flush(payload_len, relocations) {
            trace!("Command buffer full, submitting before {opcode}");
            self.flush_commands()?;
        }
        self.commands.reserve(opcode, payload_len, relocations)
    }

    pub fn write_payload<T: Pod>(
        &mut self,
        reservation: &Reservation,
        offset: usize,
        value: &T,
    ) -> DxResult<()> {
        self.commands.write(reservation, offset, value)
    }

    pub fn register_patch(
        &mut self,
        reservation: &Reservation,
        request: PatchRequest,
    ) -> DxResult<()> {
        self.commands.register_patch(reservation, request)
    }

    pub fn commit(&mut self, reservation: Reservation) {
        self.commands.commit(reservation);
    }

    /// Reserve, fill and commit one command: `payload` followed by `tail`.
    pub(crate) fn emit<T: Pod>(
        &mut self,
        opcode: u32,
        payload: &T,
        tail: &[u8],
        patches: &[PatchRequest],
    ) -> DxResult<()> {
        let head = std::mem::size_of::<T>();
        let reservation = self.reserve(opcode, head + tail.len(), patches.len())?;

        let filled = self
            .commands
            .write(&reservation, 0, payload)
            .and_then(|()| self.commands.write_bytes(&reservation, head, tail))
            .and_then(|()| {
                patches
                    .iter()
                    .try_for_each(|patch| self.commands.register_patch(&reservation, *patch))
            });
        match filled {
            Ok(()) => {
                self.commands.commit(reservation);
                Ok(())
            }
            Err(e) => {
                self.commands.abandon(reservation);
                Err(e)
            }
        }
    }

    /// Submit pending commands, then release staging and deferred
    /// allocations. Submits an empty batch when `force` is set.
    pub fn flush(&mut self, force: bool) -> DxResult<()> {
        self.recorded(|device| device.flush_inner(force))
    }

    pub(crate) fn flush_inner(&mut self, force: bool) -> DxResult<()> {
        if force || !self.commands.is_empty() {
            self.flush_commands()?;
        }
        self.process_deferred()
    }

    /// Hand the batch to the kernel and install the buffer it returns.
    pub(crate) fn flush_commands(&mut self) -> DxResult<()> {
        let capacity = self.commands.capacity();
        let submission = self.commands.take_submission(self.context);
        trace!(
            "Submitting {} command bytes, {} allocations, {} patches",
            submission.length,
            submission.allocations.len(),
            submission.patches.len()
        );

        match self.kernel.render(submission) {
            Ok(lease) => {
                self.commands.install(lease);
                Ok(())
            }
            Err(source) => {
                error!("Command submission failed: {source}");
                self.commands.discard(capacity);
                Err(DxError::Fatal {
                    call: "render",
                    source,
                })
            }
        }
    }

    fn process_deferred(&mut self) -> DxResult<()> {
        let staging = self.staging.len();
        self.deferred.extend(self.staging.drain(..));
        if self.deferred.is_empty() {
            return Ok(());
        }

        let handles: Vec<AllocationHandle> =
            self.deferred.drain(..).map(|km| km.handle).collect();
        debug!(
            "Releasing {} deferred allocations ({} staging)",
            handles.len(),
            staging
        );
        self.kernel
            .deallocate(&handles)
            .map_err(|e| DxError::kernel("deallocate", e))
    }

    // =========================================================================
    // Kernel helpers
    // =========================================================================

    /// Allocate, retrying once after a forced flush has released deferred
    /// allocations.
    pub(crate) fn allocate_with_retry(&mut self, desc: &AllocationDesc) -> DxResult<AllocationHandle> {
        match self.kernel.allocate(desc) {
            Ok(handle) => Ok(handle),
            Err(first) => {
                warn!(
                    "Allocation of {} bytes failed ({first}), flushing and retrying",
                    desc.size
                );
                self.flush_inner(true)?;
                self.kernel
                    .allocate(desc)
                    .map_err(|e| DxError::kernel("allocate", e))
            }
        }
    }

    /// Lock `handle`, run `access` over its bytes and unlock again.
    pub(crate) fn with_locked<R>(
        &mut self,
        handle: AllocationHandle,
        flags: LockFlags,
        access: impl FnOnce(&mut [u8]) -> DxResult<R>,
    ) -> DxResult<R> {
        let mut region = self
            .kernel
            .lock(handle, flags)
            .map_err(|e| DxError::kernel("lock", e))?;
        let result = access(region.as_mut_slice());
        drop(region);
        let unlocked = self
            .kernel
            .unlock(&[handle])
            .map_err(|e| DxError::kernel("unlock", e));
        let value = result?;
        unlocked?;
        Ok(value)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Tear the device down, releasing every object and the kernel context.
    /// Later operations fail with InvalidArgument.
    pub fn destroy(&mut self) -> DxResult<()> {
        if self.destroyed {
            return Ok(());
        }
        let mut first_error: Option<DxError> = None;
        let mut note = |result: DxResult<()>| {
            if let Err(e) = result {
                warn!("Device teardown: {e}");
                first_error.get_or_insert(e);
            }
        };

        note(self.flush_inner(true));

        for kind in ViewKind::ALL {
            for handle in self.views[kind as usize].handles() {
                note(self.destroy_view_inner(ViewId { kind, handle }));
            }
        }
        for id in self.resources.handles() {
            note(self.release_mapping(id));
            note(self.destroy_resource_inner(id));
        }
        note(self.flush_inner(true));

        for id in self.shaders.handles() {
            note(self.destroy_shader_inner(id));
        }
        for id in self.queries.handles() {
            note(self.destroy_query_inner(id));
        }
        note(self.flush_inner(true));

        let co_handles: Vec<AllocationHandle> = self
            .stream_output_chain
            .take_handles()
            .into_iter()
            .chain(self.query_chain.take_handles())
            .collect();
        if !co_handles.is_empty() {
            note(
                self.kernel
                    .deallocate(&co_handles)
                    .map_err(|e| DxError::kernel("deallocate", e)),
            );
        }
        if let Some(arena) = self.shader_arena.take() {
            note(
                self.kernel
                    .deallocate(&[arena.handle()])
                    .map_err(|e| DxError::kernel("deallocate", e)),
            );
        }
        note(
            self.kernel
                .destroy_context(self.context)
                .map_err(|e| DxError::kernel("destroy_context", e)),
        );

        self.destroyed = true;
        info!("Device context {:?} destroyed", self.context);
        match first_error {
            Some(e) => self.record(Err(e)),
            None => Ok(()),
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoopbackConfig;
    use crate::loopback::LoopbackKernel;
    use crate::protocol::*;

    fn device() -> Device<LoopbackKernel> {
        Device::new(LoopbackKernel::new(LoopbackConfig::default()), DeviceConfig::default()).unwrap()
    }

    #[test]
    fn test_new_device_has_empty_batch() {
        let device = device();
        assert!(device.command_buffer().is_empty());
        assert_eq!(device.command_buffer().capacity(), 64 * 1024);
        assert!(device.shader_arena().is_none());
    }

    #[test]
    fn test_flush_skips_empty_batch_unless_forced() {
        let mut device = device();
        device.flush(false).unwrap();
        assert_eq!(device.kernel().stats().submissions, 0);
        device.flush(true).unwrap();
        assert_eq!(device.kernel().stats().submissions, 1);
    }

    #[test]
    fn test_full_buffer_submits_implicitly() {
        let config = LoopbackConfig {
            command_buffer_bytes: 64,
            ..Default::default()
        };
        let mut device = Device::new(LoopbackKernel::new(config), DeviceConfig::default()).unwrap();
        for id in 0..5 {
            device
                .emit(
                    SVGA_3D_CMD_DX_SET_PREDICATION,
                    &CmdDxSetPredication {
                        query_id: id,
                        predicate_value: 0,
                    },
                    &[],
                    &[],
                )
                .unwrap();
        }
        // 16 bytes per command: four fit, the fifth forces a submit.
        assert_eq!(device.kernel().stats().submissions, 1);
        assert_eq!(device.command_buffer().used(), 16);
    }

    #[test]
    fn test_manual_reserve_and_commit() {
        let mut device = device();
        let r = device.reserve(SVGA_3D_CMD_DX_BIND_QUERY, 8, 1).unwrap();
        device
            .write_payload(&r, 0, &CmdDxBindQuery { query_id: 3, mobid: 0 })
            .unwrap();
        device
            .register_patch(
                &r,
                PatchRequest::new(4, AllocationKind::ContextObjects, AllocationHandle(77)),
            )
            .unwrap();
        device.commit(r);
        assert_eq!(device.command_buffer().used(), 16);
        assert_eq!(device.command_buffer().patches().len(), 1);
    }

    #[test]
    fn test_render_failure_is_fatal_and_recorded() {
        let mut device = device();
        device.kernel_mut().fail_next_submits(1);
        device
            .emit(SVGA_3D_CMD_DX_DESTROY_QUERY, &CmdDxQueryId { query_id: 1 }, &[], &[])
            .unwrap();
        let err = device.flush(false).unwrap_err();
        assert!(matches!(err, DxError::Fatal { call: "render", .. }));
        assert!(device.command_buffer().is_empty());
        assert_eq!(device.command_buffer().capacity(), 64 * 1024);

        // The first error sticks until taken.
        let _ = device.flush(true);
        assert!(matches!(device.take_error(), Some(DxError::Fatal { .. })));
        assert_eq!(device.take_error(), None);
    }

    #[test]
    fn test_destroy_releases_context_and_blocks_further_use() {
        let mut device = device();
        device.destroy().unwrap();
        assert!(device.is_destroyed());
        assert_eq!(device.kernel().live_contexts(), 0);
        assert!(device.flush(true).is_err());
        assert_eq!(device.kernel().live_allocations(), 0);
    }
}

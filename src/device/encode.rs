//! Wire encoders: one method per SVGA3D command the device emits. Each fills
//! the payload struct and names the fields the kernel has to patch.

use std::mem::offset_of;

use crate::command_buffer::PatchRequest;
use crate::error::DxResult;
use crate::format::SurfaceFormat;
use crate::kernel::{AllocationHandle, KernelCallbacks};
use crate::protocol::*;
use crate::view::{ViewDesc, ViewKind};

use super::Device;

fn surface(field_offset: usize, handle: AllocationHandle) -> PatchRequest {
    PatchRequest::new(field_offset, AllocationKind::Surface, handle)
}

fn id_bytes(ids: &[u32]) -> &[u8] {
    bytemuck::cast_slice(ids)
}

impl<K: KernelCallbacks> Device<K> {
    pub(crate) fn cmd_set_shader_resources(
        &mut self,
        stage: ShaderType,
        start_view: u32,
        ids: &[u32],
    ) -> DxResult<()> {
        let cmd = CmdDxSetShaderResources {
            start_view,
            shader_type: stage as u32,
        };
        self.emit(SVGA_3D_CMD_DX_SET_SHADER_RESOURCES, &cmd, id_bytes(ids), &[])
    }

    pub(crate) fn cmd_set_shader(&mut self, stage: ShaderType, shader_id: u32) -> DxResult<()> {
        let cmd = CmdDxSetShader {
            shader_id,
            shader_type: stage as u32,
        };
        self.emit(SVGA_3D_CMD_DX_SET_SHADER, &cmd, &[], &[])
    }

    pub(crate) fn cmd_set_render_targets(
        &mut self,
        depth_stencil_view_id: u32,
        render_target_ids: &[u32],
    ) -> DxResult<()> {
        let cmd = CmdDxSetRenderTargets {
            depth_stencil_view_id,
        };
        self.emit(
            SVGA_3D_CMD_DX_SET_RENDERTARGETS,
            &cmd,
            id_bytes(render_target_ids),
            &[],
        )
    }

    pub(crate) fn cmd_set_cs_ua_views(&mut self, start_index: u32, ids: &[u32]) -> DxResult<()> {
        let cmd = CmdDxSetCsUaViews { start_index };
        self.emit(SVGA_3D_CMD_DX_SET_CS_UA_VIEWS, &cmd, id_bytes(ids), &[])
    }

    pub(crate) fn cmd_define_query(&mut self, query_id: u32, query_type: u32, flags: u32) -> DxResult<()> {
        let cmd = CmdDxDefineQuery {
            query_id,
            query_type,
            flags,
        };
        self.emit(SVGA_3D_CMD_DX_DEFINE_QUERY, &cmd, &[], &[])
    }

    pub(crate) fn cmd_bind_query(&mut self, query_id: u32, mob: AllocationHandle) -> DxResult<()> {
        let cmd = CmdDxBindQuery {
            query_id,
            mobid: SVGA3D_INVALID_ID,
        };
        let patch = PatchRequest::new(
            offset_of!(CmdDxBindQuery, mobid),
            AllocationKind::ContextObjects,
            mob,
        )
        .written();
        self.emit(SVGA_3D_CMD_DX_BIND_QUERY, &cmd, &[], &[patch])
    }

    pub(crate) fn cmd_set_query_offset(&mut self, query_id: u32, mob_offset: u32) -> DxResult<()> {
        let cmd = CmdDxSetQueryOffset {
            query_id,
            mob_offset,
        };
        self.emit(SVGA_3D_CMD_DX_SET_QUERY_OFFSET, &cmd, &[], &[])
    }

    /// Begin, End, Readback and Destroy share the `{query_id}` payload.
    pub(crate) fn cmd_query(&mut self, opcode: u32, query_id: u32) -> DxResult<()> {
        self.emit(opcode, &CmdDxQueryId { query_id }, &[], &[])
    }

    pub(crate) fn cmd_mob_fence_64(
        &mut self,
        value: u64,
        mob: AllocationHandle,
        mob_offset: u32,
    ) -> DxResult<()> {
        let cmd = CmdDxMobFence64 {
            value,
            mob_id: SVGA3D_INVALID_ID,
            mob_offset,
        };
        let patch = PatchRequest::new(
            offset_of!(CmdDxMobFence64, mob_id),
            AllocationKind::ContextObjects,
            mob,
        )
        .written();
        self.emit(SVGA_3D_CMD_DX_MOB_FENCE_64, &cmd, &[], &[patch])
    }

    pub(crate) fn cmd_set_predication(&mut self, query_id: u32, predicate_value: bool) -> DxResult<()> {
        let cmd = CmdDxSetPredication {
            query_id,
            predicate_value: predicate_value as u32,
        };
        self.emit(SVGA_3D_CMD_DX_SET_PREDICATION, &cmd, &[], &[])
    }

    pub(crate) fn cmd_update_subresource(
        &mut self,
        handle: AllocationHandle,
        sub_resource: u32,
        box_: SvgaBox,
    ) -> DxResult<()> {
        let cmd = CmdDxUpdateSubResource {
            sid: SVGA3D_INVALID_ID,
            sub_resource,
            box_,
        };
        let patch = surface(offset_of!(CmdDxUpdateSubResource, sid), handle).written();
        self.emit(SVGA_3D_CMD_DX_UPDATE_SUBRESOURCE, &cmd, &[], &[patch])
    }

    pub(crate) fn cmd_readback_subresource(
        &mut self,
        handle: AllocationHandle,
        sub_resource: u32,
    ) -> DxResult<()> {
        let cmd = CmdDxReadbackSubResource {
            sid: SVGA3D_INVALID_ID,
            sub_resource,
        };
        let patch = surface(offset_of!(CmdDxReadbackSubResource, sid), handle).written();
        self.emit(SVGA_3D_CMD_DX_READBACK_SUBRESOURCE, &cmd, &[], &[patch])
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn cmd_transfer_from_buffer(
        &mut self,
        src: AllocationHandle,
        src_offset: u32,
        src_pitch: u32,
        src_slice_pitch: u32,
        dst: AllocationHandle,
        dest_sub_resource: u32,
        dest_box: SvgaBox,
    ) -> DxResult<()> {
        let cmd = CmdDxTransferFromBuffer {
            src_sid: SVGA3D_INVALID_ID,
            src_offset,
            src_pitch,
            src_slice_pitch,
            dest_sid: SVGA3D_INVALID_ID,
            dest_sub_resource,
            dest_box,
        };
        let patches = [
            surface(offset_of!(CmdDxTransferFromBuffer, src_sid), src),
            surface(offset_of!(CmdDxTransferFromBuffer, dest_sid), dst).written(),
        ];
        self.emit(SVGA_3D_CMD_DX_TRANSFER_FROM_BUFFER, &cmd, &[], &patches)
    }

    pub(crate) fn cmd_pred_copy(&mut self, dst: AllocationHandle, src: AllocationHandle) -> DxResult<()> {
        let cmd = CmdDxPredCopy {
            dst_sid: SVGA3D_INVALID_ID,
            src_sid: SVGA3D_INVALID_ID,
        };
        let patches = [
            surface(offset_of!(CmdDxPredCopy, dst_sid), dst).written(),
            surface(offset_of!(CmdDxPredCopy, src_sid), src),
        ];
        self.emit(SVGA_3D_CMD_DX_PRED_COPY, &cmd, &[], &patches)
    }

    pub(crate) fn cmd_pred_copy_region(
        &mut self,
        dst: AllocationHandle,
        dst_sub_resource: u32,
        src: AllocationHandle,
        src_sub_resource: u32,
        box_: SvgaCopyBox,
    ) -> DxResult<()> {
        let cmd = CmdDxPredCopyRegion {
            dst_sid: SVGA3D_INVALID_ID,
            dst_sub_resource,
            src_sid: SVGA3D_INVALID_ID,
            src_sub_resource,
            box_,
        };
        let patches = [
            surface(offset_of!(CmdDxPredCopyRegion, dst_sid), dst).written(),
            surface(offset_of!(CmdDxPredCopyRegion, src_sid), src),
        ];
        self.emit(SVGA_3D_CMD_DX_PRED_COPY_REGION, &cmd, &[], &patches)
    }

    pub(crate) fn cmd_define_view(
        &mut self,
        view_id: u32,
        resource: AllocationHandle,
        format: SurfaceFormat,
        desc: &ViewDesc,
    ) -> DxResult<()> {
        let kind = desc.kind();
        let dimension = desc.dimension() as u32;
        if let ViewDesc::DepthStencil(dsv) = desc {
            let cmd = CmdDxDefineDepthStencilViewV2 {
                dsv_id: view_id,
                sid: SVGA3D_INVALID_ID,
                format: format as u32,
                resource_dimension: dimension,
                mip_slice: dsv.slice.mip_slice,
                first_array_slice: dsv.slice.first_array_slice,
                array_size: dsv.slice.array_size,
                flags: dsv.flags,
                pad0: 0,
                pad1: 0,
            };
            let patch = surface(offset_of!(CmdDxDefineDepthStencilViewV2, sid), resource);
            return self.emit(kind.define_opcode(), &cmd, &[], &[patch]);
        }

        let cmd = CmdDxDefineView {
            view_id,
            sid: SVGA3D_INVALID_ID,
            format: format as u32,
            resource_dimension: dimension,
            desc: desc.encode(),
        };
        let patch = surface(offset_of!(CmdDxDefineView, sid), resource);
        self.emit(kind.define_opcode(), &cmd, &[], &[patch])
    }

    pub(crate) fn cmd_destroy_view(&mut self, kind: ViewKind, view_id: u32) -> DxResult<()> {
        self.emit(kind.destroy_opcode(), &CmdDxDestroyView { view_id }, &[], &[])
    }

    pub(crate) fn cmd_define_shader(
        &mut self,
        shader_id: u32,
        shader_type: ShaderType,
        size_in_bytes: u32,
    ) -> DxResult<()> {
        let cmd = CmdDxDefineShader {
            shader_id,
            shader_type: shader_type as u32,
            size_in_bytes,
        };
        self.emit(SVGA_3D_CMD_DX_DEFINE_SHADER, &cmd, &[], &[])
    }

    /// Bind a shader to its bytes at `offset_in_bytes`; a null `mob` unbinds.
    pub(crate) fn cmd_bind_shader(
        &mut self,
        shid: u32,
        mob: AllocationHandle,
        offset_in_bytes: u32,
    ) -> DxResult<()> {
        let cmd = CmdDxBindShader {
            cid: self.context.0,
            shid,
            mobid: SVGA3D_INVALID_ID,
            offset_in_bytes,
        };
        let patch = PatchRequest::new(offset_of!(CmdDxBindShader, mobid), AllocationKind::Shaders, mob);
        self.emit(SVGA_3D_CMD_DX_BIND_SHADER, &cmd, &[], &[patch])
    }

    pub(crate) fn cmd_destroy_shader(&mut self, shader_id: u32) -> DxResult<()> {
        self.emit(SVGA_3D_CMD_DX_DESTROY_SHADER, &CmdDxDestroyShader { shader_id }, &[], &[])
    }

    pub(crate) fn cmd_define_stream_output_with_mob(
        &mut self,
        soid: u32,
        num_output_stream_entries: u32,
        strides: [u32; SVGA3D_DX_MAX_SOTARGETS],
        num_output_stream_strides: u32,
        rasterized_stream: u32,
    ) -> DxResult<()> {
        let cmd = CmdDxDefineStreamOutputWithMob {
            soid,
            num_output_stream_entries,
            num_output_stream_strides,
            stream_output_stride_in_bytes: strides,
            rasterized_stream,
        };
        self.emit(SVGA_3D_CMD_DX_DEFINE_STREAMOUTPUT_WITH_MOB, &cmd, &[], &[])
    }

    pub(crate) fn cmd_bind_stream_output(
        &mut self,
        soid: u32,
        mob: AllocationHandle,
        offset_in_bytes: u32,
        size_in_bytes: u32,
    ) -> DxResult<()> {
        let cmd = CmdDxBindStreamOutput {
            soid,
            mobid: SVGA3D_INVALID_ID,
            offset_in_bytes,
            size_in_bytes,
        };
        let patch = PatchRequest::new(
            offset_of!(CmdDxBindStreamOutput, mobid),
            AllocationKind::ContextObjects,
            mob,
        );
        self.emit(SVGA_3D_CMD_DX_BIND_STREAMOUTPUT, &cmd, &[], &[patch])
    }

    pub(crate) fn cmd_destroy_stream_output(&mut self, soid: u32) -> DxResult<()> {
        self.emit(
            SVGA_3D_CMD_DX_DESTROY_STREAMOUTPUT,
            &CmdDxDestroyStreamOutput { soid },
            &[],
            &[],
        )
    }
}

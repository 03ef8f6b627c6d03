//! Command Processor Module
//!
//! Host side of the loopback kernel. Walks a submitted SVGA3D command stream
//! and applies the commands that have guest-visible effects: query results
//! and fences written into context-object memory, and surface copies.

use std::collections::HashMap;
use std::mem::size_of;

use anyhow::{anyhow, Context, Result};
use bytemuck::Pod;
use tracing::{debug, trace, warn};

use crate::device::upload::{copy_box, SourceRows};
use crate::geometry::SurfaceLayout;
use crate::protocol::*;
use crate::resource::ResourceDesc;

/// Memory objects the processor reads and writes, addressed by the IDs the
/// kernel patched into the commands.
pub trait MobMemory {
    fn mob(&self, id: u32) -> Option<&[u8]>;
    fn mob_mut(&mut self, id: u32) -> Option<&mut [u8]>;
    fn mob_desc(&self, id: u32) -> Option<AllocationDesc>;
}

/// Where the host writes a query's status and result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct QueryBinding {
    svga_type: u32,
    mob: Option<u32>,
    offset: u32,
}

/// Bytes following the status word for each SVGA3dQueryType.
fn result_size(svga_type: u32) -> usize {
    match svga_type {
        SVGA3D_QUERYTYPE_OCCLUSION | SVGA3D_QUERYTYPE_OCCLUSIONPREDICATE => 4,
        SVGA3D_QUERYTYPE_STREAMOVERFLOWPREDICATE => 4,
        t if (SVGA3D_QUERYTYPE_SOP_STREAM0..SVGA3D_QUERYTYPE_SOP_STREAM0 + 4).contains(&t) => 4,
        SVGA3D_QUERYTYPE_TIMESTAMPDISJOINT => 12,
        SVGA3D_QUERYTYPE_PIPELINESTATS => 88,
        SVGA3D_QUERYTYPE_STREAMOUTPUTSTATS => 16,
        t if (SVGA3D_QUERYTYPE_SOSTATS_STREAM0..SVGA3D_QUERYTYPE_SOSTATS_STREAM0 + 4).contains(&t) => 16,
        _ => 8,
    }
}

fn read_cmd<T: Pod>(payload: &[u8], opcode: u32) -> Result<T> {
    let bytes = payload.get(..size_of::<T>()).ok_or_else(|| {
        anyhow!(
            "{} payload of {} bytes, need {}",
            command_name(opcode),
            payload.len(),
            size_of::<T>()
        )
    })?;
    Ok(bytemuck::pod_read_unaligned(bytes))
}

fn surface_layout(memory: &impl MobMemory, id: u32) -> Result<SurfaceLayout> {
    let desc = memory
        .mob_desc(id)
        .ok_or_else(|| anyhow!("unknown surface {id:#x}"))?;
    let resource = ResourceDesc::from_allocation_desc(&desc)
        .map_err(|e| anyhow!("surface {id:#x}: {e}"))?;
    Ok(resource.layout())
}

/// Executes command streams against [`MobMemory`].
#[derive(Debug, Default)]
pub struct CommandProcessor {
    queries: HashMap<u32, QueryBinding>,
    /// Advances with every executed command; feeds synthetic results.
    ticks: u64,
    current_fence: u64,
}

impl CommandProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Execute one command at the start of `data`. Returns its header; the
    /// command occupied `SVGA3D_CMD_HEADER_SIZE + header.size` bytes.
    pub fn process_command(&mut self, data: &[u8], memory: &mut impl MobMemory) -> Result<CmdHeader> {
        if data.len() < SVGA3D_CMD_HEADER_SIZE {
            return Err(anyhow!("Command too small"));
        }
        let header: CmdHeader = bytemuck::pod_read_unaligned(&data[..SVGA3D_CMD_HEADER_SIZE]);
        let end = SVGA3D_CMD_HEADER_SIZE + header.size as usize;
        let payload = data
            .get(SVGA3D_CMD_HEADER_SIZE..end)
            .ok_or_else(|| anyhow!("Command size exceeds available data"))?;
        self.ticks += 1;

        let opcode = header.id;
        match opcode {
            SVGA_3D_CMD_DX_DEFINE_QUERY => self.handle_define_query(payload)?,
            SVGA_3D_CMD_DX_BIND_QUERY => self.handle_bind_query(payload)?,
            SVGA_3D_CMD_DX_SET_QUERY_OFFSET => self.handle_set_query_offset(payload)?,
            SVGA_3D_CMD_DX_DESTROY_QUERY => self.handle_destroy_query(payload)?,
            SVGA_3D_CMD_DX_BEGIN_QUERY => self.handle_begin_query(payload, memory)?,
            SVGA_3D_CMD_DX_READBACK_QUERY => self.handle_readback_query(payload, memory)?,
            SVGA_3D_CMD_DX_MOB_FENCE_64 => self.handle_mob_fence(payload, memory)?,
            SVGA_3D_CMD_DX_TRANSFER_FROM_BUFFER => self.handle_transfer_from_buffer(payload, memory)?,
            SVGA_3D_CMD_DX_PRED_COPY => self.handle_pred_copy(payload, memory)?,
            SVGA_3D_CMD_DX_PRED_COPY_REGION => self.handle_pred_copy_region(payload, memory)?,
            SVGA_3D_CMD_DX_END_QUERY
            | SVGA_3D_CMD_DX_SET_PREDICATION
            | SVGA_3D_CMD_DX_UPDATE_SUBRESOURCE
            | SVGA_3D_CMD_DX_READBACK_SUBRESOURCE
            | SVGA_3D_CMD_DX_SET_SHADER_RESOURCES
            | SVGA_3D_CMD_DX_SET_SHADER
            | SVGA_3D_CMD_DX_SET_RENDERTARGETS
            | SVGA_3D_CMD_DX_SET_CS_UA_VIEWS
            | SVGA_3D_CMD_DX_DEFINE_SHADERRESOURCE_VIEW
            | SVGA_3D_CMD_DX_DESTROY_SHADERRESOURCE_VIEW
            | SVGA_3D_CMD_DX_DEFINE_RENDERTARGET_VIEW
            | SVGA_3D_CMD_DX_DESTROY_RENDERTARGET_VIEW
            | SVGA_3D_CMD_DX_DEFINE_DEPTHSTENCIL_VIEW_V2
            | SVGA_3D_CMD_DX_DESTROY_DEPTHSTENCIL_VIEW
            | SVGA_3D_CMD_DX_DEFINE_UA_VIEW
            | SVGA_3D_CMD_DX_DESTROY_UA_VIEW
            | SVGA_3D_CMD_DX_DEFINE_SHADER
            | SVGA_3D_CMD_DX_BIND_SHADER
            | SVGA_3D_CMD_DX_DESTROY_SHADER
            | SVGA_3D_CMD_DX_DEFINE_STREAMOUTPUT_WITH_MOB
            | SVGA_3D_CMD_DX_BIND_STREAMOUTPUT
            | SVGA_3D_CMD_DX_DESTROY_STREAMOUTPUT => {
                trace!("{}: {} payload bytes", command_name(opcode), payload.len());
            }
            _ => {
                warn!("Unknown command type: {}", opcode);
            }
        }
        Ok(header)
    }

    /// Execute every command in `stream`. Returns the opcodes in order.
    pub fn process_stream(&mut self, stream: &[u8], memory: &mut impl MobMemory) -> Result<Vec<u32>> {
        let mut cursor = 0;
        let mut opcodes = Vec::new();
        while cursor < stream.len() {
            let header = self
                .process_command(&stream[cursor..], memory)
                .with_context(|| format!("command at offset {cursor}"))?;
            opcodes.push(header.id);
            cursor += SVGA3D_CMD_HEADER_SIZE + header.size as usize;
        }
        Ok(opcodes)
    }

    fn handle_define_query(&mut self, data: &[u8]) -> Result<()> {
        let cmd: CmdDxDefineQuery = read_cmd(data, SVGA_3D_CMD_DX_DEFINE_QUERY)?;
        debug!("DefineQuery: id={}, type={}", cmd.query_id, cmd.query_type);
        self.queries.insert(
            cmd.query_id,
            QueryBinding {
                svga_type: cmd.query_type,
                mob: None,
                offset: 0,
            },
        );
        Ok(())
    }

    fn handle_bind_query(&mut self, data: &[u8]) -> Result<()> {
        let cmd: CmdDxBindQuery = read_cmd(data, SVGA_3D_CMD_DX_BIND_QUERY)?;
        let query = self
            .queries
            .get_mut(&cmd.query_id)
            .ok_or_else(|| anyhow!("BindQuery of undefined query {}", cmd.query_id))?;
        query.mob = (cmd.mobid != SVGA3D_INVALID_ID).then_some(cmd.mobid);
        Ok(())
    }

    fn handle_set_query_offset(&mut self, data: &[u8]) -> Result<()> {
        let cmd: CmdDxSetQueryOffset = read_cmd(data, SVGA_3D_CMD_DX_SET_QUERY_OFFSET)?;
        let query = self
            .queries
            .get_mut(&cmd.query_id)
            .ok_or_else(|| anyhow!("SetQueryOffset of undefined query {}", cmd.query_id))?;
        query.offset = cmd.mob_offset;
        Ok(())
    }

    fn handle_destroy_query(&mut self, data: &[u8]) -> Result<()> {
        let cmd: CmdDxQueryId = read_cmd(data, SVGA_3D_CMD_DX_DESTROY_QUERY)?;
        if self.queries.remove(&cmd.query_id).is_none() {
            warn!("DestroyQuery: query {} was never defined", cmd.query_id);
        }
        Ok(())
    }

    /// A restarted query reads as pending until its next readback.
    fn handle_begin_query(&mut self, data: &[u8], memory: &mut impl MobMemory) -> Result<()> {
        let cmd: CmdDxQueryId = read_cmd(data, SVGA_3D_CMD_DX_BEGIN_QUERY)?;
        let query = *self
            .queries
            .get(&cmd.query_id)
            .ok_or_else(|| anyhow!("BeginQuery of undefined query {}", cmd.query_id))?;
        if let Some(mob) = query.mob {
            let start = query.offset as usize;
            let status = memory
                .mob_mut(mob)
                .and_then(|bytes| bytes.get_mut(start..start + 4))
                .ok_or_else(|| anyhow!("query {} slot outside mob {mob:#x}", cmd.query_id))?;
            status.copy_from_slice(&SVGA3D_QUERYSTATE_PENDING.to_le_bytes());
        }
        Ok(())
    }

    /// Fill the result the way a device that has finished the query would.
    fn synthetic_result(&self, svga_type: u32) -> Vec<u8> {
        let mut result = vec![0u8; result_size(svga_type)];
        match svga_type {
            SVGA3D_QUERYTYPE_TIMESTAMPDISJOINT => {
                result[..8].copy_from_slice(&1_000_000_000u64.to_le_bytes());
            }
            SVGA3D_QUERYTYPE_OCCLUSIONPREDICATE => result[..4].copy_from_slice(&1u32.to_le_bytes()),
            SVGA3D_QUERYTYPE_OCCLUSION => {
                result[..4].copy_from_slice(&(self.ticks as u32).to_le_bytes());
            }
            SVGA3D_QUERYTYPE_STREAMOVERFLOWPREDICATE => {}
            t if (SVGA3D_QUERYTYPE_SOP_STREAM0..SVGA3D_QUERYTYPE_SOP_STREAM0 + 4).contains(&t) => {}
            _ => {
                for (i, word) in result.chunks_exact_mut(8).enumerate() {
                    word.copy_from_slice(&(self.ticks * 16 + i as u64 + 1).to_le_bytes());
                }
            }
        }
        result
    }

    fn handle_readback_query(&mut self, data: &[u8], memory: &mut impl MobMemory) -> Result<()> {
        let cmd: CmdDxQueryId = read_cmd(data, SVGA_3D_CMD_DX_READBACK_QUERY)?;
        let query = *self
            .queries
            .get(&cmd.query_id)
            .ok_or_else(|| anyhow!("ReadbackQuery of undefined query {}", cmd.query_id))?;
        let Some(mob) = query.mob else {
            warn!("ReadbackQuery: query {} has no memory bound", cmd.query_id);
            return Ok(());
        };

        let result = self.synthetic_result(query.svga_type);
        let start = query.offset as usize;
        let slot = memory
            .mob_mut(mob)
            .and_then(|bytes| bytes.get_mut(start..start + 4 + result.len()))
            .ok_or_else(|| anyhow!("query {} slot outside mob {mob:#x}", cmd.query_id))?;
        slot[..4].copy_from_slice(&SVGA3D_QUERYSTATE_SUCCEEDED.to_le_bytes());
        slot[4..].copy_from_slice(&result);
        debug!("ReadbackQuery: id={}, {} result bytes", cmd.query_id, result.len());
        Ok(())
    }

    fn handle_mob_fence(&mut self, data: &[u8], memory: &mut impl MobMemory) -> Result<()> {
        let cmd: CmdDxMobFence64 = read_cmd(data, SVGA_3D_CMD_DX_MOB_FENCE_64)?;
        let start = cmd.mob_offset as usize;
        let target = memory
            .mob_mut(cmd.mob_id)
            .and_then(|bytes| bytes.get_mut(start..start + 8))
            .ok_or_else(|| anyhow!("fence at {start} outside mob {:#x}", cmd.mob_id))?;
        target.copy_from_slice(&cmd.value.to_le_bytes());
        self.current_fence = cmd.value;
        debug!("Fence: value={}", cmd.value);
        Ok(())
    }

    fn handle_transfer_from_buffer(&mut self, data: &[u8], memory: &mut impl MobMemory) -> Result<()> {
        let cmd: CmdDxTransferFromBuffer = read_cmd(data, SVGA_3D_CMD_DX_TRANSFER_FROM_BUFFER)?;
        let layout = surface_layout(memory, cmd.dest_sid)?;
        let source = memory
            .mob(cmd.src_sid)
            .and_then(|bytes| bytes.get(cmd.src_offset as usize..))
            .ok_or_else(|| anyhow!("transfer source {:#x} too small", cmd.src_sid))?
            .to_vec();

        let sub = cmd.dest_sub_resource;
        let region = layout.box_layout(sub, &cmd.dest_box);
        let origin = layout.subresource_offset(sub) as usize + region.offset as usize;
        let rows = SourceRows {
            data: &source,
            row_pitch: cmd.src_pitch as usize,
            depth_pitch: cmd.src_slice_pitch as usize,
        };
        let target = memory
            .mob_mut(cmd.dest_sid)
            .ok_or_else(|| anyhow!("unknown surface {:#x}", cmd.dest_sid))?;
        copy_box(target, origin, layout.subresource_pitch(sub), &rows, &region)
            .map_err(|e| anyhow!("TransferFromBuffer: {e}"))?;
        trace!("TransferFromBuffer: {:#x} -> {:#x} sub {}", cmd.src_sid, cmd.dest_sid, sub);
        Ok(())
    }

    fn handle_pred_copy(&mut self, data: &[u8], memory: &mut impl MobMemory) -> Result<()> {
        let cmd: CmdDxPredCopy = read_cmd(data, SVGA_3D_CMD_DX_PRED_COPY)?;
        let source = memory
            .mob(cmd.src_sid)
            .ok_or_else(|| anyhow!("unknown surface {:#x}", cmd.src_sid))?
            .to_vec();
        let target = memory
            .mob_mut(cmd.dst_sid)
            .ok_or_else(|| anyhow!("unknown surface {:#x}", cmd.dst_sid))?;
        let len = source.len().min(target.len());
        target[..len].copy_from_slice(&source[..len]);
        trace!("PredCopy: {:#x} -> {:#x}, {} bytes", cmd.src_sid, cmd.dst_sid, len);
        Ok(())
    }

    fn handle_pred_copy_region(&mut self, data: &[u8], memory: &mut impl MobMemory) -> Result<()> {
        let cmd: CmdDxPredCopyRegion = read_cmd(data, SVGA_3D_CMD_DX_PRED_COPY_REGION)?;
        let src_layout = surface_layout(memory, cmd.src_sid)?;
        let dst_layout = surface_layout(memory, cmd.dst_sid)?;
        let b = cmd.box_;
        let src_box = SvgaBox {
            x: b.srcx,
            y: b.srcy,
            z: b.srcz,
            w: b.w,
            h: b.h,
            d: b.d,
        };
        let dst_box = SvgaBox { x: b.x, y: b.y, z: b.z, ..src_box };

        let src_region = src_layout.box_layout(cmd.src_sub_resource, &src_box);
        let (src_row, src_depth) = src_layout.subresource_pitch(cmd.src_sub_resource);
        let src_origin =
            src_layout.subresource_offset(cmd.src_sub_resource) as usize + src_region.offset as usize;
        let source = memory
            .mob(cmd.src_sid)
            .and_then(|bytes| bytes.get(src_origin..))
            .ok_or_else(|| anyhow!("copy source {:#x} too small", cmd.src_sid))?
            .to_vec();

        let dst_region = dst_layout.box_layout(cmd.dst_sub_resource, &dst_box);
        let dst_origin =
            dst_layout.subresource_offset(cmd.dst_sub_resource) as usize + dst_region.offset as usize;
        let rows = SourceRows {
            data: &source,
            row_pitch: src_row as usize,
            depth_pitch: src_depth as usize,
        };
        let target = memory
            .mob_mut(cmd.dst_sid)
            .ok_or_else(|| anyhow!("unknown surface {:#x}", cmd.dst_sid))?;
        copy_box(
            target,
            dst_origin,
            dst_layout.subresource_pitch(cmd.dst_sub_resource),
            &rows,
            &src_region,
        )
        .map_err(|e| anyhow!("PredCopyRegion: {e}"))?;
        Ok(())
    }

    /// Value of the last executed MOB fence.
    pub fn current_fence(&self) -> u64 {
        self.current_fence
    }
}

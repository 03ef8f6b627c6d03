//! Shaders: placement in the shader arena, repacking, stream-output
//! declarations and teardown.

use tracing::{debug, info, warn};

use crate::error::{DxError, DxResult};
use crate::kernel::{AllocationHandle, KernelCallbacks, LockFlags};
use crate::protocol::{AllocationDesc, AllocationKind, ShaderType, SVGA3D_INVALID_ID};
use crate::shader::{
    build_shader_blob, Shader, ShaderId, ShaderSignatures, StreamOutputBinding, StreamOutputDesc,
};
use crate::shader_arena::ShaderArena;

use super::Device;

fn write_at(bytes: &mut [u8], offset: u32, data: &[u8]) -> DxResult<()> {
    let start = offset as usize;
    bytes
        .get_mut(start..start + data.len())
        .ok_or_else(|| DxError::invalid(format!("{}-byte write at {offset} past allocation end", data.len())))?
        .copy_from_slice(data);
    Ok(())
}

impl<K: KernelCallbacks> Device<K> {
    pub(crate) fn shader_ref(&self, id: ShaderId) -> DxResult<&Shader> {
        self.shaders
            .get(id)
            .ok_or_else(|| DxError::invalid(format!("unknown shader {id:?}")))
    }

    /// Create a shader from DXBC bytecode and its signatures.
    pub fn create_shader(
        &mut self,
        ty: ShaderType,
        code: &[u32],
        signatures: &ShaderSignatures<'_>,
    ) -> DxResult<ShaderId> {
        self.recorded(|device| {
            let blob = build_shader_blob(code, signatures)?;
            device.define_shader(ty, blob)
        })
    }

    /// Create a geometry shader with a stream-output declaration. Without
    /// bytecode only the declaration is defined on the host.
    pub fn create_geometry_shader_with_stream_output(
        &mut self,
        code: Option<&[u32]>,
        signatures: &ShaderSignatures<'_>,
        stream_output: &StreamOutputDesc<'_>,
    ) -> DxResult<ShaderId> {
        self.recorded(|device| {
            stream_output.validate()?;
            let id = match code {
                Some(code) => {
                    let blob = build_shader_blob(code, signatures)?;
                    device.define_shader(ShaderType::Geometry, blob)?
                }
                None => device
                    .shaders
                    .insert(Shader {
                        ty: ShaderType::Geometry,
                        offset: 0,
                        blob: Vec::new(),
                        defined: false,
                        stream_output: None,
                    })
                    .ok_or_else(|| DxError::out_of_memory("shader table is full"))?,
            };
            if let Err(e) = device.attach_stream_output(id, stream_output) {
                let _ = device.destroy_shader_inner(id);
                return Err(e);
            }
            Ok(id)
        })
    }

    fn ensure_shader_arena(&mut self) -> DxResult<()> {
        if self.shader_arena.is_some() {
            return Ok(());
        }
        let capacity = self.config.shader_memory_bytes;
        let desc = AllocationDesc {
            kind: AllocationKind::Shaders as u32,
            size: capacity,
            ..Default::default()
        };
        let handle = self.allocate_with_retry(&desc)?;
        info!("Shader allocation {} created ({} bytes)", handle, capacity);
        self.shader_arena = Some(ShaderArena::new(handle, capacity));
        Ok(())
    }

    /// Find `size` bytes in the arena, repacking when only fragmented space
    /// is left.
    fn allocate_shader_space(&mut self, size: u32) -> DxResult<(AllocationHandle, u32)> {
        self.ensure_shader_arena()?;
        let Some(arena) = self.shader_arena.as_mut() else {
            return Err(DxError::invalid("shader allocation missing"));
        };
        let handle = arena.handle();
        if let Some(offset) = arena.alloc(size) {
            return Ok((handle, offset));
        }
        if !arena.fits_after_repack(size) {
            return Err(DxError::out_of_memory(format!(
                "{size}-byte shader, {} of {} bytes free",
                arena.available(),
                arena.capacity()
            )));
        }

        warn!(
            "Shader allocation fragmented ({} free, {} contiguous), repacking",
            arena.available(),
            arena.contiguous()
        );
        self.repack_shaders()?;
        self.shader_arena
            .as_mut()
            .and_then(|arena| arena.alloc(size))
            .map(|offset| (handle, offset))
            .ok_or_else(|| DxError::out_of_memory(format!("{size}-byte shader after repack")))
    }

    fn free_shader_space(&mut self, size: u32) {
        if let Some(arena) = self.shader_arena.as_mut() {
            arena.free(size);
        }
    }

    fn define_shader(&mut self, ty: ShaderType, blob: Vec<u8>) -> DxResult<ShaderId> {
        let size = u32::try_from(blob.len())
            .map_err(|_| DxError::out_of_memory(format!("{}-byte shader", blob.len())))?;
        let (handle, offset) = self.allocate_shader_space(size)?;

        let written = self.with_locked(handle, LockFlags::WRITE_ONLY, |bytes| write_at(bytes, offset, &blob));
        if let Err(e) = written {
            self.free_shader_space(size);
            return Err(e);
        }
        let shader = Shader {
            ty,
            offset,
            blob,
            defined: true,
            stream_output: None,
        };
        let Some(id) = self.shaders.insert(shader) else {
            self.free_shader_space(size);
            return Err(DxError::out_of_memory("shader table is full"));
        };

        self.cmd_define_shader(id.id(), ty, size)?;
        self.cmd_bind_shader(id.id(), handle, offset)?;
        debug!("Defined {:?} shader {} at {} ({} bytes)", ty, id.id(), offset, size);
        Ok(id)
    }

    /// Move every live shader down to close the holes left by destroyed
    /// ones and rebind the shaders that moved.
    pub(crate) fn repack_shaders(&mut self) -> DxResult<()> {
        self.flush_commands()?;

        let live: Vec<(ShaderId, u32, u32)> = self
            .shaders
            .iter()
            .filter(|(_, shader)| shader.defined)
            .map(|(id, shader)| (id, shader.offset, shader.size()))
            .collect();
        let Some(arena) = self.shader_arena.as_mut() else {
            return Ok(());
        };
        let handle = arena.handle();
        let moves = arena.repack(&live);
        let available = arena.available();
        if moves.is_empty() {
            return Ok(());
        }

        let writes: Vec<(u32, Vec<u8>)> = moves
            .iter()
            .filter_map(|m| self.shaders.get(m.key).map(|shader| (m.to, shader.blob.clone())))
            .collect();
        self.with_locked(handle, LockFlags::WRITE_ONLY, |bytes| {
            writes
                .iter()
                .try_for_each(|(offset, blob)| write_at(bytes, *offset, blob))
        })?;

        for m in &moves {
            if let Some(shader) = self.shaders.get_mut(m.key) {
                shader.offset = m.to;
            }
            self.cmd_bind_shader(m.key.id(), handle, m.to)?;
        }
        info!(
            "Repacked shader allocation: {} of {} shaders moved, {} bytes free",
            moves.len(),
            live.len(),
            available
        );
        Ok(())
    }

    fn attach_stream_output(&mut self, id: ShaderId, desc: &StreamOutputDesc<'_>) -> DxResult<()> {
        let entries = desc.entries();
        let bytes: &[u8] = bytemuck::cast_slice(&entries);
        let size = bytes.len() as u32;

        let soid = self
            .stream_outputs
            .insert(id)
            .ok_or_else(|| DxError::out_of_memory("stream-output table is full"))?;
        let link_size = size.saturating_mul(self.config.stream_output_link_factor);
        let block = match self.stream_output_chain.alloc_or_grow(&mut self.kernel, size, link_size) {
            Ok(block) => block,
            Err(e) => {
                self.stream_outputs.remove(soid);
                return Err(e);
            }
        };
        if let Some(shader) = self.shaders.get_mut(id) {
            shader.stream_output = Some(StreamOutputBinding { id: soid, block });
        }

        self.with_locked(block.handle, LockFlags::WRITE_ONLY, |co| write_at(co, block.offset, bytes))?;
        self.cmd_define_stream_output_with_mob(
            soid.id(),
            entries.len() as u32,
            desc.stride_array(),
            desc.strides.len() as u32,
            desc.rasterized_stream,
        )?;
        self.cmd_bind_stream_output(soid.id(), block.handle, block.offset, size)?;
        debug!(
            "Stream output {} for shader {}: {} entries at {}+{}",
            soid.id(),
            id.id(),
            entries.len(),
            block.handle,
            block.offset
        );
        Ok(())
    }

    pub fn destroy_shader(&mut self, id: ShaderId) -> DxResult<()> {
        self.recorded(|device| device.destroy_shader_inner(id))
    }

    pub(crate) fn destroy_shader_inner(&mut self, id: ShaderId) -> DxResult<()> {
        let shader = self.shader_ref(id)?;
        let (ty, defined, size, stream_output) =
            (shader.ty, shader.defined, shader.size(), shader.stream_output);
        let mut result = Ok(());

        if let Some(so) = stream_output {
            result = result.and(self.cmd_destroy_stream_output(so.id.id()));
            self.stream_output_chain.free(so.block);
            self.stream_outputs.remove(so.id);
        }
        if self.pipeline.shaders[ty.stage_index()] == Some(id) {
            self.pipeline.shaders[ty.stage_index()] = None;
            result = result.and(self.cmd_set_shader(ty, SVGA3D_INVALID_ID));
        }
        if defined {
            result = result.and(self.cmd_bind_shader(id.id(), AllocationHandle::NULL, 0));
            result = result.and(self.cmd_destroy_shader(id.id()));
        }
        // The host must be done with the bytes before they are handed out again.
        result = result.and(self.flush_inner(true));
        if defined {
            self.free_shader_space(size);
        }
        self.shaders.remove(id);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceConfig, LoopbackConfig};
    use crate::loopback::LoopbackKernel;
    use crate::protocol::{
        SVGA_3D_CMD_DX_BIND_SHADER, SVGA_3D_CMD_DX_DEFINE_STREAMOUTPUT_WITH_MOB,
        SVGA_3D_CMD_DX_DESTROY_STREAMOUTPUT,
    };
    use crate::shader::StreamOutputElement;

    fn device_with_arena(bytes: u32) -> Device<LoopbackKernel> {
        let config = DeviceConfig {
            shader_memory_bytes: bytes,
            ..Default::default()
        };
        Device::new(LoopbackKernel::new(LoopbackConfig::default()), config).unwrap()
    }

    /// A 16-byte program; with an empty signature block the blob is 32 bytes.
    fn program(tag: u32) -> [u32; 4] {
        [0x4342_5844, 4, tag, 0]
    }

    fn create(device: &mut Device<LoopbackKernel>, tag: u32) -> ShaderId {
        device
            .create_shader(ShaderType::Pixel, &program(tag), &ShaderSignatures::default())
            .unwrap()
    }

    #[test]
    fn test_first_shader_creates_arena() {
        let mut device = device_with_arena(1024);
        assert!(device.shader_arena().is_none());
        let id = create(&mut device, 1);
        let arena = device.shader_arena().unwrap();
        assert_eq!(arena.capacity(), 1024);
        assert_eq!(arena.offset_free(), 32);
        assert_eq!(device.shader(id).unwrap().size(), 32);

        let contents = device.kernel().contents(arena.handle()).unwrap();
        assert_eq!(&contents[8..12], &1u32.to_le_bytes());
        // DefineShader + BindShader.
        assert_eq!(device.command_buffer().used(), (8 + 12) + (8 + 16));
    }

    #[test]
    fn test_set_shader_checks_stage_and_destroy_unbinds() {
        let mut device = device_with_arena(1024);
        let id = create(&mut device, 1);
        assert!(device.set_shader(ShaderType::Vertex, Some(id)).is_err());
        device.set_shader(ShaderType::Pixel, Some(id)).unwrap();
        assert_eq!(device.pipeline().shader(ShaderType::Pixel), Some(id));

        device.destroy_shader(id).unwrap();
        assert_eq!(device.pipeline().shader(ShaderType::Pixel), None);
        assert_eq!(device.shader_arena().unwrap().available(), 1024);
        assert!(device.destroy_shader(id).is_err());
    }

    #[test]
    fn test_fragmented_arena_is_repacked() {
        let mut device = device_with_arena(256);
        let ids: Vec<ShaderId> = (0..8).map(|tag| create(&mut device, tag)).collect();
        assert_eq!(device.shader_arena().unwrap().contiguous(), 0);

        device.destroy_shader(ids[1]).unwrap();
        device.destroy_shader(ids[4]).unwrap();
        // Each destroy is submitted right away.
        assert!(device.command_buffer().is_empty());
        let submissions = device.kernel().stats().submissions;
        let new = create(&mut device, 99);
        assert_eq!(device.kernel().stats().submissions, submissions + 1);

        // Survivors are packed in their old order, the new shader follows.
        let survivors = [0, 2, 3, 5, 6, 7];
        for (slot, &index) in survivors.iter().enumerate() {
            assert_eq!(device.shader(ids[index]).unwrap().offset(), slot as u32 * 32);
        }
        assert_eq!(device.shader(new).unwrap().offset(), 192);
        assert_eq!(device.shader_arena().unwrap().offset_free(), 224);

        let arena = device.shader_arena().unwrap().handle();
        let contents = device.kernel().contents(arena).unwrap();
        for (slot, &tag) in survivors.iter().chain(&[99]).enumerate() {
            let start = slot * 32 + 8;
            assert_eq!(&contents[start..start + 4], &(tag as u32).to_le_bytes());
        }

        device.flush(false).unwrap();
        // Eight defines plus five moved shaders plus the new one; the two
        // destroyed shaders were unbound.
        assert_eq!(
            device.kernel().stats().histogram.get(&SVGA_3D_CMD_DX_BIND_SHADER),
            Some(&(8 + 2 + 5 + 1))
        );
    }

    #[test]
    fn test_arena_exhaustion_is_out_of_memory() {
        let mut device = device_with_arena(64);
        create(&mut device, 1);
        create(&mut device, 2);
        let err = device
            .create_shader(ShaderType::Pixel, &program(3), &ShaderSignatures::default())
            .unwrap_err();
        assert!(matches!(err, DxError::OutOfMemory(_)));
        assert_eq!(device.shaders.len(), 2);
    }

    #[test]
    fn test_stream_output_only_geometry_shader() {
        let mut device = device_with_arena(1024);
        let elements = [
            StreamOutputElement {
                stream: 0,
                output_slot: 0,
                register_index: 0,
                register_mask: 0xF,
            },
            StreamOutputElement {
                stream: 0,
                output_slot: 1,
                register_index: 1,
                register_mask: 0x3,
            },
        ];
        let so = StreamOutputDesc {
            elements: &elements,
            strides: &[16, 8],
            rasterized_stream: 0,
        };
        let id = device
            .create_geometry_shader_with_stream_output(None, &ShaderSignatures::default(), &so)
            .unwrap();
        let shader = device.shader(id).unwrap();
        assert!(!shader.is_defined());
        assert!(shader.has_stream_output());
        assert!(device.shader_arena().is_none());
        assert_eq!(device.stream_output_chain().links().len(), 1);
        assert_eq!(device.stream_output_chain().links()[0].size(), 8 * 32);

        device.destroy_shader(id).unwrap();
        assert_eq!(device.stream_output_chain().links()[0].used_blocks(), 0);
        device.flush(false).unwrap();
        let histogram = &device.kernel().stats().histogram;
        assert_eq!(histogram.get(&SVGA_3D_CMD_DX_DEFINE_STREAMOUTPUT_WITH_MOB), Some(&1));
        assert_eq!(histogram.get(&SVGA_3D_CMD_DX_DESTROY_STREAMOUTPUT), Some(&1));
    }
}

//! Shader Module
//!
//! Shader objects as stored in the shader arena: DXBC bytecode followed by
//! the SVGA signature block. Also the stream-output declaration of geometry
//! shaders.

use crate::coalloc::CoBlock;
use crate::error::{DxError, DxResult};
use crate::handle_table::Handle;
use crate::protocol::{
    ShaderType, SignatureEntry, SignatureHeader, StreamOutputDeclarationEntry,
    SVGA3D_DX_MAX_SOTARGETS, SVGA3D_MAX_STREAMOUT_DECLS, SVGADX_SIGNATURE_HEADER_VERSION_0,
};

pub type ShaderId = Handle<Shader>;
pub type StreamOutputId = Handle<ShaderId>;

/// Input, output and patch-constant signatures of a shader.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShaderSignatures<'a> {
    pub inputs: &'a [SignatureEntry],
    pub outputs: &'a [SignatureEntry],
    pub patch_constants: &'a [SignatureEntry],
}

impl ShaderSignatures<'_> {
    pub fn byte_size(&self) -> usize {
        std::mem::size_of::<SignatureHeader>()
            + (self.inputs.len() + self.outputs.len() + self.patch_constants.len())
                * std::mem::size_of::<SignatureEntry>()
    }
}

/// Length in bytes of a DXBC program; token 1 holds its length in dwords.
pub fn bytecode_size(code: &[u32]) -> DxResult<usize> {
    let dwords = *code
        .get(1)
        .ok_or_else(|| DxError::invalid("shader bytecode shorter than its header"))?
        as usize;
    if dwords < 2 || dwords > code.len() {
        return Err(DxError::invalid(format!(
            "shader declares {dwords} dwords but {} were supplied",
            code.len()
        )));
    }
    Ok(dwords * 4)
}

/// Bytecode followed by the signature header and entries, as the host
/// expects them in the shader allocation.
pub fn build_shader_blob(code: &[u32], signatures: &ShaderSignatures<'_>) -> DxResult<Vec<u8>> {
    let code_bytes = bytecode_size(code)?;
    let mut blob = Vec::with_capacity(code_bytes + signatures.byte_size());
    blob.extend_from_slice(bytemuck::cast_slice(&code[..code_bytes / 4]));

    let header = SignatureHeader {
        header_version: SVGADX_SIGNATURE_HEADER_VERSION_0,
        num_input_signatures: signatures.inputs.len() as u32,
        num_output_signatures: signatures.outputs.len() as u32,
        num_patch_constant_signatures: signatures.patch_constants.len() as u32,
    };
    blob.extend_from_slice(bytemuck::bytes_of(&header));
    for entries in [signatures.inputs, signatures.outputs, signatures.patch_constants] {
        blob.extend_from_slice(bytemuck::cast_slice(entries));
    }
    Ok(blob)
}

/// One stream-output declaration element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamOutputElement {
    pub stream: u32,
    pub output_slot: u32,
    pub register_index: u32,
    pub register_mask: u8,
}

#[derive(Debug, Clone, Copy)]
pub struct StreamOutputDesc<'a> {
    pub elements: &'a [StreamOutputElement],
    pub strides: &'a [u32],
    pub rasterized_stream: u32,
}

impl StreamOutputDesc<'_> {
    pub fn validate(&self) -> DxResult<()> {
        if self.elements.is_empty() || self.elements.len() > SVGA3D_MAX_STREAMOUT_DECLS {
            return Err(DxError::invalid(format!(
                "{} stream-output entries (1..={SVGA3D_MAX_STREAMOUT_DECLS})",
                self.elements.len()
            )));
        }
        if self.strides.len() > SVGA3D_DX_MAX_SOTARGETS {
            return Err(DxError::invalid(format!(
                "{} stream-output strides (max {SVGA3D_DX_MAX_SOTARGETS})",
                self.strides.len()
            )));
        }
        if let Some(bad) = self.elements.iter().find(|e| e.stream > 3 || e.output_slot > 3) {
            return Err(DxError::invalid(format!("stream-output element {bad:?} out of range")));
        }
        Ok(())
    }

    pub fn entries(&self) -> Vec<StreamOutputDeclarationEntry> {
        self.elements
            .iter()
            .map(|e| StreamOutputDeclarationEntry {
                output_slot: e.output_slot,
                register_index: e.register_index,
                register_mask: e.register_mask,
                pad0: 0,
                pad1: 0,
                stream: e.stream,
            })
            .collect()
    }

    pub fn stride_array(&self) -> [u32; SVGA3D_DX_MAX_SOTARGETS] {
        let mut strides = [0; SVGA3D_DX_MAX_SOTARGETS];
        strides[..self.strides.len()].copy_from_slice(self.strides);
        strides
    }
}

/// Stream-output declaration attached to a geometry shader.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StreamOutputBinding {
    pub id: StreamOutputId,
    pub block: CoBlock,
}

/// A live shader.
#[derive(Debug)]
pub struct Shader {
    pub(crate) ty: ShaderType,
    /// Offset of the blob in the shader allocation.
    pub(crate) offset: u32,
    /// CPU copy of what lives at `offset`, rewritten on repack.
    pub(crate) blob: Vec<u8>,
    /// False for stream-output-only geometry shaders without bytecode.
    pub(crate) defined: bool,
    pub(crate) stream_output: Option<StreamOutputBinding>,
}

impl Shader {
    pub fn shader_type(&self) -> ShaderType {
        self.ty
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Bytes occupied in the shader allocation.
    pub fn size(&self) -> u32 {
        self.blob.len() as u32
    }

    pub fn is_defined(&self) -> bool {
        self.defined
    }

    pub fn has_stream_output(&self) -> bool {
        self.stream_output.is_some()
    }
}

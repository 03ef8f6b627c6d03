//! SVGA3D Protocol - Rust bindings
//!
//! Manual Rust bindings for the subset of the SVGA3D/VGPU10 command set the
//! driver core emits, plus the private allocation descriptor exchanged with
//! the kernel-mode driver. Layouts match the C structures byte for byte.

use bytemuck::{Pod, Zeroable};

/// Object ID meaning "none" in every SVGA3D command field.
pub const SVGA3D_INVALID_ID: u32 = u32::MAX;

/// Size of [`CmdHeader`] on the wire.
pub const SVGA3D_CMD_HEADER_SIZE: usize = 8;

/// Default size of the per-device shader allocation (8MB).
pub const SVGA3D_MAX_SHADER_MEMORY_BYTES: u32 = 8 * 1024 * 1024;

// =============================================================================
// Limits
// =============================================================================

pub const SVGA_COTABLE_MAX_IDS: u32 = u16::MAX as u32 - 2;
pub const SVGA3D_MAX_SHADERIDS: u32 = SVGA_COTABLE_MAX_IDS;
pub const SVGA3D_MAX_STREAMOUT_DECLS: usize = 512;
pub const SVGA3D_DX_MAX_SOTARGETS: usize = 4;
pub const SVGA3D_MAX_SIMULTANEOUS_RENDER_TARGETS: usize = 8;
pub const SVGA3D_DX_MAX_SRVIEWS: usize = 128;
pub const SVGA3D_DX11_1_MAX_UAVIEWS: usize = 64;

// =============================================================================
// Command IDs
// =============================================================================

pub const SVGA_3D_CMD_DX_DEFINE_CONTEXT: u32 = 1143;
pub const SVGA_3D_CMD_DX_SET_SHADER_RESOURCES: u32 = 1149;
pub const SVGA_3D_CMD_DX_SET_SHADER: u32 = 1150;
pub const SVGA_3D_CMD_DX_SET_RENDERTARGETS: u32 = 1161;
pub const SVGA_3D_CMD_DX_DEFINE_QUERY: u32 = 1165;
pub const SVGA_3D_CMD_DX_DESTROY_QUERY: u32 = 1166;
pub const SVGA_3D_CMD_DX_BIND_QUERY: u32 = 1167;
pub const SVGA_3D_CMD_DX_SET_QUERY_OFFSET: u32 = 1168;
pub const SVGA_3D_CMD_DX_BEGIN_QUERY: u32 = 1169;
pub const SVGA_3D_CMD_DX_END_QUERY: u32 = 1170;
pub const SVGA_3D_CMD_DX_READBACK_QUERY: u32 = 1171;
pub const SVGA_3D_CMD_DX_SET_PREDICATION: u32 = 1172;
pub const SVGA_3D_CMD_DX_PRED_COPY_REGION: u32 = 1178;
pub const SVGA_3D_CMD_DX_PRED_COPY: u32 = 1179;
pub const SVGA_3D_CMD_DX_UPDATE_SUBRESOURCE: u32 = 1182;
pub const SVGA_3D_CMD_DX_READBACK_SUBRESOURCE: u32 = 1183;
pub const SVGA_3D_CMD_DX_DEFINE_SHADERRESOURCE_VIEW: u32 = 1185;
pub const SVGA_3D_CMD_DX_DESTROY_SHADERRESOURCE_VIEW: u32 = 1186;
pub const SVGA_3D_CMD_DX_DEFINE_RENDERTARGET_VIEW: u32 = 1187;
pub const SVGA_3D_CMD_DX_DESTROY_RENDERTARGET_VIEW: u32 = 1188;
pub const SVGA_3D_CMD_DX_DESTROY_DEPTHSTENCIL_VIEW: u32 = 1190;
pub const SVGA_3D_CMD_DX_DEFINE_SHADER: u32 = 1201;
pub const SVGA_3D_CMD_DX_DESTROY_SHADER: u32 = 1202;
pub const SVGA_3D_CMD_DX_BIND_SHADER: u32 = 1203;
pub const SVGA_3D_CMD_DX_DESTROY_STREAMOUTPUT: u32 = 1205;
pub const SVGA_3D_CMD_DX_TRANSFER_FROM_BUFFER: u32 = 1210;
pub const SVGA_3D_CMD_DX_MOB_FENCE_64: u32 = 1216;
pub const SVGA_3D_CMD_DX_DEFINE_UA_VIEW: u32 = 1245;
pub const SVGA_3D_CMD_DX_DESTROY_UA_VIEW: u32 = 1246;
pub const SVGA_3D_CMD_DX_SET_CS_UA_VIEWS: u32 = 1268;
pub const SVGA_3D_CMD_DX_DEFINE_DEPTHSTENCIL_VIEW_V2: u32 = 1272;
pub const SVGA_3D_CMD_DX_DEFINE_STREAMOUTPUT_WITH_MOB: u32 = 1273;
pub const SVGA_3D_CMD_DX_BIND_STREAMOUTPUT: u32 = 1275;

/// Human readable opcode name for logs.
pub fn command_name(id: u32) -> &'static str {
    match id {
        SVGA_3D_CMD_DX_DEFINE_CONTEXT => "DefineContext",
        SVGA_3D_CMD_DX_SET_SHADER_RESOURCES => "SetShaderResources",
        SVGA_3D_CMD_DX_SET_SHADER => "SetShader",
        SVGA_3D_CMD_DX_SET_RENDERTARGETS => "SetRenderTargets",
        SVGA_3D_CMD_DX_DEFINE_QUERY => "DefineQuery",
        SVGA_3D_CMD_DX_DESTROY_QUERY => "DestroyQuery",
        SVGA_3D_CMD_DX_BIND_QUERY => "BindQuery",
        SVGA_3D_CMD_DX_SET_QUERY_OFFSET => "SetQueryOffset",
        SVGA_3D_CMD_DX_BEGIN_QUERY => "BeginQuery",
        SVGA_3D_CMD_DX_END_QUERY => "EndQuery",
        SVGA_3D_CMD_DX_READBACK_QUERY => "ReadbackQuery",
        SVGA_3D_CMD_DX_SET_PREDICATION => "SetPredication",
        SVGA_3D_CMD_DX_PRED_COPY_REGION => "PredCopyRegion",
        SVGA_3D_CMD_DX_PRED_COPY => "PredCopy",
        SVGA_3D_CMD_DX_UPDATE_SUBRESOURCE => "UpdateSubResource",
        SVGA_3D_CMD_DX_READBACK_SUBRESOURCE => "ReadbackSubResource",
        SVGA_3D_CMD_DX_DEFINE_SHADERRESOURCE_VIEW => "DefineShaderResourceView",
        SVGA_3D_CMD_DX_DESTROY_SHADERRESOURCE_VIEW => "DestroyShaderResourceView",
        SVGA_3D_CMD_DX_DEFINE_RENDERTARGET_VIEW => "DefineRenderTargetView",
        SVGA_3D_CMD_DX_DESTROY_RENDERTARGET_VIEW => "DestroyRenderTargetView",
        SVGA_3D_CMD_DX_DESTROY_DEPTHSTENCIL_VIEW => "DestroyDepthStencilView",
        SVGA_3D_CMD_DX_DEFINE_SHADER => "DefineShader",
        SVGA_3D_CMD_DX_DESTROY_SHADER => "DestroyShader",
        SVGA_3D_CMD_DX_BIND_SHADER => "BindShader",
        SVGA_3D_CMD_DX_DESTROY_STREAMOUTPUT => "DestroyStreamOutput",
        SVGA_3D_CMD_DX_TRANSFER_FROM_BUFFER => "TransferFromBuffer",
        SVGA_3D_CMD_DX_MOB_FENCE_64 => "MobFence64",
        SVGA_3D_CMD_DX_DEFINE_UA_VIEW => "DefineUAView",
        SVGA_3D_CMD_DX_DESTROY_UA_VIEW => "DestroyUAView",
        SVGA_3D_CMD_DX_SET_CS_UA_VIEWS => "SetCSUAViews",
        SVGA_3D_CMD_DX_DEFINE_DEPTHSTENCIL_VIEW_V2 => "DefineDepthStencilViewV2",
        SVGA_3D_CMD_DX_DEFINE_STREAMOUTPUT_WITH_MOB => "DefineStreamOutputWithMob",
        SVGA_3D_CMD_DX_BIND_STREAMOUTPUT => "BindStreamOutput",
        _ => "Unknown",
    }
}

// =============================================================================
// Enumerations
// =============================================================================

/// SVGA3dShaderType
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderType {
    Vertex = 1,
    Pixel = 2,
    Geometry = 3,
    Hull = 4,
    Domain = 5,
    Compute = 6,
}

impl ShaderType {
    pub const ALL: [ShaderType; 6] = [
        ShaderType::Vertex,
        ShaderType::Pixel,
        ShaderType::Geometry,
        ShaderType::Hull,
        ShaderType::Domain,
        ShaderType::Compute,
    ];

    /// Zero-based slot for per-stage state arrays.
    pub fn stage_index(self) -> usize {
        self as usize - 1
    }
}

/// SVGA3dResourceType
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceDimension {
    Buffer = 1,
    Texture1D = 2,
    Texture2D = 3,
    Texture3D = 4,
    TextureCube = 5,
    BufferEx = 6,
}

pub const SVGA3D_QUERYTYPE_OCCLUSION: u32 = 0;
pub const SVGA3D_QUERYTYPE_TIMESTAMP: u32 = 1;
pub const SVGA3D_QUERYTYPE_TIMESTAMPDISJOINT: u32 = 2;
pub const SVGA3D_QUERYTYPE_PIPELINESTATS: u32 = 3;
pub const SVGA3D_QUERYTYPE_OCCLUSIONPREDICATE: u32 = 4;
pub const SVGA3D_QUERYTYPE_STREAMOUTPUTSTATS: u32 = 5;
pub const SVGA3D_QUERYTYPE_STREAMOVERFLOWPREDICATE: u32 = 6;
pub const SVGA3D_QUERYTYPE_OCCLUSION64: u32 = 7;
pub const SVGA3D_QUERYTYPE_SOSTATS_STREAM0: u32 = 8;
pub const SVGA3D_QUERYTYPE_SOP_STREAM0: u32 = 12;

pub const SVGA3D_QUERYSTATE_PENDING: u32 = 0;
pub const SVGA3D_QUERYSTATE_SUCCEEDED: u32 = 1;
pub const SVGA3D_QUERYSTATE_FAILED: u32 = 2;

pub const SVGA3D_DXQUERY_FLAG_PREDICATEHINT: u32 = 1 << 0;

pub const SVGADX_SIGNATURE_HEADER_VERSION_0: u32 = 0;

// =============================================================================
// Command Structures
// =============================================================================

/// Every command starts with this header; `size` counts payload bytes only.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct CmdHeader {
    pub id: u32,
    pub size: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct SvgaBox {
    pub x: u32,
    pub y: u32,
    pub z: u32,
    pub w: u32,
    pub h: u32,
    pub d: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct SvgaCopyBox {
    pub x: u32,
    pub y: u32,
    pub z: u32,
    pub w: u32,
    pub h: u32,
    pub d: u32,
    pub srcx: u32,
    pub srcy: u32,
    pub srcz: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdDxDefineShader {
    pub shader_id: u32,
    pub shader_type: u32,
    pub size_in_bytes: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdDxBindShader {
    pub cid: u32,
    pub shid: u32,
    pub mobid: u32,
    pub offset_in_bytes: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdDxDestroyShader {
    pub shader_id: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdDxSetShader {
    pub shader_id: u32,
    pub shader_type: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdDxDefineStreamOutputWithMob {
    pub soid: u32,
    pub num_output_stream_entries: u32,
    pub num_output_stream_strides: u32,
    pub stream_output_stride_in_bytes: [u32; SVGA3D_DX_MAX_SOTARGETS],
    pub rasterized_stream: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdDxBindStreamOutput {
    pub soid: u32,
    pub mobid: u32,
    pub offset_in_bytes: u32,
    pub size_in_bytes: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdDxDestroyStreamOutput {
    pub soid: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdDxDefineQuery {
    pub query_id: u32,
    pub query_type: u32,
    pub flags: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdDxBindQuery {
    pub query_id: u32,
    pub mobid: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdDxSetQueryOffset {
    pub query_id: u32,
    pub mob_offset: u32,
}

/// Payload shared by Begin/End/Readback/DestroyQuery.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdDxQueryId {
    pub query_id: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdDxMobFence64 {
    pub value: u64,
    pub mob_id: u32,
    pub mob_offset: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdDxSetPredication {
    pub query_id: u32,
    pub predicate_value: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdDxUpdateSubResource {
    pub sid: u32,
    pub sub_resource: u32,
    pub box_: SvgaBox,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdDxReadbackSubResource {
    pub sid: u32,
    pub sub_resource: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdDxTransferFromBuffer {
    pub src_sid: u32,
    pub src_offset: u32,
    pub src_pitch: u32,
    pub src_slice_pitch: u32,
    pub dest_sid: u32,
    pub dest_sub_resource: u32,
    pub dest_box: SvgaBox,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdDxPredCopyRegion {
    pub dst_sid: u32,
    pub dst_sub_resource: u32,
    pub src_sid: u32,
    pub src_sub_resource: u32,
    pub box_: SvgaCopyBox,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdDxPredCopy {
    pub dst_sid: u32,
    pub src_sid: u32,
}

/// DefineShaderResourceView / DefineRenderTargetView / DefineUAView share
/// this layout; `desc` is the 16-byte per-dimension union.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdDxDefineView {
    pub view_id: u32,
    pub sid: u32,
    pub format: u32,
    pub resource_dimension: u32,
    pub desc: [u32; 4],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdDxDefineDepthStencilViewV2 {
    pub dsv_id: u32,
    pub sid: u32,
    pub format: u32,
    pub resource_dimension: u32,
    pub mip_slice: u32,
    pub first_array_slice: u32,
    pub array_size: u32,
    pub flags: u8,
    pub pad0: u8,
    pub pad1: u16,
}

/// Payload of every Destroy*View command.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdDxDestroyView {
    pub view_id: u32,
}

/// Followed by `u32` render target view IDs.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdDxSetRenderTargets {
    pub depth_stencil_view_id: u32,
}

/// Followed by `u32` shader resource view IDs.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdDxSetShaderResources {
    pub start_view: u32,
    pub shader_type: u32,
}

/// Followed by `u32` UA view IDs.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdDxSetCsUaViews {
    pub start_index: u32,
}

// =============================================================================
// Data stored in guest memory objects
// =============================================================================

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct SignatureHeader {
    pub header_version: u32,
    pub num_input_signatures: u32,
    pub num_output_signatures: u32,
    pub num_patch_constant_signatures: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct SignatureEntry {
    pub register_index: u32,
    pub semantic_name: u32,
    pub mask: u32,
    pub component_type: u32,
    pub min_precision: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct StreamOutputDeclarationEntry {
    pub output_slot: u32,
    pub register_index: u32,
    pub register_mask: u8,
    pub pad0: u8,
    pub pad1: u16,
    pub stream: u32,
}

// =============================================================================
// Private allocation descriptor (user mode <-> kernel mode)
// =============================================================================

/// What a kernel allocation is used for; also the `driver_id` of patches.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocationKind {
    Surface = 1,
    Shaders = 2,
    ContextObjects = 3,
}

impl AllocationKind {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(AllocationKind::Surface),
            2 => Some(AllocationKind::Shaders),
            3 => Some(AllocationKind::ContextObjects),
            _ => None,
        }
    }
}

/// Private data attached to every allocation. `OpenResource` requires the
/// blob to be exactly this size.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct AllocationDesc {
    pub kind: u32,
    pub size: u32,
    pub surface_flags: u64,
    pub format: u32,
    pub num_mip_levels: u32,
    pub array_size: u32,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub multisample_count: u32,
    pub buffer_byte_stride: u32,
    pub usage: u32,
    pub bind_flags: u32,
    pub cpu_access_flags: u32,
    pub misc_flags: u32,
    pub primary: u32,
    pub vidpn_source_id: u32,
}

impl AllocationDesc {
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    /// Restore a descriptor from an allocation's private data.
    pub fn from_private_data(data: &[u8]) -> Option<Self> {
        if data.len() != std::mem::size_of::<AllocationDesc>() {
            return None;
        }
        Some(bytemuck::pod_read_unaligned(data))
    }
}

// Compile-time layout checks
const _: () = assert!(std::mem::size_of::<CmdHeader>() == SVGA3D_CMD_HEADER_SIZE);
const _: () = assert!(std::mem::size_of::<SvgaBox>() == 24);
const _: () = assert!(std::mem::size_of::<SvgaCopyBox>() == 36);
const _: () = assert!(std::mem::size_of::<CmdDxMobFence64>() == 16);
const _: () = assert!(std::mem::size_of::<CmdDxTransferFromBuffer>() == 48);
const _: () = assert!(std::mem::size_of::<CmdDxDefineView>() == 32);
const _: () = assert!(std::mem::size_of::<CmdDxDefineDepthStencilViewV2>() == 32);
const _: () = assert!(std::mem::size_of::<CmdDxDefineStreamOutputWithMob>() == 32);
const _: () = assert!(std::mem::size_of::<StreamOutputDeclarationEntry>() == 16);
const _: () = assert!(std::mem::size_of::<SignatureHeader>() == 16);
const _: () = assert!(std::mem::size_of::<SignatureEntry>() == 20);
const _: () = assert!(std::mem::size_of::<AllocationDesc>() == 72);

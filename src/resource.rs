//! Resource Module
//!
//! Resource descriptors, the D3D to SVGA3D surface flag mapping and the
//! per-resource bookkeeping the device keeps.

use bitflags::bitflags;

use crate::error::{DxError, DxResult};
use crate::format::SurfaceFormat;
use crate::geometry::{Extent, SurfaceLayout};
use crate::handle_table::Handle;
use crate::kernel::{AllocationHandle, LockedRegion};
use crate::protocol::{AllocationDesc, AllocationKind, ResourceDimension};
use crate::view::{View, ViewKind};

/// Slices in a texture array (D3D11_REQ_TEXTURE2D_ARRAY_AXIS_DIMENSION).
pub const MAX_ARRAY_SIZE: u32 = 2048;

pub type ResourceId = Handle<Resource>;

/// D3D11_USAGE
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Usage {
    #[default]
    Default = 0,
    Immutable = 1,
    Dynamic = 2,
    Staging = 3,
}

impl Usage {
    /// Whether the CPU writes the allocation directly instead of going
    /// through a staging buffer.
    pub fn is_cpu_visible(self) -> bool {
        matches!(self, Usage::Dynamic | Usage::Staging)
    }
}

bitflags! {
    /// D3D10_DDI_RESOURCE_BIND_FLAG
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BindFlags: u32 {
        const VERTEX_BUFFER = 0x1;
        const INDEX_BUFFER = 0x2;
        const CONSTANT_BUFFER = 0x4;
        const SHADER_RESOURCE = 0x8;
        const STREAM_OUTPUT = 0x10;
        const RENDER_TARGET = 0x20;
        const DEPTH_STENCIL = 0x40;
        const UNORDERED_ACCESS = 0x80;
        const PRESENT = 0x4000;
    }
}

bitflags! {
    /// D3D10_DDI_CPU_ACCESS
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CpuAccessFlags: u32 {
        const WRITE = 0x10000;
        const READ = 0x20000;
    }
}

bitflags! {
    /// D3D10_DDI_RESOURCE_MISC_FLAG
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MiscFlags: u32 {
        const GENERATE_MIPS = 0x1;
        const SHARED = 0x2;
        const TEXTURECUBE = 0x4;
        const DRAWINDIRECT_ARGS = 0x10;
        const BUFFER_ALLOW_RAW_VIEWS = 0x20;
        const BUFFER_STRUCTURED = 0x40;
        const RESOURCE_CLAMP = 0x80;
        const SHARED_KEYEDMUTEX = 0x100;
    }
}

bitflags! {
    /// SVGA3dSurfaceAllFlags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SurfaceFlags: u64 {
        const CUBEMAP = 1 << 0;
        const HINT_STATIC = 1 << 1;
        const HINT_DYNAMIC = 1 << 2;
        const HINT_INDEXBUFFER = 1 << 3;
        const HINT_VERTEXBUFFER = 1 << 4;
        const HINT_TEXTURE = 1 << 5;
        const HINT_RENDERTARGET = 1 << 6;
        const HINT_DEPTHSTENCIL = 1 << 7;
        const VOLUME = 1 << 15;
        const SCREENTARGET = 1 << 16;
        const SURFACE_1D = 1 << 18;
        const ARRAY = 1 << 19;
        const BIND_VERTEX_BUFFER = 1 << 20;
        const BIND_INDEX_BUFFER = 1 << 21;
        const BIND_CONSTANT_BUFFER = 1 << 22;
        const BIND_SHADER_RESOURCE = 1 << 23;
        const BIND_RENDER_TARGET = 1 << 24;
        const BIND_DEPTH_STENCIL = 1 << 25;
        const BIND_STREAM_OUTPUT = 1 << 26;
        const STAGING_UPLOAD = 1 << 27;
        const STAGING_DOWNLOAD = 1 << 28;
        const HINT_INDIRECT_UPDATE = 1 << 29;
        const BIND_UAVIEW = 1 << 33;
        const BIND_RAW_VIEWS = 1 << 36;
        const BUFFER_STRUCTURED = 1 << 37;
        const DRAWINDIRECT_ARGS = 1 << 38;
        const RESOURCE_CLAMP = 1 << 39;
    }
}

/// Describes a resource to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDesc {
    pub dimension: ResourceDimension,
    pub usage: Usage,
    pub bind_flags: BindFlags,
    pub cpu_access: CpuAccessFlags,
    pub misc_flags: MiscFlags,
    pub format: SurfaceFormat,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub mip_levels: u32,
    /// Number of array slices; six per cube for cube maps.
    pub array_size: u32,
    pub sample_count: u32,
    pub byte_stride: u32,
    /// VidPN source of a primary (scan-out) surface.
    pub primary: Option<u32>,
}

impl ResourceDesc {
    pub fn buffer(size: u32, usage: Usage, bind_flags: BindFlags) -> Self {
        Self {
            dimension: ResourceDimension::Buffer,
            usage,
            bind_flags,
            cpu_access: default_cpu_access(usage),
            misc_flags: MiscFlags::empty(),
            format: SurfaceFormat::Buffer,
            width: size,
            height: 1,
            depth: 1,
            mip_levels: 1,
            array_size: 1,
            sample_count: 1,
            byte_stride: 0,
            primary: None,
        }
    }

    pub fn texture_2d(
        format: SurfaceFormat,
        width: u32,
        height: u32,
        usage: Usage,
        bind_flags: BindFlags,
    ) -> Self {
        Self {
            dimension: ResourceDimension::Texture2D,
            usage,
            bind_flags,
            cpu_access: default_cpu_access(usage),
            misc_flags: MiscFlags::empty(),
            format,
            width,
            height,
            depth: 1,
            mip_levels: 1,
            array_size: 1,
            sample_count: 1,
            byte_stride: 0,
            primary: None,
        }
    }

    pub fn with_mips(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels;
        self
    }

    pub fn with_array_size(mut self, array_size: u32) -> Self {
        self.array_size = array_size;
        self
    }

    pub fn layout(&self) -> SurfaceLayout {
        SurfaceLayout {
            format: self.format,
            base: Extent::new(self.width, self.height, self.depth),
            mip_levels: self.mip_levels,
            array_size: self.array_size,
        }
    }

    pub fn validate(&self) -> DxResult<()> {
        if self.width == 0 || self.height == 0 || self.depth == 0 {
            return Err(DxError::invalid(format!(
                "zero-sized resource {}x{}x{}",
                self.width, self.height, self.depth
            )));
        }
        if self.mip_levels == 0 || self.array_size == 0 {
            return Err(DxError::invalid("resource needs at least one mip and slice"));
        }
        let full_chain = 32 - self.width.max(self.height).max(self.depth).leading_zeros();
        if self.mip_levels > full_chain {
            return Err(DxError::invalid(format!(
                "{} mips for a {}x{}x{} resource (max {full_chain})",
                self.mip_levels, self.width, self.height, self.depth
            )));
        }
        if self.array_size > MAX_ARRAY_SIZE {
            return Err(DxError::invalid(format!(
                "array size {} (max {MAX_ARRAY_SIZE})",
                self.array_size
            )));
        }
        match self.dimension {
            ResourceDimension::Buffer => {
                if self.format != SurfaceFormat::Buffer {
                    return Err(DxError::invalid("buffers use the BUFFER format"));
                }
                if self.height != 1 || self.depth != 1 || self.mip_levels != 1 || self.array_size != 1 {
                    return Err(DxError::invalid("buffers are one-dimensional"));
                }
            }
            ResourceDimension::Texture1D if self.height != 1 || self.depth != 1 => {
                return Err(DxError::invalid("1D textures have height and depth 1"));
            }
            ResourceDimension::Texture2D if self.depth != 1 => {
                return Err(DxError::invalid("2D textures have depth 1"));
            }
            ResourceDimension::Texture3D if self.array_size != 1 => {
                return Err(DxError::invalid("3D textures cannot be arrays"));
            }
            ResourceDimension::TextureCube if self.array_size % 6 != 0 || self.depth != 1 => {
                return Err(DxError::invalid("cube maps hold six faces per cube"));
            }
            ResourceDimension::BufferEx => {
                return Err(DxError::invalid("BUFFEREX is a view dimension"));
            }
            _ => {}
        }
        if self.dimension != ResourceDimension::Buffer && self.format == SurfaceFormat::Buffer {
            return Err(DxError::invalid("textures need a texel format"));
        }
        Ok(())
    }

    /// Private descriptor for the kernel allocation of `size` bytes.
    pub fn allocation_desc(&self, size: u32) -> AllocationDesc {
        AllocationDesc {
            kind: AllocationKind::Surface as u32,
            size,
            surface_flags: calc_surface_flags(self).bits(),
            format: self.format as u32,
            num_mip_levels: self.mip_levels,
            array_size: self.array_size,
            width: self.width,
            height: self.height,
            depth: self.depth,
            multisample_count: self.sample_count,
            buffer_byte_stride: self.byte_stride,
            usage: self.usage as u32,
            bind_flags: self.bind_flags.bits(),
            cpu_access_flags: self.cpu_access.bits(),
            misc_flags: self.misc_flags.bits(),
            primary: self.primary.is_some() as u32,
            vidpn_source_id: self.primary.unwrap_or(0),
        }
    }

    /// Rebuild a descriptor from the private data of an opened allocation.
    pub fn from_allocation_desc(desc: &AllocationDesc) -> DxResult<Self> {
        let flags = SurfaceFlags::from_bits_truncate(desc.surface_flags);
        let format = SurfaceFormat::from_raw(desc.format)
            .ok_or_else(|| DxError::invalid(format!("unknown surface format {}", desc.format)))?;

        let dimension = if flags.contains(SurfaceFlags::CUBEMAP) {
            ResourceDimension::TextureCube
        } else if flags.contains(SurfaceFlags::VOLUME) {
            ResourceDimension::Texture3D
        } else if flags.contains(SurfaceFlags::SURFACE_1D) {
            ResourceDimension::Texture1D
        } else if format == SurfaceFormat::Buffer {
            ResourceDimension::Buffer
        } else {
            ResourceDimension::Texture2D
        };

        let usage = if flags.intersects(SurfaceFlags::STAGING_UPLOAD | SurfaceFlags::STAGING_DOWNLOAD) {
            Usage::Staging
        } else if flags.contains(SurfaceFlags::HINT_DYNAMIC) {
            Usage::Dynamic
        } else if flags.contains(SurfaceFlags::HINT_STATIC) {
            Usage::Immutable
        } else {
            Usage::Default
        };

        Ok(Self {
            dimension,
            usage,
            bind_flags: BindFlags::from_bits_truncate(desc.bind_flags),
            cpu_access: CpuAccessFlags::from_bits_truncate(desc.cpu_access_flags),
            misc_flags: MiscFlags::from_bits_truncate(desc.misc_flags) | MiscFlags::SHARED,
            format,
            width: desc.width,
            height: desc.height,
            depth: desc.depth,
            mip_levels: desc.num_mip_levels,
            array_size: desc.array_size,
            sample_count: desc.multisample_count,
            byte_stride: desc.buffer_byte_stride,
            primary: (desc.primary != 0).then_some(desc.vidpn_source_id),
        })
    }
}

fn default_cpu_access(usage: Usage) -> CpuAccessFlags {
    match usage {
        Usage::Dynamic => CpuAccessFlags::WRITE,
        Usage::Staging => CpuAccessFlags::READ | CpuAccessFlags::WRITE,
        Usage::Default | Usage::Immutable => CpuAccessFlags::empty(),
    }
}

/// Translate D3D usage, dimension, bind and misc flags into SVGA3D surface
/// flags.
pub fn calc_surface_flags(desc: &ResourceDesc) -> SurfaceFlags {
    let mut flags = match desc.usage {
        Usage::Default => SurfaceFlags::HINT_INDIRECT_UPDATE,
        Usage::Immutable => SurfaceFlags::HINT_STATIC,
        Usage::Dynamic => SurfaceFlags::HINT_DYNAMIC,
        Usage::Staging => SurfaceFlags::STAGING_UPLOAD | SurfaceFlags::STAGING_DOWNLOAD,
    };

    match desc.dimension {
        ResourceDimension::Texture1D => {
            flags |= SurfaceFlags::SURFACE_1D | SurfaceFlags::HINT_TEXTURE;
        }
        ResourceDimension::Texture2D => flags |= SurfaceFlags::HINT_TEXTURE,
        ResourceDimension::Texture3D => flags |= SurfaceFlags::VOLUME,
        ResourceDimension::TextureCube => flags |= SurfaceFlags::CUBEMAP,
        ResourceDimension::Buffer | ResourceDimension::BufferEx => {}
    }
    if desc.array_size > 1 && desc.dimension != ResourceDimension::TextureCube {
        flags |= SurfaceFlags::ARRAY;
    }

    let bind = desc.bind_flags;
    let pairs = [
        (
            BindFlags::VERTEX_BUFFER,
            SurfaceFlags::BIND_VERTEX_BUFFER | SurfaceFlags::HINT_VERTEXBUFFER,
        ),
        (
            BindFlags::INDEX_BUFFER,
            SurfaceFlags::BIND_INDEX_BUFFER | SurfaceFlags::HINT_INDEXBUFFER,
        ),
        (BindFlags::CONSTANT_BUFFER, SurfaceFlags::BIND_CONSTANT_BUFFER),
        (BindFlags::SHADER_RESOURCE, SurfaceFlags::BIND_SHADER_RESOURCE),
        (
            BindFlags::RENDER_TARGET,
            SurfaceFlags::BIND_RENDER_TARGET | SurfaceFlags::HINT_RENDERTARGET,
        ),
        (
            BindFlags::DEPTH_STENCIL,
            SurfaceFlags::BIND_DEPTH_STENCIL | SurfaceFlags::HINT_DEPTHSTENCIL,
        ),
        (BindFlags::STREAM_OUTPUT, SurfaceFlags::BIND_STREAM_OUTPUT),
        (BindFlags::UNORDERED_ACCESS, SurfaceFlags::BIND_UAVIEW),
        (
            BindFlags::PRESENT,
            SurfaceFlags::SCREENTARGET | SurfaceFlags::BIND_RENDER_TARGET,
        ),
    ];
    for (bind_flag, surface_flags) in pairs {
        if bind.contains(bind_flag) {
            flags |= surface_flags;
        }
    }

    let misc = desc.misc_flags;
    if misc.contains(MiscFlags::BUFFER_ALLOW_RAW_VIEWS) {
        flags |= SurfaceFlags::BIND_RAW_VIEWS;
    }
    if misc.contains(MiscFlags::BUFFER_STRUCTURED) {
        flags |= SurfaceFlags::BUFFER_STRUCTURED;
    }
    if misc.contains(MiscFlags::DRAWINDIRECT_ARGS) {
        flags |= SurfaceFlags::DRAWINDIRECT_ARGS;
    }
    if misc.contains(MiscFlags::RESOURCE_CLAMP) {
        flags |= SurfaceFlags::RESOURCE_CLAMP;
    }
    flags
}

/// Initial contents of one subresource.
#[derive(Debug, Clone, Copy)]
pub struct SubresourceData<'a> {
    pub data: &'a [u8],
    pub row_pitch: u32,
    pub depth_pitch: u32,
}

/// Kernel allocation owned by a resource, or by the staging and deferred
/// queues once the resource is gone.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct KmResource {
    pub handle: AllocationHandle,
    pub size: u32,
    pub primary: bool,
    pub shared: bool,
}

/// D3D11_MAP
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MapType {
    Read = 1,
    Write = 2,
    ReadWrite = 3,
    WriteDiscard = 4,
    WriteNoOverwrite = 5,
}

impl MapType {
    pub fn reads(self) -> bool {
        matches!(self, MapType::Read | MapType::ReadWrite)
    }

    pub fn writes(self) -> bool {
        !matches!(self, MapType::Read)
    }
}

bitflags! {
    /// D3D11_MAP_FLAG
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MapFlags: u32 {
        const DO_NOT_WAIT = 0x100000;
    }
}

/// Pitches and size of a mapped subresource. The bytes are reached through
/// [`crate::Device::mapped_data`] and [`crate::Device::mapped_data_mut`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedSubresource {
    pub row_pitch: u32,
    pub depth_pitch: u32,
    pub size: usize,
}

#[derive(Debug)]
pub(crate) struct Mapping {
    pub subresource: u32,
    pub map_type: MapType,
    pub offset: usize,
    pub len: usize,
    pub region: LockedRegion,
}

/// A live resource.
#[derive(Debug)]
pub struct Resource {
    pub(crate) desc: ResourceDesc,
    pub(crate) layout: SurfaceLayout,
    pub(crate) km: KmResource,
    pub(crate) views: [Vec<Handle<View>>; 4],
    pub(crate) mapping: Option<Mapping>,
}

impl Resource {
    pub(crate) fn new(desc: ResourceDesc, km: KmResource) -> Self {
        let layout = desc.layout();
        Self {
            desc,
            layout,
            km,
            views: Default::default(),
            mapping: None,
        }
    }

    pub fn desc(&self) -> &ResourceDesc {
        &self.desc
    }

    pub fn dimension(&self) -> ResourceDimension {
        self.desc.dimension
    }

    pub fn usage(&self) -> Usage {
        self.desc.usage
    }

    pub fn layout(&self) -> &SurfaceLayout {
        &self.layout
    }

    pub fn allocation(&self) -> AllocationHandle {
        self.km.handle
    }

    pub fn size(&self) -> u32 {
        self.km.size
    }

    pub fn is_shared(&self) -> bool {
        self.km.shared
    }

    pub fn is_primary(&self) -> bool {
        self.km.primary
    }

    pub fn is_mapped(&self) -> bool {
        self.mapping.is_some()
    }

    pub fn views(&self, kind: ViewKind) -> &[Handle<View>] {
        &self.views[kind as usize]
    }

    pub fn has_views(&self) -> bool {
        self.views.iter().any(|list| !list.is_empty())
    }

    pub fn surface_flags(&self) -> SurfaceFlags {
        calc_surface_flags(&self.desc)
    }

    pub(crate) fn check_subresource(&self, subresource: u32) -> DxResult<()> {
        if subresource >= self.layout.subresource_count() {
            return Err(DxError::invalid(format!(
                "subresource {subresource} out of range ({} subresources)",
                self.layout.subresource_count()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_flags() {
        let flags = |usage| calc_surface_flags(&ResourceDesc::buffer(64, usage, BindFlags::empty()));
        assert_eq!(flags(Usage::Default), SurfaceFlags::HINT_INDIRECT_UPDATE);
        assert_eq!(flags(Usage::Immutable), SurfaceFlags::HINT_STATIC);
        assert_eq!(flags(Usage::Dynamic), SurfaceFlags::HINT_DYNAMIC);
        assert_eq!(
            flags(Usage::Staging),
            SurfaceFlags::STAGING_UPLOAD | SurfaceFlags::STAGING_DOWNLOAD
        );
    }

    #[test]
    fn test_texture_and_bind_flags() {
        let desc = ResourceDesc::texture_2d(
            SurfaceFormat::B8G8R8A8Unorm,
            640,
            480,
            Usage::Default,
            BindFlags::RENDER_TARGET | BindFlags::SHADER_RESOURCE | BindFlags::PRESENT,
        );
        let flags = calc_surface_flags(&desc);
        assert!(flags.contains(SurfaceFlags::HINT_TEXTURE));
        assert!(flags.contains(SurfaceFlags::SCREENTARGET));
        assert!(flags.contains(SurfaceFlags::BIND_RENDER_TARGET | SurfaceFlags::HINT_RENDERTARGET));
        assert!(flags.contains(SurfaceFlags::BIND_SHADER_RESOURCE));
        assert!(!flags.contains(SurfaceFlags::ARRAY));
    }

    #[test]
    fn test_dimension_flags() {
        let mut desc = ResourceDesc::texture_2d(
            SurfaceFormat::R8G8B8A8Unorm,
            16,
            1,
            Usage::Default,
            BindFlags::SHADER_RESOURCE,
        );
        desc.dimension = ResourceDimension::Texture1D;
        assert!(calc_surface_flags(&desc).contains(SurfaceFlags::SURFACE_1D | SurfaceFlags::HINT_TEXTURE));

        desc.dimension = ResourceDimension::TextureCube;
        desc.height = 16;
        desc.array_size = 6;
        let flags = calc_surface_flags(&desc);
        assert!(flags.contains(SurfaceFlags::CUBEMAP));
        assert!(!flags.contains(SurfaceFlags::ARRAY));

        desc.dimension = ResourceDimension::Texture3D;
        desc.array_size = 1;
        desc.depth = 4;
        assert!(calc_surface_flags(&desc).contains(SurfaceFlags::VOLUME));
    }

    #[test]
    fn test_validate_rejects_bad_shapes() {
        assert!(ResourceDesc::buffer(0, Usage::Default, BindFlags::empty())
            .validate()
            .is_err());
        let mut buffer = ResourceDesc::buffer(16, Usage::Default, BindFlags::empty());
        buffer.format = SurfaceFormat::R8Unorm;
        assert!(buffer.validate().is_err());

        let mut cube = ResourceDesc::texture_2d(
            SurfaceFormat::R8G8B8A8Unorm,
            8,
            8,
            Usage::Default,
            BindFlags::SHADER_RESOURCE,
        );
        cube.dimension = ResourceDimension::TextureCube;
        cube.array_size = 4;
        assert!(cube.validate().is_err());
        cube.array_size = 12;
        assert!(cube.validate().is_ok());
    }

    #[test]
    fn test_validate_bounds_mips_and_slices() {
        let texture = |w, h| {
            ResourceDesc::texture_2d(SurfaceFormat::R8G8B8A8Unorm, w, h, Usage::Default, BindFlags::SHADER_RESOURCE)
        };
        assert!(texture(1, 1).with_mips(1).validate().is_ok());
        assert!(matches!(
            texture(1, 1).with_mips(70000).validate(),
            Err(DxError::InvalidArgument(_))
        ));
        // 256x8 has a nine-level chain.
        assert!(texture(256, 8).with_mips(9).validate().is_ok());
        assert!(texture(256, 8).with_mips(10).validate().is_err());

        assert!(texture(4, 4).with_array_size(MAX_ARRAY_SIZE).validate().is_ok());
        assert!(matches!(
            texture(4, 4).with_array_size(MAX_ARRAY_SIZE + 1).validate(),
            Err(DxError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_allocation_desc_restores_resource() {
        let desc = ResourceDesc::texture_2d(
            SurfaceFormat::R8G8B8A8Unorm,
            32,
            32,
            Usage::Dynamic,
            BindFlags::SHADER_RESOURCE,
        )
        .with_mips(3)
        .with_array_size(2);
        let size = desc.layout().serialized_size() as u32;
        let private = desc.allocation_desc(size);
        assert_eq!(private.kind, AllocationKind::Surface as u32);

        let opened = ResourceDesc::from_allocation_desc(&private).unwrap();
        assert_eq!(opened.dimension, ResourceDimension::Texture2D);
        assert_eq!(opened.usage, Usage::Dynamic);
        assert_eq!(opened.mip_levels, 3);
        assert_eq!(opened.array_size, 2);
        assert!(opened.misc_flags.contains(MiscFlags::SHARED));
        assert_eq!(opened.layout(), desc.layout());
    }

    #[test]
    fn test_primary_round_trips_vidpn_source() {
        let mut desc = ResourceDesc::texture_2d(
            SurfaceFormat::B8G8R8A8Unorm,
            1024,
            768,
            Usage::Default,
            BindFlags::RENDER_TARGET | BindFlags::PRESENT,
        );
        desc.primary = Some(1);
        let private = desc.allocation_desc(1024 * 768 * 4);
        assert_eq!((private.primary, private.vidpn_source_id), (1, 1));
        let opened = ResourceDesc::from_allocation_desc(&private).unwrap();
        assert_eq!(opened.primary, Some(1));
    }

    #[test]
    fn test_map_type_directions() {
        assert!(MapType::Read.reads() && !MapType::Read.writes());
        assert!(MapType::ReadWrite.reads() && MapType::ReadWrite.writes());
        assert!(!MapType::WriteDiscard.reads() && MapType::WriteDiscard.writes());
    }
}

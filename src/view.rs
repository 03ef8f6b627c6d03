//! View Module
//!
//! Shader-resource, render-target, depth-stencil and unordered-access view
//! descriptors and their SVGA3D encoding.

use crate::error::{DxError, DxResult};
use crate::format::SurfaceFormat;
use crate::handle_table::Handle;
use crate::protocol::{
    ResourceDimension, SVGA3D_INVALID_ID, SVGA_3D_CMD_DX_DEFINE_DEPTHSTENCIL_VIEW_V2,
    SVGA_3D_CMD_DX_DEFINE_RENDERTARGET_VIEW, SVGA_3D_CMD_DX_DEFINE_SHADERRESOURCE_VIEW,
    SVGA_3D_CMD_DX_DEFINE_UA_VIEW, SVGA_3D_CMD_DX_DESTROY_DEPTHSTENCIL_VIEW,
    SVGA_3D_CMD_DX_DESTROY_RENDERTARGET_VIEW, SVGA_3D_CMD_DX_DESTROY_SHADERRESOURCE_VIEW,
    SVGA_3D_CMD_DX_DESTROY_UA_VIEW,
};
use crate::resource::ResourceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewKind {
    ShaderResource = 0,
    RenderTarget = 1,
    DepthStencil = 2,
    UnorderedAccess = 3,
}

impl ViewKind {
    pub const ALL: [ViewKind; 4] = [
        ViewKind::ShaderResource,
        ViewKind::RenderTarget,
        ViewKind::DepthStencil,
        ViewKind::UnorderedAccess,
    ];

    pub(crate) fn define_opcode(self) -> u32 {
        match self {
            ViewKind::ShaderResource => SVGA_3D_CMD_DX_DEFINE_SHADERRESOURCE_VIEW,
            ViewKind::RenderTarget => SVGA_3D_CMD_DX_DEFINE_RENDERTARGET_VIEW,
            ViewKind::DepthStencil => SVGA_3D_CMD_DX_DEFINE_DEPTHSTENCIL_VIEW_V2,
            ViewKind::UnorderedAccess => SVGA_3D_CMD_DX_DEFINE_UA_VIEW,
        }
    }

    pub(crate) fn destroy_opcode(self) -> u32 {
        match self {
            ViewKind::ShaderResource => SVGA_3D_CMD_DX_DESTROY_SHADERRESOURCE_VIEW,
            ViewKind::RenderTarget => SVGA_3D_CMD_DX_DESTROY_RENDERTARGET_VIEW,
            ViewKind::DepthStencil => SVGA_3D_CMD_DX_DESTROY_DEPTHSTENCIL_VIEW,
            ViewKind::UnorderedAccess => SVGA_3D_CMD_DX_DESTROY_UA_VIEW,
        }
    }
}

/// Identifies a view of any kind. Each kind has its own ID space on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ViewId {
    pub kind: ViewKind,
    pub(crate) handle: Handle<View>,
}

impl ViewId {
    /// Wire ID of the view.
    pub fn id(self) -> u32 {
        self.handle.id()
    }
}

/// Wire ID of an optional view.
pub(crate) fn view_wire_id(view: Option<ViewId>) -> u32 {
    view.map_or(SVGA3D_INVALID_ID, ViewId::id)
}

/// Mip and array range of a texture SRV.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureSrv {
    pub most_detailed_mip: u32,
    pub mip_levels: u32,
    pub first_array_slice: u32,
    pub array_size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderResourceViewDesc {
    Buffer { first_element: u32, num_elements: u32 },
    Texture1D(TextureSrv),
    Texture2D(TextureSrv),
    Texture3D { most_detailed_mip: u32, mip_levels: u32 },
    TextureCube(TextureSrv),
    BufferEx { first_element: u32, num_elements: u32, flags: u32 },
}

/// Mip slice and array range of a texture RTV or UAV.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureSlice {
    pub mip_slice: u32,
    pub first_array_slice: u32,
    pub array_size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderTargetViewDesc {
    Buffer { first_element: u32, num_elements: u32 },
    Texture1D(TextureSlice),
    Texture2D(TextureSlice),
    Texture3D { mip_slice: u32, first_w: u32, w_size: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthStencilViewDesc {
    /// Texture1D, Texture2D or TextureCube.
    pub dimension: ResourceDimension,
    pub slice: TextureSlice,
    /// D3D11_DSV_FLAG bits (read-only depth / stencil).
    pub flags: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnorderedAccessViewDesc {
    Buffer { first_element: u32, num_elements: u32, flags: u32 },
    Texture1D(TextureSlice),
    Texture2D(TextureSlice),
    Texture3D { mip_slice: u32, first_w: u32, w_size: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewDesc {
    ShaderResource(ShaderResourceViewDesc),
    RenderTarget(RenderTargetViewDesc),
    DepthStencil(DepthStencilViewDesc),
    UnorderedAccess(UnorderedAccessViewDesc),
}

impl ViewDesc {
    pub fn kind(&self) -> ViewKind {
        match self {
            ViewDesc::ShaderResource(_) => ViewKind::ShaderResource,
            ViewDesc::RenderTarget(_) => ViewKind::RenderTarget,
            ViewDesc::DepthStencil(_) => ViewKind::DepthStencil,
            ViewDesc::UnorderedAccess(_) => ViewKind::UnorderedAccess,
        }
    }

    /// SVGA3dResourceType of the view.
    pub fn dimension(&self) -> ResourceDimension {
        use ResourceDimension as D;
        match self {
            ViewDesc::ShaderResource(desc) => match desc {
                ShaderResourceViewDesc::Buffer { .. } => D::Buffer,
                ShaderResourceViewDesc::Texture1D(_) => D::Texture1D,
                ShaderResourceViewDesc::Texture2D(_) => D::Texture2D,
                ShaderResourceViewDesc::Texture3D { .. } => D::Texture3D,
                ShaderResourceViewDesc::TextureCube(_) => D::TextureCube,
                ShaderResourceViewDesc::BufferEx { .. } => D::BufferEx,
            },
            ViewDesc::RenderTarget(desc) => match desc {
                RenderTargetViewDesc::Buffer { .. } => D::Buffer,
                RenderTargetViewDesc::Texture1D(_) => D::Texture1D,
                RenderTargetViewDesc::Texture2D(_) => D::Texture2D,
                RenderTargetViewDesc::Texture3D { .. } => D::Texture3D,
            },
            ViewDesc::DepthStencil(desc) => desc.dimension,
            ViewDesc::UnorderedAccess(desc) => match desc {
                UnorderedAccessViewDesc::Buffer { .. } => D::Buffer,
                UnorderedAccessViewDesc::Texture1D(_) => D::Texture1D,
                UnorderedAccessViewDesc::Texture2D(_) => D::Texture2D,
                UnorderedAccessViewDesc::Texture3D { .. } => D::Texture3D,
            },
        }
    }

    /// Check that the view fits a resource of `resource` dimension.
    pub fn validate(&self, resource: ResourceDimension) -> DxResult<()> {
        use ResourceDimension as D;
        let view = self.dimension();
        if let ViewDesc::DepthStencil(_) = self {
            if !matches!(view, D::Texture1D | D::Texture2D | D::TextureCube) {
                return Err(DxError::invalid(format!(
                    "{view:?} is not a depth-stencil view dimension"
                )));
            }
        }
        let fits = match view {
            D::Buffer | D::BufferEx => resource == D::Buffer,
            D::Texture1D => resource == D::Texture1D,
            // Cube faces are addressed as a 2D array by RTVs, DSVs and UAVs.
            D::Texture2D | D::TextureCube => {
                matches!(resource, D::Texture2D | D::TextureCube)
            }
            D::Texture3D => resource == D::Texture3D,
        };
        if !fits {
            return Err(DxError::invalid(format!(
                "{:?} view of dimension {view:?} on a {resource:?} resource",
                self.kind()
            )));
        }
        Ok(())
    }

    /// The four descriptor words of SRV, RTV and UAV define commands.
    pub fn encode(&self) -> [u32; 4] {
        match *self {
            ViewDesc::ShaderResource(desc) => match desc {
                ShaderResourceViewDesc::Buffer {
                    first_element,
                    num_elements,
                } => [first_element, num_elements, 0, 0],
                ShaderResourceViewDesc::Texture1D(t)
                | ShaderResourceViewDesc::Texture2D(t)
                | ShaderResourceViewDesc::TextureCube(t) => [
                    t.most_detailed_mip,
                    t.first_array_slice,
                    t.mip_levels,
                    t.array_size,
                ],
                ShaderResourceViewDesc::Texture3D {
                    most_detailed_mip,
                    mip_levels,
                } => [most_detailed_mip, 0, mip_levels, 1],
                ShaderResourceViewDesc::BufferEx {
                    first_element,
                    num_elements,
                    flags,
                } => [first_element, num_elements, flags, 0],
            },
            ViewDesc::RenderTarget(desc) => match desc {
                RenderTargetViewDesc::Buffer {
                    first_element,
                    num_elements,
                } => [first_element, num_elements, 0, 0],
                RenderTargetViewDesc::Texture1D(t) | RenderTargetViewDesc::Texture2D(t) => {
                    [t.mip_slice, t.first_array_slice, t.array_size, 0]
                }
                RenderTargetViewDesc::Texture3D {
                    mip_slice,
                    first_w,
                    w_size,
                } => [mip_slice, first_w, w_size, 0],
            },
            ViewDesc::DepthStencil(desc) => [
                desc.slice.mip_slice,
                desc.slice.first_array_slice,
                desc.slice.array_size,
                desc.flags as u32,
            ],
            ViewDesc::UnorderedAccess(desc) => match desc {
                UnorderedAccessViewDesc::Buffer {
                    first_element,
                    num_elements,
                    flags,
                } => [first_element, num_elements, flags, 0],
                UnorderedAccessViewDesc::Texture1D(t) | UnorderedAccessViewDesc::Texture2D(t) => {
                    [t.mip_slice, t.first_array_slice, t.array_size, 0]
                }
                UnorderedAccessViewDesc::Texture3D {
                    mip_slice,
                    first_w,
                    w_size,
                } => [mip_slice, first_w, w_size, 0],
            },
        }
    }
}

/// Everything needed to define a view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewCreateDesc {
    pub resource: ResourceId,
    pub format: SurfaceFormat,
    pub desc: ViewDesc,
}

/// A live view. It names its resource by ID only.
#[derive(Debug)]
pub struct View {
    pub(crate) resource: ResourceId,
    pub(crate) format: SurfaceFormat,
    pub(crate) desc: ViewDesc,
    /// Whether the host currently knows the view.
    pub(crate) defined: bool,
}

impl View {
    pub fn resource(&self) -> ResourceId {
        self.resource
    }

    pub fn format(&self) -> SurfaceFormat {
        self.format
    }

    pub fn desc(&self) -> &ViewDesc {
        &self.desc
    }

    pub fn kind(&self) -> ViewKind {
        self.desc.kind()
    }

    pub fn is_defined(&self) -> bool {
        self.defined
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slice(mip_slice: u32) -> TextureSlice {
        TextureSlice {
            mip_slice,
            first_array_slice: 0,
            array_size: 1,
        }
    }

    #[test]
    fn test_srv_texture_encoding_order() {
        let desc = ViewDesc::ShaderResource(ShaderResourceViewDesc::Texture2D(TextureSrv {
            most_detailed_mip: 1,
            mip_levels: 3,
            first_array_slice: 2,
            array_size: 4,
        }));
        assert_eq!(desc.encode(), [1, 2, 3, 4]);
        assert_eq!(desc.dimension(), ResourceDimension::Texture2D);
    }

    #[test]
    fn test_buffer_views_only_fit_buffers() {
        let srv = ViewDesc::ShaderResource(ShaderResourceViewDesc::BufferEx {
            first_element: 0,
            num_elements: 16,
            flags: 1,
        });
        assert!(srv.validate(ResourceDimension::Buffer).is_ok());
        assert!(srv.validate(ResourceDimension::Texture2D).is_err());
        assert_eq!(srv.encode(), [0, 16, 1, 0]);
    }

    #[test]
    fn test_render_target_on_cube_uses_2d_array() {
        let rtv = ViewDesc::RenderTarget(RenderTargetViewDesc::Texture2D(TextureSlice {
            mip_slice: 0,
            first_array_slice: 5,
            array_size: 1,
        }));
        assert!(rtv.validate(ResourceDimension::TextureCube).is_ok());
        assert!(rtv.validate(ResourceDimension::Texture3D).is_err());
    }

    #[test]
    fn test_depth_stencil_dimension_is_checked() {
        let mut dsv = DepthStencilViewDesc {
            dimension: ResourceDimension::Texture3D,
            slice: slice(0),
            flags: 0,
        };
        assert!(ViewDesc::DepthStencil(dsv)
            .validate(ResourceDimension::Texture3D)
            .is_err());
        dsv.dimension = ResourceDimension::Texture2D;
        dsv.flags = 2;
        let desc = ViewDesc::DepthStencil(dsv);
        assert!(desc.validate(ResourceDimension::Texture2D).is_ok());
        assert_eq!(desc.encode(), [0, 0, 1, 2]);
    }

    #[test]
    fn test_kind_opcodes_are_paired() {
        for kind in ViewKind::ALL {
            assert_ne!(kind.define_opcode(), kind.destroy_opcode());
        }
        assert_eq!(view_wire_id(None), SVGA3D_INVALID_ID);
    }
}

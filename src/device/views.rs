//! View lifecycle and the pipeline bindings the device tracks.

use tracing::debug;

use crate::error::{DxError, DxResult};
use crate::kernel::KernelCallbacks;
use crate::protocol::{
    ShaderType, SVGA3D_DX11_1_MAX_UAVIEWS, SVGA3D_DX_MAX_SRVIEWS, SVGA3D_INVALID_ID,
    SVGA3D_MAX_SIMULTANEOUS_RENDER_TARGETS,
};
use crate::resource::BindFlags;
use crate::shader::ShaderId;
use crate::view::{view_wire_id, View, ViewCreateDesc, ViewId, ViewKind};

use super::Device;

fn required_bind(kind: ViewKind) -> BindFlags {
    match kind {
        ViewKind::ShaderResource => BindFlags::SHADER_RESOURCE,
        ViewKind::RenderTarget => BindFlags::RENDER_TARGET,
        ViewKind::DepthStencil => BindFlags::DEPTH_STENCIL,
        ViewKind::UnorderedAccess => BindFlags::UNORDERED_ACCESS,
    }
}

fn wire_ids(views: &[Option<ViewId>]) -> Vec<u32> {
    views.iter().map(|&view| view_wire_id(view)).collect()
}

impl<K: KernelCallbacks> Device<K> {
    pub(crate) fn view_ref(&self, id: ViewId) -> DxResult<&View> {
        self.views[id.kind as usize]
            .get(id.handle)
            .ok_or_else(|| DxError::invalid(format!("unknown view {id:?}")))
    }

    pub(crate) fn view_mut(&mut self, id: ViewId) -> DxResult<&mut View> {
        self.views[id.kind as usize]
            .get_mut(id.handle)
            .ok_or_else(|| DxError::invalid(format!("unknown view {id:?}")))
    }

    fn check_view(&self, view: Option<ViewId>, kind: ViewKind) -> DxResult<()> {
        match view {
            None => Ok(()),
            Some(view) if view.kind != kind => Err(DxError::invalid(format!(
                "{:?} view {} bound where a {kind:?} view is expected",
                view.kind,
                view.id()
            ))),
            Some(view) => self.view_ref(view).map(|_| ()),
        }
    }

    /// Create a view and define it on the host.
    pub fn create_view(&mut self, desc: &ViewCreateDesc) -> DxResult<ViewId> {
        self.recorded(|device| {
            let kind = desc.desc.kind();
            let resource = device.resource_ref(desc.resource)?;
            desc.desc.validate(resource.dimension())?;
            if !resource.desc().bind_flags.contains(required_bind(kind)) {
                return Err(DxError::invalid(format!(
                    "{kind:?} view of {:?} which lacks {:?}",
                    desc.resource,
                    required_bind(kind)
                )));
            }
            let allocation = resource.km.handle;

            let view = View {
                resource: desc.resource,
                format: desc.format,
                desc: desc.desc,
                defined: false,
            };
            let handle = device.views[kind as usize]
                .insert(view)
                .ok_or_else(|| DxError::out_of_memory(format!("{kind:?} view table is full")))?;
            let id = ViewId { kind, handle };

            if let Err(e) = device.cmd_define_view(id.id(), allocation, desc.format, &desc.desc) {
                device.views[kind as usize].remove(handle);
                return Err(e);
            }
            device.view_mut(id)?.defined = true;
            device.resource_mut(desc.resource)?.views[kind as usize].push(handle);
            debug!("Defined {:?} view {} on {:?}", kind, id.id(), desc.resource);
            Ok(id)
        })
    }

    pub fn destroy_view(&mut self, id: ViewId) -> DxResult<()> {
        self.recorded(|device| device.destroy_view_inner(id))
    }

    pub(crate) fn destroy_view_inner(&mut self, id: ViewId) -> DxResult<()> {
        let view = self.view_ref(id)?;
        let (resource, defined) = (view.resource, view.defined);

        if let Some(resource) = self.resources.get_mut(resource) {
            resource.views[id.kind as usize].retain(|&handle| handle != id.handle);
        }
        self.pipeline.unbind_view(id);
        let destroyed = if defined {
            self.cmd_destroy_view(id.kind, id.id())
        } else {
            Ok(())
        };
        self.views[id.kind as usize].remove(id.handle);
        destroyed
    }

    /// Bind render targets and a depth-stencil view.
    pub fn set_render_targets(
        &mut self,
        render_targets: &[Option<ViewId>],
        depth_stencil: Option<ViewId>,
    ) -> DxResult<()> {
        self.recorded(|device| {
            if render_targets.len() > SVGA3D_MAX_SIMULTANEOUS_RENDER_TARGETS {
                return Err(DxError::invalid(format!(
                    "{} render targets (max {SVGA3D_MAX_SIMULTANEOUS_RENDER_TARGETS})",
                    render_targets.len()
                )));
            }
            for &view in render_targets {
                device.check_view(view, ViewKind::RenderTarget)?;
            }
            device.check_view(depth_stencil, ViewKind::DepthStencil)?;

            device.cmd_set_render_targets(view_wire_id(depth_stencil), &wire_ids(render_targets))?;

            let pipeline = &mut device.pipeline;
            pipeline.render_targets = [None; SVGA3D_MAX_SIMULTANEOUS_RENDER_TARGETS];
            pipeline.render_targets[..render_targets.len()].copy_from_slice(render_targets);
            pipeline.num_render_targets = render_targets.len();
            pipeline.depth_stencil = depth_stencil;
            Ok(())
        })
    }

    /// Bind shader resource views to slots `start..start + views.len()` of a
    /// stage.
    pub fn set_shader_resources(
        &mut self,
        stage: ShaderType,
        start: u32,
        views: &[Option<ViewId>],
    ) -> DxResult<()> {
        self.recorded(|device| {
            let start_slot = start as usize;
            if start_slot + views.len() > SVGA3D_DX_MAX_SRVIEWS {
                return Err(DxError::invalid(format!(
                    "shader resource slots {start}..{} past {SVGA3D_DX_MAX_SRVIEWS}",
                    start_slot + views.len()
                )));
            }
            for &view in views {
                device.check_view(view, ViewKind::ShaderResource)?;
            }
            if views.is_empty() {
                return Ok(());
            }

            device.cmd_set_shader_resources(stage, start, &wire_ids(views))?;
            device.pipeline.shader_resources[stage.stage_index()][start_slot..start_slot + views.len()]
                .copy_from_slice(views);
            Ok(())
        })
    }

    /// Bind compute-stage unordered access views.
    pub fn set_cs_unordered_access_views(
        &mut self,
        start: u32,
        views: &[Option<ViewId>],
    ) -> DxResult<()> {
        self.recorded(|device| {
            let start_slot = start as usize;
            if start_slot + views.len() > SVGA3D_DX11_1_MAX_UAVIEWS {
                return Err(DxError::invalid(format!(
                    "UA view slots {start}..{} past {SVGA3D_DX11_1_MAX_UAVIEWS}",
                    start_slot + views.len()
                )));
            }
            for &view in views {
                device.check_view(view, ViewKind::UnorderedAccess)?;
            }
            if views.is_empty() {
                return Ok(());
            }

            device.cmd_set_cs_ua_views(start, &wire_ids(views))?;
            device.pipeline.cs_uavs[start_slot..start_slot + views.len()].copy_from_slice(views);
            Ok(())
        })
    }

    /// Bind a shader to its stage, or unbind the stage with `None`.
    pub fn set_shader(&mut self, stage: ShaderType, shader: Option<ShaderId>) -> DxResult<()> {
        self.recorded(|device| {
            let wire = match shader {
                Some(id) => {
                    let ty = device.shader_ref(id)?.ty;
                    if ty != stage {
                        return Err(DxError::invalid(format!(
                            "{ty:?} shader {} bound to the {stage:?} stage",
                            id.id()
                        )));
                    }
                    id.id()
                }
                None => SVGA3D_INVALID_ID,
            };
            device.cmd_set_shader(stage, wire)?;
            device.pipeline.shaders[stage.stage_index()] = shader;
            Ok(())
        })
    }

    /// Emit every tracked view binding again.
    pub(crate) fn reapply_bindings(&mut self) -> DxResult<()> {
        for stage in ShaderType::ALL {
            let ids = wire_ids(self.pipeline.shader_resources(stage));
            self.cmd_set_shader_resources(stage, 0, &ids)?;
        }
        let uavs = wire_ids(self.pipeline.cs_unordered_access_views());
        self.cmd_set_cs_ua_views(0, &uavs)?;
        let render_targets = wire_ids(self.pipeline.render_targets());
        self.cmd_set_render_targets(view_wire_id(self.pipeline.depth_stencil()), &render_targets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceConfig, LoopbackConfig};
    use crate::format::SurfaceFormat;
    use crate::loopback::LoopbackKernel;
    use crate::resource::{ResourceDesc, ResourceId, Usage};
    use crate::view::{
        RenderTargetViewDesc, ShaderResourceViewDesc, TextureSlice, TextureSrv, ViewDesc,
    };

    fn device() -> Device<LoopbackKernel> {
        Device::new(LoopbackKernel::new(LoopbackConfig::default()), DeviceConfig::default()).unwrap()
    }

    fn texture(device: &mut Device<LoopbackKernel>, bind: BindFlags) -> ResourceId {
        let desc = ResourceDesc::texture_2d(SurfaceFormat::R8G8B8A8Unorm, 8, 8, Usage::Default, bind);
        device.create_resource(&desc, None).unwrap()
    }

    fn srv(resource: ResourceId) -> ViewCreateDesc {
        ViewCreateDesc {
            resource,
            format: SurfaceFormat::R8G8B8A8Unorm,
            desc: ViewDesc::ShaderResource(ShaderResourceViewDesc::Texture2D(TextureSrv {
                most_detailed_mip: 0,
                mip_levels: 1,
                first_array_slice: 0,
                array_size: 1,
            })),
        }
    }

    fn rtv(resource: ResourceId) -> ViewCreateDesc {
        ViewCreateDesc {
            resource,
            format: SurfaceFormat::R8G8B8A8Unorm,
            desc: ViewDesc::RenderTarget(RenderTargetViewDesc::Texture2D(TextureSlice {
                mip_slice: 0,
                first_array_slice: 0,
                array_size: 1,
            })),
        }
    }

    #[test]
    fn test_create_view_links_resource() {
        let mut device = device();
        let tex = texture(&mut device, BindFlags::SHADER_RESOURCE | BindFlags::RENDER_TARGET);
        let a = device.create_view(&srv(tex)).unwrap();
        let b = device.create_view(&rtv(tex)).unwrap();
        assert!(device.view(a).unwrap().is_defined());
        assert_eq!(device.resource(tex).unwrap().views(ViewKind::ShaderResource).len(), 1);
        assert_eq!(device.resource(tex).unwrap().views(ViewKind::RenderTarget).len(), 1);

        device.destroy_view(a).unwrap();
        assert!(device.view(a).is_none());
        assert!(device.resource(tex).unwrap().views(ViewKind::ShaderResource).is_empty());
        device.destroy_view(b).unwrap();
        device.destroy_resource(tex).unwrap();
    }

    #[test]
    fn test_view_needs_bind_flag() {
        let mut device = device();
        let tex = texture(&mut device, BindFlags::SHADER_RESOURCE);
        assert!(device.create_view(&rtv(tex)).is_err());
        assert!(device.views[ViewKind::RenderTarget as usize].is_empty());
        assert!(!device.resource(tex).unwrap().has_views());
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "contract violation"))]
    fn test_destroying_resource_with_views_is_a_contract_violation() {
        let mut device = device();
        let tex = texture(&mut device, BindFlags::SHADER_RESOURCE);
        device.create_view(&srv(tex)).unwrap();
        assert!(matches!(
            device.destroy_resource(tex),
            Err(DxError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_bindings_are_tracked_and_cleared() {
        let mut device = device();
        let tex = texture(&mut device, BindFlags::SHADER_RESOURCE | BindFlags::RENDER_TARGET);
        let view = device.create_view(&rtv(tex)).unwrap();
        let sr = device.create_view(&srv(tex)).unwrap();

        device.set_render_targets(&[None, Some(view)], None).unwrap();
        device.set_shader_resources(ShaderType::Pixel, 5, &[Some(sr)]).unwrap();
        assert_eq!(device.pipeline().render_targets(), &[None, Some(view)]);
        assert_eq!(device.pipeline().shader_resources(ShaderType::Pixel)[5], Some(sr));

        // Kinds are checked.
        assert!(device.set_render_targets(&[Some(sr)], None).is_err());
        assert!(device.set_shader_resources(ShaderType::Pixel, 127, &[Some(sr), None]).is_err());

        device.destroy_view(view).unwrap();
        assert_eq!(device.pipeline().render_targets(), &[None, None]);
        device.destroy_view(sr).unwrap();
        assert_eq!(device.pipeline().shader_resources(ShaderType::Pixel)[5], None);
    }

    #[test]
    fn test_reapply_emits_full_binding_set() {
        let mut device = device();
        let before = device.command_buffer().used();
        device.reapply_bindings().unwrap();
        let srv_commands = 6 * (8 + 8 + 4 * SVGA3D_DX_MAX_SRVIEWS);
        let uav_command = 8 + 4 + 4 * SVGA3D_DX11_1_MAX_UAVIEWS;
        let rt_command = 8 + 4;
        assert_eq!(
            device.command_buffer().used() - before,
            srv_commands + uav_command + rt_command
        );
    }
}

//! Device Scenario Tests
//!
//! End-to-end workloads through the public device API over the loopback
//! kernel: swap chain rotation, uploads read back through staging copies,
//! query polling, discard renames and device teardown.

use svga_dx_umd::loopback::RecordedCommand;
use svga_dx_umd::protocol::{
    SVGA_3D_CMD_DX_DEFINE_RENDERTARGET_VIEW, SVGA_3D_CMD_DX_DESTROY_RENDERTARGET_VIEW,
    SVGA_3D_CMD_DX_READBACK_QUERY, SVGA_3D_CMD_DX_SET_RENDERTARGETS,
};
use svga_dx_umd::view::{RenderTargetViewDesc, TextureSlice};
use svga_dx_umd::{
    BindFlags, Config, Device, DeviceConfig, DxError, GetDataFlags, LoopbackConfig,
    LoopbackKernel, MapFlags, MapType, OfferPriority, QueryMiscFlags, QueryResult, QueryType,
    ResourceDesc, ResourceId, ShaderSignatures, ShaderType, SurfaceFormat, SvgaBox, Usage,
    ViewCreateDesc, ViewDesc, ViewId,
};

fn device_with(kernel: LoopbackConfig) -> Device<LoopbackKernel> {
    Device::new(LoopbackKernel::new(kernel), DeviceConfig::default()).unwrap()
}

fn device() -> Device<LoopbackKernel> {
    device_with(LoopbackConfig::default())
}

fn rgba(w: u32, h: u32, usage: Usage, bind: BindFlags) -> ResourceDesc {
    ResourceDesc::texture_2d(SurfaceFormat::R8G8B8A8Unorm, w, h, usage, bind)
}

fn rtv(device: &mut Device<LoopbackKernel>, resource: ResourceId) -> ViewId {
    device
        .create_view(&ViewCreateDesc {
            resource,
            format: SurfaceFormat::R8G8B8A8Unorm,
            desc: ViewDesc::RenderTarget(RenderTargetViewDesc::Texture2D(TextureSlice {
                mip_slice: 0,
                first_array_slice: 0,
                array_size: 1,
            })),
        })
        .unwrap()
}

fn count(recorded: &[RecordedCommand], opcode: u32) -> usize {
    recorded.iter().filter(|c| c.opcode == opcode).count()
}

/// Copy `resource` into a fresh staging texture and return its bytes.
fn read_back(device: &mut Device<LoopbackKernel>, resource: ResourceId, w: u32, h: u32) -> Vec<u8> {
    let staging = device
        .create_resource(&rgba(w, h, Usage::Staging, BindFlags::empty()), None)
        .unwrap();
    device.resource_copy(staging, resource).unwrap();
    device.map(staging, 0, MapType::Read, MapFlags::empty()).unwrap();
    let bytes = device.mapped_data(staging).unwrap().to_vec();
    device.unmap(staging, 0).unwrap();
    device.destroy_resource(staging).unwrap();
    bytes
}

#[test]
fn test_swap_chain_rotation_keeps_bound_render_target() {
    let mut device = device();
    let bind = BindFlags::RENDER_TARGET | BindFlags::SHADER_RESOURCE;
    let buffers: Vec<ResourceId> = (0..3)
        .map(|_| device.create_resource(&rgba(16, 16, Usage::Default, bind), None).unwrap())
        .collect();
    let views: Vec<ViewId> = buffers.iter().map(|&b| rtv(&mut device, b)).collect();
    device.set_render_targets(&[Some(views[0])], None).unwrap();
    device.flush(false).unwrap();
    device.kernel_mut().take_recorded();

    let before: Vec<_> = buffers
        .iter()
        .map(|&b| device.resource(b).unwrap().allocation())
        .collect();
    device.rotate_resource_identities(&buffers).unwrap();
    let after: Vec<_> = buffers
        .iter()
        .map(|&b| device.resource(b).unwrap().allocation())
        .collect();
    assert_eq!(after, vec![before[1], before[2], before[0]]);

    // View IDs and the binding survive; the host sees them redefined.
    assert_eq!(device.pipeline().render_targets(), &[Some(views[0])]);
    assert!(views.iter().all(|&v| device.view(v).unwrap().is_defined()));
    device.flush(false).unwrap();
    let recorded = device.kernel_mut().take_recorded();
    assert_eq!(count(&recorded, SVGA_3D_CMD_DX_DESTROY_RENDERTARGET_VIEW), 3);
    assert_eq!(count(&recorded, SVGA_3D_CMD_DX_DEFINE_RENDERTARGET_VIEW), 3);
    assert_eq!(count(&recorded, SVGA_3D_CMD_DX_SET_RENDERTARGETS), 2);

    // A full cycle brings every buffer back to its first allocation.
    device.rotate_resource_identities(&buffers).unwrap();
    device.rotate_resource_identities(&buffers).unwrap();
    let cycled: Vec<_> = buffers
        .iter()
        .map(|&b| device.resource(b).unwrap().allocation())
        .collect();
    assert_eq!(cycled, before);
}

#[test]
fn test_rotation_rejects_duplicates_and_mapped_resources() {
    let mut device = device();
    let a = device
        .create_resource(&rgba(4, 4, Usage::Staging, BindFlags::empty()), None)
        .unwrap();
    let b = device
        .create_resource(&rgba(4, 4, Usage::Staging, BindFlags::empty()), None)
        .unwrap();
    assert!(matches!(
        device.rotate_resource_identities(&[a, a]),
        Err(DxError::InvalidArgument(_))
    ));
    device.map(a, 0, MapType::Write, MapFlags::empty()).unwrap();
    assert!(device.rotate_resource_identities(&[a, b]).is_err());
    device.unmap(a, 0).unwrap();
    device.rotate_resource_identities(&[a, b]).unwrap();
}

#[test]
fn test_partial_upload_reads_back_in_place() {
    let mut device = device();
    let texture = device
        .create_resource(&rgba(8, 8, Usage::Default, BindFlags::SHADER_RESOURCE), None)
        .unwrap();
    let full: Vec<u8> = vec![0x11; 8 * 8 * 4];
    device.update_subresource_up(texture, 0, None, &full, 32, 256).unwrap();

    // 2x2 texels at (4, 2), from a source with a padded row pitch.
    let mut patch = vec![0u8; 2 * 12];
    patch[..8].fill(0xAB);
    patch[12..20].fill(0xCD);
    let b = SvgaBox { x: 4, y: 2, z: 0, w: 2, h: 2, d: 1 };
    device.update_subresource_up(texture, 0, Some(b), &patch, 12, 24).unwrap();

    let bytes = read_back(&mut device, texture, 8, 8);
    let row = |y: usize| &bytes[y * 32..(y + 1) * 32];
    assert!(row(1).iter().all(|&v| v == 0x11));
    assert!(row(2)[..16].iter().all(|&v| v == 0x11));
    assert!(row(2)[16..24].iter().all(|&v| v == 0xAB));
    assert!(row(2)[24..].iter().all(|&v| v == 0x11));
    assert!(row(3)[16..24].iter().all(|&v| v == 0xCD));
    assert!(row(4).iter().all(|&v| v == 0x11));

    // Upload staging buffers are gone once the batch is submitted.
    assert_eq!(device.pending_staging(), 0);
}

#[test]
fn test_initial_data_survives_region_copy() {
    let mut device = device();
    let pixels: Vec<u8> = (0..64).collect();
    let initial = [svga_dx_umd::SubresourceData {
        data: &pixels,
        row_pitch: 16,
        depth_pitch: 64,
    }];
    let src = device
        .create_resource(&rgba(4, 4, Usage::Immutable, BindFlags::SHADER_RESOURCE), Some(&initial))
        .unwrap();
    let dst = device
        .create_resource(&rgba(8, 8, Usage::Default, BindFlags::SHADER_RESOURCE), None)
        .unwrap();
    let src_box = SvgaBox { x: 0, y: 0, z: 0, w: 4, h: 4, d: 1 };
    device.resource_copy_region(dst, 0, 4, 4, 0, src, 0, Some(src_box)).unwrap();

    let bytes = read_back(&mut device, dst, 8, 8);
    assert_eq!(&bytes[4 * 32 + 16..4 * 32 + 32], &pixels[..16]);
    assert_eq!(&bytes[7 * 32 + 16..7 * 32 + 32], &pixels[48..]);
    assert!(bytes[..4 * 32].iter().all(|&v| v == 0));
}

#[test]
fn test_query_results_are_stable_once_signaled() {
    let mut device = device();
    let query = device
        .create_query(QueryType::Occlusion, QueryMiscFlags::empty())
        .unwrap();
    device.begin_query(query).unwrap();
    device.end_query(query).unwrap();

    assert_eq!(
        device.query_get_data(query, GetDataFlags::DO_NOT_FLUSH),
        Err(DxError::StillDrawing)
    );
    let first = device.query_get_data(query, GetDataFlags::empty()).unwrap();
    assert!(matches!(first, QueryResult::Occlusion(n) if n != 0));
    let again = device
        .query_get_data(query, GetDataFlags::DO_NOT_FLUSH)
        .unwrap();
    assert_eq!(again, first);
    assert!(device.kernel().stats().histogram[&SVGA_3D_CMD_DX_READBACK_QUERY] >= 1);

    // Once the restart reaches the host the slot reads as pending again.
    device.begin_query(query).unwrap();
    device.end_query(query).unwrap();
    device.flush(false).unwrap();
    assert_eq!(
        device.query_get_data(query, GetDataFlags::DO_NOT_FLUSH),
        Err(DxError::StillDrawing)
    );
    assert!(device.query_get_data(query, GetDataFlags::empty()).is_ok());
    device.destroy_query(query).unwrap();
    assert_eq!(device.take_error(), None);
}

#[test]
fn test_disjoint_and_event_queries() {
    let mut device = device();
    let disjoint = device
        .create_query(QueryType::TimestampDisjoint, QueryMiscFlags::empty())
        .unwrap();
    let event = device
        .create_query(QueryType::Event, QueryMiscFlags::empty())
        .unwrap();
    device.begin_query(disjoint).unwrap();
    device.end_query(disjoint).unwrap();
    device.end_query(event).unwrap();

    assert_eq!(
        device.query_get_data(event, GetDataFlags::empty()).unwrap(),
        QueryResult::Event(true)
    );
    match device.query_get_data(disjoint, GetDataFlags::empty()).unwrap() {
        QueryResult::TimestampDisjoint { frequency, disjoint } => {
            assert_eq!(frequency, 1_000_000_000);
            assert!(!disjoint);
        }
        other => panic!("unexpected result {other:?}"),
    }
}

#[test]
fn test_discard_map_of_busy_buffer_renames() {
    let mut device = device_with(LoopbackConfig {
        busy_polls: 5,
        ..Default::default()
    });
    let buffer = device
        .create_resource(
            &ResourceDesc::buffer(1024, Usage::Dynamic, BindFlags::VERTEX_BUFFER),
            None,
        )
        .unwrap();
    device.map(buffer, 0, MapType::WriteDiscard, MapFlags::empty()).unwrap();
    device.mapped_data_mut(buffer).unwrap().fill(0x42);
    device.unmap(buffer, 0).unwrap();
    device.flush(false).unwrap();
    let first = device.resource(buffer).unwrap().allocation();

    // The host still holds the old contents; discard gets fresh memory
    // without waiting.
    device.map(buffer, 0, MapType::WriteDiscard, MapFlags::DO_NOT_WAIT).unwrap();
    let second = device.resource(buffer).unwrap().allocation();
    assert_ne!(first, second);
    assert_eq!(device.kernel().stats().renames, 1);
    assert_eq!(device.kernel().stats().busy_refusals, 0);
    device.unmap(buffer, 0).unwrap();

    // A no-overwrite map of the new allocation is still refused while busy.
    device.flush(false).unwrap();
    assert_eq!(
        device.map(buffer, 0, MapType::WriteNoOverwrite, MapFlags::DO_NOT_WAIT),
        Err(DxError::StillDrawing)
    );
    assert!(device.kernel().stats().busy_refusals >= 1);
}

fn fill_mapped(device: &mut Device<LoopbackKernel>, buffer: ResourceId, map_type: MapType, value: u8) {
    device.map(buffer, 0, map_type, MapFlags::empty()).unwrap();
    device.mapped_data_mut(buffer).unwrap().fill(value);
    device.unmap(buffer, 0).unwrap();
}

fn read_buffer(device: &mut Device<LoopbackKernel>, buffer: ResourceId) -> Vec<u8> {
    device.map(buffer, 0, MapType::Read, MapFlags::empty()).unwrap();
    let bytes = device.mapped_data(buffer).unwrap().to_vec();
    device.unmap(buffer, 0).unwrap();
    bytes
}

#[test]
fn test_write_maps_flush_pending_copies() {
    let mut device = device();
    let src = device
        .create_resource(&ResourceDesc::buffer(16, Usage::Dynamic, BindFlags::VERTEX_BUFFER), None)
        .unwrap();
    let staging = ResourceDesc::buffer(16, Usage::Staging, BindFlags::empty());
    let dst = device.create_resource(&staging, None).unwrap();
    let dst2 = device.create_resource(&staging, None).unwrap();

    // The copy is still in the batch when the source is mapped again.
    fill_mapped(&mut device, src, MapType::WriteDiscard, 1);
    device.resource_copy(dst, src).unwrap();
    fill_mapped(&mut device, src, MapType::WriteDiscard, 2);
    device.flush(false).unwrap();
    assert!(read_buffer(&mut device, dst).iter().all(|&b| b == 1));

    device.resource_copy(dst2, src).unwrap();
    fill_mapped(&mut device, src, MapType::WriteNoOverwrite, 3);
    device.flush(false).unwrap();
    assert!(read_buffer(&mut device, dst2).iter().all(|&b| b == 2));
    assert!(device.take_error().is_none());
}

#[test]
fn test_do_not_wait_map_flushes_pending_references() {
    let mut device = device();
    let src = device
        .create_resource(&ResourceDesc::buffer(16, Usage::Dynamic, BindFlags::VERTEX_BUFFER), None)
        .unwrap();
    let dst = device
        .create_resource(&ResourceDesc::buffer(16, Usage::Staging, BindFlags::empty()), None)
        .unwrap();
    fill_mapped(&mut device, src, MapType::WriteDiscard, 9);
    device.flush(false).unwrap();

    for map_type in [MapType::WriteDiscard, MapType::WriteNoOverwrite] {
        device.resource_copy(dst, src).unwrap();
        let submissions = device.kernel().stats().submissions;
        assert_eq!(
            device.map(src, 0, map_type, MapFlags::DO_NOT_WAIT),
            Err(DxError::StillDrawing)
        );
        assert_eq!(device.kernel().stats().submissions, submissions + 1);
        assert!(device.command_buffer().is_empty());
        assert!(!device.resource(src).unwrap().is_mapped());
        assert!(device.take_error().is_none());

        // Nothing references the buffer any more.
        device.map(src, 0, map_type, MapFlags::DO_NOT_WAIT).unwrap();
        device.unmap(src, 0).unwrap();
        device.flush(false).unwrap();
    }
    assert!(read_buffer(&mut device, dst).iter().all(|&b| b == 9));
}

#[test]
fn test_offered_resources_may_lose_contents() {
    let mut device = device();
    device.kernel_mut().set_discard_offered(true);
    let texture = device
        .create_resource(&rgba(4, 4, Usage::Default, BindFlags::SHADER_RESOURCE), None)
        .unwrap();
    device.update_subresource_up(texture, 0, None, &[7; 64], 16, 64).unwrap();
    device.flush(false).unwrap();

    device.offer_resources(&[texture], OfferPriority::Low).unwrap();
    assert!(device.kernel().is_offered(device.resource(texture).unwrap().allocation()));
    assert_eq!(device.reclaim_resources(&[texture]).unwrap(), vec![true]);
    assert!(read_back(&mut device, texture, 4, 4).iter().all(|&v| v == 0));

    // Reclaiming again is a kernel error and is kept as the device error.
    assert!(device.reclaim_resources(&[texture]).is_err());
    assert!(matches!(
        device.take_error(),
        Some(DxError::Fatal { call: "reclaim", .. })
    ));
}

#[test]
fn test_teardown_releases_every_allocation() {
    let mut device = device();
    let texture = device
        .create_resource(
            &rgba(32, 32, Usage::Default, BindFlags::RENDER_TARGET | BindFlags::SHADER_RESOURCE),
            None,
        )
        .unwrap();
    let view = rtv(&mut device, texture);
    device.set_render_targets(&[Some(view)], None).unwrap();
    let dynamic = device
        .create_resource(&ResourceDesc::buffer(256, Usage::Dynamic, BindFlags::CONSTANT_BUFFER), None)
        .unwrap();
    device.map(dynamic, 0, MapType::WriteDiscard, MapFlags::empty()).unwrap();

    let code = [0x4342_5844u32, 6, 1, 2, 3, 4];
    let shader = device
        .create_shader(ShaderType::Vertex, &code, &ShaderSignatures::default())
        .unwrap();
    device.set_shader(ShaderType::Vertex, Some(shader)).unwrap();
    let query = device
        .create_query(QueryType::Occlusion, QueryMiscFlags::empty())
        .unwrap();
    device.begin_query(query).unwrap();

    assert!(device.kernel().live_allocations() > 0);
    device.destroy().unwrap();
    assert_eq!(device.kernel().live_allocations(), 0);
    assert_eq!(device.kernel().live_contexts(), 0);
    assert!(device.create_resource(&rgba(4, 4, Usage::Default, BindFlags::empty()), None).is_err());
}

#[test]
fn test_soak_config_drives_loopback_limits() {
    let config = Config::from_toml(
        r#"
        [kernel]
        command_buffer_bytes = 1024

        [soak]
        iterations = 3
        "#,
    )
    .unwrap();
    assert_eq!(config.soak.iterations, 3);

    let mut device = Device::new(LoopbackKernel::new(config.kernel), config.device).unwrap();
    for _ in 0..64 {
        let id = device
            .create_resource(&rgba(8, 8, Usage::Default, BindFlags::SHADER_RESOURCE), None)
            .unwrap();
        device.update_subresource_up(id, 0, None, &[3; 256], 32, 256).unwrap();
        device.destroy_resource(id).unwrap();
    }
    device.flush(false).unwrap();
    // A small command buffer forces implicit submissions along the way.
    assert!(device.kernel().stats().submissions > 1);
    assert_eq!(device.pending_deferred(), 0);
}

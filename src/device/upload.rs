//! Data paths between the CPU and resources: UpdateSubresourceUP through a
//! staging buffer, Map/Unmap, and resource copies.

use tracing::{debug, trace};

use crate::error::{DxError, DxResult};
use crate::geometry::BoxLayout;
use crate::kernel::{KernelCallbacks, KernelError, LockFlags};
use crate::protocol::{SvgaBox, SvgaCopyBox};
use crate::resource::{
    BindFlags, CpuAccessFlags, KmResource, MapFlags, MapType, MappedSubresource, Mapping,
    ResourceDesc, ResourceId, Usage,
};

use super::Device;

/// Rows of caller memory laid out at the given pitches.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SourceRows<'a> {
    pub data: &'a [u8],
    pub row_pitch: usize,
    pub depth_pitch: usize,
}

impl SourceRows<'_> {
    /// Bytes the caller must supply for `region`.
    fn required_len(&self, region: &BoxLayout) -> usize {
        if region.rows == 0 || region.depth == 0 {
            return 0;
        }
        (region.depth as usize - 1) * self.depth_pitch
            + (region.rows as usize - 1) * self.row_pitch
            + region.row_bytes as usize
    }

    fn check(&self, region: &BoxLayout) -> DxResult<()> {
        if region.rows > 1 && self.row_pitch < region.row_bytes as usize {
            return Err(DxError::invalid(format!(
                "row pitch {} shorter than a {}-byte row",
                self.row_pitch, region.row_bytes
            )));
        }
        let needed = self.required_len(region);
        if self.data.len() < needed {
            return Err(DxError::invalid(format!(
                "{} bytes of source data, box needs {needed}",
                self.data.len()
            )));
        }
        Ok(())
    }
}

/// Copy `region` from `src` into `dst`, the box origin landing at `offset`
/// and rows stepping by the destination pitches.
pub(crate) fn copy_box(
    dst: &mut [u8],
    offset: usize,
    dst_pitch: (u32, u32),
    src: &SourceRows<'_>,
    region: &BoxLayout,
) -> DxResult<()> {
    let row = region.row_bytes as usize;
    let (dst_row, dst_depth) = (dst_pitch.0 as usize, dst_pitch.1 as usize);
    for z in 0..region.depth as usize {
        for y in 0..region.rows as usize {
            let from = z * src.depth_pitch + y * src.row_pitch;
            let to = offset + z * dst_depth + y * dst_row;
            let source = src
                .data
                .get(from..from + row)
                .ok_or_else(|| DxError::invalid("source data too short for box"))?;
            let target = dst
                .get_mut(to..to + row)
                .ok_or_else(|| DxError::invalid("box runs past the end of the allocation"))?;
            target.copy_from_slice(source);
        }
    }
    Ok(())
}

impl<K: KernelCallbacks> Device<K> {
    /// Write `data` into a box of a subresource (the whole subresource when
    /// `dst_box` is `None`).
    pub fn update_subresource_up(
        &mut self,
        id: ResourceId,
        subresource: u32,
        dst_box: Option<SvgaBox>,
        data: &[u8],
        row_pitch: u32,
        depth_pitch: u32,
    ) -> DxResult<()> {
        self.recorded(|device| {
            device.upload_subresource(id, subresource, dst_box, data, row_pitch, depth_pitch)
        })
    }

    pub(crate) fn upload_subresource(
        &mut self,
        id: ResourceId,
        subresource: u32,
        dst_box: Option<SvgaBox>,
        data: &[u8],
        row_pitch: u32,
        depth_pitch: u32,
    ) -> DxResult<()> {
        let resource = self.resource_ref(id)?;
        resource.check_subresource(subresource)?;
        if resource.is_mapped() {
            return Err(DxError::invalid(format!("resource {id:?} is mapped")));
        }
        let layout = *resource.layout();
        let cpu_visible = resource.usage().is_cpu_visible();
        let handle = resource.km.handle;

        let dst_box = dst_box.unwrap_or_else(|| layout.subresource_box(subresource));
        if !layout.contains_box(subresource, &dst_box) {
            return Err(DxError::invalid(format!(
                "box {dst_box:?} outside subresource {subresource} of {id:?}"
            )));
        }
        if dst_box.w == 0 || dst_box.h == 0 || dst_box.d == 0 {
            return Ok(());
        }

        let region = layout.box_layout(subresource, &dst_box);
        let dst_pitch = layout.subresource_pitch(subresource);
        let src = SourceRows {
            data,
            row_pitch: row_pitch as usize,
            depth_pitch: depth_pitch as usize,
        };
        src.check(&region)?;

        if cpu_visible {
            let origin = layout.subresource_offset(subresource) as usize + region.offset as usize;
            self.with_locked(handle, LockFlags::WRITE_ONLY, |bytes| {
                copy_box(bytes, origin, dst_pitch, &src, &region)
            })?;
            trace!("Wrote {:?} of {:?} sub {} directly", dst_box, id, subresource);
            let full = layout.subresource_box(subresource);
            return self.cmd_update_subresource(handle, subresource, full);
        }

        let staging_size = layout.subresource_size(subresource) as u32;
        let desc = ResourceDesc::buffer(staging_size, Usage::Staging, BindFlags::empty());
        let staging = self.allocate_with_retry(&desc.allocation_desc(staging_size))?;
        let km = KmResource {
            handle: staging,
            size: staging_size,
            primary: false,
            shared: false,
        };
        let copied = self.with_locked(staging, LockFlags::WRITE_ONLY, |bytes| {
            copy_box(bytes, region.offset as usize, dst_pitch, &src, &region)
        });
        self.staging.push_front(km);
        copied?;

        let whole = SvgaBox {
            w: staging_size,
            h: 1,
            d: 1,
            ..Default::default()
        };
        self.cmd_update_subresource(staging, 0, whole)?;
        self.cmd_transfer_from_buffer(
            staging,
            region.offset,
            dst_pitch.0,
            dst_pitch.1,
            handle,
            subresource,
            dst_box,
        )?;
        trace!(
            "Staged {:?} of {:?} sub {} through {} ({} bytes)",
            dst_box,
            id,
            subresource,
            staging,
            staging_size
        );
        Ok(())
    }

    /// Map a subresource of a Dynamic or Staging resource for CPU access.
    pub fn map(
        &mut self,
        id: ResourceId,
        subresource: u32,
        map_type: MapType,
        flags: MapFlags,
    ) -> DxResult<MappedSubresource> {
        self.recorded(|device| device.map_inner(id, subresource, map_type, flags))
    }

    fn map_inner(
        &mut self,
        id: ResourceId,
        subresource: u32,
        map_type: MapType,
        flags: MapFlags,
    ) -> DxResult<MappedSubresource> {
        let resource = self.resource_ref(id)?;
        resource.check_subresource(subresource)?;
        if resource.is_mapped() {
            return Err(DxError::invalid(format!("resource {id:?} is already mapped")));
        }
        let access = resource.desc().cpu_access;
        if (map_type.reads() && !access.contains(CpuAccessFlags::READ))
            || (map_type.writes() && !access.contains(CpuAccessFlags::WRITE))
        {
            return Err(DxError::invalid(format!(
                "{map_type:?} map of {id:?} without matching CPU access ({access:?})"
            )));
        }
        let layout = *resource.layout();
        let handle = resource.km.handle;
        let no_wait = flags.contains(MapFlags::DO_NOT_WAIT);

        // Commands still in the batch may read the allocation, discard or not.
        if self.commands.references(handle) {
            self.flush_inner(true)?;
            if no_wait {
                return Err(DxError::StillDrawing);
            }
        }
        if map_type.reads() {
            self.cmd_readback_subresource(handle, subresource)?;
            self.flush_inner(true)?;
        }

        let lock_flags = LockFlags::DONOT_WAIT
            | match map_type {
                MapType::Read => LockFlags::READ_ONLY,
                MapType::ReadWrite => LockFlags::empty(),
                MapType::Write => LockFlags::WRITE_ONLY,
                MapType::WriteDiscard => LockFlags::WRITE_ONLY | LockFlags::DISCARD,
                MapType::WriteNoOverwrite => LockFlags::WRITE_ONLY | LockFlags::NO_OVERWRITE,
            };
        let max_spins = self.config.max_map_spins;
        let mut spins = 0u32;
        let region = loop {
            match self.kernel.lock(handle, lock_flags) {
                Ok(region) => break region,
                Err(KernelError::WasStillDrawing)
                    if !no_wait && (max_spins == 0 || spins < max_spins) =>
                {
                    spins += 1;
                    std::thread::yield_now();
                }
                Err(e) => return Err(DxError::kernel("lock", e)),
            }
        };
        if spins > 0 {
            trace!("Map of {:?} waited {} polls", id, spins);
        }

        let offset = layout.subresource_offset(subresource) as usize;
        let len = layout.subresource_size(subresource) as usize;
        let (row_pitch, depth_pitch) = layout.subresource_pitch(subresource);
        let renamed = region.handle();

        let resource = self.resource_mut(id)?;
        if renamed != handle {
            debug!("Discard map renamed {:?}: {} -> {}", id, handle, renamed);
            resource.km.handle = renamed;
        }
        resource.mapping = Some(Mapping {
            subresource,
            map_type,
            offset,
            len,
            region,
        });
        Ok(MappedSubresource {
            row_pitch,
            depth_pitch,
            size: len,
        })
    }

    /// Bytes of the mapped subresource.
    pub fn mapped_data(&self, id: ResourceId) -> DxResult<&[u8]> {
        let mapping = self
            .resource_ref(id)?
            .mapping
            .as_ref()
            .ok_or_else(|| DxError::invalid(format!("resource {id:?} is not mapped")))?;
        mapping
            .region
            .as_slice()
            .get(mapping.offset..mapping.offset + mapping.len)
            .ok_or_else(|| DxError::invalid("mapped subresource outside the locked region"))
    }

    pub fn mapped_data_mut(&mut self, id: ResourceId) -> DxResult<&mut [u8]> {
        let mapping = self
            .resource_mut(id)?
            .mapping
            .as_mut()
            .ok_or_else(|| DxError::invalid(format!("resource {id:?} is not mapped")))?;
        let (offset, len) = (mapping.offset, mapping.len);
        if mapping.map_type == MapType::Read {
            return Err(DxError::invalid("subresource is mapped read-only"));
        }
        mapping
            .region
            .as_mut_slice()
            .get_mut(offset..offset + len)
            .ok_or_else(|| DxError::invalid("mapped subresource outside the locked region"))
    }

    /// Unmap a subresource. Written data is pushed to the host.
    pub fn unmap(&mut self, id: ResourceId, subresource: u32) -> DxResult<()> {
        self.recorded(|device| {
            let resource = device.resource_mut(id)?;
            match &resource.mapping {
                Some(mapping) if mapping.subresource == subresource => {}
                _ => {
                    return Err(DxError::invalid(format!(
                        "subresource {subresource} of {id:?} is not mapped"
                    )))
                }
            }
            let full = resource.layout.subresource_box(subresource);
            let Some(mapping) = resource.mapping.take() else {
                return Ok(());
            };
            let handle = mapping.region.handle();
            let map_type = mapping.map_type;
            drop(mapping);

            device
                .kernel
                .unlock(&[handle])
                .map_err(|e| DxError::kernel("unlock", e))?;
            if map_type.writes() {
                device.cmd_update_subresource(handle, subresource, full)?;
            }
            Ok(())
        })
    }

    /// Copy a whole resource into another of the same shape.
    pub fn resource_copy(&mut self, dst: ResourceId, src: ResourceId) -> DxResult<()> {
        self.recorded(|device| {
            let source = device.resource_ref(src)?;
            let (src_layout, src_handle) = (*source.layout(), source.km.handle);
            let target = device.resource_ref(dst)?;
            if dst == src {
                return Err(DxError::invalid("copy source and destination are the same resource"));
            }
            if target.layout().serialized_size() != src_layout.serialized_size()
                || target.layout().subresource_count() != src_layout.subresource_count()
            {
                return Err(DxError::invalid(format!(
                    "cannot copy {src:?} into {dst:?}: shapes differ"
                )));
            }
            let dst_handle = target.km.handle;
            device.cmd_pred_copy(dst_handle, src_handle)
        })
    }

    /// Copy a box of one subresource to a point in another.
    #[allow(clippy::too_many_arguments)]
    pub fn resource_copy_region(
        &mut self,
        dst: ResourceId,
        dst_subresource: u32,
        dst_x: u32,
        dst_y: u32,
        dst_z: u32,
        src: ResourceId,
        src_subresource: u32,
        src_box: Option<SvgaBox>,
    ) -> DxResult<()> {
        self.recorded(|device| {
            let source = device.resource_ref(src)?;
            source.check_subresource(src_subresource)?;
            let src_box = src_box.unwrap_or_else(|| source.layout().subresource_box(src_subresource));
            if !source.layout().contains_box(src_subresource, &src_box) {
                return Err(DxError::invalid(format!(
                    "source box {src_box:?} outside subresource {src_subresource} of {src:?}"
                )));
            }
            let src_handle = source.km.handle;

            let target = device.resource_ref(dst)?;
            target.check_subresource(dst_subresource)?;
            let dst_box = SvgaBox {
                x: dst_x,
                y: dst_y,
                z: dst_z,
                w: src_box.w,
                h: src_box.h,
                d: src_box.d,
            };
            if !target.layout().contains_box(dst_subresource, &dst_box) {
                return Err(DxError::invalid(format!(
                    "destination box {dst_box:?} outside subresource {dst_subresource} of {dst:?}"
                )));
            }
            let dst_handle = target.km.handle;

            let copy = SvgaCopyBox {
                x: dst_x,
                y: dst_y,
                z: dst_z,
                w: src_box.w,
                h: src_box.h,
                d: src_box.d,
                srcx: src_box.x,
                srcy: src_box.y,
                srcz: src_box.z,
            };
            device.cmd_pred_copy_region(dst_handle, dst_subresource, src_handle, src_subresource, copy)
        })
    }
}

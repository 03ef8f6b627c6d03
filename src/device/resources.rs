//! Resource lifecycle: create, open, destroy, identity rotation and
//! offer/reclaim.

use tracing::{debug, trace};

use crate::error::{DxError, DxResult};
use crate::kernel::{AllocationHandle, KernelCallbacks, LockFlags, OfferPriority};
use crate::protocol::{AllocationDesc, SVGA3D_INVALID_ID, SVGA3D_MAX_SIMULTANEOUS_RENDER_TARGETS};
use crate::resource::{KmResource, MiscFlags, Resource, ResourceDesc, ResourceId, SubresourceData};
use crate::view::{ViewId, ViewKind};

use super::Device;

/// An allocation handed to [`Device::open_resource`] together with the
/// private data it was created with.
#[derive(Debug, Clone, Copy)]
pub struct OpenAllocation<'a> {
    pub handle: AllocationHandle,
    pub private_data: &'a [u8],
}

impl<K: KernelCallbacks> Device<K> {
    pub(crate) fn resource_ref(&self, id: ResourceId) -> DxResult<&Resource> {
        self.resources
            .get(id)
            .ok_or_else(|| DxError::invalid(format!("unknown resource {id:?}")))
    }

    pub(crate) fn resource_mut(&mut self, id: ResourceId) -> DxResult<&mut Resource> {
        self.resources
            .get_mut(id)
            .ok_or_else(|| DxError::invalid(format!("unknown resource {id:?}")))
    }

    /// Create a resource and upload its initial data, one entry per
    /// subresource.
    pub fn create_resource(
        &mut self,
        desc: &ResourceDesc,
        initial_data: Option<&[SubresourceData<'_>]>,
    ) -> DxResult<ResourceId> {
        self.recorded(|device| device.create_resource_inner(desc, initial_data))
    }

    fn create_resource_inner(
        &mut self,
        desc: &ResourceDesc,
        initial_data: Option<&[SubresourceData<'_>]>,
    ) -> DxResult<ResourceId> {
        desc.validate()?;
        let layout = desc.layout();
        if let Some(subresources) = initial_data {
            if subresources.len() != layout.subresource_count() as usize {
                return Err(DxError::invalid(format!(
                    "{} initial data entries for {} subresources",
                    subresources.len(),
                    layout.subresource_count()
                )));
            }
        }
        let size = u32::try_from(layout.serialized_size()).map_err(|_| {
            DxError::out_of_memory(format!("{}-byte resource", layout.serialized_size()))
        })?;

        let private = desc.allocation_desc(size);
        let handle = self.allocate_with_retry(&private)?;
        let km = KmResource {
            handle,
            size,
            primary: desc.primary.is_some(),
            shared: desc.misc_flags.contains(MiscFlags::SHARED),
        };
        let Some(id) = self.resources.insert(Resource::new(desc.clone(), km)) else {
            let _ = self.kernel.deallocate(&[handle]);
            return Err(DxError::out_of_memory("resource table is full"));
        };

        let filled = match initial_data {
            Some(subresources) => subresources.iter().zip(0u32..).try_for_each(|(data, sub)| {
                self.upload_subresource(id, sub, None, data.data, data.row_pitch, data.depth_pitch)
            }),
            None if desc.usage.is_cpu_visible() => {
                self.with_locked(handle, LockFlags::WRITE_ONLY, |bytes| {
                    bytes.fill(0);
                    Ok(())
                })
            }
            None => Ok(()),
        };
        if let Err(e) = filled {
            if let Some(resource) = self.resources.remove(id) {
                self.deferred.push(resource.km);
            }
            return Err(e);
        }

        debug!(
            "Created {:?} {:?} resource {:?}: {:?} {}x{}x{}, {} bytes in {}",
            desc.usage,
            desc.dimension,
            id,
            desc.format,
            desc.width,
            desc.height,
            desc.depth,
            size,
            handle
        );
        Ok(id)
    }

    /// Open a resource shared by another device.
    pub fn open_resource(&mut self, allocations: &[OpenAllocation<'_>]) -> DxResult<ResourceId> {
        self.recorded(|device| {
            let [allocation] = allocations else {
                return Err(DxError::invalid(format!(
                    "a shared resource has exactly one allocation, got {}",
                    allocations.len()
                )));
            };
            let private = AllocationDesc::from_private_data(allocation.private_data).ok_or_else(|| {
                DxError::invalid(format!(
                    "private data is {} bytes, expected {}",
                    allocation.private_data.len(),
                    std::mem::size_of::<AllocationDesc>()
                ))
            })?;
            let desc = ResourceDesc::from_allocation_desc(&private)?;
            let km = KmResource {
                handle: allocation.handle,
                size: private.size,
                primary: desc.primary.is_some(),
                shared: true,
            };
            let id = device
                .resources
                .insert(Resource::new(desc, km))
                .ok_or_else(|| DxError::out_of_memory("resource table is full"))?;
            debug!("Opened shared resource {:?} on {}", id, allocation.handle);
            Ok(id)
        })
    }

    /// Destroy a resource. Its views must be destroyed first.
    pub fn destroy_resource(&mut self, id: ResourceId) -> DxResult<()> {
        self.recorded(|device| device.destroy_resource_inner(id))
    }

    pub(crate) fn destroy_resource_inner(&mut self, id: ResourceId) -> DxResult<()> {
        let resource = self.resource_ref(id)?;
        if resource.has_views() {
            return Err(DxError::contract(format!(
                "resource {id:?} destroyed while it still has views"
            )));
        }
        if resource.is_mapped() {
            return Err(DxError::invalid(format!("resource {id:?} is still mapped")));
        }
        let Some(resource) = self.resources.remove(id) else {
            return Err(DxError::invalid(format!("unknown resource {id:?}")));
        };

        let km = resource.km;
        if km.primary {
            debug!("Destroying primary resource {:?} ({})", id, km.handle);
            self.kernel
                .deallocate(&[km.handle])
                .map_err(|e| DxError::kernel("deallocate", e))
        } else if !km.shared {
            debug!("Deferring destruction of resource {:?} ({})", id, km.handle);
            self.deferred.push(km);
            Ok(())
        } else {
            debug!("Dropping shared resource {:?} ({})", id, km.handle);
            Ok(())
        }
    }

    /// Unlock a resource left mapped.
    pub(crate) fn release_mapping(&mut self, id: ResourceId) -> DxResult<()> {
        let Some(mapping) = self.resource_mut(id)?.mapping.take() else {
            return Ok(());
        };
        let handle = mapping.region.handle();
        drop(mapping);
        self.kernel
            .unlock(&[handle])
            .map_err(|e| DxError::kernel("unlock", e))
    }

    /// Move each resource's allocation to its predecessor (`res[i]` takes
    /// `res[i + 1]`, wrapping) and redefine every view against the new
    /// allocations, keeping view IDs and bindings.
    pub fn rotate_resource_identities(&mut self, ids: &[ResourceId]) -> DxResult<()> {
        self.recorded(|device| device.rotate_inner(ids))
    }

    fn rotate_inner(&mut self, ids: &[ResourceId]) -> DxResult<()> {
        let mut views = Vec::new();
        for (index, &id) in ids.iter().enumerate() {
            if ids[..index].contains(&id) {
                return Err(DxError::invalid(format!("resource {id:?} listed twice")));
            }
            let resource = self.resource_ref(id)?;
            if resource.is_mapped() {
                return Err(DxError::invalid(format!("rotating mapped resource {id:?}")));
            }
            for kind in ViewKind::ALL {
                views.extend(resource.views(kind).iter().map(|&handle| ViewId { kind, handle }));
            }
        }
        if ids.len() < 2 {
            return Ok(());
        }

        if views.iter().any(|&view| self.pipeline.is_output_bound(view)) {
            let unbound = [SVGA3D_INVALID_ID; SVGA3D_MAX_SIMULTANEOUS_RENDER_TARGETS];
            self.cmd_set_render_targets(SVGA3D_INVALID_ID, &unbound)?;
        }
        for &view in &views {
            self.cmd_destroy_view(view.kind, view.id())?;
            self.view_mut(view)?.defined = false;
        }

        let mut wrappers = Vec::with_capacity(ids.len());
        for &id in ids {
            wrappers.push(std::mem::take(&mut self.resource_mut(id)?.km));
        }
        wrappers.rotate_left(1);
        for (&id, km) in ids.iter().zip(wrappers) {
            trace!("Resource {:?} now backed by {}", id, km.handle);
            self.resource_mut(id)?.km = km;
        }

        for &view in &views {
            let (resource, format, desc) = {
                let v = self.view_ref(view)?;
                (v.resource, v.format, v.desc)
            };
            let handle = self.resource_ref(resource)?.km.handle;
            self.cmd_define_view(view.id(), handle, format, &desc)?;
            self.view_mut(view)?.defined = true;
        }

        debug!("Rotated {} resources, {} views redefined", ids.len(), views.len());
        self.reapply_bindings()
    }

    fn allocation_handles(&self, ids: &[ResourceId]) -> DxResult<Vec<AllocationHandle>> {
        ids.iter()
            .map(|&id| self.resource_ref(id).map(|resource| resource.km.handle))
            .collect()
    }

    /// Let the kernel reuse the memory of idle resources.
    pub fn offer_resources(&mut self, ids: &[ResourceId], priority: OfferPriority) -> DxResult<()> {
        self.recorded(|device| {
            let handles = device.allocation_handles(ids)?;
            device
                .kernel
                .offer(&handles, priority)
                .map_err(|e| DxError::kernel("offer", e))
        })
    }

    /// Take offered resources back. Returns, per resource, whether its
    /// contents were discarded.
    pub fn reclaim_resources(&mut self, ids: &[ResourceId]) -> DxResult<Vec<bool>> {
        self.recorded(|device| {
            let handles = device.allocation_handles(ids)?;
            device
                .kernel
                .reclaim(&handles)
                .map_err(|e| DxError::kernel("reclaim", e))
        })
    }
}

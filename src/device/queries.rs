//! Queries: creation in the query CO chain, Begin/End, result polling and
//! predication.

use tracing::{debug, trace};

use crate::error::{DxError, DxResult};
use crate::kernel::{KernelCallbacks, LockFlags};
use crate::protocol::{
    SVGA3D_DXQUERY_FLAG_PREDICATEHINT, SVGA3D_INVALID_ID, SVGA3D_QUERYSTATE_PENDING,
    SVGA3D_QUERYSTATE_SUCCEEDED, SVGA_3D_CMD_DX_BEGIN_QUERY, SVGA_3D_CMD_DX_DESTROY_QUERY,
    SVGA_3D_CMD_DX_END_QUERY, SVGA_3D_CMD_DX_READBACK_QUERY,
};
use crate::query::{
    decode_result, GetDataFlags, Query, QueryId, QueryMiscFlags, QueryResult, QueryState, QueryType,
};

use super::Device;

impl<K: KernelCallbacks> Device<K> {
    pub(crate) fn query_ref(&self, id: QueryId) -> DxResult<&Query> {
        self.queries
            .get(id)
            .ok_or_else(|| DxError::invalid(format!("unknown query {id:?}")))
    }

    fn query_mut(&mut self, id: QueryId) -> DxResult<&mut Query> {
        self.queries
            .get_mut(id)
            .ok_or_else(|| DxError::invalid(format!("unknown query {id:?}")))
    }

    /// Create a query with a result slot in the query CO chain.
    pub fn create_query(&mut self, ty: QueryType, flags: QueryMiscFlags) -> DxResult<QueryId> {
        self.recorded(|device| {
            ty.validate()?;
            let slot = device.query_chain.alloc_or_grow(
                &mut device.kernel,
                ty.slot_size(),
                device.config.query_coallocation_bytes,
            )?;
            let Some(id) = device.queries.insert(Query::new(ty, flags, slot)) else {
                device.query_chain.free(slot);
                return Err(DxError::out_of_memory("query table is full"));
            };

            // Reused blocks still hold the previous query's result.
            let reset = device.with_locked(slot.handle, LockFlags::WRITE_ONLY, |bytes| {
                let start = slot.offset as usize;
                let cell = bytes
                    .get_mut(start..start + slot.size as usize)
                    .ok_or_else(|| DxError::invalid("query slot outside its CO-allocation"))?;
                cell.fill(0);
                if ty.svga_type().is_some() {
                    cell[..4].copy_from_slice(&SVGA3D_QUERYSTATE_PENDING.to_le_bytes());
                }
                Ok(())
            });
            if let Err(e) = reset {
                device.query_chain.free(slot);
                device.queries.remove(id);
                return Err(e);
            }

            if let Some(svga_type) = ty.svga_type() {
                let svga_flags = if flags.contains(QueryMiscFlags::PREDICATE_HINT) {
                    SVGA3D_DXQUERY_FLAG_PREDICATEHINT
                } else {
                    0
                };
                device.cmd_define_query(id.id(), svga_type, svga_flags)?;
                device.cmd_bind_query(id.id(), slot.handle)?;
                device.cmd_set_query_offset(id.id(), slot.offset)?;
            }
            debug!(
                "Created {:?} query {} at {}+{}",
                ty,
                id.id(),
                slot.handle,
                slot.offset
            );
            Ok(id)
        })
    }

    pub fn begin_query(&mut self, id: QueryId) -> DxResult<()> {
        self.recorded(|device| {
            if device.query_mut(id)?.begin()? {
                device.cmd_query(SVGA_3D_CMD_DX_BEGIN_QUERY, id.id())?;
            }
            Ok(())
        })
    }

    pub fn end_query(&mut self, id: QueryId) -> DxResult<()> {
        self.recorded(|device| {
            let query = device.query_mut(id)?;
            query.end()?;
            if query.ty != QueryType::Event {
                return device.cmd_query(SVGA_3D_CMD_DX_END_QUERY, id.id());
            }

            device.mob_fence += 1;
            let fence = device.mob_fence;
            let query = device.query_mut(id)?;
            query.fence = fence;
            let slot = query.slot;
            device.cmd_mob_fence_64(fence, slot.handle, slot.offset)
        })
    }

    /// Poll a query. Returns [`DxError::StillDrawing`] until the host has
    /// produced the result; afterwards the result is cached.
    pub fn query_get_data(&mut self, id: QueryId, flags: GetDataFlags) -> DxResult<QueryResult> {
        self.recorded(|device| device.query_get_data_inner(id, flags))
    }

    fn query_get_data_inner(&mut self, id: QueryId, flags: GetDataFlags) -> DxResult<QueryResult> {
        let query = self.query_ref(id)?;
        let (ty, slot, fence) = (query.ty, query.slot, query.fence);
        match (query.state, query.result) {
            (QueryState::Signaled, Some(result)) => return Ok(result),
            (QueryState::Created, _) if ty.is_begin_disabled() => return Err(DxError::StillDrawing),
            (QueryState::Created | QueryState::Building, _) => {
                return Err(DxError::contract(format!(
                    "GetData on {ty:?} query {} before End",
                    id.id()
                )))
            }
            _ => {}
        }
        let flush = !flags.contains(GetDataFlags::DO_NOT_FLUSH);

        let result = if ty == QueryType::Event {
            if flush {
                self.flush_inner(false)?;
            }
            let value = self.with_locked(slot.handle, LockFlags::READ_ONLY, |bytes| {
                let start = slot.offset as usize;
                bytes
                    .get(start..start + 8)
                    .map(bytemuck::pod_read_unaligned::<u64>)
                    .ok_or_else(|| DxError::invalid("event slot outside its CO-allocation"))
            })?;
            if value < fence {
                trace!("Event query {} at fence {value}, waiting for {fence}", id.id());
                return Err(DxError::StillDrawing);
            }
            QueryResult::Event(true)
        } else {
            self.cmd_query(SVGA_3D_CMD_DX_READBACK_QUERY, id.id())?;
            if flush {
                self.flush_inner(false)?;
            }
            let (status, payload) = self.with_locked(slot.handle, LockFlags::READ_ONLY, |bytes| {
                let start = slot.offset as usize;
                let cell = bytes
                    .get(start..start + slot.size as usize)
                    .ok_or_else(|| DxError::invalid("query slot outside its CO-allocation"))?;
                let status: u32 = bytemuck::pod_read_unaligned(&cell[..4]);
                Ok((status, cell[4..].to_vec()))
            })?;
            if status != SVGA3D_QUERYSTATE_SUCCEEDED {
                return Err(DxError::StillDrawing);
            }
            decode_result(ty, &payload)?
        };

        self.query_mut(id)?.signal(result);
        Ok(result)
    }

    pub fn destroy_query(&mut self, id: QueryId) -> DxResult<()> {
        self.recorded(|device| device.destroy_query_inner(id))
    }

    pub(crate) fn destroy_query_inner(&mut self, id: QueryId) -> DxResult<()> {
        let query = self
            .queries
            .remove(id)
            .ok_or_else(|| DxError::invalid(format!("unknown query {id:?}")))?;
        self.query_chain.free(query.slot);
        if query.ty == QueryType::Event {
            return Ok(());
        }
        self.cmd_query(SVGA_3D_CMD_DX_DESTROY_QUERY, id.id())
    }

    /// Predicate rendering on a query, or stop predicating with `None`.
    pub fn set_predication(&mut self, query: Option<QueryId>, value: bool) -> DxResult<()> {
        self.recorded(|device| {
            let wire = match query {
                Some(id) => {
                    let ty = device.query_ref(id)?.ty;
                    if !matches!(
                        ty,
                        QueryType::OcclusionPredicate
                            | QueryType::StreamOverflowPredicate
                            | QueryType::StreamOverflowPredicateStream(_)
                    ) {
                        return Err(DxError::invalid(format!("{ty:?} query is not a predicate")));
                    }
                    id.id()
                }
                None => SVGA3D_INVALID_ID,
            };
            device.cmd_set_predication(wire, value)
        })
    }
}

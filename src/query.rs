//! Query Module
//!
//! D3D query types, their SVGA3D counterparts and the decoding of result
//! payloads written by the host.

use bitflags::bitflags;

use crate::coalloc::CoBlock;
use crate::error::{DxError, DxResult};
use crate::handle_table::Handle;
use crate::protocol::{
    SVGA3D_QUERYTYPE_OCCLUSION64, SVGA3D_QUERYTYPE_OCCLUSIONPREDICATE,
    SVGA3D_QUERYTYPE_PIPELINESTATS, SVGA3D_QUERYTYPE_SOP_STREAM0,
    SVGA3D_QUERYTYPE_SOSTATS_STREAM0, SVGA3D_QUERYTYPE_STREAMOUTPUTSTATS,
    SVGA3D_QUERYTYPE_STREAMOVERFLOWPREDICATE, SVGA3D_QUERYTYPE_TIMESTAMP,
    SVGA3D_QUERYTYPE_TIMESTAMPDISJOINT,
};

pub type QueryId = Handle<Query>;

/// D3D10DDI_QUERY
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryType {
    Event,
    Occlusion,
    Timestamp,
    TimestampDisjoint,
    PipelineStats,
    OcclusionPredicate,
    StreamOutputStats,
    StreamOverflowPredicate,
    PipelineStats11,
    /// Per-stream statistics, stream 0..=3.
    StreamOutputStatsStream(u8),
    /// Per-stream overflow predicate, stream 0..=3.
    StreamOverflowPredicateStream(u8),
}

impl QueryType {
    /// SVGA3dQueryType; `None` for event queries, which use a fence instead.
    pub fn svga_type(self) -> Option<u32> {
        Some(match self {
            QueryType::Event => return None,
            QueryType::Occlusion => SVGA3D_QUERYTYPE_OCCLUSION64,
            QueryType::Timestamp => SVGA3D_QUERYTYPE_TIMESTAMP,
            QueryType::TimestampDisjoint => SVGA3D_QUERYTYPE_TIMESTAMPDISJOINT,
            QueryType::PipelineStats | QueryType::PipelineStats11 => {
                SVGA3D_QUERYTYPE_PIPELINESTATS
            }
            QueryType::OcclusionPredicate => SVGA3D_QUERYTYPE_OCCLUSIONPREDICATE,
            QueryType::StreamOutputStats => SVGA3D_QUERYTYPE_STREAMOUTPUTSTATS,
            QueryType::StreamOverflowPredicate => SVGA3D_QUERYTYPE_STREAMOVERFLOWPREDICATE,
            QueryType::StreamOutputStatsStream(stream) => {
                SVGA3D_QUERYTYPE_SOSTATS_STREAM0 + stream as u32
            }
            QueryType::StreamOverflowPredicateStream(stream) => {
                SVGA3D_QUERYTYPE_SOP_STREAM0 + stream as u32
            }
        })
    }

    /// Bytes of the result the host writes after the status word.
    pub fn payload_size(self) -> u32 {
        match self {
            QueryType::Event | QueryType::Occlusion | QueryType::Timestamp => 8,
            QueryType::TimestampDisjoint => 12,
            QueryType::PipelineStats | QueryType::PipelineStats11 => 88,
            QueryType::OcclusionPredicate
            | QueryType::StreamOverflowPredicate
            | QueryType::StreamOverflowPredicateStream(_) => 4,
            QueryType::StreamOutputStats | QueryType::StreamOutputStatsStream(_) => 16,
        }
    }

    /// Size of the CO slot: status word (except for events) plus payload.
    pub fn slot_size(self) -> u32 {
        let status = if self == QueryType::Event { 0 } else { 4 };
        status + self.payload_size()
    }

    /// Queries whose Begin does nothing.
    pub fn is_begin_disabled(self) -> bool {
        matches!(self, QueryType::Event | QueryType::Timestamp)
    }

    pub(crate) fn validate(self) -> DxResult<()> {
        match self {
            QueryType::StreamOutputStatsStream(stream)
            | QueryType::StreamOverflowPredicateStream(stream)
                if stream > 3 =>
            {
                Err(DxError::invalid(format!("stream {stream} out of range")))
            }
            _ => Ok(()),
        }
    }
}

bitflags! {
    /// D3D10DDI_QUERY_MISCFLAG
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct QueryMiscFlags: u32 {
        const PREDICATE_HINT = 0x1;
    }
}

bitflags! {
    /// D3D10_DDI_GET_DATA_FLAG
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct GetDataFlags: u32 {
        const DO_NOT_FLUSH = 0x1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    Created,
    Building,
    Issued,
    Signaled,
}

/// D3D11_QUERY_DATA_PIPELINE_STATISTICS. The hull, domain and compute
/// counters stay zero for the D3D10 query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PipelineStatistics {
    pub ia_vertices: u64,
    pub ia_primitives: u64,
    pub vs_invocations: u64,
    pub gs_invocations: u64,
    pub gs_primitives: u64,
    pub c_invocations: u64,
    pub c_primitives: u64,
    pub ps_invocations: u64,
    pub hs_invocations: u64,
    pub ds_invocations: u64,
    pub cs_invocations: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryResult {
    Event(bool),
    Occlusion(u64),
    Timestamp(u64),
    TimestampDisjoint { frequency: u64, disjoint: bool },
    PipelineStatistics(PipelineStatistics),
    Predicate(bool),
    StreamOutputStatistics {
        primitives_written: u64,
        primitives_storage_needed: u64,
    },
}

fn read_u64(payload: &[u8], index: usize) -> u64 {
    let start = index * 8;
    payload
        .get(start..start + 8)
        .map(bytemuck::pod_read_unaligned::<u64>)
        .unwrap_or(0)
}

fn read_u32(payload: &[u8], offset: usize) -> u32 {
    payload
        .get(offset..offset + 4)
        .map(bytemuck::pod_read_unaligned::<u32>)
        .unwrap_or(0)
}

/// Decode a host payload of `ty`. The payload must be at least
/// [`QueryType::payload_size`] bytes.
pub fn decode_result(ty: QueryType, payload: &[u8]) -> DxResult<QueryResult> {
    if payload.len() < ty.payload_size() as usize {
        return Err(DxError::invalid(format!(
            "{ty:?} result needs {} bytes, got {}",
            ty.payload_size(),
            payload.len()
        )));
    }
    Ok(match ty {
        QueryType::Event => QueryResult::Event(true),
        QueryType::Occlusion => QueryResult::Occlusion(read_u64(payload, 0)),
        QueryType::Timestamp => QueryResult::Timestamp(read_u64(payload, 0)),
        QueryType::TimestampDisjoint => QueryResult::TimestampDisjoint {
            frequency: read_u64(payload, 0),
            disjoint: read_u32(payload, 8) != 0,
        },
        QueryType::PipelineStats | QueryType::PipelineStats11 => {
            let mut stats = PipelineStatistics {
                ia_vertices: read_u64(payload, 0),
                ia_primitives: read_u64(payload, 1),
                vs_invocations: read_u64(payload, 2),
                gs_invocations: read_u64(payload, 3),
                gs_primitives: read_u64(payload, 4),
                c_invocations: read_u64(payload, 5),
                c_primitives: read_u64(payload, 6),
                ps_invocations: read_u64(payload, 7),
                ..Default::default()
            };
            if ty == QueryType::PipelineStats11 {
                stats.hs_invocations = read_u64(payload, 8);
                stats.ds_invocations = read_u64(payload, 9);
                stats.cs_invocations = read_u64(payload, 10);
            }
            QueryResult::PipelineStatistics(stats)
        }
        QueryType::OcclusionPredicate
        | QueryType::StreamOverflowPredicate
        | QueryType::StreamOverflowPredicateStream(_) => {
            QueryResult::Predicate(read_u32(payload, 0) != 0)
        }
        QueryType::StreamOutputStats | QueryType::StreamOutputStatsStream(_) => {
            QueryResult::StreamOutputStatistics {
                primitives_written: read_u64(payload, 0),
                primitives_storage_needed: read_u64(payload, 1),
            }
        }
    })
}

/// A live query.
#[derive(Debug)]
pub struct Query {
    pub(crate) ty: QueryType,
    pub(crate) flags: QueryMiscFlags,
    pub(crate) state: QueryState,
    pub(crate) slot: CoBlock,
    /// Fence an event query waits for.
    pub(crate) fence: u64,
    pub(crate) result: Option<QueryResult>,
}

impl Query {
    pub(crate) fn new(ty: QueryType, flags: QueryMiscFlags, slot: CoBlock) -> Self {
        Self {
            ty,
            flags,
            state: QueryState::Created,
            slot,
            fence: 0,
            result: None,
        }
    }

    pub fn query_type(&self) -> QueryType {
        self.ty
    }

    pub fn state(&self) -> QueryState {
        self.state
    }

    pub fn flags(&self) -> QueryMiscFlags {
        self.flags
    }

    /// Move to BUILDING. Returns whether a BeginQuery command is needed.
    pub(crate) fn begin(&mut self) -> DxResult<bool> {
        if self.ty.is_begin_disabled() {
            return Ok(false);
        }
        match self.state {
            QueryState::Created | QueryState::Signaled => {
                self.state = QueryState::Building;
                self.result = None;
                Ok(true)
            }
            state => Err(DxError::invalid(format!("Begin on {:?} query in {state:?} state", self.ty))),
        }
    }

    /// Move to ISSUED.
    pub(crate) fn end(&mut self) -> DxResult<()> {
        if !self.ty.is_begin_disabled() && self.state != QueryState::Building {
            return Err(DxError::invalid(format!(
                "End on {:?} query in {:?} state",
                self.ty, self.state
            )));
        }
        self.state = QueryState::Issued;
        self.result = None;
        Ok(())
    }

    pub(crate) fn signal(&mut self, result: QueryResult) {
        self.state = QueryState::Signaled;
        self.result = Some(result);
    }
}

//! SVGA3D / VGPU10 D3D11 user-mode driver core.
//!
//! Turns D3D11 device-driver operations into SVGA3D commands, manages the
//! kernel allocations behind resources, shaders and queries, and moves data
//! between the CPU and the virtual GPU. The kernel side is abstracted by
//! [`KernelCallbacks`]; [`LoopbackKernel`] implements it in-process.

pub mod coalloc;
pub mod command_buffer;
pub mod command_processor;
pub mod config;
pub mod device;
pub mod error;
pub mod format;
pub mod geometry;
pub mod handle_table;
pub mod kernel;
pub mod loopback;
pub mod protocol;
pub mod query;
pub mod resource;
pub mod shader;
pub mod shader_arena;
pub mod view;

pub use config::{Config, DeviceConfig, LoopbackConfig, SoakConfig};
pub use device::{Device, OpenAllocation, PipelineState};
pub use error::{DxError, DxResult};
pub use format::SurfaceFormat;
pub use kernel::{
    AllocationHandle, ContextHandle, KernelCallbacks, KernelError, LockFlags, LockedRegion,
    OfferPriority,
};
pub use loopback::{LoopbackKernel, LoopbackStats};
pub use protocol::{ResourceDimension, ShaderType, SvgaBox};
pub use query::{GetDataFlags, QueryId, QueryMiscFlags, QueryResult, QueryState, QueryType};
pub use resource::{
    BindFlags, CpuAccessFlags, MapFlags, MapType, MappedSubresource, MiscFlags, ResourceDesc,
    ResourceId, SubresourceData, Usage,
};
pub use shader::{ShaderId, ShaderSignatures, StreamOutputDesc, StreamOutputElement};
pub use view::{ViewCreateDesc, ViewDesc, ViewId, ViewKind};

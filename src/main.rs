//! SVGA DX Soak Runner
//!
//! Drives a device over the loopback kernel with a mixed workload:
//! 1. Uploads through staging buffers and reads back through a copy
//! 2. Rotates a swap chain with bound render targets
//! 3. Runs event, occlusion and timestamp queries
//! 4. Churns shaders through the shader allocation
//!
//! Usage: svga-dx-soak [config.toml]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use svga_dx_umd::view::{RenderTargetViewDesc, ShaderResourceViewDesc, TextureSlice, TextureSrv};
use svga_dx_umd::{
    BindFlags, Config, Device, DxError, GetDataFlags, LoopbackKernel, MapFlags, MapType,
    QueryMiscFlags, QueryResult, QueryType, ResourceDesc, ResourceId, ShaderId, ShaderSignatures,
    ShaderType, SurfaceFormat, SvgaBox, Usage, ViewCreateDesc, ViewDesc, ViewId,
};

const TEXTURE_SIZE: u32 = 64;

/// Give up on a query after this many StillDrawing polls.
const MAX_QUERY_POLLS: u32 = 64;

/// Shaders kept alive across iterations.
const RESIDENT_SHADERS: usize = 8;

/// Soak runner state
struct SoakService {
    config: Config,
    device: Device<LoopbackKernel>,
    swap_chain: Vec<ResourceId>,
    render_targets: Vec<ViewId>,
    resident_shaders: VecDeque<ShaderId>,
    shutdown: Arc<AtomicBool>,
    iteration: u64,
}

impl SoakService {
    fn new(config: Config) -> Result<Self> {
        let kernel = LoopbackKernel::new(config.kernel.clone());
        let device = Device::new(kernel, config.device.clone())
            .map_err(|e| anyhow!("creating device: {e}"))?;
        Ok(Self {
            config,
            device,
            swap_chain: Vec::new(),
            render_targets: Vec::new(),
            resident_shaders: VecDeque::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
            iteration: 0,
        })
    }

    /// Create the swap chain buffers and bind the first as render target
    fn init_swap_chain(&mut self) -> Result<()> {
        let length = self.config.soak.swap_chain_length;
        info!("Creating {}-buffer swap chain...", length);
        for _ in 0..length {
            let desc = ResourceDesc::texture_2d(
                SurfaceFormat::B8G8R8A8Unorm,
                TEXTURE_SIZE,
                TEXTURE_SIZE,
                Usage::Default,
                BindFlags::RENDER_TARGET | BindFlags::SHADER_RESOURCE,
            );
            let buffer = self.device.create_resource(&desc, None)?;
            let rtv = self.device.create_view(&ViewCreateDesc {
                resource: buffer,
                format: SurfaceFormat::B8G8R8A8Unorm,
                desc: ViewDesc::RenderTarget(RenderTargetViewDesc::Texture2D(TextureSlice {
                    mip_slice: 0,
                    first_array_slice: 0,
                    array_size: 1,
                })),
            })?;
            self.swap_chain.push(buffer);
            self.render_targets.push(rtv);
        }
        if let Some(&first) = self.render_targets.first() {
            self.device.set_render_targets(&[Some(first)], None)?;
        }
        Ok(())
    }

    /// Upload a pattern into a default texture, copy it into a staging
    /// texture and check it on the way back.
    fn upload_round_trip(&mut self) -> Result<()> {
        let format = SurfaceFormat::R8G8B8A8Unorm;
        let texture_desc = ResourceDesc::texture_2d(
            format,
            TEXTURE_SIZE,
            TEXTURE_SIZE,
            Usage::Default,
            BindFlags::SHADER_RESOURCE,
        );
        let texture = self.device.create_resource(&texture_desc, None)?;
        let staging = self.device.create_resource(
            &ResourceDesc::texture_2d(format, TEXTURE_SIZE, TEXTURE_SIZE, Usage::Staging, BindFlags::empty()),
            None,
        )?;

        let row_pitch = TEXTURE_SIZE * 4;
        let seed = self.iteration as u8;
        let pattern: Vec<u8> = (0..row_pitch * TEXTURE_SIZE)
            .map(|i| (i as u8).wrapping_add(seed))
            .collect();
        self.device.update_subresource_up(
            texture,
            0,
            None,
            &pattern,
            row_pitch,
            row_pitch * TEXTURE_SIZE,
        )?;

        // Overwrite a small box to exercise the partial path.
        let patch = [0xEEu8; 4 * 4 * 4];
        let b = SvgaBox { x: 8, y: 8, z: 0, w: 4, h: 4, d: 1 };
        self.device.update_subresource_up(texture, 0, Some(b), &patch, 16, 64)?;

        let srv = self.device.create_view(&ViewCreateDesc {
            resource: texture,
            format,
            desc: ViewDesc::ShaderResource(ShaderResourceViewDesc::Texture2D(TextureSrv {
                most_detailed_mip: 0,
                mip_levels: 1,
                first_array_slice: 0,
                array_size: 1,
            })),
        })?;
        self.device.set_shader_resources(ShaderType::Pixel, 0, &[Some(srv)])?;

        self.device.resource_copy(staging, texture)?;
        let mapped = self.device.map(staging, 0, MapType::Read, MapFlags::empty())?;
        let data = self.device.mapped_data(staging)?;
        let corner = 8 * mapped.row_pitch as usize + 8 * 4;
        let intact = data[..16] == pattern[..16] && data[corner..corner + 16] == patch[..16];
        self.device.unmap(staging, 0)?;
        if !intact {
            bail!("iteration {}: staging read-back does not match the upload", self.iteration);
        }

        self.device.set_shader_resources(ShaderType::Pixel, 0, &[None])?;
        self.device.destroy_view(srv)?;
        self.device.destroy_resource(texture)?;
        self.device.destroy_resource(staging)?;
        Ok(())
    }

    fn present(&mut self) -> Result<()> {
        self.device.rotate_resource_identities(&self.swap_chain)?;
        debug!("Rotated {} swap chain buffers", self.swap_chain.len());
        Ok(())
    }

    fn wait_for_query(&mut self, ty: QueryType) -> Result<QueryResult> {
        let query = self.device.create_query(ty, QueryMiscFlags::empty())?;
        self.device.begin_query(query)?;
        self.device.end_query(query)?;

        let mut polls = 0;
        let result = loop {
            let flags = if polls == 0 {
                GetDataFlags::DO_NOT_FLUSH
            } else {
                GetDataFlags::empty()
            };
            match self.device.query_get_data(query, flags) {
                Ok(result) => break result,
                Err(DxError::StillDrawing) if polls < MAX_QUERY_POLLS => polls += 1,
                Err(e) => return Err(e.into()),
            }
        };
        self.device.destroy_query(query)?;
        Ok(result)
    }

    fn run_queries(&mut self) -> Result<()> {
        for ty in [QueryType::Event, QueryType::Occlusion, QueryType::Timestamp] {
            let result = self.wait_for_query(ty)?;
            debug!("{:?} query: {:?}", ty, result);
        }
        Ok(())
    }

    /// Create a few pixel shaders of varying size and keep one of them
    /// resident, so the shader allocation fragments and eventually repacks.
    fn churn_shaders(&mut self) -> Result<()> {
        let mut shaders = Vec::new();
        for i in 0..4u32 {
            let dwords = 8 + (self.iteration as u32 + i) % 24;
            let mut code = vec![0u32; dwords as usize];
            code[0] = 0x4342_5844;
            code[1] = dwords;
            code[2] = i;
            let id = self
                .device
                .create_shader(ShaderType::Pixel, &code, &ShaderSignatures::default())?;
            shaders.push(id);
        }
        self.device.set_shader(ShaderType::Pixel, shaders.first().copied())?;

        let keep = shaders.swap_remove(1);
        self.resident_shaders.push_back(keep);
        for id in shaders {
            self.device.destroy_shader(id)?;
        }
        while self.resident_shaders.len() > RESIDENT_SHADERS {
            if let Some(oldest) = self.resident_shaders.pop_front() {
                self.device.destroy_shader(oldest)?;
            }
        }
        Ok(())
    }

    fn run_iteration(&mut self) -> Result<()> {
        self.upload_round_trip()?;
        self.present()?;
        self.run_queries()?;
        self.churn_shaders()?;
        self.device.flush(false)?;
        // The recorded stream is only for inspection; keep it bounded.
        self.device.kernel_mut().take_recorded();

        if let Some(e) = self.device.take_error() {
            warn!("Iteration {} left error: {}", self.iteration, e);
        }
        Ok(())
    }

    /// Main workload loop
    fn run_loop(&mut self) -> Result<()> {
        let limit = self.config.soak.iterations;
        info!("Entering workload loop ({} iterations, 0 = until Ctrl+C)", limit);

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                info!("Shutdown requested");
                break;
            }
            if limit != 0 && self.iteration >= limit {
                break;
            }

            self.run_iteration()
                .with_context(|| format!("iteration {}", self.iteration))?;
            self.iteration += 1;
            if self.iteration % 100 == 0 {
                let stats = self.device.kernel().stats();
                info!(
                    "{} iterations: {} submissions, {} commands, {} live allocations",
                    self.iteration,
                    stats.submissions,
                    stats.commands,
                    self.device.kernel().live_allocations()
                );
            }
        }
        Ok(())
    }

    fn shutdown(&mut self) -> Result<()> {
        self.device.destroy()?;
        let kernel = self.device.kernel();
        let stats = kernel.stats();
        info!(
            "Ran {} iterations: {} submissions, {} commands ({} bytes)",
            self.iteration, stats.submissions, stats.commands, stats.command_bytes
        );
        info!(
            "Allocations: {} created, {} freed, {} still live; {} busy refusals, {} renames",
            stats.allocations_created,
            stats.allocations_freed,
            kernel.live_allocations(),
            stats.busy_refusals,
            stats.renames
        );
        let mut histogram: Vec<_> = stats.histogram.iter().collect();
        histogram.sort();
        for (opcode, count) in histogram {
            debug!("  {:>28}: {}", svga_dx_umd::protocol::command_name(*opcode), count);
        }
        if kernel.live_allocations() != 0 {
            bail!("{} allocations leaked", kernel.live_allocations());
        }
        Ok(())
    }
}

fn main() -> Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => Config::load(&path)?,
        None => Config::default(),
    };

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.soak.log_level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!("SVGA DX soak runner starting...");
    info!("Configuration loaded: {:?}", config);

    let mut service = SoakService::new(config)?;

    // Setup Ctrl+C handler
    let shutdown = service.shutdown.clone();
    ctrlc::set_handler(move || {
        info!("Ctrl+C received, shutting down...");
        shutdown.store(true, Ordering::Relaxed);
    })
    .context("Error setting Ctrl+C handler")?;

    service.init_swap_chain()?;
    let result = service.run_loop();
    if let Err(e) = &result {
        error!("Workload failed: {:#}", e);
    }

    info!("Soak runner shutting down");
    service.shutdown()?;
    result
}

// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
use std::path::PathBuf;

use anyhow::{Context, Result};
use cadence_core::init_tracing;
use cadence_platform::{PlatformWindow, WindowConfig};
use cadence_render::gpu::{GpuDevice, ShaderStage};
use cadence_render::{
    FrameLoop, FrameRecorder, ResourceLifetimeRegistry, ShaderBinary, ShaderLibrary,
    SurfaceProvider, SwapchainManager, UploadContext,
};
use cadence_render_vk::convert::{fmt_name, pm_name};
use cadence_render_vk::{DeviceContext, MeshRenderer, MeshRendererDesc};
use clap::Parser;
use tracing::{error, info, warn};

mod config;
mod scene;

use config::{load_cfg, RenderCfg, VsyncMode};
use scene::SpinningQuad;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file with a [render] table
    #[arg(long, default_value = "cadence.toml")]
    config: PathBuf,
    /// Directory holding mesh.vert.spv / mesh.frag.spv
    #[arg(long)]
    shader_dir: Option<PathBuf>,
    /// Exit after this many presented frames
    #[arg(long)]
    frames: Option<u64>,
    /// Override the configured present mode
    #[arg(long, value_enum)]
    vsync_mode: Option<VsyncMode>,
}

fn load_shaders(dir: &std::path::Path) -> Result<(ShaderBinary, ShaderBinary)> {
    let lib = ShaderLibrary::new(dir);
    let vert = lib
        .load("mesh", ShaderStage::Vertex)
        .context("loading vertex shader (compile shaders/mesh.vert with glslc)")?;
    let frag = lib
        .load("mesh", ShaderStage::Fragment)
        .context("loading fragment shader (compile shaders/mesh.frag with glslc)")?;
    Ok((vert, frag))
}

fn build_scene(
    ctx: &DeviceContext,
    registry: &mut ResourceLifetimeRegistry<DeviceContext>,
    swapchain: &SwapchainManager<DeviceContext>,
    cfg: &RenderCfg,
    (vertex_shader, fragment_shader): (ShaderBinary, ShaderBinary),
) -> Result<SpinningQuad> {
    let upload = UploadContext::new(ctx, registry)?;
    let (vertices, indices) = scene::quad();
    let renderer = MeshRenderer::new(
        ctx,
        &upload,
        registry,
        MeshRendererDesc {
            vertex_shader,
            fragment_shader,
            vertices,
            indices,
            clear_color: cfg.clear_color,
            frames_in_flight: cfg.frames_in_flight,
            max_sets_per_pool: cfg.max_sets_per_pool(swapchain.image_count()),
        },
    )?;
    let mut scene = SpinningQuad::new(renderer);
    if let Err(e) = scene.rebuild_targets(ctx, swapchain) {
        scene.release_targets(ctx);
        return Err(e.into());
    }
    Ok(scene)
}

/// Frame loop, swapchain and recorder: everything that must be torn down
/// before the registry is flushed.
struct Presenter {
    frames: FrameLoop<DeviceContext>,
    swapchain: SwapchainManager<DeviceContext>,
    scene: SpinningQuad,
}

impl Presenter {
    fn new(
        ctx: &DeviceContext,
        registry: &mut ResourceLifetimeRegistry<DeviceContext>,
        window: &PlatformWindow,
        cfg: &RenderCfg,
        shaders: (ShaderBinary, ShaderBinary),
    ) -> Result<Self> {
        let frames = FrameLoop::new(ctx, cfg.frame_loop(), registry)?;
        let swapchain = SwapchainManager::new(
            ctx,
            window.framebuffer_size(),
            cfg.vsync_mode.present_mode(),
        )?;
        info!(
            "swapchain ready ({}x{}, {} images, fmt {}, {})",
            swapchain.extent().width,
            swapchain.extent().height,
            swapchain.image_count(),
            fmt_name(swapchain.format().format),
            pm_name(swapchain.present_mode())
        );

        let scene = match build_scene(ctx, registry, &swapchain, cfg, shaders) {
            Ok(scene) => scene,
            Err(e) => {
                swapchain.destroy(ctx);
                return Err(e);
            }
        };
        Ok(Self {
            frames,
            swapchain,
            scene,
        })
    }

    // STRICT SHUTDOWN ORDER:
    // - Wait every slot fence, then device idle
    // - Release swapchain-dependent targets, then the swapchain
    // - (caller) flush the registry, then drop the device
    fn shutdown(mut self, ctx: &DeviceContext) {
        if let Err(e) = self.frames.drain(ctx) {
            error!("draining frame slots: {e}");
        }
        if let Err(e) = ctx.wait_idle() {
            error!("device wait idle: {e}");
        }
        self.scene.release_targets(ctx);
        self.swapchain.destroy(ctx);
    }
}

fn run(cfg: &RenderCfg, frame_limit: Option<u64>) -> Result<()> {
    let shaders = load_shaders(&cfg.shader_dir)?;
    let mut window = PlatformWindow::new(WindowConfig {
        title: cfg.title.clone(),
        width: cfg.width,
        height: cfg.height,
    })?;
    let ctx = DeviceContext::new(&window, &window, &cfg.title)?;
    let mut registry = ResourceLifetimeRegistry::new("app");

    let result = match Presenter::new(&ctx, &mut registry, &window, cfg, shaders) {
        Ok(mut presenter) => {
            let presented = presenter.frames.run(
                &ctx,
                &mut presenter.swapchain,
                &mut presenter.scene,
                &mut window,
                frame_limit,
            );
            presenter.shutdown(&ctx);
            presented.map_err(anyhow::Error::from)
        }
        Err(e) => {
            if let Err(idle) = ctx.wait_idle() {
                warn!("device wait idle: {idle}");
            }
            Err(e)
        }
    };

    registry.flush_all(&ctx);
    drop(ctx);

    let presented = result?;
    info!("presented {presented} frames");
    Ok(())
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut cfg = load_cfg(&args.config).render;
    if let Some(dir) = args.shader_dir {
        cfg.shader_dir = dir;
    }
    if let Some(mode) = args.vsync_mode {
        cfg.vsync_mode = mode;
    }
    info!(vsync = ?cfg.vsync_mode, frames_in_flight = cfg.frames_in_flight, "starting");

    run(&cfg, args.frames).inspect_err(|e| error!("fatal: {e:#}"))
}

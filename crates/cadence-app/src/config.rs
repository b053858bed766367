// SPDX-License-Identifier: CEPL-1.0
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use cadence_render::gpu::PresentMode;
use cadence_render::FrameLoopConfig;
use serde::Deserialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum VsyncMode {
    Fifo,
    #[default]
    Mailbox,
}

impl VsyncMode {
    pub fn present_mode(self) -> PresentMode {
        match self {
            VsyncMode::Fifo => PresentMode::Fifo,
            VsyncMode::Mailbox => PresentMode::Mailbox,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RenderCfg {
    pub clear_color: [f32; 4],
    pub vsync_mode: VsyncMode,
    pub acquire_timeout_ms: u64,
    pub fence_timeout_ms: u64,
    pub frames_in_flight: usize,
    /// 0 means "swapchain image count".
    pub max_sets_per_pool: u32,
    pub shader_dir: PathBuf,
    pub width: u32,
    pub height: u32,
    pub title: String,
}

impl Default for RenderCfg {
    fn default() -> Self {
        RenderCfg {
            clear_color: [0.02, 0.02, 0.04, 1.0],
            vsync_mode: VsyncMode::default(),
            acquire_timeout_ms: 1_000,
            fence_timeout_ms: 10_000,
            frames_in_flight: 2,
            max_sets_per_pool: 0,
            shader_dir: PathBuf::from("shaders"),
            width: 1280,
            height: 720,
            title: "cadence".into(),
        }
    }
}

impl RenderCfg {
    /// Clamps values the frame loop cannot honour.
    pub fn normalized(mut self) -> Self {
        let clamped = self.frames_in_flight.clamp(1, 3);
        if clamped != self.frames_in_flight {
            warn!(
                "frames_in_flight = {} out of range, using {}",
                self.frames_in_flight, clamped
            );
            self.frames_in_flight = clamped;
        }
        self
    }

    pub fn frame_loop(&self) -> FrameLoopConfig {
        FrameLoopConfig {
            frames_in_flight: self.frames_in_flight,
            fence_timeout: Duration::from_millis(self.fence_timeout_ms),
            acquire_timeout: Duration::from_millis(self.acquire_timeout_ms),
        }
    }

    pub fn max_sets_per_pool(&self, image_count: u32) -> u32 {
        if self.max_sets_per_pool == 0 {
            image_count.max(1)
        } else {
            self.max_sets_per_pool
        }
    }
}

#[derive(Debug, Deserialize, Default, PartialEq)]
pub struct AppCfg {
    #[serde(default)]
    pub render: RenderCfg,
}

pub fn parse_cfg(text: &str) -> Result<AppCfg, toml::de::Error> {
    toml::from_str::<AppCfg>(text).map(|mut cfg| {
        cfg.render = cfg.render.normalized();
        cfg
    })
}

/// Missing or malformed files fall back to defaults.
pub fn load_cfg(path: &Path) -> AppCfg {
    match fs::read_to_string(path) {
        Ok(s) => match parse_cfg(&s) {
            Ok(cfg) => {
                info!("config loaded from {}", path.display());
                cfg
            }
            Err(e) => {
                warn!("{}: {e}; using defaults", path.display());
                AppCfg::default()
            }
        },
        Err(e) => {
            warn!("{}: {e}; using defaults", path.display());
            AppCfg::default()
        }
    }
}

// SPDX-License-Identifier: CEPL-1.0
//! winit window that the frame loop drives by pumping events.
//!
//! The frame loop owns control flow, so events are pumped once per iteration
//! with [`EventLoopExtPumpEvents`] instead of handing the thread to
//! `run_app`. Raw handles for surface creation come through the
//! `raw-window-handle` traits winit implements.
#![deny(unsafe_op_in_unsafe_fn)]

use std::time::Duration;

use anyhow::{anyhow, Result};
use cadence_render::{RenderSize, SurfaceProvider};
use tracing::{debug, info};

pub use winit;

use winit::{
    application::ApplicationHandler,
    dpi::PhysicalSize,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    platform::pump_events::{EventLoopExtPumpEvents, PumpStatus},
    raw_window_handle::{
        DisplayHandle, HandleError, HasDisplayHandle, HasWindowHandle, WindowHandle,
    },
    window::{Window, WindowId},
};

/// Sleep granularity while nothing can be drawn (minimized or occluded).
const IDLE_PUMP: Duration = Duration::from_millis(16);
/// Pumps allowed for the platform to deliver `resumed`.
const CREATE_PUMPS: usize = 64;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "cadence".into(),
            width: 1280,
            height: 720,
        }
    }
}

/// How long one pump may block: never while frames are being drawn.
pub fn pump_timeout(size: RenderSize, occluded: bool) -> Duration {
    if size.is_empty() || occluded {
        IDLE_PUMP
    } else {
        Duration::ZERO
    }
}

struct WindowState {
    config: WindowConfig,
    window: Option<Window>,
    size: RenderSize,
    occluded: bool,
    close_requested: bool,
    create_error: Option<winit::error::OsError>,
}

impl ApplicationHandler for WindowState {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }
        let attrs = Window::default_attributes()
            .with_title(self.config.title.clone())
            .with_inner_size(PhysicalSize::new(self.config.width, self.config.height));
        match event_loop.create_window(attrs) {
            Ok(window) => {
                let size = window.inner_size();
                self.size = RenderSize::new(size.width, size.height);
                info!("window created ({}x{})", size.width, size.height);
                self.window = Some(window);
            }
            Err(e) => {
                self.create_error = Some(e);
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, _event_loop: &ActiveEventLoop, id: WindowId, event: WindowEvent) {
        if self.window.as_ref().map(Window::id) != Some(id) {
            return;
        }
        match event {
            WindowEvent::CloseRequested => {
                info!("CloseRequested");
                self.close_requested = true;
            }
            WindowEvent::Resized(new_size) => {
                self.size = RenderSize::new(new_size.width, new_size.height);
                debug!(
                    "Resized -> {}x{} (paused={})",
                    new_size.width,
                    new_size.height,
                    self.size.is_empty()
                );
            }
            WindowEvent::Occluded(occluded) => {
                self.occluded = occluded;
                debug!("Occluded={occluded}");
            }
            _ => {}
        }
    }
}

/// A single window plus the event loop that feeds it.
pub struct PlatformWindow {
    // Window state drops before the loop that created it.
    state: WindowState,
    event_loop: EventLoop<()>,
    exited: bool,
}

impl PlatformWindow {
    pub fn new(config: WindowConfig) -> Result<Self> {
        let mut event_loop = EventLoop::new()?;
        let mut state = WindowState {
            config,
            window: None,
            size: RenderSize::default(),
            occluded: false,
            close_requested: false,
            create_error: None,
        };
        for _ in 0..CREATE_PUMPS {
            let status = event_loop.pump_app_events(Some(Duration::ZERO), &mut state);
            if state.window.is_some() || matches!(status, PumpStatus::Exit(_)) {
                break;
            }
        }
        if let Some(e) = state.create_error.take() {
            return Err(anyhow!("create_window: {e}"));
        }
        if state.window.is_none() {
            return Err(anyhow!("platform never resumed; no window was created"));
        }
        Ok(Self {
            state,
            event_loop,
            exited: false,
        })
    }

    pub fn is_occluded(&self) -> bool {
        self.state.occluded
    }

    pub fn set_title(&self, title: &str) {
        if let Some(w) = &self.state.window {
            w.set_title(title);
        }
    }
}

impl SurfaceProvider for PlatformWindow {
    fn should_close(&self) -> bool {
        self.exited || self.state.close_requested
    }

    fn poll_events(&mut self) {
        let timeout = pump_timeout(self.state.size, self.state.occluded);
        if let PumpStatus::Exit(code) = self
            .event_loop
            .pump_app_events(Some(timeout), &mut self.state)
        {
            debug!("event loop exited with {code}");
            self.exited = true;
        }
    }

    fn framebuffer_size(&self) -> RenderSize {
        // Occluded windows keep their size but cannot present.
        if self.state.occluded {
            RenderSize::default()
        } else {
            self.state.size
        }
    }
}

impl HasWindowHandle for PlatformWindow {
    fn window_handle(&self) -> Result<WindowHandle<'_>, HandleError> {
        self.state
            .window
            .as_ref()
            .ok_or(HandleError::Unavailable)?
            .window_handle()
    }
}

impl HasDisplayHandle for PlatformWindow {
    fn display_handle(&self) -> Result<DisplayHandle<'_>, HandleError> {
        self.state
            .window
            .as_ref()
            .ok_or(HandleError::Unavailable)?
            .display_handle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pumps_block_only_when_nothing_is_drawn() {
        assert_eq!(pump_timeout(RenderSize::new(800, 600), false), Duration::ZERO);
        assert_eq!(pump_timeout(RenderSize::new(0, 600), false), IDLE_PUMP);
        assert_eq!(pump_timeout(RenderSize::new(800, 600), true), IDLE_PUMP);
    }

    #[test]
    fn default_window_config() {
        let cfg = WindowConfig::default();
        assert_eq!(cfg.title, "cadence");
        assert_eq!((cfg.width, cfg.height), (1280, 720));
    }
}

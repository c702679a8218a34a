//! Bouncing particles rendered through Vulkan
//!
//! Opens a window, simulates particles on the CPU and uploads the snapshot
//! every frame. Frame times are written to a metrics file on exit.

use std::{
    sync::Arc,
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use anyhow::{anyhow, Result};
use bouncing_particles::{
    config::AppConfig,
    gpu::GpuDevice,
    graphics::{SwapchainRenderer, VulkanContext},
    metrics::{FrameMetrics, MetricsHeader, SystemEnvironment},
    runners::AshDevice,
    simulation::clamp_delta,
    FrameOrchestrator, ParticleSystem,
};
use shared::{Bounds, APP_VERSION};
use tracing::{error, info, trace, warn};
use tracing_subscriber::EnvFilter;
use winit::{
    application::ApplicationHandler,
    dpi::PhysicalSize,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Window, WindowId},
};

// Application state
struct App {
    config: AppConfig,
    seed: u64,
    window: Option<Arc<Window>>,
    frames: Option<FrameOrchestrator<SwapchainRenderer>>,
    particles: Option<ParticleSystem>,
    gpu_name: String,
    metrics: FrameMetrics,
    last_frame: Instant,
    frame_count: u64,
    /// First fatal error; ends the event loop
    error: Option<anyhow::Error>,
}

impl App {
    fn new(config: AppConfig, seed: u64) -> Self {
        Self {
            config,
            seed,
            window: None,
            frames: None,
            particles: None,
            gpu_name: "N/A".to_string(),
            metrics: FrameMetrics::new(),
            last_frame: Instant::now(),
            frame_count: 0,
            error: None,
        }
    }

    fn init(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let extent = self.config.window_extent;
        let window = Arc::new(
            event_loop.create_window(
                Window::default_attributes()
                    .with_title(self.config.window_title.clone())
                    .with_inner_size(PhysicalSize::new(extent.width, extent.height)),
            )?,
        );
        self.window = Some(window.clone());

        let ctx = Arc::new(VulkanContext::new(
            &*window,
            &self.config.window_title,
            self.config.enable_validation,
        )?);
        let device = AshDevice::new(ctx);
        self.gpu_name = device.device_name();

        let renderer = SwapchainRenderer::new(&device, window.clone(), &self.config)?;
        let mut frames = FrameOrchestrator::new(&device, renderer, self.config.frames_in_flight)?
            .with_fence_timeout(self.config.fence_timeout);

        let size = window.inner_size();
        let bounds = Bounds::new(size.width.max(1) as f32, size.height.max(1) as f32);
        let particles = ParticleSystem::new(self.config.particle_count, bounds, self.seed)?;
        frames.prime(particles.particles())?;

        info!(
            particles = particles.len(),
            frames_in_flight = self.config.frames_in_flight,
            "setup complete, starting render loop"
        );
        self.particles = Some(particles);
        self.frames = Some(frames);
        self.metrics.start_run();
        self.last_frame = Instant::now();
        Ok(())
    }

    fn frame(&mut self) -> Result<()> {
        let (Some(frames), Some(particles)) = (self.frames.as_mut(), self.particles.as_mut()) else {
            return Ok(());
        };

        let now = Instant::now();
        let dt = clamp_delta(now.duration_since(self.last_frame).as_secs_f32());
        self.last_frame = now;
        self.metrics.record(dt);

        particles.update(dt);
        let outcome = frames.draw_frame(particles.particles())?;
        trace!(?outcome, "frame done");

        self.frame_count += 1;
        if self.frame_count % 600 == 0 {
            let stats = frames.stats();
            info!(
                frames = self.frame_count,
                presented = stats.presented,
                rebuilds = stats.rebuilds,
                skipped = stats.skipped,
                "frame statistics"
            );
        }
        Ok(())
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, err: anyhow::Error) {
        error!("fatal: {err:#}");
        if self.error.is_none() {
            self.error = Some(err);
        }
        event_loop.exit();
    }

    /// Best-effort teardown and metrics persistence, then report the run's result
    fn finish(mut self) -> Result<()> {
        if let Some(frames) = self.frames.as_mut() {
            if let Err(err) = frames.shutdown() {
                warn!("shutdown did not complete cleanly: {err}");
            }
        }

        let header = MetricsHeader {
            version: APP_VERSION.to_string(),
            gpu_name: self.gpu_name.clone(),
            requested_particles: self.config.particle_count,
            actual_particles: self.particles.as_ref().map_or(0, ParticleSystem::len),
        };
        if let Err(err) = self
            .metrics
            .save(&self.config.metrics_dir, &header, &SystemEnvironment)
        {
            error!("failed to save metrics: {err}");
        }

        // GPU objects before the window they present to.
        self.frames = None;
        self.window = None;

        match self.error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return; // Already initialized
        }
        if let Err(err) = self.init(event_loop) {
            self.fail(event_loop, err);
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                info!(frames = self.frame_count, "window closed");
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                trace!(width = size.width, height = size.height, "window resized");
                if let Some(frames) = self.frames.as_mut() {
                    frames.notify_resized();
                }
                if size.width > 0 && size.height > 0 {
                    if let Some(particles) = self.particles.as_mut() {
                        let bounds = Bounds::new(size.width as f32, size.height as f32);
                        if let Err(err) = particles.set_bounds(bounds) {
                            warn!("ignoring resize: {err}");
                        }
                    }
                }
            }
            WindowEvent::RedrawRequested => {
                if let Err(err) = self.frame() {
                    self.fail(event_loop, err);
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(window) = self.window.as_ref() {
            window.request_redraw();
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AppConfig::default();
    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| anyhow!("system clock before 1970: {e}"))?
        .as_nanos() as u64;
    info!(version = APP_VERSION, seed, "bouncing-particles starting");

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config, seed);
    event_loop.run_app(&mut app)?;

    app.finish()
}

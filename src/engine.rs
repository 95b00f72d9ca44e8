// =============================================================================
// ENGINE - window, game loop and render backend hooks
// =============================================================================
//
// The Engine owns the winit event loop and drives a RenderBackend through
// its lifecycle:
//
//   before_start_window  -> window is about to be created
//   before_game_loop     -> window exists, GPU objects are built
//   update_game          -> once per loop iteration
//   after_game_loop      -> loop finished, GPU objects are released
//
// ProgressiveRenderBackend is the Vulkan backend: instance -> surface ->
// device selection -> VirtualDevice -> SwapChain. A resize throws the
// swapchain away and builds a new one.

use anyhow::{Context, Result};
use ash::vk;
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use std::sync::Arc;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Fullscreen, Window, WindowAttributes, WindowId},
};

use crate::backend::device::VirtualDevice;
use crate::backend::instance::{ValidationConfig, VulkanInstance};
use crate::backend::selector::DeviceSelector;
use crate::backend::surface::{DrawableSurface, PresentationSurface};
use crate::backend::swapchain::{SwapChain, SwapChainSettings};
use crate::config::Config;
use crate::logging::{Logger, Severity};

/// Game loop hooks
pub trait RenderBackend {
    /// Called before the window is created
    fn before_start_window(&mut self, _title: &str, _width: u32, _height: u32) -> Result<()> {
        Ok(())
    }

    /// Called once the window exists, before the first loop iteration
    fn before_game_loop(&mut self, window: &Window) -> Result<()>;

    /// Called once per loop iteration
    fn update_game(&mut self, window: &Window) -> Result<()>;

    /// The drawable size of the window changed
    fn window_resized(&mut self, _size: vk::Extent2D) {}

    /// Called when the loop ends; release everything built in before_game_loop
    fn after_game_loop(&mut self);
}

/// Metadata about the application running on the engine
#[derive(Debug, Clone)]
pub struct ApplicationInfo {
    pub name: String,
    pub description: String,
    pub authors: Vec<String>,
    pub version_major: u32,
    pub version_minor: u32,
    pub version_patch: u32,
    pub version_identifier: String,
}

impl ApplicationInfo {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            authors: Vec::new(),
            version_major: 0,
            version_minor: 0,
            version_patch: 0,
            version_identifier: "dev".to_string(),
        }
    }

    pub fn version_string(&self) -> String {
        crate::format_version(
            self.version_major,
            self.version_minor,
            self.version_patch,
            &self.version_identifier,
        )
    }
}

pub struct Engine<B: RenderBackend> {
    backend: B,
    logger: Arc<dyn Logger>,
    application: ApplicationInfo,
    fullscreen: bool,
}

impl<B: RenderBackend> Engine<B> {
    pub fn new(backend: B, logger: Arc<dyn Logger>, application: ApplicationInfo) -> Self {
        Self {
            backend,
            logger,
            application,
            fullscreen: false,
        }
    }

    pub fn set_fullscreen(&mut self, fullscreen: bool) {
        self.fullscreen = fullscreen;
    }

    pub fn application(&self) -> &ApplicationInfo {
        &self.application
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Open a window and run the game loop until it is closed. Returns the
    /// first error any hook reported.
    pub fn start_window(&mut self, title: &str, width: u32, height: u32) -> Result<()> {
        log::info!(
            "Starting {} v{} ({}x{})",
            self.application.name,
            self.application.version_string(),
            width,
            height
        );

        self.backend.before_start_window(title, width, height)?;

        let mut attributes = WindowAttributes::default()
            .with_title(title)
            .with_inner_size(winit::dpi::PhysicalSize::new(width, height));
        if self.fullscreen {
            attributes = attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let event_loop = EventLoop::new().context("Failed to create event loop")?;
        let mut runner = WindowRunner {
            backend: &mut self.backend,
            logger: &*self.logger,
            attributes: Some(attributes),
            window: None,
            error: None,
        };
        event_loop.run_app(&mut runner).context("Event loop failed")?;

        match runner.error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Bridges winit events to the backend hooks for one start_window call
struct WindowRunner<'a, B: RenderBackend> {
    backend: &'a mut B,
    logger: &'a dyn Logger,
    attributes: Option<WindowAttributes>,
    window: Option<Window>,
    error: Option<anyhow::Error>,
}

impl<B: RenderBackend> WindowRunner<'_, B> {
    fn fail(&mut self, event_loop: &ActiveEventLoop, hook: &str, error: anyhow::Error) {
        self.logger.rendering(
            Severity::Error,
            &format!("{} failed, stopping the game loop: {:#}", hook, error),
        );
        if self.error.is_none() {
            self.error = Some(error);
        }
        event_loop.exit();
    }
}

impl<B: RenderBackend> ApplicationHandler for WindowRunner<'_, B> {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        let Some(attributes) = self.attributes.take() else {
            return;
        };

        let window = match event_loop.create_window(attributes) {
            Ok(window) => window,
            Err(e) => {
                self.fail(event_loop, "Window creation", e.into());
                return;
            }
        };

        if let Err(e) = self.backend.before_game_loop(&window) {
            self.window = Some(window);
            self.fail(event_loop, "before_game_loop", e);
            return;
        }

        self.window = Some(window);
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                self.backend.window_resized(vk::Extent2D {
                    width: size.width,
                    height: size.height,
                });
            }

            WindowEvent::RedrawRequested => {
                let Some(window) = self.window.as_ref() else {
                    return;
                };
                if let Err(e) = self.backend.update_game(window) {
                    self.fail(event_loop, "update_game", e);
                }
            }

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() && event.physical_key == PhysicalKey::Code(KeyCode::Escape) {
                    log::info!("ESC pressed, exiting...");
                    event_loop.exit();
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

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        self.backend.after_game_loop();
        self.window = None;
    }
}

// GPU objects, dropped top to bottom
struct GpuState {
    swap_chain: Option<SwapChain>,
    device: Arc<VirtualDevice>,
    surface: PresentationSurface,
    instance: Arc<VulkanInstance>,
}

/// Vulkan render backend
pub struct ProgressiveRenderBackend {
    application_name: String,
    logger: Arc<dyn Logger>,
    validation: ValidationConfig,
    settings: SwapChainSettings,
    state: Option<GpuState>,
    swap_chain_stale: bool,
}

impl ProgressiveRenderBackend {
    pub fn new(
        application_name: &str,
        logger: Arc<dyn Logger>,
        validation: ValidationConfig,
        settings: SwapChainSettings,
    ) -> Self {
        Self {
            application_name: application_name.to_string(),
            logger,
            validation,
            settings,
            state: None,
            swap_chain_stale: false,
        }
    }

    pub fn from_config(config: &Config, logger: Arc<dyn Logger>) -> Self {
        Self::new(
            &config.window.title,
            logger,
            config.validation(),
            config.swap_chain_settings(),
        )
    }

    pub fn is_initialized(&self) -> bool {
        self.state.is_some()
    }

    pub fn swap_chain(&self) -> Option<&SwapChain> {
        self.state.as_ref().and_then(|state| state.swap_chain.as_ref())
    }

    fn rebuild_swap_chain(&mut self, window: &Window) -> Result<()> {
        let Some(state) = self.state.as_mut() else {
            return Ok(());
        };

        let size = window.drawable_size();
        if size.width == 0 || size.height == 0 {
            // Minimized; try again once there is something to draw to
            return Ok(());
        }

        log::info!("Recreating swapchain for {}x{}", size.width, size.height);

        // The old swapchain is gone before the new one is created
        state.swap_chain = None;
        state.device.wait_idle()?;
        state.swap_chain = Some(SwapChain::new(
            state.device.clone(),
            &state.surface,
            window,
            &self.settings,
        )?);

        self.swap_chain_stale = false;
        Ok(())
    }
}

impl RenderBackend for ProgressiveRenderBackend {
    fn before_game_loop(&mut self, window: &Window) -> Result<()> {
        log::info!("Initializing Vulkan...");

        let display_handle = window.raw_display_handle();
        let instance = VulkanInstance::new(
            &self.application_name,
            display_handle,
            &self.validation,
            self.logger.clone(),
        )?;

        let surface = unsafe {
            PresentationSurface::new(instance.clone(), display_handle, window.raw_window_handle())?
        };

        let candidate = DeviceSelector::new(&instance, &surface).select()?;
        let device = VirtualDevice::new(instance.clone(), candidate)?;
        let swap_chain = SwapChain::new(device.clone(), &surface, window, &self.settings)?;

        self.state = Some(GpuState {
            swap_chain: Some(swap_chain),
            device,
            surface,
            instance,
        });
        self.swap_chain_stale = false;

        log::info!("Vulkan initialized successfully!");
        Ok(())
    }

    fn update_game(&mut self, window: &Window) -> Result<()> {
        if self.swap_chain_stale {
            self.rebuild_swap_chain(window)?;
        }
        Ok(())
    }

    fn window_resized(&mut self, size: vk::Extent2D) {
        let current = self.swap_chain().map(|swap_chain| swap_chain.extent());
        if current != Some(size) {
            self.swap_chain_stale = true;
        }
    }

    fn after_game_loop(&mut self) {
        if let Some(state) = self.state.take() {
            log::info!(
                "Cleaning up Vulkan resources (validation {})...",
                if state.instance.validation_enabled() { "on" } else { "off" }
            );
            let _ = state.device.wait_idle();
            drop(state);
            log::info!("Cleanup complete");
        }
    }
}

impl Drop for ProgressiveRenderBackend {
    fn drop(&mut self) {
        self.after_game_loop();
    }
}

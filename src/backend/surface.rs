// Presentation surface and the window collaborator
//
// The surface is created from a window's raw handles and destroyed before
// the instance it came from. Swapchains only copy its handle; whoever owns
// the PresentationSurface guarantees it outlives them.

use anyhow::{Context, Result};
use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::sync::Arc;

use super::instance::VulkanInstance;

/// Window-side queries the swapchain needs
pub trait DrawableSurface {
    /// Current drawable size in pixels
    fn drawable_size(&self) -> vk::Extent2D;
}

impl DrawableSurface for winit::window::Window {
    fn drawable_size(&self) -> vk::Extent2D {
        let size = self.inner_size();
        vk::Extent2D {
            width: size.width,
            height: size.height,
        }
    }
}

impl DrawableSurface for vk::Extent2D {
    fn drawable_size(&self) -> vk::Extent2D {
        *self
    }
}

pub struct PresentationSurface {
    pub loader: ash::extensions::khr::Surface,
    pub handle: vk::SurfaceKHR,
    _instance: Arc<VulkanInstance>,
}

impl PresentationSurface {
    /// # Safety
    /// The handles must describe a live window that outlives the surface.
    pub unsafe fn new(
        instance: Arc<VulkanInstance>,
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
    ) -> Result<Self> {
        let handle = ash_window::create_surface(
            &instance.entry,
            &instance.instance,
            display_handle,
            window_handle,
            None,
        )
        .context("Failed to create window surface")?;

        let loader = ash::extensions::khr::Surface::new(&instance.entry, &instance.instance);

        Ok(Self {
            loader,
            handle,
            _instance: instance,
        })
    }
}

impl Drop for PresentationSurface {
    fn drop(&mut self) {
        unsafe {
            self.loader.destroy_surface(self.handle, None);
        }
    }
}

// Swapchain - Window presentation
//
// Manages the chain of images we render to and present to the screen,
// plus the objects built for them: image views, framebuffers, render
// passes and pipelines, each looked up by label.
//
// A swapchain is never patched in place. When the surface changes (resize)
// the whole thing is dropped and built again.

use anyhow::{Context, Result};
use ash::vk;
use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;

use super::device::VirtualDevice;
use super::pipeline::{alpha_blend_attachment, GraphicsPipeline};
use super::render_pass::{RenderPass, SubpassBuilder, SubpassTarget};
use super::surface::{DrawableSurface, PresentationSurface};
use crate::logging::Severity;

/// Label of the render pass and pipeline that draw to the swapchain images
pub const DISPLAY_LABEL: &str = "display";

pub fn display_image_view_label(index: usize) -> String {
    format!("display_image_view_{}", index)
}

pub fn display_framebuffer_label(index: usize) -> String {
    format!("display_framebuffer_{}", index)
}

/// What a surface offers a particular physical device. Always queried
/// fresh; never reuse it for another device.
#[derive(Debug, Clone, Default)]
pub struct SwapChainSupportDetails {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SwapChainSupportDetails {
    pub fn query(
        loader: &ash::extensions::khr::Surface,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> Result<Self> {
        unsafe {
            Ok(Self {
                capabilities: loader
                    .get_physical_device_surface_capabilities(physical_device, surface)
                    .context("Failed to query surface capabilities")?,
                formats: loader
                    .get_physical_device_surface_formats(physical_device, surface)
                    .context("Failed to query surface formats")?,
                present_modes: loader
                    .get_physical_device_surface_present_modes(physical_device, surface)
                    .context("Failed to query present modes")?,
            })
        }
    }

    /// A swapchain needs at least one format and one present mode
    pub fn is_adequate(&self) -> bool {
        !self.formats.is_empty() && !self.present_modes.is_empty()
    }
}

/// Prefer 8-bit BGRA sRGB; otherwise take whatever the surface lists first
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first())
        .copied()
}

/// The preferred mode if available, else FIFO (always supported)
pub fn choose_present_mode(
    modes: &[vk::PresentModeKHR],
    preferred: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if modes.contains(&preferred) {
        preferred
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// The surface's current extent, unless it leaves the choice to us
/// (width == u32::MAX); then the drawable size clamped to the allowed range.
pub fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    drawable: vk::Extent2D,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }

    vk::Extent2D {
        width: drawable.width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: drawable.height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

/// One more than the minimum, bounded by the maximum when there is one
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let image_count = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 && image_count > capabilities.max_image_count {
        capabilities.max_image_count
    } else {
        image_count
    }
}

/// Shaders and rasterizer settings for the display pipeline
#[derive(Debug, Clone)]
pub struct DisplayPipelineSettings {
    pub vertex_shader: PathBuf,
    pub fragment_shader: PathBuf,
    pub polygon_mode: vk::PolygonMode,
    pub line_width: f32,
}

#[derive(Debug, Clone)]
pub struct SwapChainSettings {
    pub preferred_present_mode: vk::PresentModeKHR,
    pub image_usage: vk::ImageUsageFlags,
    /// Build the display render pass, framebuffers and pipeline
    pub display: Option<DisplayPipelineSettings>,
}

impl Default for SwapChainSettings {
    fn default() -> Self {
        Self {
            preferred_present_mode: vk::PresentModeKHR::MAILBOX,
            image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            display: None,
        }
    }
}

pub struct SwapChain {
    loader: ash::extensions::khr::Swapchain,
    handle: vk::SwapchainKHR,
    format: vk::SurfaceFormatKHR,
    present_mode: vk::PresentModeKHR,
    extent: vk::Extent2D,
    images: Vec<vk::Image>,
    image_views: HashMap<String, vk::ImageView>,
    framebuffers: HashMap<String, vk::Framebuffer>,
    render_passes: HashMap<String, Rc<RenderPass>>,
    pipelines: HashMap<String, Rc<GraphicsPipeline>>,
    device: Arc<VirtualDevice>,
}

impl SwapChain {
    /// `surface` must outlive the swapchain; only its handle is kept.
    pub fn new(
        device: Arc<VirtualDevice>,
        surface: &PresentationSurface,
        window: &dyn DrawableSurface,
        settings: &SwapChainSettings,
    ) -> Result<Self> {
        let logger = device.logger();
        let fatal = |message: String| logger.rendering(Severity::Fatal, &message);

        let support = match SwapChainSupportDetails::query(
            &surface.loader,
            device.physical_device,
            surface.handle,
        ) {
            Ok(support) => support,
            Err(e) => {
                fatal(format!("Failed to query swapchain support: {:#}", e));
                return Err(e);
            }
        };

        let Some(format) = choose_surface_format(&support.formats) else {
            fatal("The surface reports no formats; cannot create a swapchain.".to_string());
            anyhow::bail!("No surface formats available");
        };
        let present_mode = choose_present_mode(&support.present_modes, settings.preferred_present_mode);
        let extent = choose_extent(&support.capabilities, window.drawable_size());
        let image_count = choose_image_count(&support.capabilities);
        let (sharing_mode, queue_families) = device.queue_families.image_sharing();

        log::info!(
            "Creating swapchain: {}x{}, {} images, {:?}, {:?}",
            extent.width,
            extent.height,
            image_count,
            format.format,
            present_mode
        );

        let loader = ash::extensions::khr::Swapchain::new(&device.instance().instance, &device.device);

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface.handle)
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(settings.image_usage)
            .image_sharing_mode(sharing_mode)
            .queue_family_indices(&queue_families)
            .pre_transform(support.capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(vk::SwapchainKHR::null());

        let handle = match unsafe { loader.create_swapchain(&create_info, None) } {
            Ok(handle) => handle,
            Err(e) => {
                fatal(format!("Failed to create swapchain: {:?}", e));
                return Err(e).context("Failed to create swapchain");
            }
        };

        let images = match unsafe { loader.get_swapchain_images(handle) } {
            Ok(images) => images,
            Err(e) => {
                unsafe { loader.destroy_swapchain(handle, None) };
                fatal(format!("Failed to get swapchain images: {:?}", e));
                return Err(e).context("Failed to get swapchain images");
            }
        };

        log::info!("Created swapchain with {} images", images.len());

        // From here on Drop releases whatever was created if a later step fails
        let mut swap_chain = Self {
            loader,
            handle,
            format,
            present_mode,
            extent,
            images,
            image_views: HashMap::new(),
            framebuffers: HashMap::new(),
            render_passes: HashMap::new(),
            pipelines: HashMap::new(),
            device,
        };

        for index in 0..swap_chain.images.len() {
            let image = swap_chain.images[index];
            swap_chain.create_image_view(&display_image_view_label(index), vk::ImageViewType::TYPE_2D, image)?;
        }

        if let Some(display) = settings.display.as_ref() {
            swap_chain.build_display(display)?;
        }

        Ok(swap_chain)
    }

    fn build_display(&mut self, settings: &DisplayPipelineSettings) -> Result<()> {
        let device = self.device.clone();

        let mut render_pass = device.render_pass_builder(DISPLAY_LABEL);
        render_pass.add_attachment_description(
            vk::AttachmentDescriptionFlags::empty(),
            self.format.format,
            vk::SampleCountFlags::TYPE_1,
            vk::AttachmentLoadOp::CLEAR,
            vk::AttachmentStoreOp::STORE,
            vk::AttachmentLoadOp::DONT_CARE,
            vk::AttachmentStoreOp::DONT_CARE,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::PRESENT_SRC_KHR,
        );

        let mut subpass = SubpassBuilder::new();
        subpass
            .add_color_attachment_ref(0, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .add_dependency(
                SubpassTarget::External,
                SubpassTarget::This,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::AccessFlags::empty(),
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                vk::DependencyFlags::empty(),
            );
        let subpass = render_pass.add_subpass(subpass);

        let render_pass = render_pass.build(&device)?;
        self.register_render_pass(DISPLAY_LABEL, render_pass.clone());

        for index in 0..self.images.len() {
            let view = self
                .get_image_view(&display_image_view_label(index))
                .context("Display image view missing")?;
            self.create_framebuffer(&display_framebuffer_label(index), &render_pass, &[view], 1)?;
        }

        let mut pipeline = device.graphics_pipeline_builder(DISPLAY_LABEL);
        let stages = pipeline
            .add_stage(&settings.vertex_shader, "main", vk::ShaderStageFlags::VERTEX)
            .and_then(|p| p.add_stage(&settings.fragment_shader, "main", vk::ShaderStageFlags::FRAGMENT));
        if let Err(e) = stages {
            device.logger().rendering(
                Severity::Fatal,
                &format!("Failed to load display shaders: {:#}", e),
            );
            return Err(e);
        }

        pipeline
            .set_viewport_count(1)
            .set_scissor_count(1)
            .add_dynamic_state(vk::DynamicState::VIEWPORT)
            .add_dynamic_state(vk::DynamicState::SCISSOR)
            .set_polygon_mode(settings.polygon_mode)
            .set_line_width(settings.line_width)
            .set_cull_mode(vk::CullModeFlags::NONE)
            .add_color_blend_attachment(alpha_blend_attachment())
            .set_render_pass(render_pass, subpass.index());

        let pipeline = pipeline.build(&device)?;
        self.register_pipeline(DISPLAY_LABEL, pipeline);

        Ok(())
    }

    /// Create a labelled view of `image` in the swapchain format. A label
    /// that is already registered returns the existing view.
    pub fn create_image_view(
        &mut self,
        label: &str,
        view_type: vk::ImageViewType,
        image: vk::Image,
    ) -> Result<vk::ImageView> {
        if let Some(&view) = self.image_views.get(label) {
            return Ok(view);
        }

        let create_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(view_type)
            .format(self.format.format)
            .components(vk::ComponentMapping {
                r: vk::ComponentSwizzle::IDENTITY,
                g: vk::ComponentSwizzle::IDENTITY,
                b: vk::ComponentSwizzle::IDENTITY,
                a: vk::ComponentSwizzle::IDENTITY,
            })
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        let view = match unsafe { self.device.device.create_image_view(&create_info, None) } {
            Ok(view) => view,
            Err(e) => {
                self.device.logger().rendering(
                    Severity::Fatal,
                    &format!("Failed to create image view \"{}\": {:?}", label, e),
                );
                return Err(e).context("Failed to create image view");
            }
        };

        self.image_views.insert(label.to_string(), view);
        Ok(view)
    }

    pub fn get_image_view(&self, label: &str) -> Option<vk::ImageView> {
        self.image_views.get(label).copied()
    }

    /// Create a labelled framebuffer covering the swapchain extent. A label
    /// that is already registered returns the cached framebuffer.
    pub fn create_framebuffer(
        &mut self,
        label: &str,
        render_pass: &RenderPass,
        attachments: &[vk::ImageView],
        layers: u32,
    ) -> Result<vk::Framebuffer> {
        if let Some(&framebuffer) = self.framebuffers.get(label) {
            return Ok(framebuffer);
        }

        let create_info = vk::FramebufferCreateInfo::builder()
            .render_pass(render_pass.handle())
            .attachments(attachments)
            .width(self.extent.width)
            .height(self.extent.height)
            .layers(layers);

        let framebuffer = match unsafe { self.device.device.create_framebuffer(&create_info, None) } {
            Ok(framebuffer) => framebuffer,
            Err(e) => {
                self.device.logger().rendering(
                    Severity::Fatal,
                    &format!(
                        "Failed to create framebuffer \"{}\" for render pass \"{}\": {:?}",
                        label,
                        render_pass.name(),
                        e
                    ),
                );
                return Err(e).context("Failed to create framebuffer");
            }
        };

        self.framebuffers.insert(label.to_string(), framebuffer);
        Ok(framebuffer)
    }

    pub fn get_framebuffer(&self, label: &str) -> Option<vk::Framebuffer> {
        self.framebuffers.get(label).copied()
    }

    /// Returns the render pass previously registered under `label`
    pub fn register_render_pass(
        &mut self,
        label: &str,
        render_pass: Rc<RenderPass>,
    ) -> Option<Rc<RenderPass>> {
        self.render_passes.insert(label.to_string(), render_pass)
    }

    pub fn get_render_pass(&self, label: &str) -> Option<Rc<RenderPass>> {
        self.render_passes.get(label).cloned()
    }

    /// Returns the pipeline previously registered under `label`
    pub fn register_pipeline(
        &mut self,
        label: &str,
        pipeline: Rc<GraphicsPipeline>,
    ) -> Option<Rc<GraphicsPipeline>> {
        self.pipelines.insert(label.to_string(), pipeline)
    }

    pub fn get_pipeline(&self, label: &str) -> Option<Rc<GraphicsPipeline>> {
        self.pipelines.get(label).cloned()
    }

    pub fn handle(&self) -> vk::SwapchainKHR {
        self.handle
    }

    pub fn loader(&self) -> &ash::extensions::khr::Swapchain {
        &self.loader
    }

    pub fn format(&self) -> vk::SurfaceFormatKHR {
        self.format
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    pub fn device(&self) -> &Arc<VirtualDevice> {
        &self.device
    }
}

impl Drop for SwapChain {
    fn drop(&mut self) {
        log::info!("Destroying swapchain...");

        let _ = self.device.wait_idle();

        unsafe {
            for (_, framebuffer) in self.framebuffers.drain() {
                self.device.device.destroy_framebuffer(framebuffer, None);
            }
        }

        // Shared objects are destroyed here unless someone else still holds them
        self.pipelines.clear();
        self.render_passes.clear();

        unsafe {
            for (_, view) in self.image_views.drain() {
                self.device.device.destroy_image_view(view, None);
            }
            self.loader.destroy_swapchain(self.handle, None);
        }
    }
}

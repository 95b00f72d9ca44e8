// Virtual Device - logical device and queues for the selected GPU
//
// Responsibilities:
// - One queue per distinct queue family (graphics and present may share)
// - Enable only the optional features the builders negotiate, and only if
//   the GPU supports them
// - Answer capability queries (features, limits, multisample fallback)

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::capabilities::DeviceCapabilities;
use super::instance::VulkanInstance;
use super::pipeline::GraphicsPipelineBuilder;
use super::render_pass::RenderPassBuilder;
use super::selector::{required_device_extensions, PhysicalDeviceCandidate, QueueFamilyIndices};
use crate::logging::{Logger, Severity};

/// Optional features the pipeline and render pass builders know how to use.
/// Each one is requested only when the physical device reports it.
pub fn requested_features(supported: &vk::PhysicalDeviceFeatures) -> vk::PhysicalDeviceFeatures {
    vk::PhysicalDeviceFeatures {
        multi_viewport: supported.multi_viewport,
        depth_clamp: supported.depth_clamp,
        fill_mode_non_solid: supported.fill_mode_non_solid,
        wide_lines: supported.wide_lines,
        sample_rate_shading: supported.sample_rate_shading,
        depth_bounds: supported.depth_bounds,
        alpha_to_one: supported.alpha_to_one,
        logic_op: supported.logic_op,
        tessellation_shader: supported.tessellation_shader,
        ..Default::default()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DeviceQueues {
    pub graphics: vk::Queue,
    pub present: vk::Queue,
}

/// Logical device wrapper with automatic cleanup
pub struct VirtualDevice {
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub queues: DeviceQueues,
    pub queue_families: QueueFamilyIndices,
    capabilities: DeviceCapabilities,
    suitability: u64,
    logger: Arc<dyn Logger>,
    // Keeps the instance alive until the device is gone
    instance: Arc<VulkanInstance>,
}

impl VirtualDevice {
    /// Create the logical device for a selected candidate
    pub fn new(instance: Arc<VulkanInstance>, candidate: PhysicalDeviceCandidate) -> Result<Arc<Self>> {
        let logger = instance.logger().clone();
        let PhysicalDeviceCandidate {
            handle: physical_device,
            capabilities: supported,
            queue_families,
            score,
        } = candidate;

        log::info!("Creating logical device on {}", supported.device_name);

        let (graphics_family, present_family) = match (queue_families.graphics, queue_families.present) {
            (Some(graphics), Some(present)) => (graphics, present),
            _ => {
                logger.rendering(
                    Severity::Fatal,
                    &format!(
                        "GPU \"{}\" was handed to device creation without graphics and present queue families.",
                        supported.device_name
                    ),
                );
                anyhow::bail!("Incomplete queue family indices");
            }
        };

        let queue_priorities = [1.0];
        let queue_create_infos: Vec<_> = queue_families
            .unique_families()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
                    .build()
            })
            .collect();

        let extensions: Vec<_> = required_device_extensions()
            .iter()
            .map(|name| name.as_ptr())
            .collect();

        let enabled_features = requested_features(&supported.features);

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&enabled_features);

        let device = match unsafe {
            instance
                .instance
                .create_device(physical_device, &create_info, None)
        } {
            Ok(device) => device,
            Err(e) => {
                logger.rendering(
                    Severity::Fatal,
                    &format!(
                        "Failed to create logical device on GPU \"{}\": {:?}",
                        supported.device_name, e
                    ),
                );
                return Err(e).context("Failed to create logical device");
            }
        };

        let queues = unsafe {
            DeviceQueues {
                graphics: device.get_device_queue(graphics_family, 0),
                present: device.get_device_queue(present_family, 0),
            }
        };

        Ok(Arc::new(Self {
            device,
            physical_device,
            queues,
            queue_families,
            capabilities: supported.with_features(enabled_features),
            suitability: score,
            logger,
            instance,
        }))
    }

    /// Enabled features and limits of this device
    pub fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    pub fn logger(&self) -> &dyn Logger {
        &*self.logger
    }

    pub fn instance(&self) -> &Arc<VulkanInstance> {
        &self.instance
    }

    pub fn suitability(&self) -> u64 {
        self.suitability
    }

    pub fn get_multisampling_samples_fallback(
        &self,
        requested: vk::SampleCountFlags,
        using_depth: bool,
        using_stencil: bool,
    ) -> vk::SampleCountFlags {
        self.capabilities
            .multisampling_samples_fallback(requested, using_depth, using_stencil)
    }

    pub fn render_pass_builder(&self, name: &str) -> RenderPassBuilder<'_> {
        RenderPassBuilder::new(name, &self.capabilities, &*self.logger)
    }

    pub fn graphics_pipeline_builder(&self, name: &str) -> GraphicsPipelineBuilder<'_> {
        GraphicsPipelineBuilder::new(name, &self.capabilities, &*self.logger)
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }?;
        Ok(())
    }
}

impl Drop for VirtualDevice {
    fn drop(&mut self) {
        log::info!("Destroying logical device...");

        let _ = self.wait_idle();

        unsafe {
            self.device.destroy_device(None);
        }
    }
}

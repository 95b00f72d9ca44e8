// Backend module - Vulkan abstraction layer
//
// Design: Thin wrapper around ash with safety and ergonomics
// Creation order: instance -> surface -> selector -> device -> swapchain,
// with render passes and pipelines built from the device's builders.

pub mod capabilities;
pub mod device;
pub mod instance;
pub mod pipeline;
pub mod render_pass;
pub mod selector;
pub mod shader;
pub mod surface;
pub mod swapchain;

pub use capabilities::DeviceCapabilities;
pub use device::VirtualDevice;
pub use instance::{ValidationConfig, VulkanInstance};
pub use pipeline::{GraphicsPipeline, GraphicsPipelineBuilder};
pub use render_pass::{RenderPass, RenderPassBuilder, SubpassBuilder, SubpassId, SubpassTarget};
pub use selector::{DeviceSelector, PhysicalDeviceCandidate, QueueFamilyIndices};
pub use surface::{DrawableSurface, PresentationSurface};
pub use swapchain::{SwapChain, SwapChainSettings, SwapChainSupportDetails};

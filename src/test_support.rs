// Shared fixtures for unit tests: a logger that remembers what it was told
// and capability snapshots for imaginary GPUs.

use crate::backend::capabilities::DeviceCapabilities;
use crate::logging::{Domain, Logger, Severity};
use ash::vk;
use parking_lot::Mutex;

#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub message: String,
    pub pipe: String,
    pub domain: Domain,
    pub severity: Severity,
}

#[derive(Debug, Default)]
pub struct RecordingLogger {
    records: Mutex<Vec<LogRecord>>,
}

impl RecordingLogger {
    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().clone()
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.records
            .lock()
            .iter()
            .filter(|r| r.severity == severity)
            .count()
    }
}

impl Logger for RecordingLogger {
    fn log(&self, message: &str, pipe: &str, domain: Domain, severity: Severity) {
        self.records.lock().push(LogRecord {
            message: message.to_string(),
            pipe: pipe.to_string(),
            domain,
            severity,
        });
    }
}

/// A device that supports every optional feature the builders negotiate.
pub fn capable_gpu() -> DeviceCapabilities {
    let all_samples = vk::SampleCountFlags::TYPE_1
        | vk::SampleCountFlags::TYPE_2
        | vk::SampleCountFlags::TYPE_4
        | vk::SampleCountFlags::TYPE_8;

    DeviceCapabilities {
        device_name: "Test Discrete GPU".to_string(),
        device_type: vk::PhysicalDeviceType::DISCRETE_GPU,
        api_version: vk::API_VERSION_1_3,
        features: vk::PhysicalDeviceFeatures {
            multi_viewport: vk::TRUE,
            depth_clamp: vk::TRUE,
            fill_mode_non_solid: vk::TRUE,
            wide_lines: vk::TRUE,
            sample_rate_shading: vk::TRUE,
            depth_bounds: vk::TRUE,
            alpha_to_one: vk::TRUE,
            logic_op: vk::TRUE,
            tessellation_shader: vk::TRUE,
            sampler_anisotropy: vk::TRUE,
            ..Default::default()
        },
        limits: vk::PhysicalDeviceLimits {
            max_viewports: 16,
            max_image_dimension2_d: 16384,
            line_width_range: [1.0, 8.0],
            framebuffer_color_sample_counts: all_samples,
            framebuffer_depth_sample_counts: all_samples,
            framebuffer_stencil_sample_counts: all_samples,
            ..Default::default()
        },
    }
}

/// A device that supports none of the optional features and only 1x/4x MSAA.
pub fn minimal_gpu() -> DeviceCapabilities {
    let samples = vk::SampleCountFlags::TYPE_1 | vk::SampleCountFlags::TYPE_4;

    DeviceCapabilities {
        device_name: "Test Integrated GPU".to_string(),
        device_type: vk::PhysicalDeviceType::INTEGRATED_GPU,
        api_version: vk::API_VERSION_1_1,
        features: vk::PhysicalDeviceFeatures::default(),
        limits: vk::PhysicalDeviceLimits {
            max_viewports: 1,
            max_image_dimension2_d: 8192,
            line_width_range: [1.0, 1.0],
            framebuffer_color_sample_counts: samples,
            framebuffer_depth_sample_counts: samples,
            framebuffer_stencil_sample_counts: vk::SampleCountFlags::TYPE_1,
            ..Default::default()
        },
    }
}

// Device capabilities - what a physical device can do
//
// Snapshot of the features and limits queried from a physical device.
// Candidates carry the *supported* set; a VirtualDevice carries the
// *enabled* set (what was actually requested at device creation), and every
// builder negotiates against that.

use ash::vk;
use std::ffi::CStr;

/// Sample counts from highest to lowest
const SAMPLE_COUNTS_DESCENDING: [vk::SampleCountFlags; 7] = [
    vk::SampleCountFlags::TYPE_64,
    vk::SampleCountFlags::TYPE_32,
    vk::SampleCountFlags::TYPE_16,
    vk::SampleCountFlags::TYPE_8,
    vk::SampleCountFlags::TYPE_4,
    vk::SampleCountFlags::TYPE_2,
    vk::SampleCountFlags::TYPE_1,
];

#[derive(Debug, Clone)]
pub struct DeviceCapabilities {
    pub device_name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub api_version: u32,
    pub features: vk::PhysicalDeviceFeatures,
    pub limits: vk::PhysicalDeviceLimits,
}

impl DeviceCapabilities {
    /// Query features and properties of a physical device.
    ///
    /// # Safety
    /// `physical_device` must have been enumerated from `instance`.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let properties = instance.get_physical_device_properties(physical_device);
        let features = instance.get_physical_device_features(physical_device);

        let device_name = CStr::from_ptr(properties.device_name.as_ptr())
            .to_string_lossy()
            .into_owned();

        Self {
            device_name,
            device_type: properties.device_type,
            api_version: properties.api_version,
            features,
            limits: properties.limits,
        }
    }

    /// Same device, but only `enabled` features reported as available.
    pub fn with_features(&self, enabled: vk::PhysicalDeviceFeatures) -> Self {
        Self {
            features: enabled,
            ..self.clone()
        }
    }

    /// Highest sample count the device supports that is <= `requested` and
    /// valid for a framebuffer using depth and/or stencil. Falls back toward
    /// a single sample.
    pub fn multisampling_samples_fallback(
        &self,
        requested: vk::SampleCountFlags,
        using_depth: bool,
        using_stencil: bool,
    ) -> vk::SampleCountFlags {
        let mut supported = self.limits.framebuffer_color_sample_counts;
        if using_depth {
            supported = supported & self.limits.framebuffer_depth_sample_counts;
        }
        if using_stencil {
            supported = supported & self.limits.framebuffer_stencil_sample_counts;
        }

        SAMPLE_COUNTS_DESCENDING
            .iter()
            .copied()
            .find(|&count| count.as_raw() <= requested.as_raw() && supported.contains(count))
            .unwrap_or(vk::SampleCountFlags::TYPE_1)
    }

    /// Largest color sample count, used for scoring
    pub fn max_color_samples(&self) -> u32 {
        SAMPLE_COUNTS_DESCENDING
            .iter()
            .find(|&&count| self.limits.framebuffer_color_sample_counts.contains(count))
            .map(|count| count.as_raw())
            .unwrap_or(1)
    }

    pub fn api_version_string(&self) -> String {
        format!(
            "{}.{}.{}",
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version)
        )
    }
}

/// True for formats with a depth aspect
pub fn format_has_depth(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D16_UNORM
            | vk::Format::X8_D24_UNORM_PACK32
            | vk::Format::D32_SFLOAT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

/// True for formats with a stencil aspect
pub fn format_has_stencil(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::S8_UINT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{capable_gpu, minimal_gpu};

    #[test]
    fn fallback_keeps_supported_request() {
        let caps = capable_gpu();
        let samples = caps.multisampling_samples_fallback(vk::SampleCountFlags::TYPE_8, true, true);
        assert_eq!(samples, vk::SampleCountFlags::TYPE_8);
    }

    #[test]
    fn fallback_steps_down_to_highest_supported() {
        let caps = minimal_gpu();
        let samples = caps.multisampling_samples_fallback(vk::SampleCountFlags::TYPE_8, false, false);
        assert_eq!(samples, vk::SampleCountFlags::TYPE_4);
    }

    #[test]
    fn fallback_accounts_for_stencil_usage() {
        // minimal_gpu only has 1x stencil sampling
        let caps = minimal_gpu();
        let with_depth = caps.multisampling_samples_fallback(vk::SampleCountFlags::TYPE_4, true, false);
        let with_stencil = caps.multisampling_samples_fallback(vk::SampleCountFlags::TYPE_4, true, true);
        assert_eq!(with_depth, vk::SampleCountFlags::TYPE_4);
        assert_eq!(with_stencil, vk::SampleCountFlags::TYPE_1);
    }

    #[test]
    fn fallback_never_goes_above_request() {
        let caps = capable_gpu();
        let samples = caps.multisampling_samples_fallback(vk::SampleCountFlags::TYPE_2, false, false);
        assert_eq!(samples, vk::SampleCountFlags::TYPE_2);
    }

    #[test]
    fn fallback_defaults_to_single_sample() {
        let mut caps = minimal_gpu();
        caps.limits.framebuffer_color_sample_counts = vk::SampleCountFlags::empty();
        let samples = caps.multisampling_samples_fallback(vk::SampleCountFlags::TYPE_4, false, false);
        assert_eq!(samples, vk::SampleCountFlags::TYPE_1);
    }

    #[test]
    fn max_color_samples_reports_highest_bit() {
        assert_eq!(capable_gpu().max_color_samples(), 8);
        assert_eq!(minimal_gpu().max_color_samples(), 4);
    }

    #[test]
    fn depth_and_stencil_formats() {
        assert!(format_has_depth(vk::Format::D32_SFLOAT));
        assert!(!format_has_stencil(vk::Format::D32_SFLOAT));
        assert!(format_has_depth(vk::Format::D24_UNORM_S8_UINT));
        assert!(format_has_stencil(vk::Format::D24_UNORM_S8_UINT));
        assert!(!format_has_depth(vk::Format::B8G8R8A8_SRGB));
    }
}

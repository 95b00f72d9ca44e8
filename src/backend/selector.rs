// Device Selector - pick the GPU we render with
//
// Every physical device is queried once, filtered (graphics + present
// queues, swapchain extension, usable surface), scored, and the best score
// wins. Ties go to the device enumerated first.

use anyhow::{Context, Result};
use ash::vk;
use std::collections::{BTreeMap, HashSet};
use std::ffi::CStr;

use super::capabilities::DeviceCapabilities;
use super::instance::VulkanInstance;
use super::surface::PresentationSurface;
use super::swapchain::SwapChainSupportDetails;
use crate::logging::Severity;

/// Device extensions every candidate must support
pub fn required_device_extensions() -> Vec<&'static CStr> {
    vec![ash::extensions::khr::Swapchain::name()]
}

/// Queue family indices a device needs for drawing and presenting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: Option<u32>,
    pub present: Option<u32>,
    /// Whether the device exposes every required device extension
    pub extensions_supported: bool,
}

impl QueueFamilyIndices {
    /// Resolve indices from a device's queue families. A family that can do
    /// both graphics and present is preferred over two separate ones.
    pub fn from_families(
        families: &[vk::QueueFamilyProperties],
        present_support: &[bool],
        extensions_supported: bool,
    ) -> Self {
        let is_graphics = |family: &vk::QueueFamilyProperties| {
            family.queue_count > 0 && family.queue_flags.contains(vk::QueueFlags::GRAPHICS)
        };
        let can_present = |index: usize| present_support.get(index).copied().unwrap_or(false);

        let shared = families
            .iter()
            .enumerate()
            .find(|&(i, family)| is_graphics(family) && can_present(i))
            .map(|(i, _)| i as u32);

        if let Some(index) = shared {
            return Self {
                graphics: Some(index),
                present: Some(index),
                extensions_supported,
            };
        }

        Self {
            graphics: families
                .iter()
                .position(|family| is_graphics(family))
                .map(|i| i as u32),
            present: (0..families.len()).find(|&i| can_present(i)).map(|i| i as u32),
            extensions_supported,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.graphics.is_some() && self.present.is_some()
    }

    pub fn has_required(&self) -> bool {
        self.is_complete() && self.extensions_supported
    }

    /// Distinct family indices, graphics first
    pub fn unique_families(&self) -> Vec<u32> {
        let mut unique = Vec::with_capacity(2);
        for index in [self.graphics, self.present].into_iter().flatten() {
            if !unique.contains(&index) {
                unique.push(index);
            }
        }
        unique
    }

    /// Sharing mode for images touched by both queues: concurrent across the
    /// distinct families, exclusive when they are the same family.
    pub fn image_sharing(&self) -> (vk::SharingMode, Vec<u32>) {
        let families = self.unique_families();
        if families.len() > 1 {
            (vk::SharingMode::CONCURRENT, families)
        } else {
            (vk::SharingMode::EXCLUSIVE, Vec::new())
        }
    }
}

/// A physical device that passed filtering, with its score
#[derive(Debug, Clone)]
pub struct PhysicalDeviceCandidate {
    pub handle: vk::PhysicalDevice,
    pub capabilities: DeviceCapabilities,
    pub queue_families: QueueFamilyIndices,
    pub score: u64,
}

/// Device type dominates; larger textures and more MSAA break ties between
/// devices of the same type.
pub fn suitability_score(caps: &DeviceCapabilities) -> u64 {
    let type_weight = match caps.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 50,
        vk::PhysicalDeviceType::CPU => 10,
        _ => 1,
    };

    let texture_bonus = u64::from(caps.limits.max_image_dimension2_d) / 1024;
    let msaa_bonus = u64::from(caps.max_color_samples());

    type_weight + texture_bonus + msaa_bonus
}

/// Highest score wins; on equal scores the first candidate seen is kept.
pub fn pick_best<I>(candidates: I) -> Option<PhysicalDeviceCandidate>
where
    I: IntoIterator<Item = PhysicalDeviceCandidate>,
{
    let mut by_score: BTreeMap<u64, PhysicalDeviceCandidate> = BTreeMap::new();
    for candidate in candidates {
        if candidate.queue_families.has_required() {
            by_score.entry(candidate.score).or_insert(candidate);
        }
    }
    by_score.into_iter().next_back().map(|(_, candidate)| candidate)
}

pub struct DeviceSelector<'a> {
    instance: &'a VulkanInstance,
    surface: &'a PresentationSurface,
}

impl<'a> DeviceSelector<'a> {
    pub fn new(instance: &'a VulkanInstance, surface: &'a PresentationSurface) -> Self {
        Self { instance, surface }
    }

    /// All suitable devices in enumeration order
    pub fn candidates(&self) -> Result<Vec<PhysicalDeviceCandidate>> {
        let devices = unsafe { self.instance.instance.enumerate_physical_devices() }
            .context("Failed to enumerate physical devices")?;

        let mut candidates = Vec::with_capacity(devices.len());
        for device in devices {
            if let Some(candidate) = self.evaluate(device)? {
                candidates.push(candidate);
            }
        }
        Ok(candidates)
    }

    /// Pick the best device for the surface
    pub fn select(&self) -> Result<PhysicalDeviceCandidate> {
        let candidates = self.candidates()?;

        match pick_best(candidates) {
            Some(candidate) => {
                log::info!(
                    "Selected GPU: {} (score {}, Vulkan {})",
                    candidate.capabilities.device_name,
                    candidate.score,
                    candidate.capabilities.api_version_string()
                );
                Ok(candidate)
            }
            None => {
                self.instance.logger().rendering(
                    Severity::Fatal,
                    "No physical device supports graphics, presentation to this surface and the swapchain extension.",
                );
                anyhow::bail!("No suitable GPU found")
            }
        }
    }

    fn evaluate(&self, device: vk::PhysicalDevice) -> Result<Option<PhysicalDeviceCandidate>> {
        let instance = &self.instance.instance;
        let capabilities = unsafe { DeviceCapabilities::query(instance, device) };

        let families = unsafe { instance.get_physical_device_queue_family_properties(device) };
        let mut present_support = Vec::with_capacity(families.len());
        for index in 0..families.len() as u32 {
            let supported = unsafe {
                self.surface.loader.get_physical_device_surface_support(
                    device,
                    index,
                    self.surface.handle,
                )
            }
            .context("Failed to query surface support")?;
            present_support.push(supported);
        }

        let extensions_supported = Self::check_device_extension_support(instance, device)?;
        let queue_families =
            QueueFamilyIndices::from_families(&families, &present_support, extensions_supported);

        if !queue_families.has_required() {
            log::info!(
                "Skipping GPU {}: missing queue families or device extensions",
                capabilities.device_name
            );
            return Ok(None);
        }

        let support = SwapChainSupportDetails::query(&self.surface.loader, device, self.surface.handle)?;
        if !support.is_adequate() {
            log::info!(
                "Skipping GPU {}: no surface formats or present modes",
                capabilities.device_name
            );
            return Ok(None);
        }

        let score = suitability_score(&capabilities);
        log::debug!("GPU {} scored {}", capabilities.device_name, score);

        Ok(Some(PhysicalDeviceCandidate {
            handle: device,
            capabilities,
            queue_families,
            score,
        }))
    }

    fn check_device_extension_support(
        instance: &ash::Instance,
        device: vk::PhysicalDevice,
    ) -> Result<bool> {
        let properties = unsafe { instance.enumerate_device_extension_properties(device) }
            .context("Failed to enumerate device extensions")?;

        let available: HashSet<&CStr> = properties
            .iter()
            .map(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) })
            .collect();

        Ok(required_device_extensions()
            .iter()
            .all(|required| available.contains(required)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{capable_gpu, minimal_gpu};
    use ash::vk::Handle;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    fn candidate(raw: u64, score: u64) -> PhysicalDeviceCandidate {
        PhysicalDeviceCandidate {
            handle: vk::PhysicalDevice::from_raw(raw),
            capabilities: capable_gpu(),
            queue_families: QueueFamilyIndices {
                graphics: Some(0),
                present: Some(0),
                extensions_supported: true,
            },
            score,
        }
    }

    #[test]
    fn prefers_family_with_graphics_and_present() {
        let families = [
            family(vk::QueueFlags::GRAPHICS),
            family(vk::QueueFlags::COMPUTE),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
        ];
        let indices = QueueFamilyIndices::from_families(&families, &[false, true, true], true);
        assert_eq!(indices.graphics, Some(2));
        assert_eq!(indices.present, Some(2));
    }

    #[test]
    fn separate_families_when_none_does_both() {
        let families = [family(vk::QueueFlags::GRAPHICS), family(vk::QueueFlags::TRANSFER)];
        let indices = QueueFamilyIndices::from_families(&families, &[false, true], true);
        assert_eq!(indices.graphics, Some(0));
        assert_eq!(indices.present, Some(1));
        assert!(indices.is_complete());
        assert_eq!(indices.unique_families(), vec![0, 1]);
    }

    #[test]
    fn incomplete_without_present_support() {
        let families = [family(vk::QueueFlags::GRAPHICS)];
        let indices = QueueFamilyIndices::from_families(&families, &[false], true);
        assert!(!indices.is_complete());
        assert!(!indices.has_required());
    }

    #[test]
    fn has_required_needs_extensions() {
        let families = [family(vk::QueueFlags::GRAPHICS)];
        let indices = QueueFamilyIndices::from_families(&families, &[true], false);
        assert!(indices.is_complete());
        assert!(!indices.has_required());
    }

    #[test]
    fn sharing_is_exclusive_for_one_family() {
        let indices = QueueFamilyIndices {
            graphics: Some(3),
            present: Some(3),
            extensions_supported: true,
        };
        assert_eq!(indices.unique_families(), vec![3]);
        assert_eq!(indices.image_sharing(), (vk::SharingMode::EXCLUSIVE, vec![]));
    }

    #[test]
    fn sharing_is_concurrent_for_two_families() {
        let indices = QueueFamilyIndices {
            graphics: Some(0),
            present: Some(2),
            extensions_supported: true,
        };
        assert_eq!(indices.image_sharing(), (vk::SharingMode::CONCURRENT, vec![0, 2]));
    }

    #[test]
    fn highest_score_is_selected() {
        let chosen = pick_best(vec![candidate(1, 10), candidate(2, 55)]).unwrap();
        assert_eq!(chosen.handle.as_raw(), 2);
    }

    #[test]
    fn ties_go_to_first_enumerated() {
        let chosen = pick_best(vec![candidate(7, 40), candidate(8, 40), candidate(9, 12)]).unwrap();
        assert_eq!(chosen.handle.as_raw(), 7);
    }

    #[test]
    fn incomplete_candidates_are_never_selected() {
        let mut broken = candidate(1, 900);
        broken.queue_families.present = None;
        let chosen = pick_best(vec![broken, candidate(2, 5)]).unwrap();
        assert_eq!(chosen.handle.as_raw(), 2);
        assert!(pick_best(Vec::new()).is_none());
    }

    #[test]
    fn discrete_outscores_integrated() {
        assert!(suitability_score(&capable_gpu()) > suitability_score(&minimal_gpu()));
        // 1000 + 16384/1024 + 8
        assert_eq!(suitability_score(&capable_gpu()), 1024);
        // 100 + 8192/1024 + 4
        assert_eq!(suitability_score(&minimal_gpu()), 112);
    }
}

// =============================================================================
// TRITIUM RENDER - GPU resource negotiation for the Tritium engine
// =============================================================================
//
// Picks a GPU, creates the logical device and swapchain, and turns builder
// configuration into immutable render passes and graphics pipelines,
// downgrading optional features the device lacks instead of failing.
//
// LAYOUT:
//   logging   - Logger contract (pipe, domain, severity)
//   config    - config.toml
//   backend   - Vulkan wrappers (instance, selector, device, builders, swapchain)
//   engine    - window, game loop hooks, Vulkan render backend

pub mod backend;
pub mod config;
pub mod engine;
pub mod logging;

#[cfg(test)]
mod test_support;

pub const ENGINE_NAME: &str = "Tritium";
pub const ENGINE_VERSION_MAJOR: u32 = 0;
pub const ENGINE_VERSION_MINOR: u32 = 0;
pub const ENGINE_VERSION_PATCH: u32 = 0;
pub const ENGINE_VERSION_IDENTIFIER: &str = "dev";

/// "major.minor.patch", with "-identifier" appended when there is one
pub fn format_version(major: u32, minor: u32, patch: u32, identifier: &str) -> String {
    if identifier.is_empty() {
        format!("{}.{}.{}", major, minor, patch)
    } else {
        format!("{}.{}.{}-{}", major, minor, patch, identifier)
    }
}

pub fn engine_version_string() -> String {
    format_version(
        ENGINE_VERSION_MAJOR,
        ENGINE_VERSION_MINOR,
        ENGINE_VERSION_PATCH,
        ENGINE_VERSION_IDENTIFIER,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_version() {
        assert_eq!(engine_version_string(), "0.0.0-dev");
        assert_eq!(format_version(1, 2, 3, ""), "1.2.3");
    }
}

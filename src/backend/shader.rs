// Shader module loading
//
// Shaders are compiled to SPIR-V ahead of time and read from disk here.
// Modules created from them are transient: the pipeline builder destroys
// them as soon as the pipeline exists.

use anyhow::{Context, Result};
use ash::vk;
use std::io::Cursor;
use std::path::Path;

/// Read a compiled SPIR-V binary. Missing, unreadable, empty or malformed
/// files are hard errors.
pub fn read_binary(path: &Path) -> Result<Vec<u32>> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to open shader file: {}", path.display()))?;

    // read_spv handles alignment, word size and the magic number
    let code = ash::util::read_spv(&mut Cursor::new(&bytes))
        .with_context(|| format!("Shader file is not valid SPIR-V: {}", path.display()))?;

    if code.is_empty() {
        anyhow::bail!("Shader file is empty: {}", path.display());
    }

    Ok(code)
}

/// Create a shader module from SPIR-V words
pub fn create_shader_module(device: &ash::Device, code: &[u32]) -> Result<vk::ShaderModule> {
    let create_info = vk::ShaderModuleCreateInfo::builder().code(code);

    unsafe {
        device
            .create_shader_module(&create_info, None)
            .context("Failed to create shader module")
    }
}

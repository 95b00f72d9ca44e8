// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// This module handles loading and parsing configuration from config.toml.
// Provides sensible defaults if config file is missing or has errors.

use anyhow::{Context, Result};
use ash::vk;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::backend::instance::ValidationConfig;
use crate::backend::swapchain::{DisplayPipelineSettings, SwapChainSettings};

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub debug: DebugConfig,
}

/// Window settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: crate::ENGINE_NAME.to_string(),
            width: 1280,
            height: 720,
            fullscreen: false,
        }
    }
}

/// Graphics settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub present_mode: String,
    pub polygon_mode: String,
    pub line_width: f32,
    pub vertex_shader: PathBuf,
    pub fragment_shader: PathBuf,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_mode: "mailbox".to_string(),
            polygon_mode: "fill".to_string(),
            line_width: 1.0,
            vertex_shader: PathBuf::from("shaders/display.vert.spv"),
            fragment_shader: PathBuf::from("shaders/display.frag.spv"),
        }
    }
}

/// Debug settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub layer_names: Vec<String>,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            layer_names: vec!["VK_LAYER_KHRONOS_validation".to_string()],
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {:#}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    /// Get present mode as Vulkan enum
    pub fn get_present_mode(&self) -> vk::PresentModeKHR {
        match self.graphics.present_mode.to_lowercase().as_str() {
            "immediate" => vk::PresentModeKHR::IMMEDIATE,
            "mailbox" => vk::PresentModeKHR::MAILBOX,
            "fifo" => vk::PresentModeKHR::FIFO,
            "fifo_relaxed" => vk::PresentModeKHR::FIFO_RELAXED,
            _ => {
                log::warn!(
                    "Unknown present mode '{}', defaulting to FIFO",
                    self.graphics.present_mode
                );
                vk::PresentModeKHR::FIFO
            }
        }
    }

    /// Get polygon mode as Vulkan enum
    pub fn get_polygon_mode(&self) -> vk::PolygonMode {
        match self.graphics.polygon_mode.to_lowercase().as_str() {
            "fill" => vk::PolygonMode::FILL,
            "line" => vk::PolygonMode::LINE,
            "point" => vk::PolygonMode::POINT,
            _ => {
                log::warn!(
                    "Unknown polygon mode '{}', defaulting to FILL",
                    self.graphics.polygon_mode
                );
                vk::PolygonMode::FILL
            }
        }
    }

    pub fn validation(&self) -> ValidationConfig {
        ValidationConfig {
            enabled: self.debug.validation_layers,
            layer_names: self.debug.layer_names.clone(),
        }
    }

    /// Swapchain settings including the display pipeline
    pub fn swap_chain_settings(&self) -> SwapChainSettings {
        SwapChainSettings {
            preferred_present_mode: self.get_present_mode(),
            display: Some(DisplayPipelineSettings {
                vertex_shader: self.graphics.vertex_shader.clone(),
                fragment_shader: self.graphics.fragment_shader.clone(),
                polygon_mode: self.get_polygon_mode(),
                line_width: self.graphics.line_width,
            }),
            ..SwapChainSettings::default()
        }
    }
}

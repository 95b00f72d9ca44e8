// =============================================================================
// TRITIUM RUNTIME - opens a window on the Vulkan render backend
// =============================================================================
//
// FLOW:
// 1. Initialize logging (env_logger, RUST_LOG overrides the Info default)
// 2. Load config.toml (defaults if missing)
// 3. Build the progressive render backend from the config
// 4. Engine::start_window runs the game loop until the window closes

use anyhow::Result;
use std::sync::Arc;

use tritium_render::config::Config;
use tritium_render::engine::{ApplicationInfo, Engine, ProgressiveRenderBackend};
use tritium_render::logging::{LogCrateLogger, Logger};
use tritium_render::{engine_version_string, ENGINE_NAME};

fn main() -> Result<()> {
    init_logging();
    log::info!("Runtime starting... {} Engine v{}", ENGINE_NAME, engine_version_string());

    let config = Config::load();
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );
    log::info!("Present mode: {}", config.graphics.present_mode);

    let logger: Arc<dyn Logger> = Arc::new(LogCrateLogger);
    let backend = ProgressiveRenderBackend::from_config(&config, logger.clone());

    let mut application = ApplicationInfo::new(&config.window.title);
    application.description = "Tritium test window".to_string();

    let mut engine = Engine::new(backend, logger, application);
    engine.set_fullscreen(config.window.fullscreen);
    engine.start_window(&config.window.title, config.window.width, config.window.height)
}

fn init_logging() {
    use env_logger::Builder;
    use log::LevelFilter;

    let mut builder = Builder::new();
    builder.filter_level(LevelFilter::Info);
    builder.parse_default_env();
    builder.init();
}

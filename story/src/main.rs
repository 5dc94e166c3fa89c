//! Illustrated interactive story in the terminal.
//!
//! Story text comes from a local LM Studio server; scene illustrations come
//! from a local ComfyUI server and are printed as image URLs when they are
//! ready.
//!
//! ```bash
//! cargo run -p story -- --opening "I wake up on a drifting raft"
//! ```

mod headless;

use std::sync::Arc;
use story_core::{ComfyUiIllustrator, LmStudioNarrator, StoryConfig, StoryTeller};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        return Ok(());
    }

    let options = headless::parse_options_from_args(&args);

    let mut config = StoryConfig::from_env();
    if let Some(instructions) = &options.guiding_instructions {
        config = config.with_guiding_instructions(instructions.clone());
    }
    if options.no_images {
        config = config.with_auto_illustrate(false);
    }

    let narrator = LmStudioNarrator::new(lmstudio::LmStudio::from_env()?);
    let illustrator = ComfyUiIllustrator::new(comfyui::ComfyUi::from_env()?);
    info!(
        lmstudio = narrator.client().base_url(),
        model = narrator.client().model(),
        comfyui = illustrator.client().base_url(),
        "services configured"
    );

    let teller = StoryTeller::new(config, Arc::new(narrator), Arc::new(illustrator))?;
    headless::run_headless(teller, options).await
}

fn print_help() {
    println!("Illustrated interactive story");
    println!();
    println!("USAGE:");
    println!("    story [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    --opening <text>  First action of the story");
    println!("    --system <text>   Guiding instructions for the storyteller");
    println!("    --no-images       Do not illustrate turns automatically");
    println!("    -h, --help        Show this help");
    println!();
    println!("ENVIRONMENT:");
    println!("    LMSTUDIO_BASE_URL           default http://localhost:1234/v1");
    println!("    LMSTUDIO_MODEL              default local-model");
    println!("    COMFYUI_BASE_URL            default http://127.0.0.1:8188");
    println!("    COMFYUI_CHECKPOINT          default sd_xl_base_1.0.safetensors");
    println!("    STORY_AUTO_ILLUSTRATE       on/off");
    println!("    STORY_GUIDING_INSTRUCTIONS  replaces the default instructions");
    println!("    RUST_LOG                    log filter, default warn");
}

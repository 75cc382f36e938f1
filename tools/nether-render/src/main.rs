//! Nether Render
//!
//! Builds a small demo song in code, reports its length and renders it to
//! a WAV file through the tracker replayer.

mod cli;
mod demo;
mod render;

use anyhow::Result;
use clap::Parser;
use nether_replay::{MixerConfig, Song};

use cli::{Cli, Commands};

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Render { out, mixer, loops } => {
            let config = mixer.to_config()?;
            let rendered = render::render_to_wav(demo::module(), config, loops, &out)?;
            println!(
                "Wrote {} ({} frames, {:.2} s)",
                out.display(),
                rendered.frames,
                rendered.seconds()
            );
        }
        Commands::Length => {
            let song = Song::new(demo::module(), MixerConfig::default());
            println!(
                "{}: {} s ({} ms)",
                song.module().name,
                song.get_length(),
                song.length_ms()
            );
        }
        Commands::Config => {
            print!("{}", MixerConfig::default().to_toml());
        }
    }

    Ok(())
}

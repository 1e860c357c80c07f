//! `fibsem` command-line tool.
//!
//! # Commands
//!
//! - `fibsem state` - print the current microscope state as JSON
//! - `fibsem move --dx <m> --dy <m> --beam <beam>` - corrected stage move
//! - `fibsem acquire --beam <beam>` - acquire an image and print its metadata
//! - `fibsem restore <file>` - apply a saved microscope state
//!
//! Settings come from `--config` (default `config/system.toml`) and
//! `FIBSEM_*` environment variables.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;

use fibsem_hal::backends::{connect_microscope, NativeBridge};
use fibsem_hal::config::MicroscopeSettings;
use fibsem_hal::logging::init_tracing;
use fibsem_hal::session::Session;
use fibsem_hal::state::{BeamType, ImageSettings};

/// FIB-SEM control
#[derive(Parser)]
#[command(name = "fibsem")]
#[command(about = "Drive a FIB-SEM through the hardware abstraction layer", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = "config/system.toml")]
    config: PathBuf,

    /// Use the simulated vendor clients
    #[arg(long)]
    simulated: bool,

    /// Directory sessions are created in
    #[arg(long, default_value = "sessions")]
    session_root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the current microscope state as JSON
    State {
        /// Also save it into the session directory
        #[arg(long)]
        save: bool,
    },

    /// Move the stage so the sample shifts by (dx, dy) in the beam's image
    Move {
        /// Image-plane x displacement (m)
        #[arg(long, allow_hyphen_values = true)]
        dx: f64,

        /// Image-plane y displacement (m)
        #[arg(long, allow_hyphen_values = true)]
        dy: f64,

        /// Beam whose image plane the displacement refers to
        #[arg(long, default_value = "electron")]
        beam: BeamType,
    },

    /// Acquire an image with the configured imaging defaults
    Acquire {
        /// Beam to image with (defaults to the configured beam)
        #[arg(long)]
        beam: Option<BeamType>,

        /// Horizontal field width override (m)
        #[arg(long)]
        hfw: Option<f64>,
    },

    /// Apply a microscope state saved with `state --save`
    Restore {
        /// Saved state file
        #[arg(name = "FILE")]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = MicroscopeSettings::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if cli.simulated {
        settings.system.simulated = true;
    }

    let session = Session::create(&cli.session_root, "fibsem")?;
    init_tracing(&settings.logging, Some(session.path()))?;
    session.save_metadata(&settings)?;

    let mut microscope = connect_microscope(&settings.system, &NativeBridge)
        .await
        .with_context(|| {
            format!(
                "connecting to {} at {}:{}",
                settings.system.manufacturer,
                settings.system.ip_address,
                settings.system.port()
            )
        })?;

    match cli.command {
        Commands::State { save } => {
            let state = microscope.get_current_state().await?;
            println!("{}", serde_json::to_string_pretty(&state)?);
            if save {
                let path = session.save_state(&state, "microscope_state")?;
                info!("State saved to {}", path.display());
            }
        }
        Commands::Move { dx, dy, beam } => {
            microscope.stable_move(&settings, dx, dy, beam).await?;
            let position = microscope.get_stage_position().await?;
            println!("{}", serde_json::to_string_pretty(&position)?);
        }
        Commands::Acquire { beam, hfw } => {
            let image_settings = ImageSettings {
                beam_type: beam.unwrap_or(settings.imaging.beam_type),
                hfw: hfw.unwrap_or(settings.imaging.hfw),
                ..settings.imaging.clone()
            };
            let image = microscope.acquire_image(&image_settings).await?;
            let summary = json!({
                "beam": image.settings.beam_type,
                "resolution": image.settings.resolution,
                "hfw": image.settings.hfw,
                "dwell_time": image.settings.dwell_time,
                "bytes": image.data.pixels.len(),
                "state": image.state,
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Restore { file } => {
            let state = Session::load_state(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            microscope.set_microscope_state(&state).await?;
            info!("Restored state from {}", file.display());
        }
    }

    microscope.disconnect().await?;
    Ok(())
}

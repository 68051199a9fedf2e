//! # hwc-sim - Exynos composer simulator
//!
//! Plays a scene file on a device wired to simulated hardware and prints
//! what the composer decided for every frame as JSON.

use anyhow::{Context, Result};
use clap::Parser;
use exynos_hwc::config::HwcConfig;
use exynos_hwc::scene::{run_scene, Scene};
use exynos_hwc::simulated::SimulatedDevice;
use log::{error, info, warn};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "hwc-sim")]
#[command(about = "Runs a layer scene through the Exynos hardware composer core")]
#[command(version)]
struct Cli {
    /// Scene file (TOML)
    scene: PathBuf,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Frames to run, overriding the scene
    #[arg(short, long)]
    frames: Option<u32>,

    /// Compose everything on the GPU
    #[arg(long)]
    force_gpu: bool,

    /// Disable a processing unit by name (repeatable)
    #[arg(long = "disable", value_name = "UNIT")]
    disabled: Vec<String>,

    /// Pretty-print the JSON report
    #[arg(long)]
    pretty: bool,

    /// Append the device dump after the report
    #[arg(long)]
    dump: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    if cli.debug {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    info!("🚀 Starting hwc-sim {}", exynos_hwc::VERSION);

    let config = match &cli.config {
        Some(path) => {
            let config = HwcConfig::load(path)?;
            info!("✅ Configuration loaded from: {}", path.display());
            config
        }
        None => {
            info!("📝 Using default configuration");
            HwcConfig::default()
        }
    };

    let mut scene = Scene::load(&cli.scene)?;
    if let Some(frames) = cli.frames {
        scene.frames = frames;
    }

    let sim = SimulatedDevice::new(&config).context("Failed to bring the device up")?;
    let control = sim.device.control();
    if cli.force_gpu {
        control.set_force_gpu(true);
        info!("🚫 Hardware composition disabled via CLI flag");
    }
    for unit in &cli.disabled {
        if sim.device.mpp_infos().iter().all(|m| &m.name != unit) {
            warn!("unknown processing unit {}", unit);
        }
        control.set_mpp_enabled(unit, false);
    }

    let reports = match run_scene(&sim.device, &scene) {
        Ok(reports) => reports,
        Err(e) => {
            error!("❌ Scene failed: {:#}", e);
            eprintln!("{}", sim.device.dump());
            return Err(e);
        }
    };

    let json = if cli.pretty {
        serde_json::to_string_pretty(&reports)?
    } else {
        serde_json::to_string(&reports)?
    };
    println!("{}", json);

    if cli.dump {
        println!("{}", sim.device.dump());
    }

    let stats = sim.device.tracker().stats();
    info!(
        "👋 {} frames, {} fences created, {} leaks",
        reports.len(),
        stats.created,
        stats.leaks_reported
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["hwc-sim", "scene.toml"]).unwrap();
        assert_eq!(cli.scene, PathBuf::from("scene.toml"));
        assert!(!cli.debug);
        assert!(cli.config.is_none());
        assert!(cli.disabled.is_empty());
    }

    #[test]
    fn test_cli_flags() {
        let cli = Cli::try_parse_from([
            "hwc-sim",
            "scene.toml",
            "--debug",
            "--frames",
            "5",
            "--disable",
            "DPP_G0",
            "--disable",
            "MSC0",
        ])
        .unwrap();
        assert!(cli.debug);
        assert_eq!(cli.frames, Some(5));
        assert_eq!(cli.disabled, vec!["DPP_G0", "MSC0"]);
    }
}

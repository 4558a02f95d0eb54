mod review;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use common::CancelToken;
use glam::DVec3;
use splatmap::config::GateMode;
use splatmap::environment::CONFIG_FILE;
use splatmap::geo::GeoCoord;
use splatmap::{Batch, Environment, Pipeline, PipelineConfig};
use tracing::{info, warn};

use crate::review::StdinReviewer;

/// Grows a point-splat environment one photo batch at a time.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Environment directory.
    #[arg(long, short, default_value = ".")]
    root: PathBuf,

    /// Log level when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Creates the environment layout and its pipeline config.
    Init {
        /// Config to copy into the environment instead of the defaults.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Folds a directory of images into the environment.
    Run {
        batch_dir: PathBuf,
        /// Position hint in the main frame, as x,y,z.
        #[arg(long, value_parser = parse_vec3, conflicts_with = "geo")]
        hint: Option<DVec3>,
        /// Capture location, as latitude,longitude[,altitude].
        #[arg(long, value_parser = parse_geo)]
        geo: Option<GeoCoord>,
    },
    /// Prints the main dataset and recent merges.
    Status {
        /// Merge records to show.
        #[arg(long, default_value_t = 10)]
        last: usize,
    },
    /// Lists groups with their centroids.
    Groups,
    /// Lifts the halt left by a failed commit.
    ClearHalt,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    common::log_setup::setup_logging(&args.log_level, &args.root.join("logs"), "surveyor")?;

    match args.command {
        Command::Init { config } => init(&args.root, config.as_deref()),
        Command::Run {
            batch_dir,
            hint,
            geo,
        } => run(&args.root, &batch_dir, hint, geo).await,
        Command::Status { last } => status(&args.root, last),
        Command::Groups => groups(&args.root),
        Command::ClearHalt => {
            Environment::open_with_stored_config(&args.root)?.clear_halt()?;
            println!("halt cleared");
            Ok(())
        }
    }
}

fn init(root: &Path, config: Option<&Path>) -> Result<()> {
    let config = match config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };
    std::fs::create_dir_all(root).with_context(|| format!("creating {}", root.display()))?;
    config.save(&root.join(CONFIG_FILE))?;

    let env = Environment::open(root, config)?;
    println!("initialized {}", env.root().display());
    env.close()?;
    Ok(())
}

async fn run(root: &Path, batch_dir: &Path, hint: Option<DVec3>, geo: Option<GeoCoord>) -> Result<()> {
    let env = Arc::new(Environment::open_with_stored_config(root)?);

    let mut batch = Batch::from_dir(batch_dir)?;
    if let Some(hint) = hint {
        batch = batch.with_hint(hint);
    }
    if let Some(geo) = geo {
        if env.config().geo_frame.is_none() {
            warn!("--geo given but the environment has no geo_frame; it will be ignored");
        }
        batch = batch.with_geo(geo);
    }
    info!("Running {} images from {}", batch.len(), batch_dir.display());

    let mut pipeline = Pipeline::with_external_tools(env.clone());
    if env.config().gate_mode != GateMode::Automatic {
        pipeline = pipeline.with_reviewer(Arc::new(StdinReviewer));
    }

    let cancel = CancelToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling running job");
            on_interrupt.cancel();
        }
    });

    let outcome = pipeline.run_with_cancel(batch, &cancel).await?;
    println!(
        "attempt {} ended in {}",
        outcome.staging.attempt.id,
        outcome.state()
    );
    for transition in outcome.staging.attempt.history.iter() {
        println!(
            "  {} {} -> {}{}",
            transition.at.format("%H:%M:%S"),
            transition.from,
            transition.to,
            transition
                .note
                .as_deref()
                .map(|note| format!(" ({note})"))
                .unwrap_or_default()
        );
    }
    if !outcome.is_merged() && outcome.staging_dir().exists() {
        println!("staging kept at {}", outcome.staging_dir().display());
    }

    let result = outcome.into_result();
    drop(pipeline);
    if let Ok(env) = Arc::try_unwrap(env) {
        env.close()?;
    }

    let record = result?;
    println!(
        "merged {} images ({} unplaced) as {}",
        record.added.len(),
        record.unplaced.len(),
        record.id
    );
    Ok(())
}

fn status(root: &Path, last: usize) -> Result<()> {
    let env = Environment::open_with_stored_config(root)?;
    let main = env.snapshot();

    println!("environment {}", env.root().display());
    if env.is_halted() {
        println!("HALTED: a commit failed; run clear-halt once main is checked");
    }
    println!(
        "{} images, {} positioned, {} groups ({} resolved)",
        main.dataset.len(),
        main.poses.len(),
        main.catalog.len(),
        main.catalog.resolved_groups().count()
    );

    let skip = main.merges.len().saturating_sub(last);
    for record in main.merges.iter().skip(skip) {
        println!(
            "{} {} {:<9} +{} images{}",
            record.at.format("%Y-%m-%d %H:%M"),
            record.id,
            record.outcome.to_string(),
            record.added.len(),
            record
                .reason
                .as_deref()
                .map(|reason| format!(": {reason}"))
                .unwrap_or_default()
        );
    }
    Ok(())
}

fn groups(root: &Path) -> Result<()> {
    let env = Environment::open_with_stored_config(root)?;
    let main = env.snapshot();

    for group in main.catalog.groups() {
        match group.centroid() {
            Some(c) => println!(
                "{} {} members, centroid ({:.3}, {:.3}, {:.3})",
                group.id,
                group.members.len(),
                c.x,
                c.y,
                c.z
            ),
            None => println!("{} {} members, unresolved", group.id, group.members.len()),
        }
    }
    Ok(())
}

fn parse_numbers(value: &str, min: usize, max: usize) -> std::result::Result<Vec<f64>, String> {
    let numbers = value
        .split(',')
        .map(|part| part.trim().parse::<f64>().map_err(|err| format!("'{part}': {err}")))
        .collect::<std::result::Result<Vec<f64>, String>>()?;
    if numbers.len() < min || numbers.len() > max {
        return Err(format!("expected {min} to {max} comma-separated numbers"));
    }
    Ok(numbers)
}

fn parse_vec3(value: &str) -> std::result::Result<DVec3, String> {
    let numbers = parse_numbers(value, 3, 3)?;
    Ok(DVec3::new(numbers[0], numbers[1], numbers[2]))
}

fn parse_geo(value: &str) -> std::result::Result<GeoCoord, String> {
    let numbers = parse_numbers(value, 2, 3)?;
    Ok(GeoCoord {
        latitude: numbers[0],
        longitude: numbers[1],
        altitude: numbers.get(2).copied(),
    })
}

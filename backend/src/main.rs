use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand, ValueHint};
use image::GenericImageView;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dreamlens_backend::models::config::{parse_octaves, AppConfig};
use dreamlens_backend::models::dream::{DreamParams, DreamProgress, DreamRequest};
use dreamlens_backend::models::latent::{LatentGrid, LatentRequest};
use dreamlens_backend::services::dream_service::{
    find_latent_renderer, scan_model_statuses, DreamService,
};

#[derive(Parser)]
#[command(
    name = "dreamlens",
    version,
    about = "DeepDream and VAE latent-space rendering"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Amplify the patterns the feature model sees in an image
    Dream(DreamArgs),

    /// Decode a latent vector, or a grid sweep of two latent dimensions
    Latent(LatentArgs),

    /// Print the models found in MODELS_DIR as JSON
    Models,
}

#[derive(Args)]
struct DreamArgs {
    #[arg(value_hint = ValueHint::FilePath)]
    input: PathBuf,

    #[arg(value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Adam steps per octave
    #[arg(long)]
    steps: Option<usize>,

    #[arg(long)]
    step_size: Option<f32>,

    #[arg(long)]
    octave_scale: Option<f32>,

    /// Octave exponents, as `-2..2` or `-1,0,1`
    #[arg(long, allow_hyphen_values = true)]
    octaves: Option<String>,

    #[arg(long)]
    tile_size: Option<usize>,

    /// Seed for the random tile shifts
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Args)]
struct LatentArgs {
    #[arg(value_hint = ValueHint::FilePath)]
    output: PathBuf,

    #[arg(long)]
    seed: Option<u64>,

    /// Render an N x N grid instead of a single image
    #[arg(long)]
    grid: Option<usize>,

    /// Latent dimensions swept by the grid columns and rows
    #[arg(long, value_parser = parse_dims, default_value = "0,1")]
    dims: (usize, usize),

    /// Grid sweep range, [-span, span]
    #[arg(long, default_value_t = 3.0)]
    span: f32,
}

fn parse_dims(raw: &str) -> Result<(usize, usize), String> {
    let (a, b) = raw
        .split_once(',')
        .ok_or_else(|| format!("expected two comma-separated dimensions, got '{}'", raw))?;
    let parse = |s: &str| s.trim().parse::<usize>().map_err(|e| e.to_string());
    Ok((parse(a)?, parse(b)?))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::from_env();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    match cli.command {
        Command::Models => {
            let statuses = scan_model_statuses(Path::new(&config.models_dir));
            println!("{}", serde_json::to_string_pretty(&statuses)?);
            Ok(())
        }
        Command::Dream(args) => dream(Arc::new(config), args).await,
        Command::Latent(args) => latent(Arc::new(config), args).await,
    }
}

async fn dream(config: Arc<AppConfig>, args: DreamArgs) -> anyhow::Result<()> {
    let service = DreamService::new(config.clone())?;

    let img = image::open(&args.input)
        .with_context(|| format!("failed to read {}", args.input.display()))?;
    let octaves = match args.octaves.as_deref() {
        Some(raw) => match parse_octaves(raw) {
            Some(list) => Some(list),
            None => bail!("invalid octave list '{}'", raw),
        },
        None => None,
    };
    let request = DreamRequest {
        step_size: args.step_size,
        octaves,
        octave_scale: args.octave_scale,
        steps_per_octave: args.steps,
        tile_size: args.tile_size,
        seed: args.seed,
    };
    let params = DreamParams::from_request(&request, &config);

    let (w, h) = img.dimensions();
    tracing::info!(
        input = %args.input.display(),
        width = w,
        height = h,
        octaves = ?params.octaves,
        steps_per_octave = params.steps_per_octave,
        "Starting dream"
    );

    let started = Instant::now();
    let on_progress = |event: DreamProgress| {
        if let DreamProgress::OctaveStarted { octave, exponent, height, width } = event {
            tracing::info!(octave, exponent, height, width, "Octave started");
        }
    };

    let output = tokio::select! {
        result = service.run_dream(img, params, on_progress) => result?,
        _ = tokio::signal::ctrl_c() => bail!("interrupted"),
    };

    output
        .save(&args.output)
        .with_context(|| format!("failed to write {}", args.output.display()))?;
    tracing::info!(
        output = %args.output.display(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Dream written"
    );
    Ok(())
}

async fn latent(config: Arc<AppConfig>, args: LatentArgs) -> anyhow::Result<()> {
    let request = LatentRequest {
        z: None,
        seed: args.seed,
        grid: args.grid.map(|cells| LatentGrid {
            cells,
            dims: args.dims,
            span: args.span,
        }),
    };

    let models_dir = PathBuf::from(&config.models_dir);
    let output = tokio::task::spawn_blocking(move || {
        let renderer = find_latent_renderer(&models_dir)?;
        renderer.render_request(&request)
    })
    .await??;

    output
        .save(&args.output)
        .with_context(|| format!("failed to write {}", args.output.display()))?;
    tracing::info!(output = %args.output.display(), "Latent render written");
    Ok(())
}

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::Parser;

use particle_life::app::ParticleApp;
use particle_life::{SimulationParams, SimulationStep, SubmissionOrder};

#[derive(Parser, Debug)]
#[command(about = "Colored particle classes attracting and repelling each other")]
struct Args {
    /// YAML file with simulation parameters; missing keys use defaults.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of particle classes.
    #[arg(short = 'k', long)]
    classes: Option<usize>,

    /// Particles per class.
    #[arg(short = 'm', long)]
    particles: Option<usize>,

    /// Worker threads (default: host parallelism).
    #[arg(short, long)]
    threads: Option<usize>,

    /// Seed for the world and the interaction matrix.
    #[arg(short, long)]
    seed: Option<u64>,

    /// Submit each generation's jobs in a random order.
    #[arg(long)]
    shuffle: bool,

    /// Run this many generations without a window, then exit.
    #[arg(long, value_name = "GENERATIONS")]
    headless: Option<u64>,
}

// load here to keep main clean
fn load_params_from_yaml(path: &Path) -> Result<SimulationParams> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let params: SimulationParams = serde_yaml::from_reader(BufReader::new(file))
        .with_context(|| format!("parsing {}", path.display()))?;
    Ok(params)
}

fn resolve_params(args: &Args) -> Result<SimulationParams> {
    let mut params = match &args.config {
        Some(path) => load_params_from_yaml(path)?,
        None => SimulationParams::default(),
    };
    if let Some(classes) = args.classes {
        params.num_classes = classes;
    }
    if let Some(particles) = args.particles {
        params.particles_per_class = particles;
    }
    if args.threads.is_some() {
        params.worker_threads = args.threads;
    }
    if args.seed.is_some() {
        params.seed = args.seed;
    }
    if args.shuffle {
        params.submission_order = SubmissionOrder::Shuffled;
    }
    params.validate()?;
    Ok(params)
}

fn run_headless(params: &SimulationParams, generations: u64) -> Result<()> {
    let mut step = SimulationStep::new(params)?;
    let mut total = Duration::ZERO;
    for _ in 0..generations {
        total += step.run_generation()?.elapsed;
    }
    let average = total.as_secs_f64() * 1000.0 / generations.max(1) as f64;
    log::info!(
        "{generations} generations on {} workers, {average:.3}ms average",
        step.num_workers()
    );
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let params = resolve_params(&args)?;

    if let Some(generations) = args.headless {
        return run_headless(&params, generations);
    }

    // Screen-space projection runs on rayon; the simulation has its own pool.
    rayon::ThreadPoolBuilder::new()
        .num_threads(num_cpus::get_physical())
        .build_global()?;

    let native_options = eframe::NativeOptions {
        viewport: eframe::egui::ViewportBuilder::default()
            .with_inner_size([params.width, params.height]),
        ..Default::default()
    };

    eframe::run_native(
        "Particles",
        native_options,
        Box::new(|_cc| Ok(Box::new(ParticleApp::new(params)))),
    )
    .map_err(|e| anyhow!("display failed: {e}"))
}

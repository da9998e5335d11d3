use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use seqtrain::{
    checkpoint::CheckpointIndex,
    logging::{init_logging, LrValue},
    scheduler::SchedulerFactory,
    ConfigOverride, TrainingConfig,
};

fn main() {
    if let Err(err) = run() {
        eprintln!("seqtrain: {err:#}");
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Inspect training runs and configurations", long_about = None)]
struct Args {
    #[arg(long, global = true, help = "Emit logs as JSON lines")]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List checkpoints in a working directory and the epoch training would resume from.
    Inspect {
        workdir: PathBuf,

        #[arg(long, help = "Require optimizer state alongside the weights")]
        with_optim: bool,
    },
    /// Load and validate a configuration file.
    CheckConfig {
        config: PathBuf,

        #[arg(
            long = "override",
            value_name = "KEY=VALUE",
            help = "Override configuration value using dot-separated paths"
        )]
        overrides: Vec<ConfigOverride>,
    },
    /// Print the learning rate at the start of every epoch.
    Schedule {
        config: PathBuf,

        #[arg(long)]
        epochs: usize,

        #[arg(long, default_value_t = 0)]
        last_epoch: usize,

        #[arg(long = "override", value_name = "KEY=VALUE")]
        overrides: Vec<ConfigOverride>,
    },
}

fn run() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.json_logs);

    match args.command {
        Command::Inspect {
            workdir,
            with_optim,
        } => inspect(&workdir, with_optim),
        Command::CheckConfig { config, overrides } => check_config(&config, &overrides),
        Command::Schedule {
            config,
            epochs,
            last_epoch,
            overrides,
        } => schedule(&config, &overrides, epochs, last_epoch),
    }
}

fn load_config(path: &Path, overrides: &[ConfigOverride]) -> anyhow::Result<TrainingConfig> {
    let config = TrainingConfig::load(path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    config
        .with_overrides(overrides)
        .context("failed to apply overrides")
}

fn inspect(workdir: &Path, with_optim: bool) -> anyhow::Result<()> {
    let index = CheckpointIndex::scan(workdir)
        .with_context(|| format!("failed to scan {}", workdir.display()))?;

    let weights: Vec<_> = index.weight_epochs().into_iter().collect();
    let optim: Vec<_> = index.optimizer_epochs().into_iter().collect();
    println!("weights epochs: {weights:?}");
    println!("optimizer epochs: {optim:?}");

    match index.resume_point(with_optim) {
        Some(descriptor) => {
            println!("resume epoch: {}", descriptor.epoch);
            println!("weights: {}", descriptor.weights.display());
            if let Some(path) = descriptor.optimizer {
                println!("optimizer: {}", path.display());
            }
        }
        None => println!("resume epoch: 0 (cold start)"),
    }
    Ok(())
}

fn check_config(path: &Path, overrides: &[ConfigOverride]) -> anyhow::Result<()> {
    let config = load_config(path, overrides)?;
    let curve = config.scheduler.curve();
    let base = config.optimizer.learning_rate.values();
    let at = |t: f64| {
        let rates: Vec<f64> = base.iter().map(|lr| lr * curve.eval(t)).collect();
        LrValue::from(rates.as_slice())
    };

    println!("configuration ok");
    println!("optimizer: {:?}", config.optimizer.algorithm);
    println!("steps per epoch: {}", config.steps_per_epoch());
    println!(
        "batch size: {} (split into {})",
        config.data.batch_size, config.runtime.grad_accum_split
    );
    println!("mixed precision: {}", config.runtime.use_amp);
    println!("schedule: {:?} from {} to {}", config.scheduler.strategy, at(0.0), at(1.0));
    Ok(())
}

fn schedule(
    path: &Path,
    overrides: &[ConfigOverride],
    epochs: usize,
    last_epoch: usize,
) -> anyhow::Result<()> {
    if last_epoch >= epochs {
        bail!("--last-epoch ({last_epoch}) must be below --epochs ({epochs})");
    }
    let config = load_config(path, overrides)?;
    let steps_per_epoch = config.steps_per_epoch();
    let mut scheduler = config.scheduler.build(
        config.optimizer.learning_rate.values(),
        steps_per_epoch,
        epochs,
        last_epoch,
    )?;

    for epoch in last_epoch + 1..=epochs {
        println!("epoch {epoch}: lr {}", LrValue::from(scheduler.last_lr()));
        for _ in 0..steps_per_epoch {
            scheduler.step();
        }
    }
    println!("end: lr {}", LrValue::from(scheduler.last_lr()));
    Ok(())
}

//! Train an unwrapping network on synthetic surfaces, persist it, restore
//! it, and report how far the restored model's output strays from the
//! input's congruence class.
//!
//! Usage:
//!   cargo run --release -p unwrap-net --example train_synthetic -- \
//!     --mode two-step --max-wrap-count 3 --steps 200 --out checkpoints/unwrap

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;

use burn::backend::{Autodiff, NdArray};
use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use phase_map::{congruence_residual, GridShape, PhaseDataset, SyntheticConfig, SyntheticPhaseDataset};
use unwrap_net::{load_config, train, PhaseUnwrapper, TrainingConfig, UnwrapConfig};

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    OneStep,
    TwoStep,
}

#[derive(Parser)]
struct Args {
    /// TOML network configuration; overrides --mode and --max-wrap-count.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t = Mode::TwoStep)]
    mode: Mode,
    /// Wrap-count bound K (two-step mode).
    #[arg(long, default_value_t = 3)]
    max_wrap_count: u32,
    /// Grid height and width of the synthetic maps.
    #[arg(long, default_value_t = 64)]
    size: usize,
    #[arg(long, default_value_t = 256)]
    samples: usize,
    #[arg(long, default_value_t = 200)]
    steps: usize,
    #[arg(long, default_value_t = 4)]
    batch_size: usize,
    #[arg(long, default_value_t = 1e-3)]
    lr: f64,
    /// Probability that a synthetic map gets a masked region.
    #[arg(long, default_value_t = 0.3)]
    mask_probability: f64,
    /// Checkpoint directory.
    #[arg(long, default_value = "checkpoints/unwrap")]
    out: PathBuf,
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let unwrap_config = match (&args.config, args.mode) {
        (Some(path), _) => load_config(path)?,
        (None, Mode::OneStep) => UnwrapConfig::one_step(),
        (None, Mode::TwoStep) => UnwrapConfig::two_step(args.max_wrap_count),
    };
    unwrap_config.validate()?;
    let k = unwrap_config.max_wrap_count.unwrap_or(args.max_wrap_count);

    let shape = GridShape::new(args.size, args.size);
    let dataset = SyntheticPhaseDataset::new(
        SyntheticConfig::new(shape, args.samples, k)
            .with_mask_probability(args.mask_probability)
            .with_seed(args.seed),
    )?;
    let val_dataset = SyntheticPhaseDataset::new(
        SyntheticConfig::new(shape, args.batch_size * 4, k)
            .with_mask_probability(args.mask_probability)
            .with_seed(args.seed.wrapping_add(1)),
    )?;

    let training = TrainingConfig::new()
        .with_lr(args.lr)
        .with_total_steps(args.steps)
        .with_warmup_steps((args.steps / 10).max(1))
        .with_batch_size(args.batch_size)
        .with_log_interval((args.steps / 20).max(1))
        .with_checkpoint_interval((args.steps / 4).max(1))
        .with_checkpoint_dir(args.out.to_string_lossy().into_owned())
        .with_seed(args.seed);

    let device = Default::default();
    let model = unwrap_config.network()?.init::<Autodiff<NdArray<f32>>>(&device);
    let stop = AtomicBool::new(false);
    let outcome = train(
        &training,
        &unwrap_config,
        model,
        &dataset,
        Some(&val_dataset),
        &device,
        None,
        &stop,
    )?;
    if let Some((step, loss)) = outcome.history.best_loss() {
        println!("Best logged loss {loss:.4} at step {step}");
    }

    let blob = args.out.join("final").join("model.puwn");
    let unwrapper = PhaseUnwrapper::<NdArray<f32>>::load(&blob, unwrap_config, device)?;
    println!("Restored {} model from {}", unwrapper.config().mode, blob.display());

    let mut worst = 0.0_f64;
    let mut total_error = 0.0_f64;
    let mut total_valid = 0usize;
    for i in 0..val_dataset.len() {
        let Some(sample) = val_dataset.get(i) else { continue };
        let out = unwrapper.unwrap(&sample.input)?;
        worst = worst.max(congruence_residual(&out.unwrapped, &sample.input.wrapped, sample.mask()));

        if let Some(truth) = sample.unwrapped_truth() {
            for ((p, t), &v) in out
                .unwrapped
                .values()
                .iter()
                .zip(truth.values())
                .zip(sample.mask().as_slice())
            {
                if v {
                    total_error += (p - t).abs() as f64;
                    total_valid += 1;
                }
            }
        }
    }

    println!("Validation maps: {}", val_dataset.len());
    println!("  Max congruence residual: {worst:.2e} rad");
    if total_valid > 0 {
        println!("  Mean abs phase error:    {:.4} rad", total_error / total_valid as f64);
    }
    Ok(())
}

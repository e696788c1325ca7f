//! Training loop: explicit train state, guarded optimizer steps,
//! warmup + cosine LR schedule, checkpoint/resume.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use burn::grad_clipping::GradientClippingConfig;
use burn::module::{AutodiffModule, ModuleVisitor, ParamId};
use burn::optim::{AdamWConfig, GradientsAccumulator, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder};
use burn::tensor::backend::AutodiffBackend;
use phase_map::{PhaseDataset, UnwrapError};

use crate::config::UnwrapConfig;
use crate::model::network::PhaseUNet;
use crate::persist::{load_parameters, save_parameters};
use crate::training::data::{collate, BatchSampler, PhaseBatch};
use crate::training::loss::Objective;
use crate::training::metrics::{MetricsHistory, UnwrapMetrics};

/// Metadata saved alongside each checkpoint for resuming training.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq)]
pub struct CheckpointMeta {
    /// Completed optimizer steps.
    pub step: usize,
    /// Loss of the last completed step.
    pub last_loss: Option<f64>,
}

/// Configuration for training.
#[derive(Config, Debug)]
pub struct TrainingConfig {
    /// Base learning rate for AdamW.
    #[config(default = 1e-3)]
    pub lr: f64,
    /// Weight decay for AdamW.
    #[config(default = 0.01)]
    pub weight_decay: f64,
    /// Maximum gradient norm for clipping.
    #[config(default = 1.0)]
    pub max_grad_norm: f64,
    /// Total number of optimizer steps.
    #[config(default = 10_000)]
    pub total_steps: usize,
    /// Number of linear warmup steps.
    #[config(default = 200)]
    pub warmup_steps: usize,
    /// Samples per optimizer step.
    #[config(default = 8)]
    pub batch_size: usize,
    /// Micro-batches the batch is split into; gradients are summed in order.
    #[config(default = 1)]
    pub accumulation_steps: usize,
    /// Steps between metric logging.
    #[config(default = 100)]
    pub log_interval: usize,
    /// Steps between checkpoint saves. 0 disables periodic checkpoints.
    #[config(default = 1_000)]
    pub checkpoint_interval: usize,
    /// Validation batches evaluated at each log step.
    #[config(default = 4)]
    pub val_batches: usize,
    /// Directory for saving checkpoints.
    #[config(default = "String::from(\"checkpoints/unwrap\")")]
    pub checkpoint_dir: String,
    /// Seed of the batch sampler.
    #[config(default = 42)]
    pub seed: u64,
}

impl TrainingConfig {
    pub fn validate(&self) -> phase_map::Result<()> {
        if self.batch_size == 0 {
            return Err(UnwrapError::config("batch_size", "must be at least 1"));
        }
        if self.accumulation_steps == 0 || self.accumulation_steps > self.batch_size {
            return Err(UnwrapError::config(
                "accumulation_steps",
                format!(
                    "must be in 1..={} (batch_size), got {}",
                    self.batch_size, self.accumulation_steps
                ),
            ));
        }
        if !(self.lr.is_finite() && self.lr > 0.0) {
            return Err(UnwrapError::config("lr", format!("must be positive, got {}", self.lr)));
        }
        Ok(())
    }

    /// Samples per micro-batch.
    pub fn micro_batch_size(&self) -> usize {
        self.batch_size.div_ceil(self.accumulation_steps.max(1))
    }

    fn step_dir(&self, name: &str) -> PathBuf {
        Path::new(&self.checkpoint_dir).join(name)
    }
}

/// Compute the learning rate at a given step using warmup + cosine decay.
///
/// - Warmup phase (`step < warmup_steps`): linearly ramps from 0 to `base_lr`.
/// - Cosine phase: decays from `base_lr` to 0 following a cosine schedule.
pub fn lr_schedule(base_lr: f64, warmup_steps: usize, total_steps: usize, step: usize) -> f64 {
    if warmup_steps > 0 && step < warmup_steps {
        base_lr * (step + 1) as f64 / warmup_steps as f64
    } else {
        let decay_steps = total_steps.saturating_sub(warmup_steps).max(1);
        let progress = (step.saturating_sub(warmup_steps)) as f64 / decay_steps as f64;
        let progress = progress.min(1.0);
        base_lr * 0.5 * (1.0 + (std::f64::consts::PI * progress).cos())
    }
}

/// AdamW with weight decay and gradient-norm clipping from `config`.
pub fn init_optimizer<B: AutodiffBackend>(config: &TrainingConfig) -> impl Optimizer<PhaseUNet<B>, B> {
    AdamWConfig::new()
        .with_weight_decay(config.weight_decay as f32)
        .with_grad_clipping(Some(GradientClippingConfig::Norm(config.max_grad_norm as f32)))
        .init::<B, PhaseUNet<B>>()
}

/// Sum of squared gradients, counting parameters whose gradient is not finite.
struct GradientNorm<'a> {
    grads: &'a GradientsParams,
    sum_sq: f64,
    non_finite: usize,
    params: usize,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for GradientNorm<'_> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        self.params += 1;
        if let Some(grad) = self.grads.get::<B::InnerBackend, D>(id) {
            let sq: f32 = grad.powf_scalar(2.0).sum().into_scalar().elem();
            if sq.is_finite() {
                self.sum_sq += sq as f64;
            } else {
                self.non_finite += 1;
            }
        }
    }
}

/// Global gradient norm, or a numeric instability error if any gradient is
/// not finite.
pub fn check_gradients<B: AutodiffBackend>(
    model: &PhaseUNet<B>,
    grads: &GradientsParams,
    step: usize,
) -> phase_map::Result<f64> {
    let mut norm = GradientNorm {
        grads,
        sum_sq: 0.0,
        non_finite: 0,
        params: 0,
    };
    model.visit(&mut norm);
    if norm.non_finite > 0 || !norm.sum_sq.is_finite() {
        return Err(UnwrapError::NumericInstability {
            stage: "backward",
            step,
            detail: format!(
                "{} of {} parameter gradients are not finite",
                norm.non_finite, norm.params
            ),
        });
    }
    Ok(norm.sum_sq.sqrt())
}

/// Everything a training run mutates: parameters, optimizer state, step counter.
///
/// Parameters change only inside [`TrainState::train_step`], and only after
/// the loss and every gradient were checked, so the state is consistent
/// between steps.
pub struct TrainState<B: AutodiffBackend, O> {
    pub model: PhaseUNet<B>,
    pub optimizer: O,
    /// Completed optimizer steps.
    pub step: usize,
}

impl<B: AutodiffBackend, O: Optimizer<PhaseUNet<B>, B>> TrainState<B, O> {
    pub fn new(model: PhaseUNet<B>, optimizer: O) -> Self {
        Self {
            model,
            optimizer,
            step: 0,
        }
    }

    /// One optimizer step over `micro_batches`.
    ///
    /// Each micro-batch loss is weighted by its share of the samples and
    /// back-propagated; gradients are summed in slice order. The update is
    /// applied only if every loss and every gradient is finite.
    pub fn train_step(
        &mut self,
        micro_batches: &[PhaseBatch<B>],
        objective: &Objective,
        lr: f64,
    ) -> phase_map::Result<UnwrapMetrics> {
        let total: usize = micro_batches.iter().map(|b| b.batch_size()).sum();
        if total == 0 {
            return Err(UnwrapError::shape("train step", "batch", "at least one sample", "empty batch"));
        }

        let mut accumulator = GradientsAccumulator::<PhaseUNet<B>>::new();
        let mut step_metrics = Vec::with_capacity(micro_batches.len());
        for (i, batch) in micro_batches.iter().enumerate() {
            let output = self.model.forward_checked(batch.inputs.clone())?;
            let terms = objective.compute(output.clone(), batch)?;
            let metrics = UnwrapMetrics::compute(&output, batch, &terms);
            if !metrics.loss.is_finite() {
                return Err(UnwrapError::NumericInstability {
                    stage: "loss",
                    step: self.step,
                    detail: format!("micro-batch {i} loss = {}", metrics.loss),
                });
            }
            tracing::debug!(step = self.step, micro_batch = i, loss = metrics.loss, "Micro-batch forward");

            let weight = batch.batch_size() as f64 / total as f64;
            let grads = GradientsParams::from_grads(terms.total.mul_scalar(weight).backward(), &self.model);
            accumulator.accumulate(&self.model, grads);
            step_metrics.push(metrics);
        }

        let grads = accumulator.grads();
        let grad_norm = check_gradients(&self.model, &grads, self.step)?;
        self.model = self.optimizer.step(lr, self.model.clone(), grads);
        self.step += 1;

        let metrics = UnwrapMetrics::mean(&step_metrics).unwrap_or_default();
        Ok(metrics.with_grad_norm(grad_norm))
    }
}

/// Mean metrics of `model` over up to `max_batches` sequential batches.
pub fn evaluate<B: Backend>(
    model: &PhaseUNet<B>,
    objective: &Objective,
    unwrap_config: &UnwrapConfig,
    dataset: &dyn PhaseDataset,
    batch_size: usize,
    max_batches: usize,
    device: &B::Device,
) -> phase_map::Result<Option<UnwrapMetrics>> {
    let mut all = Vec::new();
    for start in (0..dataset.len()).step_by(batch_size.max(1)).take(max_batches) {
        let end = (start + batch_size).min(dataset.len());
        let samples: Vec<_> = (start..end).filter_map(|i| dataset.get(i)).collect();
        if samples.is_empty() {
            continue;
        }
        let batch = collate::<B>(&samples, unwrap_config, device)?;
        let output = model.forward_checked(batch.inputs.clone())?;
        let terms = objective.compute(output.clone(), &batch)?;
        all.push(UnwrapMetrics::compute(&output, &batch, &terms));
    }
    Ok(UnwrapMetrics::mean(&all))
}

/// Write model blob, optimizer record and metadata to `dir`.
pub fn save_checkpoint<B: AutodiffBackend, O: Optimizer<PhaseUNet<B>, B>>(
    state: &TrainState<B, O>,
    unwrap_config: &UnwrapConfig,
    dir: &Path,
    last_loss: Option<f64>,
) -> anyhow::Result<()> {
    std::fs::create_dir_all(dir)?;
    save_parameters(&state.model, unwrap_config, &dir.join("model.puwn"))?;

    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    Recorder::<B>::record(&recorder, state.optimizer.to_record(), dir.join("optimizer"))
        .map_err(|e| anyhow::anyhow!("Failed to save optimizer to {}: {e}", dir.display()))?;

    serde_json::to_writer(
        std::fs::File::create(dir.join("meta.json"))?,
        &CheckpointMeta {
            step: state.step,
            last_loss,
        },
    )?;
    tracing::info!(step = state.step, dir = %dir.display(), "Checkpoint saved (model + optimizer + meta)");
    Ok(())
}

/// Restore model, optimizer state and step counter from a checkpoint
/// directory into `state`.
pub fn load_checkpoint<B: AutodiffBackend, O: Optimizer<PhaseUNet<B>, B>>(
    state: TrainState<B, O>,
    unwrap_config: &UnwrapConfig,
    dir: &Path,
    device: &B::Device,
) -> anyhow::Result<TrainState<B, O>> {
    let model = load_parameters::<B>(&dir.join("model.puwn"), unwrap_config, device)?;

    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    let optim_record = Recorder::<B>::load(&recorder, dir.join("optimizer"), device)
        .map_err(|e| anyhow::anyhow!("Failed to load optimizer from {}: {e}", dir.display()))?;
    let optimizer = state.optimizer.load_record(optim_record);

    let meta_path = dir.join("meta.json");
    let meta: CheckpointMeta = serde_json::from_reader(
        std::fs::File::open(&meta_path)
            .map_err(|e| anyhow::anyhow!("Failed to open {}: {e}", meta_path.display()))?,
    )
    .map_err(|e| anyhow::anyhow!("Failed to parse {}: {e}", meta_path.display()))?;

    tracing::info!(step = meta.step, dir = %dir.display(), "Restored train state");
    Ok(TrainState {
        model,
        optimizer,
        step: meta.step,
    })
}

/// Result of a training run.
pub struct TrainOutcome<B: AutodiffBackend> {
    pub model: PhaseUNet<B>,
    pub history: MetricsHistory,
    /// Completed optimizer steps.
    pub steps: usize,
    /// Whether the run ended on the stop flag rather than `total_steps`.
    pub stopped: bool,
}

/// Run the training loop.
///
/// Draws seeded batches from `dataset`, splits each into
/// `accumulation_steps` micro-batches and applies one guarded optimizer
/// step per batch. The stop flag is polled between steps; when it is set
/// the current state is checkpointed under `step_{n}` and the run returns.
///
/// # Arguments
/// - `resume_step`: if `Some(n)`, restore from `{checkpoint_dir}/step_{n}`
///   and continue from step `n`
#[allow(clippy::too_many_arguments)]
pub fn train<B: AutodiffBackend>(
    config: &TrainingConfig,
    unwrap_config: &UnwrapConfig,
    model: PhaseUNet<B>,
    dataset: &dyn PhaseDataset,
    val_dataset: Option<&dyn PhaseDataset>,
    device: &B::Device,
    resume_step: Option<usize>,
    stop: &AtomicBool,
) -> anyhow::Result<TrainOutcome<B>> {
    config.validate()?;
    let objective = Objective::from_config(unwrap_config)?;
    if dataset.is_empty() {
        return Err(UnwrapError::config("dataset", "training dataset is empty").into());
    }
    std::fs::create_dir_all(&config.checkpoint_dir)?;

    let mut state = TrainState::new(model, init_optimizer::<B>(config));
    if let Some(step) = resume_step {
        state = load_checkpoint(state, unwrap_config, &config.step_dir(&format!("step_{step}")), device)?;
    }

    // Replay the sampler so a resumed run sees the same batches.
    let mut sampler = BatchSampler::new(dataset.len(), config.seed);
    for _ in 0..state.step {
        sampler.next_indices(config.batch_size);
    }

    tracing::info!(
        mode = %unwrap_config.mode,
        start_step = state.step,
        total_steps = config.total_steps,
        batch_size = config.batch_size,
        accumulation_steps = config.accumulation_steps,
        "Starting training"
    );

    let train_start = Instant::now();
    let mut history = MetricsHistory::new();
    let mut window: Vec<UnwrapMetrics> = Vec::new();
    let mut last_loss = None;
    let mut stopped = false;

    while state.step < config.total_steps {
        if stop.load(Ordering::SeqCst) {
            tracing::info!(step = state.step, "Stop requested, checkpointing");
            save_checkpoint(&state, unwrap_config, &config.step_dir(&format!("step_{}", state.step)), last_loss)?;
            stopped = true;
            break;
        }

        let step = state.step;
        let lr = lr_schedule(config.lr, config.warmup_steps, config.total_steps, step);
        let samples = sampler.sample_batch(dataset, config.batch_size);
        let micro_batches = samples
            .chunks(config.micro_batch_size())
            .map(|chunk| collate::<B>(chunk, unwrap_config, device))
            .collect::<phase_map::Result<Vec<_>>>()?;

        let metrics = state.train_step(&micro_batches, &objective, lr).map_err(|e| {
            tracing::error!(step, "Training step aborted: {e}");
            e
        })?;
        last_loss = Some(metrics.loss);
        window.push(metrics);

        let completed = state.step;
        if config.log_interval > 0 && (completed % config.log_interval == 0 || completed == config.total_steps) {
            if let Some(avg) = UnwrapMetrics::mean(&window) {
                let warnings = avg.health_check();
                if !warnings.is_empty() {
                    tracing::warn!(step = completed, "Health check warnings: {:?}", warnings);
                }

                let val_str = match val_dataset {
                    Some(val) => evaluate(
                        &state.model.valid(),
                        &objective,
                        unwrap_config,
                        val,
                        config.batch_size,
                        config.val_batches,
                        device,
                    )?
                    .map(|vm| format!(" | val: {}", vm.display()))
                    .unwrap_or_default(),
                    None => String::new(),
                };

                let lr_str = format!("{lr:.2e}");
                let elapsed = format!("{:.1}s", train_start.elapsed().as_secs_f64());
                tracing::info!(step = completed, lr = %lr_str, elapsed, "avg({}) {}{}", window.len(), avg.display(), val_str);
                history.push(completed, avg);
            }
            window.clear();
        }

        if config.checkpoint_interval > 0 && completed % config.checkpoint_interval == 0 {
            save_checkpoint(&state, unwrap_config, &config.step_dir(&format!("step_{completed}")), last_loss)?;
        }
    }

    if !stopped {
        save_checkpoint(&state, unwrap_config, &config.step_dir("final"), last_loss)?;
        tracing::info!(
            steps = state.step,
            elapsed_secs = format!("{:.1}", train_start.elapsed().as_secs_f64()),
            "Training complete"
        );
    }

    Ok(TrainOutcome {
        steps: state.step,
        model: state.model,
        history,
        stopped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::head::HeadOutput;
    use burn::backend::ndarray::NdArray;
    use burn::backend::Autodiff;
    use phase_map::{GridShape, SyntheticConfig, SyntheticPhaseDataset};

    type TestAutodiffBackend = Autodiff<NdArray<f32>>;

    fn tiny(config: UnwrapConfig) -> UnwrapConfig {
        config.with_backbone(vec![4, 8], vec![1, 1], 4)
    }

    fn dataset() -> SyntheticPhaseDataset {
        SyntheticPhaseDataset::new(SyntheticConfig::new(GridShape::new(8, 8), 8, 2).with_seed(5)).unwrap()
    }

    fn batch(config: &UnwrapConfig, indices: std::ops::Range<usize>) -> PhaseBatch<TestAutodiffBackend> {
        let ds = dataset();
        let samples: Vec<_> = indices.filter_map(|i| ds.get(i)).collect();
        collate(&samples, config, &Default::default()).unwrap()
    }

    fn regression_values(model: &PhaseUNet<TestAutodiffBackend>, batch: &PhaseBatch<TestAutodiffBackend>) -> Vec<f32> {
        match model.forward(batch.inputs.clone()) {
            HeadOutput::Regression(t) => t.into_data().iter::<f32>().collect(),
            other => panic!("expected regression, got {other:?}"),
        }
    }

    #[test]
    fn test_lr_schedule() {
        let base_lr = 1e-3;

        // Warmup: step 0 -> base/100, step 99 -> base
        assert!((lr_schedule(base_lr, 100, 1000, 0) - base_lr / 100.0).abs() < 1e-12);
        assert!((lr_schedule(base_lr, 100, 1000, 99) - base_lr).abs() < 1e-12);

        // Cosine: start at base, midpoint at base/2, near zero at the end
        assert!((lr_schedule(base_lr, 100, 1000, 100) - base_lr).abs() < 1e-12);
        assert!((lr_schedule(base_lr, 100, 1000, 550) - base_lr * 0.5).abs() < 1e-12);
        assert!(lr_schedule(base_lr, 100, 1000, 999) < base_lr * 0.01);

        // No warmup
        assert!((lr_schedule(base_lr, 0, 1000, 0) - base_lr).abs() < 1e-12);
    }

    #[test]
    fn test_config_validation() {
        assert!(TrainingConfig::new().validate().is_ok());
        assert!(TrainingConfig::new().with_batch_size(0).validate().is_err());
        assert!(TrainingConfig::new()
            .with_batch_size(4)
            .with_accumulation_steps(5)
            .validate()
            .is_err());
        assert_eq!(
            TrainingConfig::new().with_batch_size(5).with_accumulation_steps(2).micro_batch_size(),
            3
        );
    }

    #[test]
    fn test_train_step_updates_parameters() {
        let device = Default::default();
        let config = tiny(UnwrapConfig::one_step());
        let model = config.network().unwrap().init::<TestAutodiffBackend>(&device);
        let objective = Objective::from_config(&config).unwrap();
        let batch = batch(&config, 0..2);

        let mut state = TrainState::new(model, init_optimizer::<TestAutodiffBackend>(&TrainingConfig::new()));
        let before = regression_values(&state.model, &batch);
        let metrics = state.train_step(std::slice::from_ref(&batch), &objective, 1e-2).unwrap();
        let after = regression_values(&state.model, &batch);

        assert_eq!(state.step, 1);
        assert!(metrics.loss.is_finite() && metrics.loss > 0.0, "{metrics:?}");
        assert!(metrics.grad_norm.unwrap() > 0.0);
        assert_ne!(before, after, "parameters did not change");
    }

    #[test]
    fn test_check_gradients_reports_norm() {
        let device = Default::default();
        let config = tiny(UnwrapConfig::two_step(2));
        let model = config.network().unwrap().init::<TestAutodiffBackend>(&device);
        let objective = Objective::from_config(&config).unwrap();
        let batch = batch(&config, 0..1);

        let output = model.forward(batch.inputs.clone());
        let terms = objective.compute(output, &batch).unwrap();
        let grads = GradientsParams::from_grads(terms.total.backward(), &model);
        let norm = check_gradients(&model, &grads, 0).unwrap();
        assert!(norm.is_finite() && norm > 0.0, "norm = {norm}");
    }

    #[test]
    fn test_non_finite_loss_aborts_without_update() {
        let device = Default::default();
        let config = tiny(UnwrapConfig::one_step());
        let model = config.network().unwrap().init::<TestAutodiffBackend>(&device);
        let objective = Objective::from_config(&config).unwrap();
        let mut bad = batch(&config, 0..1);
        // Non-finite truth at valid pixels
        bad.unwrapped = bad.unwrapped.clone().add_scalar(f32::INFINITY);

        let mut state = TrainState::new(model, init_optimizer::<TestAutodiffBackend>(&TrainingConfig::new()));
        let before = regression_values(&state.model, &bad);
        let err = state.train_step(std::slice::from_ref(&bad), &objective, 1e-2).unwrap_err();
        assert!(matches!(err, UnwrapError::NumericInstability { .. }), "{err}");
        assert_eq!(state.step, 0);
        assert_eq!(before, regression_values(&state.model, &bad));
    }

    #[test]
    fn test_accumulation_is_deterministic() {
        let device = Default::default();
        let config = tiny(UnwrapConfig::one_step());
        let model = config.network().unwrap().init::<TestAutodiffBackend>(&device);
        let objective = Objective::from_config(&config).unwrap();
        let micro = vec![batch(&config, 0..2), batch(&config, 2..4)];

        let mut a = TrainState::new(model.clone(), init_optimizer::<TestAutodiffBackend>(&TrainingConfig::new()));
        let mut b = TrainState::new(model, init_optimizer::<TestAutodiffBackend>(&TrainingConfig::new()));
        a.train_step(&micro, &objective, 1e-2).unwrap();
        b.train_step(&micro, &objective, 1e-2).unwrap();
        assert_eq!(
            regression_values(&a.model, &micro[0]),
            regression_values(&b.model, &micro[0]),
            "accumulation must be deterministic"
        );
    }

    #[test]
    fn test_train_checkpoint_and_resume() {
        let device = Default::default();
        let dir = tempfile::TempDir::new().unwrap();
        let unwrap_config = tiny(UnwrapConfig::two_step(2));
        let config = TrainingConfig::new()
            .with_total_steps(3)
            .with_warmup_steps(1)
            .with_batch_size(2)
            .with_log_interval(1)
            .with_checkpoint_interval(2)
            .with_checkpoint_dir(dir.path().to_string_lossy().into_owned());
        let ds = dataset();
        let stop = AtomicBool::new(false);

        let model = unwrap_config.network().unwrap().init::<TestAutodiffBackend>(&device);
        let outcome = train(&config, &unwrap_config, model, &ds, Some(&ds), &device, None, &stop).unwrap();
        assert_eq!(outcome.steps, 3);
        assert!(!outcome.stopped);
        assert_eq!(outcome.history.len(), 3);
        assert!(dir.path().join("step_2/model.puwn").exists());
        assert!(dir.path().join("final/meta.json").exists());

        let resumed_config = config.clone().with_total_steps(4);
        let model = unwrap_config.network().unwrap().init::<TestAutodiffBackend>(&device);
        let outcome = train(&resumed_config, &unwrap_config, model, &ds, None, &device, Some(2), &stop).unwrap();
        assert_eq!(outcome.steps, 4);
        assert_eq!(outcome.history.len(), 2, "resumed at step 2, ran steps 3 and 4");
    }

    #[test]
    fn test_stop_flag_checkpoints_and_returns() {
        let device = Default::default();
        let dir = tempfile::TempDir::new().unwrap();
        let unwrap_config = tiny(UnwrapConfig::one_step());
        let config = TrainingConfig::new()
            .with_total_steps(10)
            .with_batch_size(1)
            .with_checkpoint_dir(dir.path().to_string_lossy().into_owned());
        let stop = AtomicBool::new(true);

        let model = unwrap_config.network().unwrap().init::<TestAutodiffBackend>(&device);
        let outcome = train(&config, &unwrap_config, model, &dataset(), None, &device, None, &stop).unwrap();
        assert!(outcome.stopped);
        assert_eq!(outcome.steps, 0);

        let meta: CheckpointMeta =
            serde_json::from_reader(std::fs::File::open(dir.path().join("step_0/meta.json")).unwrap()).unwrap();
        assert_eq!(meta, CheckpointMeta { step: 0, last_loss: None });
    }
}

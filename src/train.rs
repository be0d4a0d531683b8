use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use candle_core::{DType, Tensor};
use candle_nn::{Optimizer, VarBuilder, VarMap, SGD};
use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};

use crate::checkpoint::{latest_checkpoint, load_checkpoint, save_checkpoint};
use crate::config::RunContext;
use crate::dataset::{discover_samples, load_batch, DatasetConfig, OccupancyDataset, SafeDataset};
use crate::eval::run_eval;
use crate::metrics::ScalarLog;
use crate::model::{OccupancyModel, OccupancyNet};

/// Channel width of the first encoder stage; deeper stages double it.
pub const BASE_CHANNELS: usize = 32;

pub fn run_training(ctx: &RunContext) -> anyhow::Result<()> {
    let cfg = &ctx.cfg;

    let samples = discover_samples(Path::new(&cfg.train_dir))?;
    println!("Discovered {} training samples", samples.len());
    let dataset = SafeDataset::new(OccupancyDataset::new(
        samples,
        DatasetConfig {
            image_size: cfg.image_size,
            resolution: cfg.resolution,
            query_points: cfg.query_points(),
        },
    )?);

    let run_id = Utc::now().format("%Y%m%d-%H%M%S").to_string();
    let run_dir = PathBuf::from(&cfg.save_dir).join(&run_id);
    fs::create_dir_all(&run_dir)
        .with_context(|| format!("Failed creating run directory: {}", run_dir.display()))?;
    println!("Run directory: {}", run_dir.display());

    let config_path = run_dir.join("config.json");
    fs::write(&config_path, serde_json::to_string_pretty(cfg)?)
        .with_context(|| format!("Failed writing config: {}", config_path.display()))?;

    let mut varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &ctx.device);
    let model = OccupancyNet::new(BASE_CHANNELS, vb)?;

    let mut start_epoch = 0usize;
    if let Some(load_dir) = &cfg.load_ckpt_dir {
        let (ckpt_path, epoch) = latest_checkpoint(Path::new(load_dir))?;
        println!(
            "Resuming from checkpoint: {} (epoch {epoch})",
            ckpt_path.display()
        );
        load_checkpoint(&mut varmap, &ckpt_path)?;
        start_epoch = epoch;
    }

    let mut optimizer = SGD::new(varmap.all_vars(), cfg.learning_rate)?;
    let mut metrics = ScalarLog::create(&run_dir.join("metrics.jsonl"))?;

    let total_epochs = start_epoch + cfg.num_epochs;
    for epoch_idx in start_epoch..total_epochs {
        let loss = train_epoch(ctx, &dataset, &model, &mut optimizer, epoch_idx, total_epochs)?;
        metrics.log_scalar("loss/train", epoch_idx, loss)?;

        if epoch_idx % cfg.checkpoint_every == 0 {
            let path = save_checkpoint(&varmap, &run_dir, epoch_idx + 1)?;
            println!("Saved checkpoint: {}", path.display());
        }
    }

    let path = save_checkpoint(&varmap, &run_dir, total_epochs)?;
    println!("Saved final checkpoint: {}", path.display());

    if dataset.skipped_count() > 0 {
        println!(
            "Skipped {} unreadable samples during training",
            dataset.skipped_count()
        );
    }

    run_eval(
        ctx,
        &dataset,
        &model,
        cfg.threshold,
        Some(total_epochs),
        &run_dir,
    )?;

    metrics.finish()?;
    println!("Done");
    Ok(())
}

/// Runs one full pass over the training set: forward, reshape to the grid,
/// BCE loss, backward, optimizer step per batch.
///
/// Returns the loss of the final batch processed, not an epoch average; the
/// per-epoch series in the metrics log records exactly that value.
fn train_epoch(
    ctx: &RunContext,
    dataset: &SafeDataset,
    model: &impl OccupancyModel,
    optimizer: &mut SGD,
    epoch_idx: usize,
    total_epochs: usize,
) -> anyhow::Result<f64> {
    let cfg = &ctx.cfg;
    let indices: Vec<usize> = (0..dataset.len()).collect();
    let num_batches = indices.len().div_ceil(cfg.batch_size);

    let progress = ProgressBar::new(num_batches as u64);
    progress.set_style(progress_style());
    progress.set_prefix(format!("Epoch {}/{}", epoch_idx + 1, total_epochs));

    let mut last_loss = None;
    for batch_indices in indices.chunks(cfg.batch_size) {
        let Some(batch) = load_batch(dataset, batch_indices, &ctx.device)? else {
            progress.inc(1);
            continue;
        };

        let pred = model.forward(&batch.images, &batch.points)?;
        let grid_pred = pred.reshape((
            batch.len,
            cfg.resolution,
            cfg.resolution,
            cfg.resolution,
        ))?;
        let loss = bce_loss(&grid_pred, &batch.occupancy)?;
        optimizer.backward_step(&loss)?;

        let loss_value = f64::from(loss.to_scalar::<f32>()?);
        last_loss = Some(loss_value);
        progress.set_message(format!("loss={loss_value:.5}"));
        progress.inc(1);
    }
    progress.finish_and_clear();

    let loss = last_loss.context("No batches could be loaded for this epoch")?;
    println!("Epoch {}/{}: loss={loss:.5}", epoch_idx + 1, total_epochs);
    Ok(loss)
}

/// Binary cross-entropy over probabilities, averaged over every grid cell.
/// Predictions are clamped away from 0 and 1 before the log.
pub(crate) fn bce_loss(pred: &Tensor, target: &Tensor) -> candle_core::Result<Tensor> {
    let pred = pred.clamp(1e-7f32, 1.0 - 1e-7f32)?;
    let log_p = pred.log()?;
    let log_not_p = pred.affine(-1.0, 1.0)?.log()?;
    let term_pos = target.mul(&log_p)?;
    let term_neg = target.affine(-1.0, 1.0)?.mul(&log_not_p)?;
    term_pos.add(&term_neg)?.mean_all()?.neg()
}

fn progress_style() -> ProgressStyle {
    ProgressStyle::with_template("{prefix} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-")
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn prediction_reshape_round_trips_when_t_is_r_cubed() {
        let device = Device::Cpu;
        let values: Vec<f32> = (0..16).map(|v| v as f32).collect();
        let pred = Tensor::from_vec(values.clone(), (2, 1, 8), &device).unwrap();

        let grid = pred.reshape((2, 2, 2, 2)).unwrap();
        assert_eq!(grid.dims(), &[2, 2, 2, 2]);

        let back = grid
            .reshape((2, 1, 8))
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert_eq!(back, values);
    }

    #[test]
    fn bce_matches_hand_computed_value() {
        let device = Device::Cpu;
        let pred = Tensor::from_vec(vec![0.5f32, 0.9, 0.1], (3,), &device).unwrap();
        let target = Tensor::from_vec(vec![1.0f32, 1.0, 0.0], (3,), &device).unwrap();
        let loss = bce_loss(&pred, &target).unwrap().to_scalar::<f32>().unwrap();
        // -(ln 0.5 + ln 0.9 + ln 0.9) / 3
        let expected = -(0.5f32.ln() + 0.9f32.ln() + 0.9f32.ln()) / 3.0;
        assert!((loss - expected).abs() < 1e-5);
    }

    #[test]
    fn bce_is_near_zero_for_confident_correct_predictions() {
        let device = Device::Cpu;
        let pred = Tensor::from_vec(vec![0.9999f32, 0.0001], (2,), &device).unwrap();
        let target = Tensor::from_vec(vec![1.0f32, 0.0], (2,), &device).unwrap();
        let loss = bce_loss(&pred, &target).unwrap().to_scalar::<f32>().unwrap();
        assert!(loss < 1e-3);
    }

    #[test]
    fn bce_survives_saturated_predictions() {
        let device = Device::Cpu;
        let pred = Tensor::from_vec(vec![1.0f32, 0.0], (2,), &device).unwrap();
        let target = Tensor::from_vec(vec![0.0f32, 1.0], (2,), &device).unwrap();
        let loss = bce_loss(&pred, &target).unwrap().to_scalar::<f32>().unwrap();
        assert!(loss.is_finite());
    }
}

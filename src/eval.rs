use std::path::Path;

use anyhow::Context;
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};

use crate::checkpoint::{latest_checkpoint, load_checkpoint};
use crate::config::RunContext;
use crate::dataset::{discover_samples, load_batch, DatasetConfig, OccupancyDataset, SafeDataset};
use crate::model::{OccupancyModel, OccupancyNet};
use crate::train::{bce_loss, BASE_CHANNELS};
use crate::voxel::{draw_voxel_grid, pointcloud_to_voxel, save_to_binvox};

/// Standalone test mode: restore the latest checkpoint from
/// `--load-ckpt-dir` and run one evaluation pass over the test set, writing
/// the voxel grid outputs next to the checkpoints.
pub fn run_test(ctx: &RunContext) -> anyhow::Result<()> {
    let cfg = &ctx.cfg;
    let load_dir = cfg
        .load_ckpt_dir
        .as_ref()
        .context("checkpoint directory needed for test mode, use --load-ckpt-dir")?;
    let load_dir = Path::new(load_dir);

    let (ckpt_path, epoch) = latest_checkpoint(load_dir)?;
    println!(
        "Loading checkpoint: {} (epoch {epoch})",
        ckpt_path.display()
    );

    let mut varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &ctx.device);
    let model = OccupancyNet::new(BASE_CHANNELS, vb)?;
    load_checkpoint(&mut varmap, &ckpt_path)?;

    let samples = discover_samples(Path::new(&cfg.test_dir))?;
    println!("Discovered {} test samples", samples.len());
    let dataset = SafeDataset::new(OccupancyDataset::new(
        samples,
        DatasetConfig {
            image_size: cfg.image_size,
            resolution: cfg.resolution,
            query_points: cfg.query_points(),
        },
    )?);

    run_eval(ctx, &dataset, &model, cfg.threshold, None, load_dir)
}

/// Inference-only diagnostic pass over a dataset.
///
/// Accumulates per-batch loss and prints the running mean, pools every query
/// point whose predicted occupancy strictly exceeds `threshold` into one
/// point cloud for the whole pass, then rasterizes and persists that cloud.
/// When nothing crosses the threshold, no files are written. Output names
/// carry the epoch number when `after_epoch` is given; otherwise the fixed
/// `voxel_grid` stem is used.
pub fn run_eval(
    ctx: &RunContext,
    dataset: &SafeDataset,
    model: &impl OccupancyModel,
    threshold: f32,
    after_epoch: Option<usize>,
    out_dir: &Path,
) -> anyhow::Result<()> {
    let cfg = &ctx.cfg;
    let indices: Vec<usize> = (0..dataset.len()).collect();

    let mut losses: Vec<f64> = Vec::new();
    let mut pointcloud: Vec<[f32; 3]> = Vec::new();

    for (batch_idx, batch_indices) in indices.chunks(cfg.batch_size).enumerate() {
        let Some(batch) = load_batch(dataset, batch_indices, &ctx.device)? else {
            continue;
        };

        let pred = model.forward(&batch.images, &batch.points)?;
        let grid_pred = pred.reshape((
            batch.len,
            cfg.resolution,
            cfg.resolution,
            cfg.resolution,
        ))?;
        losses.push(f64::from(
            bce_loss(&grid_pred, &batch.occupancy)?.to_scalar::<f32>()?,
        ));
        let mean = losses.iter().sum::<f64>() / losses.len() as f64;
        println!("  batch {batch_idx}: running mean loss={mean:.5}");

        collect_points_over_threshold(&pred, &batch.points, threshold, &mut pointcloud)?;
    }

    println!("Pooled point cloud size: {}", pointcloud.len());
    persist_voxel_outputs(&pointcloud, cfg.resolution, threshold, after_epoch, out_dir)?;
    Ok(())
}

/// Rasterizes the pooled point cloud and writes the image and binvox files.
/// An empty cloud writes nothing.
fn persist_voxel_outputs(
    pointcloud: &[[f32; 3]],
    resolution: usize,
    threshold: f32,
    after_epoch: Option<usize>,
    out_dir: &Path,
) -> anyhow::Result<()> {
    if pointcloud.is_empty() {
        println!("No predictions exceeded threshold {threshold}; skipping voxelization");
        return Ok(());
    }

    let (grid, dropped) = pointcloud_to_voxel(pointcloud, resolution);
    if dropped > 0 {
        println!("Dropped {dropped} out-of-range points during voxelization");
    }

    let stem = match after_epoch {
        Some(epoch) => format!("voxel_grid_e{epoch}"),
        None => "voxel_grid".to_string(),
    };
    let image_path = out_dir.join(format!("{stem}.png"));
    draw_voxel_grid(&grid, &image_path)?;
    let binvox_path = out_dir.join(format!("{stem}.binvox"));
    save_to_binvox(&grid, resolution, &binvox_path)?;
    println!(
        "Wrote {} and {}",
        image_path.display(),
        binvox_path.display()
    );
    Ok(())
}

/// Appends the coordinates of every query point whose predicted occupancy is
/// strictly greater than `threshold` to `pointcloud`.
fn collect_points_over_threshold(
    pred: &Tensor,
    points: &Tensor,
    threshold: f32,
    pointcloud: &mut Vec<[f32; 3]>,
) -> anyhow::Result<()> {
    let pred = pred.to_device(&Device::Cpu)?;
    let points = points.to_device(&Device::Cpu)?;
    let (batch, _, query_count) = pred.dims3()?;
    let pred_values = pred.flatten_all()?.to_vec1::<f32>()?;
    let point_values = points.to_vec3::<f32>()?;

    for b in 0..batch {
        for t in 0..query_count {
            if pred_values[b * query_count + t] > threshold {
                pointcloud.push([
                    point_values[b][0][t],
                    point_values[b][1][t],
                    point_values[b][2][t],
                ]);
            }
        }
    }
    Ok(())
}

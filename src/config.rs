use candle_core::Device;
use clap::{Parser, ValueEnum};
use serde::Serialize;

use crate::error::TrainerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Train,
    Test,
}

#[derive(Debug, Clone, Serialize, Parser)]
#[command(
    name = "voxel-occupancy-rs",
    about = "Train a single-view voxel occupancy network on ShapeNet-style renders using Candle"
)]
pub struct RunConfig {
    #[arg(long, value_enum, default_value = "train")]
    pub mode: Mode,

    #[arg(
        long,
        default_value = "./data/train",
        help = "Directory of training sample folders (rendering.png + points.npy + occupancy.npy)"
    )]
    pub train_dir: String,

    #[arg(
        long,
        default_value = "./data/test",
        help = "Directory of test sample folders"
    )]
    pub test_dir: String,

    #[arg(
        long,
        default_value = "./outputs-rs",
        help = "Root directory for checkpoints and visualization images; each training run writes into a timestamped subdirectory"
    )]
    pub save_dir: String,

    #[arg(
        long,
        help = "Directory to load checkpoints from. Required for test mode; resumes training when given in train mode"
    )]
    pub load_ckpt_dir: Option<String>,

    #[arg(long, default_value_t = 100)]
    pub num_epochs: usize,

    #[arg(long, default_value_t = 4)]
    pub batch_size: usize,

    #[arg(long, default_value_t = 16, help = "Voxel grid resolution per axis")]
    pub resolution: usize,

    #[arg(long, default_value_t = 224, help = "Square side length input images are resized to")]
    pub image_size: usize,

    #[arg(long, default_value_t = 1e-4)]
    pub learning_rate: f64,

    #[arg(long, default_value_t = 0.5, help = "Occupancy probability threshold for point extraction")]
    pub threshold: f32,

    #[arg(long, default_value_t = 100, help = "Save a checkpoint every this many epochs")]
    pub checkpoint_every: usize,

    #[arg(long, default_value = "auto")]
    pub device: String,
}

impl RunConfig {
    /// Number of query points per sample. The prediction over T points is
    /// reshaped to an R^3 grid for the loss, so T is pinned to resolution^3.
    pub fn query_points(&self) -> usize {
        self.resolution * self.resolution * self.resolution
    }

    pub fn validate(&self) -> Result<(), TrainerError> {
        if self.batch_size == 0 {
            return Err(config_error("--batch-size must be > 0"));
        }
        if self.resolution == 0 {
            return Err(config_error("--resolution must be > 0"));
        }
        if self.image_size == 0 || self.image_size % 16 != 0 {
            return Err(config_error(format!(
                "--image-size must be a positive multiple of 16, got {}",
                self.image_size
            )));
        }
        if self.mode == Mode::Train && self.num_epochs == 0 {
            return Err(config_error("--num-epochs must be > 0 in train mode"));
        }
        if self.checkpoint_every == 0 {
            return Err(config_error("--checkpoint-every must be > 0"));
        }
        if !(0.0..1.0).contains(&self.threshold) {
            return Err(config_error(format!(
                "--threshold must be in [0, 1), got {}",
                self.threshold
            )));
        }
        if self.learning_rate <= 0.0 {
            return Err(config_error("--learning-rate must be > 0"));
        }
        if self.mode == Mode::Test && self.load_ckpt_dir.is_none() {
            return Err(config_error(
                "checkpoint directory needed for test mode, use --load-ckpt-dir",
            ));
        }
        Ok(())
    }
}

fn config_error(message: impl Into<String>) -> TrainerError {
    TrainerError::Configuration {
        message: message.into(),
    }
}

/// Everything a loop needs that is fixed for the whole run: the parsed
/// configuration and the resolved compute device.
pub struct RunContext {
    pub cfg: RunConfig,
    pub device: Device,
}

impl RunContext {
    pub fn new(cfg: RunConfig) -> anyhow::Result<Self> {
        cfg.validate()?;
        let device = resolve_device(&cfg.device)?;
        Ok(Self { cfg, device })
    }
}

fn resolve_device(device_arg: &str) -> anyhow::Result<Device> {
    use anyhow::Context;
    match device_arg {
        "auto" => match Device::cuda_if_available(0) {
            Ok(device) => Ok(device),
            Err(_) => Ok(Device::Cpu),
        },
        "cpu" => Ok(Device::Cpu),
        "cuda" => Device::cuda_if_available(0)
            .context("CUDA requested with --device cuda, but CUDA is not available"),
        other => anyhow::bail!("Unsupported --device value: {other} (expected auto|cpu|cuda)"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> RunConfig {
        RunConfig::parse_from(["voxel-occupancy-rs"])
    }

    #[test]
    fn default_config_is_valid() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn query_points_track_resolution_cubed() {
        let mut cfg = base_config();
        cfg.resolution = 8;
        assert_eq!(cfg.query_points(), 512);
    }

    #[test]
    fn test_mode_requires_checkpoint_dir() {
        let mut cfg = base_config();
        cfg.mode = Mode::Test;
        cfg.load_ckpt_dir = None;
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, TrainerError::Configuration { .. }));

        cfg.load_ckpt_dir = Some("./ckpts".to_string());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_threshold_outside_unit_interval() {
        let mut cfg = base_config();
        cfg.threshold = 1.0;
        assert!(cfg.validate().is_err());
        cfg.threshold = -0.1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_zero_batch_size() {
        let mut cfg = base_config();
        cfg.batch_size = 0;
        assert!(cfg.validate().is_err());
    }
}

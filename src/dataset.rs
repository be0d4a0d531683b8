use std::cell::Cell;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use candle_core::{Device, Tensor};
use ndarray::{Array2, Array3};
use ndarray_npy::read_npy;

use crate::error::TrainerError;

/// File locations for one object-view sample.
#[derive(Clone, Debug)]
pub struct SampleSource {
    pub image_path: PathBuf,
    pub points_path: PathBuf,
    pub occupancy_path: PathBuf,
}

#[derive(Clone, Debug)]
pub struct DatasetConfig {
    pub image_size: usize,
    pub resolution: usize,
    pub query_points: usize,
}

/// One loaded sample as flat CHW / row-major f32 buffers.
#[derive(Debug)]
pub struct SampleTensors {
    /// RGB image, `3 * image_size * image_size`, channel-major.
    pub image: Vec<f32>,
    /// Query points, row-major `(3, T)`.
    pub points: Vec<f32>,
    /// Ground-truth occupancy, row-major `(R, R, R)`.
    pub occupancy: Vec<f32>,
}

#[derive(Debug)]
pub struct OccupancyDataset {
    samples: Vec<SampleSource>,
    cfg: DatasetConfig,
}

impl OccupancyDataset {
    pub fn new(samples: Vec<SampleSource>, cfg: DatasetConfig) -> anyhow::Result<Self> {
        if samples.is_empty() {
            anyhow::bail!("No samples were provided");
        }
        Ok(Self { samples, cfg })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn cfg(&self) -> &DatasetConfig {
        &self.cfg
    }

    pub fn load_item(&self, index: usize) -> anyhow::Result<SampleTensors> {
        let sample = self
            .samples
            .get(index)
            .with_context(|| format!("Sample index out of bounds: {index}"))?;

        let image = load_rgb_as_chw(&sample.image_path, self.cfg.image_size)?;
        let points = load_points(&sample.points_path, self.cfg.query_points)?;
        let occupancy = load_occupancy(&sample.occupancy_path, self.cfg.resolution)?;

        Ok(SampleTensors {
            image,
            points,
            occupancy,
        })
    }
}

/// Wrapper that skips samples failing to load instead of aborting the epoch.
/// Each failure is reported once on stderr and counted.
pub struct SafeDataset {
    inner: OccupancyDataset,
    skipped: Cell<usize>,
}

impl SafeDataset {
    pub fn new(inner: OccupancyDataset) -> Self {
        Self {
            inner,
            skipped: Cell::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn cfg(&self) -> &DatasetConfig {
        &self.inner.cfg
    }

    pub fn skipped_count(&self) -> usize {
        self.skipped.get()
    }

    pub fn load_item(&self, index: usize) -> Option<SampleTensors> {
        match self.inner.load_item(index) {
            Ok(sample) => Some(sample),
            Err(err) => {
                eprintln!("Warning: skipping sample {index}: {err:#}");
                self.skipped.set(self.skipped.get() + 1);
                None
            }
        }
    }
}

/// One device-resident batch of stacked samples.
pub struct Batch {
    /// `(B, 3, S, S)`
    pub images: Tensor,
    /// `(B, 3, T)`
    pub points: Tensor,
    /// `(B, R, R, R)`
    pub occupancy: Tensor,
    pub len: usize,
}

/// Loads the given sample indices through the safe wrapper and stacks the
/// survivors along a new leading dimension. Returns `None` when every sample
/// in the batch failed to load.
pub fn load_batch(
    dataset: &SafeDataset,
    batch_indices: &[usize],
    device: &Device,
) -> anyhow::Result<Option<Batch>> {
    let cfg = dataset.cfg();
    let cpu = Device::Cpu;
    let mut image_tensors = Vec::with_capacity(batch_indices.len());
    let mut point_tensors = Vec::with_capacity(batch_indices.len());
    let mut occupancy_tensors = Vec::with_capacity(batch_indices.len());

    for sample_idx in batch_indices {
        let Some(sample) = dataset.load_item(*sample_idx) else {
            continue;
        };
        let image = Tensor::from_vec(
            sample.image,
            (3, cfg.image_size, cfg.image_size),
            &cpu,
        )
        .context("Failed to build image tensor")?;
        let points = Tensor::from_vec(sample.points, (3, cfg.query_points), &cpu)
            .context("Failed to build query point tensor")?;
        let occupancy = Tensor::from_vec(
            sample.occupancy,
            (cfg.resolution, cfg.resolution, cfg.resolution),
            &cpu,
        )
        .context("Failed to build occupancy tensor")?;
        image_tensors.push(image);
        point_tensors.push(points);
        occupancy_tensors.push(occupancy);
    }

    if image_tensors.is_empty() {
        return Ok(None);
    }

    let len = image_tensors.len();
    let image_refs: Vec<&Tensor> = image_tensors.iter().collect();
    let point_refs: Vec<&Tensor> = point_tensors.iter().collect();
    let occupancy_refs: Vec<&Tensor> = occupancy_tensors.iter().collect();
    let images = Tensor::stack(&image_refs, 0)?;
    let points = Tensor::stack(&point_refs, 0)?;
    let occupancy = Tensor::stack(&occupancy_refs, 0)?;

    Ok(Some(Batch {
        images: images.to_device(device)?,
        points: points.to_device(device)?,
        occupancy: occupancy.to_device(device)?,
        len,
    }))
}

/// Scans `data_root` for sample directories. A sample directory contains a
/// rendering image, `points.npy`, and `occupancy.npy`; directories missing
/// any of the three are ignored.
pub fn discover_samples(data_root: &Path) -> anyhow::Result<Vec<SampleSource>> {
    if !data_root.exists() {
        anyhow::bail!("Data root does not exist: {}", data_root.display());
    }

    let mut sample_dirs: Vec<PathBuf> = fs::read_dir(data_root)
        .with_context(|| format!("Failed to read data root: {}", data_root.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    sample_dirs.sort();

    let mut samples = Vec::new();
    for dir in sample_dirs {
        let points_path = dir.join("points.npy");
        let occupancy_path = dir.join("occupancy.npy");
        let Some(image_path) = resolve_rendering_path(&dir) else {
            continue;
        };
        if points_path.exists() && occupancy_path.exists() {
            samples.push(SampleSource {
                image_path,
                points_path,
                occupancy_path,
            });
        }
    }

    Ok(samples)
}

fn resolve_rendering_path(dir: &Path) -> Option<PathBuf> {
    ["png", "jpg", "jpeg"]
        .iter()
        .map(|ext| dir.join(format!("rendering.{ext}")))
        .find(|candidate| candidate.exists())
}

fn load_points(path: &Path, query_points: usize) -> anyhow::Result<Vec<f32>> {
    let points: Array2<f32> = read_npy(path)
        .with_context(|| format!("Failed to read query points: {}", path.display()))?;
    let shape = points.shape().to_vec();
    if shape != [3, query_points] {
        return Err(TrainerError::ShapeMismatch {
            name: "query points",
            expected: vec![3, query_points],
            got: shape,
        }
        .into());
    }
    Ok(points.iter().copied().collect())
}

fn load_occupancy(path: &Path, resolution: usize) -> anyhow::Result<Vec<f32>> {
    let occupancy: Array3<f32> = read_npy(path)
        .with_context(|| format!("Failed to read occupancy grid: {}", path.display()))?;
    let shape = occupancy.shape().to_vec();
    if shape != [resolution, resolution, resolution] {
        return Err(TrainerError::ShapeMismatch {
            name: "occupancy grid",
            expected: vec![resolution, resolution, resolution],
            got: shape,
        }
        .into());
    }
    Ok(occupancy.iter().copied().collect())
}

fn load_rgb_as_chw(path: &Path, target_size: usize) -> anyhow::Result<Vec<f32>> {
    let rgb = image::open(path)
        .with_context(|| format!("Failed to open rendering: {}", path.display()))?
        .to_rgb8();
    let (src_w_u32, src_h_u32) = rgb.dimensions();
    let src_w = src_w_u32 as usize;
    let src_h = src_h_u32 as usize;

    let mut channels = [
        vec![0f32; src_h * src_w],
        vec![0f32; src_h * src_w],
        vec![0f32; src_h * src_w],
    ];

    for (idx, pixel) in rgb.pixels().enumerate() {
        channels[0][idx] = f32::from(pixel[0]) / 255.0;
        channels[1][idx] = f32::from(pixel[1]) / 255.0;
        channels[2][idx] = f32::from(pixel[2]) / 255.0;
    }

    let pixels = target_size * target_size;
    let mut out = vec![0f32; 3 * pixels];
    for (channel, slot) in channels.iter().enumerate() {
        let resized = resize_bilinear_channel(slot, src_h, src_w, target_size, target_size);
        out[channel * pixels..(channel + 1) * pixels].copy_from_slice(&resized);
    }
    Ok(out)
}

fn resize_bilinear_channel(
    src: &[f32],
    src_h: usize,
    src_w: usize,
    dst_h: usize,
    dst_w: usize,
) -> Vec<f32> {
    if src_h == dst_h && src_w == dst_w {
        return src.to_vec();
    }

    let mut out = vec![0f32; dst_h * dst_w];
    let scale_y = src_h as f32 / dst_h as f32;
    let scale_x = src_w as f32 / dst_w as f32;

    for y in 0..dst_h {
        let in_y = ((y as f32 + 0.5) * scale_y - 0.5)
            .max(0.0)
            .min((src_h - 1) as f32);
        let y0 = in_y.floor() as usize;
        let y1 = (y0 + 1).min(src_h - 1);
        let wy = in_y - y0 as f32;

        for x in 0..dst_w {
            let in_x = ((x as f32 + 0.5) * scale_x - 0.5)
                .max(0.0)
                .min((src_w - 1) as f32);
            let x0 = in_x.floor() as usize;
            let x1 = (x0 + 1).min(src_w - 1);
            let wx = in_x - x0 as f32;

            let top = src[y0 * src_w + x0] * (1.0 - wx) + src[y0 * src_w + x1] * wx;
            let bottom = src[y1 * src_w + x0] * (1.0 - wx) + src[y1 * src_w + x1] * wx;
            out[y * dst_w + x] = top * (1.0 - wy) + bottom * wy;
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray_npy::write_npy;

    fn scratch_root(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join("voxel-occupancy-rs-tests")
            .join(format!("{name}-{}", std::process::id()));
        if dir.exists() {
            fs::remove_dir_all(&dir).unwrap();
        }
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_sample(dir: &Path, resolution: usize) {
        fs::create_dir_all(dir).unwrap();
        let image = image::RgbImage::from_pixel(12, 12, image::Rgb([128, 64, 32]));
        image.save(dir.join("rendering.png")).unwrap();

        let t = resolution * resolution * resolution;
        let points = Array2::<f32>::zeros((3, t));
        write_npy(dir.join("points.npy"), &points).unwrap();
        let occupancy = Array3::<f32>::zeros((resolution, resolution, resolution));
        write_npy(dir.join("occupancy.npy"), &occupancy).unwrap();
    }

    fn test_cfg(resolution: usize) -> DatasetConfig {
        DatasetConfig {
            image_size: 8,
            resolution,
            query_points: resolution * resolution * resolution,
        }
    }

    #[test]
    fn discovers_complete_sample_directories_only() {
        let root = scratch_root("discover");
        write_sample(&root.join("obj_a"), 2);
        write_sample(&root.join("obj_b"), 2);
        // Incomplete: no occupancy file.
        let partial = root.join("obj_c");
        fs::create_dir_all(&partial).unwrap();
        image::RgbImage::new(4, 4).save(partial.join("rendering.png")).unwrap();
        write_npy(partial.join("points.npy"), &Array2::<f32>::zeros((3, 8))).unwrap();

        let samples = discover_samples(&root).unwrap();
        assert_eq!(samples.len(), 2);
        assert!(samples[0].image_path.starts_with(root.join("obj_a")));
        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn load_item_produces_expected_buffer_sizes() {
        let root = scratch_root("load-item");
        write_sample(&root.join("obj"), 2);
        let samples = discover_samples(&root).unwrap();
        let dataset = OccupancyDataset::new(samples, test_cfg(2)).unwrap();

        let sample = dataset.load_item(0).unwrap();
        assert_eq!(sample.image.len(), 3 * 8 * 8);
        assert_eq!(sample.points.len(), 3 * 8);
        assert_eq!(sample.occupancy.len(), 8);
        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn mismatched_occupancy_shape_is_a_shape_error() {
        let root = scratch_root("shape-mismatch");
        write_sample(&root.join("obj"), 2);
        // Overwrite with a grid at the wrong resolution.
        write_npy(
            root.join("obj/occupancy.npy"),
            &Array3::<f32>::zeros((3, 3, 3)),
        )
        .unwrap();

        let samples = discover_samples(&root).unwrap();
        let dataset = OccupancyDataset::new(samples, test_cfg(2)).unwrap();
        let err = dataset.load_item(0).unwrap_err();
        assert!(err.downcast_ref::<TrainerError>().is_some());
        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn safe_dataset_skips_corrupt_samples() {
        let root = scratch_root("safe-skip");
        write_sample(&root.join("obj_a"), 2);
        write_sample(&root.join("obj_b"), 2);
        fs::write(root.join("obj_a/points.npy"), b"not an npy file").unwrap();

        let samples = discover_samples(&root).unwrap();
        let dataset = SafeDataset::new(OccupancyDataset::new(samples, test_cfg(2)).unwrap());

        assert!(dataset.load_item(0).is_none());
        assert!(dataset.load_item(1).is_some());
        assert_eq!(dataset.skipped_count(), 1);
        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn load_batch_stacks_surviving_samples() {
        let root = scratch_root("load-batch");
        write_sample(&root.join("obj_a"), 2);
        write_sample(&root.join("obj_b"), 2);
        fs::write(root.join("obj_b/points.npy"), b"junk").unwrap();

        let samples = discover_samples(&root).unwrap();
        let dataset = SafeDataset::new(OccupancyDataset::new(samples, test_cfg(2)).unwrap());

        let batch = load_batch(&dataset, &[0, 1], &Device::Cpu)
            .unwrap()
            .expect("one sample should survive");
        assert_eq!(batch.len, 1);
        assert_eq!(batch.images.dims(), &[1, 3, 8, 8]);
        assert_eq!(batch.points.dims(), &[1, 3, 8]);
        assert_eq!(batch.occupancy.dims(), &[1, 2, 2, 2]);
        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn resize_is_identity_at_matching_size() {
        let src = vec![0.0, 0.25, 0.5, 1.0];
        assert_eq!(resize_bilinear_channel(&src, 2, 2, 2, 2), src);
    }
}

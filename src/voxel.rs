use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::Context;
use image::{ImageBuffer, Rgb, RgbImage};

/// Binary occupancy grid over a cubic lattice of `resolution` cells per axis.
#[derive(Debug, Clone)]
pub struct VoxelGrid {
    resolution: usize,
    cells: Vec<bool>,
}

impl VoxelGrid {
    pub fn new(resolution: usize) -> Self {
        Self {
            resolution,
            cells: vec![false; resolution * resolution * resolution],
        }
    }

    pub fn resolution(&self) -> usize {
        self.resolution
    }

    fn index(&self, x: usize, y: usize, z: usize) -> usize {
        (x * self.resolution + y) * self.resolution + z
    }

    pub fn mark(&mut self, x: usize, y: usize, z: usize) {
        let idx = self.index(x, y, z);
        self.cells[idx] = true;
    }

    pub fn is_occupied(&self, x: usize, y: usize, z: usize) -> bool {
        self.cells[self.index(x, y, z)]
    }

    pub fn occupied_count(&self) -> usize {
        self.cells.iter().filter(|cell| **cell).count()
    }
}

/// Rasterizes a point cloud into a binary voxel grid.
///
/// Points are expected in grid coordinates, i.e. each component in
/// `[0, resolution)`. Components are floored to a cell index; points falling
/// outside the lattice are dropped rather than clipped, and the number of
/// dropped points is returned so callers can report it.
pub fn pointcloud_to_voxel(points: &[[f32; 3]], resolution: usize) -> (VoxelGrid, usize) {
    let mut grid = VoxelGrid::new(resolution);
    let mut dropped = 0usize;

    for point in points {
        match cell_of(point, resolution) {
            Some((x, y, z)) => grid.mark(x, y, z),
            None => dropped += 1,
        }
    }

    (grid, dropped)
}

fn cell_of(point: &[f32; 3], resolution: usize) -> Option<(usize, usize, usize)> {
    let max = resolution as f32;
    let [x, y, z] = *point;
    if !(x.is_finite() && y.is_finite() && z.is_finite()) {
        return None;
    }
    if x < 0.0 || y < 0.0 || z < 0.0 || x >= max || y >= max || z >= max {
        return None;
    }
    Some((x.floor() as usize, y.floor() as usize, z.floor() as usize))
}

/// Renders the grid as three orthographic projections (XY, XZ, YZ) laid out
/// side by side, and writes the montage as a PNG.
pub fn draw_voxel_grid(grid: &VoxelGrid, path: &Path) -> anyhow::Result<()> {
    let r = grid.resolution();
    let cell_px = (256 / r.max(1)).max(1);
    let panel = r * cell_px;

    let xy = project(grid, |g, a, b| (0..r).any(|c| g.is_occupied(a, b, c)));
    let xz = project(grid, |g, a, b| (0..r).any(|c| g.is_occupied(a, c, b)));
    let yz = project(grid, |g, a, b| (0..r).any(|c| g.is_occupied(c, a, b)));

    let mut montage: RgbImage = ImageBuffer::new((panel * 3) as u32, panel as u32);
    blit_panel(&mut montage, &xy, r, cell_px, 0);
    blit_panel(&mut montage, &xz, r, cell_px, panel);
    blit_panel(&mut montage, &yz, r, cell_px, panel * 2);

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create output dir: {}", parent.display()))?;
    }
    montage
        .save(path)
        .with_context(|| format!("Failed to write voxel grid image: {}", path.display()))?;
    Ok(())
}

fn project(grid: &VoxelGrid, occupied: impl Fn(&VoxelGrid, usize, usize) -> bool) -> Vec<bool> {
    let r = grid.resolution();
    let mut out = vec![false; r * r];
    for a in 0..r {
        for b in 0..r {
            out[a * r + b] = occupied(grid, a, b);
        }
    }
    out
}

fn blit_panel(dst: &mut RgbImage, panel: &[bool], r: usize, cell_px: usize, x_offset: usize) {
    for a in 0..r {
        for b in 0..r {
            let value = if panel[a * r + b] { 255u8 } else { 16u8 };
            for dy in 0..cell_px {
                for dx in 0..cell_px {
                    dst.put_pixel(
                        (x_offset + a * cell_px + dx) as u32,
                        (b * cell_px + dy) as u32,
                        Rgb([value, value, value]),
                    );
                }
            }
        }
    }
}

/// Serializes the grid in binvox format: an ASCII header followed by
/// run-length-encoded (value, count) byte pairs. Voxels are emitted in the
/// format's x-slowest, z-middle, y-fastest order with runs capped at 255.
pub fn save_to_binvox(grid: &VoxelGrid, resolution: usize, path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create output dir: {}", parent.display()))?;
    }
    let file = File::create(path)
        .with_context(|| format!("Failed to create binvox file: {}", path.display()))?;
    let mut writer = BufWriter::new(file);

    writeln!(writer, "#binvox 1")?;
    writeln!(writer, "dim {resolution} {resolution} {resolution}")?;
    writeln!(writer, "translate 0 0 0")?;
    writeln!(writer, "scale 1")?;
    writeln!(writer, "data")?;

    for (value, count) in rle_runs(grid) {
        writer.write_all(&[value, count])?;
    }

    writer
        .flush()
        .with_context(|| format!("Failed to write binvox file: {}", path.display()))?;
    Ok(())
}

fn rle_runs(grid: &VoxelGrid) -> Vec<(u8, u8)> {
    let r = grid.resolution();
    let mut runs = Vec::new();
    let mut current: Option<(u8, u8)> = None;

    for x in 0..r {
        for z in 0..r {
            for y in 0..r {
                let value = u8::from(grid.is_occupied(x, y, z));
                current = match current {
                    Some((run_value, count)) if run_value == value && count < u8::MAX => {
                        Some((run_value, count + 1))
                    }
                    Some(run) => {
                        runs.push(run);
                        Some((value, 1))
                    }
                    None => Some((value, 1)),
                };
            }
        }
    }

    if let Some(run) = current {
        runs.push(run);
    }
    runs
}

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Configuration for a full pipeline run.
///
/// Every stage receives this struct explicitly; there is no process-wide
/// mutable state, so tests can run stages single-threaded and deterministic.
/// All fields affect the output, so a persisted run should persist its
/// configuration alongside.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Output raster resolution in meters per cell.
    pub resolution: f64,
    /// Target tile count along the X axis.
    pub tiles_x: usize,
    /// Target tile count along the Y axis.
    pub tiles_y: usize,
    /// Buffer margin as a fraction of the tile side length. The margin is
    /// ceil-rounded to the nearest 0.5 m.
    pub buffer_fraction: f64,
    /// Worker threads for the per-tile parallel stages. 0 lets the pool pick.
    pub workers: usize,

    // Ground filter (cloth simulation)
    /// Cloth grid cell size in meters.
    pub cloth_cell: f64,
    /// Maximum relaxation iterations for the cloth.
    pub cloth_iterations: usize,
    /// Maximum distance (m) between a point and the settled cloth for the
    /// point to be classified as ground.
    pub ground_threshold: f64,
    /// Apply a smoothing pass to the settled cloth before classification.
    pub smooth_ground: bool,

    // Boundary extraction
    /// A tile whose footprint lies within this distance of the unioned
    /// outer boundary is treated as an edge tile.
    pub edge_distance: f64,
    /// Concavity parameter for the edge-tile concave hulls.
    pub concavity: f64,
    /// Below this point count an edge tile keeps its rectangular footprint
    /// instead of a concave hull.
    pub hull_min_points: usize,

    // Surface rasterizer
    /// Use the slower layered (multi-threshold) DSM triangulation instead of
    /// a single triangulation.
    pub layered_dsm: bool,
    /// Height thresholds (m above ground) for the layered DSM mode. The first
    /// layer always uses all points.
    pub dsm_layers: Vec<f64>,

    // Gap filling
    /// Window radius in cells (1 = 3x3 window).
    pub fill_radius: usize,
    /// Number of filling passes. One pass leaves large holes partially
    /// unfilled; raise this when the input has wide gaps.
    pub fill_passes: usize,

    /// Reuse intermediate artifacts left by a previous run instead of
    /// recomputing them. Stale artifacts are trusted as-is.
    pub reuse_artifacts: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            resolution: 1.0,
            tiles_x: 4,
            tiles_y: 4,
            buffer_fraction: 0.05,
            workers: 0,
            cloth_cell: 1.0,
            cloth_iterations: 200,
            ground_threshold: 0.5,
            smooth_ground: false,
            edge_distance: 1.0,
            concavity: 1.0,
            hull_min_points: 4,
            layered_dsm: false,
            dsm_layers: vec![0.0, 2.0, 5.0, 10.0, 15.0],
            fill_radius: 1,
            fill_passes: 1,
            reuse_artifacts: true,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.resolution > 0.0) {
            anyhow::bail!("resolution must be positive, got {}", self.resolution);
        }
        if self.tiles_x == 0 || self.tiles_y == 0 {
            anyhow::bail!("tile counts must be at least 1");
        }
        if self.buffer_fraction < 0.0 {
            anyhow::bail!("buffer fraction must not be negative");
        }
        if !(self.cloth_cell > 0.0) {
            anyhow::bail!("cloth cell size must be positive");
        }
        if self.fill_radius == 0 {
            anyhow::bail!("fill radius must be at least 1 cell");
        }
        Ok(())
    }
}

/// Tag encoding the resolution for output file names, e.g. `1M` for 1 m
/// and `5CM` for 0.05 m rasters.
pub fn resolution_tag(resolution: f64) -> String {
    if resolution >= 1.0 {
        format!("{}M", trim_float(resolution))
    } else {
        format!("{}CM", trim_float(resolution * 100.0))
    }
}

fn trim_float(v: f64) -> String {
    // round away fp noise (0.05 * 100 is not exactly 5)
    let rounded = (v * 1000.0).round() / 1000.0;
    let mut s = format!("{:.3}", rounded);
    while s.ends_with('0') {
        s.pop();
    }
    if s.ends_with('.') {
        s.pop();
    }
    s
}

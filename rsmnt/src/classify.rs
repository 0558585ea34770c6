use log::debug;

use crate::config::PipelineConfig;
use crate::error::TileError;
use crate::geo_core::BoundingBox;
use crate::points::{regroup_pulses, LidarPoint, CLASS_GROUND, CLASS_UNCLASSIFIED};
use crate::tiles::{TileDescriptor, TileStore};

/// Per-iteration downward pull of the cloth (meters).
const CLOTH_GRAVITY: f64 = 0.05;
/// Relaxation stops once no node moves more than this.
const CLOTH_CONVERGENCE: f64 = 1e-4;
/// Below this many points the filter cannot produce a meaningful surface.
const MIN_FILTER_POINTS: usize = 3;

/// Cloth-simulation ground filter parameters.
#[derive(Debug, Clone)]
pub struct GroundFilterParams {
    /// Cloth node spacing (meters).
    pub cell: f64,
    /// Maximum relaxation iterations.
    pub iterations: usize,
    /// Distance to the settled cloth below which a last return is ground.
    pub threshold: f64,
    /// Smooth the settled cloth before thresholding.
    pub smooth: bool,
}

impl GroundFilterParams {
    pub fn from_config(config: &PipelineConfig) -> Self {
        GroundFilterParams {
            cell: config.cloth_cell,
            iterations: config.cloth_iterations,
            threshold: config.ground_threshold,
            smooth: config.smooth_ground,
        }
    }
}

/// Per-tile classification outcome (successful, non-empty tiles only).
#[derive(Debug, Clone)]
pub struct ClassifiedTile {
    pub points_kept: usize,
    pub ground_points: usize,
    pub pulses: usize,
}

struct Cloth {
    rows: usize,
    cols: usize,
    cell: f64,
    min_x: f64,
    min_y: f64,
    height: Vec<f64>,
}

impl Cloth {
    /// Drape a rigid cloth over the inverted cloud: last returns are the
    /// obstacles, gravity pulls the cloth down, tension keeps it spanning
    /// vegetation and buildings. The settled cloth approximates the inverted
    /// ground surface.
    fn settle(points: &[LidarPoint], extent: &BoundingBox, params: &GroundFilterParams) -> Option<Cloth> {
        let cols = (extent.width() / params.cell).ceil().max(1.0) as usize;
        let rows = (extent.height() / params.cell).ceil().max(1.0) as usize;
        let mut obstacle = vec![f64::NEG_INFINITY; rows * cols];
        let mut cloth = Cloth {
            rows,
            cols,
            cell: params.cell,
            min_x: extent.min_x,
            min_y: extent.min_y,
            height: Vec::new(),
        };

        let mut top = f64::NEG_INFINITY;
        for p in points {
            if !p.is_last_return() || p.is_noise() || !p.has_finite_coords() {
                continue;
            }
            let idx = cloth.cell_index(p.x, p.y);
            // inverted frame: the lowest return is the highest obstacle
            let inv = -p.z;
            if inv > obstacle[idx] {
                obstacle[idx] = inv;
            }
            if inv > top {
                top = inv;
            }
        }
        if !top.is_finite() {
            return None;
        }

        let mut height = vec![top; rows * cols];
        for _ in 0..params.iterations {
            let mut max_delta: f64 = 0.0;
            for r in 0..rows {
                for c in 0..cols {
                    let idx = r * cols + c;
                    let mut sum = 0.0;
                    let mut n = 0.0;
                    if r > 0 {
                        sum += height[idx - cols];
                        n += 1.0;
                    }
                    if r + 1 < rows {
                        sum += height[idx + cols];
                        n += 1.0;
                    }
                    if c > 0 {
                        sum += height[idx - 1];
                        n += 1.0;
                    }
                    if c + 1 < cols {
                        sum += height[idx + 1];
                        n += 1.0;
                    }
                    let pulled = sum / n - CLOTH_GRAVITY;
                    let settled = pulled.max(obstacle[idx]).min(height[idx]);
                    max_delta = max_delta.max(height[idx] - settled);
                    height[idx] = settled;
                }
            }
            if max_delta < CLOTH_CONVERGENCE {
                break;
            }
        }

        if params.smooth {
            let snapshot = height.clone();
            for r in 0..rows {
                for c in 0..cols {
                    let mut sum = 0.0;
                    let mut n = 0.0;
                    for dr in -1i64..=1 {
                        for dc in -1i64..=1 {
                            let (nr, nc) = (r as i64 + dr, c as i64 + dc);
                            if nr < 0 || nc < 0 || nr >= rows as i64 || nc >= cols as i64 {
                                continue;
                            }
                            sum += snapshot[nr as usize * cols + nc as usize];
                            n += 1.0;
                        }
                    }
                    height[r * cols + c] = sum / n;
                }
            }
        }

        cloth.height = height;
        Some(cloth)
    }

    fn cell_index(&self, x: f64, y: f64) -> usize {
        let c = (((x - self.min_x) / self.cell).floor().max(0.0) as usize).min(self.cols - 1);
        let r = (((y - self.min_y) / self.cell).floor().max(0.0) as usize).min(self.rows - 1);
        r * self.cols + c
    }

    fn height_at(&self, x: f64, y: f64) -> f64 {
        self.height[self.cell_index(x, y)]
    }
}

/// Label ground points in place. Only last returns can become ground; points
/// previously marked ground that the cloth rejects are reset to unclassified;
/// noise points are left untouched. Returns the number of ground points.
pub fn classify_ground(
    points: &mut [LidarPoint],
    extent: &BoundingBox,
    params: &GroundFilterParams,
) -> usize {
    let cloth = match Cloth::settle(points, extent, params) {
        Some(cloth) => cloth,
        None => {
            for p in points.iter_mut() {
                if p.is_ground() {
                    p.classification = CLASS_UNCLASSIFIED;
                }
            }
            return 0;
        }
    };

    let mut ground = 0;
    for p in points.iter_mut() {
        if p.is_noise() {
            continue;
        }
        // every obstacle lies on or below the cloth in the inverted frame
        let near_cloth = cloth.height_at(p.x, p.y) - (-p.z) <= params.threshold;
        if p.is_last_return() && near_cloth {
            p.classification = CLASS_GROUND;
            ground += 1;
        } else if p.is_ground() {
            p.classification = CLASS_UNCLASSIFIED;
        }
    }
    ground
}

/// Classify one tile: load its buffered raw points, rebuild pulses, repair
/// the return counts, run the ground filter, then keep core points only so
/// tile outputs stay disjoint. Empty tiles produce no output and no error.
pub fn classify_tile(
    raw: &TileStore,
    classified: &TileStore,
    tile: &TileDescriptor,
    params: &GroundFilterParams,
) -> Result<Option<ClassifiedTile>, TileError> {
    let io_err = |source: anyhow::Error| TileError::Io {
        tile: tile.id,
        source,
    };

    let mut points = match raw.read_tile(tile.id).map_err(io_err)? {
        Some(points) if !points.is_empty() => points,
        _ => return Ok(None),
    };
    if points.len() < MIN_FILTER_POINTS {
        return Err(TileError::DegenerateGeometry {
            tile: tile.id,
            stage: "ground classification",
            points: points.len(),
        });
    }

    let pulses = regroup_pulses(&mut points);
    let ground = classify_ground(&mut points, &tile.buffered(), params);

    // buffer points were read-only context; drop them from the output
    points.retain(|p| tile.core_contains(p.x, p.y));
    if points.is_empty() {
        return Ok(None);
    }
    let ground_kept = points.iter().filter(|p| p.is_ground()).count();
    debug!(
        "{}: {} pulses, {} ground in buffered extent, kept {} core points",
        tile.id,
        pulses,
        ground,
        points.len()
    );

    classified
        .write_tile(tile.id, &points)
        .map_err(io_err)?;
    Ok(Some(ClassifiedTile {
        points_kept: points.len(),
        ground_points: ground_kept,
        pulses,
    }))
}

use log::debug;
use spade::{DelaunayTriangulation, FloatTriangulation, HasPosition, Point2, Triangulation};

use crate::config::PipelineConfig;
use crate::error::TileError;
use crate::points::LidarPoint;
use crate::raster::Raster;
use crate::tiles::TileDescriptor;

/// Raster products derived from the classified cloud.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Product {
    /// Ground-classified points only.
    Dem,
    /// All points (noise excluded).
    Dsm,
}

impl Product {
    pub fn name(&self) -> &'static str {
        match self {
            Product::Dem => "DEM",
            Product::Dsm => "DSM",
        }
    }
}

struct TinVertex {
    position: Point2<f64>,
    z: f64,
}

impl HasPosition for TinVertex {
    type Scalar = f64;

    fn position(&self) -> Point2<f64> {
        self.position
    }
}

fn build_tin(
    points: impl Iterator<Item = (f64, f64, f64)>,
) -> Option<DelaunayTriangulation<TinVertex>> {
    let vertices: Vec<TinVertex> = points
        .filter(|(x, y, z)| x.is_finite() && y.is_finite() && z.is_finite())
        .map(|(x, y, z)| TinVertex {
            position: Point2::new(x, y),
            z,
        })
        .collect();
    let tin = DelaunayTriangulation::bulk_load_stable(vertices).ok()?;
    // fewer than three distinct, non-collinear vertices leave no faces
    if tin.num_inner_faces() == 0 {
        return None;
    }
    Some(tin)
}

/// Sample a triangulation at the cell centers of `raster` that the tile's
/// core owns, interpolating linearly within the containing triangle. Centers
/// outside the convex hull stay no-data: holes at sparse survey edges are
/// expected here and handled by gap filling downstream.
fn sample_tin(
    tin: &DelaunayTriangulation<TinVertex>,
    raster: &mut Raster,
    tile: &TileDescriptor,
    max_combine: bool,
) {
    let bary = tin.barycentric();
    for row in 0..raster.nrows {
        for col in 0..raster.ncols {
            let (x, y) = raster.cell_center(row, col);
            if !tile.core_contains(x, y) {
                continue;
            }
            if let Some(z) = bary.interpolate(|v| v.data().z, Point2::new(x, y)) {
                let current = raster.get(row, col);
                if !max_combine || current.is_nan() || z > current {
                    raster.set(row, col, z);
                }
            }
        }
    }
}

/// Empty raster aligned with `template` covering all cells whose centers the
/// tile's core can own.
fn tile_window(template: &Raster, tile: &TileDescriptor) -> Raster {
    let res = template.resolution;
    let c0 = (((tile.core.min_x - template.xmin) / res).floor().max(0.0)) as usize;
    let c1 = ((((tile.core.max_x - template.xmin) / res).ceil()).min(template.ncols as f64))
        as usize;
    let r0 = (((template.ymax - tile.core.max_y) / res).floor().max(0.0)) as usize;
    let r1 = ((((template.ymax - tile.core.min_y) / res).ceil()).min(template.nrows as f64))
        as usize;
    let (c1, r1) = (c1.max(c0), r1.max(r0));
    Raster {
        nrows: r1 - r0,
        ncols: c1 - c0,
        xmin: template.xmin + c0 as f64 * res,
        ymax: template.ymax - r0 as f64 * res,
        resolution: res,
        data: vec![f64::NAN; (r1 - r0) * (c1 - c0)],
    }
}

/// Triangulate one tile's buffered point selection and rasterize it onto the
/// product lattice. Returns the tile-local raster to be merged after the
/// stage barrier.
///
/// For the DSM, `layered` mode stacks several height-thresholded
/// triangulations (normalized against the filled DEM) and keeps the
/// pointwise maximum; slower, but catches dense canopy that a single
/// triangulation smooths over.
pub fn rasterize_tile(
    points: &[LidarPoint],
    tile: &TileDescriptor,
    template: &Raster,
    product: Product,
    dem: Option<&Raster>,
    config: &PipelineConfig,
) -> Result<Raster, TileError> {
    let selection: Vec<&LidarPoint> = points
        .iter()
        .filter(|p| match product {
            Product::Dem => p.is_ground(),
            Product::Dsm => !p.is_noise(),
        })
        .collect();

    let degenerate = |n: usize| TileError::DegenerateGeometry {
        tile: tile.id,
        stage: match product {
            Product::Dem => "DEM triangulation",
            Product::Dsm => "DSM triangulation",
        },
        points: n,
    };

    let tin = build_tin(selection.iter().map(|p| (p.x, p.y, p.z)))
        .ok_or_else(|| degenerate(selection.len()))?;

    let mut raster = tile_window(template, tile);
    sample_tin(&tin, &mut raster, tile, false);

    if let (Product::Dsm, true, Some(dem)) = (product, config.layered_dsm, dem) {
        for &threshold in config.dsm_layers.iter().skip(1) {
            let layer: Vec<&&LidarPoint> = selection
                .iter()
                .filter(|p| {
                    let ground = dem.value_at(p.x, p.y);
                    ground.is_finite() && p.z - ground >= threshold
                })
                .collect();
            match build_tin(layer.iter().map(|p| (p.x, p.y, p.z))) {
                Some(tin) => sample_tin(&tin, &mut raster, tile, true),
                None => {
                    // thin layers are expected near the top of the canopy
                    debug!(
                        "{}: skipping empty DSM layer at {} m ({} points)",
                        tile.id,
                        threshold,
                        layer.len()
                    );
                }
            }
        }
    }

    Ok(raster)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo_core::BoundingBox;
    use crate::points::{CLASS_GROUND, CLASS_UNCLASSIFIED};
    use crate::tiles::{TileGrid, TileId};

    fn point(x: f64, y: f64, z: f64, class: u8) -> LidarPoint {
        LidarPoint {
            x,
            y,
            z,
            return_number: 1,
            number_of_returns: 1,
            classification: class,
            gps_time: 0.0,
        }
    }

    fn one_tile_grid(bbox: BoundingBox) -> TileGrid {
        TileGrid::build(
            bbox,
            &PipelineConfig {
                tiles_x: 1,
                tiles_y: 1,
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn test_flat_plane_samples_constant() {
        let bbox = BoundingBox::new(0.0, 0.0, 20.0, 20.0);
        let grid = one_tile_grid(bbox);
        let tile = grid.get(TileId::new(0, 0)).unwrap();
        let template = Raster::from_extent(&bbox, 1.0);

        let mut points = Vec::new();
        for i in 0..=20 {
            for j in 0..=20 {
                points.push(point(i as f64, j as f64, 10.0, CLASS_GROUND));
            }
        }
        let config = PipelineConfig::default();
        let raster =
            rasterize_tile(&points, tile, &template, Product::Dem, None, &config).unwrap();
        assert_eq!(raster.count_nodata(), 0);
        for v in &raster.data {
            assert!((v - 10.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_too_few_points_is_degenerate() {
        let bbox = BoundingBox::new(0.0, 0.0, 20.0, 20.0);
        let grid = one_tile_grid(bbox);
        let tile = grid.get(TileId::new(0, 0)).unwrap();
        let template = Raster::from_extent(&bbox, 1.0);
        let points = vec![
            point(1.0, 1.0, 5.0, CLASS_GROUND),
            point(2.0, 2.0, 5.0, CLASS_GROUND),
        ];
        let err = rasterize_tile(
            &points,
            tile,
            &template,
            Product::Dem,
            None,
            &PipelineConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, TileError::DegenerateGeometry { .. }));
    }

    #[test]
    fn test_collinear_points_are_degenerate() {
        let bbox = BoundingBox::new(0.0, 0.0, 20.0, 20.0);
        let grid = one_tile_grid(bbox);
        let tile = grid.get(TileId::new(0, 0)).unwrap();
        let template = Raster::from_extent(&bbox, 1.0);
        let points: Vec<_> = (0..10)
            .map(|i| point(i as f64, i as f64, 5.0, CLASS_GROUND))
            .collect();
        let err = rasterize_tile(
            &points,
            tile,
            &template,
            Product::Dem,
            None,
            &PipelineConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, TileError::DegenerateGeometry { .. }));
    }

    #[test]
    fn test_cells_outside_hull_stay_nodata() {
        let bbox = BoundingBox::new(0.0, 0.0, 20.0, 20.0);
        let grid = one_tile_grid(bbox);
        let tile = grid.get(TileId::new(0, 0)).unwrap();
        let template = Raster::from_extent(&bbox, 1.0);
        // points confined to the lower-left quadrant
        let mut points = Vec::new();
        for i in 0..=8 {
            for j in 0..=8 {
                points.push(point(i as f64, j as f64, 3.0, CLASS_GROUND));
            }
        }
        let raster = rasterize_tile(
            &points,
            tile,
            &template,
            Product::Dem,
            None,
            &PipelineConfig::default(),
        )
        .unwrap();
        let (r, c) = raster.cell_at(4.0, 4.0).unwrap();
        assert!(!raster.get(r, c).is_nan());
        let (r, c) = raster.cell_at(18.0, 18.0).unwrap();
        assert!(raster.get(r, c).is_nan());
    }

    #[test]
    fn test_layered_dsm_keeps_canopy_maximum() {
        let bbox = BoundingBox::new(0.0, 0.0, 20.0, 20.0);
        let grid = one_tile_grid(bbox);
        let tile = grid.get(TileId::new(0, 0)).unwrap();
        let template = Raster::from_extent(&bbox, 1.0);

        let mut points = Vec::new();
        for i in 0..=20 {
            for j in 0..=20 {
                points.push(point(i as f64, j as f64, 0.0, CLASS_GROUND));
            }
        }
        // a canopy patch straddling the tile center
        for (dx, dy) in [(-1.3, -1.2), (1.4, -1.1), (0.1, 1.6), (-1.2, 1.3), (1.1, 1.2)] {
            points.push(point(10.0 + dx, 10.0 + dy, 15.0, CLASS_UNCLASSIFIED));
        }

        let mut dem = Raster::from_extent(&bbox, 1.0);
        dem.data.fill(0.0);

        let fast_cfg = PipelineConfig::default();
        let fast = rasterize_tile(&points, tile, &template, Product::Dsm, None, &fast_cfg)
            .unwrap();
        let layered_cfg = PipelineConfig {
            layered_dsm: true,
            dsm_layers: vec![0.0, 5.0],
            ..Default::default()
        };
        let layered = rasterize_tile(
            &points,
            tile,
            &template,
            Product::Dsm,
            Some(&dem),
            &layered_cfg,
        )
        .unwrap();

        let (r, c) = layered.cell_at(10.0, 10.0).unwrap();
        // the canopy-only layer lifts the center cell to the patch height
        assert!(layered.get(r, c) >= fast.get(r, c));
        assert!((layered.get(r, c) - 15.0).abs() < 1e-6);
    }
}

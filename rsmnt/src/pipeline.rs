use std::path::PathBuf;

use anyhow::{Context, Result};
use geo::MultiPolygon;
use log::{info, warn};
use rayon::prelude::*;

use crate::boundary::{extract_boundary, read_boundary, write_boundary};
use crate::classify::{classify_tile, GroundFilterParams};
use crate::config::{resolution_tag, PipelineConfig};
use crate::error::TileError;
use crate::geo_core::BoundingBox;
use crate::raster::Raster;
use crate::rasterize::{rasterize_tile, Product};
use crate::tiles::{TileGrid, TileId, TileStore};

/// End-to-end tiled pipeline: raw cloud → buffered tiles → ground
/// classification → survey boundary → triangulated DEM/DSM rasters → gap
/// filling → reconciled, boundary-masked products.
///
/// Every stage persists its artifacts under the output directory, so an
/// interrupted run resumes from the last completed stage instead of
/// replaying ingestion. Existing artifacts are trusted as-is when
/// `reuse_artifacts` is set; clear the directory to force a clean run.
pub struct LidarPipeline {
    inputs: Vec<PathBuf>,
    output_path: PathBuf,
    config: PipelineConfig,
}

/// What a run produced, including the tiles it had to give up on.
#[derive(Debug)]
pub struct PipelineSummary {
    pub tiles_total: usize,
    pub tiles_classified: usize,
    pub tiles_empty: usize,
    /// Tile-level failures (degenerate geometry etc.); the products cover
    /// the successful subset.
    pub failures: Vec<(TileId, String)>,
    pub dem: PathBuf,
    pub dsm: PathBuf,
    pub chm: PathBuf,
    pub boundary: PathBuf,
}

impl LidarPipeline {
    pub fn new(
        inputs: Vec<PathBuf>,
        output_path: PathBuf,
        config: PipelineConfig,
    ) -> Result<Self> {
        config.validate()?;
        if inputs.is_empty() {
            anyhow::bail!("No input point clouds given");
        }
        std::fs::create_dir_all(&output_path)
            .with_context(|| format!("Failed to create output directory {:?}", output_path))?;
        Ok(LidarPipeline {
            inputs,
            output_path,
            config,
        })
    }

    fn grid_path(&self) -> PathBuf {
        self.output_path.join("tiles.json")
    }

    fn raw_dir(&self) -> PathBuf {
        self.output_path.join("tiles_raw")
    }

    fn classified_dir(&self) -> PathBuf {
        self.output_path.join("tiles_classified")
    }

    fn boundary_path(&self) -> PathBuf {
        self.output_path.join("boundary.geojson")
    }

    fn tile_raster_dir(&self, product: Product) -> PathBuf {
        self.output_path
            .join(format!("rasters_{}", product.name().to_lowercase()))
    }

    fn holes_path(&self, product: Product) -> PathBuf {
        let tag = resolution_tag(self.config.resolution);
        self.output_path
            .join(format!("{}_holes_{}.asc", product.name(), tag))
    }

    fn final_path(&self, name: &str) -> PathBuf {
        let tag = resolution_tag(self.config.resolution);
        self.output_path.join(format!("{}_{}.asc", name, tag))
    }

    fn worker_pool(&self) -> Result<rayon::ThreadPool> {
        rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.workers)
            .build()
            .context("Failed to build the tile worker pool")
    }

    /// Run every stage. Tile-level failures are collected and logged, never
    /// fatal; I/O failures on shared stores abort the run.
    pub fn run(&self) -> Result<PipelineSummary> {
        let grid = self.build_or_load_grid()?;
        let mut failures: Vec<TileError> = Vec::new();

        let classified = self.classify_stage(&grid, &mut failures)?;
        let classified_ids: Vec<TileId> = grid
            .tiles
            .iter()
            .map(|t| t.id)
            .filter(|id| classified.has_tile(*id))
            .collect();
        if classified_ids.is_empty() {
            anyhow::bail!("No tile survived ground classification");
        }

        let boundary = self.boundary_stage(&classified, &grid, &classified_ids)?;

        let mut dem = self.rasterize_stage(
            Product::Dem,
            &grid,
            &classified,
            &classified_ids,
            None,
            &mut failures,
        )?;
        let filled = dem.fill_gaps(self.config.fill_radius, self.config.fill_passes);
        info!("DEM: filled {} gap cells", filled);

        let mut dsm = self.rasterize_stage(
            Product::Dsm,
            &grid,
            &classified,
            &classified_ids,
            Some(&dem),
            &mut failures,
        )?;
        let filled = dsm.fill_gaps(self.config.fill_radius, self.config.fill_passes);
        info!("DSM: filled {} gap cells", filled);

        let (dem_path, dsm_path, chm_path) = self.reconcile_stage(dem, dsm, &boundary)?;

        let tiles_classified = classified_ids.len();
        let failed_ids: std::collections::HashSet<TileId> =
            failures.iter().map(|f| f.tile()).collect();
        let tiles_empty = grid
            .tiles
            .iter()
            .filter(|t| !classified.has_tile(t.id) && !failed_ids.contains(&t.id))
            .count();

        Ok(PipelineSummary {
            tiles_total: grid.tiles.len(),
            tiles_classified,
            tiles_empty,
            failures: failures
                .into_iter()
                .map(|e| (e.tile(), e.to_string()))
                .collect(),
            dem: dem_path,
            dsm: dsm_path,
            chm: chm_path,
            boundary: self.boundary_path(),
        })
    }

    /// Stage 1: compute tile descriptors and distribute the raw cloud into
    /// buffered tile files. The grid file is written last, so its presence
    /// marks a completed ingest.
    fn build_or_load_grid(&self) -> Result<TileGrid> {
        let grid_path = self.grid_path();
        if self.config.reuse_artifacts && grid_path.exists() {
            info!("Reusing tile grid {:?}", grid_path);
            return TileGrid::load(&grid_path);
        }

        let bbox = survey_bbox(&self.inputs)?;
        let grid = TileGrid::build(bbox, &self.config)?;
        info!(
            "Tiling {:.1} x {:.1} m survey into {} tiles of {:.1} m (buffer {:.1} m)",
            bbox.width(),
            bbox.height(),
            grid.tiles.len(),
            grid.side,
            grid.buffer
        );

        let raw = TileStore::create(self.raw_dir())?;
        let stats = raw.ingest(&self.inputs, &grid)?;
        if stats.points == 0 {
            anyhow::bail!("No points found in the input cloud");
        }
        info!(
            "Ingested {} points into {} non-empty tiles",
            stats.points, stats.tiles_written
        );
        grid.save(&grid_path)?;
        Ok(grid)
    }

    /// Stage 2: per-tile pulse repair and ground classification, in
    /// parallel. A full barrier before anything downstream.
    fn classify_stage(
        &self,
        grid: &TileGrid,
        failures: &mut Vec<TileError>,
    ) -> Result<TileStore> {
        let raw = TileStore::create(self.raw_dir())?;
        let classified = TileStore::create(self.classified_dir())?;
        let params = GroundFilterParams::from_config(&self.config);

        let pool = self.worker_pool()?;
        let results: Vec<Result<(), TileError>> = pool.install(|| {
            grid.tiles
                .par_iter()
                .map(|tile| {
                    if self.config.reuse_artifacts && classified.has_tile(tile.id) {
                        return Ok(());
                    }
                    classify_tile(&raw, &classified, tile, &params).map(|_| ())
                })
                .collect()
        });
        for result in results {
            if let Err(e) = result {
                warn!("classification failed: {}", e);
                failures.push(e);
            }
        }
        Ok(classified)
    }

    /// Stage 3: survey boundary polygon, single-threaded after the barrier.
    fn boundary_stage(
        &self,
        classified: &TileStore,
        grid: &TileGrid,
        classified_ids: &[TileId],
    ) -> Result<MultiPolygon<f64>> {
        let path = self.boundary_path();
        if self.config.reuse_artifacts && path.exists() {
            info!("Reusing boundary polygon {:?}", path);
            return read_boundary(&path);
        }
        let boundary = extract_boundary(classified, grid, classified_ids, &self.config)?;
        write_boundary(&path, &boundary)?;
        Ok(boundary)
    }

    /// Stage 4: per-tile triangulated rasterization, merged by direct
    /// placement (cores are disjoint, so no blending).
    fn rasterize_stage(
        &self,
        product: Product,
        grid: &TileGrid,
        classified: &TileStore,
        classified_ids: &[TileId],
        dem: Option<&Raster>,
        failures: &mut Vec<TileError>,
    ) -> Result<Raster> {
        let holes_path = self.holes_path(product);
        if self.config.reuse_artifacts && holes_path.exists() {
            info!("Reusing {} raster {:?}", product.name(), holes_path);
            return Raster::read_asc(&holes_path);
        }

        let tile_dir = self.tile_raster_dir(product);
        std::fs::create_dir_all(&tile_dir)
            .with_context(|| format!("Failed to create raster directory {:?}", tile_dir))?;
        let template = Raster::from_extent(&grid.bbox, self.config.resolution);

        let pool = self.worker_pool()?;
        let results: Vec<Result<Raster, TileError>> = pool.install(|| {
            classified_ids
                .par_iter()
                .map(|id| {
                    let tile = grid.get(*id).ok_or_else(|| TileError::Io {
                        tile: *id,
                        source: anyhow::anyhow!("tile missing from grid"),
                    })?;
                    let tile_path = tile_dir.join(format!("{}.asc", id));
                    if self.config.reuse_artifacts && tile_path.exists() {
                        return Raster::read_asc(&tile_path).map_err(|e| TileError::Io {
                            tile: *id,
                            source: e,
                        });
                    }
                    let points = classified
                        .read_neighborhood(grid, *id, &tile.buffered())
                        .map_err(|e| TileError::Io {
                            tile: *id,
                            source: e,
                        })?;
                    let raster =
                        rasterize_tile(&points, tile, &template, product, dem, &self.config)?;
                    raster.write_asc(&tile_path).map_err(|e| TileError::Io {
                        tile: *id,
                        source: e,
                    })?;
                    Ok(raster)
                })
                .collect()
        });

        let mut merged = template;
        for result in results {
            match result {
                Ok(raster) => merged.paste(&raster),
                Err(e) => {
                    warn!("{} rasterization failed: {}", product.name(), e);
                    failures.push(e);
                }
            }
        }
        merged.write_asc(&holes_path)?;
        info!(
            "{}: merged raster has {} no-data cells before filling",
            product.name(),
            merged.count_nodata()
        );
        Ok(merged)
    }

    /// Stage 5: align product extents by intersection-cropping, derive the
    /// CHM, mask everything to the survey boundary and persist the final
    /// resolution-tagged rasters.
    fn reconcile_stage(
        &self,
        dem: Raster,
        dsm: Raster,
        boundary: &MultiPolygon<f64>,
    ) -> Result<(PathBuf, PathBuf, PathBuf)> {
        let common = dem
            .extent()
            .intersection(&dsm.extent())
            .context("DEM and DSM rasters do not overlap")?;
        // crop the larger to the smaller, never pad
        let mut dem = dem.crop(&common);
        let mut dsm = dsm.crop(&common);
        let mut chm = dsm.difference_clamped(&dem)?;

        dem.mask(boundary);
        dsm.mask(boundary);
        chm.mask(boundary);

        let dem_path = self.final_path("DEM");
        let dsm_path = self.final_path("DSM");
        let chm_path = self.final_path("CHM");
        dem.write_asc(&dem_path)?;
        dsm.write_asc(&dsm_path)?;
        chm.write_asc(&chm_path)?;
        info!(
            "Final products written: {:?}, {:?}, {:?}",
            dem_path, dsm_path, chm_path
        );

        Ok((dem_path, dsm_path, chm_path))
    }
}

/// Survey bounding box from the input file headers; LAS headers carry
/// authoritative bounds.
fn survey_bbox(inputs: &[PathBuf]) -> Result<BoundingBox> {
    let mut bbox: Option<BoundingBox> = None;
    for input in inputs {
        let reader = las::Reader::from_path(input)
            .with_context(|| format!("Failed to open input cloud {:?}", input))?;
        let bounds = reader.header().bounds();
        let file_box = BoundingBox::new(bounds.min.x, bounds.min.y, bounds.max.x, bounds.max.y);
        bbox = Some(match bbox {
            Some(b) => BoundingBox::new(
                b.min_x.min(file_box.min_x),
                b.min_y.min(file_box.min_y),
                b.max_x.max(file_box.max_x),
                b.max_y.max(file_box.max_y),
            ),
            None => file_box,
        });
    }
    bbox.context("No input point clouds given")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::points::{LidarPoint, CLASS_UNCLASSIFIED};
    use crate::tiles::write_las_points;

    fn synth_point(x: f64, y: f64, z: f64, t: f64) -> LidarPoint {
        LidarPoint {
            x,
            y,
            z,
            return_number: 1,
            number_of_returns: 1,
            classification: CLASS_UNCLASSIFIED,
            gps_time: t,
        }
    }

    /// Flat plane sampled every `step` meters over [0, size]².
    fn flat_plane_cloud(size: f64, step: f64, z: f64) -> Vec<LidarPoint> {
        let mut points = Vec::new();
        let mut t = 0.0;
        let mut x = 0.0;
        while x <= size + 1e-9 {
            let mut y = 0.0;
            while y <= size + 1e-9 {
                points.push(synth_point(x, y, z, t));
                t += 1.0;
                y += step;
            }
            x += step;
        }
        points
    }

    fn test_config() -> PipelineConfig {
        PipelineConfig {
            resolution: 1.0,
            tiles_x: 2,
            tiles_y: 2,
            buffer_fraction: 0.05,
            workers: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_flat_plane_yields_constant_dem_without_holes() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("cloud.las");
        write_las_points(&input, &flat_plane_cloud(200.0, 2.0, 10.0)).unwrap();

        let out = dir.path().join("out");
        let pipeline =
            LidarPipeline::new(vec![input], out.clone(), test_config()).unwrap();
        let summary = pipeline.run().unwrap();

        assert_eq!(summary.tiles_total, 4);
        assert_eq!(summary.tiles_classified, 4);
        assert!(summary.failures.is_empty());
        assert!(summary.dem.ends_with("DEM_1M.asc"));

        let dem = Raster::read_asc(&summary.dem).unwrap();
        assert_eq!(dem.count_nodata(), 0);
        for v in &dem.data {
            assert!((v - 10.0).abs() < 0.01, "DEM cell off the plane: {}", v);
        }

        // a flat plane has no canopy
        let chm = Raster::read_asc(&summary.chm).unwrap();
        for v in chm.data.iter().filter(|v| !v.is_nan()) {
            assert!(v.abs() < 0.01);
        }
    }

    #[test]
    fn test_degenerate_tile_is_reported_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("cloud.las");
        // dense strip on the left, one isolated point far to the right
        let mut cloud = Vec::new();
        let mut t = 0.0;
        let mut x = 0.0;
        while x <= 60.0 + 1e-9 {
            let mut y = 0.0;
            while y <= 200.0 + 1e-9 {
                cloud.push(synth_point(x, y, 8.0, t));
                t += 1.0;
                y += 2.0;
            }
            x += 2.0;
        }
        cloud.push(synth_point(150.0, 50.0, 8.0, t));
        write_las_points(&input, &cloud).unwrap();

        let out = dir.path().join("out");
        let pipeline =
            LidarPipeline::new(vec![input], out.clone(), test_config()).unwrap();
        let summary = pipeline.run().unwrap();

        // the single-point tile failed, the empty tile was skipped quietly
        assert_eq!(summary.tiles_total, 4);
        assert_eq!(summary.tiles_classified, 2);
        assert_eq!(summary.tiles_empty, 1);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].0, TileId::new(1, 0));

        // products still cover the dense tiles
        let dem = Raster::read_asc(&summary.dem).unwrap();
        assert!((dem.value_at(30.0, 50.0) - 8.0).abs() < 0.01);
        assert!(dem.value_at(140.0, 50.0).is_nan());
    }

    #[test]
    fn test_rerun_reuses_artifacts_byte_identically() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("cloud.las");
        write_las_points(&input, &flat_plane_cloud(40.0, 1.0, 5.0)).unwrap();

        let out = dir.path().join("out");
        let pipeline = LidarPipeline::new(vec![input], out.clone(), test_config()).unwrap();
        let first = pipeline.run().unwrap();
        let dem_bytes = std::fs::read(&first.dem).unwrap();
        let dsm_bytes = std::fs::read(&first.dsm).unwrap();

        let second = pipeline.run().unwrap();
        assert_eq!(std::fs::read(&second.dem).unwrap(), dem_bytes);
        assert_eq!(std::fs::read(&second.dsm).unwrap(), dsm_bytes);
        assert_eq!(second.tiles_classified, first.tiles_classified);
    }

    #[test]
    fn test_centimeter_resolution_naming() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("cloud.las");
        write_las_points(&input, &flat_plane_cloud(10.0, 0.5, 2.0)).unwrap();

        let out = dir.path().join("out");
        let config = PipelineConfig {
            resolution: 0.05,
            tiles_x: 1,
            tiles_y: 1,
            ..test_config()
        };
        let pipeline = LidarPipeline::new(vec![input], out, config).unwrap();
        let summary = pipeline.run().unwrap();
        assert!(summary.dem.ends_with("DEM_5CM.asc"));
        assert!(summary.dsm.ends_with("DSM_5CM.asc"));
        assert!(summary.chm.ends_with("CHM_5CM.asc"));
    }

    #[test]
    fn test_missing_input_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = LidarPipeline::new(
            vec![dir.path().join("absent.las")],
            dir.path().join("out"),
            test_config(),
        )
        .unwrap();
        assert!(pipeline.run().is_err());
    }
}

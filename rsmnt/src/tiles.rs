use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rstar::{RTree, AABB};
use serde::{Deserialize, Serialize};

use crate::config::PipelineConfig;
use crate::geo_core::BoundingBox;
use crate::points::LidarPoint;

/// Buffer margins are ceil-rounded to this step (meters).
const BUFFER_ROUNDING: f64 = 0.5;

/// Stable tile identity: grid column/row relative to the alignment origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileId {
    pub ix: u32,
    pub iy: u32,
}

impl TileId {
    pub fn new(ix: u32, iy: u32) -> Self {
        TileId { ix, iy }
    }
}

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tile_{}_{}", self.ix, self.iy)
    }
}

/// One spatial chunk of the survey.
///
/// The core extent is the tile's exclusive output area; the buffered extent
/// (core + margin) is what gets loaded so neighbourhood-dependent operations
/// are unbiased at the core boundary. Core membership is half-open on the
/// max edges, except on the outer rim of the grid, so cores partition the
/// bounding box exhaustively and disjointly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TileDescriptor {
    pub id: TileId,
    pub core: BoundingBox,
    pub buffer: f64,
    xmax_closed: bool,
    ymax_closed: bool,
}

impl TileDescriptor {
    pub fn buffered(&self) -> BoundingBox {
        self.core.buffered(self.buffer)
    }

    /// Does this tile own the position? Half-open on max edges unless the
    /// tile sits on the grid rim.
    pub fn core_contains(&self, x: f64, y: f64) -> bool {
        let in_x = x >= self.core.min_x
            && (x < self.core.max_x || (self.xmax_closed && x <= self.core.max_x));
        let in_y = y >= self.core.min_y
            && (y < self.core.max_y || (self.ymax_closed && y <= self.core.max_y));
        in_x && in_y
    }

    /// A point in the buffered extent but not owned by the core.
    pub fn is_buffer_point(&self, x: f64, y: f64) -> bool {
        self.buffered().contains(x, y) && !self.core_contains(x, y)
    }
}

/// Regular grid of tile descriptors covering the survey bounding box.
///
/// The square side is `max(width / tiles_x, height / tiles_y)` and the
/// requested grid is centered on the bounding box, so tile boundaries are
/// reproducible regardless of how the box got truncated. When the box divides
/// evenly along an axis the grid lines land on the box edges and the
/// requested tile count is preserved exactly; otherwise rim tiles are clipped
/// to the box.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TileGrid {
    pub bbox: BoundingBox,
    pub side: f64,
    pub buffer: f64,
    origin_x: f64,
    origin_y: f64,
    nx: u32,
    ny: u32,
    pub tiles: Vec<TileDescriptor>,
}

impl TileGrid {
    pub fn build(bbox: BoundingBox, config: &PipelineConfig) -> Result<TileGrid> {
        if !(bbox.width() > 0.0) || !(bbox.height() > 0.0) {
            anyhow::bail!("degenerate bounding box {:?}", bbox);
        }
        let side = (bbox.width() / config.tiles_x as f64)
            .max(bbox.height() / config.tiles_y as f64);
        let buffer =
            ((config.buffer_fraction * side) / BUFFER_ROUNDING).ceil() * BUFFER_ROUNDING;

        // center the requested grid on the box so an evenly-divisible box
        // keeps its requested tile counts
        let (cx, cy) = bbox.center();
        let origin_x = cx - config.tiles_x as f64 / 2.0 * side;
        let origin_y = cy - config.tiles_y as f64 / 2.0 * side;
        let nx = ((bbox.max_x - origin_x) / side).ceil().max(1.0) as u32;
        let ny = ((bbox.max_y - origin_y) / side).ceil().max(1.0) as u32;

        let mut tiles = Vec::new();
        for iy in 0..ny {
            for ix in 0..nx {
                let x_lo = (origin_x + ix as f64 * side).max(bbox.min_x);
                let x_hi = (origin_x + (ix + 1) as f64 * side).min(bbox.max_x);
                let y_lo = (origin_y + iy as f64 * side).max(bbox.min_y);
                let y_hi = (origin_y + (iy + 1) as f64 * side).min(bbox.max_y);
                if x_hi - x_lo <= 1e-9 || y_hi - y_lo <= 1e-9 {
                    continue;
                }
                tiles.push(TileDescriptor {
                    id: TileId::new(ix, iy),
                    core: BoundingBox::new(x_lo, y_lo, x_hi, y_hi),
                    buffer,
                    xmax_closed: (x_hi - bbox.max_x).abs() < 1e-9,
                    ymax_closed: (y_hi - bbox.max_y).abs() < 1e-9,
                });
            }
        }

        Ok(TileGrid {
            bbox,
            side,
            buffer,
            origin_x,
            origin_y,
            nx,
            ny,
            tiles,
        })
    }

    pub fn get(&self, id: TileId) -> Option<&TileDescriptor> {
        self.tiles.iter().find(|t| t.id == id)
    }

    /// Tiles whose buffered extent contains the position. Candidates come
    /// from the index range so this stays O(1) per point.
    pub fn tiles_overlapping_buffered(&self, x: f64, y: f64) -> Vec<&TileDescriptor> {
        let ix = ((x - self.origin_x) / self.side).floor() as i64;
        let iy = ((y - self.origin_y) / self.side).floor() as i64;
        let reach = (self.buffer / self.side).ceil().max(1.0) as i64;
        let mut out = Vec::new();
        for tile in &self.tiles {
            let (tix, tiy) = (tile.id.ix as i64, tile.id.iy as i64);
            if (tix - ix).abs() <= reach
                && (tiy - iy).abs() <= reach
                && tile.buffered().contains(x, y)
            {
                out.push(tile);
            }
        }
        out
    }

    /// The 3x3 neighbourhood of a tile (clamped at the rim), self included.
    pub fn neighborhood(&self, id: TileId) -> Vec<TileId> {
        let mut out = Vec::new();
        for dy in -1i64..=1 {
            for dx in -1i64..=1 {
                let (nix, niy) = (id.ix as i64 + dx, id.iy as i64 + dy);
                if nix < 0 || niy < 0 || nix >= self.nx as i64 || niy >= self.ny as i64 {
                    continue;
                }
                out.push(TileId::new(nix as u32, niy as u32));
            }
        }
        out
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write tile grid {:?}", path))?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<TileGrid> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read tile grid {:?}", path))?;
        serde_json::from_str(&json)
            .with_context(|| format!("Malformed tile grid file {:?}", path))
    }
}

fn las_header() -> Result<las::Header> {
    let mut builder = las::Builder::from((1, 2));
    builder.point_format = las::point::Format::new(1)?;
    Ok(builder.into_header()?)
}

pub fn read_las_points(path: &Path) -> Result<Vec<LidarPoint>> {
    let mut reader = las::Reader::from_path(path)
        .with_context(|| format!("Failed to open point file {:?}", path))?;
    let mut points = Vec::with_capacity(reader.header().number_of_points() as usize);
    for p in reader.points() {
        let p = p.with_context(|| format!("Bad point record in {:?}", path))?;
        points.push(LidarPoint::from_las(&p));
    }
    Ok(points)
}

pub fn write_las_points(path: &Path, points: &[LidarPoint]) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("Failed to create point file {:?}", path))?;
    let mut writer = las::Writer::new(BufWriter::new(file), las_header()?)?;
    for p in points {
        writer.write_point(p.to_las()?)?;
    }
    writer.close()?;
    Ok(())
}

/// Directory of per-tile point files, one LAS file per tile descriptor.
/// Writes are tile-scoped so parallel workers never contend.
pub struct TileStore {
    dir: PathBuf,
}

pub struct IngestStats {
    pub points: u64,
    pub tiles_written: usize,
}

impl TileStore {
    pub fn create(dir: PathBuf) -> Result<TileStore> {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create tile store {:?}", dir))?;
        Ok(TileStore { dir })
    }

    pub fn tile_path(&self, id: TileId) -> PathBuf {
        self.dir.join(format!("{}.las", id))
    }

    pub fn has_tile(&self, id: TileId) -> bool {
        self.tile_path(id).exists()
    }

    /// Points of one tile, `None` when the tile has no file (empty tile).
    pub fn read_tile(&self, id: TileId) -> Result<Option<Vec<LidarPoint>>> {
        let path = self.tile_path(id);
        if !path.exists() {
            return Ok(None);
        }
        read_las_points(&path).map(Some)
    }

    pub fn write_tile(&self, id: TileId, points: &[LidarPoint]) -> Result<()> {
        write_las_points(&self.tile_path(id), points)
    }

    /// All stored points of a tile's 3x3 neighbourhood that fall inside
    /// `extent`, via an R-tree range query.
    pub fn read_neighborhood(
        &self,
        grid: &TileGrid,
        id: TileId,
        extent: &BoundingBox,
    ) -> Result<Vec<LidarPoint>> {
        let mut all = Vec::new();
        for nid in grid.neighborhood(id) {
            if let Some(points) = self.read_tile(nid)? {
                all.extend(points);
            }
        }
        let tree = RTree::bulk_load(all);
        let envelope = AABB::from_corners(
            [extent.min_x, extent.min_y],
            [extent.max_x, extent.max_y],
        );
        Ok(tree
            .locate_in_envelope(&envelope)
            .cloned()
            .collect())
    }

    /// Stream the raw cloud once and distribute every point to each tile
    /// whose buffered extent contains it. One writer per touched tile; empty
    /// tiles get no file.
    pub fn ingest(&self, inputs: &[PathBuf], grid: &TileGrid) -> Result<IngestStats> {
        let mut writers: HashMap<TileId, las::Writer<BufWriter<File>>> = HashMap::new();
        let mut total: u64 = 0;

        for input in inputs {
            let mut reader = las::Reader::from_path(input)
                .with_context(|| format!("Failed to open input cloud {:?}", input))?;
            for p in reader.points() {
                let p = p.with_context(|| format!("Bad point record in {:?}", input))?;
                let point = LidarPoint::from_las(&p);
                if !point.has_finite_coords() {
                    continue;
                }
                total += 1;
                for tile in grid.tiles_overlapping_buffered(point.x, point.y) {
                    let writer = match writers.entry(tile.id) {
                        std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
                        std::collections::hash_map::Entry::Vacant(e) => {
                            let path = self.dir.join(format!("{}.las", tile.id));
                            let file = File::create(&path).with_context(|| {
                                format!("Failed to create tile file {:?}", path)
                            })?;
                            e.insert(las::Writer::new(BufWriter::new(file), las_header()?)?)
                        }
                    };
                    writer.write_point(point.to_las()?)?;
                }
            }
        }

        let tiles_written = writers.len();
        for (_, mut writer) in writers {
            writer.close()?;
        }
        Ok(IngestStats {
            points: total,
            tiles_written,
        })
    }
}

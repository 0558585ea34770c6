use std::path::Path;

use anyhow::{Context, Result};
use geo::{
    BooleanOps, ConcaveHull, EuclideanDistance, LineString, MultiPoint, MultiPolygon, Point,
    Polygon,
};
use log::debug;

use crate::config::PipelineConfig;
use crate::tiles::{TileGrid, TileId, TileStore};

/// Derive the true outer boundary of the surveyed area from the classified
/// tile store.
///
/// Interior tiles keep their rectangular footprint; tiles whose footprint
/// touches the unioned outer boundary line ("edge tiles") are re-footprinted
/// with a concave hull of the point positions in their buffered extent,
/// which follows the irregular flight-line edge far better than the tile
/// rectangle. Hulling the buffered selection makes adjacent hulls overlap
/// across tile seams, so the union has no gap at point-spacing scale. The
/// aggregate is unioned and stripped of interior holes, the survey interior
/// is assumed fully covered.
///
/// Every classified point lies within or on the result.
pub fn extract_boundary(
    store: &TileStore,
    grid: &TileGrid,
    classified: &[TileId],
    config: &PipelineConfig,
) -> Result<MultiPolygon<f64>> {
    if classified.is_empty() {
        anyhow::bail!("Cannot extract a boundary: no classified tiles");
    }

    let tiles: Vec<_> = classified
        .iter()
        .filter_map(|id| grid.get(*id))
        .collect();

    let rect_union = union_polygons(tiles.iter().map(|t| t.core.to_polygon()));
    let outer_rings: Vec<LineString<f64>> = rect_union
        .iter()
        .map(|p| p.exterior().clone())
        .collect();

    let mut footprints: Vec<Polygon<f64>> = Vec::with_capacity(tiles.len());
    let mut edge_tiles = 0;
    for tile in &tiles {
        let rect = tile.core.to_polygon();
        let near_outer = outer_rings
            .iter()
            .any(|ring| rect.exterior().euclidean_distance(ring) <= config.edge_distance);
        if !near_outer {
            footprints.push(rect);
            continue;
        }
        edge_tiles += 1;
        let points = store.read_neighborhood(grid, tile.id, &tile.buffered())?;
        if points.len() < config.hull_min_points {
            footprints.push(rect);
            continue;
        }
        let cloud =
            MultiPoint::new(points.iter().map(|p| Point::new(p.x, p.y)).collect());
        footprints.push(cloud.concave_hull(config.concavity));
    }
    debug!(
        "boundary: {} classified tiles, {} re-footprinted as edge tiles",
        tiles.len(),
        edge_tiles
    );

    let aggregate = union_polygons(footprints.into_iter());
    Ok(strip_holes(&aggregate))
}

fn union_polygons(polygons: impl Iterator<Item = Polygon<f64>>) -> MultiPolygon<f64> {
    let mut union = MultiPolygon::new(Vec::new());
    for poly in polygons {
        let single = MultiPolygon::new(vec![poly]);
        if union.0.is_empty() {
            union = single;
        } else {
            union = union.union(&single);
        }
    }
    union
}

/// The survey interior is assumed fully covered; any hole in the aggregate
/// is an artifact of the footprint union.
fn strip_holes(mp: &MultiPolygon<f64>) -> MultiPolygon<f64> {
    MultiPolygon::new(
        mp.iter()
            .map(|p| Polygon::new(p.exterior().clone(), Vec::new()))
            .collect(),
    )
}

/// Persist the boundary polygon as a GeoJSON feature.
pub fn write_boundary(path: &Path, boundary: &MultiPolygon<f64>) -> Result<()> {
    let geometry = geojson::Geometry::new(geojson::Value::from(boundary));
    let feature = geojson::Feature {
        bbox: None,
        geometry: Some(geometry),
        id: None,
        properties: None,
        foreign_members: None,
    };
    std::fs::write(path, geojson::GeoJson::Feature(feature).to_string())
        .with_context(|| format!("Failed to write boundary polygon {:?}", path))?;
    Ok(())
}

pub fn read_boundary(path: &Path) -> Result<MultiPolygon<f64>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read boundary polygon {:?}", path))?;
    let geojson: geojson::GeoJson = text
        .parse()
        .with_context(|| format!("Malformed boundary polygon {:?}", path))?;
    let geometry = match geojson {
        geojson::GeoJson::Feature(feature) => feature
            .geometry
            .with_context(|| format!("Boundary feature without geometry in {:?}", path))?,
        geojson::GeoJson::Geometry(geometry) => geometry,
        geojson::GeoJson::FeatureCollection(_) => {
            anyhow::bail!("Expected a single boundary feature in {:?}", path)
        }
    };
    let boundary: MultiPolygon<f64> = geometry.value.try_into()?;
    Ok(boundary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo_core::BoundingBox;
    use crate::points::{LidarPoint, CLASS_GROUND};
    use geo::Intersects;

    fn grid_points(bbox: &BoundingBox, step: f64) -> Vec<LidarPoint> {
        let mut points = Vec::new();
        let mut x = bbox.min_x;
        while x <= bbox.max_x + 1e-9 {
            let mut y = bbox.min_y;
            while y <= bbox.max_y + 1e-9 {
                points.push(LidarPoint {
                    x,
                    y,
                    z: 10.0,
                    return_number: 1,
                    number_of_returns: 1,
                    classification: CLASS_GROUND,
                    gps_time: x * 1000.0 + y,
                });
                y += step;
            }
            x += step;
        }
        points
    }

    fn populated_store(
        dir: &Path,
        grid: &TileGrid,
    ) -> (TileStore, Vec<TileId>, Vec<LidarPoint>) {
        let store = TileStore::create(dir.join("classified")).unwrap();
        let mut ids = Vec::new();
        let mut all = Vec::new();
        for tile in &grid.tiles {
            let points = grid_points(&tile.core, 2.0);
            store.write_tile(tile.id, &points).unwrap();
            ids.push(tile.id);
            all.extend(points);
        }
        (store, ids, all)
    }

    #[test]
    fn test_all_points_inside_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let bbox = BoundingBox::new(0.0, 0.0, 60.0, 60.0);
        let config = PipelineConfig {
            tiles_x: 3,
            tiles_y: 3,
            ..Default::default()
        };
        let grid = TileGrid::build(bbox, &config).unwrap();
        let (store, ids, all) = populated_store(dir.path(), &grid);

        let boundary = extract_boundary(&store, &grid, &ids, &config).unwrap();
        for p in &all {
            assert!(
                boundary.intersects(&Point::new(p.x, p.y)),
                "point ({}, {}) escaped the boundary",
                p.x,
                p.y
            );
        }
    }

    #[test]
    fn test_boundary_has_no_holes() {
        let dir = tempfile::tempdir().unwrap();
        let bbox = BoundingBox::new(0.0, 0.0, 60.0, 60.0);
        let config = PipelineConfig {
            tiles_x: 3,
            tiles_y: 3,
            ..Default::default()
        };
        let grid = TileGrid::build(bbox, &config).unwrap();
        let (store, ids, _) = populated_store(dir.path(), &grid);

        let boundary = extract_boundary(&store, &grid, &ids, &config).unwrap();
        assert!(boundary.iter().all(|p| p.interiors().is_empty()));
    }

    #[test]
    fn test_no_classified_tiles_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig::default();
        let grid =
            TileGrid::build(BoundingBox::new(0.0, 0.0, 10.0, 10.0), &config).unwrap();
        let store = TileStore::create(dir.path().join("classified")).unwrap();
        assert!(extract_boundary(&store, &grid, &[], &config).is_err());
    }

    #[test]
    fn test_boundary_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("boundary.geojson");
        let boundary = MultiPolygon::new(vec![BoundingBox::new(0.0, 0.0, 10.0, 10.0)
            .to_polygon()]);
        write_boundary(&path, &boundary).unwrap();
        let back = read_boundary(&path).unwrap();
        assert_eq!(back.0.len(), 1);
        assert!(back.intersects(&Point::new(5.0, 5.0)));
    }
}

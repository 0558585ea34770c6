use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use geo::{Intersects, MultiPolygon, Point};

use crate::geo_core::BoundingBox;

const ASC_NODATA: f64 = -9999.0;

/// A regular elevation grid (row-major, top-left origin). No-data cells hold
/// NaN, distinct from a zero elevation.
///
/// Geo-referencing: cell (r, c) covers the square whose center is
///   x = xmin + (c + 0.5) * resolution
///   y = ymax - (r + 0.5) * resolution
#[derive(Debug, Clone, PartialEq)]
pub struct Raster {
    pub nrows: usize,
    pub ncols: usize,
    pub xmin: f64,
    pub ymax: f64,
    pub resolution: f64,
    pub data: Vec<f64>,
}

impl Raster {
    /// A no-data raster covering `extent` at `resolution`, cell counts
    /// ceil-rounded so the grid never undershoots the extent.
    pub fn from_extent(extent: &BoundingBox, resolution: f64) -> Self {
        let ncols = (extent.width() / resolution).ceil().max(1.0) as usize;
        let nrows = (extent.height() / resolution).ceil().max(1.0) as usize;
        Raster {
            nrows,
            ncols,
            xmin: extent.min_x,
            ymax: extent.max_y,
            resolution,
            data: vec![f64::NAN; nrows * ncols],
        }
    }

    pub fn extent(&self) -> BoundingBox {
        BoundingBox::new(
            self.xmin,
            self.ymax - self.nrows as f64 * self.resolution,
            self.xmin + self.ncols as f64 * self.resolution,
            self.ymax,
        )
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.data[row * self.ncols + col]
    }

    #[inline]
    pub fn set(&mut self, row: usize, col: usize, value: f64) {
        self.data[row * self.ncols + col] = value;
    }

    #[inline]
    pub fn cell_center(&self, row: usize, col: usize) -> (f64, f64) {
        (
            self.xmin + (col as f64 + 0.5) * self.resolution,
            self.ymax - (row as f64 + 0.5) * self.resolution,
        )
    }

    /// Cell containing the world position, or `None` outside the grid.
    pub fn cell_at(&self, x: f64, y: f64) -> Option<(usize, usize)> {
        let col = ((x - self.xmin) / self.resolution).floor();
        let row = ((self.ymax - y) / self.resolution).floor();
        if col < 0.0 || row < 0.0 {
            return None;
        }
        let (row, col) = (row as usize, col as usize);
        if row < self.nrows && col < self.ncols {
            Some((row, col))
        } else {
            None
        }
    }

    /// Value of the cell containing the position (NaN outside the grid).
    pub fn value_at(&self, x: f64, y: f64) -> f64 {
        match self.cell_at(x, y) {
            Some((r, c)) => self.get(r, c),
            None => f64::NAN,
        }
    }

    pub fn count_nodata(&self) -> usize {
        self.data.iter().filter(|v| v.is_nan()).count()
    }

    pub fn count_data(&self) -> usize {
        self.data.len() - self.count_nodata()
    }

    /// Fill no-data cells from the mean of populated cells in the
    /// (2r+1)x(2r+1) window. Each pass works on a snapshot, so fills do not
    /// cascade within a pass; cells with zero informative neighbours stay
    /// no-data. Returns the number of cells filled.
    pub fn fill_gaps(&mut self, radius: usize, passes: usize) -> usize {
        let mut filled = 0;
        let r = radius as i64;
        for _ in 0..passes {
            let snapshot = self.data.clone();
            let mut pass_filled = 0;
            for row in 0..self.nrows as i64 {
                for col in 0..self.ncols as i64 {
                    let idx = row as usize * self.ncols + col as usize;
                    if !snapshot[idx].is_nan() {
                        continue;
                    }
                    let mut sum = 0.0;
                    let mut n = 0usize;
                    for dr in -r..=r {
                        for dc in -r..=r {
                            let (nr, nc) = (row + dr, col + dc);
                            if nr < 0
                                || nc < 0
                                || nr >= self.nrows as i64
                                || nc >= self.ncols as i64
                            {
                                continue;
                            }
                            let v = snapshot[nr as usize * self.ncols + nc as usize];
                            if !v.is_nan() {
                                sum += v;
                                n += 1;
                            }
                        }
                    }
                    if n > 0 {
                        self.data[idx] = sum / n as f64;
                        pass_filled += 1;
                    }
                }
            }
            filled += pass_filled;
            if pass_filled == 0 {
                break;
            }
        }
        filled
    }

    /// Crop to the cells whose footprint lies inside `extent`. Both rasters
    /// share the cell lattice, so the crop is exact.
    pub fn crop(&self, extent: &BoundingBox) -> Raster {
        let eps = 1e-9;
        let c0 = (((extent.min_x - self.xmin) / self.resolution - eps).ceil()).max(0.0) as usize;
        let c1 = ((((extent.max_x - self.xmin) / self.resolution) + eps).floor())
            .min(self.ncols as f64) as usize;
        let r0 = (((self.ymax - extent.max_y) / self.resolution - eps).ceil()).max(0.0) as usize;
        let r1 = ((((self.ymax - extent.min_y) / self.resolution) + eps).floor())
            .min(self.nrows as f64) as usize;
        let (c1, r1) = (c1.max(c0), r1.max(r0));
        let mut out = Raster {
            nrows: r1 - r0,
            ncols: c1 - c0,
            xmin: self.xmin + c0 as f64 * self.resolution,
            ymax: self.ymax - r0 as f64 * self.resolution,
            resolution: self.resolution,
            data: Vec::with_capacity((r1 - r0) * (c1 - c0)),
        };
        for row in r0..r1 {
            out.data
                .extend_from_slice(&self.data[row * self.ncols + c0..row * self.ncols + c1]);
        }
        out
    }

    /// Place another raster's cells at their absolute grid position. Both
    /// rasters must share resolution and lattice alignment; only populated
    /// source cells are copied.
    pub fn paste(&mut self, other: &Raster) {
        let col_off = ((other.xmin - self.xmin) / self.resolution).round() as i64;
        let row_off = ((self.ymax - other.ymax) / self.resolution).round() as i64;
        for row in 0..other.nrows {
            let tr = row as i64 + row_off;
            if tr < 0 || tr >= self.nrows as i64 {
                continue;
            }
            for col in 0..other.ncols {
                let tc = col as i64 + col_off;
                if tc < 0 || tc >= self.ncols as i64 {
                    continue;
                }
                let v = other.get(row, col);
                if !v.is_nan() {
                    self.set(tr as usize, tc as usize, v);
                }
            }
        }
    }

    /// Set every cell whose center falls outside the polygon to no-data.
    /// Centers on the polygon boundary count as inside. Returns the number
    /// of cells masked out.
    pub fn mask(&mut self, boundary: &MultiPolygon<f64>) -> usize {
        let mut masked = 0;
        for row in 0..self.nrows {
            for col in 0..self.ncols {
                if self.get(row, col).is_nan() {
                    continue;
                }
                let (x, y) = self.cell_center(row, col);
                if !boundary.intersects(&Point::new(x, y)) {
                    self.set(row, col, f64::NAN);
                    masked += 1;
                }
            }
        }
        masked
    }

    /// Cell-wise `self - other`, clamped at zero (canopy height is never
    /// negative). Cells where either side is no-data stay no-data.
    pub fn difference_clamped(&self, other: &Raster) -> Result<Raster> {
        if self.nrows != other.nrows || self.ncols != other.ncols {
            anyhow::bail!(
                "raster shapes differ: {}x{} vs {}x{}",
                self.nrows,
                self.ncols,
                other.nrows,
                other.ncols
            );
        }
        let mut out = self.clone();
        for (v, o) in out.data.iter_mut().zip(other.data.iter()) {
            *v = if v.is_nan() || o.is_nan() {
                f64::NAN
            } else {
                (*v - o).max(0.0)
            };
        }
        Ok(out)
    }

    /// Write as an ESRI ASCII grid. The formatting is deterministic so a
    /// rerun with identical inputs is byte-identical.
    pub fn write_asc(&self, path: &Path) -> Result<()> {
        let file = File::create(path)
            .with_context(|| format!("Failed to create raster file {:?}", path))?;
        let mut w = BufWriter::new(file);
        writeln!(w, "ncols {}", self.ncols)?;
        writeln!(w, "nrows {}", self.nrows)?;
        writeln!(w, "xllcorner {:.3}", self.xmin)?;
        writeln!(
            w,
            "yllcorner {:.3}",
            self.ymax - self.nrows as f64 * self.resolution
        )?;
        writeln!(w, "cellsize {:.6}", self.resolution)?;
        writeln!(w, "NODATA_value {}", ASC_NODATA)?;
        for row in 0..self.nrows {
            let mut line = String::with_capacity(self.ncols * 8);
            for col in 0..self.ncols {
                if col > 0 {
                    line.push(' ');
                }
                let v = self.get(row, col);
                if v.is_nan() {
                    line.push_str("-9999");
                } else {
                    line.push_str(&format!("{:.3}", v));
                }
            }
            writeln!(w, "{}", line)?;
        }
        w.flush()
            .with_context(|| format!("Failed to write raster file {:?}", path))?;
        Ok(())
    }

    pub fn read_asc(path: &Path) -> Result<Raster> {
        let file =
            File::open(path).with_context(|| format!("Failed to open raster file {:?}", path))?;
        let reader = BufReader::new(file);
        let mut lines = reader.lines();

        let mut header = std::collections::HashMap::new();
        let mut first_data_line: Option<String> = None;
        for line in lines.by_ref() {
            let line = line?;
            let mut parts = line.split_whitespace();
            let key = match parts.next() {
                Some(k) => k.to_ascii_lowercase(),
                None => continue,
            };
            if key.parse::<f64>().is_ok() {
                first_data_line = Some(line);
                break;
            }
            let value: f64 = parts
                .next()
                .with_context(|| format!("Missing value for header key {}", key))?
                .parse()
                .with_context(|| format!("Bad header value for {}", key))?;
            header.insert(key, value);
        }

        let ncols = *header.get("ncols").context("Missing ncols")? as usize;
        let nrows = *header.get("nrows").context("Missing nrows")? as usize;
        let xllcorner = *header.get("xllcorner").context("Missing xllcorner")?;
        let yllcorner = *header.get("yllcorner").context("Missing yllcorner")?;
        let cellsize = *header.get("cellsize").context("Missing cellsize")?;
        let nodata = header.get("nodata_value").copied().unwrap_or(ASC_NODATA);

        let mut data = Vec::with_capacity(nrows * ncols);
        let push_line = |line: &str, data: &mut Vec<f64>| -> Result<()> {
            for tok in line.split_whitespace() {
                let v: f64 = tok
                    .parse()
                    .with_context(|| format!("Bad raster value {:?} in {:?}", tok, path))?;
                data.push(if (v - nodata).abs() < 1e-6 { f64::NAN } else { v });
            }
            Ok(())
        };
        if let Some(line) = first_data_line {
            push_line(&line, &mut data)?;
        }
        for line in lines {
            push_line(&line?, &mut data)?;
        }
        if data.len() != nrows * ncols {
            anyhow::bail!(
                "Raster {:?} has {} values, expected {}",
                path,
                data.len(),
                nrows * ncols
            );
        }

        Ok(Raster {
            nrows,
            ncols,
            xmin: xllcorner,
            ymax: yllcorner + nrows as f64 * cellsize,
            resolution: cellsize,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small(values: &[f64]) -> Raster {
        Raster {
            nrows: 3,
            ncols: 3,
            xmin: 0.0,
            ymax: 3.0,
            resolution: 1.0,
            data: values.to_vec(),
        }
    }

    #[test]
    fn test_fill_gap_is_neighbor_mean() {
        let nan = f64::NAN;
        let mut r = small(&[1.0, 2.0, 3.0, 4.0, nan, 6.0, 7.0, 8.0, 9.0]);
        let filled = r.fill_gaps(1, 1);
        assert_eq!(filled, 1);
        // mean of the eight populated neighbours
        assert!((r.get(1, 1) - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_fill_gap_without_neighbors_stays_nodata() {
        let nan = f64::NAN;
        let mut r = small(&[nan; 9]);
        r.set(0, 0, 1.0);
        let filled = r.fill_gaps(1, 1);
        // only the three cells adjacent to (0,0) can be filled
        assert_eq!(filled, 3);
        assert!(r.get(2, 2).is_nan());
    }

    #[test]
    fn test_asc_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r.asc");
        let r = small(&[1.0, 2.0, 3.0, 4.0, f64::NAN, 6.0, 7.0, 8.0, 9.0]);
        r.write_asc(&path).unwrap();
        let back = Raster::read_asc(&path).unwrap();
        assert_eq!(back.nrows, 3);
        assert_eq!(back.ncols, 3);
        assert!(back.get(1, 1).is_nan());
        assert_eq!(back.get(2, 2), 9.0);
        assert_eq!(back.extent(), r.extent());
        // byte-identical rewrite
        let path2 = dir.path().join("r2.asc");
        back.write_asc(&path2).unwrap();
        assert_eq!(
            std::fs::read(&path).unwrap(),
            std::fs::read(&path2).unwrap()
        );
    }

    #[test]
    fn test_crop_to_intersection() {
        let r = small(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0]);
        let cropped = r.crop(&BoundingBox::new(1.0, 0.0, 3.0, 2.0));
        assert_eq!(cropped.nrows, 2);
        assert_eq!(cropped.ncols, 2);
        assert_eq!(cropped.get(0, 0), 5.0);
        assert_eq!(cropped.get(1, 1), 9.0);
        assert_eq!(cropped.xmin, 1.0);
        assert_eq!(cropped.ymax, 2.0);
    }

    #[test]
    fn test_paste_places_at_absolute_position() {
        let mut full = Raster::from_extent(&BoundingBox::new(0.0, 0.0, 4.0, 4.0), 1.0);
        let sub = Raster {
            nrows: 2,
            ncols: 2,
            xmin: 2.0,
            ymax: 2.0,
            resolution: 1.0,
            data: vec![1.0, 2.0, 3.0, 4.0],
        };
        full.paste(&sub);
        assert_eq!(full.get(2, 2), 1.0);
        assert_eq!(full.get(3, 3), 4.0);
        assert!(full.get(0, 0).is_nan());
    }

    #[test]
    fn test_difference_clamped() {
        let dsm = small(&[10.0, 12.0, f64::NAN, 10.0, 10.0, 10.0, 10.0, 10.0, 10.0]);
        let dem = small(&[10.0, 10.0, 10.0, 11.0, 10.0, 10.0, f64::NAN, 10.0, 10.0]);
        let chm = dsm.difference_clamped(&dem).unwrap();
        assert_eq!(chm.get(0, 0), 0.0);
        assert_eq!(chm.get(0, 1), 2.0);
        assert!(chm.get(0, 2).is_nan());
        // negative difference clamps to zero
        assert_eq!(chm.get(1, 0), 0.0);
        assert!(chm.get(2, 0).is_nan());
    }

    #[test]
    fn test_mask_outside_polygon() {
        use geo::{polygon, MultiPolygon};
        let mut r = small(&[1.0; 9]);
        let poly = polygon![
            (x: 0.0, y: 0.0),
            (x: 2.0, y: 0.0),
            (x: 2.0, y: 3.0),
            (x: 0.0, y: 3.0),
            (x: 0.0, y: 0.0),
        ];
        let masked = r.mask(&MultiPolygon::new(vec![poly]));
        // right-hand column centers (x = 2.5) fall outside
        assert_eq!(masked, 3);
        assert!(r.get(0, 2).is_nan());
        assert_eq!(r.get(0, 0), 1.0);
    }
}

use std::fmt::Display;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Cell value types storable in a [`Raster`].
pub trait CellValue: Copy + PartialEq + Display + FromStr + Send + Sync {
    fn from_f64(v: f64) -> Self;
    fn to_f64(self) -> f64;
}

impl CellValue for f64 {
    fn from_f64(v: f64) -> Self {
        v
    }
    fn to_f64(self) -> f64 {
        self
    }
}

impl CellValue for i32 {
    fn from_f64(v: f64) -> Self {
        v as i32
    }
    fn to_f64(self) -> f64 {
        self as f64
    }
}

/// Georeferencing header shared by all co-registered grids of a model.
///
/// `(i, j)` are grid indices with `i` along x and `j` along y, `j = 0` at
/// the southern edge. World coordinates refer to cell centers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RasterHeader {
    pub origin_x: f64,
    pub origin_y: f64,
    pub dx: f64,
    pub dy: f64,
    pub nx: usize,
    pub ny: usize,
    pub nodata: f64,
}

impl RasterHeader {
    pub fn get_xy_from_ij(&self, i: usize, j: usize) -> (f64, f64) {
        (
            self.origin_x + (i as f64 + 0.5) * self.dx,
            self.origin_y + (j as f64 + 0.5) * self.dy,
        )
    }

    /// Inverse transform. Returns `None` when `(x, y)` falls outside the grid.
    pub fn get_ij_from_xy(&self, x: f64, y: f64) -> Option<(usize, usize)> {
        let fi = (x - self.origin_x) / self.dx;
        let fj = (y - self.origin_y) / self.dy;
        if fi < 0.0 || fj < 0.0 {
            return None;
        }
        let (i, j) = (fi.floor() as usize, fj.floor() as usize);
        if i >= self.nx || j >= self.ny {
            return None;
        }
        Some((i, j))
    }
}

/// Dense 2D grid with a georeferencing header and a nodata mask.
///
/// Values are stored row-major by `j`; `data[j * nx + i]` is the cell at
/// `(i, j)`.
#[derive(Debug, Clone)]
pub struct Raster<T: CellValue> {
    pub header: RasterHeader,
    pub data: Vec<T>,
}

impl<T: CellValue> Raster<T> {
    /// New raster filled with the nodata value.
    pub fn filled_nodata(header: RasterHeader) -> Self {
        let nodata = T::from_f64(header.nodata);
        Raster {
            data: vec![nodata; header.nx * header.ny],
            header,
        }
    }

    #[inline]
    fn idx(&self, i: usize, j: usize) -> usize {
        j * self.header.nx + i
    }

    #[inline]
    pub fn get(&self, i: usize, j: usize) -> T {
        self.data[self.idx(i, j)]
    }

    #[inline]
    pub fn set(&mut self, i: usize, j: usize, value: T) {
        let idx = self.idx(i, j);
        self.data[idx] = value;
    }

    #[inline]
    pub fn is_nodata(&self, i: usize, j: usize) -> bool {
        self.get(i, j).to_f64() == self.header.nodata
    }

    /// Whether `(i, j)` is inside the grid and carries a data value.
    pub fn is_active(&self, i: isize, j: isize) -> bool {
        if i < 0 || j < 0 || i as usize >= self.header.nx || j as usize >= self.header.ny {
            return false;
        }
        !self.is_nodata(i as usize, j as usize)
    }

    /// Number of cells carrying a data value.
    pub fn nb_notnull(&self) -> usize {
        let nodata = self.header.nodata;
        self.data.iter().filter(|v| v.to_f64() != nodata).count()
    }

    /// Read an ESRI ASCII grid.
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::MissingRaster(path.to_path_buf()));
        }
        let contents = fs::read_to_string(path)?;
        Self::from_ascii(&contents).map_err(|reason| Error::RasterFormat {
            path: path.to_path_buf(),
            reason,
        })
    }

    /// Parse an ESRI ASCII grid from text.
    pub fn from_ascii(contents: &str) -> std::result::Result<Self, String> {
        let mut tokens = contents.split_whitespace();

        let mut header_val = |key: &str| -> std::result::Result<f64, String> {
            let k = tokens
                .next()
                .ok_or_else(|| format!("missing header key {}", key))?;
            if !k.eq_ignore_ascii_case(key) {
                return Err(format!("expected header key {}, found {}", key, k));
            }
            tokens
                .next()
                .ok_or_else(|| format!("missing value for {}", key))?
                .parse::<f64>()
                .map_err(|e| format!("bad value for {}: {}", key, e))
        };

        let nx = header_val("ncols")? as usize;
        let ny = header_val("nrows")? as usize;
        let origin_x = header_val("xllcorner")?;
        let origin_y = header_val("yllcorner")?;
        let dx = header_val("cellsize")?;
        let nodata = header_val("NODATA_value")?;

        let header = RasterHeader {
            origin_x,
            origin_y,
            dx,
            dy: dx,
            nx,
            ny,
            nodata,
        };

        let mut raster = Raster::filled_nodata(header);
        // ASCII grids are written north-up: the first row is j = ny - 1
        for row in 0..ny {
            let j = ny - 1 - row;
            for i in 0..nx {
                let tok = tokens
                    .next()
                    .ok_or_else(|| format!("truncated grid body at row {}, col {}", row, i))?;
                let v = tok
                    .parse::<f64>()
                    .map_err(|e| format!("bad cell value {:?}: {}", tok, e))?;
                raster.set(i, j, T::from_f64(v));
            }
        }

        Ok(raster)
    }

    /// Write as an ESRI ASCII grid, creating parent directories as needed.
    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_ascii())?;
        Ok(())
    }

    pub fn to_ascii(&self) -> String {
        let h = &self.header;
        let mut out = String::new();
        out.push_str(&format!("ncols {}\n", h.nx));
        out.push_str(&format!("nrows {}\n", h.ny));
        out.push_str(&format!("xllcorner {}\n", h.origin_x));
        out.push_str(&format!("yllcorner {}\n", h.origin_y));
        out.push_str(&format!("cellsize {}\n", h.dx));
        out.push_str(&format!("NODATA_value {}\n", h.nodata));
        for row in 0..h.ny {
            let j = h.ny - 1 - row;
            let line: Vec<String> = (0..h.nx).map(|i| self.get(i, j).to_string()).collect();
            out.push_str(&line.join(" "));
            out.push('\n');
        }
        out
    }
}

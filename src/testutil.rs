//! Synthetic raster fixtures for unit tests. Grids are described row by
//! row as they would appear on a map, northern row first.

use crate::error::Result;
use crate::raster::{CellValue, Raster, RasterHeader};
use crate::watershed::{Watershed, WatershedRasters};

const NODATA: f64 = -9999.0;

pub struct GridSpec {
    res: f64,
    dem: Vec<Vec<f64>>,
    sub: Vec<Vec<i32>>,
    reach: Vec<Vec<i32>>,
    uparea: Option<Vec<Vec<f64>>>,
    slopes: Option<Vec<Vec<f64>>>,
    coupled: Vec<[f64; 4]>,
}

impl GridSpec {
    pub fn new(res: f64) -> GridSpec {
        GridSpec {
            res,
            dem: Vec::new(),
            sub: Vec::new(),
            reach: Vec::new(),
            uparea: None,
            slopes: None,
            coupled: Vec::new(),
        }
    }

    pub fn dem(mut self, rows: Vec<Vec<f64>>) -> Self {
        self.dem = rows;
        self
    }

    pub fn sub(mut self, rows: Vec<Vec<i32>>) -> Self {
        self.sub = rows;
        self
    }

    pub fn reach(mut self, rows: Vec<Vec<i32>>) -> Self {
        self.reach = rows;
        self
    }

    pub fn uparea(mut self, rows: Vec<Vec<f64>>) -> Self {
        self.uparea = Some(rows);
        self
    }

    pub fn slopes(mut self, rows: Vec<Vec<f64>>) -> Self {
        self.slopes = Some(rows);
        self
    }

    pub fn coupled(mut self, pairs: Vec<[f64; 4]>) -> Self {
        self.coupled = pairs;
        self
    }

    fn header(&self) -> RasterHeader {
        RasterHeader {
            origin_x: 0.0,
            origin_y: 0.0,
            dx: self.res,
            dy: self.res,
            nx: self.dem[0].len(),
            ny: self.dem.len(),
            nodata: NODATA,
        }
    }

    pub fn rasters(&self) -> WatershedRasters {
        let header = self.header();
        let dem = raster_from_rows(header, &self.dem);

        // unit drained area everywhere unless the test says otherwise
        let unit = self.res * self.res / 1.0e6;
        let uparea = match &self.uparea {
            Some(rows) => raster_from_rows(header, rows),
            None => {
                let mut r = Raster::filled_nodata(header);
                r.data.fill(unit);
                r
            }
        };

        let mut zeros: Raster<f64> = Raster::filled_nodata(header);
        zeros.data.fill(0.0);

        let slopes = match &self.slopes {
            Some(rows) => raster_from_rows(header, rows),
            None => zeros.clone(),
        };

        WatershedRasters {
            subs: raster_from_rows(header, &self.sub),
            dem_before: dem.clone(),
            dem_after: dem,
            slopes,
            reaches: raster_from_rows(header, &self.reach),
            uparea,
            times: zeros,
            dem_10m: None,
            dem_20m: None,
        }
    }

    pub fn build_watershed(
        self,
        tslopemin: Option<f64>,
        tslopemax: Option<f64>,
    ) -> Result<Watershed> {
        let rasters = self.rasters();
        Watershed::build(&rasters, &self.coupled, tslopemin, tslopemax)
    }
}

fn raster_from_rows<T: CellValue>(header: RasterHeader, rows: &[Vec<T>]) -> Raster<T> {
    assert_eq!(rows.len(), header.ny);
    let mut raster = Raster::filled_nodata(header);
    for (row, values) in rows.iter().enumerate() {
        assert_eq!(values.len(), header.nx);
        let j = header.ny - 1 - row;
        for (i, &v) in values.iter().enumerate() {
            raster.set(i, j, v);
        }
    }
    raster
}

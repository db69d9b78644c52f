//! Geographic extents, tile footprints and their WKT encodings.
//!
//! All coordinates are degrees, longitude on the x axis increasing to the
//! right and latitude on the y axis increasing upwards. WKT output is always
//! `x y` (longitude then latitude).

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GeometryError {
    #[error("coordinate {name} is not finite ({value})")]
    NonFinite { name: &'static str, value: f64 },
    #[error("{axis} range is inverted: min {min} > max {max}")]
    Inverted { axis: &'static str, min: f64, max: f64 },
    #[error("tile footprint must be positive, got {width} x {height}")]
    EmptyFootprint { width: f64, height: f64 },
    #[error("pixel size must be positive, got {width} x {height}")]
    EmptyPixelSize { width: u32, height: u32 },
}

fn finite(name: &'static str, value: f64) -> Result<f64, GeometryError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(GeometryError::NonFinite { name, value })
    }
}

/// A point in (longitude, latitude) degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub longitude: f64,
    pub latitude: f64,
}

impl GeoPoint {
    #[inline]
    pub fn new(longitude: f64, latitude: f64) -> Self {
        Self { longitude, latitude }
    }

    /// `POINT(lon lat)`.
    pub fn to_wkt(&self) -> String {
        format!("POINT({} {})", self.longitude, self.latitude)
    }
}

/// Axis-aligned geographic bounding box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoExtent {
    pub x_min: f64,
    pub y_min: f64,
    pub x_max: f64,
    pub y_max: f64,
}

impl GeoExtent {
    /// Builds an extent, rejecting non-finite or inverted ranges.
    pub fn new(x_min: f64, y_min: f64, x_max: f64, y_max: f64) -> Result<Self, GeometryError> {
        let x_min = finite("x_min", x_min)?;
        let y_min = finite("y_min", y_min)?;
        let x_max = finite("x_max", x_max)?;
        let y_max = finite("y_max", y_max)?;

        if x_min > x_max {
            return Err(GeometryError::Inverted { axis: "x", min: x_min, max: x_max });
        }
        if y_min > y_max {
            return Err(GeometryError::Inverted { axis: "y", min: y_min, max: y_max });
        }

        Ok(Self { x_min, y_min, x_max, y_max })
    }

    /// Extent of a tile whose top-left corner sits at (`latitude`, `longitude`).
    #[inline]
    pub fn from_top_left(latitude: f64, longitude: f64, footprint: TileFootprint) -> Self {
        Self {
            x_min: longitude,
            y_min: latitude - footprint.height,
            x_max: longitude + footprint.width,
            y_max: latitude,
        }
    }

    #[inline]
    pub fn width(&self) -> f64 {
        self.x_max - self.x_min
    }

    #[inline]
    pub fn height(&self) -> f64 {
        self.y_max - self.y_min
    }

    #[inline]
    pub fn centroid(&self) -> GeoPoint {
        GeoPoint::new(
            (self.x_min + self.x_max) / 2.0,
            (self.y_min + self.y_max) / 2.0,
        )
    }

    /// Inclusive containment test.
    #[inline]
    pub fn contains(&self, point: GeoPoint) -> bool {
        point.longitude >= self.x_min
            && point.longitude <= self.x_max
            && point.latitude >= self.y_min
            && point.latitude <= self.y_max
    }

    /// Closed ring of the four corners: min/min, min/max, max/max, max/min, min/min.
    pub fn ring(&self) -> [GeoPoint; 5] {
        [
            GeoPoint::new(self.x_min, self.y_min),
            GeoPoint::new(self.x_min, self.y_max),
            GeoPoint::new(self.x_max, self.y_max),
            GeoPoint::new(self.x_max, self.y_min),
            GeoPoint::new(self.x_min, self.y_min),
        ]
    }

    /// `POLYGON((x1 y1, x2 y2, x3 y3, x4 y4, x1 y1))` following [`GeoExtent::ring`].
    pub fn to_wkt_polygon(&self) -> String {
        let mut wkt = String::from("POLYGON((");
        for (i, p) in self.ring().iter().enumerate() {
            if i > 0 {
                wkt.push_str(", ");
            }
            let _ = write!(wkt, "{} {}", p.longitude, p.latitude);
        }
        wkt.push_str("))");
        wkt
    }

    /// The GetMap style `lon_min,lat_min,lon_max,lat_max` string.
    pub fn to_bbox_param(&self) -> String {
        format!("{},{},{},{}", self.x_min, self.y_min, self.x_max, self.y_max)
    }
}

/// Fixed tile size in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TileFootprint {
    pub width: f64,
    pub height: f64,
}

impl TileFootprint {
    pub fn new(width: f64, height: f64) -> Result<Self, GeometryError> {
        let width = finite("width", width)?;
        let height = finite("height", height)?;
        if width <= 0.0 || height <= 0.0 {
            return Err(GeometryError::EmptyFootprint { width, height });
        }
        Ok(Self { width, height })
    }

    /// Square footprint, the shape every tile in the source imagery uses.
    pub fn square(size: f64) -> Result<Self, GeometryError> {
        Self::new(size, size)
    }
}

/// Raster dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PixelSize {
    pub width: u32,
    pub height: u32,
}

impl PixelSize {
    pub fn new(width: u32, height: u32) -> Result<Self, GeometryError> {
        if width == 0 || height == 0 {
            return Err(GeometryError::EmptyPixelSize { width, height });
        }
        Ok(Self { width, height })
    }
}

impl std::fmt::Display for PixelSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

//! Pixel/fractional boxes to geographic boxes.

use crate::extent::{GeoExtent, GeoPoint, PixelSize};
use crate::label::{FractionalBox, RawLabel};
use serde::{Deserialize, Serialize};

/// Geographic form of one label.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoLabel {
    pub extent: GeoExtent,
    pub centroid: GeoPoint,
}

impl GeoLabel {
    pub fn point_wkt(&self) -> String {
        self.centroid.to_wkt()
    }

    pub fn polygon_wkt(&self) -> String {
        self.extent.to_wkt_polygon()
    }
}

/// `a` at `t = 0`, `b` at `t = 1`, exactly.
#[inline]
fn lerp(a: f64, b: f64, t: f64) -> f64 {
    a * (1.0 - t) + b * t
}

/// Places a fractional box inside a tile's geographic extent.
///
/// Fractions run from the tile's top-left corner, so longitude grows with
/// `left`/`right` while latitude shrinks with `top`/`bottom`:
///
/// ```text
/// x_min = tile.x_min + tile.width  * left     x_max = tile.x_min + tile.width  * right
/// y_max = tile.y_max - tile.height * top      y_min = tile.y_max - tile.height * bottom
/// ```
///
/// Each edge is interpolated between the two tile edges, which makes
/// fractions of 0 and 1 land on the tile corners bit for bit.
pub fn project(tile: &GeoExtent, frac: FractionalBox) -> GeoLabel {
    let x_a = lerp(tile.x_min, tile.x_max, frac.left);
    let x_b = lerp(tile.x_min, tile.x_max, frac.right);
    let y_a = lerp(tile.y_max, tile.y_min, frac.top);
    let y_b = lerp(tile.y_max, tile.y_min, frac.bottom);

    let extent = GeoExtent {
        x_min: x_a.min(x_b),
        y_min: y_a.min(y_b),
        x_max: x_a.max(x_b),
        y_max: y_a.max(y_b),
    };

    GeoLabel {
        extent,
        centroid: extent.centroid(),
    }
}

/// [`project`] for a parsed label on an image of `pixel_size`.
pub fn project_label(tile: &GeoExtent, pixel_size: PixelSize, label: &RawLabel) -> GeoLabel {
    project(tile, label.fractional(pixel_size))
}

//! tilegeo: geometry core for aerial tile detection.
//!
//! - [`grid`]: enumerates tile origins over an area (row-major, top-left
//!   first) or takes a supplied list, and partitions them into jobs.
//! - [`label`]: the two label line formats (training fractions and detector
//!   pixels) and their conversion to fractional box edges.
//! - [`transform`]: fractional boxes to geographic boxes and centroids.
//! - [`record`]: typed image/label rows with fixed column order.
//!
//! Coordinates are degrees; x is longitude, y is latitude, and every WKT
//! string is written longitude first.

pub mod extent;
pub mod grid;
pub mod label;
pub mod record;
pub mod transform;

pub use extent::{GeoExtent, GeoPoint, GeometryError, PixelSize, TileFootprint};
pub use grid::{split_even, TileGrid, TileOrigin, TilePlan};
pub use label::{parse_lines, Detection, FractionalBox, LabelEncoding, LabelError, RawLabel, TrainingLabel};
pub use record::{
    check_columns, Column, ColumnKind, ImageRecord, LabelRecord, RecordError, ReferenceMatch,
    SqlValue, TableRow,
};
pub use transform::{project, project_label, GeoLabel};

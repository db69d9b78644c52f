//! Typed rows for the image and label tables.
//!
//! The column list of each table is fixed here, and [`TableRow::values`]
//! returns values in exactly that order. Writers build their statements
//! from [`TableRow::COLUMNS`] and bind [`TableRow::values`] positionally.

use crate::extent::{GeoExtent, TileFootprint};
use crate::label::LabelEncoding;
use crate::transform::GeoLabel;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RecordError {
    #[error("file path is empty")]
    EmptyFilePath,
    #[error("{field} is not finite")]
    NonFinite { field: &'static str },
    #[error("confidence {0} is outside [0, 1]")]
    Confidence(f64),
    #[error("centroid ({longitude}, {latitude}) lies outside the label polygon")]
    CentroidOutside { longitude: f64, latitude: f64 },
    #[error("polygon is inverted")]
    InvertedPolygon,
    #[error("{got} values for {expected} columns")]
    ColumnMismatch { expected: usize, got: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    Integer,
    Float,
    /// WKT text, stored through `ST_GeomFromText`.
    Geometry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub kind: ColumnKind,
    pub nullable: bool,
}

const fn col(name: &'static str, kind: ColumnKind) -> Column {
    Column { name, kind, nullable: false }
}

const fn nullable(name: &'static str, kind: ColumnKind) -> Column {
    Column { name, kind, nullable: true }
}

/// A bindable column value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SqlValue<'a> {
    Text(Option<&'a str>),
    Integer(i64),
    Float(Option<f64>),
    Geometry(&'a str),
}

pub trait TableRow {
    const COLUMNS: &'static [Column];

    fn values(&self) -> Vec<SqlValue<'_>>;

    fn validate(&self) -> Result<(), RecordError>;

    /// Identifier used in log lines about this row.
    fn file_path(&self) -> &str;
}

fn check_finite(field: &'static str, value: f64) -> Result<(), RecordError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(RecordError::NonFinite { field })
    }
}

fn check_extent(extent: &GeoExtent) -> Result<(), RecordError> {
    check_finite("x_min", extent.x_min)?;
    check_finite("y_min", extent.y_min)?;
    check_finite("x_max", extent.x_max)?;
    check_finite("y_max", extent.y_max)?;
    if extent.x_min > extent.x_max || extent.y_min > extent.y_max {
        return Err(RecordError::InvertedPolygon);
    }
    Ok(())
}

/// Parcel and address identifiers resolved for a label's centroid.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceMatch {
    pub parcel_id: Option<String>,
    pub address_id: Option<String>,
    pub address_text: Option<String>,
}

/// One row per processed tile or training chip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub file_path: String,
    pub label_count: u32,
    pub width: f64,
    pub height: f64,
    pub extent: GeoExtent,
    pub geom: String,
}

impl ImageRecord {
    pub fn new(file_path: impl Into<String>, extent: GeoExtent, label_count: u32) -> Self {
        Self {
            file_path: file_path.into(),
            label_count,
            width: extent.width(),
            height: extent.height(),
            geom: extent.to_wkt_polygon(),
            extent,
        }
    }

    /// Image row for a grid tile; footprint dimensions are reported as configured
    /// rather than re-derived from the extent.
    pub fn for_tile(
        file_path: impl Into<String>,
        extent: GeoExtent,
        footprint: TileFootprint,
        label_count: u32,
    ) -> Self {
        Self {
            width: footprint.width,
            height: footprint.height,
            ..Self::new(file_path, extent, label_count)
        }
    }
}

impl TableRow for ImageRecord {
    const COLUMNS: &'static [Column] = &[
        col("file_path", ColumnKind::Text),
        col("label_count", ColumnKind::Integer),
        col("width", ColumnKind::Float),
        col("height", ColumnKind::Float),
        col("geom", ColumnKind::Geometry),
    ];

    fn values(&self) -> Vec<SqlValue<'_>> {
        vec![
            SqlValue::Text(Some(&self.file_path)),
            SqlValue::Integer(i64::from(self.label_count)),
            SqlValue::Float(Some(self.width)),
            SqlValue::Float(Some(self.height)),
            SqlValue::Geometry(&self.geom),
        ]
    }

    fn validate(&self) -> Result<(), RecordError> {
        if self.file_path.is_empty() {
            return Err(RecordError::EmptyFilePath);
        }
        check_finite("width", self.width)?;
        check_finite("height", self.height)?;
        check_extent(&self.extent)
    }

    fn file_path(&self) -> &str {
        &self.file_path
    }
}

/// One row per label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelRecord {
    pub file_path: String,
    pub label_type: LabelEncoding,
    pub confidence: Option<f64>,
    pub latitude: f64,
    pub longitude: f64,
    pub point_geom: String,
    pub geom: String,
    pub legal_parcel_id: Option<String>,
    pub gnaf_pid: Option<String>,
    pub address: Option<String>,
    pub extent: GeoExtent,
}

impl LabelRecord {
    pub fn new(
        file_path: impl Into<String>,
        label_type: LabelEncoding,
        confidence: Option<f64>,
        geo: &GeoLabel,
    ) -> Self {
        Self {
            file_path: file_path.into(),
            label_type,
            confidence,
            latitude: geo.centroid.latitude,
            longitude: geo.centroid.longitude,
            point_geom: geo.point_wkt(),
            geom: geo.polygon_wkt(),
            legal_parcel_id: None,
            gnaf_pid: None,
            address: None,
            extent: geo.extent,
        }
    }

    /// Fills the reference columns. A miss leaves them null.
    pub fn with_reference(mut self, reference: Option<ReferenceMatch>) -> Self {
        if let Some(m) = reference {
            self.legal_parcel_id = m.parcel_id;
            self.gnaf_pid = m.address_id;
            self.address = m.address_text;
        }
        self
    }
}

impl TableRow for LabelRecord {
    const COLUMNS: &'static [Column] = &[
        col("file_path", ColumnKind::Text),
        col("label_type", ColumnKind::Text),
        nullable("confidence", ColumnKind::Float),
        col("latitude", ColumnKind::Float),
        col("longitude", ColumnKind::Float),
        col("point_geom", ColumnKind::Geometry),
        col("geom", ColumnKind::Geometry),
        nullable("legal_parcel_id", ColumnKind::Text),
        nullable("gnaf_pid", ColumnKind::Text),
        nullable("address", ColumnKind::Text),
    ];

    fn values(&self) -> Vec<SqlValue<'_>> {
        vec![
            SqlValue::Text(Some(&self.file_path)),
            SqlValue::Text(Some(self.label_type.as_str())),
            SqlValue::Float(self.confidence),
            SqlValue::Float(Some(self.latitude)),
            SqlValue::Float(Some(self.longitude)),
            SqlValue::Geometry(&self.point_geom),
            SqlValue::Geometry(&self.geom),
            SqlValue::Text(self.legal_parcel_id.as_deref()),
            SqlValue::Text(self.gnaf_pid.as_deref()),
            SqlValue::Text(self.address.as_deref()),
        ]
    }

    fn validate(&self) -> Result<(), RecordError> {
        if self.file_path.is_empty() {
            return Err(RecordError::EmptyFilePath);
        }
        if let Some(c) = self.confidence {
            if !(0.0..=1.0).contains(&c) {
                return Err(RecordError::Confidence(c));
            }
        }
        check_finite("latitude", self.latitude)?;
        check_finite("longitude", self.longitude)?;
        check_extent(&self.extent)?;

        let inside = self.longitude >= self.extent.x_min
            && self.longitude <= self.extent.x_max
            && self.latitude >= self.extent.y_min
            && self.latitude <= self.extent.y_max;
        if !inside {
            return Err(RecordError::CentroidOutside {
                longitude: self.longitude,
                latitude: self.latitude,
            });
        }
        Ok(())
    }

    fn file_path(&self) -> &str {
        &self.file_path
    }
}

/// Checks that a row's values line up with its column list: same length,
/// matching kinds, and nulls only where allowed.
pub fn check_columns<R: TableRow>(row: &R) -> Result<(), RecordError> {
    let values = row.values();
    if values.len() != R::COLUMNS.len() {
        return Err(RecordError::ColumnMismatch {
            expected: R::COLUMNS.len(),
            got: values.len(),
        });
    }
    for (column, value) in R::COLUMNS.iter().zip(&values) {
        let ok = match (column.kind, value) {
            (ColumnKind::Text, SqlValue::Text(v)) => v.is_some() || column.nullable,
            (ColumnKind::Float, SqlValue::Float(v)) => v.is_some() || column.nullable,
            (ColumnKind::Integer, SqlValue::Integer(_)) => true,
            (ColumnKind::Geometry, SqlValue::Geometry(_)) => true,
            _ => false,
        };
        if !ok {
            return Err(RecordError::ColumnMismatch {
                expected: R::COLUMNS.len(),
                got: values.len(),
            });
        }
    }
    Ok(())
}

//! Label encodings and their conversion to fractional tile offsets.
//!
//! Two line formats exist and the caller always names which one it holds:
//!
//! - training (YOLO label files): `class x_centre y_centre width height`,
//!   every value a fraction of the image size, origin top-left.
//! - inference (detector output): `left top right bottom confidence class`,
//!   box corners in absolute pixels.

use crate::extent::PixelSize;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LabelError {
    #[error("{encoding} label needs {expected} fields, found {found}")]
    FieldCount {
        encoding: LabelEncoding,
        expected: usize,
        found: usize,
    },
    #[error("field {index} ({field:?}) is not a number")]
    NotNumeric { index: usize, field: String },
    #[error("field {index} is not finite")]
    NonFinite { index: usize },
    #[error("class id {0} is not a non-negative integer")]
    ClassId(f64),
    #[error("confidence {0} is outside [0, 1]")]
    Confidence(f64),
    #[error("line {line}: {source}")]
    Line {
        line: usize,
        #[source]
        source: Box<LabelError>,
    },
}

/// Which of the two line formats a label is written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelEncoding {
    Training,
    Inference,
}

impl LabelEncoding {
    pub const fn field_count(self) -> usize {
        match self {
            LabelEncoding::Training => 5,
            LabelEncoding::Inference => 6,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            LabelEncoding::Training => "training",
            LabelEncoding::Inference => "inference",
        }
    }
}

impl std::fmt::Display for LabelEncoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A hand-drawn training box, centre and size as fractions of the image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainingLabel {
    pub class_id: u32,
    pub x_centre: f64,
    pub y_centre: f64,
    pub width: f64,
    pub height: f64,
}

/// One detector output box in pixel space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub left: f64,
    pub top: f64,
    pub right: f64,
    pub bottom: f64,
    pub confidence: f64,
    pub class_id: u32,
}

impl Detection {
    /// Builds a detection from a `[left, top, right, bottom, confidence, class]` row.
    pub fn from_row(row: [f64; 6]) -> Result<Self, LabelError> {
        for (index, value) in row.iter().enumerate() {
            if !value.is_finite() {
                return Err(LabelError::NonFinite { index });
            }
        }
        let confidence = row[4];
        if !(0.0..=1.0).contains(&confidence) {
            return Err(LabelError::Confidence(confidence));
        }
        Ok(Self {
            left: row[0],
            top: row[1],
            right: row[2],
            bottom: row[3],
            confidence,
            class_id: class_id(row[5])?,
        })
    }
}

/// A parsed label in either encoding.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "encoding", rename_all = "snake_case")]
pub enum RawLabel {
    Training(TrainingLabel),
    Inference(Detection),
}

/// Box edges as fractions of the image, measured from its top-left corner.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FractionalBox {
    pub left: f64,
    pub top: f64,
    pub right: f64,
    pub bottom: f64,
}

impl FractionalBox {
    /// Orders the edges so that `left <= right` and `top <= bottom`.
    pub fn normalized(self) -> Self {
        Self {
            left: self.left.min(self.right),
            top: self.top.min(self.bottom),
            right: self.left.max(self.right),
            bottom: self.top.max(self.bottom),
        }
    }
}

fn class_id(value: f64) -> Result<u32, LabelError> {
    if value < 0.0 || value.fract() != 0.0 || value > u32::MAX as f64 {
        return Err(LabelError::ClassId(value));
    }
    Ok(value as u32)
}

impl RawLabel {
    pub fn encoding(&self) -> LabelEncoding {
        match self {
            RawLabel::Training(_) => LabelEncoding::Training,
            RawLabel::Inference(_) => LabelEncoding::Inference,
        }
    }

    /// Parses one whitespace separated line in the given encoding.
    pub fn parse(line: &str, encoding: LabelEncoding) -> Result<Self, LabelError> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let expected = encoding.field_count();
        if fields.len() != expected {
            return Err(LabelError::FieldCount {
                encoding,
                expected,
                found: fields.len(),
            });
        }

        let mut values = [0.0f64; 6];
        for (index, field) in fields.iter().enumerate() {
            let value: f64 = field.parse().map_err(|_| LabelError::NotNumeric {
                index,
                field: field.to_string(),
            })?;
            if !value.is_finite() {
                return Err(LabelError::NonFinite { index });
            }
            values[index] = value;
        }

        match encoding {
            LabelEncoding::Training => Ok(RawLabel::Training(TrainingLabel {
                class_id: class_id(values[0])?,
                x_centre: values[1],
                y_centre: values[2],
                width: values[3],
                height: values[4],
            })),
            LabelEncoding::Inference => Detection::from_row(values).map(RawLabel::Inference),
        }
    }

    /// Detector confidence; training labels carry none.
    pub fn confidence(&self) -> Option<f64> {
        match self {
            RawLabel::Training(_) => None,
            RawLabel::Inference(d) => Some(d.confidence),
        }
    }

    pub fn class_id(&self) -> u32 {
        match self {
            RawLabel::Training(t) => t.class_id,
            RawLabel::Inference(d) => d.class_id,
        }
    }

    /// Box edges as fractions of an image of `pixel_size`. Training labels
    /// are already fractional and ignore the pixel size.
    pub fn fractional(&self, pixel_size: PixelSize) -> FractionalBox {
        let frac = match self {
            RawLabel::Training(t) => FractionalBox {
                left: t.x_centre - t.width / 2.0,
                top: t.y_centre - t.height / 2.0,
                right: t.x_centre + t.width / 2.0,
                bottom: t.y_centre + t.height / 2.0,
            },
            RawLabel::Inference(d) => {
                let w = pixel_size.width as f64;
                let h = pixel_size.height as f64;
                FractionalBox {
                    left: d.left / w,
                    top: d.top / h,
                    right: d.right / w,
                    bottom: d.bottom / h,
                }
            }
        };
        frac.normalized()
    }
}

/// Parses a label file body, skipping blank lines. Errors carry the 1-based
/// line number.
pub fn parse_lines(text: &str, encoding: LabelEncoding) -> Result<Vec<RawLabel>, LabelError> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            RawLabel::parse(line, encoding).map_err(|e| LabelError::Line {
                line: i + 1,
                source: Box::new(e),
            })
        })
        .collect()
}

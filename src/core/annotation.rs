// Caller-supplied annotation: lenient wire request, strict validated form

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::errors::DispatchError;

/// Content type of a user-confirmed region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnnotationKind {
    Text,
    Table,
    Diagram,
}

impl AnnotationKind {
    /// Case-insensitive parse of the wire `type` field
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "text" => Some(Self::Text),
            "table" => Some(Self::Table),
            "diagram" => Some(Self::Diagram),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Table => "table",
            Self::Diagram => "diagram",
        }
    }
}

impl std::fmt::Display for AnnotationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Right-angle rotation, in degrees counter-clockwise
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    /// Accepts any multiple of 90, normalized into [0, 360)
    pub fn from_degrees(degrees: i64) -> Option<Self> {
        match degrees.rem_euclid(360) {
            0 => Some(Self::Deg0),
            90 => Some(Self::Deg90),
            180 => Some(Self::Deg180),
            270 => Some(Self::Deg270),
            _ => None,
        }
    }

    pub fn degrees(self) -> u16 {
        match self {
            Self::Deg0 => 0,
            Self::Deg90 => 90,
            Self::Deg180 => 180,
            Self::Deg270 => 270,
        }
    }

    /// `(360 - r) mod 360`
    pub fn inverse(self) -> Self {
        match self {
            Self::Deg0 => Self::Deg0,
            Self::Deg90 => Self::Deg270,
            Self::Deg180 => Self::Deg180,
            Self::Deg270 => Self::Deg90,
        }
    }

    /// True when width and height trade places
    pub fn swaps_axes(self) -> bool {
        matches!(self, Self::Deg90 | Self::Deg270)
    }
}

/// Annotation body exactly as posted. Unknown fields are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnnotationRequest {
    #[serde(default)]
    pub id: Value,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub bbox: Option<Vec<f64>>,
    #[serde(default, alias = "imageData")]
    pub image_data: Option<String>,
    #[serde(default)]
    pub rotation: Option<f64>,
}

impl AnnotationRequest {
    /// Parse a raw JSON body; shape errors become `InvalidRequest`
    pub fn from_value(value: Value) -> Result<Self, (Value, DispatchError)> {
        let id = value.get("id").cloned().unwrap_or(Value::Null);
        serde_json::from_value(value).map_err(|e| (id, DispatchError::InvalidRequest(e.to_string())))
    }
}

/// Validated annotation. Built once at the boundary, trusted downstream.
#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    pub id: Value,
    pub kind: AnnotationKind,
    /// Region on the source page; absent when the client only sent pixels
    pub bbox: Option<[f64; 4]>,
    pub image_data: String,
    pub rotation: Rotation,
}

impl Annotation {
    /// The declared bbox, or `[0, 0, width, height]` of the decoded image
    pub fn bbox_or_image(&self, width: u32, height: u32) -> [f64; 4] {
        self.bbox
            .unwrap_or([0.0, 0.0, f64::from(width), f64::from(height)])
    }
}

/// Corners of an xyxy box, clockwise from top-left
pub fn bbox_polygon(bbox: [f64; 4]) -> Vec<[f64; 2]> {
    let [x1, y1, x2, y2] = bbox;
    vec![[x1, y1], [x2, y1], [x2, y2], [x1, y2]]
}

impl TryFrom<AnnotationRequest> for Annotation {
    type Error = DispatchError;

    fn try_from(request: AnnotationRequest) -> Result<Self, Self::Error> {
        let raw_kind = request.kind.unwrap_or_default();
        let kind = AnnotationKind::parse(&raw_kind)
            .ok_or(DispatchError::UnsupportedType(raw_kind))?;

        let bbox = match request.bbox.as_deref() {
            Some(&[x1, y1, x2, y2]) if [x1, y1, x2, y2].iter().all(|v| v.is_finite()) => {
                Some([x1, y1, x2, y2])
            }
            Some(other) => {
                return Err(DispatchError::InvalidRequest(format!(
                    "bbox must hold 4 finite numbers, got {:?}",
                    other
                )))
            }
            None => None,
        };

        let image_data = request
            .image_data
            .filter(|data| !data.trim().is_empty())
            .ok_or_else(|| DispatchError::InvalidRequest("image_data is required".to_string()))?;

        let rotation = match request.rotation {
            None => Rotation::Deg0,
            Some(degrees) if degrees.fract() == 0.0 && degrees.is_finite() => {
                Rotation::from_degrees(degrees as i64).ok_or_else(|| {
                    DispatchError::InvalidRequest(format!(
                        "rotation must be a multiple of 90, got {}",
                        degrees
                    ))
                })?
            }
            Some(degrees) => {
                return Err(DispatchError::InvalidRequest(format!(
                    "rotation must be a multiple of 90, got {}",
                    degrees
                )))
            }
        };

        Ok(Self {
            id: request.id,
            kind,
            bbox,
            image_data,
            rotation,
        })
    }
}

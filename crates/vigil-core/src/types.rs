use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Raw face detection from a model.
///
/// Coordinates are whatever the model reports: pixels for SCRFD, but other
/// models may report values normalized to [0, 1].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl BoundingBox {
    /// Intersection-over-Union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let inter_w = ((self.x + self.width).min(other.x + other.width) - self.x.max(other.x)).max(0.0);
        let inter_h = ((self.y + self.height).min(other.y + other.height) - self.y.max(other.y)).max(0.0);
        let inter = inter_w * inter_h;
        let union = self.width * self.height + other.width * other.height - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }
}

/// Axis-aligned face rectangle in frame-pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectionBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl DetectionBox {
    /// Build a box, clamping negative extents to zero.
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width: width.max(0.0),
            height: height.max(0.0),
        }
    }

    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    /// Fractional position of each side within a `frame_width` × `frame_height` frame.
    pub fn fractional_sides(&self, frame_width: u32, frame_height: u32) -> Option<FractionalSides> {
        if frame_width == 0 || frame_height == 0 {
            return None;
        }
        let w = frame_width as f32;
        let h = frame_height as f32;
        Some(FractionalSides {
            left: self.x / w,
            top: self.y / h,
            right: (self.x + self.width) / w,
            bottom: (self.y + self.height) / h,
        })
    }
}

/// Box sides as fractions of frame width/height.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FractionalSides {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

/// Detections for one cycle, largest face first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectionSnapshot {
    boxes: Vec<DetectionBox>,
}

impl DetectionSnapshot {
    /// Sort boxes by descending area. The sort is stable, so equal areas keep
    /// the order the adapter returned them in.
    pub fn from_boxes(mut boxes: Vec<DetectionBox>) -> Self {
        boxes.sort_by(|a, b| {
            b.area()
                .partial_cmp(&a.area())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Self { boxes }
    }

    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }

    /// The largest-area face, treated as the monitored subject.
    pub fn primary(&self) -> Option<&DetectionBox> {
        self.boxes.first()
    }

    pub fn boxes(&self) -> &[DetectionBox] {
        &self.boxes
    }
}

/// Warning categories, declared in display priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagType {
    MultipleFaces,
    NoFace,
    FaceNearEdge,
}

impl FlagType {
    /// All flag types, highest priority first.
    pub const PRIORITY: [FlagType; 3] = [
        FlagType::MultipleFaces,
        FlagType::NoFace,
        FlagType::FaceNearEdge,
    ];

    pub fn message(self) -> &'static str {
        match self {
            FlagType::MultipleFaces => "Multiple faces detected in frame",
            FlagType::NoFace => "No face detected",
            FlagType::FaceNearEdge => "Face is near the edge of the frame",
        }
    }
}

/// An active warning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flag {
    #[serde(rename = "type")]
    pub flag_type: FlagType,
    pub message: String,
    /// When the underlying condition first became continuously true.
    pub since: DateTime<Utc>,
}

impl Flag {
    pub fn new(flag_type: FlagType, since: DateTime<Utc>) -> Self {
        Self {
            flag_type,
            message: flag_type.message().to_string(),
            since,
        }
    }
}

/// Which backend produced the active detection adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorSource {
    Native,
    Fallback,
}

impl std::fmt::Display for DetectorSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DetectorSource::Native => f.write_str("native"),
            DetectorSource::Fallback => f.write_str("fallback"),
        }
    }
}

/// Monitoring status published to display clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorState {
    pub flags: Vec<Flag>,
    pub error: Option<String>,
    pub is_monitoring: bool,
    pub detector_available: bool,
    pub detector_source: Option<DetectorSource>,
}

impl Default for MonitorState {
    fn default() -> Self {
        Self {
            flags: Vec::new(),
            error: None,
            is_monitoring: false,
            detector_available: true,
            detector_source: None,
        }
    }
}

impl MonitorState {
    /// Flag types currently published, in priority order.
    pub fn flag_types(&self) -> Vec<FlagType> {
        self.flags.iter().map(|f| f.flag_type).collect()
    }
}

//! Page boxes and orientation

use log::debug;
use serde::{Deserialize, Serialize};

/// Rectangle in PostScript points
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub left: f64,
    pub bottom: f64,
    pub right: f64,
    pub top: f64,
}

impl Rect {
    #[must_use]
    pub const fn new(left: f64, bottom: f64, right: f64, top: f64) -> Self {
        Self {
            left,
            bottom,
            right,
            top,
        }
    }

    #[must_use]
    pub fn width(&self) -> f64 {
        (self.right - self.left).abs()
    }

    #[must_use]
    pub fn height(&self) -> f64 {
        (self.top - self.bottom).abs()
    }

    /// Parses four numbers separated by whitespace, optionally wrapped in
    /// `[ ]` as the interpreter prints arrays
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        let inner = text
            .trim()
            .trim_start_matches('[')
            .trim_end_matches(']');
        let values = inner
            .split_whitespace()
            .map(str::parse::<f64>)
            .collect::<Result<Vec<_>, _>>();
        match values.as_deref() {
            Ok(&[left, bottom, right, top]) => Some(Self::new(left, bottom, right, top)),
            Ok(other) => {
                debug!("Expected 4 box values, got {} in {text:?}", other.len());
                None
            }
            Err(e) => {
                debug!("Unparseable box {text:?}: {e}");
                None
            }
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum Orientation {
    #[default]
    Portrait = 0,
    Seascape = 1,
    UpsideDown = 2,
    Landscape = 3,
}

impl Orientation {
    /// Maps a PDF `/Rotate` value (degrees, any multiple of 90)
    #[must_use]
    pub fn from_rotate(degrees: i32) -> Self {
        match degrees.rem_euclid(360) {
            90 => Self::Landscape,
            180 => Self::UpsideDown,
            270 => Self::Seascape,
            _ => Self::Portrait,
        }
    }

    /// Value for the `/Orientation` page device parameter
    #[must_use]
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Boxes declared for the page currently being shown
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PageGeometry {
    pub media: Option<Rect>,
    pub crop: Option<Rect>,
    pub bbox: Option<Rect>,
    pub orientation: Orientation,
}

impl PageGeometry {
    /// Box that defines the rendered page size. An EPS with clipping on
    /// uses its bounding box; everything else prefers crop over media.
    #[must_use]
    pub fn size_box(&self, clip_to_bbox: bool) -> Option<Rect> {
        if clip_to_bbox {
            if let Some(bbox) = self.bbox {
                return Some(bbox);
            }
        }
        self.crop.or(self.media)
    }

    /// Box whose origin is moved to the device origin
    #[must_use]
    pub fn offset_box(&self) -> Option<Rect> {
        self.crop.or(self.media).or(self.bbox)
    }
}

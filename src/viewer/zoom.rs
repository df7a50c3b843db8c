//! Rendering resolution and its zoom bounds

use serde::{Deserialize, Serialize};

/// Device resolution in dots per inch along each axis
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zoom {
    pub x_dpi: i32,
    pub y_dpi: i32,
}

impl Default for Zoom {
    fn default() -> Self {
        Self::uniform(Self::DEFAULT_DPI)
    }
}

impl Zoom {
    pub const DEFAULT_DPI: i32 = 96;
    /// Lowest horizontal resolution a zoom may reach
    pub const MIN_DPI: i32 = 39;
    /// Highest horizontal resolution a zoom may reach
    pub const MAX_DPI: i32 = 496;
    /// Zoom in step, 120%
    pub const ZOOM_IN_RATE: f32 = 1.2;
    /// Zoom out step, the inverse of zooming in
    pub const ZOOM_OUT_RATE: f32 = 0.833_333_3;

    #[must_use]
    pub const fn uniform(dpi: i32) -> Self {
        Self {
            x_dpi: dpi,
            y_dpi: dpi,
        }
    }

    /// Resolution after scaling by `scale`, or `None` when the horizontal
    /// value leaves `[MIN_DPI, MAX_DPI]`
    #[must_use]
    pub fn scaled(self, scale: f32) -> Option<Self> {
        let x_dpi = (self.x_dpi as f32 * scale + 0.5) as i32;
        let y_dpi = (self.y_dpi as f32 * scale + 0.5) as i32;
        (Self::MIN_DPI..=Self::MAX_DPI)
            .contains(&x_dpi)
            .then_some(Self { x_dpi, y_dpi })
    }

    /// Applies `scale` unless it is out of range or `test_only` is set.
    /// Returns whether the zoom is possible.
    pub fn apply(&mut self, scale: f32, test_only: bool) -> bool {
        match self.scaled(scale) {
            Some(next) => {
                if !test_only {
                    *self = next;
                }
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn can_zoom_in(&self) -> bool {
        self.scaled(Self::ZOOM_IN_RATE).is_some()
    }

    #[must_use]
    pub fn can_zoom_out(&self) -> bool {
        self.scaled(Self::ZOOM_OUT_RATE).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zoom_in_rounds_to_nearest() {
        let mut zoom = Zoom::default();
        assert!(zoom.apply(Zoom::ZOOM_IN_RATE, false));
        // 96 * 1.2 = 115.2
        assert_eq!(zoom, Zoom::uniform(115));
    }

    #[test]
    fn test_only_never_mutates() {
        let mut zoom = Zoom::uniform(420);
        assert!(!zoom.apply(Zoom::ZOOM_IN_RATE, true));
        assert!(!zoom.apply(Zoom::ZOOM_IN_RATE, false));
        assert_eq!(zoom, Zoom::uniform(420));

        let mut zoom = Zoom::default();
        assert!(zoom.apply(2.0, true));
        assert_eq!(zoom, Zoom::default());
    }

    #[test]
    fn bounds_are_inclusive() {
        assert!(Zoom::uniform(39).scaled(1.0).is_some());
        assert!(Zoom::uniform(496).scaled(1.0).is_some());
        assert!(Zoom::uniform(38).scaled(1.0).is_none());
        assert!(Zoom::uniform(497).scaled(1.0).is_none());
    }

    #[test]
    fn repeated_zoom_out_stops_at_minimum() {
        let mut zoom = Zoom::default();
        while zoom.can_zoom_out() {
            assert!(zoom.apply(Zoom::ZOOM_OUT_RATE, false));
        }
        assert!(zoom.x_dpi >= Zoom::MIN_DPI);
        assert!(!zoom.apply(Zoom::ZOOM_OUT_RATE, false));
    }
}

//! Snapshot of the view a host can store and restore later

use serde::{Deserialize, Serialize};

use super::zoom::Zoom;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewerState {
    pub x_dpi: i32,
    pub y_dpi: i32,
    pub current_page: u32,
    pub progressive_update: bool,
}

impl ViewerState {
    #[must_use]
    pub fn zoom(&self) -> Zoom {
        Zoom {
            x_dpi: self.x_dpi,
            y_dpi: self.y_dpi,
        }
    }
}

//! Display device callbacks surfaced as typed events

/// Bits of the `-dDisplayFormat` value
pub mod format {
    pub const COLORS_NATIVE: u32 = 1 << 0;
    pub const COLORS_GRAY: u32 = 1 << 1;
    pub const COLORS_RGB: u32 = 1 << 2;
    pub const COLORS_CMYK: u32 = 1 << 3;
    pub const COLORS_MASK: u32 = 0x0000_000f;

    pub const ALPHA_NONE: u32 = 0;
    pub const ALPHA_MASK: u32 = 0x0000_00f0;

    pub const DEPTH_1: u32 = 1 << 8;
    pub const DEPTH_8: u32 = 1 << 11;
    pub const DEPTH_MASK: u32 = 0x0000_ff00;

    pub const BIGENDIAN: u32 = 0;
    pub const LITTLEENDIAN: u32 = 1 << 16;
    pub const ENDIAN_MASK: u32 = 0x0001_0000;

    pub const TOPFIRST: u32 = 0;
    pub const BOTTOMFIRST: u32 = 1 << 17;
    pub const FIRSTROW_MASK: u32 = 0x0002_0000;

    /// 24-bit BGR, rows stored bottom first
    pub const VIEWER: u32 = COLORS_RGB | ALPHA_NONE | DEPTH_8 | LITTLEENDIAN | BOTTOMFIRST;
}

/// Raster the display device is drawing into
#[derive(Clone, Copy, Debug)]
pub struct Frame<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
    /// Bytes per row, including padding
    pub raster: u32,
    pub format: u32,
}

impl Frame<'_> {
    #[must_use]
    pub fn bottom_first(&self) -> bool {
        self.format & format::FIRSTROW_MASK == format::BOTTOMFIRST
    }

    /// Row `y` counted from the top of the page
    #[must_use]
    pub fn row(&self, y: u32) -> Option<&[u8]> {
        if y >= self.height {
            return None;
        }
        let stored = if self.bottom_first() {
            self.height - 1 - y
        } else {
            y
        };
        let start = stored as usize * self.raster as usize;
        self.data.get(start..start + self.raster as usize)
    }
}

#[derive(Clone, Copy, Debug)]
pub enum DisplayEvent<'a> {
    /// Device allocated a new raster
    Size {
        width: u32,
        height: u32,
        raster: u32,
        format: u32,
    },
    /// Part of the page was drawn
    Update {
        frame: Frame<'a>,
        x: i32,
        y: i32,
        width: i32,
        height: i32,
    },
    /// `showpage` completed
    Page {
        frame: Frame<'a>,
        copies: i32,
        flush: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn viewer_format_value() {
        assert_eq!(format::VIEWER, 0x30804);
    }

    #[test]
    fn rows_are_addressed_from_the_top() {
        // two rows of 4 bytes, bottom row stored first
        let data = [1, 1, 1, 0, 2, 2, 2, 0];
        let frame = Frame {
            data: &data,
            width: 1,
            height: 2,
            raster: 4,
            format: format::VIEWER,
        };
        assert_eq!(frame.row(0), Some(&data[4..8]));
        assert_eq!(frame.row(1), Some(&data[0..4]));
        assert_eq!(frame.row(2), None);

        let top_first = Frame {
            format: format::COLORS_RGB | format::DEPTH_8,
            ..frame
        };
        assert_eq!(top_first.row(0), Some(&data[0..4]));
    }
}

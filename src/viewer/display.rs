//! Copies rendered rasters into host-provided surfaces

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::bridge::DisplaySink;
use crate::engine::display::format;
use crate::engine::{DisplayEvent, Frame};
use crate::events::Observers;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ViewerEvent {
    /// The device allocated a page raster of this size
    DisplaySize { width: u32, height: u32 },
    /// A progressive redraw copied this region into the surface
    DisplayUpdate {
        x: i32,
        y: i32,
        width: i32,
        height: i32,
    },
    /// A full page is in the surface
    DisplayPage { width: u32, height: u32 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    Bgr24,
    Rgb24,
    Gray8,
    /// Raw display format bits with no named layout
    Other(u32),
}

impl PixelFormat {
    #[must_use]
    pub fn from_display_format(bits: u32) -> Self {
        let colors = bits & format::COLORS_MASK;
        let alpha = bits & format::ALPHA_MASK;
        let depth = bits & format::DEPTH_MASK;
        let little = bits & format::ENDIAN_MASK == format::LITTLEENDIAN;
        match (colors, alpha, depth) {
            (format::COLORS_RGB, format::ALPHA_NONE, format::DEPTH_8) if little => Self::Bgr24,
            (format::COLORS_RGB, format::ALPHA_NONE, format::DEPTH_8) => Self::Rgb24,
            (format::COLORS_GRAY, format::ALPHA_NONE, format::DEPTH_8) => Self::Gray8,
            _ => Self::Other(bits),
        }
    }

    #[must_use]
    pub fn bytes_per_pixel(self) -> Option<u32> {
        match self {
            Self::Bgr24 | Self::Rgb24 => Some(3),
            Self::Gray8 => Some(1),
            Self::Other(_) => None,
        }
    }
}

/// Writable pixel buffer, rows stored top first
pub trait Surface: Send {
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    /// Bytes per row
    fn stride(&self) -> usize;
    fn format(&self) -> PixelFormat;
    fn data(&self) -> &[u8];
    fn data_mut(&mut self) -> &mut [u8];
}

pub trait SurfaceProvider: Send + Sync {
    fn allocate_surface(
        &self,
        width: u32,
        height: u32,
        stride: usize,
        format: PixelFormat,
    ) -> Box<dyn Surface>;
}

#[derive(Debug)]
pub struct MemorySurface {
    width: u32,
    height: u32,
    stride: usize,
    format: PixelFormat,
    data: Vec<u8>,
}

impl MemorySurface {
    #[must_use]
    pub fn new(width: u32, height: u32, stride: usize, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            stride,
            format,
            data: vec![0; stride * height as usize],
        }
    }
}

impl Surface for MemorySurface {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn stride(&self) -> usize {
        self.stride
    }

    fn format(&self) -> PixelFormat {
        self.format
    }

    fn data(&self) -> &[u8] {
        &self.data
    }

    fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct MemorySurfaceProvider;

impl SurfaceProvider for MemorySurfaceProvider {
    fn allocate_surface(
        &self,
        width: u32,
        height: u32,
        stride: usize,
        format: PixelFormat,
    ) -> Box<dyn Surface> {
        Box::new(MemorySurface::new(width, height, stride, format))
    }
}

/// Display sink for one open document
pub struct ViewerDisplay {
    provider: Arc<dyn SurfaceProvider>,
    surface: Mutex<Option<Box<dyn Surface>>>,
    events: Arc<Observers<ViewerEvent>>,
    progressive: AtomicBool,
    interval: Duration,
    last_update: Mutex<Option<Instant>>,
}

impl ViewerDisplay {
    pub fn new(
        provider: Arc<dyn SurfaceProvider>,
        events: Arc<Observers<ViewerEvent>>,
        progressive: bool,
        interval: Duration,
    ) -> Self {
        Self {
            provider,
            surface: Mutex::new(None),
            events,
            progressive: AtomicBool::new(progressive),
            interval,
            last_update: Mutex::new(None),
        }
    }

    pub fn set_progressive(&self, enabled: bool) {
        self.progressive.store(enabled, Ordering::Release);
    }

    pub fn with_surface<R>(&self, f: impl FnOnce(&dyn Surface) -> R) -> Option<R> {
        let surface = self.surface.lock().unwrap_or_else(PoisonError::into_inner);
        surface.as_deref().map(|s| f(s))
    }

    fn allocate(&self, width: u32, height: u32, raster: u32, bits: u32) {
        let pixel_format = PixelFormat::from_display_format(bits);
        let stride = pixel_format
            .bytes_per_pixel()
            .map_or(raster as usize, |bpp| (width * bpp) as usize);
        debug!("Allocating {width}x{height} surface, stride {stride}, {pixel_format:?}");
        let surface = self
            .provider
            .allocate_surface(width, height, stride, pixel_format);
        *self.surface.lock().unwrap_or_else(PoisonError::into_inner) = Some(surface);
    }

    fn copy_frame(&self, frame: &Frame<'_>) {
        let mut guard = self.surface.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(surface) = guard.as_mut() else {
            warn!("Frame arrived before a surface was allocated");
            return;
        };
        let stride = surface.stride();
        let rows = frame.height.min(surface.height());
        let data = surface.data_mut();
        for y in 0..rows {
            let Some(src) = frame.row(y) else { break };
            let start = y as usize * stride;
            let Some(dst) = data.get_mut(start..start + stride) else {
                break;
            };
            let len = src.len().min(stride);
            dst[..len].copy_from_slice(&src[..len]);
        }
    }

    fn update_due(&self) -> bool {
        if !self.progressive.load(Ordering::Acquire) {
            return false;
        }
        let mut last = self
            .last_update
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        match *last {
            Some(at) if now.duration_since(at) < self.interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

impl DisplaySink for ViewerDisplay {
    fn on_display(&self, event: &DisplayEvent<'_>) -> i32 {
        match *event {
            DisplayEvent::Size {
                width,
                height,
                raster,
                format,
            } => {
                self.allocate(width, height, raster, format);
                *self
                    .last_update
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = None;
                self.events
                    .emit(&ViewerEvent::DisplaySize { width, height });
            }
            DisplayEvent::Update {
                frame,
                x,
                y,
                width,
                height,
            } => {
                if self.update_due() {
                    self.copy_frame(&frame);
                    self.events.emit(&ViewerEvent::DisplayUpdate {
                        x,
                        y,
                        width,
                        height,
                    });
                }
            }
            DisplayEvent::Page { frame, .. } => {
                self.copy_frame(&frame);
                self.events.emit(&ViewerEvent::DisplayPage {
                    width: frame.width,
                    height: frame.height,
                });
            }
        }
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink(progressive: bool, interval: Duration) -> (ViewerDisplay, flume::Receiver<ViewerEvent>) {
        let events = Arc::new(Observers::new());
        let rx = events.channel();
        let display = ViewerDisplay::new(
            Arc::new(MemorySurfaceProvider),
            events,
            progressive,
            interval,
        );
        (display, rx)
    }

    #[test]
    fn maps_display_format_bits() {
        assert_eq!(
            PixelFormat::from_display_format(format::VIEWER),
            PixelFormat::Bgr24
        );
        assert_eq!(
            PixelFormat::from_display_format(format::COLORS_RGB | format::DEPTH_8),
            PixelFormat::Rgb24
        );
        assert_eq!(
            PixelFormat::from_display_format(format::COLORS_CMYK | format::DEPTH_1),
            PixelFormat::Other(format::COLORS_CMYK | format::DEPTH_1)
        );
    }

    #[test]
    fn page_is_copied_top_first() {
        let (display, rx) = sink(false, Duration::ZERO);
        display.on_display(&DisplayEvent::Size {
            width: 1,
            height: 2,
            raster: 4,
            format: format::VIEWER,
        });
        // bottom row stored first, one padding byte per row
        let raster = [9, 9, 9, 0, 1, 2, 3, 0];
        let frame = Frame {
            data: &raster,
            width: 1,
            height: 2,
            raster: 4,
            format: format::VIEWER,
        };
        display.on_display(&DisplayEvent::Page {
            frame,
            copies: 1,
            flush: true,
        });

        let pixels = display.with_surface(|s| s.data().to_vec()).unwrap();
        assert_eq!(pixels, vec![1, 2, 3, 9, 9, 9]);
        assert_eq!(
            rx.try_iter().collect::<Vec<_>>(),
            vec![
                ViewerEvent::DisplaySize {
                    width: 1,
                    height: 2
                },
                ViewerEvent::DisplayPage {
                    width: 1,
                    height: 2
                },
            ]
        );
    }

    #[test]
    fn updates_are_ignored_when_progressive_is_off() {
        let (display, rx) = sink(false, Duration::ZERO);
        let raster = [0u8; 4];
        let frame = Frame {
            data: &raster,
            width: 1,
            height: 1,
            raster: 4,
            format: format::VIEWER,
        };
        display.on_display(&DisplayEvent::Update {
            frame,
            x: 0,
            y: 0,
            width: 1,
            height: 1,
        });
        assert!(rx.try_iter().next().is_none());
    }

    #[test]
    fn updates_are_throttled() {
        let (display, rx) = sink(true, Duration::from_secs(3600));
        let raster = [0u8; 4];
        let frame = Frame {
            data: &raster,
            width: 1,
            height: 1,
            raster: 4,
            format: format::VIEWER,
        };
        let update = DisplayEvent::Update {
            frame,
            x: 0,
            y: 0,
            width: 1,
            height: 1,
        };
        display.on_display(&update);
        display.on_display(&update);
        assert_eq!(rx.try_iter().count(), 1);
    }
}

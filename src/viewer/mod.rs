//! Interactive document viewer
//!
//! A [`Viewer`] keeps one document open in a long-lived [`Interpreter`]
//! and renders pages on demand through the display device. Navigation is
//! clamped to the document's page range; zoom is bounded by
//! [`Zoom::MIN_DPI`] and [`Zoom::MAX_DPI`].

pub mod display;
pub mod dsc;
pub mod format;
pub mod geometry;
pub mod state;
pub mod zoom;

use std::fmt::Write as _;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tempfile::TempPath;

pub use display::{
    MemorySurface, MemorySurfaceProvider, PixelFormat, Surface, SurfaceProvider, ViewerDisplay,
    ViewerEvent,
};
pub use format::{DocumentFormat, DocumentPages, FormatHandler};
pub use geometry::{Orientation, PageGeometry, Rect};
pub use state::ViewerState;
pub use zoom::Zoom;

use crate::bridge::DisplaySink;
use crate::engine::display::format as display_format;
use crate::engine::{Engine, EngineRef, EngineSource};
use crate::events::Observers;
use crate::interpreter::Interpreter;
use crate::settings;
use crate::stdio::StdioHandler;
use crate::{Error, Result};

/// `-dMaxBitmap` for a 4096x2160 surface at 4 bytes per pixel, plus half again
const DEFAULT_MAX_BITMAP: u64 = 4096 * 2160 * 4 * 3 / 2;
/// Revisions whose band allocator needs a much larger bitmap ceiling
const LARGE_BITMAP_REVISIONS: std::ops::RangeInclusive<u32> = 911..=921;

#[derive(Clone, Debug, PartialEq)]
pub struct ViewerOptions {
    pub dpi: i32,
    pub graphics_alpha_bits: u8,
    pub text_alpha_bits: u8,
    pub eps_clip: bool,
    pub show_page_after_open: bool,
    pub progressive_update: bool,
    pub progressive_update_interval: Duration,
    pub custom_switches: Vec<String>,
}

impl Default for ViewerOptions {
    fn default() -> Self {
        Self {
            dpi: Zoom::DEFAULT_DPI,
            graphics_alpha_bits: 4,
            text_alpha_bits: 4,
            eps_clip: true,
            show_page_after_open: true,
            progressive_update: true,
            progressive_update_interval: Duration::from_millis(100),
            custom_switches: Vec::new(),
        }
    }
}

impl ViewerOptions {
    #[must_use]
    pub fn from_settings() -> Self {
        let settings = settings::current();
        Self {
            dpi: settings.dpi,
            graphics_alpha_bits: settings.graphics_alpha_bits,
            text_alpha_bits: settings.text_alpha_bits,
            eps_clip: settings.eps_clip,
            show_page_after_open: settings.show_page_after_open,
            progressive_update: settings.progressive_update,
            progressive_update_interval: Duration::from_millis(
                settings.progressive_update_interval_ms,
            ),
            custom_switches: settings.custom_switches,
        }
    }
}

fn max_bitmap(revision: u32) -> String {
    if LARGE_BITMAP_REVISIONS.contains(&revision) {
        "1g".to_string()
    } else {
        DEFAULT_MAX_BITMAP.to_string()
    }
}

/// Switches passed to `init_with_args` when a document opens
#[must_use]
pub fn init_switches(
    revision: u32,
    display_handle: Option<usize>,
    document_dir: Option<&Path>,
    options: &ViewerOptions,
) -> Vec<String> {
    let mut args = vec![
        "ghostbridge".to_string(),
        "-dNOPAUSE".to_string(),
        "-sDEVICE=display".to_string(),
    ];
    args.push(match display_handle {
        Some(handle) => format!("-sDisplayHandle=16#{handle:x}"),
        None => "-dDisplayHandle=0".to_string(),
    });
    args.push(format!("-dDisplayFormat={}", display_format::VIEWER));
    args.push("-dInterpolateControl=1".to_string());
    args.push(format!("-dTextAlphaBits={}", options.text_alpha_bits));
    args.push(format!("-dGraphicsAlphaBits={}", options.graphics_alpha_bits));
    args.push("-dGridFitTT=2".to_string());
    if let Some(dir) = document_dir {
        args.push(format!("-I{}", dir.display()));
    }
    args.push(format!("-dMaxBitmap={}", max_bitmap(revision)));
    args.extend(options.custom_switches.iter().cloned());
    args
}

/// Adds positive zero so negated zero coordinates print as `0.00`
fn pt(value: f64) -> f64 {
    value + 0.0
}

/// Page device setup emitted before every rendered page
#[must_use]
pub fn page_setup(
    zoom: Zoom,
    geometry: &PageGeometry,
    format: DocumentFormat,
    clip_to_bbox: bool,
    graphics_alpha_bits: u8,
    text_alpha_bits: u8,
) -> String {
    let mut out = String::from("%%BeginPageSetup\n<<\n");
    let _ = writeln!(out, "/HWResolution [{} {}]", zoom.x_dpi, zoom.y_dpi);

    if let Some(size) = geometry.size_box(clip_to_bbox) {
        let (width, height) = (size.width(), size.height());
        if width > 0.0 && height > 0.0 {
            let _ = writeln!(out, "/PageSize [{width:.2} {height:.2}]");
        }
    }

    if format != DocumentFormat::Ps {
        if let Some(offset) = geometry.offset_box() {
            let (llx, lly) = (offset.left, offset.bottom);
            let (x, y) = match geometry.orientation {
                Orientation::Portrait => (-llx, -lly),
                Orientation::Landscape => (-lly, llx),
                Orientation::UpsideDown => (llx, lly),
                Orientation::Seascape => (lly, -llx),
            };
            let _ = writeln!(out, "/PageOffset [{:.2} {:.2}]", pt(x), pt(y));
        }
    }

    let _ = writeln!(out, "/GraphicsAlphaBits {graphics_alpha_bits}");
    let _ = writeln!(out, "/TextAlphaBits {text_alpha_bits}");
    let _ = writeln!(out, "/Orientation {}", geometry.orientation.code());
    out.push_str(">> setpagedevice\n%%EndPageSetup\n");
    out
}

struct OpenDocument {
    // Dropped first so the instance exits before its display sink goes away
    interpreter: Interpreter,
    handler: FormatHandler,
    display: Arc<ViewerDisplay>,
    path: PathBuf,
    /// Page last sent to the display device
    displayed: Option<u32>,
    _temp: Option<TempPath>,
}

pub struct Viewer {
    engine: EngineRef,
    options: ViewerOptions,
    zoom: Zoom,
    progressive: bool,
    stdio: Option<Arc<dyn StdioHandler>>,
    provider: Arc<dyn SurfaceProvider>,
    events: Arc<Observers<ViewerEvent>>,
    document: Option<OpenDocument>,
}

impl Viewer {
    /// Viewer over an engine the caller keeps using elsewhere
    pub fn new(engine: Arc<dyn Engine>, options: ViewerOptions) -> Self {
        Self::with_engine(EngineRef::shared(engine), options)
    }

    /// Viewer that loads and owns its engine
    pub fn load(source: &EngineSource, options: ViewerOptions) -> Result<Self> {
        Ok(Self::with_engine(EngineRef::load(source)?, options))
    }

    pub fn with_engine(engine: EngineRef, options: ViewerOptions) -> Self {
        let zoom = Zoom::uniform(options.dpi.clamp(Zoom::MIN_DPI, Zoom::MAX_DPI));
        let progressive = options.progressive_update;
        Self {
            engine,
            options,
            zoom,
            progressive,
            stdio: None,
            provider: Arc::new(MemorySurfaceProvider),
            events: Arc::new(Observers::new()),
            document: None,
        }
    }

    /// Stdio handler for documents opened after this call
    pub fn attach_stdio(&mut self, handler: Arc<dyn StdioHandler>) {
        self.stdio = Some(handler);
    }

    /// Surface provider for documents opened after this call
    pub fn set_surface_provider(&mut self, provider: Arc<dyn SurfaceProvider>) {
        self.provider = provider;
    }

    pub fn subscribe(&self, subscriber: impl Fn(&ViewerEvent) + Send + Sync + 'static) {
        self.events.subscribe(subscriber);
    }

    #[must_use]
    pub fn events(&self) -> flume::Receiver<ViewerEvent> {
        self.events.channel()
    }

    pub fn open(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let path = path
            .canonicalize()
            .map_err(|source| Error::DocumentOpenFailed {
                path: path.to_path_buf(),
                source,
            })?;
        let format = DocumentFormat::resolve(&path)?;
        self.open_document(path, format, None)
    }

    /// Copies `reader` into a temporary file, removed again on close
    pub fn open_reader(&mut self, mut reader: impl Read) -> Result<()> {
        let mut file = tempfile::Builder::new()
            .prefix("ghostbridge-")
            .tempfile()?;
        std::io::copy(&mut reader, &mut file)?;
        file.flush()?;
        let temp = file.into_temp_path();
        let path = temp.to_path_buf();
        let format = DocumentFormat::resolve(&path)?;
        self.open_document(path, format, Some(temp))
    }

    fn open_document(
        &mut self,
        path: PathBuf,
        format: DocumentFormat,
        temp: Option<TempPath>,
    ) -> Result<()> {
        self.close();

        let display = Arc::new(ViewerDisplay::new(
            Arc::clone(&self.provider),
            Arc::clone(&self.events),
            self.progressive,
            self.options.progressive_update_interval,
        ));
        let mut interpreter = Interpreter::new(
            self.engine.clone(),
            self.stdio.clone(),
            Some(Arc::clone(&display) as Arc<dyn DisplaySink>),
        )?;
        let switches = init_switches(
            interpreter.revision(),
            interpreter.display_handle(),
            path.parent(),
            &self.options,
        );
        debug!("Initializing viewer interpreter with {switches:?}");
        interpreter.init_args(&switches)?;

        let mut handler = FormatHandler::new(format, self.options.eps_clip);
        handler.initialize(&interpreter)?;
        handler.open(&interpreter, &path)?;
        let first = handler.pages().first;

        self.document = Some(OpenDocument {
            interpreter,
            handler,
            display,
            path,
            displayed: None,
            _temp: temp,
        });

        if self.options.show_page_after_open {
            self.show_page(first, true)?;
        }
        Ok(())
    }

    pub fn close(&mut self) {
        if let Some(document) = self.document.take() {
            info!("Closing {:?}", document.path);
        }
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.document.is_some()
    }

    /// Renders page `n`. Without `refresh`, asking for the page already
    /// on display does nothing; pages outside the document are ignored.
    pub fn show_page(&mut self, n: u32, refresh: bool) -> Result<()> {
        let Some(document) = self.document.as_mut() else {
            warn!("show_page({n}) with no open document");
            return Ok(());
        };
        if !document.handler.pages().contains(n) {
            debug!("Page {n} outside {:?}", document.handler.pages());
            return Ok(());
        }
        if !refresh && document.displayed == Some(n) {
            return Ok(());
        }

        document.handler.set_current(n);
        document.handler.init_page(&document.interpreter, n)?;
        let setup = page_setup(
            self.zoom,
            &document.handler.pages().geometry,
            document.handler.format(),
            document.handler.clips_to_bbox(),
            self.options.graphics_alpha_bits,
            self.options.text_alpha_bits,
        );
        document.interpreter.run(setup)?;
        document.handler.show_page(&document.interpreter, n)?;
        document.displayed = Some(n);
        debug!("Showed page {n} at {:?}", self.zoom);
        Ok(())
    }

    pub fn show_first_page(&mut self) -> Result<()> {
        match self.first_page() {
            Some(first) => self.show_page(first, false),
            None => Ok(()),
        }
    }

    pub fn show_previous_page(&mut self) -> Result<()> {
        match self.current_page() {
            Some(current) if self.can_show_previous_page() => self.show_page(current - 1, false),
            _ => Ok(()),
        }
    }

    pub fn show_next_page(&mut self) -> Result<()> {
        match self.current_page() {
            Some(current) if self.can_show_next_page() => self.show_page(current + 1, false),
            _ => Ok(()),
        }
    }

    pub fn show_last_page(&mut self) -> Result<()> {
        match self.last_page() {
            Some(last) => self.show_page(last, false),
            None => Ok(()),
        }
    }

    pub fn refresh_page(&mut self) -> Result<()> {
        match self.current_page() {
            Some(current) => self.show_page(current, true),
            None => Ok(()),
        }
    }

    fn pages(&self) -> Option<&DocumentPages> {
        self.document.as_ref().map(|d| d.handler.pages())
    }

    #[must_use]
    pub fn can_show_first_page(&self) -> bool {
        self.pages().is_some_and(|p| p.current != p.first)
    }

    #[must_use]
    pub fn can_show_previous_page(&self) -> bool {
        self.pages().is_some_and(|p| p.current > p.first)
    }

    #[must_use]
    pub fn can_show_next_page(&self) -> bool {
        self.pages().is_some_and(|p| p.current < p.last)
    }

    #[must_use]
    pub fn can_show_last_page(&self) -> bool {
        self.pages().is_some_and(|p| p.current != p.last)
    }

    #[must_use]
    pub fn is_page_number_valid(&self, n: u32) -> bool {
        self.pages().is_some_and(|p| p.contains(n))
    }

    #[must_use]
    pub fn current_page(&self) -> Option<u32> {
        self.pages().map(|p| p.current)
    }

    #[must_use]
    pub fn first_page(&self) -> Option<u32> {
        self.pages().map(|p| p.first)
    }

    #[must_use]
    pub fn last_page(&self) -> Option<u32> {
        self.pages().map(|p| p.last)
    }

    #[must_use]
    pub fn current_orientation(&self) -> Orientation {
        self.pages()
            .map_or(Orientation::Portrait, |p| p.geometry.orientation)
    }

    #[must_use]
    pub fn file_path(&self) -> Option<&Path> {
        self.document.as_ref().map(|d| d.path.as_path())
    }

    #[must_use]
    pub fn format(&self) -> Option<DocumentFormat> {
        self.document.as_ref().map(|d| d.handler.format())
    }

    /// Scales the resolution by `scale`. Returns whether the new value is
    /// in range; with `test_only` the zoom never changes.
    pub fn zoom(&mut self, scale: f32, test_only: bool) -> bool {
        self.zoom.apply(scale, test_only)
    }

    pub fn zoom_in(&mut self) -> Result<bool> {
        self.zoom_and_refresh(Zoom::ZOOM_IN_RATE)
    }

    pub fn zoom_out(&mut self) -> Result<bool> {
        self.zoom_and_refresh(Zoom::ZOOM_OUT_RATE)
    }

    fn zoom_and_refresh(&mut self, scale: f32) -> Result<bool> {
        if !self.zoom(scale, false) {
            return Ok(false);
        }
        self.refresh_page()?;
        Ok(true)
    }

    #[must_use]
    pub fn can_zoom_in(&self) -> bool {
        self.zoom.can_zoom_in()
    }

    #[must_use]
    pub fn can_zoom_out(&self) -> bool {
        self.zoom.can_zoom_out()
    }

    #[must_use]
    pub fn dpi(&self) -> Zoom {
        self.zoom
    }

    /// Takes effect on the next rendered page
    pub fn set_dpi(&mut self, dpi: i32) {
        self.zoom = Zoom::uniform(dpi.clamp(Zoom::MIN_DPI, Zoom::MAX_DPI));
    }

    #[must_use]
    pub fn progressive_update(&self) -> bool {
        self.progressive
    }

    pub fn set_progressive_update(&mut self, enabled: bool) {
        self.progressive = enabled;
        if let Some(document) = &self.document {
            document.display.set_progressive(enabled);
        }
    }

    #[must_use]
    pub fn save_state(&self) -> ViewerState {
        ViewerState {
            x_dpi: self.zoom.x_dpi,
            y_dpi: self.zoom.y_dpi,
            current_page: self.current_page().unwrap_or(1),
            progressive_update: self.progressive,
        }
    }

    /// Applies a snapshot and re-renders; the page is clamped to the
    /// open document's range
    pub fn restore_state(&mut self, state: ViewerState) -> Result<()> {
        self.zoom = state.zoom();
        self.set_progressive_update(state.progressive_update);
        let Some(pages) = self.pages().copied() else {
            return Ok(());
        };
        let page = state.current_page.clamp(pages.first, pages.last);
        self.show_page(page, true)
    }

    pub fn with_surface<R>(&self, f: impl FnOnce(&dyn Surface) -> R) -> Option<R> {
        self.document.as_ref()?.display.with_surface(f)
    }

    /// Interpreter of the open document, for custom commands
    #[must_use]
    pub fn interpreter(&self) -> Option<&Interpreter> {
        self.document.as_ref().map(|d| &d.interpreter)
    }
}

impl Drop for Viewer {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Viewer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Viewer")
            .field("engine", &self.engine)
            .field("zoom", &self.zoom)
            .field("path", &self.file_path())
            .field("current_page", &self.current_page())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[serial_test::serial]
    fn options_follow_settings() {
        settings::reset_to_defaults();
        settings::set_dpi(150);
        settings::set_eps_clip(false);
        settings::set_custom_switches(vec!["-dSAFER".to_string()]);

        let options = ViewerOptions::from_settings();
        assert_eq!(options.dpi, 150);
        assert!(!options.eps_clip);
        assert_eq!(options.custom_switches, vec!["-dSAFER".to_string()]);
        assert_eq!(options.progressive_update_interval, Duration::from_millis(100));
        settings::reset_to_defaults();
    }

    #[test]
    fn max_bitmap_override_for_affected_revisions() {
        assert_eq!(max_bitmap(911), "1g");
        assert_eq!(max_bitmap(921), "1g");
        assert_eq!(max_bitmap(910), "53084160");
        assert_eq!(max_bitmap(10021), "53084160");
    }

    #[test]
    fn init_switches_in_order() {
        let options = ViewerOptions {
            custom_switches: vec!["-dSAFER".to_string()],
            ..ViewerOptions::default()
        };
        let args = init_switches(10021, Some(0xbeef), Some(Path::new("/docs")), &options);
        assert_eq!(
            args,
            vec![
                "ghostbridge",
                "-dNOPAUSE",
                "-sDEVICE=display",
                "-sDisplayHandle=16#beef",
                "-dDisplayFormat=198660",
                "-dInterpolateControl=1",
                "-dTextAlphaBits=4",
                "-dGraphicsAlphaBits=4",
                "-dGridFitTT=2",
                "-I/docs",
                "-dMaxBitmap=53084160",
                "-dSAFER",
            ]
        );
    }

    #[test]
    fn missing_display_handle_passes_zero() {
        let args = init_switches(950, None, None, &ViewerOptions::default());
        assert!(args.contains(&"-dDisplayHandle=0".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("-I")));
    }

    #[test]
    fn page_setup_uses_crop_and_orientation() {
        let geometry = PageGeometry {
            media: Some(Rect::new(0.0, 0.0, 612.0, 792.0)),
            crop: Some(Rect::new(10.0, 20.0, 310.0, 420.0)),
            bbox: None,
            orientation: Orientation::Landscape,
        };
        let setup = page_setup(
            Zoom::uniform(115),
            &geometry,
            DocumentFormat::Pdf,
            false,
            4,
            2,
        );
        assert_eq!(
            setup,
            "%%BeginPageSetup\n<<\n\
             /HWResolution [115 115]\n\
             /PageSize [300.00 400.00]\n\
             /PageOffset [-20.00 10.00]\n\
             /GraphicsAlphaBits 4\n\
             /TextAlphaBits 2\n\
             /Orientation 3\n\
             >> setpagedevice\n%%EndPageSetup\n"
        );
    }

    #[test]
    fn page_setup_at_origin_has_no_negative_zero() {
        let geometry = PageGeometry {
            media: Some(Rect::new(0.0, 0.0, 612.0, 792.0)),
            ..PageGeometry::default()
        };
        let setup = page_setup(Zoom::default(), &geometry, DocumentFormat::Pdf, false, 4, 4);
        assert!(setup.contains("/PageOffset [0.00 0.00]"));
    }

    #[test]
    fn postscript_gets_no_page_offset() {
        let geometry = PageGeometry {
            media: Some(Rect::new(0.0, 0.0, 595.0, 842.0)),
            ..PageGeometry::default()
        };
        let setup = page_setup(Zoom::default(), &geometry, DocumentFormat::Ps, false, 4, 4);
        assert!(setup.contains("/PageSize [595.00 842.00]"));
        assert!(!setup.contains("/PageOffset"));
    }

    #[test]
    fn eps_clip_sizes_by_bounding_box() {
        let geometry = PageGeometry {
            bbox: Some(Rect::new(72.0, 72.0, 172.0, 122.0)),
            ..PageGeometry::default()
        };
        let setup = page_setup(Zoom::default(), &geometry, DocumentFormat::Eps, true, 4, 4);
        assert!(setup.contains("/PageSize [100.00 50.00]"));
        assert!(setup.contains("/PageOffset [-72.00 -72.00]"));

        let unclipped = page_setup(Zoom::default(), &geometry, DocumentFormat::Eps, false, 4, 4);
        assert!(!unclipped.contains("/PageSize"));
    }

    #[test]
    fn empty_geometry_emits_no_size() {
        let setup = page_setup(
            Zoom::default(),
            &PageGeometry::default(),
            DocumentFormat::Generic,
            false,
            4,
            4,
        );
        assert!(!setup.contains("/PageSize"));
        assert!(!setup.contains("/PageOffset"));
        assert!(setup.contains("/Orientation 0"));
    }
}

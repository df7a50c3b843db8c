//! Per-format page strategies
//!
//! The handler is chosen once when a document opens. PDF and PostScript
//! page facts come from the interpreter itself; EPS is scanned locally
//! for its bounding box; anything else is run as a single page.

use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use super::dsc::{self, DscTokenizer};
use super::geometry::{Orientation, PageGeometry, Rect};
use crate::interpreter::Interpreter;
use crate::{Error, Result};

const PAGES_TAG: &str = "%GSB_PAGES:";
const MEDIA_TAG: &str = "%GSB_MEDIA:";
const CROP_TAG: &str = "%GSB_CROP:";
const ROTATE_TAG: &str = "%GSB_ROTATE:";

/// Prints the page boxes and rotation of page `n` as tagged lines
const PDF_PRELUDE: &str = "/GSB_pdfinfo {\n\
    pdfgetpage\n\
    dup /MediaBox pget { (%GSB_MEDIA: ) print == } if\n\
    dup /CropBox pget { (%GSB_CROP: ) print == } if\n\
    dup /Rotate pget not { 0 } if (%GSB_ROTATE: ) print =\n\
    pop flush\n\
} bind def\n";

/// DOS EPS binary header magic
const DOS_EPS_MAGIC: [u8; 4] = [0xC5, 0xD0, 0xD3, 0xC6];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DocumentFormat {
    Pdf,
    Ps,
    Eps,
    /// Anything the interpreter can `run`, shown as one page
    Generic,
}

impl DocumentFormat {
    /// By extension; files without one are identified by content
    pub fn resolve(path: &Path) -> Result<Self> {
        match path.extension() {
            Some(ext) => Ok(Self::from_extension(&ext.to_string_lossy())),
            None => {
                let head = read_head(path, 64)?;
                let format = Self::sniff(&head);
                debug!("Sniffed {path:?} as {format:?}");
                Ok(format)
            }
        }
    }

    #[must_use]
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_ascii_lowercase().as_str() {
            "pdf" => Self::Pdf,
            "ps" => Self::Ps,
            "eps" => Self::Eps,
            _ => Self::Generic,
        }
    }

    #[must_use]
    pub fn sniff(head: &[u8]) -> Self {
        if head.starts_with(b"%PDF") {
            return Self::Pdf;
        }
        if head.starts_with(&DOS_EPS_MAGIC) {
            return Self::Eps;
        }
        if head.starts_with(b"%!") {
            let first_line = head
                .split(|&b| b == b'\n' || b == b'\r')
                .next()
                .unwrap_or_default();
            let is_eps = first_line.starts_with(b"%!PS-Adobe")
                && first_line.windows(4).any(|w| w == b"EPSF");
            return if is_eps { Self::Eps } else { Self::Ps };
        }
        Self::Generic
    }
}

fn read_head(path: &Path, len: u64) -> Result<Vec<u8>> {
    use std::io::Read;
    let file = std::fs::File::open(path).map_err(|source| Error::DocumentOpenFailed {
        path: path.to_path_buf(),
        source,
    })?;
    let mut head = Vec::new();
    file.take(len)
        .read_to_end(&mut head)
        .map_err(|source| Error::DocumentOpenFailed {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(head)
}

fn read_document(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|source| Error::DocumentOpenFailed {
        path: path.to_path_buf(),
        source,
    })
}

/// PostScript string literal for a file path
#[must_use]
pub fn ps_string(path: &Path) -> String {
    let text = path.to_string_lossy().replace('\\', "/");
    let mut out = String::with_capacity(text.len() + 2);
    out.push('(');
    for ch in text.chars() {
        if matches!(ch, '(' | ')' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push(')');
    out
}

/// Value following `tag` on the first line that starts with it
fn tagged<'a>(stdout: &'a str, tag: &str) -> Option<&'a str> {
    stdout
        .lines()
        .find_map(|line| line.trim_start().strip_prefix(tag))
        .map(str::trim)
}

/// Page range and geometry of the open document
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DocumentPages {
    pub first: u32,
    pub last: u32,
    pub current: u32,
    pub geometry: PageGeometry,
}

impl Default for DocumentPages {
    fn default() -> Self {
        Self {
            first: 1,
            last: 1,
            current: 1,
            geometry: PageGeometry::default(),
        }
    }
}

impl DocumentPages {
    #[must_use]
    pub fn contains(&self, page: u32) -> bool {
        (self.first..=self.last).contains(&page)
    }
}

#[derive(Debug)]
enum Strategy {
    Pdf,
    Ps { path: PathBuf },
    Eps { content: Vec<u8> },
    Generic { path: PathBuf },
}

#[derive(Debug)]
pub struct FormatHandler {
    format: DocumentFormat,
    eps_clip: bool,
    strategy: Strategy,
    pages: DocumentPages,
}

impl FormatHandler {
    #[must_use]
    pub fn new(format: DocumentFormat, eps_clip: bool) -> Self {
        let strategy = match format {
            DocumentFormat::Pdf => Strategy::Pdf,
            DocumentFormat::Ps => Strategy::Ps {
                path: PathBuf::new(),
            },
            DocumentFormat::Eps => Strategy::Eps {
                content: Vec::new(),
            },
            DocumentFormat::Generic => Strategy::Generic {
                path: PathBuf::new(),
            },
        };
        Self {
            format,
            eps_clip,
            strategy,
            pages: DocumentPages::default(),
        }
    }

    #[must_use]
    pub fn format(&self) -> DocumentFormat {
        self.format
    }

    #[must_use]
    pub fn pages(&self) -> &DocumentPages {
        &self.pages
    }

    pub(crate) fn set_current(&mut self, page: u32) {
        self.pages.current = page;
    }

    /// EPS with clipping enabled sizes the page by its bounding box
    #[must_use]
    pub fn clips_to_bbox(&self) -> bool {
        self.format == DocumentFormat::Eps && self.eps_clip
    }

    pub fn initialize(&mut self, interpreter: &Interpreter) -> Result<()> {
        if let Strategy::Pdf = self.strategy {
            interpreter.run(PDF_PRELUDE)?;
        }
        Ok(())
    }

    /// Learns the page range (and geometry where the format declares it)
    /// without rendering anything
    pub fn open(&mut self, interpreter: &Interpreter, path: &Path) -> Result<()> {
        let eps_clip = self.eps_clip;
        match &mut self.strategy {
            Strategy::Pdf => {
                let reply = interpreter.run(format!(
                    "{} (r) file runpdfbegin process_trailer_attrs\n\
                     ({PAGES_TAG} 1 ) print pdfpagecount = flush\n",
                    ps_string(path)
                ))?;
                let (first, last) = tagged(&reply.stdout, PAGES_TAG)
                    .and_then(parse_page_range)
                    .ok_or_else(|| {
                        Error::call_failed("pdfpagecount", reply.code, interpreter.transcript())
                    })?;
                self.pages.first = first;
                self.pages.last = last;
            }
            Strategy::Ps { path: stored } => {
                *stored = path.to_path_buf();
                let data = read_document(path)?;
                let declared = dsc::find_page_count(&mut DscTokenizer::new(&data));
                let count = match declared {
                    Some(count) => count,
                    None => count_ps_pages(interpreter, path)?,
                };
                self.pages.first = 1;
                self.pages.last = count.max(1);
            }
            Strategy::Eps { content } => {
                let data = read_document(path)?;
                let span = eps_span(&data);
                if eps_clip {
                    let mut tokens = DscTokenizer::with_range(&data, span.clone());
                    self.pages.geometry.bbox = dsc::find_bounding_box(&mut tokens);
                }
                *content = data[span].to_vec();
                self.pages.first = 1;
                self.pages.last = 1;
            }
            Strategy::Generic { path: stored } => {
                *stored = path.to_path_buf();
                self.pages.first = 1;
                self.pages.last = 1;
            }
        }
        self.pages.current = self.pages.first;
        info!(
            "Opened {:?} as {:?}, pages {}..={}",
            path, self.format, self.pages.first, self.pages.last
        );
        Ok(())
    }

    /// Refreshes per-page geometry before the page setup is emitted
    pub fn init_page(&mut self, interpreter: &Interpreter, page: u32) -> Result<()> {
        if let Strategy::Pdf = self.strategy {
            let reply = interpreter.run(format!("{page} GSB_pdfinfo\n"))?;
            let geometry = &mut self.pages.geometry;
            geometry.media = tagged(&reply.stdout, MEDIA_TAG).and_then(Rect::parse);
            geometry.crop = tagged(&reply.stdout, CROP_TAG).and_then(Rect::parse);
            geometry.orientation = tagged(&reply.stdout, ROTATE_TAG)
                .and_then(|v| v.parse::<f64>().ok())
                .map_or(Orientation::Portrait, |deg| Orientation::from_rotate(deg as i32));
        }
        Ok(())
    }

    pub fn show_page(&mut self, interpreter: &Interpreter, page: u32) -> Result<()> {
        match &self.strategy {
            Strategy::Pdf => {
                interpreter.run(format!("{page} pdfgetpage pdfshowpage\n"))?;
            }
            Strategy::Ps { path } => {
                interpreter.run(ps_page_script(path, page))?;
            }
            Strategy::Eps { content } => {
                interpreter.reset_page_shown();
                interpreter.run(content)?;
                if !interpreter.page_shown() {
                    debug!("EPS body did not show its page, appending showpage");
                    interpreter.run("showpage\n")?;
                }
            }
            Strategy::Generic { path } => {
                interpreter.run(format!("{} run\n", ps_string(path)))?;
            }
        }
        Ok(())
    }
}

fn parse_page_range(value: &str) -> Option<(u32, u32)> {
    let mut numbers = value.split_whitespace().map(str::parse::<u32>);
    let first = numbers.next()?.ok()?;
    let last = numbers.next()?.ok()?;
    (first <= last).then_some((first, last))
}

/// Runs the whole document, letting only page `page` (1-based) reach the device.
/// Pages are numbered in userdict since `setpagedevice` resets the EndPage count.
fn ps_page_script(path: &Path, page: u32) -> String {
    format!(
        "/GSB_save save def\n\
         userdict /GSB_page 0 put\n\
         << /EndPage {{ exch pop 2 ne {{ userdict /GSB_page 2 copy get 1 add put userdict /GSB_page get {page} eq }} {{ false }} ifelse }} >> setpagedevice\n\
         {{ {} run }} stopped pop\n\
         GSB_save restore\n",
        ps_string(path)
    )
}

/// Counts pages by running the document against the null device
fn count_ps_pages(interpreter: &Interpreter, path: &Path) -> Result<u32> {
    let reply = interpreter.run(format!(
        "/GSB_save save def\n\
         userdict /GSB_pagecount 0 put\n\
         nulldevice\n\
         << /EndPage {{ exch pop 2 ne {{ userdict /GSB_pagecount 2 copy get 1 add put }} if false }} >> setpagedevice\n\
         {{ {} run }} stopped pop\n\
         ({PAGES_TAG} 1 ) print userdict /GSB_pagecount get = flush\n\
         GSB_save restore\n",
        ps_string(path)
    ))?;
    match tagged(&reply.stdout, PAGES_TAG).and_then(parse_page_range) {
        Some((_, last)) => Ok(last),
        None => {
            warn!("Could not count pages of {path:?}, assuming one");
            Ok(1)
        }
    }
}

/// Byte range from the first `%!` through the end of the first `%%EOF`
#[must_use]
pub fn eps_span(data: &[u8]) -> std::ops::Range<usize> {
    let start = find(data, b"%!", 0).unwrap_or(0);
    let end = find(data, b"%%EOF", start).map_or(data.len(), |at| at + b"%%EOF".len());
    start..end
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|at| at + from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_wins_over_content() {
        assert_eq!(DocumentFormat::from_extension("PDF"), DocumentFormat::Pdf);
        assert_eq!(DocumentFormat::from_extension("eps"), DocumentFormat::Eps);
        assert_eq!(DocumentFormat::from_extension("ps"), DocumentFormat::Ps);
        assert_eq!(DocumentFormat::from_extension("ai"), DocumentFormat::Generic);
    }

    #[test]
    fn sniffs_headers() {
        assert_eq!(DocumentFormat::sniff(b"%PDF-1.7\n"), DocumentFormat::Pdf);
        assert_eq!(
            DocumentFormat::sniff(b"%!PS-Adobe-3.0 EPSF-3.0\n"),
            DocumentFormat::Eps
        );
        assert_eq!(DocumentFormat::sniff(b"%!PS-Adobe-3.0\n%%EPSF"), DocumentFormat::Ps);
        assert_eq!(
            DocumentFormat::sniff(&[0xC5, 0xD0, 0xD3, 0xC6, 0, 0]),
            DocumentFormat::Eps
        );
        assert_eq!(DocumentFormat::sniff(b"GIF89a"), DocumentFormat::Generic);
    }

    #[test]
    fn escapes_postscript_strings() {
        assert_eq!(
            ps_string(Path::new("/tmp/report (final).ps")),
            "(/tmp/report \\(final\\).ps)"
        );
    }

    #[test]
    fn eps_span_is_inclusive_of_eof_marker() {
        let data = b"garbage\x00%!PS-Adobe-3.0 EPSF-3.0\nshowpage\n%%EOF\ntrailing";
        let span = eps_span(data);
        assert!(data[span.clone()].starts_with(b"%!PS"));
        assert!(data[span].ends_with(b"%%EOF"));
    }

    #[test]
    fn eps_span_without_eof_runs_to_end() {
        let data = b"%!PS\n0 0 moveto\n";
        assert_eq!(eps_span(data), 0..data.len());
    }

    #[test]
    fn ps_page_selection_counts_in_userdict() {
        let script = ps_page_script(Path::new("/tmp/doc.ps"), 3);
        assert!(script.contains("userdict /GSB_page 0 put"));
        assert!(script.contains("userdict /GSB_page get 3 eq"));
        assert!(!script.contains("2 ne exch"));
        assert!(script.contains("{ (/tmp/doc.ps) run } stopped pop"));
    }

    #[test]
    fn tagged_replies() {
        let stdout = "noise\n%GSB_MEDIA: [0 0 612 792]\n%GSB_ROTATE: 90\n";
        assert_eq!(tagged(stdout, MEDIA_TAG), Some("[0 0 612 792]"));
        assert_eq!(tagged(stdout, ROTATE_TAG), Some("90"));
        assert_eq!(tagged(stdout, CROP_TAG), None);
        assert_eq!(parse_page_range("1 12"), Some((1, 12)));
        assert_eq!(parse_page_range("1"), None);
    }
}

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ghostbridge::engine::Engine;
use ghostbridge::test_utils::{Call, FakeEngine};
use ghostbridge::viewer::{DocumentFormat, Orientation, PixelFormat, Zoom};
use ghostbridge::{Error, Viewer, ViewerEvent, ViewerOptions, ViewerState};

const PDF_PAGES: &str = "%GSB_PAGES: 1 5\n";
const PDF_PAGE_INFO: &str = "%GSB_MEDIA: [0 0 612 792]\n%GSB_ROTATE: 90\n";

fn pdf_engine() -> Arc<FakeEngine> {
    Arc::new(
        FakeEngine::new()
            .reply_to("pdfpagecount", PDF_PAGES)
            .reply_to(" GSB_pdfinfo", PDF_PAGE_INFO),
    )
}

fn viewer(fake: &Arc<FakeEngine>) -> Viewer {
    Viewer::new(Arc::clone(fake) as Arc<dyn Engine>, ViewerOptions::default())
}

fn write(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path
}

fn setups(fake: &FakeEngine) -> Vec<String> {
    fake.runs()
        .into_iter()
        .filter(|run| run.starts_with("%%BeginPageSetup"))
        .collect()
}

fn synthetic_showpages(fake: &FakeEngine) -> usize {
    fake.runs().iter().filter(|run| *run == "showpage\n").count()
}

fn open_pdf(fake: &Arc<FakeEngine>) -> (Viewer, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let path = write(dir.path(), "report.pdf", b"%PDF-1.7\n");
    let mut viewer = viewer(fake);
    viewer.open(&path).unwrap();
    (viewer, dir)
}

#[test]
fn test_open_pdf_reads_range_and_shows_first_page() {
    let fake = pdf_engine();
    let dir = tempfile::tempdir().unwrap();
    let path = write(dir.path(), "report.pdf", b"%PDF-1.7\n");
    let mut viewer = viewer(&fake);
    let events = viewer.events();

    viewer.open(&path).unwrap();

    assert_eq!(viewer.format(), Some(DocumentFormat::Pdf));
    assert_eq!(viewer.first_page(), Some(1));
    assert_eq!(viewer.last_page(), Some(5));
    assert_eq!(viewer.current_page(), Some(1));
    assert_eq!(viewer.current_orientation(), Orientation::Landscape);
    assert_eq!(
        viewer.file_path(),
        Some(path.canonicalize().unwrap().as_path())
    );

    let setup = setups(&fake);
    assert_eq!(setup.len(), 1);
    assert!(setup[0].contains("/HWResolution [96 96]"));
    assert!(setup[0].contains("/PageSize [612.00 792.00]"));
    assert!(setup[0].contains("/PageOffset [0.00 0.00]"));
    assert!(setup[0].contains("/Orientation 3"));
    assert!(fake.runs().last().unwrap().contains("1 pdfgetpage pdfshowpage"));

    assert_eq!(
        events.try_iter().collect::<Vec<_>>(),
        vec![
            ViewerEvent::DisplaySize {
                width: 4,
                height: 2
            },
            ViewerEvent::DisplayPage {
                width: 4,
                height: 2
            },
        ]
    );
    let surface = viewer.with_surface(|s| (s.width(), s.height(), s.format(), s.data()[0]));
    assert_eq!(surface, Some((4, 2, PixelFormat::Bgr24, 0x7f)));
}

#[test]
fn test_open_passes_display_switches() {
    let fake = pdf_engine();
    let (viewer, dir) = open_pdf(&fake);

    let args = fake.init_args().unwrap();
    assert_eq!(args[0], "ghostbridge");
    assert!(args.contains(&"-sDEVICE=display".to_string()));
    assert!(args.contains(&"-sDisplayHandle=16#1001".to_string()));
    assert!(args.contains(&"-dMaxBitmap=53084160".to_string()));
    let include = format!("-I{}", dir.path().canonicalize().unwrap().display());
    assert!(args.contains(&include));
    assert_eq!(fake.count(&Call::SetDisplay), 1);
    drop(viewer);
}

#[test]
fn test_affected_revision_gets_large_bitmap() {
    let fake = Arc::new(
        FakeEngine::new()
            .with_revision(915)
            .reply_to("pdfpagecount", PDF_PAGES),
    );
    let (_viewer, _dir) = open_pdf(&fake);

    assert!(
        fake.init_args()
            .unwrap()
            .contains(&"-dMaxBitmap=1g".to_string())
    );
}

/// Previous at the first page and Next at the last page do nothing
#[test]
fn test_navigation_is_clamped() {
    let fake = pdf_engine();
    let (mut viewer, _dir) = open_pdf(&fake);

    assert!(!viewer.can_show_previous_page());
    assert!(!viewer.can_show_first_page());
    viewer.show_previous_page().unwrap();
    viewer.show_first_page().unwrap();
    assert_eq!(setups(&fake).len(), 1);

    for _ in 0..10 {
        viewer.show_next_page().unwrap();
        let current = viewer.current_page().unwrap();
        assert!((1..=5).contains(&current));
    }
    assert_eq!(viewer.current_page(), Some(5));
    assert_eq!(setups(&fake).len(), 5);
    assert!(!viewer.can_show_next_page());
    assert!(!viewer.can_show_last_page());

    viewer.show_last_page().unwrap();
    assert_eq!(setups(&fake).len(), 5);

    viewer.show_previous_page().unwrap();
    assert_eq!(viewer.current_page(), Some(4));
    viewer.show_first_page().unwrap();
    assert_eq!(viewer.current_page(), Some(1));
    viewer.show_last_page().unwrap();
    assert_eq!(viewer.current_page(), Some(5));
}

#[test]
fn test_show_same_page_without_refresh_is_noop() {
    let fake = pdf_engine();
    let (mut viewer, _dir) = open_pdf(&fake);
    let runs = fake.runs().len();

    viewer.show_page(1, false).unwrap();
    assert_eq!(fake.runs().len(), runs);

    viewer.show_page(1, true).unwrap();
    assert_eq!(setups(&fake).len(), 2);

    viewer.refresh_page().unwrap();
    assert_eq!(setups(&fake).len(), 3);
}

#[test]
fn test_out_of_range_page_is_ignored() {
    let fake = pdf_engine();
    let (mut viewer, _dir) = open_pdf(&fake);
    let runs = fake.runs().len();

    viewer.show_page(0, true).unwrap();
    viewer.show_page(6, true).unwrap();

    assert_eq!(fake.runs().len(), runs);
    assert_eq!(viewer.current_page(), Some(1));
    assert!(viewer.is_page_number_valid(5));
    assert!(!viewer.is_page_number_valid(6));
}

/// A dry-run zoom predicts the real one and changes nothing
#[test]
fn test_zoom_test_only_matches_real_zoom() {
    let fake = Arc::new(FakeEngine::new());
    let mut viewer = viewer(&fake);

    for dpi in [39, 40, 96, 300, 413, 414, 496] {
        for scale in [Zoom::ZOOM_IN_RATE, Zoom::ZOOM_OUT_RATE] {
            viewer.set_dpi(dpi);
            let predicted = viewer.zoom(scale, true);
            assert_eq!(viewer.dpi(), Zoom::uniform(dpi));
            let actual = viewer.zoom(scale, false);
            assert_eq!(predicted, actual, "dpi {dpi} scale {scale}");
            if !actual {
                assert_eq!(viewer.dpi(), Zoom::uniform(dpi));
            }
        }
    }
}

#[test]
fn test_zoom_in_rerenders_current_page() {
    let fake = pdf_engine();
    let (mut viewer, _dir) = open_pdf(&fake);
    viewer.show_page(3, false).unwrap();

    assert!(viewer.zoom_in().unwrap());

    assert_eq!(viewer.dpi(), Zoom::uniform(115));
    let last = setups(&fake).pop().unwrap();
    assert!(last.contains("/HWResolution [115 115]"));
    assert!(fake.runs().last().unwrap().contains("3 pdfgetpage pdfshowpage"));
}

#[test]
fn test_zoom_at_limit_does_nothing() {
    let fake = pdf_engine();
    let (mut viewer, _dir) = open_pdf(&fake);
    viewer.set_dpi(Zoom::MAX_DPI);
    let runs = fake.runs().len();

    assert!(!viewer.can_zoom_in());
    assert!(!viewer.zoom_in().unwrap());
    assert_eq!(fake.runs().len(), runs);
    assert!(viewer.can_zoom_out());
}

#[test]
fn test_state_round_trip_restores_page_and_zoom() {
    let fake = pdf_engine();
    let (mut viewer, _dir) = open_pdf(&fake);
    viewer.show_page(3, false).unwrap();
    viewer.zoom_in().unwrap();
    viewer.set_progressive_update(false);

    let state = viewer.save_state();
    assert_eq!(
        state,
        ViewerState {
            x_dpi: 115,
            y_dpi: 115,
            current_page: 3,
            progressive_update: false,
        }
    );

    viewer.show_first_page().unwrap();
    viewer.set_dpi(96);
    viewer.set_progressive_update(true);
    viewer.restore_state(state).unwrap();

    assert_eq!(viewer.current_page(), Some(3));
    assert_eq!(viewer.dpi(), Zoom::uniform(115));
    assert!(!viewer.progressive_update());
}

#[test]
fn test_restore_state_clamps_page() {
    let fake = pdf_engine();
    let (mut viewer, _dir) = open_pdf(&fake);

    viewer
        .restore_state(ViewerState {
            x_dpi: 96,
            y_dpi: 96,
            current_page: 99,
            progressive_update: true,
        })
        .unwrap();

    assert_eq!(viewer.current_page(), Some(5));
}

const EPS_WITHOUT_SHOWPAGE: &[u8] = b"%!PS-Adobe-3.0 EPSF-3.0\n\
%%BoundingBox: 10 20 300 400\n\
%%EndComments\n\
newpath 10 20 moveto 300 400 lineto stroke\n\
%%EOF\n";

const EPS_WITH_SHOWPAGE: &[u8] = b"%!PS-Adobe-3.0 EPSF-3.0\n\
%%BoundingBox: 0 0 100 100\n\
newpath 0 0 moveto 100 100 lineto stroke\n\
showpage\n\
%%EOF\n";

/// An EPS body that never shows its page gets exactly one showpage appended
#[test]
fn test_eps_without_showpage_gets_one_appended() {
    let fake = Arc::new(FakeEngine::new());
    let dir = tempfile::tempdir().unwrap();
    let path = write(dir.path(), "figure.eps", EPS_WITHOUT_SHOWPAGE);
    let mut viewer = viewer(&fake);
    let events = viewer.events();

    viewer.open(&path).unwrap();

    assert_eq!(synthetic_showpages(&fake), 1);
    assert!(
        events
            .try_iter()
            .any(|e| matches!(e, ViewerEvent::DisplayPage { .. }))
    );

    viewer.refresh_page().unwrap();
    assert_eq!(synthetic_showpages(&fake), 2);
}

#[test]
fn test_eps_with_showpage_gets_none_appended() {
    let fake = Arc::new(FakeEngine::new());
    let dir = tempfile::tempdir().unwrap();
    let path = write(dir.path(), "figure.eps", EPS_WITH_SHOWPAGE);
    let mut viewer = viewer(&fake);

    viewer.open(&path).unwrap();
    viewer.refresh_page().unwrap();

    assert_eq!(synthetic_showpages(&fake), 0);
}

#[test]
fn test_eps_body_is_trimmed_to_markers() {
    let fake = Arc::new(FakeEngine::new());
    let dir = tempfile::tempdir().unwrap();
    let mut data = b"\xC5\xD0\xD3\xC6binary preview".to_vec();
    data.extend_from_slice(EPS_WITHOUT_SHOWPAGE);
    data.extend_from_slice(b"trailing preview bytes");
    let path = write(dir.path(), "figure.eps", &data);
    let mut viewer = viewer(&fake);

    viewer.open(&path).unwrap();

    let body = fake
        .runs()
        .into_iter()
        .find(|run| run.starts_with("%!PS-Adobe"))
        .unwrap();
    assert!(body.ends_with("%%EOF"));
    assert!(!body.contains("preview"));
}

/// Bounding box "10 20 300 400" sizes and offsets the page
#[test]
fn test_eps_bounding_box_drives_page_setup() {
    let fake = Arc::new(FakeEngine::new());
    let dir = tempfile::tempdir().unwrap();
    let path = write(dir.path(), "figure.eps", EPS_WITHOUT_SHOWPAGE);
    let mut viewer = viewer(&fake);

    viewer.open(&path).unwrap();

    let setup = setups(&fake).pop().unwrap();
    assert!(setup.contains("/PageSize [290.00 380.00]"));
    assert!(setup.contains("/PageOffset [-10.00 -20.00]"));
}

#[test]
fn test_malformed_bounding_box_is_left_unset() {
    let fake = Arc::new(FakeEngine::new());
    let dir = tempfile::tempdir().unwrap();
    let eps = b"%!PS-Adobe-3.0 EPSF-3.0\n%%BoundingBox: 10 20 300\nshowpage\n%%EOF\n";
    let path = write(dir.path(), "broken.eps", eps);
    let mut viewer = viewer(&fake);

    viewer.open(&path).unwrap();

    let setup = setups(&fake).pop().unwrap();
    assert!(!setup.contains("/PageSize"));
    assert!(!setup.contains("/PageOffset"));
}

#[test]
fn test_eps_clip_off_ignores_bounding_box() {
    let fake = Arc::new(FakeEngine::new());
    let dir = tempfile::tempdir().unwrap();
    let path = write(dir.path(), "figure.eps", EPS_WITHOUT_SHOWPAGE);
    let options = ViewerOptions {
        eps_clip: false,
        ..ViewerOptions::default()
    };
    let mut viewer = Viewer::new(Arc::clone(&fake) as Arc<dyn Engine>, options);

    viewer.open(&path).unwrap();

    assert!(!setups(&fake).pop().unwrap().contains("/PageSize"));
}

#[test]
fn test_postscript_page_count_from_comments() {
    let fake = Arc::new(FakeEngine::new());
    let dir = tempfile::tempdir().unwrap();
    let path = write(
        dir.path(),
        "slides.ps",
        b"%!PS-Adobe-3.0\n%%Pages: 3\n%%EndComments\nshowpage showpage showpage\n",
    );
    let mut viewer = viewer(&fake);

    viewer.open(&path).unwrap();
    viewer.show_page(2, false).unwrap();

    assert_eq!(viewer.last_page(), Some(3));
    let show = fake.runs().pop().unwrap();
    assert!(show.contains("userdict /GSB_page 0 put"));
    assert!(show.contains("userdict /GSB_page get 2 eq"));
    assert!(!show.contains("2 ne exch"));
    assert!(show.contains("run } stopped pop"));
    assert!(!setups(&fake).pop().unwrap().contains("/PageOffset"));
}

#[test]
fn test_postscript_pages_are_numbered_independently_of_setpagedevice() {
    let fake = Arc::new(FakeEngine::new());
    let dir = tempfile::tempdir().unwrap();
    let path = write(
        dir.path(),
        "driver.ps",
        b"%!PS-Adobe-3.0\n%%Pages: 2\n%%EndComments\n\
          %%Page: 1 1\n<< /PageSize [612 792] >> setpagedevice showpage\n\
          %%Page: 2 2\n<< /PageSize [612 792] >> setpagedevice showpage\n",
    );
    let mut viewer = viewer(&fake);

    viewer.open(&path).unwrap();
    let first = fake.runs().pop().unwrap();
    viewer.show_last_page().unwrap();
    let last = fake.runs().pop().unwrap();

    assert!(first.contains("userdict /GSB_page get 1 eq"));
    assert!(last.contains("userdict /GSB_page get 2 eq"));
    for script in [&first, &last] {
        assert!(script.contains("userdict /GSB_page 2 copy get 1 add put"));
        assert!(!script.contains("exch 1 eq and"));
    }
}

#[test]
fn test_postscript_page_count_from_engine() {
    let fake = Arc::new(FakeEngine::new().reply_to("GSB_pagecount", "%GSB_PAGES: 1 4\n"));
    let dir = tempfile::tempdir().unwrap();
    let path = write(dir.path(), "slides.ps", b"%!PS\nshowpage\n");
    let mut viewer = viewer(&fake);

    viewer.open(&path).unwrap();

    assert_eq!(viewer.last_page(), Some(4));
}

#[test]
fn test_generic_document_is_one_page() {
    let fake = Arc::new(FakeEngine::new());
    let dir = tempfile::tempdir().unwrap();
    let path = write(dir.path(), "logo.ai", b"%!PS-Adobe-3.0\n");
    let mut viewer = viewer(&fake);

    viewer.open(&path).unwrap();

    assert_eq!(viewer.format(), Some(DocumentFormat::Generic));
    assert_eq!((viewer.first_page(), viewer.last_page()), (Some(1), Some(1)));
    assert!(fake.runs().last().unwrap().ends_with("logo.ai) run\n"));
}

#[test]
fn test_open_without_showing_first_page() {
    let fake = pdf_engine();
    let dir = tempfile::tempdir().unwrap();
    let path = write(dir.path(), "report.pdf", b"%PDF-1.7\n");
    let options = ViewerOptions {
        show_page_after_open: false,
        ..ViewerOptions::default()
    };
    let mut viewer = Viewer::new(Arc::clone(&fake) as Arc<dyn Engine>, options);

    viewer.open(&path).unwrap();
    assert!(setups(&fake).is_empty());
    assert!(viewer.with_surface(|_| ()).is_none());

    viewer.show_first_page().unwrap();
    assert_eq!(setups(&fake).len(), 1);
}

#[test]
fn test_open_reader_sniffs_and_cleans_up() {
    let fake = pdf_engine();
    let mut viewer = viewer(&fake);

    viewer
        .open_reader(Cursor::new(b"%PDF-1.4\n%%EOF\n".to_vec()))
        .unwrap();

    assert_eq!(viewer.format(), Some(DocumentFormat::Pdf));
    let path = viewer.file_path().unwrap().to_path_buf();
    assert!(path.exists());
    viewer.close();
    assert!(!path.exists());
    assert!(!viewer.is_open());
}

#[test]
fn test_missing_document_fails_before_engine_use() {
    let fake = pdf_engine();
    let mut viewer = viewer(&fake);

    let result = viewer.open("/definitely/not/here.pdf");

    assert!(matches!(result, Err(Error::DocumentOpenFailed { .. })));
    assert_eq!(fake.call_count(), 0);
}

#[test]
fn test_failed_init_releases_instance() {
    let fake = Arc::new(FakeEngine::new().with_init_code(-100));
    let dir = tempfile::tempdir().unwrap();
    let path = write(dir.path(), "report.pdf", b"%PDF-1.7\n");
    let mut viewer = viewer(&fake);

    let result = viewer.open(&path);

    assert!(matches!(
        result,
        Err(Error::EngineCallFailed {
            call: "gsapi_init_with_args",
            ..
        })
    ));
    assert!(!viewer.is_open());
    assert_eq!(fake.count(&Call::Exit), 1);
    assert_eq!(fake.live_instances(), 0);
}

/// Opening another document replaces the first and its instance
#[test]
fn test_reopen_replaces_instance() {
    let fake = pdf_engine();
    let dir = tempfile::tempdir().unwrap();
    let first = write(dir.path(), "a.pdf", b"%PDF-1.7\n");
    let second = write(dir.path(), "b.pdf", b"%PDF-1.7\n");
    let mut viewer = viewer(&fake);

    viewer.open(&first).unwrap();
    viewer.open(&second).unwrap();

    assert_eq!(fake.count(&Call::NewInstance), 2);
    assert_eq!(fake.count(&Call::Exit), 1);
    assert_eq!(fake.live_instances(), 1);
    assert!(viewer.file_path().unwrap().ends_with("b.pdf"));

    drop(viewer);
    assert_eq!(fake.live_instances(), 0);
    assert_eq!(fake.count(&Call::DeleteInstance), 2);
}

#[test]
fn test_navigation_without_document_is_noop() {
    let fake = Arc::new(FakeEngine::new());
    let mut viewer = viewer(&fake);

    viewer.show_next_page().unwrap();
    viewer.show_last_page().unwrap();
    viewer.refresh_page().unwrap();

    assert_eq!(viewer.current_page(), None);
    assert!(!viewer.can_show_next_page());
    assert_eq!(fake.call_count(), 0);
}

//! Ghostscript bound at runtime through `libloading`
//!
//! Entry point addresses are copied out of the library once at load time
//! and stay valid for as long as the `Library` field is alive. Each
//! instance gets a boxed [`CallerContext`] whose address is handed to the
//! engine as the caller handle; every callback trampoline recovers the
//! host callbacks from it.

use std::collections::HashMap;
use std::ffi::{CStr, CString, c_void};
use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use libc::{c_char, c_int, c_long, c_uchar, c_uint, c_ulong, c_ushort};
use libloading::Library;
use log::{debug, error, info, warn};
use tempfile::NamedTempFile;

use super::codes;
use super::display::{DisplayEvent, Frame};
use super::version::EngineSource;
use super::{ArgEncoding, Engine, EngineCallbacks, InstanceId, StdioChannels};
use crate::{Error, Result};

/// Largest string the engine accepts in a single run call
const MAX_RUN_CHUNK: usize = 0xffff;

const DISPLAY_VERSION_MAJOR: c_int = 2;
const DISPLAY_VERSION_MINOR: c_int = 0;

type StdinFn = unsafe extern "C" fn(*mut c_void, *mut c_char, c_int) -> c_int;
type StdoutFn = unsafe extern "C" fn(*mut c_void, *const c_char, c_int) -> c_int;
type PollFn = unsafe extern "C" fn(*mut c_void) -> c_int;

type NewInstanceFn = unsafe extern "C" fn(*mut *mut c_void, *mut c_void) -> c_int;
type DeleteInstanceFn = unsafe extern "C" fn(*mut c_void);
type SetStdioFn =
    unsafe extern "C" fn(*mut c_void, Option<StdinFn>, Option<StdoutFn>, Option<StdoutFn>) -> c_int;
type SetPollFn = unsafe extern "C" fn(*mut c_void, Option<PollFn>) -> c_int;
type SetArgEncodingFn = unsafe extern "C" fn(*mut c_void, c_int) -> c_int;
type SetDisplayCallbackFn = unsafe extern "C" fn(*mut c_void, *mut DisplayCallback) -> c_int;
type InitWithArgsFn = unsafe extern "C" fn(*mut c_void, c_int, *mut *mut c_char) -> c_int;
type RunStringWithLengthFn =
    unsafe extern "C" fn(*mut c_void, *const c_char, c_uint, c_int, *mut c_int) -> c_int;
type RunStringBoundaryFn = unsafe extern "C" fn(*mut c_void, c_int, *mut c_int) -> c_int;
type RunStringContinueFn =
    unsafe extern "C" fn(*mut c_void, *const c_char, c_uint, c_int, *mut c_int) -> c_int;
type ExitFn = unsafe extern "C" fn(*mut c_void) -> c_int;
type RevisionFn = unsafe extern "C" fn(*mut GsapiRevision, c_int) -> c_int;

type DeviceFn = unsafe extern "C" fn(*mut c_void, *mut c_void) -> c_int;
type PresizeFn = unsafe extern "C" fn(*mut c_void, *mut c_void, c_int, c_int, c_int, c_uint) -> c_int;
type SizeFn = unsafe extern "C" fn(
    *mut c_void,
    *mut c_void,
    c_int,
    c_int,
    c_int,
    c_uint,
    *mut c_uchar,
) -> c_int;
type PageFn = unsafe extern "C" fn(*mut c_void, *mut c_void, c_int, c_int) -> c_int;
type UpdateFn = unsafe extern "C" fn(*mut c_void, *mut c_void, c_int, c_int, c_int, c_int) -> c_int;
type MemAllocFn = unsafe extern "C" fn(*mut c_void, *mut c_void, c_ulong) -> *mut c_void;
type MemFreeFn = unsafe extern "C" fn(*mut c_void, *mut c_void, *mut c_void) -> c_int;
type SeparationFn = unsafe extern "C" fn(
    *mut c_void,
    *mut c_void,
    c_int,
    *const c_char,
    c_ushort,
    c_ushort,
    c_ushort,
    c_ushort,
) -> c_int;

#[allow(dead_code)]
#[repr(C)]
struct GsapiRevision {
    product: *const c_char,
    copyright: *const c_char,
    revision: c_long,
    revisiondate: c_long,
}

/// Display device callback table, layout version 2
#[allow(dead_code)]
#[repr(C)]
struct DisplayCallback {
    size: c_int,
    version_major: c_int,
    version_minor: c_int,
    display_open: Option<DeviceFn>,
    display_preclose: Option<DeviceFn>,
    display_close: Option<DeviceFn>,
    display_presize: Option<PresizeFn>,
    display_size: Option<SizeFn>,
    display_sync: Option<DeviceFn>,
    display_page: Option<PageFn>,
    display_update: Option<UpdateFn>,
    display_memalloc: Option<MemAllocFn>,
    display_memfree: Option<MemFreeFn>,
    display_separation: Option<SeparationFn>,
}

impl DisplayCallback {
    fn new() -> Self {
        Self {
            size: std::mem::size_of::<Self>() as c_int,
            version_major: DISPLAY_VERSION_MAJOR,
            version_minor: DISPLAY_VERSION_MINOR,
            display_open: Some(display_device_noop as DeviceFn),
            display_preclose: Some(display_device_noop as DeviceFn),
            display_close: Some(display_close as DeviceFn),
            display_presize: Some(display_presize as PresizeFn),
            display_size: Some(display_size as SizeFn),
            display_sync: Some(display_device_noop as DeviceFn),
            display_page: Some(display_page as PageFn),
            display_update: Some(display_update as UpdateFn),
            display_memalloc: None,
            display_memfree: None,
            display_separation: None,
        }
    }
}

#[derive(Clone, Copy)]
struct RunStringChunks {
    begin: RunStringBoundaryFn,
    cont: RunStringContinueFn,
    end: RunStringBoundaryFn,
}

#[derive(Clone, Copy)]
struct Api {
    new_instance: NewInstanceFn,
    delete_instance: DeleteInstanceFn,
    set_stdio: SetStdioFn,
    set_poll: SetPollFn,
    init_with_args: InitWithArgsFn,
    run_string_with_length: RunStringWithLengthFn,
    exit: ExitFn,
    revision: RevisionFn,
    set_arg_encoding: Option<SetArgEncodingFn>,
    set_display_callback: Option<SetDisplayCallbackFn>,
    run_string_chunks: Option<RunStringChunks>,
}

unsafe fn required<T: Copy>(library: &Library, name: &str) -> std::result::Result<T, String> {
    let symbol = format!("{name}\0");
    // SAFETY: caller guarantees `T` matches the exported symbol's signature
    unsafe { library.get::<T>(symbol.as_bytes()) }
        .map(|s| *s)
        .map_err(|e| format!("missing {name}: {e}"))
}

unsafe fn optional<T: Copy>(library: &Library, name: &str) -> Option<T> {
    // SAFETY: forwarded from the caller
    unsafe { required(library, name) }.ok()
}

impl Api {
    unsafe fn bind(library: &Library) -> std::result::Result<Self, String> {
        // SAFETY: signatures mirror iapi.h
        unsafe {
            let run_string_chunks = match (
                optional::<RunStringBoundaryFn>(library, "gsapi_run_string_begin"),
                optional::<RunStringContinueFn>(library, "gsapi_run_string_continue"),
                optional::<RunStringBoundaryFn>(library, "gsapi_run_string_end"),
            ) {
                (Some(begin), Some(cont), Some(end)) => Some(RunStringChunks { begin, cont, end }),
                _ => None,
            };
            Ok(Self {
                new_instance: required(library, "gsapi_new_instance")?,
                delete_instance: required(library, "gsapi_delete_instance")?,
                set_stdio: required(library, "gsapi_set_stdio")?,
                set_poll: required(library, "gsapi_set_poll")?,
                init_with_args: required(library, "gsapi_init_with_args")?,
                run_string_with_length: required(library, "gsapi_run_string_with_length")?,
                exit: required(library, "gsapi_exit")?,
                revision: required(library, "gsapi_revision")?,
                set_arg_encoding: optional(library, "gsapi_set_arg_encoding"),
                set_display_callback: optional(library, "gsapi_set_display_callback"),
                run_string_chunks,
            })
        }
    }
}

#[derive(Clone, Copy, Default)]
struct RawFrame {
    ptr: usize,
    width: u32,
    height: u32,
    raster: u32,
    format: u32,
}

impl RawFrame {
    /// # Safety
    /// The display device must still own the raster `ptr` points at.
    unsafe fn frame<'a>(self) -> Option<Frame<'a>> {
        if self.ptr == 0 {
            return None;
        }
        let len = self.raster as usize * self.height as usize;
        // SAFETY: the device allocated `raster * height` bytes at `ptr`
        let data = unsafe { std::slice::from_raw_parts(self.ptr as *const u8, len) };
        Some(Frame {
            data,
            width: self.width,
            height: self.height,
            raster: self.raster,
            format: self.format,
        })
    }
}

/// Target of the caller handle passed to the engine
struct CallerContext {
    callbacks: Arc<dyn EngineCallbacks>,
    frame: Mutex<RawFrame>,
}

impl CallerContext {
    fn frame(&self) -> RawFrame {
        *self.frame.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_frame(&self, frame: RawFrame) {
        *self.frame.lock().unwrap_or_else(PoisonError::into_inner) = frame;
    }
}

struct Slot {
    context: Box<CallerContext>,
    display: Option<Box<DisplayCallback>>,
}

/// Ghostscript library loaded from disk or from an in-memory image
pub struct NativeEngine {
    api: Api,
    revision: u32,
    product: String,
    slots: Mutex<HashMap<usize, Slot>>,
    _library: Library,
    /// Backing file for in-memory images; removed after the library is unloaded
    _image: Option<NamedTempFile>,
    path: PathBuf,
}

impl NativeEngine {
    pub fn load(source: &EngineSource) -> Result<Self> {
        match source {
            EngineSource::Version(version) => Self::open(&version.library_path, None),
            EngineSource::Image(bytes) => {
                let mut file = tempfile::Builder::new()
                    .prefix("gsdll")
                    .suffix(std::env::consts::DLL_SUFFIX)
                    .tempfile()?;
                file.write_all(bytes)?;
                file.flush()?;
                let path = file.path().to_path_buf();
                debug!("Wrote {} byte engine image to {path:?}", bytes.len());
                Self::open(&path, Some(file))
            }
        }
    }

    fn open(path: &Path, image: Option<NamedTempFile>) -> Result<Self> {
        let load_failed = |reason: String| Error::EngineLoadFailed {
            path: path.to_path_buf(),
            reason,
        };
        // SAFETY: loading runs the library's initializers; Ghostscript has none with preconditions
        let library = unsafe { Library::new(path) }.map_err(|e| load_failed(e.to_string()))?;
        // SAFETY: symbol signatures follow the published gsapi headers
        let api = unsafe { Api::bind(&library) }.map_err(load_failed)?;
        let (revision, product) = read_revision(api.revision)
            .ok_or_else(|| load_failed("gsapi_revision failed".to_string()))?;

        info!("Loaded {product} revision {revision} from {path:?}");
        if api.set_display_callback.is_none() {
            warn!("{path:?} has no gsapi_set_display_callback, page display unavailable");
        }

        Ok(Self {
            api,
            revision,
            product,
            slots: Mutex::new(HashMap::new()),
            _library: library,
            _image: image,
            path: path.to_path_buf(),
        })
    }

    #[must_use]
    pub fn product(&self) -> &str {
        &self.product
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn slots(&self) -> std::sync::MutexGuard<'_, HashMap<usize, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run_chunked(&self, chunks: RunStringChunks, instance: *mut c_void, code: &[u8]) -> i32 {
        let mut exit_code: c_int = 0;
        // SAFETY: `instance` came from gsapi_new_instance and is not yet deleted
        unsafe {
            let rc = (chunks.begin)(instance, 0, &mut exit_code);
            if rc < 0 {
                return rc;
            }
            for chunk in code.chunks(MAX_RUN_CHUNK) {
                let rc = (chunks.cont)(
                    instance,
                    chunk.as_ptr().cast(),
                    chunk.len() as c_uint,
                    0,
                    &mut exit_code,
                );
                if rc < 0 && rc != codes::NEED_INPUT {
                    return rc;
                }
            }
            (chunks.end)(instance, 0, &mut exit_code)
        }
    }
}

fn read_revision(revision_fn: RevisionFn) -> Option<(u32, String)> {
    let mut revision = GsapiRevision {
        product: std::ptr::null(),
        copyright: std::ptr::null(),
        revision: 0,
        revisiondate: 0,
    };
    let size = std::mem::size_of::<GsapiRevision>() as c_int;
    // SAFETY: the struct matches gsapi_revision_t and `size` is its exact size
    if unsafe { revision_fn(&mut revision, size) } != 0 {
        return None;
    }
    let product = if revision.product.is_null() {
        String::from("Ghostscript")
    } else {
        // SAFETY: the library returns a static NUL-terminated string
        unsafe { CStr::from_ptr(revision.product) }
            .to_string_lossy()
            .into_owned()
    };
    Some((u32::try_from(revision.revision).ok()?, product))
}

impl Engine for NativeEngine {
    fn revision(&self) -> u32 {
        self.revision
    }

    fn new_instance(&self, callbacks: Arc<dyn EngineCallbacks>) -> std::result::Result<InstanceId, i32> {
        let context = Box::new(CallerContext {
            callbacks,
            frame: Mutex::new(RawFrame::default()),
        });
        let handle = std::ptr::from_ref::<CallerContext>(&*context).cast_mut().cast::<c_void>();
        let mut instance: *mut c_void = std::ptr::null_mut();
        // SAFETY: `handle` stays valid until the slot is removed in delete_instance
        let code = unsafe { (self.api.new_instance)(&mut instance, handle) };
        if codes::is_error(code) || instance.is_null() {
            return Err(if codes::is_error(code) { code } else { codes::FATAL });
        }
        let id = InstanceId(instance as usize);
        self.slots().insert(
            id.0,
            Slot {
                context,
                display: None,
            },
        );
        Ok(id)
    }

    fn set_stdio(&self, instance: InstanceId, channels: StdioChannels) -> i32 {
        // SAFETY: trampolines only dereference the caller handle set at creation
        unsafe {
            (self.api.set_stdio)(
                instance.0 as *mut c_void,
                channels.input.then_some(stdin_trampoline as StdinFn),
                channels.output.then_some(stdout_trampoline as StdoutFn),
                channels.error.then_some(stderr_trampoline as StdoutFn),
            )
        }
    }

    fn set_poll(&self, instance: InstanceId) -> i32 {
        // SAFETY: as for set_stdio
        unsafe { (self.api.set_poll)(instance.0 as *mut c_void, Some(poll_trampoline as PollFn)) }
    }

    fn set_display(&self, instance: InstanceId) -> i32 {
        let Some(set_display_callback) = self.api.set_display_callback else {
            warn!("Display callback not supported by {:?}", self.path);
            return 0;
        };
        let table = {
            let mut slots = self.slots();
            let Some(slot) = slots.get_mut(&instance.0) else {
                error!("set_display on unknown instance {instance:?}");
                return codes::FATAL;
            };
            let table = slot
                .display
                .get_or_insert_with(|| Box::new(DisplayCallback::new()));
            std::ptr::from_mut::<DisplayCallback>(table)
        };
        // SAFETY: the table lives in the slot until delete_instance
        unsafe { set_display_callback(instance.0 as *mut c_void, table) }
    }

    fn supports_arg_encoding(&self) -> bool {
        self.api.set_arg_encoding.is_some()
    }

    fn set_arg_encoding(&self, instance: InstanceId, encoding: ArgEncoding) -> i32 {
        match self.api.set_arg_encoding {
            // SAFETY: plain value call on a live instance
            Some(set) => unsafe { set(instance.0 as *mut c_void, encoding as c_int) },
            None => codes::FATAL,
        }
    }

    fn init_with_args(&self, instance: InstanceId, args: &[CString]) -> i32 {
        let mut argv: Vec<*mut c_char> = args.iter().map(|a| a.as_ptr().cast_mut()).collect();
        // SAFETY: argv entries outlive the call and the engine does not write through them
        unsafe {
            (self.api.init_with_args)(
                instance.0 as *mut c_void,
                argv.len() as c_int,
                argv.as_mut_ptr(),
            )
        }
    }

    fn run_string(&self, instance: InstanceId, code: &[u8]) -> i32 {
        let handle = instance.0 as *mut c_void;
        if code.len() > MAX_RUN_CHUNK {
            if let Some(chunks) = self.api.run_string_chunks {
                return self.run_chunked(chunks, handle, code);
            }
            warn!(
                "Running {} bytes in one call, chunked entry points unavailable",
                code.len()
            );
        }
        let mut exit_code: c_int = 0;
        // SAFETY: pointer and length describe `code`
        unsafe {
            (self.api.run_string_with_length)(
                handle,
                code.as_ptr().cast(),
                code.len() as c_uint,
                0,
                &mut exit_code,
            )
        }
    }

    fn exit(&self, instance: InstanceId) -> i32 {
        // SAFETY: live instance
        unsafe { (self.api.exit)(instance.0 as *mut c_void) }
    }

    fn delete_instance(&self, instance: InstanceId) {
        // SAFETY: live instance; the slot is dropped only after the engine lets go of it
        unsafe { (self.api.delete_instance)(instance.0 as *mut c_void) };
        if self.slots().remove(&instance.0).is_none() {
            warn!("Deleted instance {instance:?} had no registered context");
        }
    }

    fn display_handle(&self, instance: InstanceId) -> Option<usize> {
        let slots = self.slots();
        let slot = slots.get(&instance.0)?;
        slot.display
            .as_ref()
            .map(|_| std::ptr::from_ref::<CallerContext>(&*slot.context) as usize)
    }
}

impl Drop for NativeEngine {
    fn drop(&mut self) {
        let leaked = self.slots().len();
        if leaked > 0 {
            warn!("Unloading {:?} with {leaked} live instance(s)", self.path);
        }
        debug!("Unloading {:?}", self.path);
    }
}

/// Runs a callback body, turning a panic into `fallback`
fn guarded(fallback: c_int, body: impl FnOnce() -> c_int) -> c_int {
    panic::catch_unwind(AssertUnwindSafe(body)).unwrap_or_else(|_| {
        error!("Panic inside engine callback");
        fallback
    })
}

/// # Safety
/// `handle` must be null or the caller handle registered in `new_instance`.
unsafe fn context<'a>(handle: *mut c_void) -> Option<&'a CallerContext> {
    // SAFETY: forwarded from the caller
    unsafe { handle.cast::<CallerContext>().cast_const().as_ref() }
}

unsafe extern "C" fn stdin_trampoline(handle: *mut c_void, buf: *mut c_char, len: c_int) -> c_int {
    guarded(0, || {
        // SAFETY: the engine passes back the handle given to new_instance
        let Some(ctx) = (unsafe { context(handle) }) else {
            return 0;
        };
        if buf.is_null() || len <= 0 {
            return 0;
        }
        // SAFETY: the engine owns `len` writable bytes at `buf`
        let buf = unsafe { std::slice::from_raw_parts_mut(buf.cast::<u8>(), len as usize) };
        ctx.callbacks.read_input(buf) as c_int
    })
}

unsafe extern "C" fn stdout_trampoline(handle: *mut c_void, data: *const c_char, len: c_int) -> c_int {
    guarded(len, || {
        // SAFETY: see stdin_trampoline
        let Some(ctx) = (unsafe { context(handle) }) else {
            return len;
        };
        if data.is_null() || len <= 0 {
            return len.max(0);
        }
        // SAFETY: the engine provides `len` readable bytes at `data`
        let data = unsafe { std::slice::from_raw_parts(data.cast::<u8>(), len as usize) };
        ctx.callbacks.write_output(data) as c_int
    })
}

unsafe extern "C" fn stderr_trampoline(handle: *mut c_void, data: *const c_char, len: c_int) -> c_int {
    guarded(len, || {
        // SAFETY: see stdin_trampoline
        let Some(ctx) = (unsafe { context(handle) }) else {
            return len;
        };
        if data.is_null() || len <= 0 {
            return len.max(0);
        }
        // SAFETY: see stdout_trampoline
        let data = unsafe { std::slice::from_raw_parts(data.cast::<u8>(), len as usize) };
        ctx.callbacks.write_error(data) as c_int
    })
}

unsafe extern "C" fn poll_trampoline(handle: *mut c_void) -> c_int {
    guarded(codes::POLL_STOP, || {
        // SAFETY: see stdin_trampoline
        match unsafe { context(handle) } {
            Some(ctx) => ctx.callbacks.poll(),
            None => codes::POLL_CONTINUE,
        }
    })
}

unsafe extern "C" fn display_device_noop(_handle: *mut c_void, _device: *mut c_void) -> c_int {
    0
}

unsafe extern "C" fn display_close(handle: *mut c_void, _device: *mut c_void) -> c_int {
    guarded(0, || {
        // SAFETY: display handle equals the caller handle
        if let Some(ctx) = unsafe { context(handle) } {
            ctx.set_frame(RawFrame::default());
        }
        0
    })
}

unsafe extern "C" fn display_presize(
    _handle: *mut c_void,
    _device: *mut c_void,
    _width: c_int,
    _height: c_int,
    _raster: c_int,
    _format: c_uint,
) -> c_int {
    0
}

unsafe extern "C" fn display_size(
    handle: *mut c_void,
    _device: *mut c_void,
    width: c_int,
    height: c_int,
    raster: c_int,
    format: c_uint,
    pimage: *mut c_uchar,
) -> c_int {
    guarded(0, || {
        // SAFETY: display handle equals the caller handle
        let Some(ctx) = (unsafe { context(handle) }) else {
            return 0;
        };
        let frame = RawFrame {
            ptr: pimage as usize,
            width: width.max(0) as u32,
            height: height.max(0) as u32,
            raster: raster.max(0) as u32,
            format,
        };
        ctx.set_frame(frame);
        ctx.callbacks.display(&DisplayEvent::Size {
            width: frame.width,
            height: frame.height,
            raster: frame.raster,
            format,
        })
    })
}

unsafe extern "C" fn display_page(
    handle: *mut c_void,
    _device: *mut c_void,
    copies: c_int,
    flush: c_int,
) -> c_int {
    guarded(0, || {
        // SAFETY: display handle equals the caller handle
        let Some(ctx) = (unsafe { context(handle) }) else {
            return 0;
        };
        // SAFETY: the raster stays allocated while the device is open
        match unsafe { ctx.frame().frame() } {
            Some(frame) => ctx.callbacks.display(&DisplayEvent::Page {
                frame,
                copies,
                flush: flush != 0,
            }),
            None => 0,
        }
    })
}

unsafe extern "C" fn display_update(
    handle: *mut c_void,
    _device: *mut c_void,
    x: c_int,
    y: c_int,
    w: c_int,
    h: c_int,
) -> c_int {
    guarded(0, || {
        // SAFETY: display handle equals the caller handle
        let Some(ctx) = (unsafe { context(handle) }) else {
            return 0;
        };
        // SAFETY: see display_page
        match unsafe { ctx.frame().frame() } {
            Some(frame) => ctx.callbacks.display(&DisplayEvent::Update {
                frame,
                x,
                y,
                width: w,
                height: h,
            }),
            None => 0,
        }
    })
}

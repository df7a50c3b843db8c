//! Interpreter engine boundary
//!
//! [`Engine`] is the narrow set of native entry points the session and
//! viewer drive. [`NativeEngine`] binds them from a loaded Ghostscript
//! library; tests substitute a scripted fake. Engines call back into
//! the host through [`EngineCallbacks`], possibly from a thread the host
//! does not control.

pub mod codes;
pub mod display;
mod native;
pub mod version;

use std::ffi::CString;
use std::sync::Arc;

use log::debug;

pub use display::{DisplayEvent, Frame};
pub use native::NativeEngine;
pub use version::{EngineSource, EngineVersion, License};

/// Opaque native instance pointer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InstanceId(pub usize);

/// Which stdio callbacks an instance routes to the host
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StdioChannels {
    pub input: bool,
    pub output: bool,
    pub error: bool,
}

impl StdioChannels {
    pub const ALL: Self = Self {
        input: true,
        output: true,
        error: true,
    };
}

impl Default for StdioChannels {
    fn default() -> Self {
        Self::ALL
    }
}

/// Encoding of the argument strings passed to `init_with_args`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum ArgEncoding {
    Local = 0,
    Utf8 = 1,
    Utf16Le = 2,
}

/// Host side of the callback surface
///
/// All methods may be invoked re-entrantly from inside a native call and
/// from a thread other than the caller's.
pub trait EngineCallbacks: Send + Sync {
    /// Fills `buf` with pending input; 0 signals end of input
    fn read_input(&self, buf: &mut [u8]) -> usize;

    /// Returns the number of bytes consumed, which is always `data.len()`
    fn write_output(&self, data: &[u8]) -> usize;

    fn write_error(&self, data: &[u8]) -> usize;

    /// [`codes::POLL_CONTINUE`] or [`codes::POLL_STOP`]
    fn poll(&self) -> i32;

    fn display(&self, _event: &DisplayEvent<'_>) -> i32 {
        0
    }
}

/// Native entry points, each returning the engine's signed status code
pub trait Engine: Send + Sync {
    /// Product revision, e.g. 10021 for 10.02.1
    fn revision(&self) -> u32;

    fn new_instance(&self, callbacks: Arc<dyn EngineCallbacks>) -> Result<InstanceId, i32>;

    fn set_stdio(&self, instance: InstanceId, channels: StdioChannels) -> i32;

    fn set_poll(&self, instance: InstanceId) -> i32;

    /// Routes the display device to [`EngineCallbacks::display`]
    fn set_display(&self, instance: InstanceId) -> i32;

    fn supports_arg_encoding(&self) -> bool;

    fn set_arg_encoding(&self, instance: InstanceId, encoding: ArgEncoding) -> i32;

    fn init_with_args(&self, instance: InstanceId, args: &[CString]) -> i32;

    fn run_string(&self, instance: InstanceId, code: &[u8]) -> i32;

    fn exit(&self, instance: InstanceId) -> i32;

    fn delete_instance(&self, instance: InstanceId);

    /// Value for `-sDisplayHandle`, when the display device is wired
    fn display_handle(&self, instance: InstanceId) -> Option<usize>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ownership {
    /// Created for one owner and released with it
    Owned,
    /// Supplied by the caller and shared with other sessions
    Shared,
}

/// Engine plus the ownership tag decided at construction
#[derive(Clone)]
pub struct EngineRef {
    engine: Arc<dyn Engine>,
    ownership: Ownership,
}

impl EngineRef {
    pub fn owned(engine: Arc<dyn Engine>) -> Self {
        Self {
            engine,
            ownership: Ownership::Owned,
        }
    }

    pub fn shared(engine: Arc<dyn Engine>) -> Self {
        Self {
            engine,
            ownership: Ownership::Shared,
        }
    }

    /// Loads a native engine that belongs to the returned reference
    pub fn load(source: &EngineSource) -> crate::Result<Self> {
        Ok(Self::owned(Arc::new(NativeEngine::load(source)?)))
    }

    #[must_use]
    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }
}

impl std::ops::Deref for EngineRef {
    type Target = dyn Engine;

    fn deref(&self) -> &Self::Target {
        self.engine.as_ref()
    }
}

impl std::fmt::Debug for EngineRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRef")
            .field("revision", &self.engine.revision())
            .field("ownership", &self.ownership)
            .finish()
    }
}

impl Drop for EngineRef {
    fn drop(&mut self) {
        if self.ownership == Ownership::Owned && Arc::strong_count(&self.engine) == 1 {
            debug!("Releasing owned engine (revision {})", self.engine.revision());
        }
    }
}

//! In-process driver for the Ghostscript interpreter
//!
//! [`Processor`] runs one batch job with progress events and cooperative
//! cancellation. [`Viewer`] keeps a document open and renders pages on
//! demand through the display device.

pub mod bridge;
pub mod cancel;
pub mod engine;
pub mod error;
pub mod events;
pub mod interpreter;
pub mod logging;
pub mod processor;
pub mod settings;
pub mod stdio;
pub mod viewer;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use cancel::CancelToken;
pub use engine::{Engine, EngineRef, EngineSource, NativeEngine, Ownership};
pub use error::{Error, Result};
pub use interpreter::{Interpreter, Reply};
pub use processor::{Processor, ProcessorEvent, RunOutcome, SessionState};
pub use stdio::StdioHandler;
pub use viewer::{Viewer, ViewerEvent, ViewerOptions, ViewerState};

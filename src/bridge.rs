//! Adapter from the engine's callback surface to the stdio bridge,
//! the stop token and an optional display sink

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::cancel::CancelToken;
use crate::engine::{DisplayEvent, EngineCallbacks, codes};
use crate::processor::parser::Channel;
use crate::stdio::StdioBridge;

/// Receives display device events for one instance
pub trait DisplaySink: Send + Sync {
    fn on_display(&self, event: &DisplayEvent<'_>) -> i32;
}

pub struct CallbackBridge {
    stdio: Arc<StdioBridge>,
    cancel: CancelToken,
    display: Option<Arc<dyn DisplaySink>>,
    page_shown: AtomicBool,
}

impl CallbackBridge {
    pub fn new(
        stdio: Arc<StdioBridge>,
        cancel: CancelToken,
        display: Option<Arc<dyn DisplaySink>>,
    ) -> Self {
        Self {
            stdio,
            cancel,
            display,
            page_shown: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn stdio(&self) -> &Arc<StdioBridge> {
        &self.stdio
    }

    /// True once the display device has completed a page since the last reset
    #[must_use]
    pub fn page_shown(&self) -> bool {
        self.page_shown.load(Ordering::Acquire)
    }

    pub fn reset_page_shown(&self) {
        self.page_shown.store(false, Ordering::Release);
    }
}

impl EngineCallbacks for CallbackBridge {
    fn read_input(&self, buf: &mut [u8]) -> usize {
        self.stdio.read_input(buf)
    }

    fn write_output(&self, data: &[u8]) -> usize {
        self.stdio.write(Channel::Output, data)
    }

    fn write_error(&self, data: &[u8]) -> usize {
        self.stdio.write(Channel::Error, data)
    }

    fn poll(&self) -> i32 {
        if self.cancel.is_cancelled() {
            codes::POLL_STOP
        } else {
            codes::POLL_CONTINUE
        }
    }

    fn display(&self, event: &DisplayEvent<'_>) -> i32 {
        if matches!(event, DisplayEvent::Page { .. }) {
            self.page_shown.store(true, Ordering::Release);
        }
        self.display
            .as_ref()
            .map_or(0, |sink| sink.on_display(event))
    }
}

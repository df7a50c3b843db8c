//! Long-lived interpreter instance
//!
//! Unlike [`Processor`](crate::processor::Processor), which performs one
//! batch run, an [`Interpreter`] keeps a single native instance alive and
//! accepts repeated command strings. The viewer renders pages this way.

use std::sync::Arc;

use log::{debug, error, warn};

use crate::bridge::{CallbackBridge, DisplaySink};
use crate::cancel::CancelToken;
use crate::engine::codes::{is_error, is_error_ignore_quit, is_fatal};
use crate::engine::{ArgEncoding, EngineCallbacks, EngineRef, InstanceId, StdioChannels};
use crate::events::Observers;
use crate::processor::ProcessorEvent;
use crate::processor::encode_args;
use crate::stdio::{StdioBridge, StdioHandler};
use crate::{Error, Result};

/// Result of one [`Interpreter::run`] call
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    /// Engine status; PostScript errors are negative but not fatal
    pub code: i32,
    /// Stdout text produced while the command ran
    pub stdout: String,
}

impl Reply {
    #[must_use]
    pub fn is_error(&self) -> bool {
        is_error_ignore_quit(self.code)
    }
}

pub struct Interpreter {
    engine: EngineRef,
    instance: InstanceId,
    callbacks: Arc<CallbackBridge>,
    events: Arc<Observers<ProcessorEvent>>,
    cancel: CancelToken,
    initialized: bool,
}

impl Interpreter {
    /// Creates an instance with stdio, poll and (when given) display wired
    pub fn new(
        engine: EngineRef,
        stdio: Option<Arc<dyn StdioHandler>>,
        display: Option<Arc<dyn DisplaySink>>,
    ) -> Result<Self> {
        let events = Arc::new(Observers::new());
        let cancel = CancelToken::new();
        let bridge = Arc::new(StdioBridge::new(
            stdio,
            StdioChannels::ALL,
            Arc::clone(&events),
        ));
        let wants_display = display.is_some();
        let callbacks = Arc::new(CallbackBridge::new(bridge, cancel.clone(), display));

        let instance = engine
            .new_instance(Arc::clone(&callbacks) as Arc<dyn EngineCallbacks>)
            .map_err(|code| Error::call_failed("gsapi_new_instance", code, String::new()))?;

        // From here on Drop releases the instance
        let interpreter = Self {
            engine,
            instance,
            callbacks,
            events,
            cancel,
            initialized: false,
        };

        let code = interpreter
            .engine
            .set_stdio(instance, StdioChannels::ALL);
        interpreter.check("gsapi_set_stdio", code)?;
        let code = interpreter.engine.set_poll(instance);
        interpreter.check("gsapi_set_poll", code)?;
        if wants_display {
            let code = interpreter.engine.set_display(instance);
            interpreter.check("gsapi_set_display_callback", code)?;
        }
        debug!("Interpreter instance {instance:?} ready");
        Ok(interpreter)
    }

    /// Initializes the engine; element 0 of `args` is a program-name placeholder
    pub fn init_args<S: AsRef<str>>(&mut self, args: &[S]) -> Result<()> {
        let utf8 = self.engine.supports_arg_encoding();
        let argv = encode_args(args, utf8)?;
        if utf8 {
            let code = self.engine.set_arg_encoding(self.instance, ArgEncoding::Utf8);
            if is_error(code) {
                warn!("gsapi_set_arg_encoding failed with {code}");
            }
        }
        let code = self.engine.init_with_args(self.instance, &argv);
        self.check("gsapi_init_with_args", code)?;
        self.initialized = true;
        Ok(())
    }

    /// Executes PostScript in the live instance. Only fatal codes are
    /// errors; ordinary PostScript errors come back in the reply.
    ///
    /// Each run starts with the stop token cleared, so a stop only
    /// interrupts the command in flight.
    pub fn run(&self, code: impl AsRef<[u8]>) -> Result<Reply> {
        self.cancel.reset();
        let stdio = self.callbacks.stdio();
        stdio.begin_capture();
        let status = self.engine.run_string(self.instance, code.as_ref());
        let stdout = stdio.end_capture();
        if is_fatal(status) {
            error!("gsapi_run_string failed fatally with {status}");
            return Err(Error::call_failed(
                "gsapi_run_string",
                status,
                stdio.transcript(),
            ));
        }
        if is_error_ignore_quit(status) {
            debug!("gsapi_run_string returned {status}");
        }
        Ok(Reply {
            code: status,
            stdout,
        })
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    #[must_use]
    pub fn revision(&self) -> u32 {
        self.engine.revision()
    }

    /// Value for `-sDisplayHandle` once display callbacks are wired
    #[must_use]
    pub fn display_handle(&self) -> Option<usize> {
        self.engine.display_handle(self.instance)
    }

    #[must_use]
    pub fn page_shown(&self) -> bool {
        self.callbacks.page_shown()
    }

    pub fn reset_page_shown(&self) {
        self.callbacks.reset_page_shown();
    }

    pub fn subscribe(&self, subscriber: impl Fn(&ProcessorEvent) + Send + Sync + 'static) {
        self.events.subscribe(subscriber);
    }

    /// Stops the command currently running; the next `run` clears it
    #[must_use]
    pub fn stop_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    #[must_use]
    pub fn transcript(&self) -> String {
        self.callbacks.stdio().transcript()
    }

    fn check(&self, call: &'static str, code: i32) -> Result<()> {
        if is_error_ignore_quit(code) {
            error!("{call} failed with {code}");
            return Err(Error::call_failed(call, code, self.transcript()));
        }
        Ok(())
    }
}

impl Drop for Interpreter {
    fn drop(&mut self) {
        let code = self.engine.exit(self.instance);
        if is_error_ignore_quit(code) {
            warn!("gsapi_exit failed with {code} on instance {:?}", self.instance);
        }
        self.engine.delete_instance(self.instance);
        debug!(
            "Interpreter instance {:?} released ({:?} engine)",
            self.instance,
            self.engine.ownership()
        );
    }
}

impl std::fmt::Debug for Interpreter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interpreter")
            .field("instance", &self.instance)
            .field("initialized", &self.initialized)
            .finish()
    }
}

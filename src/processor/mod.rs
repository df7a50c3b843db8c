//! One-shot interpreter session
//!
//! A [`Processor`] drives a single batch run: create an instance, wire the
//! stdio and poll callbacks, initialize the engine with the caller's
//! switches (which runs the job), then exit and delete the instance on
//! every path. Progress lines and stderr text are raised as
//! [`ProcessorEvent`]s while the run is in flight.

pub mod parser;

use std::ffi::CString;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, error, info, warn};

use crate::bridge::CallbackBridge;
use crate::cancel::CancelToken;
use crate::engine::codes::{is_error, is_error_ignore_quit, is_interrupt};
use crate::engine::{ArgEncoding, Engine, EngineRef, EngineSource, InstanceId, StdioChannels};
use crate::events::Observers;
use crate::stdio::{StdioBridge, StdioHandler};
use crate::{Error, Result};

pub use parser::{Channel, LineBuffer, OutputParser, ProgressState};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProcessorEvent {
    Started,
    /// `total` is `None` until the engine announces the page range
    PageProgress { current: u32, total: Option<u32> },
    /// One line of stderr text, verbatim
    ProcessingError(String),
    Completed,
}

/// Position in the session lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Idle = 0,
    InstanceCreated,
    CallbacksWired,
    Initializing,
    Running,
    Interrupted,
    Failed,
    Exited,
    Deleted,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::InstanceCreated,
            2 => Self::CallbacksWired,
            3 => Self::Initializing,
            4 => Self::Running,
            5 => Self::Interrupted,
            6 => Self::Failed,
            7 => Self::Exited,
            8 => Self::Deleted,
            _ => Self::Idle,
        }
    }
}

/// How a run ended when it did not fail
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    /// A stop request was observed at a poll checkpoint
    Interrupted,
}

/// Exits and deletes the instance on every path out of a run
struct InstanceGuard<'a> {
    engine: &'a dyn Engine,
    instance: InstanceId,
    exited: bool,
    deleted: bool,
}

impl<'a> InstanceGuard<'a> {
    fn new(engine: &'a dyn Engine, instance: InstanceId) -> Self {
        Self {
            engine,
            instance,
            exited: false,
            deleted: false,
        }
    }

    fn exit(&mut self) -> i32 {
        self.exited = true;
        self.engine.exit(self.instance)
    }

    fn delete(&mut self) {
        self.deleted = true;
        self.engine.delete_instance(self.instance);
    }
}

impl Drop for InstanceGuard<'_> {
    fn drop(&mut self) {
        if !self.exited {
            warn!("Instance {:?} dropped without exit", self.instance);
            self.exit();
        }
        if !self.deleted {
            self.delete();
        }
    }
}

pub struct Processor {
    engine: EngineRef,
    events: Arc<Observers<ProcessorEvent>>,
    cancel: CancelToken,
    state: AtomicU8,
    used: AtomicBool,
    stdio: Mutex<Option<Arc<StdioBridge>>>,
}

impl Processor {
    /// Session over an engine the caller keeps ownership of
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self::with_engine(EngineRef::shared(engine))
    }

    /// Loads an engine that lives and dies with this processor
    pub fn load(source: &EngineSource) -> Result<Self> {
        Ok(Self::with_engine(EngineRef::load(source)?))
    }

    pub fn with_engine(engine: EngineRef) -> Self {
        Self {
            engine,
            events: Arc::new(Observers::new()),
            cancel: CancelToken::new(),
            state: AtomicU8::new(SessionState::Idle as u8),
            used: AtomicBool::new(false),
            stdio: Mutex::new(None),
        }
    }

    pub fn subscribe(&self, subscriber: impl Fn(&ProcessorEvent) + Send + Sync + 'static) {
        self.events.subscribe(subscriber);
    }

    pub fn events(&self) -> flume::Receiver<ProcessorEvent> {
        self.events.channel()
    }

    /// Token that stops this session when cancelled from any thread
    #[must_use]
    pub fn stop_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Takes effect at the engine's next poll checkpoint
    pub fn stop_processing(&self) {
        info!("Stop requested");
        self.cancel.cancel();
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(
            self.state(),
            SessionState::CallbacksWired | SessionState::Initializing | SessionState::Running
        )
    }

    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.is_running() && self.cancel.is_cancelled()
    }

    #[must_use]
    pub fn progress(&self) -> ProgressState {
        self.current_stdio()
            .map(|stdio| stdio.progress())
            .unwrap_or_default()
    }

    /// Stdout and stderr text captured during the run
    #[must_use]
    pub fn collected_output(&self) -> String {
        self.current_stdio()
            .map(|stdio| stdio.transcript())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn engine(&self) -> &EngineRef {
        &self.engine
    }

    fn current_stdio(&self) -> Option<Arc<StdioBridge>> {
        self.stdio
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_state(&self, state: SessionState) {
        debug!("Session state -> {state:?}");
        self.state.store(state as u8, Ordering::Release);
    }

    /// Runs the engine once with `args`, element 0 being a program-name
    /// placeholder. Blocks until the engine finishes, fails or stops.
    pub fn process<S: AsRef<str>>(
        &self,
        args: &[S],
        stdio: Option<Arc<dyn StdioHandler>>,
    ) -> Result<RunOutcome> {
        if args.len() < 3 {
            return Err(Error::invalid_arguments(format!(
                "expected at least 3 arguments, got {}",
                args.len()
            )));
        }
        let argv = encode_args(args, self.engine.supports_arg_encoding())?;
        if self.used.swap(true, Ordering::AcqRel) {
            return Err(Error::SessionAlreadyRun);
        }

        let stdio = Arc::new(StdioBridge::new(
            stdio,
            StdioChannels::ALL,
            Arc::clone(&self.events),
        ));
        *self.stdio.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&stdio));
        let callbacks = Arc::new(CallbackBridge::new(
            Arc::clone(&stdio),
            self.cancel.clone(),
            None,
        ));

        let instance = match self.engine.new_instance(callbacks) {
            Ok(instance) => instance,
            Err(code) => {
                self.set_state(SessionState::Failed);
                error!("gsapi_new_instance failed with {code}");
                return Err(Error::call_failed(
                    "gsapi_new_instance",
                    code,
                    stdio.transcript(),
                ));
            }
        };
        self.set_state(SessionState::InstanceCreated);

        let mut guard = InstanceGuard::new(&*self.engine, instance);
        let result = self.drive(instance, &argv, &stdio);

        let exit_code = guard.exit();
        self.set_state(SessionState::Exited);
        guard.delete();
        self.set_state(SessionState::Deleted);
        self.events.emit(&ProcessorEvent::Completed);

        match result {
            Err(e) => {
                if is_error_ignore_quit(exit_code) {
                    warn!("gsapi_exit failed with {exit_code} after an earlier error");
                }
                Err(e)
            }
            Ok(_) if is_error_ignore_quit(exit_code) => {
                error!("gsapi_exit failed with {exit_code}");
                Err(Error::call_failed(
                    "gsapi_exit",
                    exit_code,
                    stdio.transcript(),
                ))
            }
            Ok(outcome) => {
                info!("Run finished: {outcome:?}");
                Ok(outcome)
            }
        }
    }

    fn drive(
        &self,
        instance: InstanceId,
        argv: &[CString],
        stdio: &StdioBridge,
    ) -> Result<RunOutcome> {
        let code = self.engine.set_stdio(instance, stdio.channels());
        self.check("gsapi_set_stdio", code, stdio)?;
        let code = self.engine.set_poll(instance);
        self.check("gsapi_set_poll", code, stdio)?;
        self.set_state(SessionState::CallbacksWired);
        self.events.emit(&ProcessorEvent::Started);

        self.set_state(SessionState::Initializing);
        if self.engine.supports_arg_encoding() {
            let code = self.engine.set_arg_encoding(instance, ArgEncoding::Utf8);
            if is_error(code) {
                warn!("gsapi_set_arg_encoding failed with {code}, using local encoding");
            }
        }

        self.set_state(SessionState::Running);
        let code = self.engine.init_with_args(instance, argv);

        if is_interrupt(code) || (self.cancel.is_cancelled() && is_error_ignore_quit(code)) {
            info!("Run interrupted (code {code})");
            self.set_state(SessionState::Interrupted);
            return Ok(RunOutcome::Interrupted);
        }
        self.check("gsapi_init_with_args", code, stdio)?;
        Ok(RunOutcome::Completed)
    }

    fn check(&self, call: &'static str, code: i32, stdio: &StdioBridge) -> Result<()> {
        if is_error_ignore_quit(code) {
            error!("{call} failed with {code}");
            self.set_state(SessionState::Failed);
            return Err(Error::call_failed(call, code, stdio.transcript()));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("engine", &self.engine)
            .field("state", &self.state())
            .finish()
    }
}

/// Converts switches for the native boundary. Without UTF-8 argument
/// support only ASCII survives the round trip.
pub(crate) fn encode_args<S: AsRef<str>>(args: &[S], utf8: bool) -> Result<Vec<CString>> {
    args.iter()
        .map(|arg| {
            let arg = arg.as_ref();
            if !utf8 && !arg.is_ascii() {
                return Err(Error::invalid_arguments(format!(
                    "{arg:?} cannot be passed to an engine without UTF-8 arguments"
                )));
            }
            CString::new(arg)
                .map_err(|_| Error::invalid_arguments(format!("{arg:?} contains a NUL byte")))
        })
        .collect()
}

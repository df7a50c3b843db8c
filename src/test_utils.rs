//! Scripted engine for exercising sessions and the viewer without a
//! native library

use std::collections::{HashMap, HashSet};
use std::ffi::CString;
use std::sync::{Arc, Mutex, PoisonError};

use crate::engine::codes;
use crate::engine::display::format;
use crate::engine::{
    ArgEncoding, DisplayEvent, Engine, EngineCallbacks, Frame, InstanceId, StdioChannels,
};

/// One recorded entry-point invocation
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    NewInstance,
    SetStdio(StdioChannels),
    SetPoll,
    SetDisplay,
    SetArgEncoding(ArgEncoding),
    InitWithArgs(Vec<String>),
    RunString(String),
    Exit,
    DeleteInstance,
}

type CheckpointHook = Arc<dyn Fn(usize) + Send + Sync>;

#[derive(Default)]
struct FakeState {
    calls: Vec<Call>,
    callbacks: HashMap<usize, Arc<dyn EngineCallbacks>>,
    display: HashSet<usize>,
    next_instance: usize,
}

/// Call-counting [`Engine`] that drives the registered callbacks the way
/// the native library would
///
/// `init_with_args` writes the scripted stdout then stderr chunks and
/// then polls once per checkpoint. `run_string` polls the same way, then
/// answers commands that contain a scripted needle and, when the display
/// is wired, emits a size and a page event for any command containing
/// `showpage`.
pub struct FakeEngine {
    revision: u32,
    arg_encoding: bool,
    new_instance_code: Option<i32>,
    init_code: i32,
    exit_code: i32,
    stdout: Vec<String>,
    stderr: Vec<String>,
    checkpoints: usize,
    replies: Vec<(String, String)>,
    run_codes: Vec<(String, i32)>,
    page_size: (u32, u32),
    on_checkpoint: Mutex<Option<CheckpointHook>>,
    state: Mutex<FakeState>,
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeEngine {
    pub fn new() -> Self {
        Self {
            revision: 10021,
            arg_encoding: true,
            new_instance_code: None,
            init_code: 0,
            exit_code: 0,
            stdout: Vec::new(),
            stderr: Vec::new(),
            checkpoints: 0,
            replies: Vec::new(),
            run_codes: Vec::new(),
            page_size: (4, 2),
            on_checkpoint: Mutex::new(None),
            state: Mutex::new(FakeState::default()),
        }
    }

    pub fn with_revision(mut self, revision: u32) -> Self {
        self.revision = revision;
        self
    }

    pub fn without_arg_encoding(mut self) -> Self {
        self.arg_encoding = false;
        self
    }

    pub fn failing_new_instance(mut self, code: i32) -> Self {
        self.new_instance_code = Some(code);
        self
    }

    pub fn with_init_code(mut self, code: i32) -> Self {
        self.init_code = code;
        self
    }

    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = code;
        self
    }

    /// Stdout chunk written during `init_with_args`
    pub fn with_stdout(mut self, chunk: &str) -> Self {
        self.stdout.push(chunk.to_string());
        self
    }

    /// Stderr chunk written during `init_with_args`
    pub fn with_stderr(mut self, chunk: &str) -> Self {
        self.stderr.push(chunk.to_string());
        self
    }

    /// Number of poll checkpoints `init_with_args` and each `run_string` pass through
    pub fn with_checkpoints(mut self, count: usize) -> Self {
        self.checkpoints = count;
        self
    }

    /// Stdout written when a `run_string` command contains `needle`
    pub fn reply_to(mut self, needle: &str, reply: &str) -> Self {
        self.replies.push((needle.to_string(), reply.to_string()));
        self
    }

    /// Status returned when a `run_string` command contains `needle`
    pub fn run_code(mut self, needle: &str, code: i32) -> Self {
        self.run_codes.push((needle.to_string(), code));
        self
    }

    pub fn with_page_size(mut self, width: u32, height: u32) -> Self {
        self.page_size = (width, height);
        self
    }

    /// Runs `hook` with the checkpoint index before each poll
    pub fn on_checkpoint(&self, hook: impl Fn(usize) + Send + Sync + 'static) {
        *self
            .on_checkpoint
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(hook));
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, call: Call) {
        self.state().calls.push(call);
    }

    fn callbacks(&self, instance: InstanceId) -> Option<Arc<dyn EngineCallbacks>> {
        self.state().callbacks.get(&instance.0).cloned()
    }

    #[must_use]
    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    #[must_use]
    pub fn call_count(&self) -> usize {
        self.state().calls.len()
    }

    #[must_use]
    pub fn count(&self, call: &Call) -> usize {
        self.state().calls.iter().filter(|c| *c == call).count()
    }

    /// Commands passed to `run_string`, in order
    #[must_use]
    pub fn runs(&self) -> Vec<String> {
        self.state()
            .calls
            .iter()
            .filter_map(|call| match call {
                Call::RunString(code) => Some(code.clone()),
                _ => None,
            })
            .collect()
    }

    /// Arguments of the most recent `init_with_args`
    #[must_use]
    pub fn init_args(&self) -> Option<Vec<String>> {
        self.state().calls.iter().rev().find_map(|call| match call {
            Call::InitWithArgs(args) => Some(args.clone()),
            _ => None,
        })
    }

    /// Instances created and not yet deleted
    #[must_use]
    pub fn live_instances(&self) -> usize {
        self.state().callbacks.len()
    }

    /// `false` once a poll asks the engine to stop
    fn pass_checkpoints(&self, callbacks: &dyn EngineCallbacks) -> bool {
        let hook = self
            .on_checkpoint
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for checkpoint in 0..self.checkpoints {
            if let Some(hook) = &hook {
                hook(checkpoint);
            }
            if callbacks.poll() < 0 {
                return false;
            }
        }
        true
    }

    fn emit_page(&self, callbacks: &dyn EngineCallbacks) {
        let (width, height) = self.page_size;
        let raster = (width * 3).next_multiple_of(4);
        let data = vec![0x7f; (raster * height) as usize];
        callbacks.display(&DisplayEvent::Size {
            width,
            height,
            raster,
            format: format::VIEWER,
        });
        let frame = Frame {
            data: &data,
            width,
            height,
            raster,
            format: format::VIEWER,
        };
        callbacks.display(&DisplayEvent::Page {
            frame,
            copies: 1,
            flush: true,
        });
    }
}

impl Engine for FakeEngine {
    fn revision(&self) -> u32 {
        self.revision
    }

    fn new_instance(&self, callbacks: Arc<dyn EngineCallbacks>) -> Result<InstanceId, i32> {
        self.record(Call::NewInstance);
        if let Some(code) = self.new_instance_code {
            return Err(code);
        }
        let mut state = self.state();
        state.next_instance += 1;
        let id = state.next_instance;
        state.callbacks.insert(id, callbacks);
        Ok(InstanceId(id))
    }

    fn set_stdio(&self, _instance: InstanceId, channels: StdioChannels) -> i32 {
        self.record(Call::SetStdio(channels));
        0
    }

    fn set_poll(&self, _instance: InstanceId) -> i32 {
        self.record(Call::SetPoll);
        0
    }

    fn set_display(&self, instance: InstanceId) -> i32 {
        self.record(Call::SetDisplay);
        self.state().display.insert(instance.0);
        0
    }

    fn supports_arg_encoding(&self) -> bool {
        self.arg_encoding
    }

    fn set_arg_encoding(&self, _instance: InstanceId, encoding: ArgEncoding) -> i32 {
        self.record(Call::SetArgEncoding(encoding));
        0
    }

    fn init_with_args(&self, instance: InstanceId, args: &[CString]) -> i32 {
        self.record(Call::InitWithArgs(
            args.iter()
                .map(|arg| arg.to_string_lossy().into_owned())
                .collect(),
        ));
        let Some(callbacks) = self.callbacks(instance) else {
            return codes::FATAL;
        };
        for chunk in &self.stdout {
            callbacks.write_output(chunk.as_bytes());
        }
        for chunk in &self.stderr {
            callbacks.write_error(chunk.as_bytes());
        }
        if !self.pass_checkpoints(callbacks.as_ref()) {
            return codes::INTERRUPT;
        }
        self.init_code
    }

    fn run_string(&self, instance: InstanceId, code: &[u8]) -> i32 {
        let text = String::from_utf8_lossy(code).into_owned();
        self.record(Call::RunString(text.clone()));
        let Some(callbacks) = self.callbacks(instance) else {
            return codes::FATAL;
        };
        if !self.pass_checkpoints(callbacks.as_ref()) {
            return codes::INTERRUPT;
        }
        for (needle, reply) in &self.replies {
            if text.contains(needle.as_str()) {
                callbacks.write_output(reply.as_bytes());
            }
        }
        if text.contains("showpage") && self.state().display.contains(&instance.0) {
            self.emit_page(callbacks.as_ref());
        }
        self.run_codes
            .iter()
            .find(|(needle, _)| text.contains(needle.as_str()))
            .map_or(0, |(_, code)| *code)
    }

    fn exit(&self, _instance: InstanceId) -> i32 {
        self.record(Call::Exit);
        self.exit_code
    }

    fn delete_instance(&self, instance: InstanceId) {
        self.record(Call::DeleteInstance);
        let mut state = self.state();
        state.callbacks.remove(&instance.0);
        state.display.remove(&instance.0);
    }

    fn display_handle(&self, instance: InstanceId) -> Option<usize> {
        self.state()
            .display
            .contains(&instance.0)
            .then_some(0x1000 + instance.0)
    }
}

impl std::fmt::Debug for FakeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeEngine")
            .field("revision", &self.revision)
            .field("calls", &self.call_count())
            .finish()
    }
}

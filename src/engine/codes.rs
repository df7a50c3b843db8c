//! Status codes returned by the interpreter's native entry points

/// Run was interrupted by the poll callback
pub const INTERRUPT: i32 = -6;
/// Unrecoverable interpreter failure
pub const FATAL: i32 = -100;
/// Normal termination via the `quit` operator
pub const QUIT: i32 = -101;
/// Interpreter exited while processing arguments
pub const INTERPRETER_EXIT: i32 = -102;
/// Interpreter wants more input to finish a `run_string` sequence
pub const NEED_INPUT: i32 = -106;

/// Poll result: keep going
pub const POLL_CONTINUE: i32 = 0;
/// Poll result: abort the current run
pub const POLL_STOP: i32 = -1;

#[inline]
#[must_use]
pub fn is_error(code: i32) -> bool {
    code < 0
}

/// Quit is how a successful `-c quit` style run ends, so it does not count
#[inline]
#[must_use]
pub fn is_error_ignore_quit(code: i32) -> bool {
    code < 0 && code != QUIT
}

#[inline]
#[must_use]
pub fn is_interrupt(code: i32) -> bool {
    code == INTERRUPT
}

/// Codes after which the instance can no longer accept commands
#[inline]
#[must_use]
pub fn is_fatal(code: i32) -> bool {
    code == FATAL || code == INTERPRETER_EXIT
}

//! Structured diagnostics for the allocator core.
//!
//! All log output funnels through a single **backend** function pointer.
//! There is no default destination: until an embedder calls
//! [`register_backend`], every log line is silently dropped. This keeps the
//! crate usable under `no_std` with no assumption about where diagnostic text
//! should go (a serial port, a ring buffer, `eprintln!` in a hosted test).
//!
//! # Backend contract
//!
//! The backend receives the pre-formatted arguments for a single log line and
//! is responsible for writing the text and appending its own line terminator.

use core::fmt;
use core::sync::atomic::{AtomicPtr, AtomicU8, Ordering};

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl Level {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Level::Error,
            1 => Level::Warn,
            2 => Level::Info,
            3 => Level::Debug,
            _ => Level::Trace,
        }
    }
}

static CURRENT_LEVEL: AtomicU8 = AtomicU8::new(Level::Info as u8);

#[inline(always)]
fn is_enabled(level: Level) -> bool {
    (level as u8) <= CURRENT_LEVEL.load(Ordering::Relaxed)
}

/// Signature of a diagnostics backend.
///
/// The backend must write the formatted text and a trailing newline in one
/// shot, so log lines from different threads do not interleave.
pub type Backend = fn(fmt::Arguments<'_>);

/// Stored as a raw pointer; `null` means "no backend installed, drop the line".
static BACKEND: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

#[inline]
fn dispatch(args: fmt::Arguments<'_>) {
    let ptr = BACKEND.load(Ordering::Acquire);
    if ptr.is_null() {
        return;
    }
    // SAFETY: `register_backend` only ever stores valid `Backend` fn pointers,
    // which are the same size as `*mut ()` on every target we support.
    let backend: Backend = unsafe { core::mem::transmute(ptr) };
    backend(args);
}

/// Install a backend, replacing the no-op default.
pub fn register_backend(backend: Backend) {
    BACKEND.store(backend as *mut (), Ordering::Release);
}

/// Remove any installed backend, reverting to silent drop.
pub fn clear_backend() {
    BACKEND.store(core::ptr::null_mut(), Ordering::Release);
}

pub fn set_level(level: Level) {
    CURRENT_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn get_level() -> Level {
    Level::from_raw(CURRENT_LEVEL.load(Ordering::Relaxed))
}

pub fn is_enabled_level(level: Level) -> bool {
    is_enabled(level)
}

/// Emit a formatted log line at the given level. Dropped if filtered out or
/// if no backend is installed.
pub fn log_args(level: Level, args: fmt::Arguments<'_>) {
    if !is_enabled(level) {
        return;
    }
    dispatch(args);
}

#[macro_export]
macro_rules! diag {
    ($level:expr, $($arg:tt)*) => {{
        $crate::diag::log_args($level, ::core::format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! diag_error {
    ($($arg:tt)*) => {
        $crate::diag::log_args($crate::diag::Level::Error, ::core::format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! diag_warn {
    ($($arg:tt)*) => {
        $crate::diag::log_args($crate::diag::Level::Warn, ::core::format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! diag_info {
    ($($arg:tt)*) => {
        $crate::diag::log_args($crate::diag::Level::Info, ::core::format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! diag_debug {
    ($($arg:tt)*) => {
        $crate::diag::log_args($crate::diag::Level::Debug, ::core::format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! diag_trace {
    ($($arg:tt)*) => {
        $crate::diag::log_args($crate::diag::Level::Trace, ::core::format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering as O};

    static HITS: AtomicUsize = AtomicUsize::new(0);

    fn counting_backend(_args: fmt::Arguments<'_>) {
        HITS.fetch_add(1, O::Relaxed);
    }

    #[test]
    fn silent_until_backend_registered() {
        clear_backend();
        set_level(Level::Trace);
        diag_info!("no backend yet");
        assert_eq!(HITS.load(O::Relaxed), 0);

        register_backend(counting_backend);
        diag_info!("now it goes somewhere");
        assert_eq!(HITS.load(O::Relaxed), 1);
        clear_backend();
    }

    #[test]
    fn level_filtering() {
        clear_backend();
        register_backend(counting_backend);
        let before = HITS.load(O::Relaxed);
        set_level(Level::Warn);
        diag_debug!("filtered out");
        assert_eq!(HITS.load(O::Relaxed), before);
        diag_warn!("passes the filter");
        assert_eq!(HITS.load(O::Relaxed), before + 1);
        clear_backend();
        set_level(Level::Info);
    }
}

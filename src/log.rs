use std::fs::File;
use std::io::Write as _;
use std::os::fd::{FromRawFd, RawFd};
use std::sync::Mutex;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Panic,
    Fatal,
    Error,
    Warning,
    Info,
    Debug,
}

impl Level {
    fn as_str(self) -> &'static str {
        match self {
            Level::Panic => "panic",
            Level::Fatal => "fatal",
            Level::Error => "error",
            Level::Warning => "warning",
            Level::Info => "info",
            Level::Debug => "debug",
        }
    }
}

#[derive(Serialize)]
struct LogRecord<'a> {
    level: &'a str,
    msg: String,
}

/// Structured log sink writing one JSON object per line to the descriptor
/// named by `_LIBCONTAINER_LOGPIPE`. Absent by default, in which case log
/// calls are no-ops.
pub struct LogSink(Option<Mutex<File>>);

impl LogSink {
    pub fn disabled() -> Self {
        Self(None)
    }

    /// Opens the log sink from a raw, already-duplicated file descriptor
    /// inherited from the manager.
    ///
    /// # Safety
    /// `fd` must be a valid, open file descriptor owned by the caller (it
    /// is consumed).
    pub unsafe fn from_raw_fd(fd: RawFd) -> Self {
        Self(Some(Mutex::new(File::from_raw_fd(fd))))
    }

    pub fn log(&self, level: Level, target: &str, line: u32, text: &str) {
        let Some(file) = &self.0 else { return };
        let record = LogRecord {
            level: level.as_str(),
            msg: format!("{target}:{line} {text}"),
        };
        let Ok(mut line) = serde_json::to_string(&record) else {
            return;
        };
        line.push('\n');
        if let Ok(mut file) = file.lock() {
            let _ = file.write_all(line.as_bytes());
        }
    }
}

/// Expands to the name of the function it's invoked in, stripped of its
/// module path — stands in for C's `__FUNCTION__` so log lines match the
/// original's `<function>:<line> <text>` format rather than a module path.
macro_rules! function_name {
    () => {{
        fn f() {}
        fn type_name_of<T>(_: T) -> &'static str {
            std::any::type_name::<T>()
        }
        let name = type_name_of(f);
        let name = &name[..name.len() - 3];
        name.rsplit("::").next().unwrap_or(name)
    }};
}

macro_rules! log_at {
    ($sink:expr, $level:expr, $($arg:tt)*) => {
        $sink.log($level, $crate::log::function_name!(), line!(), &format!($($arg)*))
    };
}

macro_rules! log_fatal {
    ($sink:expr, $($arg:tt)*) => { $crate::log::log_at!($sink, $crate::log::Level::Fatal, $($arg)*) };
}

macro_rules! log_error {
    ($sink:expr, $($arg:tt)*) => { $crate::log::log_at!($sink, $crate::log::Level::Error, $($arg)*) };
}

macro_rules! log_info {
    ($sink:expr, $($arg:tt)*) => { $crate::log::log_at!($sink, $crate::log::Level::Info, $($arg)*) };
}

macro_rules! log_debug {
    ($sink:expr, $($arg:tt)*) => { $crate::log::log_at!($sink, $crate::log::Level::Debug, $($arg)*) };
}

pub(crate) use function_name;
pub(crate) use log_at;
pub(crate) use log_debug;
pub(crate) use log_error;
pub(crate) use log_fatal;
pub(crate) use log_info;

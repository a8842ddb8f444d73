//! Shared logging utilities for the roadvault binary.
//!
//! Every event goes to stdout and (optionally) to the system log. While an
//! archive snapshot is open, the same lines are mirrored into the snapshot's
//! run-local log file through a [`RunLogHandle`].

use anyhow::{Context, Result};
use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use tracing::{Level, Metadata};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "roadvault=info,roadvault_logging=info";

/// Logging configuration for the archiver binary.
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    pub verbose: bool,
    pub syslog: bool,
}

/// Initialize tracing with stdout, syslog and run-local file output.
///
/// The returned handle is detached; call [`RunLogHandle::attach`] once the
/// snapshot directory exists.
pub fn init_logging(config: LogConfig<'_>) -> Result<RunLogHandle> {
    let console_filter = if config.verbose {
        EnvFilter::new("roadvault=debug,roadvault_logging=debug")
    } else {
        base_filter()
    };

    let run_log = RunLogHandle::new();

    let syslog_layer = if config.syslog {
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(SyslogWriter::open(config.app_name))
                .with_ansi(false)
                .without_time()
                .with_filter(base_filter()),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_filter(console_filter),
        )
        .with(syslog_layer)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(run_log.clone())
                .with_ansi(false)
                .with_filter(base_filter()),
        )
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(run_log)
}

fn base_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

/// Switchable file sink for the archive window.
///
/// Writes are discarded while no file is attached.
#[derive(Clone, Default)]
pub struct RunLogHandle {
    inner: Arc<Mutex<Option<RunLogFile>>>,
}

struct RunLogFile {
    path: PathBuf,
    file: File,
}

impl RunLogHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start mirroring log lines into `path` (created or appended).
    pub fn attach(&self, path: &Path) -> io::Result<()> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut guard = self.lock()?;
        *guard = Some(RunLogFile {
            path: path.to_path_buf(),
            file,
        });
        Ok(())
    }

    /// Stop mirroring and flush the file to stable storage.
    ///
    /// Returns the path of the file that was attached, if any.
    pub fn detach(&self) -> io::Result<Option<PathBuf>> {
        let mut guard = self.lock()?;
        match guard.take() {
            Some(mut run_file) => {
                run_file.file.flush()?;
                run_file.file.sync_all()?;
                Ok(Some(run_file.path))
            }
            None => Ok(None),
        }
    }

    pub fn attached_path(&self) -> Option<PathBuf> {
        self.lock()
            .ok()
            .and_then(|guard| guard.as_ref().map(|f| f.path.clone()))
    }

    fn lock(&self) -> io::Result<std::sync::MutexGuard<'_, Option<RunLogFile>>> {
        self.inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "run log lock poisoned"))
    }
}

pub struct RunLogWriterGuard {
    inner: Arc<Mutex<Option<RunLogFile>>>,
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for RunLogHandle {
    type Writer = RunLogWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        RunLogWriterGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Write for RunLogWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "run log lock poisoned"))?;
        match guard.as_mut() {
            Some(run_file) => run_file.file.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "run log lock poisoned"))?;
        if let Some(run_file) = guard.as_mut() {
            run_file.file.flush()?;
        }
        Ok(())
    }
}

// openlog(3) keeps the ident pointer, so it must live for the whole process.
static SYSLOG_IDENT: OnceLock<CString> = OnceLock::new();

/// Writer that forwards formatted events to syslog(3) under `LOG_DAEMON`.
#[derive(Clone, Copy)]
struct SyslogWriter;

impl SyslogWriter {
    fn open(app_name: &str) -> Self {
        let ident = SYSLOG_IDENT.get_or_init(|| {
            CString::new(sanitize_name(app_name)).unwrap_or_else(|_| CString::default())
        });
        // SAFETY: `ident` is 'static and NUL-terminated.
        unsafe {
            libc::openlog(ident.as_ptr(), libc::LOG_PID | libc::LOG_NDELAY, libc::LOG_DAEMON);
        }
        Self
    }
}

/// Buffers one formatted event and emits it on drop.
struct SyslogLine {
    priority: libc::c_int,
    buf: Vec<u8>,
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SyslogWriter {
    type Writer = SyslogLine;

    fn make_writer(&'a self) -> Self::Writer {
        SyslogLine {
            priority: libc::LOG_INFO,
            buf: Vec::new(),
        }
    }

    fn make_writer_for(&'a self, meta: &Metadata<'_>) -> Self::Writer {
        SyslogLine {
            priority: syslog_priority(meta.level()),
            buf: Vec::new(),
        }
    }
}

impl Write for SyslogLine {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for SyslogLine {
    fn drop(&mut self) {
        let Some(message) = syslog_message(&self.buf) else {
            return;
        };
        // SAFETY: both pointers are valid NUL-terminated strings; the format
        // string keeps `message` from being interpreted as a format.
        unsafe {
            libc::syslog(
                self.priority | libc::LOG_DAEMON,
                b"%s\0".as_ptr() as *const libc::c_char,
                message.as_ptr(),
            );
        }
    }
}

fn syslog_priority(level: &Level) -> libc::c_int {
    match *level {
        Level::ERROR => libc::LOG_ERR,
        Level::WARN => libc::LOG_WARNING,
        Level::INFO => libc::LOG_INFO,
        Level::DEBUG | Level::TRACE => libc::LOG_DEBUG,
    }
}

fn syslog_message(buf: &[u8]) -> Option<CString> {
    let text = String::from_utf8_lossy(buf);
    let trimmed = text.trim_end_matches(['\n', '\r']);
    if trimmed.is_empty() {
        return None;
    }
    CString::new(trimmed.replace('\0', " ")).ok()
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' { ch } else { '_' })
        .collect()
}

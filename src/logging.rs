use std::fs::{File, OpenOptions};
use std::io::{LineWriter, Write};
use std::path::Path;
use std::sync::{Mutex, OnceLock};

use anyhow::{Context, Result};
use chrono::SecondsFormat;

/// Set to `1` to emit debug records.
pub const DEBUG_ENV: &str = "MSGSTREAM_DEBUG";

static LOGGER: OnceLock<Logger> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        }
    }

    fn enabled(self) -> bool {
        self != Level::Debug || debug_enabled()
    }
}

/// Opens (and truncates) the process log. Later calls keep the first file.
pub fn init_log_file(path: &Path) -> Result<()> {
    if LOGGER.get().is_some() {
        return Ok(());
    }
    let logger = Logger::open(path, true)?;
    let _ = LOGGER.set(logger);
    Ok(())
}

pub fn debug_enabled() -> bool {
    matches!(std::env::var(DEBUG_ENV).as_deref(), Ok("1"))
}

pub fn log(level: Level, msg: &str, fields: &[(&str, &str)]) {
    if !level.enabled() {
        return;
    }
    if let Some(logger) = LOGGER.get() {
        logger.emit(level, msg, fields);
    }
}

pub fn debug(msg: impl AsRef<str>) {
    log(Level::Debug, msg.as_ref(), &[]);
}

pub fn info(msg: impl AsRef<str>) {
    log(Level::Info, msg.as_ref(), &[]);
}

pub fn warn(msg: impl AsRef<str>) {
    log(Level::Warn, msg.as_ref(), &[]);
}

pub fn error(msg: impl AsRef<str>) {
    log(Level::Error, msg.as_ref(), &[]);
}

pub fn info_kv(msg: &str, fields: &[(&str, &str)]) {
    log(Level::Info, msg, fields);
}

struct Logger {
    file: Mutex<LineWriter<File>>,
    console: bool,
}

impl Logger {
    fn open(path: &Path, console: bool) -> Result<Self> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("open log file {}", path.display()))?;
        Ok(Self {
            file: Mutex::new(LineWriter::new(file)),
            console,
        })
    }

    fn emit(&self, level: Level, msg: &str, fields: &[(&str, &str)]) {
        let ts = chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let current = std::thread::current();
        let thread = current.name().unwrap_or("-");

        if let Ok(mut file) = self.file.lock() {
            let _ = writeln!(file, "{}", file_line(&ts, level, thread, msg, fields));
        }
        if self.console {
            let line = console_line(&ts, level, thread, msg, fields);
            let _ = writeln!(std::io::stdout().lock(), "{line}");
        }
    }
}

/// `time=.. level=.. thread=.. msg=".." key=value` with logfmt quoting.
fn file_line(ts: &str, level: Level, thread: &str, msg: &str, fields: &[(&str, &str)]) -> String {
    let mut line = format!("time={ts} level={} thread={thread} msg=", level.as_str());
    push_quoted(&mut line, msg);
    for (key, value) in fields {
        line.push(' ');
        line.push_str(key);
        line.push('=');
        if needs_quotes(value) {
            push_quoted(&mut line, value);
        } else {
            line.push_str(value);
        }
    }
    line
}

fn console_line(
    ts: &str,
    level: Level,
    thread: &str,
    msg: &str,
    fields: &[(&str, &str)],
) -> String {
    let mut line = format!("{ts} {:<5} {thread}: {msg}", level.as_str());
    for (key, value) in fields {
        line.push_str(&format!(" {key}={value}"));
    }
    line
}

fn needs_quotes(value: &str) -> bool {
    value.is_empty()
        || value
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || matches!(c, '"' | '=' | '\\'))
}

fn push_quoted(out: &mut String, value: &str) {
    out.push('"');
    for c in value.chars() {
        match c {
            '"' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => out.push_str(&format!("\\u{{{:x}}}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
}

//! Logging for the patch engine
//!
//! Two layers live here: [`JsonLogger`], the process-wide `log` backend used
//! by the binary, and [`PatchLog`], the per-invocation record sink whose
//! records are returned to the caller and can be observed while the pipeline
//! runs.

use chrono::{Local, Utc};
use log::{Level, Log, Metadata, Record};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::env;
use std::fmt;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Environment variable selecting the log level
pub const LOG_LEVEL_ENV: &str = "LSPATCH_LOG_LEVEL";

/// Environment variable redirecting JSON logs to a file
pub const LOG_PATH_ENV: &str = "LSPATCH_LOG_PATH";

/// Target of pipeline records; the current stage is appended as a segment
pub const PATCH_TARGET: &str = "lspatch::patch";

static JSON_ACTIVE: AtomicBool = AtomicBool::new(false);

/// Split "json:debug", "json" or a bare level into (json, level)
fn parse_level_spec(spec: &str) -> (bool, &str) {
    if let Some(stripped) = spec.strip_prefix("json:") {
        (true, stripped)
    } else if spec == "json" {
        (true, "info")
    } else {
        (false, spec)
    }
}

/// Pipeline stage carried by a record target such as `lspatch::patch::SIGNED`
fn stage_of(target: &str) -> Option<&str> {
    target
        .strip_prefix(PATCH_TARGET)
        .and_then(|rest| rest.strip_prefix("::"))
        .filter(|stage| !stage.is_empty())
}

/// JSON object written for one record
fn json_entry(record: &Record<'_>) -> serde_json::Value {
    let mut entry = json!({
        "@timestamp": Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
        "@level": record.level().to_string().to_lowercase(),
        "@message": record.args().to_string(),
        "@module": record.target(),
        "@pid": std::process::id(),
        "@file": record.file().unwrap_or("unknown"),
        "@line": record.line().unwrap_or(0),
    });
    if let Some(stage) = stage_of(record.target()) {
        entry["@stage"] = json!(stage);
    }
    entry
}

/// JSON logger implementation
#[derive(Debug)]
pub struct JsonLogger {
    level: Level,
    target_file: Mutex<Option<std::fs::File>>,
}

impl JsonLogger {
    /// Create a new JSON logger
    pub fn new(level: Level, log_path: Option<String>) -> Self {
        let target_file = if let Some(path) = log_path {
            OpenOptions::new().create(true).append(true).open(path).ok()
        } else {
            None
        };

        JsonLogger {
            level,
            target_file: Mutex::new(target_file),
        }
    }

    /// Initialize the logger with specified level and source
    pub fn init_with_level(level_str: &str, source: &str) -> (String, String) {
        let log_path = env::var(LOG_PATH_ENV).ok();

        let (use_json, actual_level) = parse_level_spec(level_str);

        if !use_json {
            let level_filter = match actual_level {
                "trace" => log::LevelFilter::Trace,
                "debug" => log::LevelFilter::Debug,
                "info" => log::LevelFilter::Info,
                "warn" => log::LevelFilter::Warn,
                "error" => log::LevelFilter::Error,
                "off" => log::LevelFilter::Off,
                _ => log::LevelFilter::Info,
            };

            let _ = env_logger::Builder::new()
                .filter_level(level_filter)
                .format(|buf, record| {
                    use std::io::Write;

                    write!(
                        buf,
                        "[{} {} {}] ",
                        Local::now().format("%Y-%m-%dT%H:%M:%S"),
                        record.level(),
                        record.target()
                    )?;
                    writeln!(buf, "{}", record.args())
                })
                .try_init();
            return (actual_level.to_string(), source.to_string());
        }

        let level = match actual_level {
            "trace" => Level::Trace,
            "debug" => Level::Debug,
            "warn" => Level::Warn,
            "error" => Level::Error,
            _ => Level::Info,
        };

        let logger = Box::new(JsonLogger::new(level, log_path));

        if let Err(e) = log::set_boxed_logger(logger) {
            eprintln!("Failed to initialize JSON logger: {e}");
            return (actual_level.to_string(), source.to_string());
        }

        log::set_max_level(level.to_level_filter());
        JSON_ACTIVE.store(true, Ordering::Relaxed);
        (actual_level.to_string(), source.to_string())
    }

    /// Initialize the logger from `LSPATCH_LOG_LEVEL`, defaulting to info
    pub fn init() {
        let log_level = env::var(LOG_LEVEL_ENV).unwrap_or_else(|_| "info".to_string());
        Self::init_with_level(&log_level, LOG_LEVEL_ENV);
    }
}

impl Log for JsonLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let json_string = format!("{}\n", json_entry(record));

        if let Ok(mut file_guard) = self.target_file.lock() {
            if let Some(ref mut file) = *file_guard {
                let _ = file.write_all(json_string.as_bytes());
                let _ = file.flush();
                return;
            }
        }
        let _ = io::stderr().write_all(json_string.as_bytes());
        let _ = io::stderr().flush();
    }

    fn flush(&self) {
        if let Ok(mut file_guard) = self.target_file.lock() {
            if let Some(ref mut file) = *file_guard {
                let _ = file.flush();
            }
        }
        let _ = io::stderr().flush();
    }
}

/// Whether the JSON logger was installed, so reports should be JSON too
pub fn is_json_logging() -> bool {
    JSON_ACTIVE.load(Ordering::Relaxed)
}

/// Severity of a [`LogRecord`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Error,
}

/// One entry of the structured patch log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub level: LogLevel,
    pub message: String,
}

/// Callback receiving records as they are produced
pub type LogListener = Box<dyn FnMut(&LogRecord) + Send>;

/// Ordered record sink for one pipeline invocation
pub struct PatchLog {
    verbose: bool,
    target: String,
    records: Vec<LogRecord>,
    listener: Option<LogListener>,
}

impl fmt::Debug for PatchLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatchLog")
            .field("verbose", &self.verbose)
            .field("records", &self.records.len())
            .field("listener", &self.listener.is_some())
            .finish()
    }
}

impl PatchLog {
    pub fn new(verbose: bool) -> Self {
        PatchLog {
            verbose,
            target: PATCH_TARGET.to_string(),
            records: Vec::new(),
            listener: None,
        }
    }

    /// Attach a listener that sees every kept record immediately
    pub fn with_listener(mut self, listener: LogListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Tag later records forwarded to `log` with the pipeline stage
    pub fn set_stage(&mut self, stage: impl fmt::Display) {
        self.target = format!("{PATCH_TARGET}::{stage}");
    }

    pub fn debug(&mut self, message: impl Into<String>) {
        let message = message.into();
        log::debug!(target: self.target.as_str(), "{message}");
        if self.verbose {
            self.push(LogLevel::Debug, message);
        }
    }

    pub fn info(&mut self, message: impl Into<String>) {
        let message = message.into();
        log::info!(target: self.target.as_str(), "{message}");
        self.push(LogLevel::Info, message);
    }

    pub fn error(&mut self, message: impl Into<String>) {
        let message = message.into();
        log::error!(target: self.target.as_str(), "{message}");
        self.push(LogLevel::Error, message);
    }

    pub fn records(&self) -> &[LogRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<LogRecord> {
        self.records
    }

    fn push(&mut self, level: LogLevel, message: String) {
        let record = LogRecord { level, message };
        if let Some(listener) = self.listener.as_mut() {
            listener(&record);
        }
        self.records.push(record);
    }
}

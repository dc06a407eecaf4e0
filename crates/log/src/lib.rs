//! Leveled stderr logging with an operator alert ring.
//!
//! Every `warn` and `error` record is retained in a bounded ring so the admin
//! `getinfo` surface can report recent failures without scraping stderr.

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::json;

pub const DEFAULT_ALERT_CAPACITY: usize = 64;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum Level {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Warn => "WARN",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
            Self::Trace => "TRACE",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "error" => Some(Self::Error),
            "warn" | "warning" => Some(Self::Warn),
            "info" => Some(Self::Info),
            "debug" => Some(Self::Debug),
            "trace" => Some(Self::Trace),
            _ => None,
        }
    }

    fn is_alert(self) -> bool {
        self <= Self::Warn
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Format {
    Text = 0,
    Json = 1,
}

impl Format {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "text" => Some(Self::Text),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct LogConfig {
    pub level: Level,
    pub format: Format,
    pub timestamps: bool,
    pub alert_capacity: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::Info,
            format: Format::Text,
            timestamps: true,
            alert_capacity: DEFAULT_ALERT_CAPACITY,
        }
    }
}

/// A retained `warn`/`error` record.
#[derive(Clone, Debug)]
pub struct Alert {
    pub ts_ms: u64,
    pub level: Level,
    pub target: &'static str,
    pub msg: String,
}

static LOG_LEVEL: AtomicU8 = AtomicU8::new(Level::Info as u8);
static LOG_FORMAT: AtomicU8 = AtomicU8::new(Format::Text as u8);
static LOG_TIMESTAMPS: AtomicBool = AtomicBool::new(true);
static LOG_STDERR_ENABLED: AtomicBool = AtomicBool::new(true);

static ALERT_CAPACITY: AtomicUsize = AtomicUsize::new(DEFAULT_ALERT_CAPACITY);
static ALERT_TOTAL: AtomicU64 = AtomicU64::new(0);
static ALERTS: OnceLock<Mutex<VecDeque<Alert>>> = OnceLock::new();

pub fn init(config: LogConfig) {
    LOG_LEVEL.store(config.level as u8, Ordering::Relaxed);
    LOG_FORMAT.store(config.format as u8, Ordering::Relaxed);
    LOG_TIMESTAMPS.store(config.timestamps, Ordering::Relaxed);
    ALERT_CAPACITY.store(config.alert_capacity, Ordering::Relaxed);
}

pub fn set_stderr_enabled(enabled: bool) {
    LOG_STDERR_ENABLED.store(enabled, Ordering::Relaxed);
}

/// Most recent alerts, oldest first.
pub fn alerts_snapshot(limit: usize) -> Vec<Alert> {
    let Some(ring) = ALERTS.get() else {
        return Vec::new();
    };
    let Ok(guard) = ring.lock() else {
        return Vec::new();
    };
    let start = guard.len().saturating_sub(limit);
    guard.iter().skip(start).cloned().collect()
}

/// Alerts recorded since startup, including ones already rotated out of the ring.
pub fn alert_total() -> u64 {
    ALERT_TOTAL.load(Ordering::Relaxed)
}

pub fn enabled(level: Level) -> bool {
    level.is_alert() || level as u8 <= LOG_LEVEL.load(Ordering::Relaxed)
}

fn stderr_enabled(level: Level) -> bool {
    LOG_STDERR_ENABLED.load(Ordering::Relaxed) && level as u8 <= LOG_LEVEL.load(Ordering::Relaxed)
}

pub fn log(
    level: Level,
    target: &'static str,
    file: &'static str,
    line: u32,
    args: fmt::Arguments<'_>,
) {
    if !enabled(level) {
        return;
    }

    let format = match LOG_FORMAT.load(Ordering::Relaxed) {
        1 => Format::Json,
        _ => Format::Text,
    };
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let ts_ms: u64 = now.as_millis().try_into().unwrap_or(u64::MAX);
    let msg = if matches!(format, Format::Json) || level.is_alert() {
        Some(args.to_string())
    } else {
        None
    };

    if stderr_enabled(level) {
        let mut out = io::stderr().lock();
        match format {
            Format::Text => {
                if LOG_TIMESTAMPS.load(Ordering::Relaxed) {
                    let ts = Timestamp {
                        unix_seconds: now.as_secs(),
                        millis: now.subsec_millis(),
                    };
                    let _ = write!(out, "{ts} ");
                }
                let _ = write!(out, "{} {}: ", level.as_str(), target);
                let _ = writeln!(out, "{args}");
            }
            Format::Json => {
                let line = json!({
                    "ts_ms": ts_ms,
                    "level": level.as_str(),
                    "target": target,
                    "file": file,
                    "line": line,
                    "msg": msg.as_deref().unwrap_or_default(),
                });
                let _ = writeln!(out, "{line}");
            }
        }
    }

    if level.is_alert() {
        record_alert(Alert {
            ts_ms,
            level,
            target,
            msg: msg.unwrap_or_default(),
        });
    }
}

fn record_alert(alert: Alert) {
    ALERT_TOTAL.fetch_add(1, Ordering::Relaxed);
    let cap = ALERT_CAPACITY.load(Ordering::Relaxed);
    if cap == 0 {
        return;
    }
    let ring = ALERTS.get_or_init(|| Mutex::new(VecDeque::with_capacity(cap.min(1024))));
    let Ok(mut guard) = ring.lock() else {
        return;
    };
    guard.push_back(alert);
    while guard.len() > cap {
        let _ = guard.pop_front();
    }
}

#[macro_export]
macro_rules! log_at {
    ($level:expr, $($arg:tt)*) => {{
        if $crate::enabled($level) {
            $crate::log($level, module_path!(), file!(), line!(), format_args!($($arg)*));
        }
    }};
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Error, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Warn, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Info, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Debug, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_trace {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Trace, $($arg)*);
    }};
}

/// UTC wall-clock rendering, `YYYY-MM-DDTHH:MM:SS.mmmZ`.
pub struct Timestamp {
    pub unix_seconds: u64,
    pub millis: u32,
}

impl Timestamp {
    pub fn from_millis(ts_ms: u64) -> Self {
        Self {
            unix_seconds: ts_ms / 1000,
            millis: (ts_ms % 1000) as u32,
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const SECS_PER_DAY: u64 = 86_400;
        let days = (self.unix_seconds / SECS_PER_DAY) as i64;
        let secs_of_day = self.unix_seconds % SECS_PER_DAY;
        let hour = secs_of_day / 3600;
        let minute = (secs_of_day % 3600) / 60;
        let second = secs_of_day % 60;
        let (year, month, day) = civil_from_days(days);
        write!(
            f,
            "{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}.{millis:03}Z",
            millis = self.millis
        )
    }
}

fn civil_from_days(days_since_unix_epoch: i64) -> (i32, u32, u32) {
    // Howard Hinnant's civil_from_days.
    let z = days_since_unix_epoch + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u32;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = (yoe as i32) + (era as i32) * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = y + if m <= 2 { 1 } else { 0 };
    (year, m, d)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_level() {
        assert_eq!(Level::parse("info"), Some(Level::Info));
        assert_eq!(Level::parse("WARN"), Some(Level::Warn));
        assert_eq!(Level::parse("warning"), Some(Level::Warn));
        assert_eq!(Level::parse("trace"), Some(Level::Trace));
        assert_eq!(Level::parse("nope"), None);
    }

    #[test]
    fn parse_format() {
        assert_eq!(Format::parse("text"), Some(Format::Text));
        assert_eq!(Format::parse("JSON"), Some(Format::Json));
        assert_eq!(Format::parse("nope"), None);
    }

    #[test]
    fn timestamp_renders_utc() {
        let ts = Timestamp::from_millis(1_700_000_000_123);
        assert_eq!(ts.to_string(), "2023-11-14T22:13:20.123Z");
    }

    #[test]
    fn warnings_are_retained_even_when_filtered_from_stderr() {
        set_stderr_enabled(false);
        let before = alert_total();
        log_warn!("daemon unreachable: {}", "refused");
        log_info!("not an alert");
        assert_eq!(alert_total(), before + 1);
        let alerts = alerts_snapshot(usize::MAX);
        let last = alerts.last().expect("alert recorded");
        assert_eq!(last.level, Level::Warn);
        assert_eq!(last.msg, "daemon unreachable: refused");
    }
}

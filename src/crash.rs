//! Crash reporting.
//!
//! Installs a panic hook that writes a timestamped crash log before the
//! previous hook runs, so worker-thread panics leave a trace on disk.

use std::backtrace::Backtrace;
use std::fs;
use std::panic::{self, PanicHookInfo};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use log::error;

/// Install the crash-log panic hook. Logs are written to `dir`.
pub fn install(dir: impl Into<PathBuf>) {
    let dir = dir.into();
    let previous = panic::take_hook();

    panic::set_hook(Box::new(move |info| {
        let report = crash_report(info, &Backtrace::force_capture().to_string());
        match write_crash_log(&dir, SystemTime::now(), &report) {
            Ok(path) => error!("[Crash] Panic recorded in {}", path.display()),
            Err(e) => error!("[Crash] Failed to write crash log: {}", e),
        }
        previous(info);
    }));
}

fn crash_report(info: &PanicHookInfo<'_>, backtrace: &str) -> String {
    let message = info
        .payload()
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| info.payload().downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "<non-string panic payload>".to_string());

    let location = info
        .location()
        .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
        .unwrap_or_else(|| "<unknown>".to_string());

    let thread = std::thread::current()
        .name()
        .unwrap_or("<unnamed>")
        .to_string();

    format!(
        "returnfeed-bridge {} crash\nthread: {}\nlocation: {}\nmessage: {}\n\nbacktrace:\n{}\n",
        env!("CARGO_PKG_VERSION"),
        thread,
        location,
        message,
        backtrace
    )
}

/// Write `report` to `<dir>/crash_YYYYMMDD_HHMMSS.log`.
pub fn write_crash_log(dir: &Path, at: SystemTime, report: &str) -> std::io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join(format!("crash_{}.log", timestamp(at)));
    fs::write(&path, report)?;
    Ok(path)
}

/// UTC `YYYYMMDD_HHMMSS`
fn timestamp(at: SystemTime) -> String {
    let secs = at.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
    let days = (secs / 86_400) as i64;
    let rem = secs % 86_400;

    // Civil-from-days (proleptic Gregorian)
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + if month <= 2 { 1 } else { 0 };

    format!(
        "{:04}{:02}{:02}_{:02}{:02}{:02}",
        year,
        month,
        day,
        rem / 3600,
        (rem % 3600) / 60,
        rem % 60
    )
}

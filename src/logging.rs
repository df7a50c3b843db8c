use std::fs::File;
use std::path::Path;

use log::info;
use simplelog::{Config, LevelFilter, WriteLogger};

use crate::{Result, settings};

/// Maps a config string such as `"debug"` to a filter; unknown values
/// fall back to `Info`
#[must_use]
pub fn level_from_str(level: &str) -> LevelFilter {
    match level.trim().to_ascii_lowercase().as_str() {
        "off" => LevelFilter::Off,
        "error" => LevelFilter::Error,
        "warn" | "warning" => LevelFilter::Warn,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    }
}

/// Sends all log output to `path`. Fails if a logger is already installed.
pub fn init_file_logger(path: &Path, level: LevelFilter) -> Result<()> {
    WriteLogger::init(level, Config::default(), File::create(path)?)?;
    info!("Logging to {path:?} at {level}");
    Ok(())
}

/// File logger at the level named by the `log_level` setting
pub fn init_from_settings(path: &Path) -> Result<()> {
    init_file_logger(path, level_from_str(&settings::get_log_level()))
}

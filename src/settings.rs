use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, RwLock};

use crate::viewer::Zoom;

pub const CURRENT_VERSION: u32 = 1;
const SETTINGS_FILENAME: &str = "config.yaml";
const APP_NAME: &str = "ghostbridge";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_version")]
    pub version: u32,

    /// Ghostscript shared library to load when the host does not pick one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_path: Option<PathBuf>,

    #[serde(default = "default_dpi")]
    pub dpi: i32,

    #[serde(default = "default_alpha_bits")]
    pub graphics_alpha_bits: u8,

    #[serde(default = "default_alpha_bits")]
    pub text_alpha_bits: u8,

    /// Size EPS pages by their bounding box instead of the default media
    #[serde(default = "default_true")]
    pub eps_clip: bool,

    #[serde(default = "default_true")]
    pub show_page_after_open: bool,

    #[serde(default = "default_true")]
    pub progressive_update: bool,

    #[serde(default = "default_progressive_update_interval_ms")]
    pub progressive_update_interval_ms: u64,

    /// Extra interpreter switches appended when a document opens
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub custom_switches: Vec<String>,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_true() -> bool {
    true
}

fn default_version() -> u32 {
    CURRENT_VERSION
}

fn default_dpi() -> i32 {
    Zoom::DEFAULT_DPI
}

fn default_alpha_bits() -> u8 {
    4
}

fn default_progressive_update_interval_ms() -> u64 {
    100
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION,
            engine_path: None,
            dpi: default_dpi(),
            graphics_alpha_bits: default_alpha_bits(),
            text_alpha_bits: default_alpha_bits(),
            eps_clip: true,
            show_page_after_open: true,
            progressive_update: true,
            progressive_update_interval_ms: default_progressive_update_interval_ms(),
            custom_switches: Vec::new(),
            log_level: default_log_level(),
        }
    }
}

static SETTINGS: LazyLock<RwLock<Settings>> = LazyLock::new(|| RwLock::new(Settings::default()));

fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|config| config.join(APP_NAME).join(SETTINGS_FILENAME))
}

pub fn load_settings() {
    let Some(path) = config_path() else {
        warn!("Could not determine config directory, using default settings");
        return;
    };
    if path.exists() {
        load_settings_from_path(&path);
    } else {
        info!("Settings file not found, creating with defaults at {path:?}");
        if let Ok(settings) = SETTINGS.read() {
            save_settings_to_path(&settings, &path);
        }
    }
}

pub fn load_settings_from_path(path: &Path) {
    match fs::read_to_string(path) {
        Ok(content) => match serde_yaml::from_str::<Settings>(&content) {
            Ok(mut settings) => {
                debug!("Loaded settings from {path:?}");

                if settings.version < CURRENT_VERSION {
                    migrate_settings(&mut settings);
                    save_settings_to_path(&settings, path);
                }
                sanitize(&mut settings);

                if let Ok(mut global) = SETTINGS.write() {
                    *global = settings;
                }
            }
            Err(e) => {
                error!("Failed to parse settings file {path:?}: {e}");
            }
        },
        Err(e) => {
            error!("Failed to read settings file {path:?}: {e}");
        }
    }
}

fn migrate_settings(settings: &mut Settings) {
    info!(
        "Migrating settings from v{} to v{}",
        settings.version, CURRENT_VERSION
    );
    settings.version = CURRENT_VERSION;
}

/// Alpha bits accept 1, 2 or 4; dpi must lie in the zoom range
fn sanitize(settings: &mut Settings) {
    for (name, bits) in [
        ("graphics_alpha_bits", &mut settings.graphics_alpha_bits),
        ("text_alpha_bits", &mut settings.text_alpha_bits),
    ] {
        if !matches!(*bits, 1 | 2 | 4) {
            warn!("{name} must be 1, 2 or 4, got {bits}; using 4");
            *bits = 4;
        }
    }
    let clamped = settings.dpi.clamp(Zoom::MIN_DPI, Zoom::MAX_DPI);
    if clamped != settings.dpi {
        warn!("dpi {} outside supported range, using {clamped}", settings.dpi);
        settings.dpi = clamped;
    }
}

pub fn save_settings() {
    let Some(path) = config_path() else {
        warn!("Could not determine config directory, cannot save settings");
        return;
    };

    if let Ok(settings) = SETTINGS.read() {
        save_settings_to_path(&settings, &path);
    }
}

pub fn save_settings_to_path(settings: &Settings, path: &Path) {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            if let Err(e) = fs::create_dir_all(parent) {
                error!("Failed to create config directory {parent:?}: {e}");
                return;
            }
        }
    }

    let body = match serde_yaml::to_string(settings) {
        Ok(body) => body,
        Err(e) => {
            error!("Failed to serialize settings: {e}");
            return;
        }
    };
    let content = format!("{SETTINGS_HEADER}{body}");

    match fs::write(path, content) {
        Ok(()) => debug!("Saved settings to {path:?}"),
        Err(e) => error!("Failed to save settings to {path:?}: {e}"),
    }
}

const SETTINGS_HEADER: &str = r#"# ============================================================================
# ghostbridge settings
# ============================================================================
# engine_path: path to the Ghostscript shared library (libgs.so, gsdll64.dll)
# custom_switches: extra interpreter switches, e.g. ["-dNOINTERPOLATE"]
# log_level: off, error, warn, info, debug or trace

"#;

// Public API for accessing/modifying settings

#[must_use]
pub fn current() -> Settings {
    SETTINGS
        .read()
        .map(|s| s.clone())
        .unwrap_or_default()
}

#[cfg(any(test, feature = "test-utils"))]
pub fn reset_to_defaults() {
    if let Ok(mut settings) = SETTINGS.write() {
        *settings = Settings::default();
    }
}

#[must_use]
pub fn get_engine_path() -> Option<PathBuf> {
    SETTINGS.read().ok().and_then(|s| s.engine_path.clone())
}

pub fn set_engine_path(path: Option<PathBuf>) {
    if let Ok(mut settings) = SETTINGS.write() {
        settings.engine_path = path;
    }
}

#[must_use]
pub fn get_dpi() -> i32 {
    SETTINGS.read().map(|s| s.dpi).unwrap_or_else(|_| default_dpi())
}

pub fn set_dpi(dpi: i32) {
    if let Ok(mut settings) = SETTINGS.write() {
        settings.dpi = dpi.clamp(Zoom::MIN_DPI, Zoom::MAX_DPI);
    }
}

#[must_use]
pub fn is_eps_clip() -> bool {
    SETTINGS.read().map(|s| s.eps_clip).unwrap_or(true)
}

pub fn set_eps_clip(enabled: bool) {
    if let Ok(mut settings) = SETTINGS.write() {
        settings.eps_clip = enabled;
    }
}

#[must_use]
pub fn is_progressive_update() -> bool {
    SETTINGS.read().map(|s| s.progressive_update).unwrap_or(true)
}

pub fn set_progressive_update(enabled: bool) {
    if let Ok(mut settings) = SETTINGS.write() {
        settings.progressive_update = enabled;
    }
}

#[must_use]
pub fn get_custom_switches() -> Vec<String> {
    SETTINGS
        .read()
        .map(|s| s.custom_switches.clone())
        .unwrap_or_default()
}

pub fn set_custom_switches(switches: Vec<String>) {
    if let Ok(mut settings) = SETTINGS.write() {
        settings.custom_switches = switches;
    }
}

#[must_use]
pub fn get_log_level() -> String {
    SETTINGS
        .read()
        .map(|s| s.log_level.clone())
        .unwrap_or_else(|_| default_log_level())
}

pub fn set_log_level(level: &str) {
    if let Ok(mut settings) = SETTINGS.write() {
        settings.log_level = level.to_string();
    }
}

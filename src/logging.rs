// src/logging.rs
//! Logger installation for hosts that do not bring their own.

/// Install `env_logger` once. Debug builds default to `debug`, release builds
/// to `warn`; `RUST_LOG` overrides either. Later calls and hosts that already
/// installed a logger are left alone.
#[cfg(not(target_arch = "wasm32"))]
pub fn init() {
    use log::LevelFilter;

    let default_level = if cfg!(debug_assertions) {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    };
    let installed = env_logger::Builder::new()
        .filter_level(default_level)
        .format_timestamp_millis()
        .format_target(false)
        .parse_default_env()
        .try_init();
    if installed.is_ok() {
        log::debug!("logging initialised at {default_level}");
    }
}

/// Browser hosts install their own `log` backend.
#[cfg(target_arch = "wasm32")]
pub fn init() {}

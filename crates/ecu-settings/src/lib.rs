//! # ecu-settings
//!
//! Configuration management with layered sources for the ECU gateway.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults** — [`GatewaySettings::default()`]
//! 2. **Settings file** — `~/.ecu-gateway/settings.json` or a path given on
//!    the command line (deep-merged over defaults)
//! 3. **Environment variables** — `ECU_*` overrides (highest priority)

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;

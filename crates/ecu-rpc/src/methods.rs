//! Method names understood by ECU firmware.

// ── Status ──────────────────────────────────────────────────────────

/// Device-initiated status report.
pub const STATUS_UPDATE: &str = "status_update";
/// Liveness signal from the device.
pub const HEARTBEAT: &str = "heartbeat";
/// Query current device status.
pub const GET_STATUS: &str = "get_status";
/// Query static device information.
pub const DEVICE_INFO: &str = "device_info";
/// Round-trip probe.
pub const PING: &str = "ping";

// ── Control ─────────────────────────────────────────────────────────

/// Engage the lock.
pub const LOCK: &str = "lock";
/// Release the lock.
pub const UNLOCK: &str = "unlock";
/// Power the device on.
pub const POWER_ON: &str = "power_on";
/// Power the device off.
pub const POWER_OFF: &str = "power_off";
/// Soft reset.
pub const RESET: &str = "reset";
/// Reboot.
pub const REBOOT: &str = "reboot";

// ── Configuration ───────────────────────────────────────────────────

/// Replace configuration values.
pub const UPDATE_CONFIG: &str = "update_config";
/// Read configuration.
pub const GET_CONFIG: &str = "get_config";
/// Restore factory configuration.
pub const FACTORY_RESET: &str = "factory_reset";

// ── Data and maintenance ────────────────────────────────────────────

/// Device pushes collected data.
pub const UPLOAD_DATA: &str = "upload_data";
/// Gateway pushes data to the device.
pub const DOWNLOAD_DATA: &str = "download_data";
/// Query stored data.
pub const QUERY_DATA: &str = "query_data";
/// Start a firmware update.
pub const FIRMWARE_UPDATE: &str = "firmware_update";
/// Firmware update progress.
pub const UPDATE_STATUS: &str = "update_status";
/// Run diagnostics.
pub const DIAGNOSTIC: &str = "diagnostic";
/// Device log upload.
pub const LOG_REPORT: &str = "log_report";

/// Every method name above.
pub const ALL: &[&str] = &[
    STATUS_UPDATE,
    HEARTBEAT,
    GET_STATUS,
    DEVICE_INFO,
    PING,
    LOCK,
    UNLOCK,
    POWER_ON,
    POWER_OFF,
    RESET,
    REBOOT,
    UPDATE_CONFIG,
    GET_CONFIG,
    FACTORY_RESET,
    UPLOAD_DATA,
    DOWNLOAD_DATA,
    QUERY_DATA,
    FIRMWARE_UPDATE,
    UPDATE_STATUS,
    DIAGNOSTIC,
    LOG_REPORT,
];

/// Whether `method` is a known device method.
pub fn is_known(method: &str) -> bool {
    ALL.contains(&method)
}

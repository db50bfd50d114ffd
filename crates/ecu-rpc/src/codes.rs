//! JSON-RPC error codes.
//!
//! `-32700..=-32600` are defined by JSON-RPC 2.0. `-32001..=-32009` are
//! device-level application errors and `-32100..=-32104` business errors
//! used by ECU firmware and upstream services.

// ── JSON-RPC 2.0 ────────────────────────────────────────────────────

/// Invalid JSON.
pub const PARSE_ERROR: i64 = -32700;
/// Not a valid request object.
pub const INVALID_REQUEST: i64 = -32600;
/// Unknown method.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// Invalid method parameters.
pub const INVALID_PARAMS: i64 = -32602;
/// Internal JSON-RPC error.
pub const INTERNAL_ERROR: i64 = -32603;

// ── Device errors ───────────────────────────────────────────────────

/// Device is not connected.
pub const DEVICE_OFFLINE: i64 = -32001;
/// Device is busy with another operation.
pub const DEVICE_BUSY: i64 = -32002;
/// Caller may not perform the operation.
pub const PERMISSION_DENIED: i64 = -32003;
/// Device did not answer in time.
pub const COMMAND_TIMEOUT: i64 = -32004;
/// Device is in a state that forbids the command.
pub const INVALID_STATE: i64 = -32005;
/// Command rejected by the device.
pub const INVALID_COMMAND: i64 = -32006;
/// Device resource unavailable.
pub const RESOURCE_UNAVAILABLE: i64 = -32007;
/// Device-side network failure.
pub const NETWORK_ERROR: i64 = -32008;
/// Firmware failure.
pub const FIRMWARE_ERROR: i64 = -32009;

// ── Business errors ─────────────────────────────────────────────────

/// No such device.
pub const DEVICE_NOT_FOUND: i64 = -32100;
/// User not authorized for the device.
pub const USER_NOT_AUTHORIZED: i64 = -32101;
/// Account balance too low.
pub const INSUFFICIENT_BALANCE: i64 = -32102;
/// Upstream service unavailable.
pub const SERVICE_UNAVAILABLE: i64 = -32103;
/// Too many requests.
pub const RATE_LIMIT_EXCEEDED: i64 = -32104;

/// Symbolic name of a known code.
pub fn name(code: i64) -> Option<&'static str> {
    Some(match code {
        PARSE_ERROR => "PARSE_ERROR",
        INVALID_REQUEST => "INVALID_REQUEST",
        METHOD_NOT_FOUND => "METHOD_NOT_FOUND",
        INVALID_PARAMS => "INVALID_PARAMS",
        INTERNAL_ERROR => "INTERNAL_ERROR",
        DEVICE_OFFLINE => "DEVICE_OFFLINE",
        DEVICE_BUSY => "DEVICE_BUSY",
        PERMISSION_DENIED => "PERMISSION_DENIED",
        COMMAND_TIMEOUT => "COMMAND_TIMEOUT",
        INVALID_STATE => "INVALID_STATE",
        INVALID_COMMAND => "INVALID_COMMAND",
        RESOURCE_UNAVAILABLE => "RESOURCE_UNAVAILABLE",
        NETWORK_ERROR => "NETWORK_ERROR",
        FIRMWARE_ERROR => "FIRMWARE_ERROR",
        DEVICE_NOT_FOUND => "DEVICE_NOT_FOUND",
        USER_NOT_AUTHORIZED => "USER_NOT_AUTHORIZED",
        INSUFFICIENT_BALANCE => "INSUFFICIENT_BALANCE",
        SERVICE_UNAVAILABLE => "SERVICE_UNAVAILABLE",
        RATE_LIMIT_EXCEEDED => "RATE_LIMIT_EXCEEDED",
        _ => return None,
    })
}

/// Whether `code` lies in the range JSON-RPC reserves for implementations.
pub fn is_server_error(code: i64) -> bool {
    (-32099..=-32000).contains(&code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_codes() {
        assert_eq!(PARSE_ERROR, -32700);
        assert_eq!(INVALID_REQUEST, -32600);
        assert_eq!(METHOD_NOT_FOUND, -32601);
        assert_eq!(INVALID_PARAMS, -32602);
        assert_eq!(INTERNAL_ERROR, -32603);
    }

    #[test]
    fn device_codes_are_named() {
        assert_eq!(name(DEVICE_OFFLINE), Some("DEVICE_OFFLINE"));
        assert_eq!(name(-32002), Some("DEVICE_BUSY"));
        assert_eq!(name(-32004), Some("COMMAND_TIMEOUT"));
        assert_eq!(name(1), None);
    }

    #[test]
    fn server_error_range() {
        assert!(is_server_error(DEVICE_OFFLINE));
        assert!(!is_server_error(PARSE_ERROR));
        assert!(!is_server_error(DEVICE_NOT_FOUND));
    }
}

//! Built-in configuration defaults.
//!
//! Grouped by subsystem; every value here is overridable from the TOML file.

// ============================================================================
// System Controller
// ============================================================================

/// Base URL of the system controller API, including the version prefix.
pub const SYSTEM_CONTROLLER_BASE_URL: &str = "http://127.0.0.1:8010/api/v1";

/// HTTP timeout for system controller requests (seconds).
pub const SYSTEM_CONTROLLER_TIMEOUT_SECS: u64 = 5;

/// Status poll interval (ms).
pub const SYSTEM_CONTROLLER_INTERVAL_MS: u64 = 1_000;

// ============================================================================
// Serial Link
// ============================================================================

pub const SERIAL_PORT: &str = "/dev/ttyUSB0";

/// Directory of stable device symlinks maintained by udev.
pub const SERIAL_BY_ID_DIR: &str = "/dev/serial/by-id";

pub const SERIAL_BAUD_RATE: u32 = 115_200;

/// Delay between reconnect attempts (ms).
pub const SERIAL_RECONNECT_DELAY_MS: u64 = 2_000;

/// Time to wait for a `command_ack` per attempt (ms).
pub const SERIAL_COMMAND_TIMEOUT_MS: u64 = 1_500;

/// Extra attempts after the first unacknowledged one.
pub const SERIAL_COMMAND_RETRIES: u32 = 2;

/// Longest accepted line; anything longer is treated as stream corruption.
pub const SERIAL_MAX_LINE_BYTES: usize = 8_192;

pub const SERIAL_READ_CHUNK_BYTES: usize = 1_024;

// ============================================================================
// JSONL Sources
// ============================================================================

pub const RF_JSONL_PATH: &str = "/var/log/ndefender/antsdr.jsonl";

pub const REMOTE_ID_JSONL_PATH: &str = "/var/log/ndefender/remoteid.jsonl";

/// Idle poll interval for log tailers (ms).
pub const TAIL_POLL_INTERVAL_MS: u64 = 200;

// ============================================================================
// Runtime
// ============================================================================

/// Per-subscriber queue capacity on the event bus.
pub const BUS_MAX_QUEUE_SIZE: usize = crate::bus::DEFAULT_MAX_QUEUE_SIZE;

pub const LOG_LEVEL: &str = "info";

/// Interval between health summaries logged by the binary (seconds).
pub const HEALTH_LOG_INTERVAL_SECS: u64 = 60;

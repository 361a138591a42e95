//! System-wide constants for the ecat workspace.
//!
//! Single source of truth for numeric limits, protocol bit positions and
//! runtime defaults. Imported by all crates.

/// Nanoseconds per second.
pub const NSEC_PER_SEC: u64 = 1_000_000_000;

/// Default exchange frequency (1 kHz).
pub const DEFAULT_FREQUENCY_HZ: u32 = 1000;

/// Default interval between slow-path state refreshes in milliseconds.
pub const DEFAULT_HEALTH_CHECK_INTERVAL_MS: u64 = 1000;

/// Default upper bound on the drain phase (waiting for the OP bit to clear).
pub const DEFAULT_DRAIN_TIMEOUT_MS: u64 = 5000;

/// Default sleep between two polls of an object request.
pub const DEFAULT_REQUEST_POLL_INTERVAL_US: u64 = 100;

/// Default object request timeout.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 1000;

/// Default master index requested from the driver.
pub const DEFAULT_MASTER_INDEX: u32 = 0;

/// Number of samples kept by the latency/jitter moving averages.
pub const LATENCY_WINDOW: usize = 10;

/// Maximum number of device positions addressable by the entry index.
pub const MAX_POSITIONS: usize = 256;

/// Bit widths handled by the typed codec paths.
pub const TYPED_BIT_WIDTHS: [u8; 4] = [1, 8, 16, 32];

/// Stack prefault size for the cyclic thread.
pub const MAX_SAFE_STACK: usize = 8 * 1024;

/// Default descriptor file path.
pub const DEFAULT_DEVICES_PATH: &str = "/etc/ecat/slaves.json";

/// Default master configuration path.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/ecat/master.toml";

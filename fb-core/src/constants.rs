//! Constants and configuration values for FluxBar
//!
//! Centralizes protocol constants, key names, defaults and paths.
//! Add new magic numbers here, not at the call site.

use std::time::Duration;

/// Filesystem locations
pub mod paths {
    /// Directory name under the user's config dir
    pub const CONFIG_DIR_NAME: &str = "fluxbar";

    /// Settings file inside the config directory
    pub const SETTINGS_FILE: &str = "settings.json";

    /// Raw I/O port device used by the legacy port driver
    pub const DEV_PORT: &str = "/dev/port";

    /// Resolve the config directory: `$XDG_CONFIG_HOME/fluxbar`, then the
    /// platform config dir.
    pub fn user_config_dir() -> Option<std::path::PathBuf> {
        let base = match std::env::var("XDG_CONFIG_HOME") {
            Ok(xdg) if !xdg.is_empty() => Some(std::path::PathBuf::from(xdg)),
            _ => dirs::config_dir(),
        };
        base.map(|p| p.join(CONFIG_DIR_NAME))
    }
}

/// Controller key names (four ASCII bytes each)
pub mod keys {
    /// Fan count candidates, tried in order
    pub const FAN_COUNT: &[&str] = &["FNum", "Num ", "#pn "];

    /// Forced-mode bitmask used by controllers without per-fan mode keys
    pub const FORCED_MODE_MASK: &str = "FS! ";

    /// Total number of keys the controller exposes
    pub const KEY_COUNT: &str = "#KEY";

    /// Per-fan key suffixes, combined as `F{index}{suffix}`
    pub mod fan {
        pub const ACTUAL: &str = "Ac";
        pub const MINIMUM: &str = "Mn";
        pub const MAXIMUM: &str = "Mx";
        pub const MODE: &str = "Md";
        pub const TARGET: &str = "Tg";
    }
}

/// Fan enumeration defaults
pub mod fan {
    /// Fan count assumed when no count key exists
    pub const DEFAULT_COUNT: u8 = 2;

    /// Fan keys encode the index as a single digit
    pub const MAX_COUNT: u8 = 10;

    pub const DEFAULT_MIN_RPM: u32 = 0;
    pub const DEFAULT_MAX_RPM: u32 = 6000;

    /// Label for fan index 0
    pub const PRIMARY_LABEL: &str = "Exhaust";

    /// Mode flag values
    pub const MODE_AUTO: u8 = 0;
    pub const MODE_MANUAL: u8 = 1;
}

/// Temperature plausibility band (exclusive on both ends)
pub mod temperature {
    pub const MIN_PLAUSIBLE_C: f64 = 0.0;
    pub const MAX_PLAUSIBLE_C: f64 = 150.0;

    /// Accepts values strictly inside the band
    pub fn is_plausible(celsius: f64) -> bool {
        celsius > MIN_PLAUSIBLE_C && celsius < MAX_PLAUSIBLE_C
    }
}

/// Polling cadence
pub mod timing {
    use super::Duration;

    /// Default refresh period in seconds
    pub const DEFAULT_REFRESH_SECS: f64 = 2.0;

    /// Refresh periods the engine accepts
    pub const REFRESH_CHOICES_SECS: [f64; 4] = [0.5, 1.0, 2.0, 5.0];

    /// Consecutive failed passes before the last good snapshot is withdrawn
    pub const STALE_AFTER_FAILURES: u32 = 10;

    /// Default refresh period
    pub const DEFAULT_REFRESH: Duration = Duration::from_millis(2000);

    /// Depth of the intent queue between the consumer and the worker
    pub const INTENT_QUEUE_DEPTH: usize = 32;

    /// Capacity of the snapshot notification channel
    pub const NOTIFY_CAPACITY: usize = 16;
}

/// Legacy SMC I/O port protocol
pub mod port {
    use super::Duration;

    pub const DATA_PORT: u64 = 0x300;
    pub const CMD_PORT: u64 = 0x304;

    pub const CMD_READ: u8 = 0x10;
    pub const CMD_WRITE: u8 = 0x11;
    pub const CMD_KEY_BY_INDEX: u8 = 0x12;
    pub const CMD_KEY_INFO: u8 = 0x13;

    /// Controller has data waiting to be read
    pub const STATUS_AWAITING_DATA: u8 = 0x01;
    /// Controller ignores input
    pub const STATUS_IB_CLOSED: u8 = 0x02;
    /// Command in progress
    pub const STATUS_BUSY: u8 = 0x04;

    /// Status polls before a wait is declared failed
    pub const WAIT_ATTEMPTS: u32 = 24;
    /// Initial delay between status polls, doubled after the tenth poll
    pub const WAIT_STEP: Duration = Duration::from_micros(16);

    /// Largest payload the protocol carries
    pub const MAX_DATA_LEN: u8 = 32;

    /// Key info reply: length, 4-byte type tag, flags
    pub const KEY_INFO_LEN: u8 = 6;
}

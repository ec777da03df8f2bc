//! Engine configuration and tuning constants

use std::time::Duration;

/// Maximum time a slot tolerates without receiving any data before it toggles
/// the alternate port and retries (or fails when nothing was in flight).
pub const XFER_TIMEOUT: Duration = Duration::from_secs(60);

/// Maximum spacing between progress callbacks while a transfer is active.
pub const PROGRESS_TIMEOUT: Duration = Duration::from_secs(1);

/// Files below this size are transferred over a single connection.
pub const MIN_MULTI_CONN_SIZE: u64 = 131_072;

/// Backoff applied on HTTP 429.
pub const RATE_LIMIT_BACKOFF: Duration = Duration::from_millis(500);

/// Backoff applied on HTTP 503 for non-RAID transfers.
pub const SERVICE_UNAVAILABLE_BACKOFF: Duration = Duration::from_secs(5);

/// A slot aborts the transfer once its error counter reaches this value.
pub const MAX_ERROR_COUNT: u32 = 5;

/// Configuration for the transfer engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Parallel connections per non-RAID transfer (RAID always uses 6)
    pub transfer_connections: usize,
    /// Maximum number of simultaneously active slots
    pub max_active_slots: usize,
    /// Insert `:8080` into plain-http download URLs
    pub use_alt_down_port: bool,
    /// Insert `:8080` into plain-http upload URLs
    pub use_alt_up_port: bool,
    /// Deliver downloaded pieces to disk in ascending offset order
    pub ordered_downloads: bool,
    /// Worker tasks in the crypto pool
    pub crypto_workers: usize,
    /// Physical RAM available to the client, used to size request buffers
    pub available_ram: u64,
    /// Wait applied on HTTP 509 when the server does not supply one
    pub overquota_default_backoff: Duration,
    /// Backoff before a failed transfer is rescheduled
    pub retry_backoff: Duration,
    /// Connect timeout for the HTTP client
    pub request_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            transfer_connections: 4,
            max_active_slots: 8,
            use_alt_down_port: false,
            use_alt_up_port: false,
            ordered_downloads: true,
            crypto_workers: 2,
            available_ram: 4 << 30,
            overquota_default_backoff: Duration::from_secs(60),
            retry_backoff: Duration::from_secs(3),
            request_timeout: Duration::from_secs(60),
        }
    }
}

impl EngineConfig {
    /// Per-connection request-buffer budget, stepped by available RAM.
    pub fn max_request_size(&self) -> u64 {
        const MIB: u64 = 1 << 20;
        const GIB: u64 = 1 << 30;
        if self.available_ram < GIB {
            2 * MIB
        } else if self.available_ram < 2 * GIB {
            4 * MIB
        } else if self.available_ram < 4 * GIB {
            8 * MIB
        } else {
            16 * MIB
        }
    }

    /// Connection count for a transfer of `size` bytes.
    pub fn connections_for(&self, size: u64, is_raid: bool) -> usize {
        if is_raid {
            crate::raid::RAIDPARTS
        } else if size < MIN_MULTI_CONN_SIZE {
            1
        } else {
            self.transfer_connections.max(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_size_steps_with_ram() {
        let mut config = EngineConfig::default();
        config.available_ram = 512 << 20;
        assert_eq!(config.max_request_size(), 2 << 20);
        config.available_ram = 3 << 30;
        assert_eq!(config.max_request_size(), 8 << 20);
        config.available_ram = 16 << 30;
        assert_eq!(config.max_request_size(), 16 << 20);
    }

    #[test]
    fn connection_count_rules() {
        let config = EngineConfig::default();
        assert_eq!(config.connections_for(1 << 30, true), 6);
        assert_eq!(config.connections_for(131_071, false), 1);
        assert_eq!(config.connections_for(131_072, false), 4);
    }
}

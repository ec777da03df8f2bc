//! Progress reporting with sliding-window speed calculation

use std::fmt::{Debug, Formatter};
use std::time::{Duration, Instant};

/// Progress update delivered to callbacks
#[derive(Clone)]
pub struct TransferProgress {
    /// Engine-assigned transfer id
    pub transfer_id: u64,
    /// Total file size in bytes
    pub total_size: u64,
    /// Bytes transferred so far (durable + in flight)
    pub transferred: u64,
    /// Progress percentage (0.0 - 1.0)
    pub progress: f64,
    /// Current speed in bytes per second
    pub speed_bytes_per_sec: u64,
    /// Estimated time remaining in seconds (None if speed is 0)
    pub eta_seconds: Option<u64>,
}

impl TransferProgress {
    pub fn new(transfer_id: u64, total_size: u64, transferred: u64, speed: u64) -> Self {
        let progress = if total_size > 0 {
            (transferred as f64 / total_size as f64).clamp(0.0, 1.0)
        } else {
            1.0
        };
        let eta_seconds = if speed > 0 && transferred < total_size {
            Some((total_size - transferred) / speed)
        } else {
            None
        };
        Self {
            transfer_id,
            total_size,
            transferred,
            progress,
            speed_bytes_per_sec: speed,
            eta_seconds,
        }
    }
}

impl Debug for TransferProgress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Transfer {}: {:.1}% ({} / {}) @ {} | ETA: {}",
            self.transfer_id,
            self.progress * 100.0,
            format_bytes(self.transferred),
            format_bytes(self.total_size),
            format_speed(self.speed_bytes_per_sec),
            format_eta(self.eta_seconds),
        )
    }
}

/// Format bytes into a human-readable string (e.g., "10.50 MB")
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

fn format_speed(bytes_per_sec: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_sec))
}

fn format_eta(eta_seconds: Option<u64>) -> String {
    match eta_seconds {
        None => "N/A".to_string(),
        Some(secs) => {
            let minutes = secs / 60;
            let seconds = secs % 60;
            if minutes > 0 {
                format!("{}m {}s", minutes, seconds)
            } else {
                format!("{}s", seconds)
            }
        }
    }
}

/// Sliding-window speed tracker. Owned by the slot and driven from the
/// scheduler, so no interior mutability is needed.
pub struct SpeedTracker {
    samples: Vec<(Instant, u64)>,
    window: Duration,
}

impl SpeedTracker {
    pub fn new() -> Self {
        Self {
            samples: Vec::with_capacity(32),
            window: Duration::from_secs(10),
        }
    }

    /// Records the current total and returns the speed over the window.
    pub fn record(&mut self, total_bytes: u64) -> u64 {
        let now = Instant::now();
        self.samples.push((now, total_bytes));

        let cutoff = now - self.window;
        self.samples.retain(|(t, _)| *t >= cutoff);

        if self.samples.len() >= 2 {
            let (oldest_time, oldest_bytes) = self.samples.first().unwrap();
            let elapsed = now.duration_since(*oldest_time);
            if elapsed.as_millis() > 0 {
                let diff = total_bytes.saturating_sub(*oldest_bytes);
                return (diff as f64 / elapsed.as_secs_f64()) as u64;
            }
        }
        0
    }
}

impl Default for SpeedTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_size_is_complete() {
        let p = TransferProgress::new(1, 0, 0, 0);
        assert_eq!(p.progress, 1.0);
        assert_eq!(p.eta_seconds, None);
    }

    #[test]
    fn eta_from_speed() {
        let p = TransferProgress::new(1, 1_000_000, 250_000, 50_000);
        assert_eq!(p.eta_seconds, Some(15));
        assert!((p.progress - 0.25).abs() < 1e-9);
    }

    #[test]
    fn format_helpers() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2 * 1024 * 1024), "2.00 MB");
        assert_eq!(format_eta(Some(125)), "2m 5s");
        assert_eq!(format_eta(None), "N/A");
    }
}

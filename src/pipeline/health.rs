//! Flow statistics for a stage graph

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default()
}

/// Counters updated by the data thread.
///
/// All fields use atomic operations so the control thread can read them
/// without stopping the flow.
pub struct FlowStats {
    /// Frames pulled from the source
    frames_pulled: AtomicU64,

    /// Frames that ended in a sink
    frames_consumed: AtomicU64,

    /// Frames dropped by drain barriers
    barrier_drops: AtomicU64,

    /// Stage failures while processing
    stage_errors: AtomicU64,

    /// Total bytes pulled from the source
    bytes_pulled: AtomicU64,

    /// Timestamp (as Unix microseconds) of the last pulled frame
    last_frame_time: AtomicU64,
}

impl FlowStats {
    pub fn new() -> Self {
        Self {
            frames_pulled: AtomicU64::new(0),
            frames_consumed: AtomicU64::new(0),
            barrier_drops: AtomicU64::new(0),
            stage_errors: AtomicU64::new(0),
            bytes_pulled: AtomicU64::new(0),
            last_frame_time: AtomicU64::new(now_micros()),
        }
    }

    pub fn record_pull(&self, size: usize) {
        self.last_frame_time.store(now_micros(), Ordering::Relaxed);
        self.frames_pulled.fetch_add(1, Ordering::Relaxed);
        self.bytes_pulled.fetch_add(size as u64, Ordering::Relaxed);
    }

    pub fn record_consumed(&self) {
        self.frames_consumed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_barrier_drop(&self) {
        self.barrier_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stage_error(&self) {
        self.stage_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frames_pulled(&self) -> u64 {
        self.frames_pulled.load(Ordering::Relaxed)
    }

    pub fn frames_consumed(&self) -> u64 {
        self.frames_consumed.load(Ordering::Relaxed)
    }

    pub fn barrier_drops(&self) -> u64 {
        self.barrier_drops.load(Ordering::Relaxed)
    }

    pub fn stage_errors(&self) -> u64 {
        self.stage_errors.load(Ordering::Relaxed)
    }

    pub fn bytes_pulled(&self) -> u64 {
        self.bytes_pulled.load(Ordering::Relaxed)
    }

    /// Check if the source has stalled (no frames for given duration)
    pub fn is_stalled(&self, threshold: Duration) -> bool {
        let last_frame = self.last_frame_time.load(Ordering::Relaxed);
        now_micros().saturating_sub(last_frame) > threshold.as_micros() as u64
    }

    pub fn summary(&self) -> FlowSummary {
        FlowSummary {
            frames_pulled: self.frames_pulled(),
            frames_consumed: self.frames_consumed(),
            barrier_drops: self.barrier_drops(),
            stage_errors: self.stage_errors(),
            bytes_pulled: self.bytes_pulled(),
        }
    }
}

impl Default for FlowStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of flow counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlowSummary {
    pub frames_pulled: u64,
    pub frames_consumed: u64,
    pub barrier_drops: u64,
    pub stage_errors: u64,
    pub bytes_pulled: u64,
}

impl std::fmt::Display for FlowSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Flow: {} frames pulled ({} bytes), {} consumed, {} barrier drops, {} stage errors",
            self.frames_pulled,
            self.bytes_pulled,
            self.frames_consumed,
            self.barrier_drops,
            self.stage_errors
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_counters() {
        let stats = FlowStats::new();

        stats.record_pull(1000);
        stats.record_pull(2000);
        stats.record_consumed();
        stats.record_barrier_drop();

        let summary = stats.summary();
        assert_eq!(summary.frames_pulled, 2);
        assert_eq!(summary.bytes_pulled, 3000);
        assert_eq!(summary.frames_consumed, 1);
        assert_eq!(summary.barrier_drops, 1);
        assert_eq!(summary.stage_errors, 0);
    }

    #[test]
    fn test_stall_detection() {
        let stats = FlowStats::new();

        assert!(!stats.is_stalled(Duration::from_secs(1)));

        stats.record_pull(10);
        std::thread::sleep(Duration::from_millis(150));

        assert!(stats.is_stalled(Duration::from_millis(100)));
    }
}

//! Liveness detection: the root pings every connected proxy on a fixed
//! interval and tears down the ones that stop answering.

use std::time::Duration;

/// Heartbeat cadence and tolerance.
#[derive(Clone, Copy, Debug)]
pub struct HeartbeatConfig {
    /// Gap between pings to each connected proxy.
    pub interval: Duration,
    /// Consecutive unanswered pings after which a proxy is considered gone.
    pub max_missed: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            max_missed: 3,
        }
    }
}

/// Outstanding pings for one connection.
///
/// Any valid acknowledgement clears the whole backlog: a proxy that answers
/// at all is alive, however far behind it is.
#[derive(Debug, Default)]
pub(crate) struct LivenessTracker {
    outstanding: Vec<String>,
}

impl LivenessTracker {
    pub(crate) fn record_ping(&mut self, event_uuid: String) {
        self.outstanding.push(event_uuid);
    }

    /// Returns whether the acknowledged uuid belonged to an outstanding ping.
    pub(crate) fn acknowledge(&mut self, event_uuid: &str) -> bool {
        if self.outstanding.iter().any(|u| u == event_uuid) {
            self.outstanding.clear();
            true
        } else {
            false
        }
    }

    pub(crate) fn missed(&self) -> u32 {
        self.outstanding.len() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acknowledgement_clears_the_backlog() {
        let mut tracker = LivenessTracker::default();
        tracker.record_ping("a".into());
        tracker.record_ping("b".into());
        assert_eq!(tracker.missed(), 2);

        assert!(tracker.acknowledge("a"));
        assert_eq!(tracker.missed(), 0);
    }

    #[test]
    fn unknown_acknowledgements_are_ignored() {
        let mut tracker = LivenessTracker::default();
        tracker.record_ping("a".into());
        assert!(!tracker.acknowledge("zzz"));
        assert_eq!(tracker.missed(), 1);
    }
}

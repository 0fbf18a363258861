//! Per-flow forwarding counters
//!
//! Debug aid: counts packets per flow and logs the first packet of each flow
//! and every hundredth after it. Disabled counters cost one branch.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

/// Log every Nth packet of a flow
pub const LOG_EVERY: u64 = 100;

#[derive(Debug, Default)]
pub struct ForwardStats {
    enabled: bool,
    counts: Mutex<HashMap<String, u64>>,
}

impl ForwardStats {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            counts: Mutex::new(HashMap::new()),
        }
    }

    pub fn disabled() -> Self {
        Self::new(false)
    }

    /// Count one packet for `flow`, returning the new total (0 when disabled)
    pub fn record(&self, direction: &str, flow: impl fmt::Display) -> u64 {
        if !self.enabled {
            return 0;
        }

        let key = format!("{} {}", direction, flow);
        let count = {
            let mut counts = self.counts.lock();
            let count = counts.entry(key).or_insert(0);
            *count += 1;
            *count
        };

        if count == 1 || count % LOG_EVERY == 0 {
            debug!(direction, %flow, count, "Forwarded packets");
        }
        count
    }

    /// Current total for `flow`
    pub fn count(&self, direction: &str, flow: impl fmt::Display) -> u64 {
        let key = format!("{} {}", direction, flow);
        self.counts.lock().get(&key).copied().unwrap_or(0)
    }
}

//! Millisecond wall-clock helpers.
//!
//! Gossip timestamps travel between nodes, so they are wall-clock epoch
//! milliseconds rather than `Instant`s. Everything that needs testable
//! timing takes `now` as a parameter and calls [`now_ms`] only at the rim.

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the UNIX epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_advances() {
        let a = now_ms();
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(now_ms() >= a + 1);
    }
}

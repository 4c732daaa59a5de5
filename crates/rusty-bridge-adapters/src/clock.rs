use std::time::{SystemTime, UNIX_EPOCH};

use rusty_bridge_core::{ClockPort, PortError};

/// Wall-clock milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl ClockPort for SystemClock {
    fn now_ms(&self) -> Result<u64, PortError> {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| PortError::Transport(format!("system clock before unix epoch: {e}")))?;
        u64::try_from(elapsed.as_millis())
            .map_err(|_| PortError::Transport("system clock out of range".to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_moves_forward() {
        let first = SystemClock.now_ms().expect("clock");
        let second = SystemClock.now_ms().expect("clock");
        assert!(second >= first);
        assert!(first > 1_600_000_000_000);
    }
}

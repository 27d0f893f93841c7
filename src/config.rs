use std::time::Duration;

use crate::protocol::DEFAULT_PORT;

/// Upper bound on concurrent probes, whatever the caller asks for.
pub const MAX_CONCURRENCY: usize = 5_000;

/// Tunables for a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanConfig {
    /// Port used for hosts that do not name one.
    pub port: u16,
    /// Bound on each connect, send and read wait.
    pub timeout: Duration,
    /// Maximum number of probes in flight.
    pub concurrency: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            timeout: Duration::from_secs(30),
            concurrency: 20,
        }
    }
}

impl ScanConfig {
    pub fn effective_concurrency(&self) -> usize {
        self.concurrency.clamp(1, MAX_CONCURRENCY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrency_is_clamped() {
        let mut cfg = ScanConfig::default();
        assert_eq!(cfg.effective_concurrency(), 20);
        cfg.concurrency = 0;
        assert_eq!(cfg.effective_concurrency(), 1);
        cfg.concurrency = 1_000_000;
        assert_eq!(cfg.effective_concurrency(), MAX_CONCURRENCY);
    }
}

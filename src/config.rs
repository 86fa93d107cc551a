//! Runtime tunables shared by clients, servers and the discovery service.

use std::time::Duration;

/// Environment variable that shortens every timeout to test-friendly values.
pub const TESTING_ENV: &str = "TESTING";

/// Timeout table for blocking I/O and liveness tracking.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    /// Dial timeout for outbound connections.
    pub connect: Duration,
    /// Per-call send/recv timeout.
    pub io: Duration,
    /// Whole-handshake deadline.
    pub handshake: Duration,
    /// Cadence at which clients emit PING.
    pub ping_interval: Duration,
    /// A session with no PONG for this long is dead.
    pub pong_death: Duration,
    /// Grace period to flush the send queue on CLIENT_LEAVE.
    pub leave_flush: Duration,
    /// TCP keepalive probe interval.
    pub keepalive: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            io: Duration::from_secs(30),
            handshake: Duration::from_secs(15),
            ping_interval: Duration::from_secs(5),
            pong_death: Duration::from_secs(30),
            leave_flush: Duration::from_secs(2),
            keepalive: Duration::from_secs(30),
        }
    }
}

impl Timeouts {
    /// Production defaults, shortened when `TESTING` is set so suites never
    /// wait on wall-clock timeouts.
    pub fn from_env() -> Self {
        if std::env::var(TESTING_ENV).is_ok() {
            Self::testing()
        } else {
            Self::default()
        }
    }

    pub fn testing() -> Self {
        Self {
            connect: Duration::from_secs(1),
            io: Duration::from_secs(1),
            handshake: Duration::from_secs(2),
            ping_interval: Duration::from_millis(200),
            pong_death: Duration::from_secs(1),
            leave_flush: Duration::from_millis(200),
            keepalive: Duration::from_secs(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn testing_profile_is_uniformly_shorter() {
        let prod = Timeouts::default();
        let test = Timeouts::testing();
        assert!(test.connect < prod.connect);
        assert!(test.io < prod.io);
        assert!(test.handshake < prod.handshake);
        assert!(test.ping_interval < prod.ping_interval);
        assert!(test.pong_death < prod.pong_death);
        assert!(test.leave_flush < prod.leave_flush);
    }
}

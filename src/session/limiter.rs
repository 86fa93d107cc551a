//! Token-bucket rate limiting per (subject, event kind).
//!
//! Pre-join events are limited per source IP; post-join events per client
//! id. A violation answers with RATE_LIMITED but only a sustained run of
//! violations closes the connection.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Instant;

use parking_lot::Mutex;

/// Event classes with independent budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ImageFrame,
    Audio,
    Ping,
    ClientJoin,
    Control,
}

/// Who a bucket belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subject {
    Ip(IpAddr),
    Client(u32),
}

/// Refill rate and burst per event kind.
#[derive(Debug, Clone, Copy)]
pub struct Budget {
    pub per_second: f64,
    pub burst: f64,
}

#[derive(Debug, Clone)]
pub struct RateConfig {
    pub image: Budget,
    pub audio: Budget,
    pub ping: Budget,
    pub join: Budget,
    pub control: Budget,
    /// Consecutive violations after which the connection is dropped.
    pub sustained_violations: u32,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            image: Budget {
                per_second: 60.0,
                burst: 90.0,
            },
            audio: Budget {
                per_second: 200.0,
                burst: 300.0,
            },
            ping: Budget {
                per_second: 10.0,
                burst: 20.0,
            },
            join: Budget {
                per_second: 5.0,
                burst: 10.0,
            },
            control: Budget {
                per_second: 20.0,
                burst: 40.0,
            },
            sustained_violations: 50,
        }
    }
}

impl RateConfig {
    fn budget(&self, kind: EventKind) -> Budget {
        match kind {
            EventKind::ImageFrame => self.image,
            EventKind::Audio => self.audio,
            EventKind::Ping => self.ping,
            EventKind::ClientJoin => self.join,
            EventKind::Control => self.control,
        }
    }
}

/// Outcome of a limiter check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    /// Over budget; `sustained` means the violation streak warrants
    /// closing the connection.
    Limited { sustained: bool },
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
    violations: u32,
}

/// Shared limiter state for one server or discovery instance.
pub struct RateLimiter {
    config: RateConfig,
    buckets: Mutex<HashMap<(Subject, EventKind), Bucket>>,
}

impl RateLimiter {
    pub fn new(config: RateConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn check(&self, subject: Subject, kind: EventKind) -> Decision {
        self.check_at(subject, kind, Instant::now())
    }

    fn check_at(&self, subject: Subject, kind: EventKind, now: Instant) -> Decision {
        let budget = self.config.budget(kind);
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry((subject, kind)).or_insert(Bucket {
            tokens: budget.burst,
            last_refill: now,
            violations: 0,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * budget.per_second).min(budget.burst);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            bucket.violations = 0;
            Decision::Allowed
        } else {
            bucket.violations += 1;
            Decision::Limited {
                sustained: bucket.violations >= self.config.sustained_violations,
            }
        }
    }

    /// Drops all buckets owned by a departed client.
    pub fn forget_client(&self, client_id: u32) {
        self.buckets
            .lock()
            .retain(|(subject, _), _| *subject != Subject::Client(client_id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ip(last: u8) -> Subject {
        Subject::Ip(IpAddr::from([10, 0, 0, last]))
    }

    #[test]
    fn burst_exhausts_then_limits() {
        let limiter = RateLimiter::new(RateConfig::default());
        let now = Instant::now();
        for _ in 0..10 {
            assert_eq!(
                limiter.check_at(ip(1), EventKind::ClientJoin, now),
                Decision::Allowed
            );
        }
        assert!(matches!(
            limiter.check_at(ip(1), EventKind::ClientJoin, now),
            Decision::Limited { sustained: false }
        ));
    }

    #[test]
    fn other_subjects_are_unaffected() {
        let limiter = RateLimiter::new(RateConfig::default());
        let now = Instant::now();
        for _ in 0..200 {
            let _ = limiter.check_at(ip(1), EventKind::ClientJoin, now);
        }
        assert_eq!(
            limiter.check_at(ip(2), EventKind::ClientJoin, now),
            Decision::Allowed
        );
        assert_eq!(
            limiter.check_at(ip(1), EventKind::Ping, now),
            Decision::Allowed
        );
    }

    #[test]
    fn tokens_refill_over_time() {
        let limiter = RateLimiter::new(RateConfig::default());
        let start = Instant::now();
        for _ in 0..10 {
            let _ = limiter.check_at(ip(3), EventKind::ClientJoin, start);
        }
        assert!(matches!(
            limiter.check_at(ip(3), EventKind::ClientJoin, start),
            Decision::Limited { .. }
        ));
        let later = start + Duration::from_secs(1);
        assert_eq!(
            limiter.check_at(ip(3), EventKind::ClientJoin, later),
            Decision::Allowed
        );
    }

    #[test]
    fn sustained_violations_flag_for_close() {
        let config = RateConfig {
            sustained_violations: 3,
            ..RateConfig::default()
        };
        let limiter = RateLimiter::new(config);
        let now = Instant::now();
        let subject = Subject::Client(7);
        for _ in 0..90 {
            let _ = limiter.check_at(subject, EventKind::ImageFrame, now);
        }
        assert!(matches!(
            limiter.check_at(subject, EventKind::ImageFrame, now),
            Decision::Limited { sustained: false }
        ));
        let _ = limiter.check_at(subject, EventKind::ImageFrame, now);
        assert!(matches!(
            limiter.check_at(subject, EventKind::ImageFrame, now),
            Decision::Limited { sustained: true }
        ));
    }

    #[test]
    fn allowed_resets_the_violation_streak() {
        let config = RateConfig {
            sustained_violations: 5,
            ..RateConfig::default()
        };
        let limiter = RateLimiter::new(config);
        let start = Instant::now();
        let subject = Subject::Client(9);
        while limiter.check_at(subject, EventKind::Ping, start) == Decision::Allowed {}
        assert!(matches!(
            limiter.check_at(subject, EventKind::Ping, start),
            Decision::Limited { sustained: false }
        ));
        let later = start + Duration::from_secs(2);
        assert_eq!(
            limiter.check_at(subject, EventKind::Ping, later),
            Decision::Allowed
        );
        // Streak restarted: draining the refilled tokens limits again, but
        // the violation count starts over.
        while limiter.check_at(subject, EventKind::Ping, later) == Decision::Allowed {}
        assert!(matches!(
            limiter.check_at(subject, EventKind::Ping, later),
            Decision::Limited { sustained: false }
        ));
    }

    #[test]
    fn forget_client_releases_buckets() {
        let limiter = RateLimiter::new(RateConfig::default());
        let now = Instant::now();
        for _ in 0..90 {
            let _ = limiter.check_at(Subject::Client(4), EventKind::ImageFrame, now);
        }
        limiter.forget_client(4);
        assert_eq!(
            limiter.check_at(Subject::Client(4), EventKind::ImageFrame, now),
            Decision::Allowed
        );
    }
}

//! Login-attempt limiter (C10): blocks brute-force credential guessing per
//! remote IP across SMTP-MSA login, IMAP login and the REST login endpoint.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_BLOCK_DURATION: Duration = Duration::from_secs(2 * 60 * 60);

struct AttemptRecord {
    count: u32,
    last_attempt: Instant,
}

impl AttemptRecord {
    fn fresh() -> Self {
        AttemptRecord {
            count: 1,
            last_attempt: Instant::now(),
        }
    }

    fn increment(&mut self) {
        self.count += 1;
        self.last_attempt = Instant::now();
    }

    fn reset(&mut self) {
        self.count = 0;
        self.last_attempt = Instant::now();
    }
}

pub struct LoginAttempts {
    attempts: Mutex<HashMap<IpAddr, AttemptRecord>>,
    max_attempts: u32,
    block_duration: Duration,
}

impl LoginAttempts {
    pub fn new(max_attempts: u32, block_duration: Duration) -> Self {
        LoginAttempts {
            attempts: Mutex::new(HashMap::new()),
            max_attempts,
            block_duration,
        }
    }

    /// True iff `ip` has no record, or its record has expired (and is reset
    /// as a side effect), or it has fewer than `max_attempts` failures.
    pub fn can_login(&self, ip: IpAddr) -> bool {
        let mut attempts = self.attempts.lock();
        let Some(record) = attempts.get_mut(&ip) else {
            return true;
        };
        if record.last_attempt.elapsed() > self.block_duration {
            record.reset();
            return true;
        }
        record.count < self.max_attempts
    }

    /// Records a failed attempt, returning the new count.
    pub fn add_failed_attempt(&self, ip: IpAddr) -> u32 {
        let mut attempts = self.attempts.lock();
        match attempts.get_mut(&ip) {
            Some(record) => {
                record.increment();
                record.count
            }
            None => {
                attempts.insert(ip, AttemptRecord::fresh());
                1
            }
        }
    }
}

impl Default for LoginAttempts {
    fn default() -> Self {
        LoginAttempts::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_BLOCK_DURATION)
    }
}

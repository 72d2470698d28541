use std::time::Instant;

/// Byte-rate limiter for one outbound link. Tokens accrue at `rate` bytes
/// per second up to one second of burst; a message may leave only when the
/// bucket holds its full size. Time is supplied by the caller.
#[derive(Debug)]
pub struct TokenBucket {
    tokens: f64,
    capacity: f64,
    rate: f64,
    last_update: Instant,
}

impl TokenBucket {
    pub fn new(rate_bytes_per_sec: u64, now: Instant) -> Self {
        let rate = rate_bytes_per_sec as f64;
        Self {
            tokens: rate,
            capacity: rate,
            rate,
            last_update: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_update = now;
    }

    /// Take `bytes` tokens if available.
    pub fn try_consume(&mut self, bytes: usize, now: Instant) -> bool {
        self.refill(now);
        let needed = bytes as f64;
        if self.tokens >= needed {
            self.tokens -= needed;
            true
        } else {
            false
        }
    }

    pub fn available(&mut self, now: Instant) -> u64 {
        self.refill(now);
        self.tokens.max(0.0) as u64
    }
}

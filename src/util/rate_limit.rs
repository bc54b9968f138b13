//! Inbound rate limits

use std::num::NonZeroU32;
use std::sync::Arc;

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};

/// Unkeyed token bucket
pub type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Sustained inbound WebSocket messages per second, per socket
pub const INPUT_RATE_LIMIT: u32 = 40;

/// Burst allowance per socket; a full Omnislash batch arrives at once
pub const INPUT_BURST: u32 = 60;

/// Battle creations per second across the server
pub const BATTLE_CREATE_RATE_LIMIT: u32 = 5;

fn nonzero(n: u32) -> NonZeroU32 {
    NonZeroU32::new(n).unwrap_or(NonZeroU32::MIN)
}

/// Shared limiter allowing `per_second` with an equal burst
pub fn create_limiter(per_second: u32) -> Arc<Limiter> {
    Arc::new(RateLimiter::direct(Quota::per_second(nonzero(per_second))))
}

/// Per-socket gate on inbound messages. Counts what it turns away so the
/// connection can report it on close.
pub struct InputGate {
    limiter: Limiter,
    dropped: u64,
}

impl InputGate {
    pub fn new() -> Self {
        Self::with_quota(INPUT_RATE_LIMIT, INPUT_BURST)
    }

    pub fn with_quota(per_second: u32, burst: u32) -> Self {
        let quota = Quota::per_second(nonzero(per_second)).allow_burst(nonzero(burst));
        Self {
            limiter: RateLimiter::direct(quota),
            dropped: 0,
        }
    }

    /// Whether the next message may be processed
    pub fn admit(&mut self) -> bool {
        let admitted = self.limiter.check().is_ok();
        if !admitted {
            self.dropped += 1;
        }
        admitted
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl Default for InputGate {
    fn default() -> Self {
        Self::new()
    }
}

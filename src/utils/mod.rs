pub mod idempotency;
pub mod rate_limiter;
pub mod time;

pub use idempotency::generate_idempotency_key;
pub use rate_limiter::RateLimiter;
pub use time::*;


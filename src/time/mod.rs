pub mod session;
pub mod holidays;

// Re-export specific items to avoid ambiguity
pub use session::{get_market_timings, is_trading_day as is_trading_day_weekday_only};
pub use holidays::{is_trading_day, next_trading_day, previous_trading_day, get_nse_holidays_2025};


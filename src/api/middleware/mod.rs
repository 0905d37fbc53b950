//! HTTP middleware stack.
//!
//! Data routes: auth guard only.
//! Admin routes (outermost → innermost):
//! 1. Audit — records every attempt, including rejected ones
//! 2. Auth — `X-Admin-Key` or loopback fallback
//! 3. Rate limiter — sliding window per resolved caller

pub mod audit;
pub mod auth;
pub mod rate;

//! Ratekeeper - per-client request admission
//!
//! This crate decides, for every incoming request, whether a client still has
//! budget in its current window. Counting state lives in an injectable
//! [`ratelimit::WindowStore`], stale records are evicted by a background
//! [`sweeper::Sweeper`], and the decision carries the metadata a serving layer
//! needs to answer with `429 Too Many Requests`.

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod replay;
pub mod sweeper;

//! Rate limiting logic and state management.

mod decision;
mod key;
mod limiter;
mod store;
mod window;

pub use decision::{
    Decision, HEADER_LIMIT, HEADER_REMAINING, HEADER_RESET, HEADER_RETRY_AFTER,
};
pub use key::{ClientKey, HeaderKey, KeyExtractor, PeerAddr, RequestMeta};
pub use limiter::{LimiterStats, RateLimiter, StatsSnapshot};
pub use store::{LockedStore, ShardedStore, WindowStore};
pub use window::{Admission, ClientWindow, Policy, WindowState};

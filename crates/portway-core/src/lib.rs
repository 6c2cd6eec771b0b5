pub mod cache;
pub mod config;

pub use cache::{is_cacheable, make_key, CacheEntry, ResponseCache};
pub use config::{ConcurrencyModel, ConfigError, ProxyConfig};

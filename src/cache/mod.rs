//! Cache storage primitive
//!
//! Named cache scopes mapping a request key to a stored response, plus a
//! caller-driven expiration pass (max age and/or max entry count) that is
//! applied lazily on read and write.

pub mod expiration;
pub mod storage;

// Re-exports
pub use expiration::{CacheExpiration, ExpirationPolicy};
pub use storage::{CacheStorage, MemoryCacheStorage, StoredResponse};

/// Normalize a cache key: fragments never distinguish cached entries.
pub fn normalize_key(key: &str) -> String {
    match url::Url::parse(key) {
        Ok(mut url) => {
            url.set_fragment(None);
            url.to_string()
        }
        Err(_) => key.split('#').next().unwrap_or(key).to_string(),
    }
}

//! Local key-value cache collaborator.
//!
//! Used for the inventory snapshot backing identity-lookup fallback and for
//! offline display. Best-effort: a platform may provide no cache at all, in
//! which case [`NoLocalCache`] is wired in.

use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Local cache failures. Never fatal to a ledger operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The cache is not available on this platform
    #[error("local cache unavailable")]
    Unavailable,
    /// Reading or writing failed
    #[error("local cache I/O failed: {0}")]
    Io(String),
}

/// Boxed future returned by cache methods.
pub type CacheFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, CacheError>> + Send + 'a>>;

/// Key-value storage of serialized snapshots.
pub trait LocalCache: Send + Sync {
    /// Read the bytes stored under `key`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the cache cannot be read.
    fn get(&self, key: &str) -> CacheFuture<'_, Option<Vec<u8>>>;

    /// Store `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the cache cannot be written.
    fn set(&self, key: &str, value: Vec<u8>) -> CacheFuture<'_, ()>;
}

/// A cache that holds nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLocalCache;

impl LocalCache for NoLocalCache {
    fn get(&self, _key: &str) -> CacheFuture<'_, Option<Vec<u8>>> {
        Box::pin(async { Ok(None) })
    }

    fn set(&self, _key: &str, _value: Vec<u8>) -> CacheFuture<'_, ()> {
        Box::pin(async { Err(CacheError::Unavailable) })
    }
}

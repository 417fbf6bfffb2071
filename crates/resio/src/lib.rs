//! # Resio
//!
//! A resource fetch-and-cache engine. Given a URL, Resio either answers
//! from a bounded in-memory cache or issues a single de-duplicated network
//! fetch on behalf of every concurrent requester, fanning the result out to
//! all of them.
//!
//! ## Features
//!
//! - Bounded payload cache with recency-based batch eviction
//! - Fetch coalescing: at most one in-flight download per key
//! - Weakly-referenced observers with exactly-once result delivery
//! - Observer-scoped cancellation that never aborts shared downloads
//! - Pluggable transport (HTTP implementation included)

pub mod builder;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod fetcher;
pub mod observer;
pub mod transport;

pub use builder::FetcherConfigBuilder;
pub use cache::BoundedCache;
pub use config::FetcherConfig;
pub use coordinator::FetchCoordinator;
pub use error::FetchError;
pub use fetcher::ResourceFetcher;
pub use observer::FetchObserver;
pub use transport::{ByteTransport, HttpTransport, create_client};

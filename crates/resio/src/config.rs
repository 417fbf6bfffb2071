use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";

/// Default maximum number of cached payloads.
pub const DEFAULT_CACHE_CAPACITY: usize = 300;

/// Default clearance factor: each over-capacity event evicts roughly
/// 1/factor of the entries.
pub const DEFAULT_CLEARANCE_FACTOR: usize = 4;

/// Default bound on concurrently running transport fetches.
pub const DEFAULT_MAX_CONCURRENT_FETCHES: usize = 8;

/// Configurable options for the fetch engine
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Maximum number of payloads kept in the cache
    pub cache_capacity: usize,

    /// Eviction batch divisor; an over-capacity insertion evicts roughly
    /// `1/clearance_factor` of the entries (minimum 2)
    pub clearance_factor: usize,

    /// Maximum number of transport fetches running at the same time
    pub max_concurrent_fetches: usize,

    /// Whether a shared in-flight fetch is aborted once its last observer
    /// detaches. Off by default: another caller may request the same key
    /// moments later and join the existing download.
    pub cancel_when_unobserved: bool,

    /// Overall timeout for the entire HTTP request
    pub timeout: Duration,

    /// Connection timeout (time to establish initial connection)
    pub connect_timeout: Duration,

    /// Whether to follow redirects
    pub follow_redirects: bool,

    /// User agent string
    pub user_agent: String,

    /// Custom HTTP headers for requests
    pub headers: HeaderMap,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            clearance_factor: DEFAULT_CLEARANCE_FACTOR,
            max_concurrent_fetches: DEFAULT_MAX_CONCURRENT_FETCHES,
            cancel_when_unobserved: false,
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            follow_redirects: true,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: FetcherConfig::get_default_headers(),
        }
    }
}

impl FetcherConfig {
    pub fn builder() -> crate::builder::FetcherConfigBuilder {
        crate::builder::FetcherConfigBuilder::new()
    }

    /// Clamp out-of-range fields into their valid domains.
    ///
    /// A zero capacity or pool size becomes 1, a clearance factor below 2
    /// becomes 2. Called once when the engine is constructed.
    pub(crate) fn sanitized(mut self) -> Self {
        self.cache_capacity = self.cache_capacity.max(1);
        self.clearance_factor = self.clearance_factor.max(2);
        self.max_concurrent_fetches = self.max_concurrent_fetches.max(1);
        self
    }

    pub fn get_default_headers() -> HeaderMap {
        let mut default_headers = HeaderMap::new();

        default_headers.insert(
            reqwest::header::ACCEPT_ENCODING,
            HeaderValue::from_static("gzip, deflate"),
        );

        default_headers.insert(
            reqwest::header::CONNECTION,
            HeaderValue::from_static("keep-alive"),
        );

        default_headers.insert(reqwest::header::ACCEPT, HeaderValue::from_static("*/*"));

        default_headers
    }
}

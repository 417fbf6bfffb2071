//! # Fetch Observers
//!
//! This module defines the capability trait implemented by anything that
//! wants to be notified about the outcome of a fetch: UI bindings, decoders,
//! test doubles. The engine holds observers only as weak references, so an
//! observer's lifetime stays entirely under its owner's control and a dropped
//! observer never keeps a fetch task alive.

use bytes::Bytes;

use crate::error::FetchError;

/// A capability for receiving fetch outcomes and lifecycle notifications.
///
/// `on_result` is invoked exactly once per completed fetch task for every
/// observer that was still attached (and alive) when fan-out began. The two
/// lifecycle hooks are optional; the default implementations do nothing.
pub trait FetchObserver: Send + Sync {
    /// Called with the outcome of a fetch for `key`.
    ///
    /// `from_cache` is `true` when the payload was served directly from the
    /// cache without touching the transport. Notifications for one key are
    /// never delivered concurrently.
    fn on_result(&self, key: &str, outcome: Result<&Bytes, &FetchError>, from_cache: bool);

    /// Called after this observer's interest in `key` has been cancelled.
    fn on_cancelled(&self, _key: &str) {}

    /// Called after the cached payload for `key` has been evicted on this
    /// observer's behalf.
    fn on_cache_cleared(&self, _key: &str) {}
}

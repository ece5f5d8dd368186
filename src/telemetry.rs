//! Telemetry metric name constants.
//!
//! Centralised metric names for repsync operations. Consumers install
//! their own `metrics` recorder (e.g. prometheus, statsd); without a
//! recorder installed, all metric calls are no-ops.
//!
//! # Metric naming conventions
//!
//! All metrics are prefixed with `repsync_`. Counters end in `_total`.
//!
//! # Common labels
//!
//! - `resource` — resource type of a cache-aside read (e.g. "workout")
//! - `layer` — where a hit was served from
//! - `kind` — entity kind of a mutation
//! - `outcome` — mutation resolution: "confirmed", "rolled_back", "removed"
//! - `error` — error kind label from [`SyncError::kind()`](crate::SyncError::kind)

/// Total cache hits on `read`.
///
/// Labels: `resource`, `layer` ("overlay" | "memory" | "persistent").
pub const CACHE_HITS_TOTAL: &str = "repsync_cache_hits_total";

/// Total cache misses on `read`.
///
/// Labels: `resource`.
pub const CACHE_MISSES_TOTAL: &str = "repsync_cache_misses_total";

/// Total group invalidations.
///
/// Labels: `group`.
pub const CACHE_INVALIDATIONS_TOTAL: &str = "repsync_cache_invalidations_total";

/// Total transport calls made by the sync core.
///
/// Labels: `request` ("read" | "write" | "fetch"), `status` ("ok" | "error").
pub const TRANSPORT_REQUESTS_TOTAL: &str = "repsync_transport_requests_total";

/// Total optimistic mutations submitted (before coalescing).
///
/// Labels: `kind`.
pub const MUTATIONS_SUBMITTED_TOTAL: &str = "repsync_mutations_submitted_total";

/// Total mutation resolutions.
///
/// Labels: `kind`, `outcome`.
pub const MUTATIONS_RESOLVED_TOTAL: &str = "repsync_mutations_resolved_total";

/// Total fetch attempts, including the first attempt per candidate.
pub const FETCH_ATTEMPTS_TOTAL: &str = "repsync_fetch_attempts_total";

/// Total fetch retries (same candidate, after backoff).
///
/// Labels: `error`.
pub const FETCH_RETRIES_TOTAL: &str = "repsync_fetch_retries_total";

/// Total failovers to the next candidate.
pub const FETCH_FAILOVERS_TOTAL: &str = "repsync_fetch_failovers_total";

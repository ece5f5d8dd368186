//! repsync - client-side data synchronization core
//!
//! Sits between UI code and a remote JSON API and gives it four things:
//!
//! - **cache-aside reads** through a TTL [`ResourceCache`] keyed by request
//!   shape, with group invalidation
//! - **optimistic mutations** that apply locally at once, debounce, send one
//!   call, then confirm, roll back, or remove ([`MutationCoordinator`])
//! - **resilient loads** over ordered candidate sources with per-candidate
//!   retry, exponential backoff, and failover ([`ResilientFetcher`])
//! - **change broadcast** on named topics ([`BroadcastHub`])
//!
//! The core owns no I/O. Network calls go through a [`Transport`], durable
//! values through a [`PersistentStore`], time through a [`Clock`] and
//! [`Timer`]. [`SyncClient`] wires them together.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use repsync::{EntityRef, ResourceDescriptor, SyncClient, SyncEvent};
//! use repsync::transport::HttpTransport;
//!
//! #[tokio::main]
//! async fn main() -> repsync::Result<()> {
//!     let transport = Arc::new(HttpTransport::new("https://api.example.com/v1")?);
//!     let client = SyncClient::builder().transport(transport).build()?;
//!
//!     let workouts = client
//!         .read(&ResourceDescriptor::new("workouts").param("page", 1).group("workout"))
//!         .await?;
//!     println!("{workouts}");
//!
//!     let entity = EntityRef::new("workout", "42");
//!     let _sub = client.subscribe(repsync::hub::topic::entity(&entity), |event| {
//!         if let SyncEvent::Mutation(m) = event {
//!             println!("{:?}", m.resolution);
//!         }
//!     });
//!     client.mutate(entity, &serde_json::json!({"status": "completed"}));
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod fetch;
pub mod hub;
pub mod mutation;
pub mod runtime;
pub mod store;
pub mod telemetry;
pub mod traits;
pub mod transport;
pub mod types;

// Re-export main types at crate root
pub use cache::{CacheConfig, CacheEntry, FillTicket, PersistentLayer, ResourceCache};
pub use client::{SyncClient, SyncClientBuilder};
pub use config::{SyncConfig, TransportConfig};
pub use error::{Result, SyncError};
pub use fetch::{FetchConfig, FetchOutcome, FetchSession, ResilientFetcher};
pub use hub::{BroadcastHub, Subscription};
pub use mutation::{CoordinatorParts, MutationConfig, MutationCoordinator};
pub use runtime::{ManualClock, TokioClock};
pub use store::{JsonFileStore, MemoryStore};
pub use traits::{Clock, PersistentStore, Timer, TimerToken, Transport};

// Re-export all types
pub use types::{
    AttemptRecord, CacheKey, EntityRef, FetchCandidate, FetchEvent, FetchState, MutationEvent,
    MutationResolution, Request, ResourceDescriptor, SyncEvent, merge_patch,
};

/// Package version from Cargo.toml.
pub const PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

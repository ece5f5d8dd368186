//! Public types for the repsync API.

mod descriptor;
mod event;
mod fetch;
mod patch;
mod request;

pub use descriptor::{CacheKey, EntityRef, ResourceDescriptor};
pub use event::{FetchEvent, MutationEvent, MutationResolution, SyncEvent};
pub use fetch::{AttemptRecord, FetchCandidate, FetchState};
pub use patch::merge_patch;
pub use request::Request;

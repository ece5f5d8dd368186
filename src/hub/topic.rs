//! Topic naming.
//!
//! Every component publishes on topics built here, so UI code can
//! subscribe without knowing which component produces the event.

use crate::types::EntityRef;

/// Mutation lifecycle of one entity: `entity:<kind>/<id>`.
pub fn entity(entity: &EntityRef) -> String {
    format!("entity:{}/{}", entity.kind, entity.id)
}

/// Invalidations and mutation resolutions for a whole group: `group:<name>`.
pub fn group(name: &str) -> String {
    format!("group:{name}")
}

/// Lifecycle of one resilient fetch session: `fetch:<session>`.
pub fn fetch(session: u64) -> String {
    format!("fetch:{session}")
}

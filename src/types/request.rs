//! Transport request shapes

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{EntityRef, ResourceDescriptor};

/// A single network call handed to the [`Transport`](crate::Transport).
///
/// The core never serializes anything itself; the transport decides how
/// each variant maps onto the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Cache-aside read of a resource.
    Read(ResourceDescriptor),
    /// Send the full desired state of an entity.
    Write { entity: EntityRef, body: Value },
    /// Load a standalone resource (media, alternate API shape) from one source.
    Fetch { source: String },
}

impl Request {
    /// Short label used in metrics and logs.
    pub fn label(&self) -> &'static str {
        match self {
            Request::Read(_) => "read",
            Request::Write { .. } => "write",
            Request::Fetch { .. } => "fetch",
        }
    }
}

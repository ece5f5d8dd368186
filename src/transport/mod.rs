//! Bundled [`Transport`](crate::Transport) implementations.

#[cfg(feature = "http")]
mod http;

#[cfg(feature = "http")]
pub use http::HttpTransport;

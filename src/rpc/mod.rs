//! Remote device access over HTTP.
//!
//! A [`TrackerClient`] checks the device endpoint and trades a device key
//! for a [`RemoteSession`]. The session uploads shared libraries, loads
//! them as [`RemoteModule`]s and forwards invocations to the device, where a
//! [`DeviceServer`] runs them.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::{RemoteModule, RemoteSession, TrackerClient};
pub use protocol::WireTensor;
pub use server::{BackgroundServer, DeviceServer};

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("cannot reach tracker at {addr}: {source}")]
    Connect {
        addr: String,
        source: reqwest::Error,
    },
    #[error("device request for key '{key}' denied: {reason}")]
    Denied { key: String, reason: String },
    #[error("remote error: {0}")]
    Remote(String),
    #[error("connection to the device was lost earlier in this run")]
    ConnectionLost,
}

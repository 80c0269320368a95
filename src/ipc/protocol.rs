//! IPC protocol definitions for daemon control
//!
//! This module defines the JSON protocol used between control clients (the
//! CLI, the application's update UI) and the daemon via Unix domain socket.

use serde::{Deserialize, Serialize};

/// Protocol version for future compatibility
pub const PROTOCOL_VERSION: u32 = 1;

/// Default socket path for IPC communication
pub const SOCKET_PATH: &str = "/tmp/shellcache.sock";

/// Commands sent to the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Command {
    /// Activate a staged worker immediately
    SkipWaiting,
    /// Start caching every manifest resource in the background
    DownloadOffline,
    /// Get daemon status
    GetStatus,
}

/// Responses sent back by the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Response {
    /// Success response
    #[serde(rename_all = "camelCase")]
    Success {
        /// Optional success message
        message: Option<String>,
    },
    /// Error response
    #[serde(rename_all = "camelCase")]
    Error {
        /// Error message
        error: String,
    },
    /// Status response with worker state
    #[serde(rename_all = "camelCase")]
    Status {
        /// Protocol version
        version: u32,
        /// Lifecycle state (idle, staged, committed, reset, ...)
        state: String,
        /// Whether the worker intercepts requests
        active: bool,
        /// Origin being fronted
        origin: String,
        /// Origin connection health
        health: String,
        /// Number of resources in the manifest
        manifest_entries: usize,
        /// Number of entries in the live region
        live_entries: usize,
        /// Cache-first hits
        hits: u64,
        /// Cache-first misses
        misses: u64,
        /// Most recent origin errors
        recent_errors: Vec<ErrorInfo>,
    },
}

/// A recent origin error (for status response)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    /// Seconds since epoch
    pub timestamp: u64,
    /// Request method
    pub method: String,
    /// Request path
    pub path: String,
    /// Error message
    pub error: String,
}

/// Parse a JSON command from bytes
pub fn parse_command(data: &[u8]) -> Result<Command, serde_json::Error> {
    serde_json::from_slice(data)
}

/// Serialize a command to JSON bytes
pub fn serialize_command(command: &Command) -> Result<Vec<u8>, serde_json::Error> {
    let mut json = serde_json::to_vec(command)?;
    json.push(b'\n');
    Ok(json)
}

/// Parse a JSON response from bytes
pub fn parse_response(data: &[u8]) -> Result<Response, serde_json::Error> {
    serde_json::from_slice(data)
}

/// Serialize a response to JSON bytes
pub fn serialize_response(response: &Response) -> Result<Vec<u8>, serde_json::Error> {
    let mut json = serde_json::to_vec(response)?;
    json.push(b'\n'); // Add newline delimiter
    Ok(json)
}

//! Control protocol - one JSON request line, one JSON response line.

use serde::{Deserialize, Serialize};

/// Request from a client to the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum Request {
    /// Make sure the published index is fresh, then acknowledge
    #[serde(rename = "poke")]
    Poke {
        /// Requesting process, for a per-client watch sidecar
        #[serde(default)]
        pid: Option<u32>,
    },

    /// Re-read and republish unconditionally
    #[serde(rename = "refresh")]
    Refresh,

    /// Daemon state and live segments
    #[serde(rename = "status")]
    Status,

    /// Check if daemon is alive
    #[serde(rename = "ping")]
    Ping,

    /// Tear down and exit
    #[serde(rename = "shutdown")]
    Shutdown,
}

/// Response from daemon to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum Response {
    /// Poke acknowledgement: names of the segments that are live right now
    #[serde(rename = "fresh")]
    Fresh {
        index: Option<String>,
        base: Option<String>,
        sidecar: Option<String>,
    },

    /// Successful response with JSON data
    #[serde(rename = "ok")]
    Ok { data: serde_json::Value },

    /// Error response
    #[serde(rename = "error")]
    Error { message: String },

    /// Pong response (daemon is alive)
    #[serde(rename = "pong")]
    Pong,

    /// Shutdown acknowledgment
    #[serde(rename = "goodbye")]
    Goodbye,
}

impl Response {
    pub fn ok<T: Serialize>(data: T) -> Self {
        Response::Ok {
            data: serde_json::to_value(data).unwrap_or(serde_json::Value::Null),
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Response::Error { message: msg.into() }
    }
}

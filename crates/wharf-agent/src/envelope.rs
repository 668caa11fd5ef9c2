//! Wire envelopes for the control channel.
//!
//! Requests arrive as `{id, operation}` where `operation` is tagged by
//! `type`. The `id` is an opaque correlation token chosen by the client;
//! responses echo it back. Events carry a server-generated id that is not
//! correlated to any request.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AgentError;

/// Outer request frame. `operation` stays raw so an unknown `type` can
/// still be answered with `INVALID_OPERATION` against the parsed id.
#[derive(Debug, Deserialize)]
pub struct RawRequest {
    pub id: String,
    pub operation: Value,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum Operation {
    #[serde(rename = "readFile")]
    ReadFile {
        path: String,
        encoding: Option<String>,
    },
    #[serde(rename = "writeFile")]
    WriteFile {
        path: String,
        content: Option<String>,
        encoding: Option<String>,
    },
    #[serde(rename = "rm")]
    Rm {
        path: String,
        #[serde(default)]
        recursive: bool,
    },
    #[serde(rename = "readdir")]
    Readdir { path: String },
    #[serde(rename = "mkdir")]
    Mkdir {
        path: String,
        #[serde(default)]
        recursive: bool,
    },
    #[serde(rename = "stat")]
    Stat { path: String },
    #[serde(rename = "mount")]
    Mount { path: String, tree: Option<Value> },

    #[serde(rename = "spawn")]
    Spawn {
        command: Option<String>,
        #[serde(default)]
        args: Vec<String>,
    },
    #[serde(rename = "input")]
    Input {
        pid: Option<u32>,
        data: Option<String>,
    },
    #[serde(rename = "kill")]
    Kill { pid: Option<u32> },
    #[serde(rename = "resize")]
    Resize {
        pid: Option<u32>,
        cols: Option<u16>,
        rows: Option<u16>,
    },

    #[serde(rename = "watch")]
    Watch {
        #[serde(default)]
        patterns: Vec<String>,
        #[serde(default)]
        persistent: bool,
    },
    #[serde(rename = "watch-paths")]
    WatchPaths {
        #[serde(default)]
        include: Vec<String>,
    },

    #[serde(rename = "auth")]
    Auth { token: Option<String> },
}

#[derive(Debug, Serialize)]
pub struct Response {
    pub id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl Response {
    pub fn ok(id: String, data: Value) -> Self {
        Response {
            id,
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(id: String, err: &AgentError) -> Self {
        Response {
            id,
            success: false,
            data: None,
            error: Some(ErrorBody {
                code: err.code().to_string(),
                message: err.to_string(),
            }),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}

/// Unsolicited push event (`process`, `file-change`).
#[derive(Debug, Serialize)]
pub struct Event {
    pub id: String,
    pub event: &'static str,
    pub data: Value,
}

impl Event {
    pub fn new(event: &'static str, data: Value) -> Self {
        Event {
            id: crate::ids::token(),
            event,
            data,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}

//! JSON payloads returned by the reader's HTTP endpoints.
//!
//! Every `take` and `clean` answer is HTTP 200 with a `result` field the
//! client has to inspect.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultKind {
    Success,
    Failure,
}

/// `{result, filename?, code?, message?}` with absent fields omitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub result: ResultKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ResultEnvelope {
    pub fn success() -> Self {
        ResultEnvelope {
            result: ResultKind::Success,
            filename: None,
            code: None,
            message: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        ResultEnvelope {
            result: ResultKind::Failure,
            filename: None,
            code: None,
            message: Some(message.into()),
        }
    }
}

/// Health-check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    /// Lifecycle state of the capture currently being coordinated.
    pub state: String,
}

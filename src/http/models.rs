//! JSON bodies of the HTTP surface. Results are serialized straight from
//! `ExecutionResult`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::domain::{ExecutionState, PartialLimits};

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecuteBody {
    /// Generated when absent, which makes the request its own session.
    pub session_id: Option<String>,
    pub language: String,
    pub source: String,
    pub stdin: Option<String>,
    #[serde(default)]
    pub limits: PartialLimits,
}

#[derive(Clone, Debug, Serialize)]
pub struct LanguageInfo {
    pub id: String,
    pub aliases: Vec<String>,
    pub source_file: String,
    pub compiled: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct SessionStateBody {
    pub session_id: String,
    pub state: ExecutionState,
}

#[derive(Clone, Debug, Serialize)]
pub struct CancelBody {
    pub session_id: String,
    pub cancelled: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct HealthBody {
    pub status: String,
    pub available_slots: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

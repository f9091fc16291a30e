//! Response bodies for the administrative endpoints

use serde::{Deserialize, Serialize};

/// Result of an on-demand purge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PurgeResponse {
    pub removed: u64,
}

/// Query of `DELETE /_ctrl/data`
#[derive(Debug, Default, Deserialize)]
pub struct PurgeParams {
    #[serde(rename = "older-than-days")]
    pub older_than_days: Option<String>,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub mirrors: usize,
}

//! Serde types matching the admin user-sync endpoint.
//!
//! These types are separate from domain types to keep the wire envelope
//! out of the sync engine's public API.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ============================================================================
// Mutation envelope
// ============================================================================

/// Actions understood by the user-sync endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
  UpdateUser,
  ActivateUser,
  DeactivateUser,
  AssignCohort,
  RemoveCohort,
  BulkUpdate,
}

impl SyncAction {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::UpdateUser => "update_user",
      Self::ActivateUser => "activate_user",
      Self::DeactivateUser => "deactivate_user",
      Self::AssignCohort => "assign_cohort",
      Self::RemoveCohort => "remove_cohort",
      Self::BulkUpdate => "bulk_update",
    }
  }
}

/// Request body: `{ action, userIds, data }`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
  pub action: SyncAction,
  pub user_ids: Vec<String>,
  pub data: Map<String, Value>,
}

// ============================================================================
// Responses
// ============================================================================

/// Non-2xx body
#[derive(Debug, Deserialize)]
pub struct ApiErrorBody {
  pub error: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiSyncStatusResponse {
  pub sync_status: ApiQueueStatus,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiQueueStatus {
  #[serde(default)]
  pub queue_size: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiBulkItem {
  user_id: String,
  #[serde(default)]
  success: bool,
  #[serde(default)]
  error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiBulkResponse {
  #[serde(default)]
  results: Vec<ApiBulkItem>,
}

/// Per-user outcome of a bulk call, as reported by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkReport {
  pub succeeded: Vec<String>,
  /// `(user id, server message)`
  pub failed: Vec<(String, String)>,
}

impl BulkReport {
  /// Read the `results` array out of a bulk response. Responses without
  /// one produce an empty report.
  pub fn from_response(value: &Value) -> Self {
    let response: ApiBulkResponse = serde_json::from_value(value.clone()).unwrap_or_default();
    let mut report = Self::default();
    for item in response.results {
      if item.success {
        report.succeeded.push(item.user_id);
      } else {
        let message = item.error.unwrap_or_else(|| "failed".to_string());
        report.failed.push((item.user_id, message));
      }
    }
    report
  }

  pub fn is_partial(&self) -> bool {
    !self.failed.is_empty() && !self.succeeded.is_empty()
  }
}

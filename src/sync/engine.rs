//! Optimistic mutations of user records.
//!
//! Every operation follows the same steps:
//! 1. Overlay a patch on each affected user (unless optimistic mode is off)
//! 2. Mark the status as loading
//! 3. Submit the mutation envelope
//! 4. On success keep the patch; it expires on its own or is superseded by
//!    the next authoritative fetch
//! 5. On failure remove exactly the patches this call created
//!
//! Nothing is retried automatically.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::overlay::{overlay_entities, Overlaid, SyncEntity};
use super::patch::{PatchFields, PatchId, PatchStore};
use crate::api_types::{BulkReport, SyncAction, SyncRequest};
use crate::client::ResourceEndpoint;
use crate::error::{Result, SyncError};
use crate::scheduler::{self, ScheduledTask};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
  /// Default for operations that do not say otherwise
  pub optimistic: bool,
  /// How long a patch survives without an authoritative refetch
  pub patch_expiry: Duration,
}

impl Default for SyncOptions {
  fn default() -> Self {
    Self {
      optimistic: true,
      patch_expiry: Duration::from_secs(10),
    }
  }
}

/// Engine-wide sync state for status bars and disabling bulk actions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncStatus {
  pub is_loading: bool,
  pub last_sync: Option<DateTime<Utc>>,
  pub error: Option<SyncError>,
  /// Operations the server still has queued
  pub queue_size: u64,
}

type SuccessCallback = Box<dyn FnOnce(&Value) + Send>;
type ErrorCallback = Box<dyn FnOnce(&SyncError) + Send>;

/// Per-call settings.
#[derive(Default)]
pub struct MutationOptions {
  optimistic: Option<bool>,
  on_success: Option<SuccessCallback>,
  on_error: Option<ErrorCallback>,
}

impl MutationOptions {
  pub fn new() -> Self {
    Self::default()
  }

  /// Override the engine's optimistic default for this call.
  pub fn optimistic(mut self, optimistic: bool) -> Self {
    self.optimistic = Some(optimistic);
    self
  }

  pub fn on_success(mut self, callback: impl FnOnce(&Value) + Send + 'static) -> Self {
    self.on_success = Some(Box::new(callback));
    self
  }

  pub fn on_error(mut self, callback: impl FnOnce(&SyncError) + Send + 'static) -> Self {
    self.on_error = Some(Box::new(callback));
    self
  }
}

/// Result of a bulk call.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkOutcome {
  pub response: Value,
  /// Per-user results the server reported, if any
  pub report: BulkReport,
}

struct StatusState {
  status: SyncStatus,
  /// Mutations currently awaiting the server
  pending: usize,
}

/// Clears the loading flag when a mutation ends, including when the caller
/// drops the operation before the server answers.
struct PendingGuard {
  state: Arc<Mutex<StatusState>>,
}

impl PendingGuard {
  fn begin(state: &Arc<Mutex<StatusState>>) -> Self {
    let mut guard = lock_status(state);
    guard.pending += 1;
    guard.status.is_loading = true;
    guard.status.error = None;
    Self {
      state: Arc::clone(state),
    }
  }
}

impl Drop for PendingGuard {
  fn drop(&mut self) {
    let mut state = lock_status(&self.state);
    state.pending = state.pending.saturating_sub(1);
    state.status.is_loading = state.pending > 0;
  }
}

/// Applies optimistic patches and submits user mutations.
///
/// One engine per mounted dashboard; clones share patches and status.
#[derive(Clone)]
pub struct SyncEngine {
  endpoint: Arc<dyn ResourceEndpoint>,
  patches: PatchStore,
  status: Arc<Mutex<StatusState>>,
  options: SyncOptions,
}

impl SyncEngine {
  pub fn new(endpoint: Arc<dyn ResourceEndpoint>, options: SyncOptions) -> Self {
    Self {
      endpoint,
      patches: PatchStore::new(),
      status: Arc::new(Mutex::new(StatusState {
        status: SyncStatus::default(),
        pending: 0,
      })),
      options,
    }
  }

  pub fn options(&self) -> &SyncOptions {
    &self.options
  }

  /// Patch arbitrary fields of one user.
  pub async fn update_user(
    &self,
    user_id: &str,
    fields: PatchFields,
    options: MutationOptions,
  ) -> Result<Value> {
    self
      .mutate(
        SyncAction::UpdateUser,
        vec![user_id.to_string()],
        fields.clone(),
        fields,
        options,
      )
      .await
  }

  /// Activate or deactivate one user. The reason is recorded on
  /// deactivation.
  pub async fn toggle_user_status(
    &self,
    user_id: &str,
    active: bool,
    reason: Option<&str>,
    options: MutationOptions,
  ) -> Result<Value> {
    let (action, patch, data) = activation(active, reason);
    self
      .mutate(action, vec![user_id.to_string()], patch, data, options)
      .await
  }

  pub async fn assign_cohort(
    &self,
    user_id: &str,
    cohort_id: &str,
    cohort_name: Option<&str>,
    options: MutationOptions,
  ) -> Result<Value> {
    let patch = cohort_fields(Some(cohort_id), cohort_name);
    self
      .mutate(
        SyncAction::AssignCohort,
        vec![user_id.to_string()],
        patch.clone(),
        patch,
        options,
      )
      .await
  }

  pub async fn remove_cohort(&self, user_id: &str, options: MutationOptions) -> Result<Value> {
    self
      .mutate(
        SyncAction::RemoveCohort,
        vec![user_id.to_string()],
        cohort_fields(None, None),
        PatchFields::new(),
        options,
      )
      .await
  }

  /// Apply one set of fields to many users in a single call.
  ///
  /// The optimistic overlay is all-or-nothing: if the call fails, every
  /// patch from this batch is rolled back.
  pub async fn bulk_update(
    &self,
    user_ids: &[String],
    fields: PatchFields,
    options: MutationOptions,
  ) -> Result<BulkOutcome> {
    self
      .mutate_bulk(SyncAction::BulkUpdate, user_ids, fields.clone(), fields, options)
      .await
  }

  pub async fn bulk_toggle_status(
    &self,
    user_ids: &[String],
    active: bool,
    reason: Option<&str>,
    options: MutationOptions,
  ) -> Result<BulkOutcome> {
    let (action, patch, data) = activation(active, reason);
    self
      .mutate_bulk(action, user_ids, patch, data, options)
      .await
  }

  pub async fn bulk_assign_cohort(
    &self,
    user_ids: &[String],
    cohort_id: &str,
    cohort_name: Option<&str>,
    options: MutationOptions,
  ) -> Result<BulkOutcome> {
    let patch = cohort_fields(Some(cohort_id), cohort_name);
    self
      .mutate_bulk(SyncAction::AssignCohort, user_ids, patch.clone(), patch, options)
      .await
  }

  async fn mutate_bulk(
    &self,
    action: SyncAction,
    user_ids: &[String],
    patch: PatchFields,
    data: PatchFields,
    options: MutationOptions,
  ) -> Result<BulkOutcome> {
    let response = self
      .mutate(action, user_ids.to_vec(), patch, data, options)
      .await?;
    let report = BulkReport::from_response(&response);
    if !report.failed.is_empty() {
      warn!(
        action = action.as_str(),
        failed = report.failed.len(),
        "server reported per-user failures"
      );
    }
    Ok(BulkOutcome { response, report })
  }

  async fn mutate(
    &self,
    action: SyncAction,
    user_ids: Vec<String>,
    patch: PatchFields,
    data: PatchFields,
    options: MutationOptions,
  ) -> Result<Value> {
    let optimistic = options.optimistic.unwrap_or(self.options.optimistic);
    let created: Vec<(String, PatchId)> = if optimistic {
      user_ids
        .iter()
        .map(|id| {
          let patch_id = self
            .patches
            .apply(id, patch.clone(), self.options.patch_expiry);
          (id.clone(), patch_id)
        })
        .collect()
    } else {
      Vec::new()
    };

    let pending = PendingGuard::begin(&self.status);
    info!(action = action.as_str(), users = user_ids.len(), optimistic, "submitting mutation");

    let request = SyncRequest {
      action,
      user_ids,
      data,
    };
    let result = self.endpoint.submit(request).await;
    match &result {
      Ok(_) => self.lock_status().status.last_sync = Some(Utc::now()),
      Err(e) => {
        for (entity_id, patch_id) in &created {
          self.patches.remove(entity_id, *patch_id);
        }
        warn!(
          action = action.as_str(),
          error = %e,
          rolled_back = created.len(),
          "mutation failed"
        );
        self.lock_status().status.error = Some(e.clone());
      }
    }

    // Callbacks see the settled status.
    drop(pending);
    match &result {
      Ok(response) => {
        if let Some(callback) = options.on_success {
          callback(response);
        }
      }
      Err(e) => {
        if let Some(callback) = options.on_error {
          callback(e);
        }
      }
    }
    result
  }

  /// Fetch the server's queue size once and merge it into the status.
  pub async fn get_sync_status(&self) -> Result<SyncStatus> {
    match self.endpoint.queue_size().await {
      Ok(queue_size) => {
        let mut state = self.lock_status();
        state.status.queue_size = queue_size;
        Ok(state.status.clone())
      }
      Err(e) => {
        self.lock_status().status.error = Some(e.clone());
        Err(e)
      }
    }
  }

  /// Poll [`SyncEngine::get_sync_status`] every `interval` until the
  /// returned handle is cancelled or dropped.
  pub fn start_auto_refresh(&self, interval: Duration) -> ScheduledTask {
    let engine = self.clone();
    scheduler::schedule_every(interval, move || {
      let engine = engine.clone();
      async move {
        if let Err(e) = engine.get_sync_status().await {
          debug!(error = %e, "sync status poll failed");
        }
      }
    })
  }

  pub fn status(&self) -> SyncStatus {
    self.lock_status().status.clone()
  }

  pub fn patches(&self) -> &PatchStore {
    &self.patches
  }

  pub fn has_pending_patch(&self, entity_id: &str) -> bool {
    self.patches.contains(entity_id)
  }

  /// Current display view of `entities`.
  pub fn overlay<T: SyncEntity>(&self, entities: &[T]) -> Vec<Overlaid<T>> {
    overlay_entities(entities, &self.patches.snapshot())
  }

  /// Drop all pending patches, e.g. after a full authoritative reload.
  pub fn clear_patches(&self) {
    self.patches.clear();
  }

  fn lock_status(&self) -> MutexGuard<'_, StatusState> {
    lock_status(&self.status)
  }
}

fn lock_status(state: &Mutex<StatusState>) -> MutexGuard<'_, StatusState> {
  state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn activation(active: bool, reason: Option<&str>) -> (SyncAction, PatchFields, PatchFields) {
  let action = if active {
    SyncAction::ActivateUser
  } else {
    SyncAction::DeactivateUser
  };

  let mut patch = PatchFields::new();
  patch.insert("isActive".into(), json!(active));
  let recorded_reason = if active { None } else { reason };
  patch.insert("deactivationReason".into(), json!(recorded_reason));

  let mut data = PatchFields::new();
  if let Some(reason) = reason {
    data.insert("reason".into(), json!(reason));
  }
  (action, patch, data)
}

fn cohort_fields(cohort_id: Option<&str>, cohort_name: Option<&str>) -> PatchFields {
  let mut fields = PatchFields::new();
  fields.insert("cohortId".into(), json!(cohort_id));
  if cohort_id.is_none() || cohort_name.is_some() {
    fields.insert("cohortName".into(), json!(cohort_name));
  }
  fields
}

//! Store of pending optimistic patches, one per entity.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tracing::debug;

use crate::scheduler::{self, ScheduledTask};

/// Fields a patch overlays onto an entity, keyed by their serialized name.
pub type PatchFields = Map<String, Value>;

/// Snapshot of the store, keyed by entity id.
pub type PatchMap = HashMap<String, OptimisticPatch>;

/// Identifies the patch one operation created, so its rollback can never
/// remove a newer patch for the same entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PatchId(pub(crate) u64);

#[derive(Debug, Clone, PartialEq)]
pub struct OptimisticPatch {
  pub id: PatchId,
  pub entity_id: String,
  pub fields: PatchFields,
  pub applied_at: DateTime<Utc>,
  pub expires_after: Duration,
}

struct PatchSlot {
  patch: OptimisticPatch,
  /// Dropping the slot cancels its expiry timer
  expiry: Option<ScheduledTask>,
}

#[derive(Default)]
struct StoreState {
  slots: HashMap<String, PatchSlot>,
  next_id: u64,
}

/// Pending optimistic patches with self-expiry.
///
/// Clones share the same store.
#[derive(Clone, Default)]
pub struct PatchStore {
  state: Arc<Mutex<StoreState>>,
}

impl PatchStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Record a patch for `entity_id`, replacing any older one, and schedule
  /// its removal after `expires_after`. Must be called inside a tokio
  /// runtime.
  pub fn apply(&self, entity_id: &str, fields: PatchFields, expires_after: Duration) -> PatchId {
    let mut state = lock_store(&self.state);
    let id = PatchId(state.next_id);
    state.next_id += 1;

    let patch = OptimisticPatch {
      id,
      entity_id: entity_id.to_string(),
      fields,
      applied_at: Utc::now(),
      expires_after,
    };
    let expiry = self.schedule_expiry(entity_id, id, expires_after);

    let replaced = state.slots.insert(
      entity_id.to_string(),
      PatchSlot {
        patch,
        expiry: Some(expiry),
      },
    );
    if let Some(old) = replaced {
      debug!(entity_id, old = old.patch.id.0, new = id.0, "replaced optimistic patch");
    }
    id
  }

  fn schedule_expiry(&self, entity_id: &str, id: PatchId, after: Duration) -> ScheduledTask {
    let store: Weak<Mutex<StoreState>> = Arc::downgrade(&self.state);
    let entity_id = entity_id.to_string();

    scheduler::schedule_once(after, async move {
      let Some(state) = store.upgrade() else {
        return;
      };
      let expired = take_slot(&mut lock_store(&state), &entity_id, id);
      if let Some(mut slot) = expired {
        // This task is the timer; let it finish instead of aborting itself.
        if let Some(timer) = slot.expiry.take() {
          timer.detach();
        }
        debug!(entity_id, patch = id.0, "optimistic patch expired");
      }
    })
  }

  /// Remove the patch `id` from `entity_id`.
  ///
  /// A no-op if that patch already expired or was replaced.
  pub fn remove(&self, entity_id: &str, id: PatchId) -> bool {
    take_slot(&mut lock_store(&self.state), entity_id, id).is_some()
  }

  pub fn get(&self, entity_id: &str) -> Option<OptimisticPatch> {
    lock_store(&self.state)
      .slots
      .get(entity_id)
      .map(|slot| slot.patch.clone())
  }

  pub fn contains(&self, entity_id: &str) -> bool {
    lock_store(&self.state).slots.contains_key(entity_id)
  }

  pub fn snapshot(&self) -> PatchMap {
    lock_store(&self.state)
      .slots
      .iter()
      .map(|(id, slot)| (id.clone(), slot.patch.clone()))
      .collect()
  }

  pub fn len(&self) -> usize {
    lock_store(&self.state).slots.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Drop every patch and cancel its timer.
  pub fn clear(&self) {
    lock_store(&self.state).slots.clear();
  }
}

fn take_slot(state: &mut StoreState, entity_id: &str, id: PatchId) -> Option<PatchSlot> {
  match state.slots.get(entity_id) {
    Some(slot) if slot.patch.id == id => state.slots.remove(entity_id),
    _ => None,
  }
}

fn lock_store(state: &Mutex<StoreState>) -> MutexGuard<'_, StoreState> {
  state.lock().unwrap_or_else(PoisonError::into_inner)
}

//! Read-side view of entities with pending optimistic patches merged in.
//!
//! Everything here is pure: the authoritative entities and the patch map
//! are only read.

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::warn;

use super::patch::{OptimisticPatch, PatchMap};
use crate::model::User;

/// Entities the sync engine can patch.
pub trait SyncEntity: Clone + Serialize + DeserializeOwned {
  /// Id used as the patch key
  fn entity_id(&self) -> &str;
}

impl SyncEntity for User {
  fn entity_id(&self) -> &str {
    &self.id
  }
}

/// An entity as it should be displayed.
#[derive(Debug, Clone, PartialEq)]
pub struct Overlaid<T> {
  pub entity: T,
  /// A patch is pending; the UI may render the row as unconfirmed
  pub optimistic: bool,
}

/// Shallow-merge the patch's fields into a JSON object.
///
/// Non-object values are returned unchanged.
pub fn overlay_value(entity: &Value, patch: Option<&OptimisticPatch>) -> Value {
  let mut merged = entity.clone();
  if let (Some(patch), Some(object)) = (patch, merged.as_object_mut()) {
    for (field, value) in &patch.fields {
      object.insert(field.clone(), value.clone());
    }
  }
  merged
}

pub fn overlay_entity<T: SyncEntity>(entity: &T, patches: &PatchMap) -> Overlaid<T> {
  let Some(patch) = patches.get(entity.entity_id()) else {
    return Overlaid {
      entity: entity.clone(),
      optimistic: false,
    };
  };

  let merged = serde_json::to_value(entity)
    .map(|value| overlay_value(&value, Some(patch)))
    .and_then(serde_json::from_value::<T>);

  match merged {
    Ok(entity) => Overlaid {
      entity,
      optimistic: true,
    },
    Err(e) => {
      warn!(entity_id = entity.entity_id(), error = %e, "patch does not fit entity, ignoring");
      Overlaid {
        entity: entity.clone(),
        optimistic: false,
      }
    }
  }
}

pub fn overlay_entities<T: SyncEntity>(entities: &[T], patches: &PatchMap) -> Vec<Overlaid<T>> {
  entities
    .iter()
    .map(|entity| overlay_entity(entity, patches))
    .collect()
}

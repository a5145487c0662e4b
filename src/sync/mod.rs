//! Optimistic synchronization of user records.
//!
//! Mutations are shown immediately through short-lived patches layered over
//! the last authoritative data, then confirmed or rolled back by the server.

mod engine;
mod overlay;
mod patch;

pub use engine::{BulkOutcome, MutationOptions, SyncEngine, SyncOptions, SyncStatus};
pub use overlay::{overlay_entities, overlay_entity, overlay_value, Overlaid, SyncEntity};
pub use patch::{OptimisticPatch, PatchFields, PatchId, PatchMap, PatchStore};

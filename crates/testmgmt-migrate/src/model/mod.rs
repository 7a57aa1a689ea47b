//! Canonical model shared by every provider.
//!
//! - [`entity`]: the [`CanonicalEntity`] pivot format and entity kinds
//! - [`project`]: per-project field/status/priority mapping tables

pub mod entity;
pub mod project;

pub use entity::{
    entity_key, value_as_id, AttachmentRef, CanonicalEntity, EntityType, NativeEntity, TestStep,
    DEFAULT_PRIORITY, DEFAULT_STATUS,
};
pub use project::ProjectConfig;

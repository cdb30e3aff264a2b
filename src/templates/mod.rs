//! Node-local template copies and their persisted mapping

pub mod manager;
pub mod store;

pub use manager::{clone_name, clone_prefix, TemplateManager, TemplateMapping};
pub use store::{MemoryTemplateStore, RedbTemplateStore, StoreError, TemplateRecord, TemplateStore};

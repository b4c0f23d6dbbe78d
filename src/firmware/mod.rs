//! Local firmware cache: manifest, version stores and the sync pass.

pub mod manifest;
pub mod store;
pub mod sync;

pub use manifest::{fetch_manifest, Manifest, ManifestEntry};
pub use store::{store_for, MarkerFileStore, VersionStore, VersionedBinaryStore};
pub use sync::{download, extract, ComponentOutcome, SyncReport, VersionSync};

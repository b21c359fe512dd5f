//! Core traits and types for the notesync engine.
//!
//! This crate defines the abstractions shared between the engine and its collaborators:
//! - `DocumentSource`: Collections, documents and attachments to mirror
//! - `RemoteStore`: Revisioned file primitives of the remote content store
//! - `BlobStore`: Host key-value persistence for settings, caches and history
//! - `Settings`: Immutable per-run configuration snapshot
//! - `DeviceIdentity`: Stable identity of this device for lock records

mod device;
mod error;
mod persistence;
mod remote;
mod settings;
mod source;

pub use device::DeviceIdentity;
pub use error::SyncError;
pub use persistence::{BlobStore, MemoryBlobStore};
pub use remote::{RemoteMetadata, RemoteStore, WriteOutcome};
pub use settings::{
    AttachmentMode, AutoSyncSettings, FilterSettings, LockSettings, RemoteSettings, Settings,
    SETTINGS_KEY,
};
pub use source::{AssetRef, CollectionInfo, DocumentSource, ItemContent, ItemMetadata, ItemRef};

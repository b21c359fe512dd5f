// Shared modules (used by the binary and by embedders that bring their own remote)
pub mod blob_store;
pub mod config;
pub mod vault;

mod walk;

pub use blob_store::FsBlobStore;
pub use vault::VaultSource;

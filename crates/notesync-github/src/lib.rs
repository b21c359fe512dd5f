//! GitHub repository as a notesync remote store.
//!
//! Files are read and written through the REST contents API; the blob sha
//! reported by GitHub is the revision token.

mod github;

pub use github::GitHubStore;

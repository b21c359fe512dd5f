use std::sync::Arc;

use notesync_core::{RemoteStore, SyncError, WriteOutcome};
use tracing::{debug, instrument, warn};

/// Write attempts per call: the first write plus one retry after a conflict.
pub const MAX_WRITE_ATTEMPTS: u32 = 2;

/// Read-modify-write client with optimistic concurrency.
///
/// 1. GET the current revision (absent means create)
/// 2. PUT with that revision as precondition
/// 3. On conflict, refetch the revision and PUT once more
/// 4. A second conflict is returned as `SyncError::Conflict`
///
/// The fetch-then-write gap is racy across devices; the distributed lock
/// reduces contention, nothing here eliminates it.
#[derive(Clone)]
pub struct RemoteWriter {
    remote: Arc<dyn RemoteStore>,
}

impl RemoteWriter {
    pub fn new(remote: Arc<dyn RemoteStore>) -> Self {
        Self { remote }
    }

    pub fn remote(&self) -> &Arc<dyn RemoteStore> {
        &self.remote
    }

    /// Write `content` to `path`, returning the new revision token.
    #[instrument(skip(self, content), level = "debug", fields(content_len = content.len()))]
    pub async fn write_or_update(
        &self,
        path: &str,
        content: &[u8],
        message: &str,
    ) -> Result<String, SyncError> {
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let expected = self
                .remote
                .get_metadata(path)
                .await?
                .map(|metadata| metadata.revision);

            match self
                .remote
                .write(path, content, expected.as_deref(), message)
                .await?
            {
                WriteOutcome::Written(revision) => {
                    debug!(attempt, path, revision = %revision, "Remote write succeeded");
                    return Ok(revision);
                }
                WriteOutcome::Conflict if attempt < MAX_WRITE_ATTEMPTS => {
                    warn!(attempt, path, "Revision conflict, refetching and retrying once");
                }
                WriteOutcome::Conflict => break,
            }
        }

        Err(SyncError::Conflict(format!(
            "{} changed remotely during {} write attempts",
            path, MAX_WRITE_ATTEMPTS
        )))
    }
}

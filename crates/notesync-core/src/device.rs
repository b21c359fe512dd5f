use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::SyncError;
use crate::persistence::BlobStore;

const DEVICE_KEY: &str = "device";

/// Identity of this device, written into lock records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Stable random identifier
    pub id: String,
    /// Human-readable name
    pub name: String,
}

impl DeviceIdentity {
    /// Load the persisted identity, creating one on first use.
    ///
    /// `name_override` replaces the stored display name without changing the id.
    pub async fn load_or_create(
        store: &dyn BlobStore,
        name_override: Option<&str>,
    ) -> Result<Self, SyncError> {
        let stored = match store.load_blob(DEVICE_KEY).await? {
            Some(bytes) => match serde_json::from_slice::<DeviceIdentity>(&bytes) {
                Ok(identity) => Some(identity),
                Err(e) => {
                    warn!("Unreadable device identity, generating a new one: {}", e);
                    None
                }
            },
            None => None,
        };

        let mut identity = match stored {
            Some(identity) => identity,
            None => {
                let identity = DeviceIdentity {
                    id: uuid::Uuid::new_v4().to_string(),
                    name: default_device_name(),
                };
                store
                    .save_blob(DEVICE_KEY, &serde_json::to_vec(&identity)?)
                    .await?;
                info!("Created device identity {} ({})", identity.id, identity.name);
                identity
            }
        };

        if let Some(name) = name_override.filter(|n| !n.trim().is_empty()) {
            identity.name = name.to_string();
        }

        Ok(identity)
    }
}

fn default_device_name() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .ok()
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| "unknown-device".to_string())
}

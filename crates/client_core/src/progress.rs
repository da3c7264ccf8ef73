//! Reading progress per room and user. The local copy is painted first and
//! overwritten once the server answers.

use std::sync::Arc;

use shared::{
    domain::{RoomId, UserId},
    protocol::ProgressRecord,
};
use storage::{progress_key, KeyValueStore};
use tracing::{info, warn};

use crate::{api::MessageApi, error::ClientError};

pub struct ProgressTracker {
    api: Arc<dyn MessageApi>,
    store: Arc<dyn KeyValueStore>,
}

impl ProgressTracker {
    pub fn new(api: Arc<dyn MessageApi>, store: Arc<dyn KeyValueStore>) -> Self {
        Self { api, store }
    }

    /// Last known page from the local store, without touching the network.
    pub async fn cached(&self, room_id: RoomId, user_id: UserId) -> Option<i64> {
        let key = progress_key(room_id, user_id);
        match self.store.get(&key).await {
            Ok(Some(value)) => match value.parse() {
                Ok(page) => Some(page),
                Err(err) => {
                    warn!(key = %key, "progress: discarding unreadable local value: {err}");
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                warn!(key = %key, "progress: local read failed: {err:#}");
                None
            }
        }
    }

    /// Fetches the server record and overwrites the local copy with it.
    pub async fn refresh(
        &self,
        room_id: RoomId,
        user_id: UserId,
    ) -> Result<Option<ProgressRecord>, ClientError> {
        let record = self.api.fetch_progress(room_id, user_id).await?;
        if let Some(record) = &record {
            self.store_local(record).await?;
            info!(
                room_id = room_id.0,
                user_id = user_id.0,
                page = record.page,
                "progress: confirmed by server"
            );
        }
        Ok(record)
    }

    pub async fn save(&self, record: ProgressRecord) -> Result<(), ClientError> {
        self.store_local(&record).await?;
        self.api.update_progress(&record).await
    }

    async fn store_local(&self, record: &ProgressRecord) -> Result<(), ClientError> {
        self.store
            .set(
                &progress_key(record.room_id, record.user_id),
                &record.page.to_string(),
            )
            .await
            .map_err(|err| ClientError::LocalStore(format!("{err:#}")))
    }
}

#[cfg(test)]
#[path = "tests/progress_tests.rs"]
mod tests;

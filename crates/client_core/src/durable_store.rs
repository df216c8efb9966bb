use anyhow::Result;
use async_trait::async_trait;
use shared::protocol::{RequestRecord, RequestUpdate};
use storage::Storage;

use crate::RequestStore;

/// [`RequestStore`] backed by the durable SQLite request table.
pub struct DurableRequestStore {
    storage: Storage,
}

impl DurableRequestStore {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }
}

#[async_trait]
impl RequestStore for DurableRequestStore {
    async fn list_requests(&self) -> Result<Vec<RequestRecord>> {
        self.storage.list_requests().await
    }

    async fn update_request(&self, update: &RequestUpdate) -> Result<Option<RequestRecord>> {
        self.storage.update_request(update).await
    }
}

#[cfg(test)]
#[path = "tests/durable_store_tests.rs"]
mod tests;

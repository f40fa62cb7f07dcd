use crate::api::BackendClient;
use crate::types::DataSnapshot;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Explicitly managed copy of the storefront collections.
///
/// Nothing is fetched implicitly: callers decide when to `refresh` and when to
/// `invalidate`. An unloaded cache hands out an empty snapshot.
#[derive(Default)]
pub struct DataCache {
    snapshot: Option<Arc<DataSnapshot>>,
    fetched_at: Option<DateTime<Utc>>,
}

impl DataCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: DataSnapshot) -> Self {
        let mut cache = Self::new();
        cache.replace(snapshot);
        cache
    }

    pub fn snapshot(&self) -> Arc<DataSnapshot> {
        self.snapshot.clone().unwrap_or_default()
    }

    pub fn is_loaded(&self) -> bool {
        self.snapshot.is_some()
    }

    pub fn fetched_at(&self) -> Option<DateTime<Utc>> {
        self.fetched_at
    }

    pub async fn refresh(&mut self, backend: &BackendClient) -> Arc<DataSnapshot> {
        let snapshot = backend.fetch_snapshot().await;
        tracing::info!(
            catalog = snapshot.has_catalog(),
            carts = snapshot.carts.is_some(),
            orders = snapshot.orders.is_some(),
            users = snapshot.users.is_some(),
            "store data refreshed"
        );
        self.replace(snapshot)
    }

    pub fn replace(&mut self, snapshot: DataSnapshot) -> Arc<DataSnapshot> {
        let snapshot = Arc::new(snapshot);
        self.snapshot = Some(Arc::clone(&snapshot));
        self.fetched_at = Some(Utc::now());
        snapshot
    }

    pub fn invalidate(&mut self) {
        self.snapshot = None;
        self.fetched_at = None;
    }
}

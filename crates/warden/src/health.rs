// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;

use serde::Serialize;
use warden_store::KeyValueStore;

/// Outcome of a [`HealthProbe`] check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// The store answered.
    Up,
    /// The store did not answer.
    Down,
}

impl HealthStatus {
    /// Returns `true` for [`HealthStatus::Up`].
    #[must_use]
    pub fn is_up(self) -> bool {
        self == Self::Up
    }
}

impl Display for HealthStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Up => f.write_str("up"),
            Self::Down => f.write_str("down"),
        }
    }
}

/// Up/down probe of the shared store, for an external health aggregator to poll.
pub struct HealthProbe<S> {
    store: Arc<S>,
}

impl<S> HealthProbe<S> {
    /// Name the probe reports under.
    pub const NAME: &'static str = "cache";

    /// Creates a probe.
    #[must_use]
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Name the probe reports under.
    #[must_use]
    pub fn name(&self) -> &'static str {
        Self::NAME
    }
}

impl<S: KeyValueStore> HealthProbe<S> {
    /// Pings the store once.
    pub async fn check(&self) -> HealthStatus {
        match self.store.ping().await {
            Ok(()) => HealthStatus::Up,
            Err(error) => {
                tracing::event!(name: "warden.health.down", tracing::Level::WARN, error = %error, "store ping failed");
                HealthStatus::Down
            }
        }
    }

    /// Pings the store once, returning `true` when it answered.
    pub async fn is_up(&self) -> bool {
        self.check().await.is_up()
    }
}

impl<S> Clone for HealthProbe<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S> Debug for HealthProbe<S> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthProbe").field("name", &Self::NAME).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;
    use warden_store::{MemoryStore, StoreOp};

    use super::*;

    #[tokio::test]
    async fn reachable_store_is_up() {
        let probe = HealthProbe::new(Arc::new(MemoryStore::new()));

        assert_eq!(probe.check().await, HealthStatus::Up);
        assert_eq!(probe.name(), "cache");
    }

    #[tokio::test]
    #[traced_test]
    async fn failing_ping_is_down() {
        let store = Arc::new(MemoryStore::new());
        store.fail_when(|op| matches!(op, StoreOp::Ping));
        let probe = HealthProbe::new(store);

        assert!(!probe.is_up().await);
        assert!(logs_contain("store ping failed"));
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&HealthStatus::Down).unwrap(), "\"down\"");
        assert_eq!(HealthStatus::Up.to_string(), "up");
    }
}

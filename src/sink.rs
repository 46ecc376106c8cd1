//! Sink contract
//!
//! The downstream writer of normalized domain records. Both operations are
//! idempotent upserts: activities dedupe on `(tenant_id, source_id)` and
//! member identities on `(tenant_id, platform, username)`, so re-running a
//! data handler after redelivery writes the same rows.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tracing::info;
use uuid::Uuid;

/// One external identity of a member on a platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemberIdentity {
    pub platform: String,
    pub username: String,
}

#[async_trait]
pub trait Sink: Send + Sync {
    /// Upserts an activity, unique per `(tenant_id, source_id)`.
    async fn upsert_activity(
        &self,
        tenant_id: Uuid,
        source_id: &str,
        payload: &JsonValue,
    ) -> anyhow::Result<()>;

    /// Upserts a member reachable through the given identities.
    async fn upsert_member(
        &self,
        tenant_id: Uuid,
        identities: &[MemberIdentity],
        payload: &JsonValue,
    ) -> anyhow::Result<()>;
}

/// Default sink: logs the upserts. Stands in until a real normalization
/// backend is wired up.
pub struct TracingSink;

#[async_trait]
impl Sink for TracingSink {
    async fn upsert_activity(
        &self,
        tenant_id: Uuid,
        source_id: &str,
        _payload: &JsonValue,
    ) -> anyhow::Result<()> {
        info!(%tenant_id, source_id, "upsert activity");
        Ok(())
    }

    async fn upsert_member(
        &self,
        tenant_id: Uuid,
        identities: &[MemberIdentity],
        _payload: &JsonValue,
    ) -> anyhow::Result<()> {
        info!(%tenant_id, identity_count = identities.len(), "upsert member");
        Ok(())
    }
}

/// In-memory sink for tests: keeps the last payload per key so assertions
/// can check both contents and idempotence.
#[derive(Default)]
pub struct RecordingSink {
    activities: Mutex<HashMap<(Uuid, String), JsonValue>>,
    members: Mutex<HashMap<(Uuid, MemberIdentity), JsonValue>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn activity_count(&self) -> usize {
        self.activities.lock().unwrap().len()
    }

    pub fn member_count(&self) -> usize {
        self.members.lock().unwrap().len()
    }

    pub fn activity(&self, tenant_id: Uuid, source_id: &str) -> Option<JsonValue> {
        self.activities
            .lock()
            .unwrap()
            .get(&(tenant_id, source_id.to_string()))
            .cloned()
    }
}

#[async_trait]
impl Sink for RecordingSink {
    async fn upsert_activity(
        &self,
        tenant_id: Uuid,
        source_id: &str,
        payload: &JsonValue,
    ) -> anyhow::Result<()> {
        self.activities
            .lock()
            .unwrap()
            .insert((tenant_id, source_id.to_string()), payload.clone());
        Ok(())
    }

    async fn upsert_member(
        &self,
        tenant_id: Uuid,
        identities: &[MemberIdentity],
        payload: &JsonValue,
    ) -> anyhow::Result<()> {
        let mut members = self.members.lock().unwrap();
        for identity in identities {
            members.insert((tenant_id, identity.clone()), payload.clone());
        }
        Ok(())
    }
}

//! Handler contexts
//!
//! The context objects passed to platform services. Their operations are the
//! complete side-effect surface of the pipeline: publishing follow-up work,
//! merging integration settings, and the run-scoped cache. Rate limits and
//! aborts are signalled by returning the matching
//! [`HandlerError`](crate::error::HandlerError) variant; the workers apply
//! the resulting state transitions.

use std::sync::Arc;

use sea_orm::DatabaseConnection;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::cache::{CacheStore, RunCache};
use crate::error::PipelineError;
use crate::models::stream::StreamKind;
use crate::models::{integration, run, stream};
use crate::queue::{PipelineMessage, QueueClient, QueueName};
use crate::repositories::{DataRepository, IntegrationRepository, StreamRepository};
use crate::sink::Sink;

/// Immutable view of the integration a handler is working for.
#[derive(Debug, Clone)]
pub struct IntegrationSnapshot {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub platform: String,
    pub identifier: Option<String>,
    pub status: String,
    pub settings: JsonValue,
}

impl From<&integration::Model> for IntegrationSnapshot {
    fn from(model: &integration::Model) -> Self {
        Self {
            id: model.id,
            tenant_id: model.tenant_id,
            platform: model.platform.clone(),
            identifier: model.identifier.clone(),
            status: model.status.clone(),
            settings: model.settings.clone(),
        }
    }
}

/// Immutable view of the stream being processed.
#[derive(Debug, Clone)]
pub struct StreamSnapshot {
    pub id: Uuid,
    pub identifier: String,
    pub kind: StreamKind,
    pub data: Option<JsonValue>,
}

impl From<&stream::Model> for StreamSnapshot {
    fn from(model: &stream::Model) -> Self {
        Self {
            id: model.id,
            identifier: model.identifier.clone(),
            kind: model.kind(),
            data: model.data.clone(),
        }
    }
}

/// State shared by all context flavors of one unit of work.
struct ContextInner {
    db: Arc<DatabaseConnection>,
    queue: Arc<dyn QueueClient>,
    cache: RunCache,
    run: run::Model,
    integration: IntegrationSnapshot,
}

impl ContextInner {
    fn new(
        db: Arc<DatabaseConnection>,
        queue: Arc<dyn QueueClient>,
        cache_store: &CacheStore,
        run: run::Model,
        integration: &integration::Model,
    ) -> Self {
        Self {
            cache: cache_store.for_run(run.id),
            integration: IntegrationSnapshot::from(integration),
            db,
            queue,
            run,
        }
    }

    fn group_id(&self) -> String {
        self.run.tenant_id.to_string()
    }

    async fn publish_stream(
        &self,
        parent_id: Option<Uuid>,
        identifier: &str,
        data: Option<JsonValue>,
    ) -> Result<(), PipelineError> {
        let streams = StreamRepository::new(self.db.clone());

        let created = match parent_id {
            None => streams.create_root(&self.run, identifier, data).await?,
            Some(parent) => {
                streams
                    .create_child(&self.run, parent, identifier, data)
                    .await?
            }
        };

        // Deduped identifier: no row, no message.
        if let Some(stream) = created {
            self.queue
                .send(
                    QueueName::Streams,
                    &self.group_id(),
                    &PipelineMessage::ProcessStream {
                        stream_id: stream.id,
                    },
                )
                .await?;
        }

        Ok(())
    }

    async fn update_integration_settings(&self, partial: JsonValue) -> Result<(), PipelineError> {
        IntegrationRepository::new(self.db.clone())
            .update_settings(self.integration.id, &partial)
            .await
    }
}

/// Context for `generate_streams`: seeds root streams under the run.
pub struct RunContext {
    inner: ContextInner,
}

impl RunContext {
    pub(crate) fn new(
        db: Arc<DatabaseConnection>,
        queue: Arc<dyn QueueClient>,
        cache_store: &CacheStore,
        run: run::Model,
        integration: &integration::Model,
    ) -> Self {
        Self {
            inner: ContextInner::new(db, queue, cache_store, run, integration),
        }
    }

    pub fn integration(&self) -> &IntegrationSnapshot {
        &self.inner.integration
    }

    pub fn onboarding(&self) -> bool {
        self.inner.run.onboarding
    }

    pub fn cache(&self) -> &RunCache {
        &self.inner.cache
    }

    /// Persists a root stream and enqueues its message.
    pub async fn publish_stream(
        &self,
        identifier: &str,
        data: Option<JsonValue>,
    ) -> Result<(), PipelineError> {
        self.inner.publish_stream(None, identifier, data).await
    }

    pub async fn update_integration_settings(
        &self,
        partial: JsonValue,
    ) -> Result<(), PipelineError> {
        self.inner.update_integration_settings(partial).await
    }
}

/// Context for `process_stream`: the traversal workhorse.
pub struct StreamContext {
    inner: ContextInner,
    stream: stream::Model,
    snapshot: StreamSnapshot,
}

impl StreamContext {
    pub(crate) fn new(
        db: Arc<DatabaseConnection>,
        queue: Arc<dyn QueueClient>,
        cache_store: &CacheStore,
        run: run::Model,
        integration: &integration::Model,
        stream: stream::Model,
    ) -> Self {
        Self {
            inner: ContextInner::new(db, queue, cache_store, run, integration),
            snapshot: StreamSnapshot::from(&stream),
            stream,
        }
    }

    pub fn integration(&self) -> &IntegrationSnapshot {
        &self.inner.integration
    }

    pub fn onboarding(&self) -> bool {
        self.inner.run.onboarding
    }

    pub fn cache(&self) -> &RunCache {
        &self.inner.cache
    }

    pub fn stream(&self) -> &StreamSnapshot {
        &self.snapshot
    }

    /// Persists a child stream under the current one and enqueues it.
    pub async fn publish_stream(
        &self,
        identifier: &str,
        data: Option<JsonValue>,
    ) -> Result<(), PipelineError> {
        self.inner
            .publish_stream(Some(self.stream.id), identifier, data)
            .await
    }

    /// Persists a data record produced by this stream and enqueues it.
    pub async fn publish_data(&self, payload: JsonValue) -> Result<(), PipelineError> {
        let record = DataRepository::new(self.inner.db.clone())
            .create(&self.stream, payload)
            .await?;

        self.inner
            .queue
            .send(
                QueueName::Data,
                &self.inner.group_id(),
                &PipelineMessage::ProcessData { data_id: record.id },
            )
            .await?;

        Ok(())
    }

    pub async fn update_integration_settings(
        &self,
        partial: JsonValue,
    ) -> Result<(), PipelineError> {
        self.inner.update_integration_settings(partial).await
    }
}

/// Context for `process_data`: normalizes one record into the sink.
/// Deliberately has no publish operations.
pub struct DataContext {
    inner: ContextInner,
    payload: JsonValue,
    sink: Arc<dyn Sink>,
}

impl DataContext {
    pub(crate) fn new(
        db: Arc<DatabaseConnection>,
        queue: Arc<dyn QueueClient>,
        cache_store: &CacheStore,
        run: run::Model,
        integration: &integration::Model,
        payload: JsonValue,
        sink: Arc<dyn Sink>,
    ) -> Self {
        Self {
            inner: ContextInner::new(db, queue, cache_store, run, integration),
            payload,
            sink,
        }
    }

    pub fn integration(&self) -> &IntegrationSnapshot {
        &self.inner.integration
    }

    pub fn onboarding(&self) -> bool {
        self.inner.run.onboarding
    }

    pub fn cache(&self) -> &RunCache {
        &self.inner.cache
    }

    /// The opaque payload emitted by the stream handler.
    pub fn data(&self) -> &JsonValue {
        &self.payload
    }

    pub fn tenant_id(&self) -> Uuid {
        self.inner.run.tenant_id
    }

    pub fn sink(&self) -> &dyn Sink {
        self.sink.as_ref()
    }

    pub async fn update_integration_settings(
        &self,
        partial: JsonValue,
    ) -> Result<(), PipelineError> {
        self.inner.update_integration_settings(partial).await
    }
}

// src/context.rs
//! Engine context
//!
//! One [`EngineContext`] owns everything a running engine needs: the
//! configuration snapshot, the active storage adapter, the recording queue,
//! the parameter registry and the rollback engine. Components receive it (or
//! the parts they need) at construction; nothing is reached through statics.
//!
//! # Reload
//!
//! ```text
//! ctx ──reload(new config)──► ctx'
//!  │                           │
//!  └── RecordingQueueManager ──┘  (shared; keeps buffering)
//!          swap_adapter(new) when storage settings changed
//! ```
//!
//! Contexts are immutable. Callers replace their handle with the one
//! returned by [`EngineContext::reload`].

use crate::parameters::{HandlerRegistry, ParseContext};
use crate::query::{group_records, Condition, Flag, LookupResults, QuerySession, Requester};
use crate::record::Record;
use crate::recording::{Recorder, RecordingQueueManager};
use crate::rollback::{ActionTable, RollbackEngine, RollbackSummary, WorldExecutor};
use crate::storage::{self, StorageAdapter};
use crate::utils::config::EngineConfig;
use crate::utils::errors::{ParameterError, Result};
use futures::TryStreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Everything a running engine owns
#[derive(Clone)]
pub struct EngineContext {
    config: Arc<EngineConfig>,
    adapter: Arc<dyn StorageAdapter>,
    queue: Arc<RecordingQueueManager>,
    recorder: Arc<Recorder>,
    registry: Arc<HandlerRegistry>,
    rollback: RollbackEngine,
}

impl EngineContext {
    /// Validate `config`, connect storage and start the recording queue.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn start(config: EngineConfig, executor: Arc<dyn WorldExecutor>) -> Result<Self> {
        config.validate()?;
        let adapter = storage::connect(&config.storage).await?;
        let queue = Arc::new(RecordingQueueManager::start(
            config.recording.clone(),
            Arc::clone(&adapter),
        ));

        info!("Engine started with {} storage", adapter.engine());
        let rollback = RollbackEngine::new(Arc::clone(&adapter), executor);
        Ok(Self::assemble(
            config,
            adapter,
            queue,
            Arc::new(HandlerRegistry::default()),
            rollback,
        ))
    }

    fn assemble(
        config: EngineConfig,
        adapter: Arc<dyn StorageAdapter>,
        queue: Arc<RecordingQueueManager>,
        registry: Arc<HandlerRegistry>,
        rollback: RollbackEngine,
    ) -> Self {
        let recorder = Arc::new(Recorder::new(Arc::clone(&queue), config.events.clone()));
        Self {
            config: Arc::new(config),
            adapter,
            queue,
            recorder,
            registry,
            rollback,
        }
    }

    /// Use a custom parameter registry
    pub fn with_registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    /// Use a custom rollback action table
    pub fn with_actions(mut self, actions: ActionTable) -> Self {
        self.rollback = self.rollback.with_actions(actions);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn adapter(&self) -> Arc<dyn StorageAdapter> {
        Arc::clone(&self.adapter)
    }

    pub fn recorder(&self) -> Arc<Recorder> {
        Arc::clone(&self.recorder)
    }

    pub fn queue(&self) -> Arc<RecordingQueueManager> {
        Arc::clone(&self.queue)
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn rollback_engine(&self) -> &RollbackEngine {
        &self.rollback
    }

    /// Build a new context from `config`, keeping the recording queue.
    ///
    /// Storage is reconnected only when its settings changed; records still
    /// buffered go to the old backend before it is closed. Recording queue
    /// sizes are fixed for the life of the queue.
    pub async fn reload(&self, config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let adapter = if config.storage == self.config.storage {
            Arc::clone(&self.adapter)
        } else {
            let fresh = storage::connect(&config.storage).await?;
            self.queue.flush().await?;
            let previous = self.queue.swap_adapter(Arc::clone(&fresh));
            if let Err(e) = previous.close().await {
                warn!("Closing previous {} storage failed: {}", previous.engine(), e);
            }
            fresh
        };

        if config.recording != self.config.recording {
            warn!("Recording queue settings changed; they apply after a restart");
        }

        info!("Configuration reloaded ({} storage)", adapter.engine());
        let rollback = self.rollback.with_adapter(Arc::clone(&adapter));
        Ok(Self::assemble(
            config,
            adapter,
            Arc::clone(&self.queue),
            Arc::clone(&self.registry),
            rollback,
        ))
    }

    /// Parse requester tokens into a session with configured paging
    pub fn parse<S: AsRef<str>>(&self, tokens: &[S], requester: Requester) -> Result<QuerySession> {
        let ctx = ParseContext::from_config(&self.config.query);
        let mut session = self.registry.build_session(tokens, requester, &ctx)?;
        session.set_page_size(self.config.query.page_size);
        Ok(session)
    }

    /// Run a lookup.
    ///
    /// The result count is capped at the configured maximum. Results are
    /// grouped unless the session carries `NoGroup` or grouping is off by
    /// default.
    pub async fn lookup(&self, mut session: QuerySession) -> Result<LookupResults> {
        let query = &self.config.query;
        let limit = session
            .limit()
            .unwrap_or(query.default_limit)
            .min(query.max_limit);
        session.set_limit(Some(limit));
        session.set_page_size(query.page_size);

        let records: Vec<Record> = self.adapter.query(&session).await?.try_collect().await?;

        let grouped = query.group_by_default && !session.has_flag(Flag::NoGroup);
        Ok(if grouped {
            LookupResults::Grouped(group_records(&records))
        } else {
            LookupResults::Individual(records)
        })
    }

    /// Everything recorded around the requester, ungrouped.
    ///
    /// `radius` defaults to the configured default and is clamped to the
    /// maximum.
    pub async fn near(&self, requester: Requester, radius: Option<u32>) -> Result<LookupResults> {
        let query = &self.config.query;
        let center = requester.location.clone().ok_or_else(|| {
            ParameterError::new("near", "requester has no location")
        })?;
        let radius = radius.unwrap_or(query.default_radius).min(query.max_radius);

        let mut session = QuerySession::new(requester);
        session
            .add_condition(Condition::within(center, f64::from(radius)))
            .add_flag(Flag::NoGroup);
        self.lookup(session).await
    }

    /// Roll back matching records.
    ///
    /// Buffered records are flushed first so recent changes are included.
    pub async fn rollback(
        &self,
        session: QuerySession,
        cancel: &CancellationToken,
    ) -> Result<RollbackSummary> {
        self.queue.flush().await?;
        self.rollback.rollback(session, cancel).await
    }

    pub async fn restore(
        &self,
        session: QuerySession,
        cancel: &CancellationToken,
    ) -> Result<RollbackSummary> {
        self.queue.flush().await?;
        self.rollback.restore(session, cancel).await
    }

    /// Flush and stop recording, then close storage
    pub async fn shutdown(&self) -> Result<()> {
        let report = self.queue.shutdown().await?;
        info!(
            "Recording stopped: {} persisted in final flush, {} dropped",
            report.persisted, report.dropped
        );
        self.queue.adapter().close().await
    }
}

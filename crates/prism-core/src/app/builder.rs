//! PipelineBuilder - パイプラインの構築とワイヤリング
//!
//! # 設計原則
//! - Builder パターンで ports と推論エンジンを受け取る
//! - 起動時検証（Fail-fast 設計）: 足りない port / stage は build() で BuildError
//! - build() は Aggregator → Stage → Dispatcher の順に起動し、
//!   shutdown_and_join() はその逆順（受付側から）に止める

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::app::aggregator::Aggregator;
use crate::app::router::{Dispatcher, DispatcherGroup, RequestRouter, SubmissionAck};
use crate::app::stage::AnalysisStage;
use crate::app::status::{ImageStatus, StatusQuery};
use crate::config::{ConfigError, PipelineConfig};
use crate::domain::{AggregateRecord, BlobMeta, ContentHash, ImageId, PrismError, StageName};
use crate::impls::{InMemoryBlobStore, InMemoryCache, InMemoryRecordStore};
use crate::ports::{
    BlobStore, Clock, IdGenerator, Inference, RecordStore, ResultCache, ResultSink, StageClient,
    SystemClock, UlidGenerator,
};
use crate::worker::WorkerGroup;

/// BuildError はパイプライン構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing stages: {0:?}. These stages were expected but no inference engine was registered.")]
    MissingStages(Vec<StageName>),

    #[error("No inference engine registered; at least one stage is required.")]
    NoStages,

    #[error("Missing port: {0}")]
    MissingPort(&'static str),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// PipelineBuilder はパイプラインを構築
///
/// # 使用例
/// ```ignore
/// let pipeline = PipelineBuilder::in_memory(PipelineConfig::default())
///     .with_inference(StageName::Face, face_engine)
///     .with_inference(StageName::Agender, agender_engine)
///     .expect_stages(&StageName::ALL)
///     .build()?;
/// ```
pub struct PipelineBuilder {
    config: PipelineConfig,
    engines: BTreeMap<StageName, Arc<dyn Inference>>,
    expected_stages: Option<Vec<StageName>>,
    cache: Option<Arc<dyn ResultCache>>,
    blobs: Option<Arc<dyn BlobStore>>,
    records: Option<Arc<dyn RecordStore>>,
    clock: Arc<dyn Clock>,
    ids: Option<Arc<dyn IdGenerator>>,
}

impl PipelineBuilder {
    /// Builder with no storage ports; each must be supplied before `build()`.
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            engines: BTreeMap::new(),
            expected_stages: None,
            cache: None,
            blobs: None,
            records: None,
            clock: Arc::new(SystemClock),
            ids: None,
        }
    }

    /// Builder pre-wired with the in-memory cache and stores.
    pub fn in_memory(config: PipelineConfig) -> Self {
        let ttl = config.cache.ttl();
        Self::new(config)
            .with_cache(Arc::new(InMemoryCache::with_ttl(ttl)))
            .with_blob_store(Arc::new(InMemoryBlobStore::new()))
            .with_record_store(Arc::new(InMemoryRecordStore::new()))
    }

    /// Register the inference engine for `stage`; registering a stage enables it.
    pub fn with_inference(mut self, stage: StageName, engine: Arc<dyn Inference>) -> Self {
        self.engines.insert(stage, engine);
        self
    }

    /// Stages that must have an engine at `build()` time.
    pub fn expect_stages(mut self, stages: &[StageName]) -> Self {
        self.expected_stages = Some(stages.to_vec());
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn ResultCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_blob_store(mut self, blobs: Arc<dyn BlobStore>) -> Self {
        self.blobs = Some(blobs);
        self
    }

    pub fn with_record_store(mut self, records: Arc<dyn RecordStore>) -> Self {
        self.records = Some(records);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Defaults to a ULID generator driven by the builder's clock.
    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Validate and start the pipeline. Must be called inside a tokio runtime.
    ///
    /// # 検証
    /// - config.validate()
    /// - expect_stages() の stage が全て登録されているか
    /// - cache / blob store / record store が揃っているか
    pub fn build(self) -> Result<Pipeline, BuildError> {
        self.config.validate()?;

        if let Some(expected) = &self.expected_stages {
            let missing: Vec<StageName> = expected
                .iter()
                .filter(|s| !self.engines.contains_key(*s))
                .copied()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingStages(missing));
            }
        }
        if self.engines.is_empty() {
            return Err(BuildError::NoStages);
        }
        let cache = self.cache.ok_or(BuildError::MissingPort("cache"))?;
        let blobs = self.blobs.ok_or(BuildError::MissingPort("blob store"))?;
        let records = self.records.ok_or(BuildError::MissingPort("record store"))?;
        let clock = self.clock;
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(Arc::clone(&clock))) as Arc<dyn IdGenerator>);
        let config = self.config;

        // leaves first
        let aggregator = Arc::new(Aggregator::new(
            Arc::clone(&blobs),
            Arc::clone(&records),
            Arc::clone(&cache),
            Arc::clone(&clock),
            &config.aggregator,
            config.retry.clone(),
        ));
        let (sink, aggregator_group) = aggregator.spawn(&config.aggregator);
        let sink: Arc<dyn ResultSink> = Arc::new(sink);

        let stage_names: Vec<StageName> = self.engines.keys().copied().collect();
        let mut clients: Vec<Arc<dyn StageClient>> = Vec::with_capacity(self.engines.len());
        let mut stage_groups = Vec::with_capacity(self.engines.len());
        for (stage, engine) in self.engines {
            let stage_config = config.stage(stage);
            let analysis = Arc::new(AnalysisStage::new(
                stage,
                engine,
                Arc::clone(&cache),
                Arc::clone(&sink),
                stage_config.inference_timeout(),
                config.retry.clone(),
            ));
            let (handle, group) = analysis.spawn(stage_config, config.router.dispatch_timeout());
            clients.push(Arc::new(handle));
            stage_groups.push(group);
        }

        let (tx, rx) = mpsc::channel(config.router.queue_capacity);
        let dispatcher_group = Dispatcher::spawn(clients, sink, &config.router, config.retry.clone(), rx);

        let router = RequestRouter::new(
            tx,
            ids,
            clock,
            stage_names.clone(),
            config.router.max_payload_bytes,
        );
        let status = StatusQuery::new(cache, records, blobs, stage_names.clone());

        info!(stages = ?stage_names, "pipeline started");
        Ok(Pipeline {
            router,
            status,
            dispatcher: dispatcher_group,
            stages: stage_groups,
            aggregator: aggregator_group,
        })
    }
}

/// A running pipeline.
pub struct Pipeline {
    router: RequestRouter,
    status: StatusQuery,
    dispatcher: DispatcherGroup,
    stages: Vec<WorkerGroup>,
    aggregator: WorkerGroup,
}

impl Pipeline {
    pub fn router(&self) -> &RequestRouter {
        &self.router
    }

    pub fn status_query(&self) -> &StatusQuery {
        &self.status
    }

    pub fn submit(&self, bytes: impl Into<Arc<[u8]>>) -> Result<SubmissionAck, PrismError> {
        self.router.submit(bytes)
    }

    pub fn submit_as(&self, image_id: ImageId, bytes: impl Into<Arc<[u8]>>) -> Result<SubmissionAck, PrismError> {
        self.router.submit_as(image_id, bytes)
    }

    pub async fn status(&self, image_id: ImageId) -> Result<ImageStatus, PrismError> {
        self.status.status(image_id).await
    }

    pub async fn record(&self, image_id: ImageId) -> Result<Option<AggregateRecord>, PrismError> {
        self.status.record(image_id).await
    }

    pub async fn blob(&self, content_hash: &ContentHash) -> Result<Option<BlobMeta>, PrismError> {
        self.status.blob(content_hash).await
    }

    pub async fn images_sharing(&self, content_hash: &ContentHash) -> Result<Vec<ImageId>, PrismError> {
        self.status.images_sharing(content_hash).await
    }

    /// Stop admission, drain every queue in flow order, and wait for all workers.
    pub async fn shutdown_and_join(self) {
        self.dispatcher.shutdown_and_join().await;
        for group in self.stages {
            debug!(stage = group.name(), "stopping stage workers");
            group.shutdown_and_join().await;
        }
        self.aggregator.shutdown_and_join().await;
        info!("pipeline stopped");
    }
}

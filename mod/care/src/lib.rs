pub mod age;
pub mod api;
pub mod engine;
pub mod ledger;
pub mod materialize;
pub mod model;
pub mod notify;
pub mod overlay;
pub mod registry;
pub mod schedule;
pub mod worker;

use std::sync::Arc;

use axum::Router;

use openfarm_core::Module;
use openfarm_kv::KVStore;

use engine::CareEngine;
use ledger::{CompletionStore, LocalLedger};
use materialize::Materializer;
use notify::SurfaceNotifier;
use overlay::OverlayCache;
use registry::KvBatchRegistry;
use schedule::ScheduleTemplate;
use worker::ReconcilerConfig;

/// The Care module — recurring per-batch husbandry tasks.
///
/// Embed this in a service to get day-of-age task materialization,
/// idempotent completion, the durable optimistic overlay, and
/// cross-surface completion notifications.
pub struct CareModule {
    engine: Arc<CareEngine>,
    template: Arc<ScheduleTemplate>,
    registry: Arc<KvBatchRegistry>,
    _worker_cancel: tokio_util::sync::CancellationToken,
}

impl CareModule {
    /// Create the care module and start the background reconciler.
    pub fn new(
        kv: Arc<dyn KVStore>,
        template: Arc<ScheduleTemplate>,
    ) -> Result<Self, openfarm_core::ServiceError> {
        Self::with_config(kv, template, ReconcilerConfig::default())
    }

    /// Create with explicit reconciler configuration.
    pub fn with_config(
        kv: Arc<dyn KVStore>,
        template: Arc<ScheduleTemplate>,
        reconciler: ReconcilerConfig,
    ) -> Result<Self, openfarm_core::ServiceError> {
        let registry = Arc::new(KvBatchRegistry::new(Arc::clone(&kv)));
        let ledger = Arc::new(LocalLedger::new(
            Materializer::new(Arc::clone(&template)),
            Arc::clone(&registry) as Arc<dyn registry::BatchRegistry>,
            CompletionStore::new(Arc::clone(&kv)),
        ));
        let engine = Arc::new(CareEngine::new(
            ledger,
            OverlayCache::new(Arc::clone(&kv))?,
            Arc::new(SurfaceNotifier::new()),
            Arc::clone(&registry) as Arc<dyn registry::BatchRegistry>,
        ));
        let cancel = worker::start(Arc::clone(&engine), reconciler);

        Ok(Self {
            engine,
            template,
            registry,
            _worker_cancel: cancel,
        })
    }

    /// The engine, for programmatic use and tests.
    pub fn engine(&self) -> &Arc<CareEngine> {
        &self.engine
    }

    /// The batch registry, for enrolling batches programmatically.
    pub fn registry(&self) -> &Arc<KvBatchRegistry> {
        &self.registry
    }
}

impl Module for CareModule {
    fn name(&self) -> &str {
        "care"
    }

    fn routes(&self) -> Router {
        api::router(
            Arc::clone(&self.engine),
            Arc::clone(&self.registry),
            Arc::clone(&self.template),
        )
    }
}

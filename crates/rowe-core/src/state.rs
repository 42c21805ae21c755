//! Shared application state.
//!
//! Everything is wired once at startup — stores over one database handle,
//! the executor registry, and the scheduler — then shared immutably by the
//! HTTP handlers and the scheduler loop.

use std::sync::Arc;

use crate::bvbrc::{AppSchemaCache, BvbrcClient};
use crate::config::RoweConfig;
use crate::db::Database;
use crate::engine::{RunnerConfig, RuntimeKind, ToolRunner};
use crate::error::ServerError;
use crate::executors::bvbrc::RemoteServiceExecutor;
use crate::executors::local::InProcessExecutor;
use crate::executors::worker::WorkerExecutor;
use crate::executors::ExecutorRegistry;
use crate::models::ExecutorType;
use crate::scheduler::Scheduler;
use crate::stager::{SchemeStager, StagingCredentials};
use crate::store::{
    AppSchemaStore, SubmissionStore, TaskStore, WorkerStore, WorkflowStore,
};

pub struct AppStateInner {
    pub config: RoweConfig,
    pub db: Database,
    pub workflow_store: WorkflowStore,
    pub submission_store: SubmissionStore,
    pub task_store: TaskStore,
    pub worker_store: WorkerStore,
    pub app_schema_store: AppSchemaStore,
    pub registry: Arc<ExecutorRegistry>,
    pub scheduler: Arc<Scheduler>,
    /// Present when a remote service endpoint is configured.
    pub bvbrc: Option<Arc<BvbrcClient>>,
    pub app_schemas: Option<Arc<AppSchemaCache>>,
}

pub type AppState = Arc<AppStateInner>;

impl AppStateInner {
    pub fn new(config: RoweConfig, db: Database) -> Result<Self, ServerError> {
        let workflow_store = WorkflowStore::new(db.clone());
        let submission_store = SubmissionStore::new(db.clone());
        let task_store = TaskStore::new(db.clone());
        let worker_store = WorkerStore::new(db.clone());
        let app_schema_store = AppSchemaStore::new(db.clone());

        let bvbrc = if config.bvbrc.endpoint.is_empty() {
            None
        } else {
            Some(Arc::new(BvbrcClient::new(
                config.bvbrc.endpoint.clone(),
                config.bvbrc.token.clone(),
            )))
        };
        let app_schemas = bvbrc.as_ref().map(|client| {
            Arc::new(AppSchemaCache::new(
                client.clone(),
                app_schema_store.clone(),
                config.bvbrc.schema_ttl_secs.max(60),
            ))
        });

        let stager = Arc::new(SchemeStager::new(
            StagingCredentials::default(),
            bvbrc.clone(),
        ));
        let runner = Arc::new(ToolRunner::new(
            stager,
            RunnerConfig {
                work_base: config.work_dir.clone().into(),
                container_binary: config.container.binary.clone(),
                gpus: config.container.gpus,
                ..Default::default()
            },
        ));

        let stage_out_base = if config.stage_out_base.is_empty() {
            None
        } else {
            Some(config.stage_out_base.clone())
        };
        let mut registry = ExecutorRegistry::new();
        registry.register(
            ExecutorType::Local,
            Arc::new(InProcessExecutor::new(
                runner.clone(),
                RuntimeKind::Local,
                config.executor_slots,
                stage_out_base.clone(),
            )),
        );
        registry.register(
            ExecutorType::Container,
            Arc::new(InProcessExecutor::new(
                runner,
                RuntimeKind::Container,
                config.executor_slots,
                stage_out_base,
            )),
        );
        registry.register(
            ExecutorType::Worker,
            Arc::new(WorkerExecutor::new(task_store.clone())),
        );
        if let (Some(client), Some(schemas)) = (&bvbrc, &app_schemas) {
            registry.register(
                ExecutorType::RemoteService,
                Arc::new(RemoteServiceExecutor::new(
                    client.clone(),
                    schemas.clone(),
                    config.bvbrc.workspace_path.clone(),
                )),
            );
        }
        let registry = Arc::new(registry);

        let scheduler = Arc::new(Scheduler::new(
            workflow_store.clone(),
            submission_store.clone(),
            task_store.clone(),
            worker_store.clone(),
            registry.clone(),
            config.clone(),
        ));

        Ok(Self {
            config,
            db,
            workflow_store,
            submission_store,
            task_store,
            worker_store,
            app_schema_store,
            registry,
            scheduler,
            bvbrc,
            app_schemas,
        })
    }
}

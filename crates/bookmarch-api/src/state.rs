//! Application state wiring all engine components together.
//!
//! `AppState` pins the generic engine to the concrete SQLite
//! implementations and is shared by every request handler. `init` connects
//! the database, loads configuration, registers the built-in stage
//! handlers, and constructs (but does not start) the runtime -- `main`
//! starts it after the state is built.

use std::sync::Arc;

use bookmarch_core::event::TaskEventBus;
use bookmarch_core::health::HealthSnapshot;
use bookmarch_core::orchestrator::Orchestrator;
use bookmarch_core::runtime::EngineRuntime;
use bookmarch_core::stage::registry::StageRegistry;
use bookmarch_infra::config::{load_engine_config, resolve_data_dir};
use bookmarch_infra::sqlite::capability::SqliteCapabilityRepository;
use bookmarch_infra::sqlite::pool::DatabasePool;
use bookmarch_infra::sqlite::queue::SqliteJobQueue;
use bookmarch_infra::sqlite::task::SqliteTaskRepository;
use tokio::sync::watch;

use crate::stages::register_builtin_stages;

/// Concrete type aliases pinning the engine generics to the SQLite
/// implementations.
pub type ConcreteOrchestrator = Orchestrator<SqliteTaskRepository, SqliteJobQueue>;
pub type ConcreteRuntime =
    EngineRuntime<SqliteTaskRepository, SqliteCapabilityRepository, SqliteJobQueue>;

/// Shared application state used by all HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<ConcreteOrchestrator>,
    pub runtime: Arc<ConcreteRuntime>,
    pub capabilities: Arc<SqliteCapabilityRepository>,
    pub events: TaskEventBus,
    pub health: watch::Receiver<Option<HealthSnapshot>>,
    pub db_pool: DatabasePool,
}

impl AppState {
    /// Initialize the application state: connect to the database, load
    /// configuration, register stages, wire the engine.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir();
        tokio::fs::create_dir_all(&data_dir).await?;

        let config = load_engine_config(&data_dir).await;

        let db_url = format!(
            "sqlite://{}?mode=rwc",
            data_dir.join("bookmarch.db").display()
        );
        let db_pool = DatabasePool::new(&db_url).await?;

        let repository = Arc::new(SqliteTaskRepository::new(db_pool.clone()));
        let queue = Arc::new(SqliteJobQueue::new(db_pool.clone()));
        let capabilities = Arc::new(SqliteCapabilityRepository::new(db_pool.clone()));

        let registry = Arc::new(StageRegistry::new());
        register_builtin_stages(&registry, &config);

        let events = TaskEventBus::new(1024);
        let orchestrator = Arc::new(Orchestrator::new(
            repository,
            queue,
            registry,
            events.clone(),
        ));

        let runtime = Arc::new(EngineRuntime::new(
            config,
            Arc::clone(&orchestrator),
            Arc::clone(&capabilities),
        ));
        let health = runtime.health();

        Ok(Self {
            orchestrator,
            runtime,
            capabilities,
            events,
            health,
            db_pool,
        })
    }
}

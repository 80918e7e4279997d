//! Service container for dependency injection.
//!
//! The ServiceContainer builds every daemon service from a [`DaemonConfig`]
//! and owns their lifecycle.

use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::Result;
use crate::api::{ActiveTransfers, SessionApi, SessionDefaults};
use crate::catalog::ItemManager;
use crate::config::DaemonConfig;
use crate::database::repositories::{ItemRepository, SqlxItemRepository};
use crate::database::{DbPool, init_pool, run_migrations};
use crate::extension::ExtensionRegistry;
use crate::pipeline::{DualStreamCoordinator, FfmpegCompiler, MediaCompiler};
use crate::server::{self, ConnectionPool, HandlerRegistry, WsState};
use crate::transfer::{HttpEngine, HttpEngineConfig, TransferEngine, TransferOptions};
use crate::utils::http_client::build_client;

/// Service container holding all daemon services.
pub struct ServiceContainer {
    /// Database connection pool, absent when the catalog was injected.
    pub db: Option<DbPool>,
    /// Subscriber sets of all downloads.
    pub pool: Arc<ConnectionPool>,
    pub manager: Arc<ItemManager>,
    pub active: Arc<ActiveTransfers>,
    pub api: Arc<SessionApi>,
    pub registry: Arc<HandlerRegistry>,
    subscriber_buffer: usize,
    /// Cancellation token for graceful shutdown.
    cancellation_token: CancellationToken,
}

impl ServiceContainer {
    /// Open the database and wire the HTTP engine and ffmpeg compiler.
    pub async fn new(config: &DaemonConfig) -> Result<Self> {
        info!("Initializing service container");

        let db = init_pool(&config.database_url).await?;
        run_migrations(&db).await?;
        let repo: Arc<dyn ItemRepository> = Arc::new(SqlxItemRepository::new(db.clone()));

        let client = build_client(&config.user_agent)?;
        let engine: Arc<dyn TransferEngine> =
            Arc::new(HttpEngine::new(client, HttpEngineConfig::default()));
        let compiler: Arc<dyn MediaCompiler> =
            Arc::new(FfmpegCompiler::new(config.ffmpeg_path.clone()));

        let mut container = Self::from_parts(config, repo, engine, compiler).await?;
        container.db = Some(db);
        Ok(container)
    }

    /// Wire the services around the given repository, engine and compiler.
    pub async fn from_parts(
        config: &DaemonConfig,
        repo: Arc<dyn ItemRepository>,
        engine: Arc<dyn TransferEngine>,
        compiler: Arc<dyn MediaCompiler>,
    ) -> Result<Self> {
        let pool = Arc::new(ConnectionPool::new());
        let manager = Arc::new(ItemManager::load(repo).await?);
        let active = Arc::new(ActiveTransfers::new());
        let extensions = Arc::new(ExtensionRegistry::new());

        let coordinator = DualStreamCoordinator::new(
            Arc::clone(&pool),
            Arc::clone(&manager),
            Arc::clone(&engine),
            Arc::clone(&active),
            compiler,
        );
        let defaults = SessionDefaults {
            download_dir: config.download_dir.clone(),
            options: TransferOptions {
                max_connections: config.max_connections,
                max_parts: config.max_parts,
                force_parts: false,
            },
        };
        let api = Arc::new(SessionApi::new(
            Arc::clone(&pool),
            Arc::clone(&manager),
            engine,
            Arc::clone(&active),
            coordinator,
            extensions,
            defaults,
        ));

        let mut registry = HandlerRegistry::new();
        api.register_handlers(&mut registry)?;
        info!(commands = registry.methods().len(), "Command handlers registered");

        Ok(Self {
            db: None,
            pool,
            manager,
            active,
            api,
            registry: Arc::new(registry),
            subscriber_buffer: config.subscriber_buffer,
            cancellation_token: CancellationToken::new(),
        })
    }

    pub fn router(&self) -> Router {
        server::build_router(WsState {
            registry: Arc::clone(&self.registry),
            pool: Arc::clone(&self.pool),
            subscriber_buffer: self.subscriber_buffer,
        })
    }

    /// Get the cancellation token for graceful shutdown.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Serve on `listener` until [`shutdown`](Self::shutdown) is called.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        server::serve(listener, self.router(), self.cancellation_token.clone()).await
    }

    /// Stop the server, halt running transfers and persist the catalog.
    pub async fn shutdown(&self) -> Result<()> {
        info!(active = self.active.len(), "Shutting down services");
        self.cancellation_token.cancel();
        self.active.stop_all();
        self.manager.close().await?;
        if let Some(db) = &self.db {
            db.close().await;
        }
        if !self.active.is_empty() {
            warn!(
                active = self.active.len(),
                "Transfers still winding down at shutdown"
            );
        }
        Ok(())
    }
}

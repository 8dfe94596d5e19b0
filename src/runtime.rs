//! `Runtime` — the single owner of shared state, replacing the
//! process-wide connection-pool singleton and module-level statics that
//! spec.md §9's "No global singletons" note flags. One `Runtime` is built
//! once by `rowsyncd` and passed by reference into the scheduler, the
//! state machine, and the detector.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, watch};

use crate::catalog::{CatalogStore, DbEngine};
use crate::error::RowSyncError;
use crate::source::SourceAdapter;
use crate::source::mariadb::MariaDbAdapter;
use crate::source::mongodb::MongoAdapter;
use crate::source::mssql::MssqlAdapter;
use crate::source::postgres::PostgresAdapter;
use crate::target::TargetWriter;

pub struct Runtime {
    pub catalog: CatalogStore,
    pub target: TargetWriter,
    adapters: Mutex<HashMap<String, Arc<dyn SourceAdapter>>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Runtime {
    pub fn new(catalog: CatalogStore, target: TargetWriter) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            catalog,
            target,
            adapters: Mutex::new(HashMap::new()),
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Fetch (connecting and caching on first use) the source adapter for
    /// a given engine + connection string. Adapters are cached by
    /// connection string since a cluster may host many tables behind one
    /// connection.
    pub async fn adapter_for(
        &self,
        engine: DbEngine,
        connection_string: &str,
    ) -> Result<Arc<dyn SourceAdapter>, RowSyncError> {
        let mut adapters = self.adapters.lock().await;
        if let Some(existing) = adapters.get(connection_string) {
            return Ok(existing.clone());
        }

        let adapter: Arc<dyn SourceAdapter> = match engine {
            DbEngine::MariaDb => Arc::new(MariaDbAdapter::connect(connection_string).await?),
            DbEngine::PostgreSql => Arc::new(PostgresAdapter::connect(connection_string).await?),
            DbEngine::Mssql => Arc::new(MssqlAdapter::new(connection_string)),
            DbEngine::MongoDb => Arc::new(MongoAdapter::connect(connection_string).await?),
        };

        adapters.insert(connection_string.to_string(), adapter.clone());
        Ok(adapter)
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_rx.borrow()
    }
}

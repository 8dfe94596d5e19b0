//! Replication Scheduler (C6) — one worker loop per source engine, plus a
//! periodic maintenance pass (spec.md §4.6).

use std::sync::Arc;
use std::time::Duration;

use crate::catalog::{CatalogEntry, DbEngine, ReplicationConfig, TableStatus};
use crate::runtime::Runtime;
use crate::statemachine;

const ALL_ENGINES: [DbEngine; 4] = [
    DbEngine::MariaDb,
    DbEngine::Mssql,
    DbEngine::PostgreSql,
    DbEngine::MongoDb,
];

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(120);
const FALLBACK_SLEEP: Duration = Duration::from_secs(10);

/// Start one worker loop per engine and the maintenance pass, and drive
/// them until [`Runtime::trigger_shutdown`] is called. Cross-engine
/// parallelism is the `tokio::spawn` fan-out here; within one engine,
/// `engine_worker_loop` processes tables serially (spec.md §5).
pub async fn run(runtime: Arc<Runtime>) {
    let mut handles = Vec::with_capacity(ALL_ENGINES.len() + 1);
    for engine in ALL_ENGINES {
        let rt = runtime.clone();
        handles.push(tokio::spawn(engine_worker_loop(rt, engine)));
    }
    handles.push(tokio::spawn(maintenance_loop(runtime.clone())));

    for handle in handles {
        let _ = handle.await;
    }
}

async fn engine_worker_loop(runtime: Arc<Runtime>, engine: DbEngine) {
    let mut shutdown = runtime.shutdown_signal();

    while !runtime.is_shutting_down() {
        let config = match runtime.catalog.load_config().await {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(engine = engine.as_str(), error = %e, "catalog unreachable, retrying");
                sleep_or_shutdown(&mut shutdown, FALLBACK_SLEEP).await;
                continue;
            }
        };

        let mut entries = match runtime.catalog.list_active(engine).await {
            Ok(e) => e,
            Err(e) => {
                tracing::error!(engine = engine.as_str(), error = %e, "catalog unreachable, retrying");
                sleep_or_shutdown(&mut shutdown, FALLBACK_SLEEP).await;
                continue;
            }
        };
        sort_by_priority(&mut entries);

        for entry in &entries {
            if runtime.is_shutting_down() {
                break;
            }
            process_one_table(&runtime, entry, &config).await;
        }

        sleep_or_shutdown(&mut shutdown, Duration::from_secs(config.sync_interval_secs)).await;
    }
}

async fn process_one_table(runtime: &Runtime, entry: &CatalogEntry, config: &ReplicationConfig) {
    let schema = entry.schema_name.as_str();
    let table = entry.table_name.as_str();

    let adapter = match runtime.adapter_for(entry.db_engine, &entry.connection_string).await {
        Ok(a) => a,
        Err(e) => {
            tracing::error!(schema, table, component = "scheduler", error = %e, "could not connect source adapter");
            let _ = runtime.catalog.update_status(schema, table, TableStatus::Error, None).await;
            return;
        }
    };

    if let Err(e) = statemachine::tick(&runtime.catalog, adapter.as_ref(), &runtime.target, entry, config).await {
        tracing::error!(schema, table, component = "scheduler", error = %e, kind = %e.kind(), "table cycle failed");
        if e.moves_table_to_error() {
            let _ = runtime
                .catalog
                .update_status(schema, table, TableStatus::Error, None)
                .await;
        }
    }
}

/// Stable sort by status priority, tied by `(schema_name, table_name)`
/// (supplemented from `original_source/`'s sort comparator — see
/// DESIGN.md).
fn sort_by_priority(entries: &mut [CatalogEntry]) {
    entries.sort_by(|a, b| {
        a.status
            .priority()
            .cmp(&b.status.priority())
            .then_with(|| a.schema_name.cmp(&b.schema_name))
            .then_with(|| a.table_name.cmp(&b.table_name))
    });
}

async fn maintenance_loop(runtime: Arc<Runtime>) {
    let mut shutdown = runtime.shutdown_signal();

    while !runtime.is_shutting_down() {
        sleep_or_shutdown(&mut shutdown, MAINTENANCE_INTERVAL).await;
        if runtime.is_shutting_down() {
            break;
        }

        match runtime.catalog.vacuum_deactivated().await {
            Ok(n) if n > 0 => tracing::info!(component = "maintenance", rows = n, "vacuumed deactivated catalog rows"),
            Ok(_) => {}
            Err(e) => tracing::error!(component = "maintenance", error = %e, "vacuum failed"),
        }
        // Catalog Discovery re-invocation is an out-of-scope collaborator
        // (spec.md §1); this pass only re-reads config and vacuums, per
        // spec.md §4.6.
    }
}

async fn sleep_or_shutdown(shutdown: &mut tokio::sync::watch::Receiver<bool>, duration: Duration) {
    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = shutdown.changed() => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::PkStrategy;

    fn entry(schema: &str, table: &str, status: TableStatus) -> CatalogEntry {
        CatalogEntry {
            schema_name: schema.into(),
            table_name: table.into(),
            cluster_name: "primary".into(),
            db_engine: DbEngine::MariaDb,
            connection_string: String::new(),
            active: true,
            status,
            pk_strategy: PkStrategy::Pk,
            pk_columns: vec!["id".into()],
            candidate_columns: vec![],
            last_processed_pk_raw: String::new(),
            last_offset: 0,
            last_sync_column: None,
            last_sync_time: None,
        }
    }

    #[test]
    fn priority_order_places_full_load_first_and_breaks_ties_by_identity() {
        let mut entries = vec![
            entry("b", "t1", TableStatus::ListeningChanges),
            entry("a", "t2", TableStatus::FullLoad),
            entry("a", "t1", TableStatus::FullLoad),
            entry("a", "t3", TableStatus::Reset),
        ];
        sort_by_priority(&mut entries);
        let order: Vec<(&str, &str)> = entries
            .iter()
            .map(|e| (e.schema_name.as_str(), e.table_name.as_str()))
            .collect();
        assert_eq!(
            order,
            vec![("a", "t1"), ("a", "t2"), ("a", "t3"), ("b", "t1")]
        );
    }
}

use aos_kernel::sync::{LastWriteWins, SyncEngine, SyncTable};
use rusqlite::params;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS inventory (
    id TEXT PRIMARY KEY,
    item TEXT NOT NULL,
    quantity INTEGER NOT NULL,
    updated_at REAL NOT NULL
);";

async fn open_node(dir: &tempfile::TempDir, node_id: &str) -> SyncEngine {
    let engine = SyncEngine::open(
        &dir.path().join(format!("{}.db", node_id)),
        node_id,
        vec![SyncTable::new("inventory", "inventory_item")],
        Box::new(LastWriteWins),
    )
    .unwrap();
    engine
        .with_connection(|conn| conn.execute_batch(SCHEMA))
        .await
        .unwrap();
    engine
}

async fn set_quantity(engine: &SyncEngine, quantity: i64, updated_at: f64) {
    engine
        .with_connection(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO inventory (id, item, quantity, updated_at)
                 VALUES ('bag-1', 'fertiliser', ?1, ?2)",
                params![quantity, updated_at],
            )
        })
        .await
        .unwrap();
}

async fn quantity(engine: &SyncEngine) -> i64 {
    engine
        .with_connection(|conn| {
            conn.query_row("SELECT quantity FROM inventory WHERE id = 'bag-1'", [], |row| {
                row.get(0)
            })
        })
        .await
        .unwrap()
}

/// Pull `from`'s changes into `to` through the request/response exchange.
async fn pull(to: &SyncEngine, from: &SyncEngine) {
    let request = to.build_sync_request(from.node_id()).await.unwrap();
    let response = from.handle_sync_request(&request).await.unwrap();
    to.apply_sync_response(&response).await.unwrap();
}

#[tokio::test]
async fn later_offline_write_wins_on_both_nodes() {
    let dir = tempfile::tempdir().unwrap();
    let a = open_node(&dir, "node-a").await;
    let b = open_node(&dir, "node-b").await;

    set_quantity(&a, 10, 100.0).await;
    set_quantity(&b, 15, 105.0).await;

    pull(&b, &a).await;
    pull(&a, &b).await;

    assert_eq!(quantity(&a).await, 15);
    assert_eq!(quantity(&b).await, 15);
    assert!(b.get_conflicts().await.unwrap().is_empty());
}

#[tokio::test]
async fn clocks_advance_past_each_other_after_exchange() {
    let dir = tempfile::tempdir().unwrap();
    let a = open_node(&dir, "node-a").await;
    let b = open_node(&dir, "node-b").await;

    set_quantity(&a, 3, 10.0).await;
    pull(&b, &a).await;

    let a_clock = a.clock().await;
    let b_clock = b.clock().await;
    assert_eq!(a_clock.get("node-a"), 1);
    assert!(b_clock.get("node-a") >= 1);
    assert!(!b_clock.happens_before(&a_clock));

    let state = b.get_sync_state("node-a").await.unwrap().unwrap();
    assert_eq!(state.sync_status, "synced");
}
